use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::Result;

/// Output relayed from an execution unit.
///
/// Chunks arrive as the unit produces them. A stream that ends with an
/// `Err` item was cut short; the error says why.
pub struct OutputStream {
    first: Option<Bytes>,
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl OutputStream {
    pub(crate) fn new(rx: mpsc::Receiver<Result<Bytes>>) -> Self {
        Self { first: None, rx }
    }

    /// Put back a chunk that was read ahead.
    pub(crate) fn with_first(rx: mpsc::Receiver<Result<Bytes>>, first: Bytes) -> Self {
        Self {
            first: Some(first),
            rx,
        }
    }

    /// Drain the stream into one buffer, failing if it was cut short.
    pub async fn collect_bytes(mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for OutputStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(first) = this.first.take() {
            return Poll::Ready(Some(Ok(first)));
        }
        this.rx.poll_recv(cx)
    }
}

/// Exactly one of these is produced per request.
pub enum ExecutionResult {
    /// Combined stdout/stderr, streamed while the unit runs
    Logs { stream: OutputStream },
    /// Bytes of the artifact the code wrote
    File {
        stream: OutputStream,
        mime_type: &'static str,
    },
}

impl ExecutionResult {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExecutionResult::Logs { .. } => "text/plain",
            ExecutionResult::File { mime_type, .. } => mime_type,
        }
    }

    pub fn into_stream(self) -> OutputStream {
        match self {
            ExecutionResult::Logs { stream } | ExecutionResult::File { stream, .. } => stream,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ExecutionResult::File { .. })
    }
}

impl std::fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionResult::Logs { .. } => f.write_str("Logs"),
            ExecutionResult::File { mime_type, .. } => {
                f.debug_struct("File").field("mime_type", mime_type).finish()
            }
        }
    }
}
