use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::error::{ExecboxError, Result};
use crate::runtime::{ByteStream, ContainerRuntime};

const READ_CHUNK: usize = 8 * 1024;

pub(crate) type ChunkSender = mpsc::Sender<Result<Bytes>>;

/// Which of the two retrieval protocols to run.
#[derive(Debug, Clone)]
pub(crate) enum Retrieval {
    /// Relay the combined log stream while the unit runs
    Logs,
    /// Wait for exit, then relay `path` out of the unit's filesystem
    File { path: String },
}

impl Retrieval {
    pub(crate) async fn relay(
        &self,
        runtime: &dyn ContainerRuntime,
        unit: &str,
        tx: &ChunkSender,
    ) -> Result<()> {
        match self {
            Retrieval::Logs => relay_logs(runtime.logs(unit), tx).await,
            Retrieval::File { path } => {
                let exit_code = runtime.wait(unit).await?;
                info!(unit = %unit, exit_code = exit_code, "Unit exited");
                relay_archive_entry(runtime.download(unit, path), tx).await
            }
        }
    }
}

/// Forward log chunks as they arrive.
pub(crate) async fn relay_logs(mut logs: ByteStream, tx: &ChunkSender) -> Result<()> {
    let mut forwarded = 0usize;
    while let Some(chunk) = logs.next().await {
        let chunk = chunk?;
        forwarded += chunk.len();
        if tx.send(Ok(chunk)).await.is_err() {
            debug!("Receiver dropped, stopping log relay");
            return Ok(());
        }
    }
    debug!(bytes = forwarded, "Log stream ended");
    Ok(())
}

/// Decode a single-file tar stream and forward the file's bytes as they
/// are decoded.
pub(crate) async fn relay_archive_entry(archive: ByteStream, tx: &ChunkSender) -> Result<()> {
    let reader = StreamReader::new(
        archive.map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))),
    );
    let mut archive = tokio_tar::Archive::new(reader);
    let mut entries = Box::pin(archive.entries().map_err(archive_error)?);

    while let Some(entry) = entries.next().await {
        let entry = entry.map_err(archive_error)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry
            .path()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let mut entry = Box::pin(entry);
        let mut forwarded = 0usize;

        loop {
            let mut buf = BytesMut::zeroed(READ_CHUNK);
            let n = entry.read(&mut buf).await.map_err(archive_error)?;
            if n == 0 {
                break;
            }
            buf.truncate(n);
            forwarded += n;
            if tx.send(Ok(buf.freeze())).await.is_err() {
                debug!("Receiver dropped, stopping archive relay");
                return Ok(());
            }
        }

        debug!(entry = %name, bytes = forwarded, "Archive entry relayed");
        return Ok(());
    }

    Err(ExecboxError::Retrieval(
        "archive contained no file entry".to_string(),
    ))
}

fn archive_error(err: io::Error) -> ExecboxError {
    // Transport errors travel through the reader wrapped in io::Error
    match err.into_inner() {
        Some(inner) => match inner.downcast::<ExecboxError>() {
            Ok(original) => *original,
            Err(other) => ExecboxError::Retrieval(format!("failed to read archive: {}", other)),
        },
        None => ExecboxError::Retrieval("failed to read archive".to_string()),
    }
}
