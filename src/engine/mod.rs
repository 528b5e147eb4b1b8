//! The execution flow: resolve, stage, launch, relay, clean up.

mod cleanup;
mod controller;
pub mod output;
pub mod request;
mod retrieval;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::types::{ExecboxConfig, MountStrategy};
use crate::error::{ExecboxError, Result};
use crate::registry::{mime_type, LanguageProfile, LanguageRegistry};
use crate::runtime::ContainerRuntime;
use crate::workspace::{Workspace, WorkspaceManager};

use cleanup::{Cleanup, CleanupGuard};
use controller::EnvironmentController;
use retrieval::{ChunkSender, Retrieval};

pub use output::{ExecutionResult, OutputStream};
pub use request::{ExecutionRequest, InputFile, OutputSpec};

/// Runs submitted code in ephemeral units.
///
/// Executions of the same language are queued on a per-language slot, since
/// they share one deterministic unit name. Different languages run
/// concurrently.
pub struct Engine {
    runtime: Arc<dyn ContainerRuntime>,
    registry: LanguageRegistry,
    workspaces: Arc<WorkspaceManager>,
    controller: Arc<EnvironmentController>,
    slots: HashMap<String, Arc<Mutex<()>>>,
    container_root: String,
    default_strategy: MountStrategy,
    timeout: Option<Duration>,
    channel_capacity: usize,
}

impl Engine {
    pub fn new(config: &ExecboxConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let engine_config = &config.engine;
        let registry = LanguageRegistry::from_config(&config.languages)?;

        let container_root = engine_config.container_root.trim_end_matches('/').to_string();
        if !container_root.starts_with('/') {
            return Err(ExecboxError::Config(format!(
                "container_root must be an absolute path, got {:?}",
                engine_config.container_root
            )));
        }

        let workspaces = Arc::new(WorkspaceManager::new(
            engine_config.staging_root(),
            container_root.clone(),
            engine_config.volume_prefix.clone(),
            runtime.clone(),
        ));
        let controller = Arc::new(EnvironmentController::new(
            runtime.clone(),
            engine_config.unit_prefix.clone(),
            container_root.clone(),
        ));
        let slots = registry
            .ids()
            .map(|id| (id.to_string(), Arc::new(Mutex::new(()))))
            .collect();

        info!(
            runtime = runtime.name(),
            staging_root = %workspaces.staging_root().display(),
            languages = ?registry.ids().collect::<Vec<_>>(),
            "Execution engine ready"
        );

        Ok(Self {
            runtime,
            registry,
            workspaces,
            controller,
            slots,
            container_root,
            default_strategy: engine_config.mount_strategy,
            timeout: engine_config.timeout(),
            channel_capacity: engine_config.channel_capacity.max(1),
        })
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Execute with the configured mount strategy.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.execute_with(request, self.default_strategy).await
    }

    /// Execute one request.
    ///
    /// For log output the returned stream is live: chunks arrive while the
    /// unit runs. For file output the unit has exited and the archive
    /// transfer has begun; a file that was never produced fails here rather
    /// than in the stream. Cleanup runs once the stream is exhausted or
    /// dropped.
    pub async fn execute_with(
        &self,
        request: ExecutionRequest,
        strategy: MountStrategy,
    ) -> Result<ExecutionResult> {
        // Bad requests are rejected before anything is allocated
        let profile = self.registry.resolve(&request.language)?.clone();
        request.output.validate()?;
        if let Some(input) = &request.input_file {
            input.sanitized_name()?;
        }
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);

        let prepare = self.prepare(&request, &profile, strategy);
        let (unit, guard) = match deadline {
            Some(deadline) => timeout_at(deadline, prepare)
                .await
                .map_err(|_| self.timeout_error())??,
            None => prepare.await?,
        };

        let retrieval = match &request.output {
            OutputSpec::Void => Retrieval::Logs,
            OutputSpec::File(_) => Retrieval::File {
                path: format!(
                    "{}/{}",
                    self.container_root,
                    request.output.file_name().unwrap_or_default()
                ),
            },
        };

        let (tx, mut rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(pump(
            self.runtime.clone(),
            unit,
            retrieval,
            guard,
            tx,
            deadline,
            self.timeout_seconds(),
        ));

        match request.output {
            OutputSpec::Void => Ok(ExecutionResult::Logs {
                stream: OutputStream::new(rx),
            }),
            OutputSpec::File(extension) => {
                let stream = match rx.recv().await {
                    Some(Ok(first)) => OutputStream::with_first(rx, first),
                    Some(Err(e)) => return Err(e),
                    None => OutputStream::new(rx),
                };
                Ok(ExecutionResult::File {
                    stream,
                    mime_type: mime_type(&extension),
                })
            }
        }
    }

    /// Take the language slot, stage the workspace and start the unit.
    async fn prepare(
        &self,
        request: &ExecutionRequest,
        profile: &LanguageProfile,
        strategy: MountStrategy,
    ) -> Result<(String, CleanupGuard)> {
        let slot = self.acquire_slot(&profile.id).await?;
        let request_id = new_request_id();
        let unit = self.controller.unit_name(&profile.id);

        info!(
            request_id = %request_id,
            language = %profile.id,
            unit = %unit,
            output = %request.output,
            "Starting execution"
        );

        // Armed before staging, so a deadline or a dropped caller during any
        // of the steps below still releases what exists by then.
        let mut guard = CleanupGuard::new(Cleanup {
            controller: self.controller.clone(),
            workspaces: self.workspaces.clone(),
            unit: unit.clone(),
            workspace: Workspace {
                request_id,
                ..Default::default()
            },
            slot: Some(slot),
        });

        let staged = self
            .workspaces
            .stage(guard.workspace_mut(), request, profile, strategy)
            .await;
        if let Err(e) = staged {
            guard.finish().await;
            return Err(e);
        }
        let spec = self.controller.unit_spec(&unit, profile, guard.workspace());

        self.controller.preempt(&unit).await;
        if let Err(e) = self.controller.launch(&spec).await {
            warn!(unit = %unit, error = %e, "Failed to launch unit");
            guard.finish().await;
            return Err(e);
        }

        Ok((unit, guard))
    }

    async fn acquire_slot(&self, language: &str) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        let slot = self
            .slots
            .get(language)
            .cloned()
            .ok_or_else(|| ExecboxError::UnsupportedLanguage {
                language: language.to_string(),
            })?;
        Ok(slot.lock_owned().await)
    }

    fn timeout_seconds(&self) -> u64 {
        self.timeout.map(|t| t.as_secs()).unwrap_or_default()
    }

    fn timeout_error(&self) -> ExecboxError {
        ExecboxError::Timeout {
            seconds: self.timeout_seconds(),
        }
    }
}

/// Relay output to the caller, then clean up. A failed relay is reported
/// as the last item of the stream, after cleanup has finished.
async fn pump(
    runtime: Arc<dyn ContainerRuntime>,
    unit: String,
    retrieval: Retrieval,
    guard: CleanupGuard,
    tx: ChunkSender,
    deadline: Option<Instant>,
    timeout_seconds: u64,
) {
    // A caller that walks away must not leave the unit running until its
    // output happens to end.
    let relay = async {
        tokio::select! {
            outcome = retrieval.relay(runtime.as_ref(), &unit, &tx) => outcome,
            _ = tx.closed() => {
                debug!(unit = %unit, "Receiver dropped, abandoning relay");
                Ok(())
            }
        }
    };
    let outcome = match deadline {
        Some(deadline) => timeout_at(deadline, relay).await.unwrap_or_else(|_| {
            warn!(unit = %unit, seconds = timeout_seconds, "Execution deadline expired, tearing down");
            Err(ExecboxError::Timeout {
                seconds: timeout_seconds,
            })
        }),
        None => relay.await,
    };

    if let Err(e) = &outcome {
        warn!(unit = %unit, error = %e, "Output relay failed");
    }

    guard.finish().await;

    if let Err(e) = outcome {
        // the receiver may be gone already; nothing else to tell
        let _ = tx.send(Err(e)).await;
    }
}

fn new_request_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}
