use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::engine::controller::EnvironmentController;
use crate::workspace::{Workspace, WorkspaceManager};

/// Everything one request has to give back.
pub(crate) struct Cleanup {
    pub(crate) controller: Arc<EnvironmentController>,
    pub(crate) workspaces: Arc<WorkspaceManager>,
    pub(crate) unit: String,
    pub(crate) workspace: Workspace,
    /// The language slot is held until the unit is gone, so the next
    /// occupant never finds a half-removed predecessor.
    pub(crate) slot: Option<OwnedMutexGuard<()>>,
}

impl Cleanup {
    /// Remove the unit, then the workspace (a volume cannot go while a unit
    /// still uses it). Neither step can fail, so both always run.
    pub(crate) async fn run(self) {
        self.controller.teardown(&self.unit).await;
        self.workspaces.release(&self.workspace).await;
        debug!(unit = %self.unit, request_id = %self.workspace.request_id, "Cleanup finished");
        drop(self.slot);
    }
}

/// Runs the cleanup on every exit path: explicitly via `finish`, or from
/// `Drop` when the owning future or task is abandoned.
///
/// The guard is armed before anything is staged and the workspace is filled
/// in through `workspace_mut`, so an abandoned staging step still releases
/// whatever it had already created.
pub(crate) struct CleanupGuard {
    cleanup: Cleanup,
    armed: bool,
}

impl CleanupGuard {
    pub(crate) fn new(cleanup: Cleanup) -> Self {
        Self {
            cleanup,
            armed: true,
        }
    }

    pub(crate) fn workspace(&self) -> &Workspace {
        &self.cleanup.workspace
    }

    pub(crate) fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.cleanup.workspace
    }

    pub(crate) async fn finish(mut self) {
        if let Some(cleanup) = self.disarm() {
            cleanup.run().await;
        }
    }

    fn disarm(&mut self) -> Option<Cleanup> {
        if !std::mem::replace(&mut self.armed, false) {
            return None;
        }
        Some(Cleanup {
            controller: self.cleanup.controller.clone(),
            workspaces: self.cleanup.workspaces.clone(),
            unit: std::mem::take(&mut self.cleanup.unit),
            workspace: std::mem::take(&mut self.cleanup.workspace),
            slot: self.cleanup.slot.take(),
        })
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(cleanup) = self.disarm() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(unit = %cleanup.unit, "Request abandoned, cleaning up in background");
                handle.spawn(cleanup.run());
            }
            Err(_) => {
                warn!(
                    unit = %cleanup.unit,
                    request_id = %cleanup.workspace.request_id,
                    "No runtime to clean up on; unit and workspace are left behind"
                );
            }
        }
    }
}
