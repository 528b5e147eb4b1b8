use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::LanguageProfile;
use crate::runtime::{ContainerRuntime, UnitSpec, LANGUAGE_LABEL, MANAGED_LABEL};
use crate::workspace::Workspace;

/// Drives one unit through `Absent -> Created -> Running -> Exited/Removed`.
pub(crate) struct EnvironmentController {
    runtime: Arc<dyn ContainerRuntime>,
    unit_prefix: String,
    working_dir: String,
}

impl EnvironmentController {
    pub(crate) fn new(
        runtime: Arc<dyn ContainerRuntime>,
        unit_prefix: impl Into<String>,
        working_dir: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            unit_prefix: unit_prefix.into(),
            working_dir: working_dir.into(),
        }
    }

    /// The single unit slot of a language.
    pub(crate) fn unit_name(&self, language: &str) -> String {
        format!("{}-{}", self.unit_prefix, language)
    }

    pub(crate) fn unit_spec(
        &self,
        name: &str,
        profile: &LanguageProfile,
        workspace: &Workspace,
    ) -> UnitSpec {
        UnitSpec {
            name: name.to_string(),
            image: profile.image.clone(),
            command: profile.command(&workspace.code_unit_path),
            working_dir: self.working_dir.clone(),
            mounts: workspace.mounts.clone(),
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (LANGUAGE_LABEL.to_string(), profile.id.clone()),
            ]),
        }
    }

    /// Clear the name for a new occupant. Best effort: the aim is a free
    /// name, so failures are logged and dropped.
    pub(crate) async fn preempt(&self, name: &str) {
        match self.runtime.exists(name).await {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                debug!(unit = %name, error = %e, "Inspect before pre-emption failed");
            }
        }

        info!(unit = %name, "Evicting stale unit");
        if let Err(e) = self.runtime.stop(name).await {
            debug!(unit = %name, error = %e, "Failed to stop stale unit");
        }
        if let Err(e) = self.runtime.remove(name).await {
            warn!(unit = %name, error = %e, "Failed to remove stale unit");
        }
    }

    /// Create the unit and start it with output attached.
    pub(crate) async fn launch(&self, spec: &UnitSpec) -> Result<()> {
        self.runtime.create(spec).await?;
        self.runtime.start(&spec.name).await?;
        info!(unit = %spec.name, command = ?spec.command, "Unit started");
        Ok(())
    }

    /// Force-remove the unit; failures are logged, never returned.
    pub(crate) async fn teardown(&self, name: &str) {
        match self.runtime.remove(name).await {
            Ok(()) => debug!(unit = %name, "Unit removed"),
            Err(e) => warn!(unit = %name, error = %e, "Failed to remove unit"),
        }
    }
}
