//! Host-side staging of code and input files for one request.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{debug, warn};

use crate::config::types::MountStrategy;
use crate::engine::request::{ExecutionRequest, InputFile};
use crate::error::{ExecboxError, Result};
use crate::registry::LanguageProfile;
use crate::runtime::{ContainerRuntime, UnitMount};

/// Files staged for one request and where the unit sees them.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub request_id: String,
    /// Per-request directory under the staging root (bind mounts only)
    pub run_dir: Option<PathBuf>,
    pub code_host_path: Option<PathBuf>,
    pub input_host_path: Option<PathBuf>,
    pub code_unit_path: String,
    pub input_unit_path: Option<String>,
    /// Per-request volume (named volumes only)
    pub volume: Option<String>,
    pub mounts: Vec<UnitMount>,
}

/// Stages workspaces under a fixed root and tears them down again.
pub struct WorkspaceManager {
    staging_root: PathBuf,
    container_root: String,
    volume_prefix: String,
    runtime: Arc<dyn ContainerRuntime>,
}

impl WorkspaceManager {
    pub fn new(
        staging_root: PathBuf,
        container_root: impl Into<String>,
        volume_prefix: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            staging_root,
            container_root: container_root.into().trim_end_matches('/').to_string(),
            volume_prefix: volume_prefix.into(),
            runtime,
        }
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    fn uploads_dir(&self) -> PathBuf {
        self.staging_root.join("uploads")
    }

    fn unit_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.container_root, file_name)
    }

    /// Write the request's code (and input file) where the unit can mount it.
    ///
    /// `workspace` starts out empty apart from its request id. Every host
    /// path or volume is recorded in it before it is created, so releasing
    /// the workspace removes everything even if this future is dropped part
    /// way. A failed staging step is rolled back before the error returns.
    pub async fn stage(
        &self,
        workspace: &mut Workspace,
        request: &ExecutionRequest,
        profile: &LanguageProfile,
        strategy: MountStrategy,
    ) -> Result<()> {
        let input_name = request
            .input_file
            .as_ref()
            .map(|input| input.sanitized_name())
            .transpose()?;

        let code_file = profile.code_file_name();
        workspace.code_unit_path = self.unit_path(&code_file);
        workspace.input_unit_path = input_name.as_deref().map(|name| self.unit_path(name));

        let staged = match strategy {
            MountStrategy::BindMount => {
                self.stage_bind(workspace, request, &code_file, input_name.as_deref())
                    .await
            }
            MountStrategy::NamedVolume => {
                self.stage_volume(workspace, request, profile, &code_file, input_name.as_deref())
                    .await
            }
        };

        if let Err(e) = staged {
            self.release(workspace).await;
            return Err(e);
        }

        debug!(
            request_id = %workspace.request_id,
            strategy = ?strategy,
            code = %workspace.code_unit_path,
            input = ?workspace.input_unit_path,
            "Workspace staged"
        );
        Ok(())
    }

    async fn stage_bind(
        &self,
        workspace: &mut Workspace,
        request: &ExecutionRequest,
        code_file: &str,
        input_name: Option<&str>,
    ) -> Result<()> {
        let run_dir = self.staging_root.join(&workspace.request_id);
        workspace.run_dir = Some(run_dir.clone());

        let code_path = run_dir.join(code_file);
        workspace.code_host_path = Some(code_path.clone());
        write_file(&code_path, request.source_code.as_bytes()).await?;
        workspace.mounts.push(UnitMount::Bind {
            host_path: code_path,
            unit_path: workspace.code_unit_path.clone(),
        });

        if let (Some(input), Some(name), Some(unit_path)) = (
            request.input_file.as_ref(),
            input_name,
            workspace.input_unit_path.clone(),
        ) {
            let input_path = self
                .uploads_dir()
                .join(format!("{}-{}", workspace.request_id, name));
            workspace.input_host_path = Some(input_path.clone());
            write_file(&input_path, &input.bytes).await?;
            workspace.mounts.push(UnitMount::Bind {
                host_path: input_path,
                unit_path,
            });
        }

        Ok(())
    }

    async fn stage_volume(
        &self,
        workspace: &mut Workspace,
        request: &ExecutionRequest,
        profile: &LanguageProfile,
        code_file: &str,
        input_name: Option<&str>,
    ) -> Result<()> {
        let volume = format!(
            "{}-{}-{}",
            self.volume_prefix, profile.id, workspace.request_id
        );
        workspace.volume = Some(volume.clone());
        let mountpoint = self.runtime.create_volume(&volume).await?;

        let code_path = mountpoint.join(code_file);
        workspace.code_host_path = Some(code_path.clone());
        write_file(&code_path, request.source_code.as_bytes()).await?;

        if let (Some(input), Some(name)) = (request.input_file.as_ref(), input_name) {
            let input_path = mountpoint.join(name);
            workspace.input_host_path = Some(input_path.clone());
            write_file(&input_path, &input.bytes).await?;
        }

        workspace.mounts.push(UnitMount::Volume {
            name: volume,
            unit_path: self.container_root.clone(),
        });
        Ok(())
    }

    /// Remove everything a workspace staged. Idempotent and never fails:
    /// each deletion is attempted on its own and failures are only logged.
    pub async fn release(&self, workspace: &Workspace) {
        tokio::join!(
            remove_staged(workspace.code_host_path.as_deref()),
            remove_staged(workspace.input_host_path.as_deref()),
        );

        if let Some(run_dir) = &workspace.run_dir {
            if let Err(e) = fs::remove_dir(run_dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %run_dir.display(), error = %e, "Failed to remove run directory");
                }
            }
        }

        if let Some(volume) = &workspace.volume {
            if let Err(e) = self.runtime.remove_volume(volume).await {
                warn!(volume = %volume, error = %e, "Failed to remove volume");
            }
        }

        debug!(request_id = %workspace.request_id, "Workspace released");
    }
}

async fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecboxError::workspace(parent, e))?;
    }
    fs::write(path, content)
        .await
        .map_err(|e| ExecboxError::workspace(path, e))
}

async fn remove_staged(path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed staged file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staged file"),
    }
}

impl InputFile {
    /// Final path component of the upload name; the unit sees the file
    /// under this name next to the code.
    pub(crate) fn sanitized_name(&self) -> Result<String> {
        let name = Path::new(&self.name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if name.is_empty() || name == "." || name == ".." || name.starts_with("script.") {
            return Err(ExecboxError::InvalidInputName {
                name: self.name.clone(),
            });
        }
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::request::OutputSpec;
    use crate::registry::LanguageRegistry;
    use crate::runtime::fake::{FakeRun, FakeRuntime};

    fn manager(root: &Path) -> (WorkspaceManager, Arc<FakeRuntime>) {
        let runtime = Arc::new(FakeRuntime::new(&root.join("volumes"), |_| FakeRun::default()));
        let manager = WorkspaceManager::new(
            root.join("staging"),
            "/app",
            "code-exec-volume",
            runtime.clone(),
        );
        (manager, runtime)
    }

    fn request(input: Option<InputFile>) -> ExecutionRequest {
        ExecutionRequest {
            language: "python".to_string(),
            source_code: "print(open('data.csv').read())".to_string(),
            input_file: input,
            output: OutputSpec::Void,
        }
    }

    async fn stage(
        manager: &WorkspaceManager,
        request: &ExecutionRequest,
        profile: &LanguageProfile,
        strategy: MountStrategy,
        request_id: &str,
    ) -> Result<Workspace> {
        let mut workspace = Workspace {
            request_id: request_id.to_string(),
            ..Default::default()
        };
        manager.stage(&mut workspace, request, profile, strategy).await?;
        Ok(workspace)
    }

    fn file_count(dir: &Path) -> usize {
        if !dir.exists() {
            return 0;
        }
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .map(|p| if p.is_dir() { file_count(&p) } else { 1 })
            .sum()
    }

    #[tokio::test]
    async fn test_stage_and_release_bind() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let registry = LanguageRegistry::builtin();
        let profile = registry.resolve("python").unwrap();

        let input = InputFile::new("../../etc/data.csv", b"a,b\n1,2\n".to_vec());
        let workspace = stage(
            &manager,
            &request(Some(input)),
            profile,
            MountStrategy::BindMount,
            "req1",
        )
        .await
        .unwrap();

        let code = workspace.code_host_path.clone().unwrap();
        assert_eq!(code, dir.path().join("staging/req1/script.py"));
        assert_eq!(
            std::fs::read_to_string(&code).unwrap(),
            "print(open('data.csv').read())"
        );
        let input = workspace.input_host_path.clone().unwrap();
        assert_eq!(input, dir.path().join("staging/uploads/req1-data.csv"));
        assert_eq!(workspace.code_unit_path, "/app/script.py");
        assert_eq!(workspace.input_unit_path.as_deref(), Some("/app/data.csv"));
        assert_eq!(workspace.mounts.len(), 2);
        assert_eq!(
            workspace.mounts[0].bind_spec(),
            format!("{}:/app/script.py", code.display())
        );

        manager.release(&workspace).await;
        assert!(!code.exists());
        assert!(!input.exists());
        assert!(!dir.path().join("staging/req1").exists());
        assert_eq!(file_count(&dir.path().join("staging")), 0);

        // second release is a no-op
        manager.release(&workspace).await;
    }

    #[tokio::test]
    async fn test_stage_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, runtime) = manager(dir.path());
        let registry = LanguageRegistry::builtin();
        let profile = registry.resolve("javascript").unwrap();

        let input = InputFile::new("in.txt", b"hello".to_vec());
        let workspace = stage(
            &manager,
            &request(Some(input)),
            profile,
            MountStrategy::NamedVolume,
            "req2",
        )
        .await
        .unwrap();

        assert_eq!(
            workspace.volume.as_deref(),
            Some("code-exec-volume-javascript-req2")
        );
        assert_eq!(
            workspace.mounts,
            vec![UnitMount::Volume {
                name: "code-exec-volume-javascript-req2".to_string(),
                unit_path: "/app".to_string(),
            }]
        );
        let mountpoint = dir.path().join("volumes/code-exec-volume-javascript-req2");
        assert!(mountpoint.join("script.js").exists());
        assert_eq!(std::fs::read(mountpoint.join("in.txt")).unwrap(), b"hello");
        assert!(!dir.path().join("staging").exists());

        manager.release(&workspace).await;
        assert!(!mountpoint.exists());
        assert!(runtime.volume_names().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_input_name_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let registry = LanguageRegistry::builtin();
        let profile = registry.resolve("python").unwrap();

        let input = InputFile::new("..", b"x".to_vec());
        let err = stage(
            &manager,
            &request(Some(input)),
            profile,
            MountStrategy::BindMount,
            "req3",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecboxError::InvalidInputName { .. }));
        assert!(!dir.path().join("staging").exists());
    }

    #[tokio::test]
    async fn test_failed_staging_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let registry = LanguageRegistry::builtin();
        let profile = registry.resolve("python").unwrap();

        // a plain file where the uploads directory should be
        std::fs::create_dir_all(dir.path().join("staging")).unwrap();
        std::fs::write(dir.path().join("staging/uploads"), b"").unwrap();

        let input = InputFile::new("data.csv", b"1".to_vec());
        let err = stage(
            &manager,
            &request(Some(input)),
            profile,
            MountStrategy::BindMount,
            "req4",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecboxError::Workspace { .. }));
        assert!(!dir.path().join("staging/req4").exists());
    }

    #[tokio::test]
    async fn test_release_continues_past_failed_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let registry = LanguageRegistry::builtin();
        let profile = registry.resolve("python").unwrap();

        let input = InputFile::new("data.csv", b"1,2".to_vec());
        let workspace = stage(
            &manager,
            &request(Some(input)),
            profile,
            MountStrategy::BindMount,
            "req5",
        )
        .await
        .unwrap();

        // a non-empty directory where the code file was cannot be unlinked
        let code = workspace.code_host_path.clone().unwrap();
        std::fs::remove_file(&code).unwrap();
        std::fs::create_dir_all(code.join("nested")).unwrap();

        manager.release(&workspace).await;

        assert!(!workspace.input_host_path.clone().unwrap().exists());
        assert!(code.exists());
    }

    #[tokio::test]
    async fn test_volume_is_recorded_before_creation() {
        let dir = tempfile::tempdir().unwrap();
        // a plain file where the volume mountpoint should go makes creation fail
        std::fs::create_dir_all(dir.path().join("volumes")).unwrap();
        std::fs::write(dir.path().join("volumes/code-exec-volume-python-req6"), b"").unwrap();
        let (manager, runtime) = manager(dir.path());
        let registry = LanguageRegistry::builtin();
        let profile = registry.resolve("python").unwrap();

        let mut workspace = Workspace {
            request_id: "req6".to_string(),
            ..Default::default()
        };
        assert!(manager
            .stage(&mut workspace, &request(None), profile, MountStrategy::NamedVolume)
            .await
            .is_err());
        assert_eq!(
            workspace.volume.as_deref(),
            Some("code-exec-volume-python-req6")
        );
        // the rollback asked the runtime to remove it all the same
        assert!(runtime
            .events()
            .contains(&"remove_volume:code-exec-volume-python-req6".to_string()));
    }

    #[test]
    fn test_sanitized_name() {
        let ok = InputFile::new("dir/sub/data.csv", vec![]);
        assert_eq!(ok.sanitized_name().unwrap(), "data.csv");
        assert!(InputFile::new("", vec![]).sanitized_name().is_err());
        assert!(InputFile::new("script.py", vec![]).sanitized_name().is_err());
    }
}
