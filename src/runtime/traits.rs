use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::Result;

/// Chunks coming out of a unit: log output or archive bytes.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A filesystem mount of an execution unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitMount {
    /// Host file or directory bound into the unit
    Bind { host_path: PathBuf, unit_path: String },
    /// Named volume mounted at `unit_path`
    Volume { name: String, unit_path: String },
}

impl UnitMount {
    /// `source:target` form understood by the daemon.
    pub fn bind_spec(&self) -> String {
        match self {
            UnitMount::Bind {
                host_path,
                unit_path,
            } => format!("{}:{}", host_path.display(), unit_path),
            UnitMount::Volume { name, unit_path } => format!("{}:{}", name, unit_path),
        }
    }
}

/// Everything needed to create an execution unit.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub mounts: Vec<UnitMount>,
    pub labels: HashMap<String, String>,
}

/// Control surface of a container runtime.
///
/// The engine only talks to units through this trait, so the runtime handle
/// is injected rather than global, and tests can substitute an in-memory
/// implementation.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name (e.g., "docker")
    fn name(&self) -> &str;

    /// Check that the runtime answers.
    async fn ping(&self) -> Result<()>;

    /// Whether a unit with this name exists, in any state.
    async fn exists(&self, unit: &str) -> Result<bool>;

    async fn create(&self, spec: &UnitSpec) -> Result<()>;

    async fn start(&self, unit: &str) -> Result<()>;

    /// Stop a running unit. Stopping an absent or exited unit succeeds.
    async fn stop(&self, unit: &str) -> Result<()>;

    /// Force-remove a unit. Removing an absent unit succeeds.
    async fn remove(&self, unit: &str) -> Result<()>;

    /// Follow the combined stdout/stderr of a unit until it exits.
    fn logs(&self, unit: &str) -> ByteStream;

    /// Wait for the unit to exit and return its exit code.
    async fn wait(&self, unit: &str) -> Result<i64>;

    /// Fetch `path` from the unit's filesystem as a tar archive stream.
    fn download(&self, unit: &str, path: &str) -> ByteStream;

    /// Create a named volume and return its host mountpoint.
    async fn create_volume(&self, name: &str) -> Result<PathBuf>;

    /// Remove a named volume. Removing an absent volume succeeds.
    async fn remove_volume(&self, name: &str) -> Result<()>;
}
