//! In-memory runtime for tests.
//!
//! Units "run" a caller-supplied program over the files they were given, so
//! the engine can be exercised end to end without a daemon.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use crate::error::{ExecboxError, Result};
use crate::runtime::traits::{ByteStream, ContainerRuntime, UnitMount, UnitSpec};

/// What a unit sees when it starts.
pub struct FakeInvocation {
    pub spec: UnitSpec,
    /// Source of the code file named in the command
    pub source: String,
    /// Every mounted file, by in-unit path
    pub files: HashMap<String, Vec<u8>>,
}

/// What a unit does.
#[derive(Default, Clone)]
pub struct FakeRun {
    pub logs: Vec<&'static str>,
    pub files: Vec<(String, Vec<u8>)>,
    pub exit_code: i64,
}

#[derive(Default, Clone)]
pub struct FakeFaults {
    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub fail_remove: bool,
    pub hang_wait: bool,
    pub hang_logs: bool,
    /// Yield a transport error after this many log chunks
    pub log_error_after: Option<usize>,
    /// Cut the archive transfer after this many chunks
    pub download_error_after: Option<usize>,
    /// Stall after a volume has been created
    pub volume_delay: Option<Duration>,
}

type Program = dyn Fn(&FakeInvocation) -> FakeRun + Send + Sync;

struct FakeUnit {
    spec: Option<UnitSpec>,
    run: Option<FakeRun>,
}

#[derive(Default)]
struct FakeState {
    units: HashMap<String, FakeUnit>,
    volumes: HashMap<String, PathBuf>,
    events: Vec<String>,
    invocations: Vec<HashMap<String, Vec<u8>>>,
}

pub struct FakeRuntime {
    program: Box<Program>,
    faults: FakeFaults,
    volume_root: PathBuf,
    state: Arc<Mutex<FakeState>>,
}

impl FakeRuntime {
    pub fn new<F>(volume_root: &Path, program: F) -> Self
    where
        F: Fn(&FakeInvocation) -> FakeRun + Send + Sync + 'static,
    {
        Self {
            program: Box::new(program),
            faults: FakeFaults::default(),
            volume_root: volume_root.to_path_buf(),
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn with_faults(mut self, faults: FakeFaults) -> Self {
        self.faults = faults;
        self
    }

    /// Pretend a unit from an earlier request is still around.
    pub fn seed_unit(&self, name: &str) {
        self.state().units.insert(
            name.to_string(),
            FakeUnit {
                spec: None,
                run: None,
            },
        );
    }

    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.state().units.keys().cloned().collect()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state().volumes.keys().cloned().collect()
    }

    /// Files each started unit was given, in start order.
    pub fn invocations(&self) -> Vec<HashMap<String, Vec<u8>>> {
        self.state().invocations.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, event: String) {
        self.state().events.push(event);
    }

    fn collect_files(&self, spec: &UnitSpec) -> Result<HashMap<String, Vec<u8>>> {
        let mut files = HashMap::new();
        for mount in &spec.mounts {
            match mount {
                UnitMount::Bind {
                    host_path,
                    unit_path,
                } => {
                    files.insert(unit_path.clone(), std::fs::read(host_path)?);
                }
                UnitMount::Volume { name, unit_path } => {
                    let mountpoint = self.state().volumes.get(name).cloned().ok_or_else(|| {
                        ExecboxError::control("start", &spec.name, format!("no volume {}", name))
                    })?;
                    for entry in std::fs::read_dir(&mountpoint)? {
                        let entry = entry?;
                        let file_name = entry.file_name().to_string_lossy().to_string();
                        files.insert(
                            format!("{}/{}", unit_path, file_name),
                            std::fs::read(entry.path())?,
                        );
                    }
                }
            }
        }
        Ok(files)
    }
}

fn tar_single_file(path: &str, data: &[u8]) -> Vec<u8> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, data).unwrap();
    builder.into_inner().unwrap()
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, unit: &str) -> Result<bool> {
        self.record(format!("exists:{}", unit));
        Ok(self.state().units.contains_key(unit))
    }

    async fn create(&self, spec: &UnitSpec) -> Result<()> {
        self.record(format!("create:{}", spec.name));
        if self.faults.fail_create {
            return Err(ExecboxError::control("create", &spec.name, "injected failure"));
        }
        let mut state = self.state();
        if state.units.contains_key(&spec.name) {
            return Err(ExecboxError::control("create", &spec.name, "name already in use"));
        }
        state.units.insert(
            spec.name.clone(),
            FakeUnit {
                spec: Some(spec.clone()),
                run: None,
            },
        );
        Ok(())
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.record(format!("start:{}", unit));
        if self.faults.fail_start {
            return Err(ExecboxError::control("start", unit, "injected failure"));
        }
        let spec = self
            .state()
            .units
            .get(unit)
            .and_then(|u| u.spec.clone())
            .ok_or_else(|| ExecboxError::control("start", unit, "no such unit"))?;

        let files = self.collect_files(&spec)?;
        let source = spec
            .command
            .iter()
            .find_map(|arg| files.get(arg))
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .unwrap_or_default();

        let invocation = FakeInvocation {
            spec,
            source,
            files: files.clone(),
        };
        let run = (self.program)(&invocation);

        let mut state = self.state();
        state.invocations.push(files);
        if let Some(unit) = state.units.get_mut(unit) {
            unit.run = Some(run);
        }
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.record(format!("stop:{}", unit));
        if self.faults.fail_stop {
            return Err(ExecboxError::control("stop", unit, "injected failure"));
        }
        Ok(())
    }

    async fn remove(&self, unit: &str) -> Result<()> {
        self.record(format!("remove:{}", unit));
        if self.faults.fail_remove {
            return Err(ExecboxError::control("remove", unit, "injected failure"));
        }
        self.state().units.remove(unit);
        Ok(())
    }

    fn logs(&self, unit: &str) -> ByteStream {
        self.record(format!("logs:{}", unit));
        let run = self.state().units.get(unit).and_then(|u| u.run.clone());
        let Some(run) = run else {
            let err = ExecboxError::Retrieval(format!("no running unit {}", unit));
            return stream::once(async move { Err(err) }).boxed();
        };

        let mut items: Vec<Result<Bytes>> = run
            .logs
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        if let Some(after) = self.faults.log_error_after {
            items.truncate(after);
            items.push(Err(ExecboxError::Retrieval("connection reset".to_string())));
        }

        let chunks = stream::iter(items);
        if self.faults.hang_logs {
            chunks.chain(stream::pending()).boxed()
        } else {
            chunks.boxed()
        }
    }

    async fn wait(&self, unit: &str) -> Result<i64> {
        self.record(format!("wait:{}", unit));
        if self.faults.hang_wait {
            std::future::pending::<()>().await;
        }
        let run = self.state().units.get(unit).and_then(|u| u.run.clone());
        run.map(|r| r.exit_code)
            .ok_or_else(|| ExecboxError::control("wait for", unit, "no running unit"))
    }

    fn download(&self, unit: &str, path: &str) -> ByteStream {
        self.record(format!("download:{}:{}", unit, path));
        let file = self
            .state()
            .units
            .get(unit)
            .and_then(|u| u.run.as_ref())
            .and_then(|run| run.files.iter().find(|(p, _)| p == path).cloned());

        match file {
            Some((path, data)) => {
                // small chunks so entries are decoded across chunk boundaries
                let archive = tar_single_file(&path, &data);
                let mut chunks: Vec<Result<Bytes>> = archive
                    .chunks(7)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                if let Some(after) = self.faults.download_error_after {
                    chunks.truncate(after);
                    chunks.push(Err(ExecboxError::Retrieval(
                        "archive transfer interrupted".to_string(),
                    )));
                }
                stream::iter(chunks).boxed()
            }
            None => {
                let err = ExecboxError::Retrieval(format!("{} was not produced by '{}'", path, unit));
                stream::once(async move { Err(err) }).boxed()
            }
        }
    }

    async fn create_volume(&self, name: &str) -> Result<PathBuf> {
        self.record(format!("create_volume:{}", name));
        let mountpoint = self.volume_root.join(name);
        std::fs::create_dir_all(&mountpoint)?;
        self.state()
            .volumes
            .insert(name.to_string(), mountpoint.clone());
        if let Some(delay) = self.faults.volume_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(mountpoint)
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.record(format!("remove_volume:{}", name));
        if let Some(mountpoint) = self.state().volumes.remove(name) {
            std::fs::remove_dir_all(mountpoint)?;
        }
        Ok(())
    }
}
