pub mod loader;
pub mod types;

pub use loader::{load_config, get_config_path};
pub use types::{DockerConfig, EngineConfig, ExecboxConfig, LanguageConfig, MountStrategy};
