mod docker;
#[cfg(test)]
pub(crate) mod fake;
mod traits;

pub use docker::DockerRuntime;
pub use traits::{ByteStream, ContainerRuntime, UnitMount, UnitSpec};

/// Label put on every unit and volume this crate creates.
pub const MANAGED_LABEL: &str = "execbox.managed";

/// Label recording which language a unit runs.
pub const LANGUAGE_LABEL: &str = "execbox.language";
