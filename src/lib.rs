pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod workspace;

pub use engine::{
    Engine, ExecutionRequest, ExecutionResult, InputFile, OutputSpec, OutputStream,
};
pub use error::{ExecboxError, Result};
