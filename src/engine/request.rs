use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ExecboxError, Result};
use crate::registry::is_valid_extension;

/// An uploaded file made available next to the code.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    /// Read a host file, keeping its file name.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self { name, bytes })
    }
}

/// What the caller wants back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    /// Console output, streamed while the unit runs
    Void,
    /// `output.<extension>` collected after the unit exits
    File(String),
}

impl OutputSpec {
    pub fn file_name(&self) -> Option<String> {
        match self {
            OutputSpec::Void => None,
            OutputSpec::File(extension) => Some(format!("output.{}", extension)),
        }
    }

    /// Reject extensions that would name anything but `output.<ext>` in
    /// the unit's root.
    pub fn validate(&self) -> Result<()> {
        match self {
            OutputSpec::File(extension) if !is_valid_extension(extension) => {
                Err(ExecboxError::InvalidOutputSpec {
                    spec: extension.clone(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl FromStr for OutputSpec {
    type Err = ExecboxError;

    fn from_str(s: &str) -> Result<Self> {
        let spec = s.trim();
        if spec.eq_ignore_ascii_case("void") {
            return Ok(OutputSpec::Void);
        }

        let output = OutputSpec::File(spec.trim_start_matches('.').to_string());
        output.validate().map_err(|_| ExecboxError::InvalidOutputSpec {
            spec: s.to_string(),
        })?;
        Ok(output)
    }
}

impl fmt::Display for OutputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSpec::Void => write!(f, "void"),
            OutputSpec::File(extension) => write!(f, "{}", extension),
        }
    }
}

/// One execution, as handed over by the calling layer.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub language: String,
    pub source_code: String,
    pub input_file: Option<InputFile>,
    pub output: OutputSpec,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source_code: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source_code: source_code.into(),
            input_file: None,
            output: OutputSpec::Void,
        }
    }

    pub fn with_input(mut self, input: InputFile) -> Self {
        self.input_file = Some(input);
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.output = output;
        self
    }
}
