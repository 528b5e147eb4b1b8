//! Language registry: which image runs which kind of source file.

use std::collections::BTreeMap;

use crate::config::types::LanguageConfig;
use crate::error::{ExecboxError, Result};

/// Placeholder replaced with the in-unit code path in command templates.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// How to run one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageProfile {
    pub id: String,
    pub extension: String,
    pub image: String,
    command: Vec<String>,
}

impl LanguageProfile {
    pub fn new(
        id: impl Into<String>,
        extension: impl Into<String>,
        image: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            extension: extension.into(),
            image: image.into(),
            command,
        }
    }

    /// Build the argv that runs `code_path` inside the unit.
    pub fn command(&self, code_path: &str) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| arg.replace(FILE_PLACEHOLDER, code_path))
            .collect()
    }

    pub fn command_template(&self) -> &[String] {
        &self.command
    }

    /// Name of the staged code file.
    pub fn code_file_name(&self) -> String {
        format!("script.{}", self.extension)
    }
}

/// Immutable map of language id to profile.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    profiles: BTreeMap<String, LanguageProfile>,
}

impl LanguageRegistry {
    /// Languages available without any configuration.
    pub fn builtin() -> Self {
        let profiles = [
            LanguageProfile::new(
                "python",
                "py",
                "my-python-image",
                vec!["python3".to_string(), FILE_PLACEHOLDER.to_string()],
            ),
            LanguageProfile::new(
                "javascript",
                "js",
                "my-node-image",
                vec!["node".to_string(), FILE_PLACEHOLDER.to_string()],
            ),
        ];

        Self {
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }

    /// Built-in languages merged with `[languages.*]` tables from the config.
    pub fn from_config(overrides: &BTreeMap<String, LanguageConfig>) -> Result<Self> {
        let mut registry = Self::builtin();

        for (id, entry) in overrides {
            let base = registry.profiles.get(id);

            let extension = entry
                .extension
                .clone()
                .or_else(|| base.map(|p| p.extension.clone()))
                .ok_or_else(|| missing_field(id, "extension"))?;
            let image = entry
                .image
                .clone()
                .or_else(|| base.map(|p| p.image.clone()))
                .ok_or_else(|| missing_field(id, "image"))?;
            let command = entry
                .command
                .clone()
                .or_else(|| base.map(|p| p.command.clone()))
                .ok_or_else(|| missing_field(id, "command"))?;

            let extension = extension.trim_start_matches('.').to_string();
            if !is_valid_extension(&extension) {
                return Err(ExecboxError::Config(format!(
                    "Language '{}' has an invalid extension: {:?}",
                    id, extension
                )));
            }
            if !command.iter().any(|arg| arg.contains(FILE_PLACEHOLDER)) {
                return Err(ExecboxError::Config(format!(
                    "Command for language '{}' must reference {}",
                    id, FILE_PLACEHOLDER
                )));
            }

            registry.profiles.insert(
                id.clone(),
                LanguageProfile::new(id.clone(), extension, image, command),
            );
        }

        Ok(registry)
    }

    /// Look up a language. Pure: no I/O, no side effects.
    pub fn resolve(&self, language: &str) -> Result<&LanguageProfile> {
        self.profiles
            .get(language)
            .ok_or_else(|| ExecboxError::UnsupportedLanguage {
                language: language.to_string(),
            })
    }

    pub fn languages(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

impl Default for LanguageRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn missing_field(id: &str, field: &str) -> ExecboxError {
    ExecboxError::Config(format!("Language '{}' is missing '{}'", id, field))
}

pub(crate) fn is_valid_extension(extension: &str) -> bool {
    !extension.is_empty() && extension.chars().all(|c| c.is_ascii_alphanumeric())
}

/// MIME type for an output file extension.
pub fn mime_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "py" => "text/x-python",
        "js" => "application/javascript",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "json" => "application/json",
        "csv" => "text/csv",
        "html" => "text/html",
        _ => "application/octet-stream",
    }
}
