use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::cli::args::{ConfigAction, ConfigArgs, InitArgs, OutputFormat, RunArgs};
use crate::config::loader::{default_config_toml, get_config_path};
use crate::config::types::ExecboxConfig;
use crate::engine::{Engine, ExecutionRequest, ExecutionResult, InputFile, OutputStream};
use crate::error::{ExecboxError, Result};
use crate::registry::LanguageRegistry;
use crate::runtime::{ContainerRuntime, DockerRuntime};

// ============================================================================
// Execution
// ============================================================================

/// Execute a source file or snippet
pub async fn run(args: RunArgs, mut config: ExecboxConfig, format: OutputFormat) -> Result<()> {
    info!(language = %args.language, output = %args.output, "Running code");

    if let Some(timeout) = args.timeout {
        config.engine.timeout_seconds = timeout;
    }

    let source_code = match (&args.code, &args.file) {
        (Some(code), _) => code.clone(),
        (None, Some(path)) => tokio::fs::read_to_string(path).await?,
        (None, None) => {
            return Err(ExecboxError::Config(
                "either --file or --code is required".to_string(),
            ))
        }
    };

    let mut request =
        ExecutionRequest::new(&args.language, source_code).with_output(args.output.clone());
    if let Some(path) = &args.input {
        request = request.with_input(InputFile::from_path(path).await?);
    }

    let runtime = Arc::new(DockerRuntime::connect(&config.docker)?);
    let engine = Engine::new(&config, runtime)?;
    let strategy = args.strategy.unwrap_or(config.engine.mount_strategy);

    let started = Instant::now();
    let result = engine.execute_with(request, strategy).await?;
    let content_type = result.content_type();

    match result {
        ExecutionResult::Logs { stream } => match format {
            OutputFormat::Text => {
                stream_to_stdout(stream).await?;
            }
            OutputFormat::Json => {
                let output = stream.collect_bytes().await?;
                println!(
                    "{}",
                    serde_json::json!({
                        "language": args.language,
                        "content_type": content_type,
                        "output": String::from_utf8_lossy(&output),
                        "bytes": output.len(),
                        "elapsed_ms": started.elapsed().as_millis() as u64,
                    })
                );
            }
        },
        ExecutionResult::File { stream, .. } => {
            let dest = args
                .dest
                .clone()
                .or_else(|| args.output.file_name().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("output"));
            let written = write_to_file(stream, &dest).await?;

            match format {
                OutputFormat::Text => {
                    println!("Wrote {} bytes ({}) to {}", written, content_type, dest.display());
                }
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::json!({
                            "language": args.language,
                            "content_type": content_type,
                            "path": dest.display().to_string(),
                            "bytes": written,
                            "elapsed_ms": started.elapsed().as_millis() as u64,
                        })
                    );
                }
            }
        }
    }

    Ok(())
}

/// List the registered languages
pub async fn languages(config: ExecboxConfig, format: OutputFormat) -> Result<()> {
    let registry = LanguageRegistry::from_config(&config.languages)?;

    match format {
        OutputFormat::Text => {
            println!("{:<12} {:<6} {:<24} COMMAND", "LANGUAGE", "EXT", "IMAGE");
            println!("{}", "-".repeat(70));
            for profile in registry.languages() {
                println!(
                    "{:<12} {:<6} {:<24} {}",
                    profile.id,
                    profile.extension,
                    profile.image,
                    profile.command_template().join(" ")
                );
            }
        }
        OutputFormat::Json => {
            let languages: Vec<_> = registry
                .languages()
                .map(|p| {
                    serde_json::json!({
                        "id": p.id,
                        "extension": p.extension,
                        "image": p.image,
                        "command": p.command_template(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&languages)?);
        }
    }

    Ok(())
}

/// Check that the container runtime answers
pub async fn check(config: ExecboxConfig, format: OutputFormat) -> Result<()> {
    let runtime = DockerRuntime::connect(&config.docker)?;
    runtime.ping().await?;

    match format {
        OutputFormat::Text => println!("{} runtime is reachable", runtime.name()),
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "runtime": runtime.name(),
                    "reachable": true,
                })
            );
        }
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&config_path, default_config_toml()?)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Check that Docker is reachable");
    println!("  execbox check");
    println!();
    println!("  # Run a snippet and stream its console output");
    println!("  execbox run python --code \"print(6*7)\"");
    println!();
    println!("  # Collect the file a script writes to output.png");
    println!("  execbox run python --file plot.py --output png --dest plot.png");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: ExecboxConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| ExecboxError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn stream_to_stdout(mut stream: OutputStream) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        stdout.write_all(&chunk).await?;
        stdout.flush().await?;
    }
    Ok(())
}

/// Write the stream to `dest`; a partial file is removed again.
async fn write_to_file(stream: OutputStream, dest: &Path) -> Result<u64> {
    match copy_stream(stream, dest).await {
        Ok(written) => Ok(written),
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(dest).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %dest.display(), error = %remove_err, "Failed to remove partial output");
                }
            }
            Err(e)
        }
    }
}

async fn copy_stream(mut stream: OutputStream, dest: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| ExecboxError::workspace(dest, e))?;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
