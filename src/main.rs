//! runbox CLI
//!
//! Thin shim over the sandbox manager: run a file set in a disposable
//! sandbox, or list supported languages. Error classes map 1:1 onto process
//! exit codes so scripts can branch on the failure kind.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use runbox::{ExecutionRequest, ManagerConfig, SandboxManager, SourceFile};

/// Exit code for a run killed by its deadline.
const TIMEOUT_EXIT: u8 = 124;

#[derive(Parser, Debug)]
#[command(name = "runbox")]
#[command(about = "Run code in a disposable sandbox")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute source files in a fresh sandbox and print the output.
    Run {
        /// Source files; paths become workspace-relative paths.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Language tag (see `runbox languages`).
        #[arg(long, short)]
        language: String,

        /// Run deadline in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List supported language tags.
    Languages,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // stderr so stdout carries only program output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Languages => {
            for language in runbox::language::supported_languages() {
                println!("{language}");
            }
            ExitCode::SUCCESS
        }
        Command::Run {
            files,
            language,
            timeout_ms,
        } => match load_request(files, language, timeout_ms) {
            Ok(request) => run(request).await,
            Err(e) => {
                error!(error = %e, "Failed to read input files");
                ExitCode::FAILURE
            }
        },
    }
}

fn load_request(
    files: Vec<PathBuf>,
    language: String,
    timeout_ms: Option<u64>,
) -> Result<ExecutionRequest> {
    let files = files
        .into_iter()
        .map(|path| {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            // Workspace path is the file name; directory layout on the host
            // is not reproduced inside the sandbox.
            let name = path
                .file_name()
                .with_context(|| format!("Not a file: {}", path.display()))?
                .to_string_lossy()
                .into_owned();
            Ok(SourceFile {
                path: name,
                content,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ExecutionRequest {
        files,
        language,
        timeout_ms,
    })
}

async fn run(request: ExecutionRequest) -> ExitCode {
    let config = ManagerConfig::from_env();
    let manager = SandboxManager::with_process_backend(config);

    let result = tokio::select! {
        result = manager.run(&request) => result,
        () = shutdown_signal() => {
            info!("Shutdown signal received; sweeping sandboxes");
            manager.shutdown().await;
            return ExitCode::from(130);
        }
    };

    match result {
        Ok(result) => {
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            info!(
                sandbox = %result.sandbox_id,
                duration_ms = result.duration_ms,
                exit = ?result.exit_code,
                "Run finished"
            );
            match result.exit_code {
                Some(code) => ExitCode::from(u8::try_from(code.rem_euclid(256)).unwrap_or(1)),
                None => ExitCode::from(TIMEOUT_EXIT),
            }
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
