//! notebookd CLI entry point.
//!
//! One-shot commands over notebook documents and kernel sessions. All
//! results are printed as JSON; errors go to stderr as structured
//! `{error, detail}` payloads with a non-zero exit code.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;

use notebookd::cells::CellKind;
use notebookd::service::ExportFormat;
use notebookd::{NotebookError, NotebookService};

#[derive(Parser, Debug)]
#[command(name = "notebookd")]
#[command(about = "Kernel session and notebook mutation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read a notebook's cells
    Read {
        path: PathBuf,

        /// Include readable output text per code cell
        #[arg(long)]
        outputs: bool,
    },

    /// Create a new notebook
    Create {
        path: PathBuf,

        #[arg(long, default_value = "Untitled")]
        title: String,

        /// Replace the file if it already exists
        #[arg(long)]
        overwrite: bool,
    },

    /// Add a cell
    AddCell {
        path: PathBuf,

        /// code, markdown or raw
        #[arg(long, default_value = "code")]
        cell_type: CellKind,

        #[arg(long, default_value = "")]
        source: String,

        /// Insert position (default: append)
        #[arg(long)]
        index: Option<usize>,
    },

    /// Execute one code cell
    Exec {
        path: PathBuf,
        index: usize,

        /// Kernelspec name (default: from notebook metadata)
        #[arg(long)]
        kernel: Option<String>,

        /// Per-cell timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Execute every code cell in order
    ExecAll {
        path: PathBuf,

        #[arg(long)]
        kernel: Option<String>,

        /// Per-cell timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,

        /// Keep going past failing cells
        #[arg(long)]
        continue_on_error: bool,
    },

    /// List available kernelspecs and active sessions
    Kernels,

    /// Search cell sources
    Search {
        path: PathBuf,
        term: String,

        #[arg(long)]
        case_sensitive: bool,
    },

    /// Scan imports and pip installs
    Deps { path: PathBuf },

    /// Notebook statistics
    Metadata { path: PathBuf },

    /// Export to script, code, markdown or html
    Export {
        path: PathBuf,

        #[arg(long, default_value = "script")]
        format: ExportFormat,

        /// Output file (default: next to the notebook)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn fail(err: NotebookError) -> anyhow::Result<()> {
    eprintln!("{}", err.to_payload());
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let service = NotebookService::new();

    let result = run(&service, cli.command).await;

    // One-shot process: any kernel we started dies with us.
    service.shutdown().await;

    match result {
        Ok(failed_execution) => {
            if failed_execution {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => fail(err),
    }
}

/// Returns true when an execution command completed but the code failed.
async fn run(service: &NotebookService, command: Commands) -> notebookd::Result<bool> {
    match command {
        Commands::Read { path, outputs } => {
            print_json(&service.read_notebook(&path, outputs).await?).ok();
        }
        Commands::Create {
            path,
            title,
            overwrite,
        } => {
            print_json(&service.create_notebook(&path, &title, overwrite).await?).ok();
        }
        Commands::AddCell {
            path,
            cell_type,
            source,
            index,
        } => {
            print_json(&service.add_cell(&path, cell_type, &source, index).await?).ok();
        }
        Commands::Exec {
            path,
            index,
            kernel,
            timeout,
        } => {
            let result = service
                .execute_cell(
                    &path,
                    index,
                    kernel.as_deref(),
                    Some(Duration::from_secs(timeout)),
                )
                .await?;
            let failed = !result.run.success;
            print_json(&result).ok();
            return Ok(failed);
        }
        Commands::ExecAll {
            path,
            kernel,
            timeout,
            continue_on_error,
        } => {
            let result = service
                .execute_notebook(
                    &path,
                    kernel.as_deref(),
                    Some(Duration::from_secs(timeout)),
                    continue_on_error,
                )
                .await?;
            let failed = result.run.reports.iter().any(|r| !r.run.success);
            print_json(&result).ok();
            return Ok(failed);
        }
        Commands::Kernels => {
            print_json(&service.list_kernels().await?).ok();
        }
        Commands::Search {
            path,
            term,
            case_sensitive,
        } => {
            print_json(&service.search_cells(&path, &term, case_sensitive).await?).ok();
        }
        Commands::Deps { path } => {
            print_json(&service.analyze_dependencies(&path).await?).ok();
        }
        Commands::Metadata { path } => {
            print_json(&service.get_notebook_metadata(&path).await?).ok();
        }
        Commands::Export {
            path,
            format,
            output,
        } => {
            print_json(&service.export_notebook(&path, format, output).await?).ok();
        }
    }
    Ok(false)
}
