//! Notebook service: every externally visible operation.
//!
//! The service owns the kernel registry, a per-path mutation lock map and
//! a lazy document cache. Every mutating operation takes the path lock,
//! snapshots the persisted file, re-loads it, applies the edit and saves
//! atomically, so concurrent mutations of one document serialize and a
//! backup always precedes the first byte written. Reads never touch
//! kernels; execution is the only operation allowed to block on one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local};
use log::{info, warn};
use nbformat::v4::{Cell, Notebook};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::backup;
use crate::cells::{self, CellKind};
use crate::document;
use crate::error::{NotebookError, Result};
use crate::execution::{self, CellRun, NotebookRun};
use crate::registry::{ActiveKernel, KernelRegistry};
use crate::scan::{self, DependencyReport, SearchMatch};

const DEFAULT_SPEC: &str = "python3";

#[derive(Debug, Serialize)]
pub struct CellSummary {
    pub index: usize,
    pub id: String,
    pub cell_type: CellKind,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct NotebookOverview {
    pub path: PathBuf,
    pub title: Option<String>,
    pub spec_name: Option<String>,
    pub format_version: String,
    pub cell_count: usize,
    pub cells: Vec<CellSummary>,
}

#[derive(Debug, Serialize)]
pub struct NotebookFileInfo {
    pub path: PathBuf,
    pub name: String,
    pub size_bytes: u64,
    pub modified: Option<String>,
    pub cell_count: usize,
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedNotebook {
    pub path: PathBuf,
    pub cell_count: usize,
}

#[derive(Debug, Serialize)]
pub struct BackedUpNotebook {
    pub path: PathBuf,
    pub backup: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct CellMutation {
    pub path: PathBuf,
    pub index: usize,
    pub cell_id: String,
    pub cell_count: usize,
    pub backup: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct DeletedCell {
    pub path: PathBuf,
    pub index: usize,
    pub cell_type: CellKind,
    pub cell_count: usize,
    pub backup: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct MovedCell {
    pub path: PathBuf,
    pub from_index: usize,
    pub to_index: usize,
    pub backup: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct ClearedOutputs {
    pub path: PathBuf,
    pub cells_cleared: usize,
    pub backup: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct ChangedCellType {
    pub path: PathBuf,
    pub index: usize,
    pub cell_type: CellKind,
    pub backup: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct NotebookStats {
    pub path: PathBuf,
    pub format_version: String,
    pub title: Option<String>,
    pub spec_name: Option<String>,
    pub size_bytes: u64,
    pub modified: Option<String>,
    pub cell_count: usize,
    pub code_cells: usize,
    pub markdown_cells: usize,
    pub raw_cells: usize,
    pub executed_cells: usize,
    pub cells_with_outputs: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchResults {
    pub path: PathBuf,
    pub term: String,
    pub case_sensitive: bool,
    pub matches: Vec<SearchMatch>,
}

#[derive(Debug, Serialize)]
pub struct DependencyResults {
    pub path: PathBuf,
    pub dependencies: DependencyReport,
}

#[derive(Debug, Serialize)]
pub struct KernelspecSummary {
    pub name: String,
    pub display_name: String,
    pub language: String,
}

#[derive(Debug, Serialize)]
pub struct KernelList {
    pub available: Vec<KernelspecSummary>,
    pub sessions: Vec<ActiveKernel>,
}

#[derive(Debug, Serialize)]
pub struct ExecutedCell {
    pub path: PathBuf,
    pub index: usize,
    pub cell_id: String,
    pub run: CellRun,
    pub backup: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct ExecutedNotebook {
    pub path: PathBuf,
    pub run: NotebookRun,
    pub backup: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct RestartedKernel {
    pub spec_name: String,
    pub cleared_documents: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Script,
    CodeOnly,
    Markdown,
    Html,
}

impl ExportFormat {
    fn default_extension(&self) -> &'static str {
        match self {
            ExportFormat::Script => "py",
            ExportFormat::CodeOnly => "code.py",
            ExportFormat::Markdown => "md",
            ExportFormat::Html => "html",
        }
    }
}

impl std::fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportFormat::Script => write!(f, "script"),
            ExportFormat::CodeOnly => write!(f, "code"),
            ExportFormat::Markdown => write!(f, "markdown"),
            ExportFormat::Html => write!(f, "html"),
        }
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "script" | "python" | "py" => Ok(ExportFormat::Script),
            "code" | "code-only" => Ok(ExportFormat::CodeOnly),
            "markdown" | "md" => Ok(ExportFormat::Markdown),
            "html" => Ok(ExportFormat::Html),
            other => Err(format!("unknown export format '{other}'")),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExportedNotebook {
    pub path: PathBuf,
    pub output_path: PathBuf,
    pub format: String,
}

struct CachedDoc {
    modified: Option<SystemTime>,
    notebook: Notebook,
}

#[derive(Default)]
pub struct NotebookService {
    registry: KernelRegistry,
    locks: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
    cache: StdMutex<HashMap<PathBuf, CachedDoc>>,
    default_timeout: Option<Duration>,
}

impl NotebookService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        NotebookService {
            default_timeout: Some(timeout),
            ..Self::default()
        }
    }

    fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    fn mtime(path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
    }

    fn remember(&self, path: &Path, notebook: &Notebook) {
        self.cache.lock().unwrap().insert(
            path.to_path_buf(),
            CachedDoc {
                modified: Self::mtime(path),
                notebook: notebook.clone(),
            },
        );
    }

    /// Cached load. The cache entry is only trusted while the file's
    /// mtime matches; anything else re-reads from disk.
    fn load_cached(&self, path: &Path) -> Result<Notebook> {
        let modified = Self::mtime(path);
        if let Some(cached) = self.cache.lock().unwrap().get(path) {
            if modified.is_some() && cached.modified == modified {
                return Ok(cached.notebook.clone());
            }
        }
        let notebook = document::load(path)?;
        self.remember(path, &notebook);
        Ok(notebook)
    }

    /// Backup, re-load, mutate, atomic save, refresh cache. All under the
    /// document's lock so concurrent mutations serialize.
    async fn with_document_mut<T>(
        &self,
        path: &Path,
        mutate: impl FnOnce(&mut Notebook) -> Result<T>,
    ) -> Result<(T, PathBuf)> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        let backup_path = backup::snapshot(path)?;
        let mut notebook = document::load(path)?;
        let value = mutate(&mut notebook)?;
        document::save(path, &notebook)?;
        self.remember(path, &notebook);
        Ok((value, backup_path))
    }

    fn resolve_spec(notebook: &Notebook, override_spec: Option<&str>) -> String {
        override_spec
            .map(|s| s.to_string())
            .or_else(|| document::kernelspec_name(notebook))
            .unwrap_or_else(|| DEFAULT_SPEC.to_string())
    }

    fn cell_summary(index: usize, cell: &Cell, include_outputs: bool) -> CellSummary {
        let (execution_count, outputs) = match cell {
            Cell::Code {
                execution_count,
                outputs,
                ..
            } => (
                *execution_count,
                include_outputs.then(|| {
                    outputs
                        .iter()
                        .map(nb_export::output_plain_text)
                        .filter(|t| !t.is_empty())
                        .collect()
                }),
            ),
            _ => (None, None),
        };
        CellSummary {
            index,
            id: cell.id().to_string(),
            cell_type: cells::kind_of(cell),
            source: cells::source_of(cell),
            execution_count,
            outputs,
        }
    }

    // ------------------------------------------------------------------
    // Document operations
    // ------------------------------------------------------------------

    pub async fn read_notebook(
        &self,
        path: &Path,
        include_outputs: bool,
    ) -> Result<NotebookOverview> {
        let notebook = self.load_cached(path)?;
        Ok(NotebookOverview {
            path: path.to_path_buf(),
            title: document::title(&notebook),
            spec_name: document::kernelspec_name(&notebook),
            format_version: document::format_version(&notebook),
            cell_count: notebook.cells.len(),
            cells: notebook
                .cells
                .iter()
                .enumerate()
                .map(|(i, c)| Self::cell_summary(i, c, include_outputs))
                .collect(),
        })
    }

    pub async fn get_cell(&self, path: &Path, index: usize) -> Result<CellSummary> {
        let notebook = self.load_cached(path)?;
        let cell = cells::get(&notebook.cells, index)?;
        Ok(Self::cell_summary(index, cell, true))
    }

    pub async fn list_notebooks(&self, directory: &Path) -> Result<Vec<NotebookFileInfo>> {
        let entries = std::fs::read_dir(directory).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => NotebookError::NotFound(directory.to_path_buf()),
            _ => NotebookError::ReadFailed {
                path: directory.to_path_buf(),
                detail: e.to_string(),
            },
        })?;

        let mut notebooks = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ipynb") {
                continue;
            }
            let notebook = match document::load(&path) {
                Ok(nb) => nb,
                Err(e) => {
                    warn!("skipping {:?}: {}", path, e);
                    continue;
                }
            };
            let meta = entry.metadata().ok();
            notebooks.push(NotebookFileInfo {
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size_bytes: meta.as_ref().map(|m| m.len()).unwrap_or(0),
                modified: meta
                    .and_then(|m| m.modified().ok())
                    .map(|t| DateTime::<Local>::from(t).to_rfc3339()),
                cell_count: notebook.cells.len(),
                title: document::title(&notebook),
                path,
            });
        }
        notebooks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(notebooks)
    }

    pub async fn create_notebook(
        &self,
        path: &Path,
        title: &str,
        overwrite: bool,
    ) -> Result<CreatedNotebook> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        if path.exists() && !overwrite {
            return Err(NotebookError::AlreadyExists(path.to_path_buf()));
        }
        let notebook = document::new_document(title)?;
        document::save(path, &notebook)?;
        self.remember(path, &notebook);
        info!("created notebook {:?}", path);
        Ok(CreatedNotebook {
            path: path.to_path_buf(),
            cell_count: notebook.cells.len(),
        })
    }

    pub async fn backup_notebook(&self, path: &Path) -> Result<BackedUpNotebook> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        let backup = backup::snapshot(path)?;
        Ok(BackedUpNotebook {
            path: path.to_path_buf(),
            backup,
        })
    }

    pub async fn get_notebook_metadata(&self, path: &Path) -> Result<NotebookStats> {
        let notebook = self.load_cached(path)?;
        let meta = std::fs::metadata(path).ok();

        let mut code_cells = 0;
        let mut markdown_cells = 0;
        let mut raw_cells = 0;
        let mut executed_cells = 0;
        let mut cells_with_outputs = 0;
        for cell in &notebook.cells {
            match cell {
                Cell::Code {
                    execution_count,
                    outputs,
                    ..
                } => {
                    code_cells += 1;
                    if execution_count.is_some() {
                        executed_cells += 1;
                    }
                    if !outputs.is_empty() {
                        cells_with_outputs += 1;
                    }
                }
                Cell::Markdown { .. } => markdown_cells += 1,
                Cell::Raw { .. } => raw_cells += 1,
            }
        }

        Ok(NotebookStats {
            path: path.to_path_buf(),
            format_version: document::format_version(&notebook),
            title: document::title(&notebook),
            spec_name: document::kernelspec_name(&notebook),
            size_bytes: meta.as_ref().map(|m| m.len()).unwrap_or(0),
            modified: meta
                .and_then(|m| m.modified().ok())
                .map(|t| DateTime::<Local>::from(t).to_rfc3339()),
            cell_count: notebook.cells.len(),
            code_cells,
            markdown_cells,
            raw_cells,
            executed_cells,
            cells_with_outputs,
        })
    }

    // ------------------------------------------------------------------
    // Cell mutations
    // ------------------------------------------------------------------

    pub async fn add_cell(
        &self,
        path: &Path,
        kind: CellKind,
        source: &str,
        index: Option<usize>,
    ) -> Result<CellMutation> {
        let ((index, cell_id, cell_count), backup) = self
            .with_document_mut(path, |nb| {
                let index = index.unwrap_or(nb.cells.len());
                let id = cells::insert(&mut nb.cells, index, kind, source)?;
                Ok((index, id.to_string(), nb.cells.len()))
            })
            .await?;
        Ok(CellMutation {
            path: path.to_path_buf(),
            index,
            cell_id,
            cell_count,
            backup,
        })
    }

    pub async fn modify_cell(
        &self,
        path: &Path,
        index: usize,
        source: &str,
    ) -> Result<CellMutation> {
        let ((cell_id, cell_count), backup) = self
            .with_document_mut(path, |nb| {
                cells::modify(&mut nb.cells, index, source)?;
                Ok((nb.cells[index].id().to_string(), nb.cells.len()))
            })
            .await?;
        Ok(CellMutation {
            path: path.to_path_buf(),
            index,
            cell_id,
            cell_count,
            backup,
        })
    }

    pub async fn delete_cell(&self, path: &Path, index: usize) -> Result<DeletedCell> {
        let ((cell_type, cell_count), backup) = self
            .with_document_mut(path, |nb| {
                let removed = cells::delete(&mut nb.cells, index)?;
                Ok((cells::kind_of(&removed), nb.cells.len()))
            })
            .await?;
        Ok(DeletedCell {
            path: path.to_path_buf(),
            index,
            cell_type,
            cell_count,
            backup,
        })
    }

    pub async fn move_cell(&self, path: &Path, from: usize, to: usize) -> Result<MovedCell> {
        let (_, backup) = self
            .with_document_mut(path, |nb| cells::move_cell(&mut nb.cells, from, to))
            .await?;
        Ok(MovedCell {
            path: path.to_path_buf(),
            from_index: from,
            to_index: to,
            backup,
        })
    }

    pub async fn duplicate_cell(&self, path: &Path, index: usize) -> Result<CellMutation> {
        let ((new_index, cell_id, cell_count), backup) = self
            .with_document_mut(path, |nb| {
                let (new_index, id) = cells::duplicate(&mut nb.cells, index)?;
                Ok((new_index, id.to_string(), nb.cells.len()))
            })
            .await?;
        Ok(CellMutation {
            path: path.to_path_buf(),
            index: new_index,
            cell_id,
            cell_count,
            backup,
        })
    }

    pub async fn clear_outputs(
        &self,
        path: &Path,
        index: Option<usize>,
    ) -> Result<ClearedOutputs> {
        let (cells_cleared, backup) = self
            .with_document_mut(path, |nb| cells::clear_outputs(&mut nb.cells, index))
            .await?;
        Ok(ClearedOutputs {
            path: path.to_path_buf(),
            cells_cleared,
            backup,
        })
    }

    pub async fn change_cell_type(
        &self,
        path: &Path,
        index: usize,
        kind: CellKind,
    ) -> Result<ChangedCellType> {
        let (_, backup) = self
            .with_document_mut(path, |nb| cells::change_type(&mut nb.cells, index, kind))
            .await?;
        Ok(ChangedCellType {
            path: path.to_path_buf(),
            index,
            cell_type: kind,
            backup,
        })
    }

    // ------------------------------------------------------------------
    // Text scans
    // ------------------------------------------------------------------

    pub async fn search_cells(
        &self,
        path: &Path,
        term: &str,
        case_sensitive: bool,
    ) -> Result<SearchResults> {
        let notebook = self.load_cached(path)?;
        Ok(SearchResults {
            path: path.to_path_buf(),
            term: term.to_string(),
            case_sensitive,
            matches: scan::search_cells(&notebook.cells, term, case_sensitive),
        })
    }

    pub async fn analyze_dependencies(&self, path: &Path) -> Result<DependencyResults> {
        let notebook = self.load_cached(path)?;
        Ok(DependencyResults {
            path: path.to_path_buf(),
            dependencies: scan::analyze_dependencies(&notebook.cells),
        })
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .or(self.default_timeout)
            .unwrap_or(execution::DEFAULT_TIMEOUT)
    }

    /// Execute one code cell and persist its results.
    ///
    /// The document is not locked while the kernel runs. Results are
    /// merged back by cell id, so structural edits made during execution
    /// survive; if the cell was deleted meanwhile, the results are
    /// dropped.
    pub async fn execute_cell(
        &self,
        path: &Path,
        index: usize,
        spec_override: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<ExecutedCell> {
        let timeout = self.timeout(timeout);
        let notebook = self.load_cached(path)?;
        let cell = cells::get(&notebook.cells, index)?;
        if cells::kind_of(cell) != CellKind::Code {
            return Err(NotebookError::NotACodeCell {
                index,
                kind: cells::kind_of(cell).to_string(),
            });
        }
        let cell_id = cell.id().to_string();
        let source = cells::source_of(cell);
        let spec = Self::resolve_spec(&notebook, spec_override);
        drop(notebook);

        let handle = self.registry.session(&spec);
        let queued_generation = handle.generation.load(Ordering::SeqCst);
        let mut session = handle.session.lock().await;
        // A restart while we waited in the queue abandons this submission.
        if handle.generation.load(Ordering::SeqCst) != queued_generation {
            return Err(NotebookError::KernelRestarted);
        }
        let run = execution::execute(&mut session, &source, timeout).await?;
        drop(session);

        let (persisted, backup) = self
            .with_document_mut(path, |nb| {
                match nb.cells.iter_mut().find(|c| c.id().as_str() == cell_id) {
                    Some(cell) => {
                        execution::apply_run_to_cell(cell, &run);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await?;
        if !persisted {
            warn!(
                "cell {} vanished from {:?} during execution, results dropped",
                cell_id, path
            );
        }

        Ok(ExecutedCell {
            path: path.to_path_buf(),
            index,
            cell_id,
            run,
            backup,
        })
    }

    fn merge_reports(nb: &mut Notebook, reports: &[execution::CellReport]) {
        for report in reports {
            if let Some(cell) = nb
                .cells
                .iter_mut()
                .find(|c| c.id().as_str() == report.cell_id)
            {
                execution::apply_run_to_cell(cell, &report.run);
            }
        }
    }

    /// Execute every code cell in order, then merge all results back into
    /// the document in one backup-and-persist step.
    ///
    /// The kernel ran every completed cell for real, so even when the run
    /// is cut short by a timeout or a lost kernel, the results collected
    /// up to that point are persisted before the error surfaces.
    pub async fn execute_notebook(
        &self,
        path: &Path,
        spec_override: Option<&str>,
        timeout_per_cell: Option<Duration>,
        continue_on_error: bool,
    ) -> Result<ExecutedNotebook> {
        let timeout = self.timeout(timeout_per_cell);
        let mut working = self.load_cached(path)?;
        let spec = Self::resolve_spec(&working, spec_override);

        let handle = self.registry.session(&spec);
        let queued_generation = handle.generation.load(Ordering::SeqCst);
        let mut session = handle.session.lock().await;
        if handle.generation.load(Ordering::SeqCst) != queued_generation {
            return Err(NotebookError::KernelRestarted);
        }
        let (run, infra_error) =
            execution::execute_cells(&mut session, &mut working.cells, timeout, continue_on_error)
                .await;
        drop(session);

        if let Some(err) = infra_error {
            if !run.reports.is_empty() {
                self.with_document_mut(path, |nb| {
                    Self::merge_reports(nb, &run.reports);
                    Ok(())
                })
                .await?;
                warn!(
                    "run on {:?} stopped at cell {:?}; kept {} completed cells: {}",
                    path,
                    run.stopped_at,
                    run.reports.len(),
                    err
                );
            }
            return Err(err);
        }

        let (_, backup) = self
            .with_document_mut(path, |nb| {
                Self::merge_reports(nb, &run.reports);
                Ok(())
            })
            .await?;

        Ok(ExecutedNotebook {
            path: path.to_path_buf(),
            run,
            backup,
        })
    }

    // ------------------------------------------------------------------
    // Kernel management
    // ------------------------------------------------------------------

    /// Restart the kernel for `spec_name` and clear execution counts on
    /// every open document bound to it; those counts refer to a process
    /// that no longer exists.
    pub async fn restart_kernel(&self, spec_name: &str) -> Result<RestartedKernel> {
        let handle =
            self.registry
                .existing(spec_name)
                .ok_or_else(|| NotebookError::BackendUnavailable {
                    spec: spec_name.to_string(),
                    detail: "no session for this spec".to_string(),
                })?;
        {
            let mut session = handle.session.lock().await;
            session.restart().await?;
        }

        let bound: Vec<PathBuf> = {
            let cache = self.cache.lock().unwrap();
            cache
                .iter()
                .filter(|(_, doc)| {
                    document::kernelspec_name(&doc.notebook)
                        .unwrap_or_else(|| DEFAULT_SPEC.to_string())
                        == spec_name
                })
                .map(|(p, _)| p.clone())
                .collect()
        };

        let mut cleared_documents = Vec::new();
        for path in bound {
            let result = self
                .with_document_mut(&path, |nb| {
                    for cell in nb.cells.iter_mut() {
                        if let Cell::Code {
                            execution_count, ..
                        } = cell
                        {
                            *execution_count = None;
                        }
                    }
                    Ok(())
                })
                .await;
            match result {
                Ok(_) => cleared_documents.push(path),
                Err(e) => warn!("could not clear counts on {:?}: {}", path, e),
            }
        }

        Ok(RestartedKernel {
            spec_name: spec_name.to_string(),
            cleared_documents,
        })
    }

    /// Cooperative interrupt of the running kernel for `spec_name`.
    pub async fn interrupt_kernel(&self, spec_name: &str) -> Result<()> {
        self.registry.interrupt(spec_name).await
    }

    pub async fn list_kernels(&self) -> Result<KernelList> {
        let specs = runtimelib::list_kernelspecs().await;
        Ok(KernelList {
            available: specs
                .into_iter()
                .map(|s| KernelspecSummary {
                    name: s.kernel_name,
                    display_name: s.kernelspec.display_name,
                    language: s.kernelspec.language,
                })
                .collect(),
            sessions: self.registry.active(),
        })
    }

    /// Shut down every kernel session.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }

    // ------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------

    pub async fn export_notebook(
        &self,
        path: &Path,
        format: ExportFormat,
        output: Option<PathBuf>,
    ) -> Result<ExportedNotebook> {
        let notebook = self.load_cached(path)?;
        let rendered = match format {
            ExportFormat::Script => nb_export::to_script(&notebook, false),
            ExportFormat::CodeOnly => nb_export::to_script(&notebook, true),
            ExportFormat::Markdown => nb_export::to_markdown(&notebook),
            ExportFormat::Html => nb_export::to_html(&notebook),
        };
        let output_path =
            output.unwrap_or_else(|| path.with_extension(format.default_extension()));
        std::fs::write(&output_path, rendered).map_err(|e| NotebookError::WriteFailed {
            path: output_path.clone(),
            detail: e.to_string(),
        })?;
        info!("exported {:?} as {} to {:?}", path, format, output_path);
        Ok(ExportedNotebook {
            path: path.to_path_buf(),
            output_path,
            format: format.to_string(),
        })
    }
}
