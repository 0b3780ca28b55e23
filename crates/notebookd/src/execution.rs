//! Execution coordinator: submit source to a kernel session, collect its
//! outputs in emission order, race a hard wall-clock timeout.
//!
//! A backend-raised exception is a *successful* round trip whose result
//! is a failed `CellRun`; RPC-level failures (dead kernel, lost
//! connection, timeout) surface as errors. On timeout the kernel gets an
//! interrupt and any outputs collected so far are dropped with the run;
//! results of the stale submission are discarded by msg_id matching when
//! the next submission collects.

use std::time::Duration;

use log::{debug, warn};
use nbformat::v4::Cell;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;

use crate::cells;
use crate::error::{NotebookError, Result};
use crate::kernel::{KernelEvent, KernelSession, SessionState};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct RunError {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

/// Result of one execute_request round trip.
#[derive(Debug, Clone, Serialize)]
pub struct CellRun {
    pub success: bool,
    pub execution_count: Option<i32>,
    /// nbformat-style output JSON, in emission order.
    pub outputs: Vec<serde_json::Value>,
    pub error: Option<RunError>,
}

impl CellRun {
    /// Promote a failed run into an `ExecutionFailed` error. Used where a
    /// caller wants stop-on-failure semantics.
    pub fn into_result(self) -> Result<CellRun> {
        match &self.error {
            Some(err) if !self.success => Err(NotebookError::ExecutionFailed {
                ename: err.ename.clone(),
                evalue: err.evalue.clone(),
            }),
            _ => Ok(self),
        }
    }
}

/// Write a run's results into a code cell. Prior outputs are replaced,
/// never merged.
pub fn apply_run_to_cell(cell: &mut Cell, run: &CellRun) {
    if let Cell::Code {
        outputs,
        execution_count,
        ..
    } = cell
    {
        *outputs = run
            .outputs
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();
        *execution_count = run.execution_count;
    }
}

/// Execute `source` on the session and collect the run.
///
/// The caller holds the session's lock; queueing happens there. A session
/// found Busy here means the queue was bypassed, which is refused rather
/// than interleaved.
pub async fn execute(
    session: &mut KernelSession,
    source: &str,
    timeout: Duration,
) -> Result<CellRun> {
    if matches!(
        session.state(),
        SessionState::Busy | SessionState::Interrupting
    ) {
        return Err(NotebookError::SessionBusy(session.spec_name().to_string()));
    }

    session.ensure_started().await?;

    // Subscribe before sending so no event can slip past.
    let mut events = session.subscribe();
    let msg_id = session.send_execute(source).await?;
    let deadline = tokio::time::Instant::now() + timeout;

    let mut run = CellRun {
        success: true,
        execution_count: None,
        outputs: Vec::new(),
        error: None,
    };

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(KernelEvent::Status { parent_msg_id, idle }) => {
                        if idle && parent_msg_id.as_deref() == Some(msg_id.as_str()) {
                            break;
                        }
                    }
                    Ok(KernelEvent::ExecuteStarted { parent_msg_id, execution_count }) => {
                        if parent_msg_id.as_deref() == Some(msg_id.as_str()) {
                            run.execution_count = Some(execution_count);
                        }
                    }
                    Ok(KernelEvent::Output { parent_msg_id, output }) => {
                        if parent_msg_id.as_deref() != Some(msg_id.as_str()) {
                            // Stale output from a superseded submission.
                            debug!("discarding output for {:?}", parent_msg_id);
                            continue;
                        }
                        if output["output_type"] == "error" {
                            run.success = false;
                            run.error = Some(RunError {
                                ename: output["ename"].as_str().unwrap_or_default().to_string(),
                                evalue: output["evalue"].as_str().unwrap_or_default().to_string(),
                                traceback: output["traceback"]
                                    .as_array()
                                    .map(|lines| {
                                        lines
                                            .iter()
                                            .filter_map(|l| l.as_str())
                                            .map(|l| l.to_string())
                                            .collect()
                                    })
                                    .unwrap_or_default(),
                            });
                        }
                        run.outputs.push(output);
                    }
                    Ok(KernelEvent::ConnectionLost) => {
                        let spec = session.spec_name().to_string();
                        session.shutdown().await;
                        return Err(NotebookError::BackendUnavailable {
                            spec,
                            detail: "kernel connection lost".to_string(),
                        });
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("kernel event stream lagged by {} events", n);
                    }
                    Err(RecvError::Closed) => {
                        return Err(NotebookError::BackendUnavailable {
                            spec: session.spec_name().to_string(),
                            detail: "kernel event stream closed".to_string(),
                        });
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(
                    "execution on '{}' timed out after {:?}, interrupting",
                    session.spec_name(),
                    timeout
                );
                session.interrupt().await.ok();
                // The kernel aborts or finishes the stale request on its
                // own; its late results will not match any future msg_id.
                session.set_state(SessionState::Idle);
                return Err(NotebookError::TimedOut(timeout));
            }
        }
    }

    session.set_state(SessionState::Idle);
    if let Some(count) = run.execution_count {
        session.note_execution_count(count);
    }
    Ok(run)
}

#[derive(Debug, Serialize)]
pub struct CellReport {
    pub index: usize,
    pub cell_id: String,
    pub run: CellRun,
}

#[derive(Debug, Serialize)]
pub struct NotebookRun {
    pub reports: Vec<CellReport>,
    /// Index of the failing cell when the run stopped early.
    pub stopped_at: Option<usize>,
}

/// Execute every code cell in document order, writing results back into
/// the cells. Markdown and raw cells are skipped. Stops at the first
/// failed run unless `continue_on_error`. An infrastructure error stops
/// the run too; the kernel already ran the earlier cells, so the partial
/// run is handed back alongside the error for the caller to persist.
pub async fn execute_cells(
    session: &mut KernelSession,
    cell_list: &mut [Cell],
    timeout_per_cell: Duration,
    continue_on_error: bool,
) -> (NotebookRun, Option<NotebookError>) {
    let mut reports = Vec::new();
    let mut stopped_at = None;
    let mut infra_error = None;

    for index in 0..cell_list.len() {
        if cells::kind_of(&cell_list[index]) != cells::CellKind::Code {
            continue;
        }
        let source = cells::source_of(&cell_list[index]);
        let run = match execute(session, &source, timeout_per_cell).await {
            Ok(run) => run,
            Err(err) => {
                stopped_at = Some(index);
                infra_error = Some(err);
                break;
            }
        };
        apply_run_to_cell(&mut cell_list[index], &run);

        let failed = !run.success;
        reports.push(CellReport {
            index,
            cell_id: cell_list[index].id().to_string(),
            run,
        });

        if failed && !continue_on_error {
            stopped_at = Some(index);
            break;
        }
    }

    (NotebookRun { reports, stopped_at }, infra_error)
}
