//! Kernel session lifecycle: launch, handshake, event stream, interrupt,
//! restart, shutdown.
//!
//! One `KernelSession` exists per kernelspec name. The session owns the
//! kernel process, a connection file under the Jupyter runtime dir, an
//! iopub listener task and the shell writer half. Iopub traffic is
//! converted to nbformat-style output JSON and broadcast as `KernelEvent`s
//! tagged with the parent msg_id, so a collector can keep its own
//! submission's results and discard everything else.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest, InterruptRequest, JupyterMessage, JupyterMessageContent,
    KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{NotebookError, Result};

/// Session lifecycle states, serialized snake_case for status payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unstarted,
    Starting,
    Idle,
    Busy,
    Interrupting,
    Restarting,
    Dead,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Unstarted => write!(f, "unstarted"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Idle => write!(f, "idle"),
            SessionState::Busy => write!(f, "busy"),
            SessionState::Interrupting => write!(f, "interrupting"),
            SessionState::Restarting => write!(f, "restarting"),
            SessionState::Dead => write!(f, "dead"),
        }
    }
}

/// Iopub traffic reduced to what a result collector needs. Every event
/// carries the msg_id of the execute_request it answers.
#[derive(Debug, Clone)]
pub enum KernelEvent {
    Status {
        parent_msg_id: Option<String>,
        idle: bool,
    },
    ExecuteStarted {
        parent_msg_id: Option<String>,
        execution_count: i32,
    },
    Output {
        parent_msg_id: Option<String>,
        output: serde_json::Value,
    },
    ConnectionLost,
}

/// Enough to open a control connection without holding the session lock.
/// Interrupts go through this so a busy session can still be interrupted.
#[derive(Clone)]
pub struct ControlTarget {
    pub spec_name: String,
    pub connection_info: ConnectionInfo,
    pub session_id: String,
}

/// Open a fresh control connection and send an interrupt_request.
pub async fn send_interrupt(target: &ControlTarget) -> Result<()> {
    let mut control = runtimelib::create_client_control_connection(
        &target.connection_info,
        &target.session_id,
    )
    .await
    .map_err(|e| NotebookError::BackendUnavailable {
        spec: target.spec_name.clone(),
        detail: e.to_string(),
    })?;

    let request: JupyterMessage = InterruptRequest {}.into();
    control
        .send(request)
        .await
        .map_err(|e| NotebookError::BackendUnavailable {
            spec: target.spec_name.clone(),
            detail: e.to_string(),
        })?;
    info!("sent interrupt_request to '{}'", target.spec_name);
    Ok(())
}

/// Convert iopub message content to nbformat-style output JSON.
///
/// jupyter_protocol serializes as `{"ExecuteResult": {...}}`; nbformat
/// expects `{"output_type": "execute_result", ...}`.
fn message_content_to_output(content: &JupyterMessageContent) -> Option<serde_json::Value> {
    use serde_json::json;

    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            Some(json!({
                "output_type": "stream",
                "name": name,
                "text": stream.text
            }))
        }
        JupyterMessageContent::DisplayData(data) => Some(json!({
            "output_type": "display_data",
            "data": data.data,
            "metadata": data.metadata
        })),
        JupyterMessageContent::ExecuteResult(result) => Some(json!({
            "output_type": "execute_result",
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0
        })),
        JupyterMessageContent::ErrorOutput(error) => Some(json!({
            "output_type": "error",
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        })),
        _ => None,
    }
}

pub struct KernelSession {
    spec_name: String,
    state: SessionState,
    /// Bumped on every restart or shutdown. Submissions capture the value
    /// before queueing and fail `KernelRestarted` when it moved.
    generation: Arc<AtomicU64>,
    control: Arc<StdMutex<Option<ControlTarget>>>,
    session_id: String,
    connection_file: Option<PathBuf>,
    process: Option<tokio::process::Child>,
    iopub_task: Option<tokio::task::JoinHandle<()>>,
    shell_reader_task: Option<tokio::task::JoinHandle<()>>,
    shell_writer: Option<runtimelib::DealerSendConnection>,
    events_tx: broadcast::Sender<KernelEvent>,
    last_execution_count: Option<i32>,
}

impl KernelSession {
    pub fn new(spec_name: &str) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        KernelSession {
            spec_name: spec_name.to_string(),
            state: SessionState::Unstarted,
            generation: Arc::new(AtomicU64::new(0)),
            control: Arc::new(StdMutex::new(None)),
            session_id: Uuid::new_v4().to_string(),
            connection_file: None,
            process: None,
            iopub_task: None,
            shell_reader_task: None,
            shell_writer: None,
            events_tx,
            last_execution_count: None,
        }
    }

    pub fn spec_name(&self) -> &str {
        &self.spec_name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn generation_counter(&self) -> Arc<AtomicU64> {
        self.generation.clone()
    }

    pub(crate) fn control_target(&self) -> Arc<StdMutex<Option<ControlTarget>>> {
        self.control.clone()
    }

    pub fn last_execution_count(&self) -> Option<i32> {
        self.last_execution_count
    }

    pub(crate) fn note_execution_count(&mut self, count: i32) {
        self.last_execution_count = Some(count);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events_tx.subscribe()
    }

    fn backend_err(&self, detail: impl std::fmt::Display) -> NotebookError {
        NotebookError::BackendUnavailable {
            spec: self.spec_name.clone(),
            detail: detail.to_string(),
        }
    }

    /// Start the kernel if this session has never started or its process
    /// died. A dead process is detected here, never silently reused.
    pub async fn ensure_started(&mut self) -> Result<()> {
        let process_exited = self
            .process
            .as_mut()
            .map(|child| matches!(child.try_wait(), Ok(Some(_))))
            .unwrap_or(false);
        if process_exited {
            warn!("kernel process for '{}' exited, tearing down", self.spec_name);
            self.teardown().await;
        }
        match self.state {
            SessionState::Unstarted | SessionState::Dead => self.start().await,
            _ => Ok(()),
        }
    }

    async fn start(&mut self) -> Result<()> {
        self.state = SessionState::Starting;

        let kernelspec = runtimelib::find_kernelspec(&self.spec_name)
            .await
            .map_err(|e| {
                self.state = SessionState::Dead;
                self.backend_err(e)
            })?;

        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5)
            .await
            .map_err(|e| self.backend_err(e))?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(self.spec_name.clone()),
        };

        let runtime_dir = runtimelib::dirs::runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir)
            .await
            .map_err(|e| self.backend_err(e))?;

        let kernel_id = petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file_path =
            runtime_dir.join(format!("notebookd-kernel-{}.json", kernel_id));

        let connection_json = serde_json::to_string_pretty(&connection_info)
            .map_err(|e| self.backend_err(e))?;
        tokio::fs::write(&connection_file_path, connection_json)
            .await
            .map_err(|e| NotebookError::WriteFailed {
                path: connection_file_path.clone(),
                detail: e.to_string(),
            })?;

        info!(
            "starting kernel '{}' at {:?}",
            self.spec_name, connection_file_path
        );

        let process = kernelspec
            .command(&connection_file_path, Some(Stdio::null()), Some(Stdio::null()))
            .map_err(|e| self.backend_err(e))?
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.backend_err(e))?;

        // Let the kernel bind its sockets before we connect.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        self.session_id = Uuid::new_v4().to_string();

        let mut iopub =
            runtimelib::create_client_iopub_connection(&connection_info, "", &self.session_id)
                .await
                .map_err(|e| self.backend_err(e))?;

        let events_tx = self.events_tx.clone();
        let iopub_task = tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        debug!(
                            "iopub: type={} parent_msg_id={:?}",
                            message.header.msg_type,
                            message.parent_header.as_ref().map(|h| &h.msg_id)
                        );

                        let parent_msg_id =
                            message.parent_header.as_ref().map(|h| h.msg_id.clone());

                        let event = match &message.content {
                            JupyterMessageContent::Status(status) => Some(KernelEvent::Status {
                                parent_msg_id,
                                idle: status.execution_state
                                    == jupyter_protocol::ExecutionState::Idle,
                            }),
                            JupyterMessageContent::ExecuteInput(input) => {
                                Some(KernelEvent::ExecuteStarted {
                                    parent_msg_id,
                                    execution_count: input.execution_count.0 as i32,
                                })
                            }
                            other => message_content_to_output(other)
                                .map(|output| KernelEvent::Output { parent_msg_id, output }),
                        };

                        if let Some(event) = event {
                            let _ = events_tx.send(event);
                        }
                    }
                    Err(e) => {
                        error!("iopub read error: {}", e);
                        let _ = events_tx.send(KernelEvent::ConnectionLost);
                        break;
                    }
                }
            }
        });

        let identity = runtimelib::peer_identity_for_session(&self.session_id)
            .map_err(|e| self.backend_err(e))?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &self.session_id,
            identity,
        )
        .await
        .map_err(|e| self.backend_err(e))?;

        // Handshake: the kernel is alive once it answers kernel_info.
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await.map_err(|e| self.backend_err(e))?;

        let reply =
            tokio::time::timeout(std::time::Duration::from_secs(30), shell.read()).await;
        match reply {
            Ok(Ok(msg)) => {
                info!("kernel '{}' alive: {} reply", self.spec_name, msg.header.msg_type);
            }
            Ok(Err(e)) => {
                iopub_task.abort();
                self.state = SessionState::Dead;
                return Err(self.backend_err(format!("kernel did not respond: {e}")));
            }
            Err(_) => {
                iopub_task.abort();
                self.state = SessionState::Dead;
                return Err(self.backend_err("kernel did not respond within 30s"));
            }
        }

        let (shell_writer, mut shell_reader) = shell.split();

        let spec = self.spec_name.clone();
        let shell_reader_task = tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(msg) => {
                        debug!("shell reply from '{}': type={}", spec, msg.header.msg_type);
                    }
                    Err(e) => {
                        error!("shell read error: {}", e);
                        break;
                    }
                }
            }
        });

        *self.control.lock().unwrap() = Some(ControlTarget {
            spec_name: self.spec_name.clone(),
            connection_info,
            session_id: self.session_id.clone(),
        });
        self.connection_file = Some(connection_file_path);
        self.process = Some(process);
        self.iopub_task = Some(iopub_task);
        self.shell_reader_task = Some(shell_reader_task);
        self.shell_writer = Some(shell_writer);
        self.state = SessionState::Idle;

        info!("kernel '{}' started: {}", self.spec_name, kernel_id);
        Ok(())
    }

    /// Send an execute_request and return its msg_id. The session is Busy
    /// until the collector observes the matching idle status.
    pub async fn send_execute(&mut self, code: &str) -> Result<String> {
        let spec = self.spec_name.clone();
        let shell = self
            .shell_writer
            .as_mut()
            .ok_or(NotebookError::BackendUnavailable {
                spec: spec.clone(),
                detail: "no kernel connection".to_string(),
            })?;

        let request = ExecuteRequest::new(code.to_string());
        let message: JupyterMessage = request.into();
        let msg_id = message.header.msg_id.clone();

        shell
            .send(message)
            .await
            .map_err(|e| NotebookError::BackendUnavailable {
                spec,
                detail: e.to_string(),
            })?;
        self.state = SessionState::Busy;
        debug!("sent execute_request: msg_id={}", msg_id);
        Ok(msg_id)
    }

    /// Cooperative interrupt. No-op unless an execution is in flight; the
    /// kernel decides when to stop.
    pub async fn interrupt(&mut self) -> Result<()> {
        if !matches!(self.state, SessionState::Busy | SessionState::Interrupting) {
            return Ok(());
        }
        let target = self.control.lock().unwrap().clone();
        let target = target.ok_or_else(|| self.backend_err("no running kernel"))?;
        self.state = SessionState::Interrupting;
        send_interrupt(&target).await
    }

    /// Kill the current process and launch a fresh one. All execution
    /// state in the kernel is lost; pending submissions against the old
    /// process fail `KernelRestarted` via the generation bump.
    pub async fn restart(&mut self) -> Result<()> {
        info!("restarting kernel '{}'", self.spec_name);
        self.state = SessionState::Restarting;
        self.teardown().await;
        self.start().await
    }

    /// Graceful-then-forceful shutdown. The session ends Dead and is never
    /// reused; the registry creates a fresh one on the next request.
    pub async fn shutdown(&mut self) {
        info!("shutting down kernel '{}'", self.spec_name);
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }
        if let Some(task) = self.shell_reader_task.take() {
            task.abort();
        }
        self.shell_writer = None;

        let target = self.control.lock().unwrap().take();
        if let Some(target) = target {
            if let Ok(mut control) = runtimelib::create_client_control_connection(
                &target.connection_info,
                &target.session_id,
            )
            .await
            {
                let request: JupyterMessage = ShutdownRequest { restart: false }.into();
                control.send(request).await.ok();
            }
        }

        if let Some(mut child) = self.process.take() {
            child.start_kill().ok();
        }
        if let Some(path) = self.connection_file.take() {
            tokio::fs::remove_file(path).await.ok();
        }

        self.last_execution_count = None;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state = SessionState::Dead;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Unstarted.to_string(), "unstarted");
        assert_eq!(SessionState::Starting.to_string(), "starting");
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::Busy.to_string(), "busy");
        assert_eq!(SessionState::Interrupting.to_string(), "interrupting");
        assert_eq!(SessionState::Restarting.to_string(), "restarting");
        assert_eq!(SessionState::Dead.to_string(), "dead");
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Interrupting).unwrap();
        assert_eq!(json, "\"interrupting\"");
    }

    #[test]
    fn test_new_session_is_unstarted() {
        let session = KernelSession::new("python3");
        assert_eq!(session.state(), SessionState::Unstarted);
        assert_eq!(session.spec_name(), "python3");
        assert_eq!(session.generation(), 0);
        assert!(session.last_execution_count().is_none());
        assert!(session.control_target().lock().unwrap().is_none());
    }

    #[test]
    fn test_stream_content_to_output() {
        let content = JupyterMessageContent::from_type_and_content(
            "stream",
            serde_json::json!({"name": "stdout", "text": "hello\n"}),
        )
        .unwrap();

        let output = message_content_to_output(&content).unwrap();
        assert_eq!(output["output_type"], "stream");
        assert_eq!(output["name"], "stdout");
        assert_eq!(output["text"], "hello\n");
    }

    #[test]
    fn test_error_content_to_output() {
        let content = JupyterMessageContent::from_type_and_content(
            "error",
            serde_json::json!({
                "ename": "ZeroDivisionError",
                "evalue": "division by zero",
                "traceback": ["Traceback...", "ZeroDivisionError: division by zero"]
            }),
        )
        .unwrap();

        let output = message_content_to_output(&content).unwrap();
        assert_eq!(output["output_type"], "error");
        assert_eq!(output["ename"], "ZeroDivisionError");
        assert_eq!(output["traceback"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_execute_result_to_output() {
        let content = JupyterMessageContent::from_type_and_content(
            "execute_result",
            serde_json::json!({
                "data": {"text/plain": "2"},
                "metadata": {},
                "execution_count": 1
            }),
        )
        .unwrap();

        let output = message_content_to_output(&content).unwrap();
        assert_eq!(output["output_type"], "execute_result");
        assert_eq!(output["execution_count"], 1);
    }

    #[test]
    fn test_status_is_not_an_output() {
        let content = JupyterMessageContent::from_type_and_content(
            "status",
            serde_json::json!({"execution_state": "idle"}),
        )
        .unwrap();
        assert!(message_content_to_output(&content).is_none());
    }
}
