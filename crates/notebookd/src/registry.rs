//! Registry of kernel sessions, one per kernelspec name.
//!
//! The registry is owned by the service; there are no ambient globals.
//! Each session sits behind an async mutex, which is also the FIFO queue
//! for submissions against that kernel. Interrupts bypass the mutex via
//! the session's control target, so a busy kernel can still be signalled.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex};

use log::info;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::{NotebookError, Result};
use crate::kernel::{send_interrupt, ControlTarget, KernelSession, SessionState};

/// Cheap handle to a session. The generation counter and control target
/// are shared with the session itself and readable without its lock.
#[derive(Clone)]
pub struct SessionHandle {
    pub session: Arc<Mutex<KernelSession>>,
    pub generation: Arc<AtomicU64>,
    pub control: Arc<StdMutex<Option<ControlTarget>>>,
}

#[derive(Debug, Serialize)]
pub struct ActiveKernel {
    pub spec_name: String,
    pub state: String,
}

#[derive(Default)]
pub struct KernelRegistry {
    sessions: StdMutex<HashMap<String, SessionHandle>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for `spec_name`, creating an unstarted session on first use.
    pub fn session(&self, spec_name: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(spec_name.to_string())
            .or_insert_with(|| {
                info!("creating kernel session for '{}'", spec_name);
                let session = KernelSession::new(spec_name);
                let generation = session.generation_counter();
                let control = session.control_target();
                SessionHandle {
                    session: Arc::new(Mutex::new(session)),
                    generation,
                    control,
                }
            })
            .clone()
    }

    pub fn existing(&self, spec_name: &str) -> Option<SessionHandle> {
        self.sessions.lock().unwrap().get(spec_name).cloned()
    }

    /// Interrupt without waiting for the session lock. A no-op unless an
    /// execution is in flight; fails when no session is known for this
    /// spec.
    pub async fn interrupt(&self, spec_name: &str) -> Result<()> {
        let handle = self
            .existing(spec_name)
            .ok_or_else(|| NotebookError::BackendUnavailable {
                spec: spec_name.to_string(),
                detail: "no running kernel".to_string(),
            })?;

        // A session whose lock is free has no submission in flight.
        if let Ok(session) = handle.session.try_lock() {
            if !matches!(
                session.state(),
                SessionState::Busy | SessionState::Interrupting
            ) {
                return Ok(());
            }
        }

        let target = handle.control.lock().unwrap().clone();
        match target {
            Some(target) => send_interrupt(&target).await,
            None => Err(NotebookError::BackendUnavailable {
                spec: spec_name.to_string(),
                detail: "no running kernel".to_string(),
            }),
        }
    }

    /// Snapshot of known sessions. A session whose lock is held is
    /// reported busy.
    pub fn active(&self) -> Vec<ActiveKernel> {
        let sessions = self.sessions.lock().unwrap();
        let mut kernels: Vec<ActiveKernel> = sessions
            .iter()
            .map(|(spec_name, handle)| {
                let state = handle
                    .session
                    .try_lock()
                    .map(|s| s.state())
                    .unwrap_or(SessionState::Busy);
                ActiveKernel {
                    spec_name: spec_name.clone(),
                    state: state.to_string(),
                }
            })
            .collect();
        kernels.sort_by(|a, b| a.spec_name.cmp(&b.spec_name));
        kernels
    }

    /// Shut down every session and forget them all.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.session.lock().await.shutdown().await;
        }
    }
}
