//! Kernel session and notebook mutation engine.
//!
//! Manages `.ipynb` documents on disk and live Jupyter kernel sessions:
//! atomic loads and saves, timestamped pre-mutation backups, ordered cell
//! edits, kernel launch/interrupt/restart/shutdown, and execution with
//! output collection and hard timeouts. [`NotebookService`] is the
//! front door; the modules underneath are usable on their own.

pub mod backup;
pub mod cells;
pub mod document;
pub mod error;
pub mod execution;
pub mod kernel;
pub mod registry;
pub mod scan;
pub mod service;

pub use error::{NotebookError, Result};
pub use service::NotebookService;
