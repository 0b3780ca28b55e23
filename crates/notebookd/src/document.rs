//! Document store: loading and persisting `.ipynb` files.
//!
//! Every load re-derives the in-memory document from the file; nothing is
//! trusted across calls. Saves are atomic: the serialized document is
//! written to a sibling temporary file and renamed into place, so a failed
//! save never corrupts the original.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;
use nbformat::v4::Notebook;
use serde_json::json;
use uuid::Uuid;

use crate::error::{NotebookError, Result};

/// Load and parse a notebook document.
///
/// Legacy v4 minor versions are upgraded to v4.5 in memory; the file on
/// disk is only rewritten in the upgraded format on the next save.
pub fn load(path: &Path) -> Result<Notebook> {
    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => NotebookError::NotFound(path.to_path_buf()),
        _ => NotebookError::ReadFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    })?;

    let parsed = nbformat::parse_notebook(&content).map_err(|e| NotebookError::MalformedDocument {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    match parsed {
        nbformat::Notebook::V4(nb) => Ok(nb),
        nbformat::Notebook::Legacy(legacy) => {
            debug!("upgrading legacy notebook {:?} to v4.5", path);
            nbformat::upgrade_legacy_notebook(legacy).map_err(|e| {
                NotebookError::MalformedDocument {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                }
            })
        }
    }
}

/// Persist a notebook document atomically.
pub fn save(path: &Path, notebook: &Notebook) -> Result<()> {
    let json = nbformat::serialize_notebook(&nbformat::Notebook::V4(notebook.clone())).map_err(
        |e| NotebookError::WriteFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    )?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| NotebookError::WriteFailed {
            path: path.to_path_buf(),
            detail: "path has no file name".to_string(),
        })?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| NotebookError::WriteFailed {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        }
    }

    // Temp file in the same directory so the rename never crosses a
    // filesystem boundary.
    let tmp: PathBuf = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));
    std::fs::write(&tmp, &json).map_err(|e| NotebookError::WriteFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    if let Err(e) = std::fs::rename(&tmp, path) {
        std::fs::remove_file(&tmp).ok();
        return Err(NotebookError::WriteFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        });
    }

    debug!("saved {:?} ({} bytes)", path, json.len());
    Ok(())
}

/// Build a fresh notebook document seeded with python3 kernel metadata, a
/// title markdown cell and one starter code cell.
///
/// The document is constructed as raw nbformat JSON and run through the
/// same parser as `load`, so a seeded document is valid by construction.
pub fn new_document(title: &str) -> Result<Notebook> {
    let raw = json!({
        "nbformat": 4,
        "nbformat_minor": 5,
        "metadata": {
            "kernelspec": {
                "name": "python3",
                "display_name": "Python 3",
                "language": "python"
            },
            "language_info": {
                "name": "python",
                "mimetype": "text/x-python",
                "file_extension": ".py"
            },
            "title": title
        },
        "cells": [
            {
                "id": Uuid::new_v4().to_string(),
                "cell_type": "markdown",
                "metadata": {},
                "source": [format!("# {}", title)]
            },
            {
                "id": Uuid::new_v4().to_string(),
                "cell_type": "code",
                "metadata": {},
                "execution_count": null,
                "outputs": [],
                "source": ["# Your code here"]
            }
        ]
    });

    match nbformat::parse_notebook(&raw.to_string()).map_err(|e| {
        NotebookError::MalformedDocument {
            path: PathBuf::from(title),
            detail: e.to_string(),
        }
    })? {
        nbformat::Notebook::V4(nb) => Ok(nb),
        nbformat::Notebook::Legacy(_) => Err(NotebookError::MalformedDocument {
            path: PathBuf::from(title),
            detail: "seed template parsed as legacy".to_string(),
        }),
    }
}

/// Kernelspec name recorded in the document metadata, if any.
pub fn kernelspec_name(notebook: &Notebook) -> Option<String> {
    notebook.metadata.kernelspec.as_ref().map(|k| k.name.clone())
}

/// Title from document metadata, if present.
pub fn title(notebook: &Notebook) -> Option<String> {
    notebook
        .metadata
        .additional
        .get("title")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn format_version(notebook: &Notebook) -> String {
    format!("{}.{}", notebook.nbformat, notebook.nbformat_minor)
}
