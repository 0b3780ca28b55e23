//! Regex scans over cell sources: dependency extraction and text search.
//!
//! Dependency scanning is a heuristic over top-level `import` statements
//! and `pip install` magics. Aliased or conditional imports inside
//! functions are not chased; false negatives are accepted.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use nbformat::v4::Cell;
use regex::Regex;
use serde::Serialize;

use crate::cells::{self, CellKind};

fn import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*import\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

fn from_import_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*from\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap())
}

fn pip_install_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*[!%]pip\s+install\s+(.+)$").unwrap())
}

#[derive(Debug, Serialize)]
pub struct DependencyReport {
    pub imported_modules: Vec<String>,
    pub pip_installs: Vec<String>,
}

/// Collect imported top-level modules and pip-installed packages from
/// every code cell.
pub fn analyze_dependencies(cell_list: &[Cell]) -> DependencyReport {
    let mut modules = BTreeSet::new();
    let mut installs = BTreeSet::new();

    for cell in cell_list {
        if cells::kind_of(cell) != CellKind::Code {
            continue;
        }
        let source = cells::source_of(cell);

        for caps in import_re().captures_iter(&source) {
            modules.insert(caps[1].to_string());
        }
        for caps in from_import_re().captures_iter(&source) {
            modules.insert(caps[1].to_string());
        }
        for caps in pip_install_re().captures_iter(&source) {
            for pkg in caps[1].split_whitespace() {
                if pkg.starts_with('-') {
                    // pip flag, e.g. -q or --upgrade
                    continue;
                }
                installs.insert(pkg.to_string());
            }
        }
    }

    DependencyReport {
        imported_modules: modules.into_iter().collect(),
        pip_installs: installs.into_iter().collect(),
    }
}

#[derive(Debug, Serialize)]
pub struct LineMatch {
    pub line_number: usize,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct SearchMatch {
    pub cell_index: usize,
    pub cell_type: CellKind,
    pub lines: Vec<LineMatch>,
}

/// Search every cell's source for `term`, reporting 1-based line numbers
/// per matching cell.
pub fn search_cells(cell_list: &[Cell], term: &str, case_sensitive: bool) -> Vec<SearchMatch> {
    let needle = if case_sensitive {
        term.to_string()
    } else {
        term.to_lowercase()
    };

    let mut matches = Vec::new();
    for (cell_index, cell) in cell_list.iter().enumerate() {
        let source = cells::source_of(cell);
        let lines: Vec<LineMatch> = source
            .lines()
            .enumerate()
            .filter(|(_, line)| {
                if case_sensitive {
                    line.contains(&needle)
                } else {
                    line.to_lowercase().contains(&needle)
                }
            })
            .map(|(i, line)| LineMatch {
                line_number: i + 1,
                content: line.to_string(),
            })
            .collect();

        if !lines.is_empty() {
            matches.push(SearchMatch {
                cell_index,
                cell_type: cells::kind_of(cell),
                lines,
            });
        }
    }
    matches
}
