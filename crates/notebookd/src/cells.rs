//! Pure, in-memory cell edits over an ordered cell list.
//!
//! Nothing here touches disk or kernels; the service layer wraps these in
//! backup-and-persist. Indices are positional at call time; identity across
//! structural edits is carried by each cell's uuid-backed `CellId`.

use std::collections::HashMap;
use std::str::FromStr;

use nbformat::v4::{Cell, CellId, CellMetadata};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NotebookError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellKind::Code => write!(f, "code"),
            CellKind::Markdown => write!(f, "markdown"),
            CellKind::Raw => write!(f, "raw"),
        }
    }
}

impl FromStr for CellKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "code" => Ok(CellKind::Code),
            "markdown" => Ok(CellKind::Markdown),
            "raw" => Ok(CellKind::Raw),
            other => Err(format!("unknown cell type '{other}'")),
        }
    }
}

pub fn kind_of(cell: &Cell) -> CellKind {
    match cell {
        Cell::Code { .. } => CellKind::Code,
        Cell::Markdown { .. } => CellKind::Markdown,
        Cell::Raw { .. } => CellKind::Raw,
    }
}

/// Joined source text of a cell.
pub fn source_of(cell: &Cell) -> String {
    match cell {
        Cell::Code { source, .. } => source.join(""),
        Cell::Markdown { source, .. } => source.join(""),
        Cell::Raw { source, .. } => source.join(""),
    }
}

/// Convert source text to nbformat's line list (lines keep their newlines).
pub fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

pub fn empty_cell_metadata() -> CellMetadata {
    CellMetadata {
        id: None,
        collapsed: None,
        scrolled: None,
        deletable: None,
        editable: None,
        format: None,
        name: None,
        tags: None,
        jupyter: None,
        execution: None,
        additional: HashMap::new(),
    }
}

fn metadata_of(cell: &Cell) -> CellMetadata {
    match cell {
        Cell::Code { metadata, .. } => metadata.clone(),
        Cell::Markdown { metadata, .. } => metadata.clone(),
        Cell::Raw { metadata, .. } => metadata.clone(),
    }
}

fn build(kind: CellKind, id: CellId, metadata: CellMetadata, source: Vec<String>) -> Cell {
    match kind {
        CellKind::Code => Cell::Code {
            id,
            metadata,
            execution_count: None,
            source,
            outputs: Vec::new(),
        },
        CellKind::Markdown => Cell::Markdown {
            id,
            metadata,
            source,
            attachments: None,
        },
        CellKind::Raw => Cell::Raw {
            id,
            metadata,
            source,
        },
    }
}

pub fn new_cell(kind: CellKind, source: &str) -> Cell {
    build(
        kind,
        CellId::from(Uuid::new_v4()),
        empty_cell_metadata(),
        source_to_lines(source),
    )
}

fn check_index(index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(NotebookError::IndexOutOfRange { index, len });
    }
    Ok(())
}

pub fn get(cells: &[Cell], index: usize) -> Result<&Cell> {
    check_index(index, cells.len())?;
    Ok(&cells[index])
}

/// Insert a new cell at `index`; `index == len` appends. Returns the new
/// cell's id.
pub fn insert(cells: &mut Vec<Cell>, index: usize, kind: CellKind, source: &str) -> Result<CellId> {
    if index > cells.len() {
        return Err(NotebookError::IndexOutOfRange {
            index,
            len: cells.len() + 1,
        });
    }
    let cell = new_cell(kind, source);
    let id = match &cell {
        Cell::Code { id, .. } | Cell::Markdown { id, .. } | Cell::Raw { id, .. } => id.clone(),
    };
    cells.insert(index, cell);
    Ok(id)
}

/// Replace a cell's source. A source change invalidates any prior
/// execution results, so code cells lose their outputs and count.
pub fn modify(cells: &mut [Cell], index: usize, new_source: &str) -> Result<()> {
    check_index(index, cells.len())?;
    let lines = source_to_lines(new_source);
    match &mut cells[index] {
        Cell::Code {
            source,
            outputs,
            execution_count,
            ..
        } => {
            *source = lines;
            outputs.clear();
            *execution_count = None;
        }
        Cell::Markdown { source, .. } => *source = lines,
        Cell::Raw { source, .. } => *source = lines,
    }
    Ok(())
}

/// Remove and return the cell at `index`.
pub fn delete(cells: &mut Vec<Cell>, index: usize) -> Result<Cell> {
    check_index(index, cells.len())?;
    Ok(cells.remove(index))
}

/// Move the cell at `from` so it ends up at `to`. Same position is a no-op.
pub fn move_cell(cells: &mut Vec<Cell>, from: usize, to: usize) -> Result<()> {
    check_index(from, cells.len())?;
    check_index(to, cells.len())?;
    if from == to {
        return Ok(());
    }
    let cell = cells.remove(from);
    cells.insert(to, cell);
    Ok(())
}

/// Duplicate the cell at `index`, inserting the copy right after it. The
/// copy keeps source and metadata but gets a fresh id and, for code cells,
/// no outputs or execution count. Returns the copy's index and id.
pub fn duplicate(cells: &mut Vec<Cell>, index: usize) -> Result<(usize, CellId)> {
    check_index(index, cells.len())?;
    let original = &cells[index];
    let id = CellId::from(Uuid::new_v4());
    let copy = build(
        kind_of(original),
        id.clone(),
        metadata_of(original),
        source_to_lines(&source_of(original)),
    );
    cells.insert(index + 1, copy);
    Ok((index + 1, id))
}

/// Clear outputs and execution count. With an index, clears that one cell
/// (which must be a code cell); without, clears every code cell. Returns
/// the number of cells cleared.
pub fn clear_outputs(cells: &mut [Cell], index: Option<usize>) -> Result<usize> {
    match index {
        Some(index) => {
            check_index(index, cells.len())?;
            match &mut cells[index] {
                Cell::Code {
                    outputs,
                    execution_count,
                    ..
                } => {
                    outputs.clear();
                    *execution_count = None;
                    Ok(1)
                }
                other => Err(NotebookError::NotACodeCell {
                    index,
                    kind: kind_of(other).to_string(),
                }),
            }
        }
        None => {
            let mut cleared = 0;
            for cell in cells.iter_mut() {
                if let Cell::Code {
                    outputs,
                    execution_count,
                    ..
                } = cell
                {
                    outputs.clear();
                    *execution_count = None;
                    cleared += 1;
                }
            }
            Ok(cleared)
        }
    }
}

/// Convert a cell to a different kind, preserving source, id and metadata.
/// Converting to code starts with no execution state; same kind is a no-op.
pub fn change_type(cells: &mut [Cell], index: usize, kind: CellKind) -> Result<()> {
    check_index(index, cells.len())?;
    let current = &cells[index];
    if kind_of(current) == kind {
        return Ok(());
    }
    let id = match current {
        Cell::Code { id, .. } | Cell::Markdown { id, .. } | Cell::Raw { id, .. } => id.clone(),
    };
    cells[index] = build(
        kind,
        id,
        metadata_of(current),
        source_to_lines(&source_of(current)),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Cell> {
        vec![
            new_cell(CellKind::Markdown, "# Title\n"),
            new_cell(CellKind::Code, "x = 1\n"),
            new_cell(CellKind::Code, "print(x)"),
        ]
    }

    fn with_output(cell: &mut Cell) {
        if let Cell::Code {
            outputs,
            execution_count,
            ..
        } = cell
        {
            let out = serde_json::from_value(serde_json::json!({
                "output_type": "stream",
                "name": "stdout",
                "text": "1\n"
            }))
            .unwrap();
            outputs.push(out);
            *execution_count = Some(3);
        }
    }

    #[test]
    fn test_source_to_lines_keeps_newlines() {
        assert_eq!(source_to_lines(""), Vec::<String>::new());
        assert_eq!(source_to_lines("a"), vec!["a"]);
        assert_eq!(source_to_lines("a\nb\n"), vec!["a\n", "b\n"]);
        assert_eq!(source_to_lines("a\nb"), vec!["a\n", "b"]);
    }

    #[test]
    fn test_insert_at_bounds() {
        let mut cells = sample();
        insert(&mut cells, 0, CellKind::Raw, "front").unwrap();
        insert(&mut cells, 4, CellKind::Raw, "back").unwrap();
        assert_eq!(cells.len(), 5);
        assert_eq!(source_of(&cells[0]), "front");
        assert_eq!(source_of(&cells[4]), "back");
    }

    #[test]
    fn test_insert_past_end_fails() {
        let mut cells = sample();
        let err = insert(&mut cells, 5, CellKind::Code, "").unwrap_err();
        assert_eq!(err.kind(), "index_out_of_range");
        assert_eq!(cells.len(), 3);
    }

    #[test]
    fn test_insert_assigns_fresh_ids() {
        let mut cells = sample();
        let a = insert(&mut cells, 0, CellKind::Code, "").unwrap();
        let b = insert(&mut cells, 0, CellKind::Code, "").unwrap();
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_modify_clears_execution_results() {
        let mut cells = sample();
        with_output(&mut cells[1]);

        modify(&mut cells, 1, "x = 2\n").unwrap();
        match &cells[1] {
            Cell::Code {
                source,
                outputs,
                execution_count,
                ..
            } => {
                assert_eq!(source.join(""), "x = 2\n");
                assert!(outputs.is_empty());
                assert!(execution_count.is_none());
            }
            _ => panic!("expected code cell"),
        }
    }

    #[test]
    fn test_modify_keeps_identity() {
        let mut cells = sample();
        let id = cells[1].id().to_string();
        modify(&mut cells, 1, "y = 9").unwrap();
        assert_eq!(cells[1].id().to_string(), id);
    }

    #[test]
    fn test_delete_shifts_later_cells() {
        let mut cells = sample();
        let last_id = cells[2].id().to_string();
        let removed = delete(&mut cells, 1).unwrap();
        assert_eq!(kind_of(&removed), CellKind::Code);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[1].id().to_string(), last_id);
    }

    #[test]
    fn test_move_is_pop_then_insert() {
        let mut cells = sample();
        let ids: Vec<String> = cells.iter().map(|c| c.id().to_string()).collect();

        move_cell(&mut cells, 0, 2).unwrap();
        let moved: Vec<String> = cells.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(moved, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);
    }

    #[test]
    fn test_move_same_position_is_noop() {
        let mut cells = sample();
        let ids: Vec<String> = cells.iter().map(|c| c.id().to_string()).collect();
        move_cell(&mut cells, 1, 1).unwrap();
        let after: Vec<String> = cells.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, after);
    }

    #[test]
    fn test_move_validates_both_ends() {
        let mut cells = sample();
        assert_eq!(
            move_cell(&mut cells, 3, 0).unwrap_err().kind(),
            "index_out_of_range"
        );
        assert_eq!(
            move_cell(&mut cells, 0, 3).unwrap_err().kind(),
            "index_out_of_range"
        );
    }

    #[test]
    fn test_duplicate_resets_execution_state() {
        let mut cells = sample();
        with_output(&mut cells[1]);

        let (new_index, new_id) = duplicate(&mut cells, 1).unwrap();
        assert_eq!(new_index, 2);
        assert_eq!(cells.len(), 4);
        assert_ne!(cells[1].id().as_str(), new_id.as_str());
        assert_eq!(source_of(&cells[1]), source_of(&cells[2]));
        match &cells[2] {
            Cell::Code {
                outputs,
                execution_count,
                ..
            } => {
                assert!(outputs.is_empty());
                assert!(execution_count.is_none());
            }
            _ => panic!("expected code cell"),
        }
    }

    #[test]
    fn test_clear_outputs_single_and_all() {
        let mut cells = sample();
        with_output(&mut cells[1]);
        with_output(&mut cells[2]);

        assert_eq!(clear_outputs(&mut cells, Some(1)).unwrap(), 1);
        match &cells[2] {
            Cell::Code { execution_count, .. } => assert!(execution_count.is_some()),
            _ => panic!("expected code cell"),
        }

        assert_eq!(clear_outputs(&mut cells, None).unwrap(), 2);
        match &cells[2] {
            Cell::Code { execution_count, .. } => assert!(execution_count.is_none()),
            _ => panic!("expected code cell"),
        }
    }

    #[test]
    fn test_clear_outputs_rejects_markdown() {
        let mut cells = sample();
        let err = clear_outputs(&mut cells, Some(0)).unwrap_err();
        assert_eq!(err.kind(), "not_a_code_cell");
    }

    #[test]
    fn test_change_type_preserves_source_and_id() {
        let mut cells = sample();
        with_output(&mut cells[1]);
        let id = cells[1].id().to_string();

        change_type(&mut cells, 1, CellKind::Markdown).unwrap();
        assert_eq!(kind_of(&cells[1]), CellKind::Markdown);
        assert_eq!(source_of(&cells[1]), "x = 1\n");
        assert_eq!(cells[1].id().to_string(), id);

        change_type(&mut cells, 1, CellKind::Code).unwrap();
        match &cells[1] {
            Cell::Code {
                outputs,
                execution_count,
                ..
            } => {
                assert!(outputs.is_empty());
                assert!(execution_count.is_none());
            }
            _ => panic!("expected code cell"),
        }
    }

    #[test]
    fn test_change_type_same_kind_is_noop() {
        let mut cells = sample();
        with_output(&mut cells[1]);
        change_type(&mut cells, 1, CellKind::Code).unwrap();
        match &cells[1] {
            Cell::Code { outputs, .. } => assert_eq!(outputs.len(), 1),
            _ => panic!("expected code cell"),
        }
    }

    #[test]
    fn test_get_out_of_range() {
        let cells = sample();
        let err = get(&cells, 10).unwrap_err();
        assert_eq!(err.kind(), "index_out_of_range");
    }
}
