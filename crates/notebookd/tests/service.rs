//! Hermetic service tests: documents, backups, mutations, scans, exports.
//! Nothing here starts a kernel.

use std::path::{Path, PathBuf};

use notebookd::cells::CellKind;
use notebookd::service::ExportFormat;
use notebookd::NotebookService;
use tempfile::TempDir;

fn backups_in(dir: &Path) -> Vec<PathBuf> {
    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().contains("_backup_"))
                .unwrap_or(false)
        })
        .collect();
    backups.sort();
    backups
}

#[tokio::test]
async fn test_create_and_read_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("analysis.ipynb");
    let service = NotebookService::new();

    let created = service.create_notebook(&path, "Analysis", false).await.unwrap();
    assert_eq!(created.cell_count, 2);

    let overview = service.read_notebook(&path, false).await.unwrap();
    assert_eq!(overview.title.as_deref(), Some("Analysis"));
    assert_eq!(overview.spec_name.as_deref(), Some("python3"));
    assert_eq!(overview.format_version, "4.5");
    assert_eq!(overview.cells[0].cell_type, CellKind::Markdown);
    assert_eq!(overview.cells[1].cell_type, CellKind::Code);
}

#[tokio::test]
async fn test_create_refuses_to_clobber() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "one", false).await.unwrap();
    let err = service.create_notebook(&path, "two", false).await.unwrap_err();
    assert_eq!(err.kind(), "already_exists");

    // Still the first document.
    let overview = service.read_notebook(&path, false).await.unwrap();
    assert_eq!(overview.title.as_deref(), Some("one"));

    service.create_notebook(&path, "two", true).await.unwrap();
    let overview = service.read_notebook(&path, false).await.unwrap();
    assert_eq!(overview.title.as_deref(), Some("two"));
}

#[tokio::test]
async fn test_mutations_are_backed_up_first() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "t", false).await.unwrap();
    assert!(backups_in(dir.path()).is_empty(), "create takes no backup");

    let before = std::fs::read(&path).unwrap();
    let added = service
        .add_cell(&path, CellKind::Code, "x = 1\n", None)
        .await
        .unwrap();

    // The backup is exactly the pre-mutation bytes.
    assert_eq!(std::fs::read(&added.backup).unwrap(), before);
    assert_eq!(backups_in(dir.path()).len(), 1);

    service.modify_cell(&path, 2, "x = 2\n").await.unwrap();
    assert_eq!(backups_in(dir.path()).len(), 2);
}

#[tokio::test]
async fn test_cell_edit_sequence() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "t", false).await.unwrap();
    service
        .add_cell(&path, CellKind::Code, "a = 1\n", None)
        .await
        .unwrap();
    service
        .add_cell(&path, CellKind::Markdown, "## Notes\n", Some(1))
        .await
        .unwrap();

    let overview = service.read_notebook(&path, false).await.unwrap();
    assert_eq!(overview.cell_count, 4);
    assert_eq!(overview.cells[1].source, "## Notes\n");

    let dup = service.duplicate_cell(&path, 3).await.unwrap();
    assert_eq!(dup.index, 4);

    service.move_cell(&path, 4, 0).await.unwrap();
    let overview = service.read_notebook(&path, false).await.unwrap();
    assert_eq!(overview.cells[0].id, dup.cell_id);

    let deleted = service.delete_cell(&path, 0).await.unwrap();
    assert_eq!(deleted.cell_type, CellKind::Code);
    assert_eq!(deleted.cell_count, 4);
}

#[tokio::test]
async fn test_failed_mutation_leaves_document_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "t", false).await.unwrap();
    let before = std::fs::read(&path).unwrap();

    let err = service.modify_cell(&path, 99, "nope").await.unwrap_err();
    assert_eq!(err.kind(), "index_out_of_range");
    assert_eq!(std::fs::read(&path).unwrap(), before);

    let err = service.move_cell(&path, 0, 99).await.unwrap_err();
    assert_eq!(err.kind(), "index_out_of_range");
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn test_concurrent_mutations_both_survive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "t", false).await.unwrap();
    service
        .add_cell(&path, CellKind::Code, "a = 0\n", None)
        .await
        .unwrap();
    service
        .add_cell(&path, CellKind::Code, "b = 0\n", None)
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        service.modify_cell(&path, 2, "a = 1\n"),
        service.modify_cell(&path, 3, "b = 1\n"),
    );
    first.unwrap();
    second.unwrap();

    let overview = service.read_notebook(&path, false).await.unwrap();
    assert_eq!(overview.cells[2].source, "a = 1\n");
    assert_eq!(overview.cells[3].source, "b = 1\n");
}

#[tokio::test]
async fn test_reads_see_external_changes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "t", false).await.unwrap();
    service.read_notebook(&path, false).await.unwrap();

    // Rewrite the file behind the service's back.
    let mut nb = notebookd::document::load(&path).unwrap();
    notebookd::cells::insert(&mut nb.cells, 0, CellKind::Raw, "external").unwrap();
    // Nudge mtime past filesystem timestamp granularity.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    notebookd::document::save(&path, &nb).unwrap();

    let overview = service.read_notebook(&path, false).await.unwrap();
    assert_eq!(overview.cells[0].source, "external");
}

#[tokio::test]
async fn test_clear_outputs_and_change_type() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "t", false).await.unwrap();
    service
        .add_cell(&path, CellKind::Code, "x = 1\n", None)
        .await
        .unwrap();

    let cleared = service.clear_outputs(&path, None).await.unwrap();
    assert_eq!(cleared.cells_cleared, 2);

    let err = service.clear_outputs(&path, Some(0)).await.unwrap_err();
    assert_eq!(err.kind(), "not_a_code_cell");

    service
        .change_cell_type(&path, 2, CellKind::Markdown)
        .await
        .unwrap();
    let cell = service.get_cell(&path, 2).await.unwrap();
    assert_eq!(cell.cell_type, CellKind::Markdown);
    assert_eq!(cell.source, "x = 1\n");
}

#[tokio::test]
async fn test_backup_of_unsaved_notebook_fails() {
    let dir = TempDir::new().unwrap();
    let service = NotebookService::new();
    let err = service
        .backup_notebook(&dir.path().join("never.ipynb"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "source_missing");
}

#[tokio::test]
async fn test_execute_rejects_non_code_cell_without_kernel() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "t", false).await.unwrap();
    // Cell 0 is the title markdown cell.
    let err = service.execute_cell(&path, 0, None, None).await.unwrap_err();
    assert_eq!(err.kind(), "not_a_code_cell");

    let err = service.execute_cell(&path, 9, None, None).await.unwrap_err();
    assert_eq!(err.kind(), "index_out_of_range");
}

#[tokio::test]
async fn test_list_notebooks_skips_unparsable_files() {
    let dir = TempDir::new().unwrap();
    let service = NotebookService::new();

    service
        .create_notebook(&dir.path().join("b.ipynb"), "second", false)
        .await
        .unwrap();
    service
        .create_notebook(&dir.path().join("a.ipynb"), "first", false)
        .await
        .unwrap();
    std::fs::write(dir.path().join("broken.ipynb"), "not json").unwrap();
    std::fs::write(dir.path().join("readme.txt"), "ignored").unwrap();

    let listed = service.list_notebooks(dir.path()).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].name, "a.ipynb");
    assert_eq!(listed[0].title.as_deref(), Some("first"));
    assert_eq!(listed[1].name, "b.ipynb");
    assert!(listed[0].size_bytes > 0);
}

#[tokio::test]
async fn test_list_notebooks_on_a_file_is_a_read_error() {
    let dir = TempDir::new().unwrap();
    let service = NotebookService::new();

    let file = dir.path().join("plain.txt");
    std::fs::write(&file, "not a directory").unwrap();

    let err = service.list_notebooks(&file).await.unwrap_err();
    assert_eq!(err.kind(), "read_failed");

    let err = service
        .list_notebooks(&dir.path().join("absent"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_unresolvable_kernel_leaves_document_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "t", false).await.unwrap();
    service
        .add_cell(&path, CellKind::Code, "x = 1\n", None)
        .await
        .unwrap();
    let before = std::fs::read(&path).unwrap();

    // No cell ran, so there is nothing to persist and no backup to take.
    let err = service
        .execute_notebook(&path, Some("no-such-kernel-anywhere"), None, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "backend_unavailable");
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn test_search_and_dependencies() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "t", false).await.unwrap();
    service
        .add_cell(
            &path,
            CellKind::Code,
            "import numpy as np\n!pip install requests\ndata = np.arange(10)\n",
            None,
        )
        .await
        .unwrap();

    let results = service.search_cells(&path, "DATA", false).await.unwrap();
    assert_eq!(results.matches.len(), 1);
    assert_eq!(results.matches[0].cell_index, 2);
    assert_eq!(results.matches[0].lines[0].line_number, 3);

    assert!(service.search_cells(&path, "DATA", true).await.unwrap().matches.is_empty());

    let deps = service.analyze_dependencies(&path).await.unwrap();
    assert_eq!(deps.dependencies.imported_modules, vec!["numpy"]);
    assert_eq!(deps.dependencies.pip_installs, vec!["requests"]);
}

#[tokio::test]
async fn test_metadata_statistics() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "Stats", false).await.unwrap();
    service
        .add_cell(&path, CellKind::Raw, "raw\n", None)
        .await
        .unwrap();

    let stats = service.get_notebook_metadata(&path).await.unwrap();
    assert_eq!(stats.cell_count, 3);
    assert_eq!(stats.code_cells, 1);
    assert_eq!(stats.markdown_cells, 1);
    assert_eq!(stats.raw_cells, 1);
    assert_eq!(stats.executed_cells, 0);
    assert_eq!(stats.cells_with_outputs, 0);
    assert!(stats.size_bytes > 0);
    assert_eq!(stats.spec_name.as_deref(), Some("python3"));
}

#[tokio::test]
async fn test_exports_write_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nb.ipynb");
    let service = NotebookService::new();

    service.create_notebook(&path, "Export me", false).await.unwrap();
    service
        .add_cell(&path, CellKind::Code, "print('hi')\n", None)
        .await
        .unwrap();

    let script = service
        .export_notebook(&path, ExportFormat::Script, None)
        .await
        .unwrap();
    assert_eq!(script.output_path, dir.path().join("nb.py"));
    let text = std::fs::read_to_string(&script.output_path).unwrap();
    assert!(text.contains("print('hi')"));
    assert!(text.contains("# # Export me"));

    let markdown = service
        .export_notebook(&path, ExportFormat::Markdown, Some(dir.path().join("out.md")))
        .await
        .unwrap();
    let text = std::fs::read_to_string(&markdown.output_path).unwrap();
    assert!(text.contains("```python"));

    let html = service
        .export_notebook(&path, ExportFormat::Html, None)
        .await
        .unwrap();
    let text = std::fs::read_to_string(&html.output_path).unwrap();
    assert!(text.starts_with("<!DOCTYPE html>"));
}

#[tokio::test]
async fn test_interrupt_without_session_fails() {
    let service = NotebookService::new();
    let err = service.interrupt_kernel("python3").await.unwrap_err();
    assert_eq!(err.kind(), "backend_unavailable");

    let err = service.restart_kernel("python3").await.unwrap_err();
    assert_eq!(err.kind(), "backend_unavailable");
}
