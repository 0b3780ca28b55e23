//! Plain-text exporters over nbformat v4 documents.
//!
//! Everything here is a pure function from a parsed notebook to a string;
//! no files, no kernels. Rich outputs are summarized rather than
//! rendered: text is carried through, HTML and images become one-line
//! placeholders.

use nbformat::v4::{Cell, Notebook, Output};
use serde_json::Value;

/// Joined source of a cell.
fn cell_source(cell: &Cell) -> String {
    match cell {
        Cell::Code { source, .. } => source.join(""),
        Cell::Markdown { source, .. } => source.join(""),
        Cell::Raw { source, .. } => source.join(""),
    }
}

/// nbformat text fields may be a string or a list of lines.
fn join_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(lines) => lines
            .iter()
            .filter_map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Readable one-blob text for an output JSON value.
pub fn output_value_text(output: &Value) -> String {
    match output["output_type"].as_str() {
        Some("stream") => join_text(&output["text"]),
        Some("execute_result") | Some("display_data") => {
            let data = &output["data"];
            if !data["text/plain"].is_null() {
                join_text(&data["text/plain"])
            } else if !data["text/html"].is_null() {
                format!("[HTML Output: {} chars]", join_text(&data["text/html"]).len())
            } else if !data["image/png"].is_null() {
                "[Image Output: PNG]".to_string()
            } else {
                "[Unsupported Output]".to_string()
            }
        }
        Some("error") => output["traceback"]
            .as_array()
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| l.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_else(|| {
                format!(
                    "{}: {}",
                    output["ename"].as_str().unwrap_or_default(),
                    output["evalue"].as_str().unwrap_or_default()
                )
            }),
        _ => String::new(),
    }
}

/// Readable text for a typed nbformat output.
pub fn output_plain_text(output: &Output) -> String {
    match serde_json::to_value(output) {
        Ok(value) => output_value_text(&value),
        Err(_) => String::new(),
    }
}

fn language(notebook: &Notebook) -> String {
    notebook
        .metadata
        .language_info
        .as_ref()
        .map(|info| info.name.clone())
        .unwrap_or_else(|| "python".to_string())
}

fn title(notebook: &Notebook) -> Option<String> {
    notebook
        .metadata
        .additional
        .get("title")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Render the notebook as a runnable script. Markdown and raw cells
/// become comment blocks unless `code_only`.
pub fn to_script(notebook: &Notebook, code_only: bool) -> String {
    let mut parts = vec!["#!/usr/bin/env python\n# coding: utf-8\n".to_string()];

    for cell in &notebook.cells {
        match cell {
            Cell::Code {
                source,
                execution_count,
                ..
            } => {
                let marker = match execution_count {
                    Some(n) => format!("# In[{n}]:\n"),
                    None => "# In[ ]:\n".to_string(),
                };
                let mut body = source.join("");
                if !body.ends_with('\n') {
                    body.push('\n');
                }
                parts.push(format!("{marker}{body}"));
            }
            Cell::Markdown { source, .. } | Cell::Raw { source, .. } => {
                if code_only {
                    continue;
                }
                let commented: String = source
                    .join("")
                    .lines()
                    .map(|line| format!("# {line}\n"))
                    .collect();
                parts.push(commented);
            }
        }
    }

    parts.join("\n")
}

/// Render the notebook as Markdown: prose carried through, code fenced,
/// output text in labelled fences.
pub fn to_markdown(notebook: &Notebook) -> String {
    let lang = language(notebook);
    let mut parts = Vec::new();

    if let Some(title) = title(notebook) {
        parts.push(format!("# {title}\n"));
    }

    for cell in &notebook.cells {
        match cell {
            Cell::Markdown { source, .. } => parts.push(source.join("")),
            Cell::Raw { source, .. } => parts.push(format!("```\n{}\n```\n", source.join(""))),
            Cell::Code {
                source, outputs, ..
            } => {
                parts.push(format!("```{lang}\n{}\n```\n", source.join("")));
                let text: String = outputs
                    .iter()
                    .map(output_plain_text)
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join("");
                if !text.is_empty() {
                    parts.push(format!("Output:\n\n```\n{}\n```\n", text.trim_end()));
                }
            }
        }
    }

    parts.join("\n")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Render the notebook as a self-contained HTML page. Markdown is shown
/// as preformatted text; nothing external is fetched.
pub fn to_html(notebook: &Notebook) -> String {
    let page_title = title(notebook).unwrap_or_else(|| "Notebook".to_string());
    let mut body = String::new();

    for cell in &notebook.cells {
        match cell {
            Cell::Markdown { source, .. } => {
                body.push_str(&format!(
                    "<div class=\"markdown\"><pre>{}</pre></div>\n",
                    escape_html(&source.join(""))
                ));
            }
            Cell::Raw { source, .. } => {
                body.push_str(&format!(
                    "<div class=\"raw\"><pre>{}</pre></div>\n",
                    escape_html(&source.join(""))
                ));
            }
            Cell::Code {
                source,
                outputs,
                execution_count,
                ..
            } => {
                let count = execution_count
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| " ".to_string());
                body.push_str(&format!(
                    "<div class=\"code\"><span class=\"prompt\">In [{}]:</span><pre><code>{}</code></pre></div>\n",
                    count,
                    escape_html(&source.join(""))
                ));
                for output in outputs {
                    let text = output_plain_text(output);
                    if !text.is_empty() {
                        body.push_str(&format!(
                            "<div class=\"output\"><pre>{}</pre></div>\n",
                            escape_html(&text)
                        ));
                    }
                }
            }
        }
    }

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n\
         <style>\nbody {{ font-family: sans-serif; max-width: 60em; margin: 2em auto; }}\n\
         .code pre {{ background: #f4f4f4; padding: 0.5em; }}\n\
         .output pre {{ background: #fff8e6; padding: 0.5em; }}\n\
         .prompt {{ color: #777; font-size: 0.8em; }}\n</style>\n</head>\n<body>\n\
         <h1>{}</h1>\n{}</body>\n</html>\n",
        escape_html(&page_title),
        escape_html(&page_title),
        body
    )
}
