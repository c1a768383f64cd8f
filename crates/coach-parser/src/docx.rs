//! DOCX document parser using docx-rs
//!
//! Extracts paragraph and table text from Microsoft Word documents.

use std::path::Path;

use docx_rs::read_docx;

use crate::{DocumentFormat, DocumentParser, ParsedDocument, ParserError, Result};

/// DOCX document parser
pub struct DocxParser {
    /// Separator placed between table cells
    pub cell_separator: String,
}

impl DocxParser {
    /// Create a new DOCX parser with default settings
    pub fn new() -> Self {
        Self {
            cell_separator: "\t".to_string(),
        }
    }

    /// Use a different table cell separator
    pub fn with_cell_separator(mut self, separator: impl Into<String>) -> Self {
        self.cell_separator = separator.into();
        self
    }
}

impl Default for DocxParser {
    fn default() -> Self {
        Self::new()
    }
}

fn paragraph_text(para: &docx_rs::Paragraph) -> String {
    let mut text = String::new();
    for child in &para.children {
        if let docx_rs::ParagraphChild::Run(run) = child {
            for run_child in &run.children {
                if let docx_rs::RunChild::Text(t) = run_child {
                    text.push_str(&t.text);
                }
            }
        }
    }
    text
}

fn is_heading(para: &docx_rs::Paragraph) -> bool {
    para.property
        .style
        .as_ref()
        .map(|style| style.val.to_lowercase().starts_with("heading") || style.val == "Title")
        .unwrap_or(false)
}

impl DocumentParser for DocxParser {
    fn parse_bytes(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument> {
        let docx = read_docx(bytes).map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "DOCX container unreadable");
            ParserError::CorruptedFile(format!("{}: {}", path.display(), e))
        })?;

        let mut content = String::new();
        let mut title: Option<String> = None;

        for child in &docx.document.children {
            match child {
                docx_rs::DocumentChild::Paragraph(para) => {
                    let text = paragraph_text(para);
                    if title.is_none() && is_heading(para) && !text.trim().is_empty() {
                        title = Some(text.trim().to_string());
                    }
                    content.push_str(&text);
                    content.push('\n');
                }
                docx_rs::DocumentChild::Table(tbl) => {
                    for row in &tbl.rows {
                        let docx_rs::TableChild::TableRow(tr) = row;
                        let mut cells = Vec::new();

                        for cell in &tr.cells {
                            let docx_rs::TableRowChild::TableCell(tc) = cell;
                            let cell_text = tc
                                .children
                                .iter()
                                .filter_map(|c| match c {
                                    docx_rs::TableCellContent::Paragraph(p) => {
                                        Some(paragraph_text(p))
                                    }
                                    _ => None,
                                })
                                .collect::<Vec<_>>()
                                .join(" ");
                            cells.push(cell_text.trim().to_string());
                        }

                        content.push_str(&cells.join(&self.cell_separator));
                        content.push('\n');
                    }
                }
                _ => {}
            }
        }

        let mut doc = ParsedDocument::new(path.display().to_string(), DocumentFormat::Docx)
            .with_content(content.trim_end());
        doc.metadata.title = title;
        Ok(doc)
    }

    fn supported_types(&self) -> &[DocumentFormat] {
        &[DocumentFormat::Docx]
    }
}
