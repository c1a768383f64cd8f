//! PDF document parser using pdf-extract
//!
//! Extracts text page by page and joins the pages in page order,
//! separated by a blank line.

use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use crate::{DocumentFormat, DocumentParser, ParsedDocument, ParserError, Result, PDF_MAGIC};

/// Separator placed between the text of consecutive pages
const PAGE_SEPARATOR: &str = "\n\n";

/// PDF document parser
pub struct PdfParser {
    /// Drop pages that contain no text
    pub skip_blank_pages: bool,
}

impl PdfParser {
    /// Create a new PDF parser with default settings
    pub fn new() -> Self {
        Self {
            skip_blank_pages: false,
        }
    }

    /// Drop pages without text from the joined content
    pub fn with_skip_blank_pages(mut self, enabled: bool) -> Self {
        self.skip_blank_pages = enabled;
        self
    }

    /// Extract the text of every page, in page order
    fn extract_pages(&self, path: &Path, bytes: &[u8]) -> Result<Vec<String>> {
        if !bytes.starts_with(PDF_MAGIC) {
            return Err(ParserError::CorruptedFile(format!(
                "{}: missing PDF header",
                path.display()
            )));
        }

        // pdf-extract panics on some malformed inputs
        let extracted =
            panic::catch_unwind(AssertUnwindSafe(|| {
                pdf_extract::extract_text_from_mem_by_pages(bytes)
            }))
            .map_err(|_| {
                ParserError::CorruptedFile(format!("{}: PDF extraction aborted", path.display()))
            })?;

        extracted.map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "PDF extraction failed");
            ParserError::CorruptedFile(format!("{}: {}", path.display(), e))
        })
    }

    /// Join page texts into one document body
    fn join_pages(&self, pages: &[String]) -> String {
        pages
            .iter()
            .map(|page| page.trim())
            .filter(|page| !self.skip_blank_pages || !page.is_empty())
            .collect::<Vec<_>>()
            .join(PAGE_SEPARATOR)
    }
}

impl Default for PdfParser {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentParser for PdfParser {
    fn parse_bytes(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument> {
        let pages = self.extract_pages(path, bytes)?;
        let content = self.join_pages(&pages);

        let mut doc =
            ParsedDocument::new(path.display().to_string(), DocumentFormat::Pdf).with_content(content);
        doc.metadata.page_count = Some(pages.len() as u32);
        Ok(doc)
    }

    fn supported_types(&self) -> &[DocumentFormat] {
        &[DocumentFormat::Pdf]
    }
}
