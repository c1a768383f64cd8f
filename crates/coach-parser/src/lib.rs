//! Coach Parser - Text extraction for career documents
//!
//! Supports parsing of:
//! - Plain text files (txt, text, csv, log)
//! - Markdown files, with YAML front matter stripped
//! - PDF documents, page by page
//! - Microsoft Word (DOCX)
//!
//! The format of a file is sniffed from its leading bytes first and its
//! extension second, then the matching `DocumentParser` is dispatched.
//! Parsing is a pure function of the file content.

pub mod docx;
pub mod pdf;
pub mod text;

use std::path::Path;
use std::time::SystemTime;

use thiserror::Error;

pub use docx::DocxParser;
pub use pdf::PdfParser;
pub use text::{MarkdownParser, PlainTextParser};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during document parsing
#[derive(Error, Debug)]
pub enum ParserError {
    /// File format is not supported
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    /// IO error while reading the file
    #[error("IO error reading file: {path}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File is corrupted or malformed
    #[error("File is corrupted or malformed: {0}")]
    CorruptedFile(String),
}

impl ParserError {
    /// Whether the file was missing when it was read
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::IoError { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }

    /// Whether the format itself is unsupported, as opposed to a bad file
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedFormat(_))
    }
}

pub type Result<T> = std::result::Result<T, ParserError>;

// ============================================================================
// Document Formats
// ============================================================================

const PDF_MAGIC: &[u8] = b"%PDF-";

/// Supported document formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Pdf,
    Docx,
    Unknown,
}

impl DocumentFormat {
    /// Detect format from extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "txt" | "text" | "csv" | "log" => Self::PlainText,
            "md" | "markdown" => Self::Markdown,
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            _ => Self::Unknown,
        }
    }

    /// Detect format from path
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::Unknown)
    }

    /// Sniff the format from leading bytes, falling back to the extension
    pub fn sniff(path: &Path, head: &[u8]) -> Self {
        if head.starts_with(PDF_MAGIC) {
            return Self::Pdf;
        }
        Self::from_path(path)
    }

    /// Whether a parser exists for this format
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Stable name used in metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainText => "text",
            Self::Markdown => "markdown",
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Parsed Document Types
// ============================================================================

/// A parsed document with extracted content
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    /// Original file path
    pub file_path: String,

    /// Detected format
    pub format: DocumentFormat,

    /// Extracted text content
    pub content: String,

    /// Metadata extracted from the document
    pub metadata: DocumentParseMetadata,
}

impl ParsedDocument {
    /// Create a new parsed document
    pub fn new(file_path: impl Into<String>, format: DocumentFormat) -> Self {
        Self {
            file_path: file_path.into(),
            format,
            content: String::new(),
            metadata: DocumentParseMetadata::default(),
        }
    }

    /// Set content
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Get total word count
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }

    /// Whether no text was extracted
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Metadata extracted during parsing
#[derive(Debug, Clone, Default)]
pub struct DocumentParseMetadata {
    /// Document title
    pub title: Option<String>,

    /// Number of pages, for paged formats
    pub page_count: Option<u32>,

    /// Whitespace-separated word count
    pub word_count: u64,

    /// Size of the file in bytes
    pub byte_size: u64,

    /// File modification time
    pub modified: Option<SystemTime>,
}

// ============================================================================
// Parser Trait
// ============================================================================

/// Trait for document parsers
pub trait DocumentParser: Send + Sync {
    /// Parse already-read file content
    fn parse_bytes(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument>;

    /// Get supported formats
    fn supported_types(&self) -> &[DocumentFormat];

    /// Parse a document from a file path
    fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let bytes = read_file(path)?;
        self.parse_bytes(path, &bytes)
    }

    /// Check if this parser can handle a format
    fn can_parse(&self, format: DocumentFormat) -> bool {
        self.supported_types().contains(&format)
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| ParserError::IoError {
        path: path.display().to_string(),
        source: e,
    })
}

// ============================================================================
// Parser Registry
// ============================================================================

/// Registry of available parsers, dispatched by sniffed format
pub struct ParserRegistry {
    parsers: Vec<Box<dyn DocumentParser>>,
}

impl ParserRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Registry with every built-in parser
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PlainTextParser);
        registry.register(MarkdownParser);
        registry.register(PdfParser::new());
        registry.register(DocxParser::new());
        registry
    }

    /// Register a parser
    pub fn register<P: DocumentParser + 'static>(&mut self, parser: P) {
        self.parsers.push(Box::new(parser));
    }

    /// Find a parser for a format
    pub fn find_parser(&self, format: DocumentFormat) -> Option<&dyn DocumentParser> {
        self.parsers
            .iter()
            .find(|p| p.can_parse(format))
            .map(|p| p.as_ref())
    }

    /// Whether the path names a file this registry would attempt to parse
    pub fn supports_path(&self, path: &Path) -> bool {
        let format = DocumentFormat::from_path(path);
        format.is_supported() && self.find_parser(format).is_some()
    }

    /// Parse a file using the appropriate parser
    pub fn parse(&self, path: &Path) -> Result<ParsedDocument> {
        let bytes = read_file(path)?;
        let format = DocumentFormat::sniff(path, &bytes);

        if !format.is_supported() {
            return Err(ParserError::UnsupportedFormat(
                path.extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("none")
                    .to_string(),
            ));
        }

        let parser = self
            .find_parser(format)
            .ok_or_else(|| ParserError::UnsupportedFormat(format.to_string()))?;

        let mut doc = if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            // Zero-byte or blank files are valid and carry no text
            ParsedDocument::new(path.display().to_string(), format)
        } else {
            parser.parse_bytes(path, &bytes)?
        };

        doc.format = format;
        doc.metadata.word_count = doc.word_count() as u64;
        doc.metadata.byte_size = bytes.len() as u64;
        doc.metadata.modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if doc.metadata.title.is_none() {
            doc.metadata.title = file_stem_title(path);
        }

        tracing::debug!(
            path = %path.display(),
            format = %format,
            words = doc.metadata.word_count,
            "Parsed document"
        );

        Ok(doc)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Title derived from the file name when the document has none
fn file_stem_title(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().replace(['_', '-'], " "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(DocumentFormat::from_extension("pdf"), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_extension("PDF"), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::from_extension("docx"), DocumentFormat::Docx);
        assert_eq!(DocumentFormat::from_extension("md"), DocumentFormat::Markdown);
        assert_eq!(DocumentFormat::from_extension("log"), DocumentFormat::PlainText);
        assert_eq!(DocumentFormat::from_extension("xlsx"), DocumentFormat::Unknown);
    }

    #[test]
    fn test_sniff_prefers_magic_bytes() {
        let path = Path::new("cv.txt");
        assert_eq!(
            DocumentFormat::sniff(path, b"%PDF-1.7\n"),
            DocumentFormat::Pdf
        );
        assert_eq!(
            DocumentFormat::sniff(Path::new("cv.docx"), b"PK\x03\x04rest"),
            DocumentFormat::Docx
        );
        assert_eq!(
            DocumentFormat::sniff(Path::new("archive.zip"), b"PK\x03\x04rest"),
            DocumentFormat::Unknown
        );
        assert_eq!(
            DocumentFormat::sniff(Path::new("notes.md"), b"# heading"),
            DocumentFormat::Markdown
        );
        assert_eq!(
            DocumentFormat::sniff(Path::new("photo.png"), b"\x89PNG"),
            DocumentFormat::Unknown
        );
    }

    #[test]
    fn test_empty_file_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "test.txt", b"");

        let doc = ParserRegistry::with_defaults().parse(&path).unwrap();
        assert_eq!(doc.content, "");
        assert_eq!(doc.metadata.word_count, 0);
        assert_eq!(doc.metadata.byte_size, 0);
        assert_eq!(doc.metadata.title.as_deref(), Some("test"));
        assert!(doc.metadata.modified.is_some());
    }

    #[test]
    fn test_empty_pdf_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "blank.pdf", b"");

        let doc = ParserRegistry::with_defaults().parse(&path).unwrap();
        assert!(doc.is_empty());
        assert_eq!(doc.format, DocumentFormat::Pdf);
    }

    #[test]
    fn test_plain_text_word_count() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "senior_data_engineer.txt", b"Rust  SQL\nKafka\tSpark");

        let doc = ParserRegistry::with_defaults().parse(&path).unwrap();
        assert_eq!(doc.metadata.word_count, 4);
        assert_eq!(doc.metadata.byte_size, 21);
        assert_eq!(doc.metadata.title.as_deref(), Some("senior data engineer"));
    }

    #[test]
    fn test_unsupported_format() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "photo.png", b"\x89PNG\r\n");

        let err = ParserRegistry::with_defaults().parse(&path).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = ParserRegistry::with_defaults()
            .parse(&dir.path().join("gone.txt"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_pdf_without_magic_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "offer.pdf", b"this is not a pdf at all");

        let err = ParserRegistry::with_defaults().parse(&path).unwrap_err();
        assert!(matches!(err, ParserError::CorruptedFile(_)));
    }

    #[test]
    fn test_supports_path() {
        let registry = ParserRegistry::with_defaults();
        assert!(registry.supports_path(Path::new("a/b.md")));
        assert!(!registry.supports_path(Path::new("a/b.exe")));
        assert!(!ParserRegistry::new().supports_path(Path::new("a/b.md")));
    }
}
