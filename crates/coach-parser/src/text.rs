//! Plain text and Markdown parsers

use std::path::Path;

use crate::{DocumentFormat, DocumentParser, ParsedDocument, ParserError, Result};

const UTF8_BOM: &str = "\u{feff}";

/// Decode text content, rejecting binary data
fn decode(path: &Path, bytes: &[u8]) -> Result<String> {
    if bytes.contains(&0) {
        return Err(ParserError::CorruptedFile(format!(
            "{}: binary content in a text file",
            path.display()
        )));
    }

    let text = String::from_utf8_lossy(bytes);
    Ok(text.strip_prefix(UTF8_BOM).unwrap_or(&text).to_string())
}

/// Plain text parser
pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn parse_bytes(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument> {
        let content = decode(path, bytes)?;
        Ok(ParsedDocument::new(path.display().to_string(), DocumentFormat::PlainText)
            .with_content(content))
    }

    fn supported_types(&self) -> &[DocumentFormat] {
        &[DocumentFormat::PlainText]
    }
}

/// Markdown parser
///
/// YAML front matter delimited by `---` lines is removed from the content;
/// its `title:` entry (or else the first `#` heading) becomes the title.
pub struct MarkdownParser;

impl DocumentParser for MarkdownParser {
    fn parse_bytes(&self, path: &Path, bytes: &[u8]) -> Result<ParsedDocument> {
        let raw = decode(path, bytes)?;
        let (front_matter, body) = split_front_matter(&raw);

        let title = front_matter
            .and_then(front_matter_title)
            .or_else(|| first_heading(body));

        let mut doc = ParsedDocument::new(path.display().to_string(), DocumentFormat::Markdown)
            .with_content(body);
        doc.metadata.title = title;
        Ok(doc)
    }

    fn supported_types(&self) -> &[DocumentFormat] {
        &[DocumentFormat::Markdown]
    }
}

/// Split `---` delimited front matter from the body
fn split_front_matter(raw: &str) -> (Option<&str>, &str) {
    let Some(rest) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return (None, raw);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let front = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(front), body.trim_start_matches(['\r', '\n']));
        }
        offset += line.len();
    }

    // Unterminated front matter is ordinary content
    (None, raw)
}

fn front_matter_title(front: &str) -> Option<String> {
    front
        .lines()
        .filter_map(|line| line.strip_prefix("title:"))
        .map(|value| value.trim().trim_matches(['"', '\'']).trim().to_string())
        .find(|title| !title.is_empty())
}

fn first_heading(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .find(|title| !title.is_empty())
}
