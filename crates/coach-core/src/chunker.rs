//! Heading-aware document chunking
//!
//! Long documents are split into passages before embedding so that each
//! passage fits the context of an embedding model. Markdown headings open
//! new sections; a section longer than the chunk size is packed sentence by
//! sentence, repeating the trailing sentences of one passage at the start
//! of the next.

use serde::{Deserialize, Serialize};

use crate::config::ChunkingConfig;

/// One passage of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Position of the passage within the document, from zero
    pub index: u32,

    /// Nearest preceding Markdown heading
    pub heading: Option<String>,

    /// Passage text
    pub text: String,
}

/// Splits document text into passages
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Split `text` into passages, in document order
    ///
    /// Short documents, and every document when chunking is disabled, come
    /// back as a single passage holding the whole text (which may be empty).
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        let words = text.split_whitespace().count() as u64;
        if !self.config.enabled || words <= self.config.min_words {
            return vec![TextChunk {
                index: 0,
                heading: None,
                text: text.to_string(),
            }];
        }

        let mut chunks = Vec::new();
        for (heading, body) in self.sections(text) {
            for passage in self.split_section(&body) {
                chunks.push(TextChunk {
                    index: chunks.len() as u32,
                    heading: heading.clone(),
                    text: passage,
                });
            }
        }

        if chunks.is_empty() {
            chunks.push(TextChunk {
                index: 0,
                heading: None,
                text: text.to_string(),
            });
        }
        chunks
    }

    /// Group lines under the Markdown heading that precedes them
    fn sections(&self, text: &str) -> Vec<(Option<String>, String)> {
        let mut sections = Vec::new();
        let mut heading: Option<String> = None;
        let mut lines: Vec<&str> = Vec::new();

        for line in text.lines() {
            if let Some(title) = markdown_heading(line) {
                if !lines.is_empty() {
                    sections.push((heading.take(), lines.join("\n")));
                    lines.clear();
                }
                heading = Some(title.to_string());
            }
            lines.push(line);
        }
        if !lines.is_empty() {
            sections.push((heading, lines.join("\n")));
        }

        sections
            .into_iter()
            .filter(|(_, body)| !body.trim().is_empty())
            .collect()
    }

    fn split_section(&self, body: &str) -> Vec<String> {
        let body = body.trim();
        if body.chars().count() <= self.config.chunk_size {
            return vec![body.to_string()];
        }

        let pieces: Vec<&str> = sentences(body)
            .into_iter()
            .flat_map(|sentence| self.fit_sentence(sentence))
            .collect();

        let mut passages = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut length = 0;

        for piece in pieces {
            let piece_len = piece.chars().count();
            if !current.is_empty() && length + 1 + piece_len > self.config.chunk_size {
                passages.push(current.join(" "));
                current = self.overlap_tail(&current);
                while !current.is_empty()
                    && joined_len(&current) + 1 + piece_len > self.config.chunk_size
                {
                    current.remove(0);
                }
                length = joined_len(&current);
            }
            if !current.is_empty() {
                length += 1;
            }
            current.push(piece);
            length += piece_len;
        }
        if !current.is_empty() {
            passages.push(current.join(" "));
        }
        passages
    }

    /// Break a sentence longer than the chunk size at word boundaries
    fn fit_sentence<'a>(&self, sentence: &'a str) -> Vec<&'a str> {
        if sentence.chars().count() <= self.config.chunk_size {
            return vec![sentence];
        }

        let mut pieces = Vec::new();
        let mut start: Option<usize> = None;
        let mut end = 0;
        let mut length = 0;

        for (offset, word) in word_spans(sentence) {
            let word_len = word.chars().count();
            match start {
                Some(s) if length + 1 + word_len > self.config.chunk_size => {
                    pieces.push(&sentence[s..end]);
                    start = Some(offset);
                    length = word_len;
                }
                Some(_) => length += 1 + word_len,
                None => {
                    start = Some(offset);
                    length = word_len;
                }
            }
            end = offset + word.len();
        }
        if let Some(s) = start {
            pieces.push(&sentence[s..end]);
        }
        pieces
    }

    /// Trailing pieces that fit in the overlap budget
    fn overlap_tail<'a>(&self, pieces: &[&'a str]) -> Vec<&'a str> {
        let mut tail = Vec::new();
        let mut length = 0;
        for piece in pieces.iter().rev() {
            let added = piece.chars().count() + usize::from(!tail.is_empty());
            if length + added > self.config.overlap {
                break;
            }
            length += added;
            tail.push(*piece);
        }
        tail.reverse();
        tail
    }
}

/// Title of an ATX Markdown heading line
fn markdown_heading(line: &str) -> Option<&str> {
    let level = line.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&level) {
        return None;
    }
    let rest = &line[level..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim_end();
    (!title.is_empty()).then_some(title)
}

/// Sentences of `text`, keeping their closing punctuation
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace, or at a line break.
fn sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        sentences.push(rest);
    }
    sentences
}

fn joined_len(pieces: &[&str]) -> usize {
    let chars: usize = pieces.iter().map(|p| p.chars().count()).sum();
    chars + pieces.len().saturating_sub(1)
}

/// Byte offset and text of each whitespace-separated word
fn word_spans(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.split_whitespace()
        .map(move |word| (word.as_ptr() as usize - text.as_ptr() as usize, word))
}
