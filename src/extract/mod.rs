//! Text Extractors (C2).
//!
//! Pluggable family keyed by file type. Extractors must be deterministic on the same input
//! bytes; no extractor in this module consults wall-clock time or randomness.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

use crate::error::ExtractError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Heading {
    pub text: String,
    pub level: u8,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableRegion {
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImageRef {
    pub path: String,
    pub position_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtractedDoc {
    pub raw_text: String,
    pub char_count: usize,
    pub word_count: usize,
    pub line_count: usize,
    pub detected_language: String,
    pub headings: Vec<Heading>,
    pub tables: Vec<TableRegion>,
    pub images: Vec<ImageRef>,
}

/// `extract(storage_path) -> ExtractedDoc`, the shared extractor contract.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, storage_path: &Path) -> Result<ExtractedDoc, ExtractError>;
    fn supports(&self, extension: &str) -> bool;
}

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.*)$").unwrap());
static TABLE_ROW_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\|.*\|\s*$").unwrap());
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\(([^)]+)\)").unwrap());

fn base_stats(text: &str) -> (usize, usize, usize) {
    let char_count = text.chars().count();
    let word_count = text.split_whitespace().count();
    let line_count = text.lines().count();
    (char_count, word_count, line_count)
}

/// Heuristic language tag: counts CJK code points versus ASCII letters. Good enough to
/// distinguish the two corpora the rest of the pipeline actually branches on (CRUD change
/// labels are Chinese) without vendoring a language-identification model.
fn detect_language(text: &str) -> String {
    let mut cjk = 0usize;
    let mut latin = 0usize;
    for c in text.chars() {
        if ('\u{4E00}'..='\u{9FFF}').contains(&c) {
            cjk += 1;
        } else if c.is_ascii_alphabetic() {
            latin += 1;
        }
    }
    if cjk > latin { "zh".to_string() } else { "en".to_string() }
}

fn find_headings(text: &str) -> Vec<Heading> {
    HEADING_RE
        .captures_iter(text)
        .map(|cap| {
            let hashes = cap.get(1).unwrap().as_str();
            Heading {
                level: hashes.len() as u8,
                text: cap.get(2).unwrap().as_str().trim().to_string(),
                offset: cap.get(0).unwrap().start(),
            }
        })
        .collect()
}

fn find_tables(text: &str) -> Vec<TableRegion> {
    let mut regions = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for m in TABLE_ROW_RE.find_iter(text) {
        match current {
            Some((start, _)) => current = Some((start, m.end())),
            None => current = Some((m.start(), m.end())),
        }
    }
    if let Some((start, end)) = current {
        regions.push(TableRegion {
            start_offset: start,
            end_offset: end,
        });
    }
    regions
}

fn find_images(text: &str) -> Vec<ImageRef> {
    IMAGE_RE
        .captures_iter(text)
        .enumerate()
        .map(|(idx, cap)| ImageRef {
            path: cap.get(1).unwrap().as_str().to_string(),
            position_tag: format!("image_{idx}"),
        })
        .collect()
}

/// Extracts plain `.txt` files: no structural hints beyond line-based pseudo-headings.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, storage_path: &Path) -> Result<ExtractedDoc, ExtractError> {
        let bytes = std::fs::read(storage_path)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| ExtractError::Corrupt(format!("not valid utf-8: {e}")))?;
        let (char_count, word_count, line_count) = base_stats(&text);
        Ok(ExtractedDoc {
            detected_language: detect_language(&text),
            char_count,
            word_count,
            line_count,
            headings: Vec::new(),
            tables: Vec::new(),
            images: Vec::new(),
            raw_text: text,
        })
    }

    fn supports(&self, extension: &str) -> bool {
        extension.eq_ignore_ascii_case("txt")
    }
}

/// Extracts `.md`/`.markdown` files: headings, GFM pipe-table regions, and image references are
/// all derivable directly from the markup, so no external parser crate is needed.
pub struct MarkdownExtractor;

impl TextExtractor for MarkdownExtractor {
    fn extract(&self, storage_path: &Path) -> Result<ExtractedDoc, ExtractError> {
        let bytes = std::fs::read(storage_path)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| ExtractError::Corrupt(format!("not valid utf-8: {e}")))?;
        let (char_count, word_count, line_count) = base_stats(&text);
        Ok(ExtractedDoc {
            detected_language: detect_language(&text),
            headings: find_headings(&text),
            tables: find_tables(&text),
            images: find_images(&text),
            char_count,
            word_count,
            line_count,
            raw_text: text,
        })
    }

    fn supports(&self, extension: &str) -> bool {
        extension.eq_ignore_ascii_case("md") || extension.eq_ignore_ascii_case("markdown")
    }
}

/// Selects an extractor by file extension; unknown extensions are `unsupported`, not `corrupt`.
pub struct ExtractorRegistry {
    extractors: Vec<Box<dyn TextExtractor>>,
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self {
            extractors: vec![Box::new(MarkdownExtractor), Box::new(PlainTextExtractor)],
        }
    }
}

impl ExtractorRegistry {
    pub fn extract(&self, storage_path: &Path, file_name: &str) -> Result<ExtractedDoc, ExtractError> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let extractor = self
            .extractors
            .iter()
            .find(|e| e.supports(extension))
            .ok_or_else(|| ExtractError::Unsupported(extension.to_string()))?;
        extractor.extract(storage_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn markdown_extractor_finds_headings() {
        let mut file = tempfile::NamedTempFile::with_suffix(".md").unwrap();
        writeln!(file, "# Title\nAdd login API.\n## Sub\nmore text").unwrap();
        let doc = MarkdownExtractor.extract(file.path()).unwrap();
        assert_eq!(doc.headings.len(), 2);
        assert_eq!(doc.headings[0].level, 1);
        assert_eq!(doc.headings[1].level, 2);
    }

    #[test]
    fn empty_document_yields_zero_counts_without_panicking() {
        let file = tempfile::NamedTempFile::with_suffix(".txt").unwrap();
        let doc = PlainTextExtractor.extract(file.path()).unwrap();
        assert_eq!(doc.char_count, 0);
        assert!(doc.headings.is_empty());
    }

    #[test]
    fn unsupported_extension_is_distinct_from_corrupt() {
        let registry = ExtractorRegistry::default();
        let file = tempfile::NamedTempFile::with_suffix(".zip").unwrap();
        let err = registry.extract(file.path(), "archive.zip").unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }
}
