//! Extraction of the book outline from the structure generation output.
//!
//! The input is free-form model output that was asked to follow the
//! `TITLE:` / `CHAPTER n: title` / `SYNOPSIS:` / `KEY EVENTS:` layout. Parsing
//! is best-effort: anything that does not fit is dropped, never an error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const FALLBACK_TITLE: &str = "Fantasy_Book";

const SYNOPSIS_MARKER: &str = "SYNOPSIS:";
const KEY_EVENTS_MARKER: &str = "KEY EVENTS:";
const CHAPTER_MARKER: &str = "CHAPTER";
const UNSAFE_PATH_CHARS: [char; 9] = ['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// One chapter of the outline. `number` is kept exactly as the model wrote
/// it; it is a label for headings and file names, not a sort key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChapterDescriptor {
    pub number: String,
    pub title: String,
    pub synopsis: String,
}

impl ChapterDescriptor {
    pub fn new(
        number: impl Into<String>,
        title: impl Into<String>,
        synopsis: impl Into<String>,
    ) -> Self {
        Self {
            number: number.into(),
            title: title.into(),
            synopsis: synopsis.into(),
        }
    }

    pub fn heading(&self) -> String {
        format!("Chapter {}: {}", self.number, self.title)
    }

    /// File stem for the finished chapter, safe to use as a path component.
    pub fn file_stem(&self) -> String {
        sanitize_path_component(&self.number)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BookStructure {
    raw_text: String,
    title: String,
    chapters: Vec<ChapterDescriptor>,
    rejected: Vec<String>,
}

impl BookStructure {
    pub fn from_text(raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        let title = extract_title(&raw_text);
        let (chapters, rejected) = extract_chapters(&raw_text);
        Self {
            raw_text,
            title,
            chapters,
            rejected,
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// Sanitized title, usable as a directory name.
    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn chapters(&self) -> &[ChapterDescriptor] {
        &self.chapters
    }

    /// Labels of chapter headers that had no usable synopsis.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}

/// Title from the first `TITLE:` line, sanitized; `Fantasy_Book` when absent
/// or when it would name the current or parent directory.
pub fn extract_title(text: &str) -> String {
    title_regex()
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| strip_emphasis(m.as_str()))
        .filter(|title| !title.is_empty())
        .map(|title| sanitize_path_component(&title))
        .filter(|title| !title.chars().all(|ch| ch == '.'))
        .unwrap_or_else(|| FALLBACK_TITLE.to_string())
}

/// Replaces each of `\ / * ? : " < > |` with `_`.
pub fn sanitize_path_component(value: &str) -> String {
    value
        .chars()
        .map(|ch| if UNSAFE_PATH_CHARS.contains(&ch) { '_' } else { ch })
        .collect()
}

pub fn parse_chapters(text: &str) -> Vec<ChapterDescriptor> {
    extract_chapters(text).0
}

fn extract_chapters(text: &str) -> (Vec<ChapterDescriptor>, Vec<String>) {
    let headers: Vec<_> = header_regex().captures_iter(text).collect();
    let mut chapters = Vec::with_capacity(headers.len());
    let mut rejected = Vec::new();

    for (index, caps) in headers.iter().enumerate() {
        let (Some(whole), Some(number)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let number = number.as_str().trim().to_string();
        let block_end = headers
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(text.len());
        let body = &text[whole.end()..block_end];

        let Some(synopsis) = synopsis_section(body) else {
            rejected.push(number);
            continue;
        };

        let mut title = caps
            .get(2)
            .map(|m| strip_emphasis(m.as_str()))
            .unwrap_or_default();
        if title.is_empty() {
            title = format!("Chapter {number}");
        }

        chapters.push(ChapterDescriptor {
            number,
            title,
            synopsis,
        });
    }

    (chapters, rejected)
}

fn synopsis_section(body: &str) -> Option<String> {
    let start = body.find(SYNOPSIS_MARKER)? + SYNOPSIS_MARKER.len();
    let rest = &body[start..];
    // Loose headings (`CHAPTER TWO - ...`) are not block boundaries but still
    // end the synopsis.
    let end = [KEY_EVENTS_MARKER, CHAPTER_MARKER]
        .iter()
        .filter_map(|marker| rest.find(marker))
        .min()
        .unwrap_or(rest.len());
    let synopsis = strip_emphasis(&rest[..end]);
    if synopsis.is_empty() {
        None
    } else {
        Some(synopsis)
    }
}

// Models like to bold the markers (`**TITLE:** ...`), which leaves stray
// asterisks around the captured text.
fn strip_emphasis(value: &str) -> String {
    value.trim().trim_matches('*').trim().to_string()
}

fn title_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?m)TITLE:[ \t]*([^\r\n]*)").expect("invalid title regex"))
}

fn header_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"CHAPTER[ \t]+([^\s:]+)[ \t]*:[ \t]*([^\r\n]*)")
            .expect("invalid chapter header regex")
    })
}
