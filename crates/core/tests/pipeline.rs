use std::collections::VecDeque;
use std::fs;
use std::io;
use std::sync::Mutex;

use fablesmith_core::{
    BookOutcome, BookPipeline, BookRequest, ChapterState, GenerationError, ModelRoles,
    PromptRegistry, TextGenerator, VecLogSink, STRUCTURE_FILE_NAME,
};
use tempfile::tempdir;

struct MockTextGenerator {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl MockTextGenerator {
    fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    fn remaining(&self) -> usize {
        self.responses.lock().expect("mock mutex poisoned").len()
    }

    fn prompts_containing(&self, needle: &str) -> usize {
        self.prompts
            .lock()
            .expect("mock mutex poisoned")
            .iter()
            .filter(|prompt| prompt.contains(needle))
            .count()
    }
}

impl TextGenerator for MockTextGenerator {
    fn generate(&self, prompt: &str, _model: &str) -> Result<String, GenerationError> {
        self.prompts
            .lock()
            .expect("mock mutex poisoned")
            .push(prompt.to_string());
        let mut guard = self.responses.lock().expect("mock mutex poisoned");
        guard.pop_front().ok_or_else(|| {
            GenerationError::new(io::Error::new(
                io::ErrorKind::Other,
                "mock text generator has no remaining responses",
            ))
        })
    }
}

const STRUCTURE_TEXT: &str = "\
TITLE: The Salt Crown: Book One?

CHAPTER 1: Tidewake

SYNOPSIS: A drowned bell rings in the harbor of Vell.

KEY EVENTS:
- The bell rings

CHAPTER 2: The Brine Court

SYNOPSIS: Isel is summoned before the court of salt.

KEY EVENTS:
- The summons

CHAPTER 3: Low Water

SYNOPSIS: The sea withdraws and reveals the crown.
";

fn roles() -> ModelRoles {
    ModelRoles::new("creative", "quality", "verifier")
}

#[test]
fn rejected_final_check_runs_no_chapters_and_writes_nothing() {
    let temp = tempdir().expect("temp dir");
    let prompts = PromptRegistry::new().expect("registry");
    let sink = VecLogSink::new();
    let mock = MockTextGenerator::new([
        "five ideas",
        "a synopsis",
        "a quality report",
        "NO",
        STRUCTURE_TEXT,
        "unused draft",
    ]);

    let outcome = BookPipeline::new(&prompts, &sink, roles())
        .run(&mock, temp.path(), &BookRequest::new("a drowned kingdom"))
        .expect("run completes");

    assert!(matches!(outcome, BookOutcome::Cancelled { .. }));
    assert_eq!(mock.remaining(), 2);
    assert_eq!(mock.prompts_containing("chapter-by-chapter structure"), 0);
    assert_eq!(mock.prompts_containing("Draft Chapter"), 0);
    assert_eq!(fs::read_dir(temp.path()).expect("read output").count(), 0);
    assert!(sink.contains("cancelled"));
}

#[test]
fn approved_book_writes_structure_and_finalized_chapters() -> Result<(), Box<dyn std::error::Error>>
{
    let temp = tempdir()?;
    let prompts = PromptRegistry::new()?;
    let sink = VecLogSink::new();
    let mock = MockTextGenerator::new([
        "five ideas",
        "a synopsis",
        "a quality report",
        "<think>The twist is weak... but yes overall.</think>\nYES",
        STRUCTURE_TEXT,
        // Chapter 1: approved on the first attempt.
        "draft of tidewake",
        "YES, consistent",
        "Tidewake, final.",
        // Chapter 2: rejected three times.
        "draft a",
        "NO",
        "draft b",
        "NO",
        "draft c",
        "NO",
        // Chapter 3: approved on the second attempt.
        "draft x",
        "NO",
        "draft y",
        "Yes.",
        "Low Water, final.",
    ]);

    let outcome = BookPipeline::new(&prompts, &sink, roles()).run(
        &mock,
        temp.path(),
        &BookRequest::new("a drowned kingdom"),
    )?;

    let BookOutcome::Completed(report) = outcome else {
        panic!("expected the book to be generated");
    };
    assert_eq!(mock.remaining(), 0);

    let book_dir = temp.path().join("The Salt Crown_ Book One_");
    assert_eq!(report.book_dir, book_dir);
    assert_eq!(report.structure.len(), 3);
    assert_eq!(report.finalized_count(), 2);
    assert_eq!(report.chapters[1].state, ChapterState::Failed);
    assert_eq!(report.chapters[1].attempts_used, 3);
    assert_eq!(report.chapters[2].attempts_used, 2);
    assert!(report.persistence_errors.is_empty());

    let structure = fs::read_to_string(book_dir.join(STRUCTURE_FILE_NAME))?;
    assert_eq!(structure, STRUCTURE_TEXT.trim());

    let first = fs::read_to_string(book_dir.join("1.md"))?;
    assert_eq!(first, "# Chapter 1: Tidewake\n\nTidewake, final.\n");
    assert!(!book_dir.join("2.md").exists());
    let third = fs::read_to_string(book_dir.join("3.md"))?;
    assert!(third.starts_with("# Chapter 3: Low Water\n\n"));

    assert_eq!(fs::read_dir(&book_dir)?.count(), 3);
    assert_eq!(mock.prompts_containing("FINAL VERSION"), 2);

    Ok(())
}
