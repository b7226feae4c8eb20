use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::approval::Verdict;
use crate::chapter::{ChapterPipeline, ChapterResult};
use crate::config::{ModelRoles, DEFAULT_MAX_CHAPTER_ATTEMPTS};
use crate::generation::{generate_cleaned, GenerationError, TextGenerator};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{self, PromptError, PromptRegistry};
use crate::structure::BookStructure;

pub const STRUCTURE_FILE_NAME: &str = "structure.md";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum BookStage {
    Ideas,
    Synopsis,
    QualityReview,
    FinalCheck,
    Structure,
}

impl BookStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ideas => "idea generation",
            Self::Synopsis => "synopsis",
            Self::QualityReview => "quality review",
            Self::FinalCheck => "final check",
            Self::Structure => "book structure",
        }
    }

    fn prompt_key(&self) -> &'static str {
        match self {
            Self::Ideas => prompts::IDEA_GENERATION,
            Self::Synopsis => prompts::STORY_SYNOPSIS,
            Self::QualityReview => prompts::QUALITY_VERIFICATION,
            Self::FinalCheck => prompts::FINAL_APPROVAL_CHECK,
            Self::Structure => prompts::BOOK_STRUCTURE,
        }
    }
}

impl fmt::Display for BookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum BookError {
    #[error("failed to render prompt for {stage}: {source}")]
    Prompt {
        stage: BookStage,
        #[source]
        source: PromptError,
    },
    #[error("text generation failed for {stage}: {source}")]
    Generation {
        stage: BookStage,
        #[source]
        source: GenerationError,
    },
    #[error("failed to create book directory `{path}`: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A file that could not be written. Logged and collected, never fatal.
#[derive(Debug, Error)]
#[error("failed to write `{path}`: {source}")]
pub struct PersistenceError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Clone, Debug, Default)]
pub struct BookRequest {
    pub theme: String,
}

impl BookRequest {
    pub fn new(theme: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
        }
    }
}

/// Intermediate texts produced before the approval gate.
#[derive(Clone, Debug, Default)]
pub struct BookArtifacts {
    pub ideas: String,
    pub synopsis: String,
    /// Absent when the review call failed; the review never blocks the run.
    pub quality_report: Option<String>,
    pub final_check: String,
}

#[derive(Debug)]
pub struct BookReport {
    pub artifacts: BookArtifacts,
    pub structure: BookStructure,
    pub book_dir: PathBuf,
    pub chapters: Vec<ChapterResult>,
    pub written_files: Vec<PathBuf>,
    pub persistence_errors: Vec<PersistenceError>,
}

impl BookReport {
    pub fn finalized_count(&self) -> usize {
        self.chapters
            .iter()
            .filter(|result| result.is_finalized())
            .count()
    }
}

#[derive(Debug)]
pub enum BookOutcome {
    /// The final check rejected the synopsis; nothing was written.
    Cancelled { artifacts: BookArtifacts },
    Completed(Box<BookReport>),
}

/// Runs the whole book: ideas, synopsis, review, gate, structure, then one
/// chapter pipeline per extracted chapter, writing results under
/// `<output_root>/<title>/`.
pub struct BookPipeline<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    models: ModelRoles,
    max_chapter_attempts: usize,
}

impl<'a> BookPipeline<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink, models: ModelRoles) -> Self {
        Self {
            prompts,
            sink,
            models,
            max_chapter_attempts: DEFAULT_MAX_CHAPTER_ATTEMPTS,
        }
    }

    pub fn with_max_chapter_attempts(mut self, attempts: usize) -> Self {
        self.max_chapter_attempts = attempts.max(1);
        self
    }

    pub fn run<G: TextGenerator + ?Sized>(
        &self,
        generator: &G,
        output_root: impl AsRef<Path>,
        request: &BookRequest,
    ) -> Result<BookOutcome, BookError> {
        let theme = request.theme.trim();

        self.log(LogLevel::Info, "Phase 1: generating story ideas...");
        let ideas = self.invoke(generator, BookStage::Ideas, "theme", theme, &self.models.creative)?;

        self.log(LogLevel::Info, "Phase 2: writing the synopsis...");
        let synopsis =
            self.invoke(generator, BookStage::Synopsis, "ideas", &ideas, &self.models.creative)?;

        self.log(LogLevel::Info, "Phase 3: reviewing synopsis quality...");
        let quality_report = match self.invoke(
            generator,
            BookStage::QualityReview,
            "story",
            &synopsis,
            &self.models.quality,
        ) {
            Ok(report) => Some(report),
            Err(BookError::Generation { source, .. }) => {
                self.log(
                    LogLevel::Warn,
                    format!("Quality review unavailable, continuing without it: {source}"),
                );
                None
            }
            Err(other) => return Err(other),
        };

        self.log(LogLevel::Info, "Phase 4: final approval check...");
        let final_check = self.invoke(
            generator,
            BookStage::FinalCheck,
            "story",
            &synopsis,
            &self.models.verifier,
        )?;
        let verdict = Verdict::from_text(&final_check);
        self.log(LogLevel::Info, format!("Final check result: {}", verdict.label()));

        let artifacts = BookArtifacts {
            ideas,
            synopsis,
            quality_report,
            final_check,
        };

        if !verdict.is_approved() {
            self.log(
                LogLevel::Warn,
                "Synopsis not approved, book generation cancelled.",
            );
            return Ok(BookOutcome::Cancelled { artifacts });
        }

        self.log(LogLevel::Info, "Phase 5: generating the book structure...");
        let structure_text = self.invoke(
            generator,
            BookStage::Structure,
            "story",
            &artifacts.synopsis,
            &self.models.creative,
        )?;
        let structure = BookStructure::from_text(structure_text);
        for label in structure.rejected() {
            self.log(
                LogLevel::Warn,
                format!("Chapter {label} has no synopsis in the structure and was dropped."),
            );
        }
        if structure.is_empty() {
            self.log(
                LogLevel::Warn,
                "No chapters could be extracted from the structure; nothing to generate.",
            );
        } else {
            self.log(
                LogLevel::Info,
                format!(
                    "Structure \"{}\" with {} chapters.",
                    structure.title(),
                    structure.len()
                ),
            );
        }

        let book_dir = output_root.as_ref().join(structure.title());
        fs::create_dir_all(&book_dir).map_err(|source| BookError::CreateDir {
            path: book_dir.clone(),
            source,
        })?;

        let mut written_files = Vec::new();
        let mut persistence_errors = Vec::new();
        self.persist(
            book_dir.join(STRUCTURE_FILE_NAME),
            structure.raw_text(),
            &mut written_files,
            &mut persistence_errors,
        );

        let chapter_pipeline = ChapterPipeline::new(self.prompts, self.sink, self.models.clone())
            .with_max_attempts(self.max_chapter_attempts);
        let mut chapters = Vec::with_capacity(structure.len());
        let mut used_names = HashSet::from([STRUCTURE_FILE_NAME.to_string()]);

        for (index, chapter) in structure.chapters().iter().enumerate() {
            self.log(
                LogLevel::Info,
                format!(
                    "Phase 6: chapter {}/{}: {}",
                    index + 1,
                    structure.len(),
                    chapter.heading()
                ),
            );

            let result = match chapter_pipeline.run(generator, chapter) {
                Ok(result) => result,
                Err(err) => {
                    self.log(LogLevel::Error, format!("{err}; chapter skipped."));
                    ChapterResult::aborted(chapter.clone())
                }
            };

            if let Some(text) = result.final_text.as_deref() {
                let stem = chapter.file_stem();
                let file_name = unique_file_name(&stem, &mut used_names);
                if file_name != format!("{stem}.md") {
                    self.log(
                        LogLevel::Warn,
                        format!("{stem}.md is already taken; saving {} as {file_name}.", chapter.heading()),
                    );
                }
                let path = book_dir.join(file_name);
                let content = format!("# {}\n\n{}\n", chapter.heading(), text);
                self.persist(path, &content, &mut written_files, &mut persistence_errors);
            }

            chapters.push(result);
        }

        let report = BookReport {
            artifacts,
            structure,
            book_dir,
            chapters,
            written_files,
            persistence_errors,
        };
        self.log(
            LogLevel::Info,
            format!(
                "Book saved to {} ({}/{} chapters finalized).",
                report.book_dir.display(),
                report.finalized_count(),
                report.chapters.len()
            ),
        );

        Ok(BookOutcome::Completed(Box::new(report)))
    }

    fn invoke<G: TextGenerator + ?Sized>(
        &self,
        generator: &G,
        stage: BookStage,
        variable: &str,
        value: &str,
        model: &str,
    ) -> Result<String, BookError> {
        let prompt = self
            .prompts
            .format_with(stage.prompt_key(), [(variable, value)])
            .map_err(|source| BookError::Prompt { stage, source })?;
        self.log(
            LogLevel::Debug,
            format!("Prompt for {stage} (model `{model}`):\n{prompt}"),
        );

        // The gate reads the raw verdict, reasoning blocks included.
        let response = if stage == BookStage::FinalCheck {
            generator.generate(&prompt, model)
        } else {
            generate_cleaned(generator, &prompt, model)
        }
        .map_err(|source| BookError::Generation { stage, source })?;
        self.log(LogLevel::Debug, format!("Response for {stage}:\n{response}"));
        Ok(response)
    }

    fn persist(
        &self,
        path: PathBuf,
        content: &str,
        written: &mut Vec<PathBuf>,
        errors: &mut Vec<PersistenceError>,
    ) {
        match fs::write(&path, content) {
            Ok(()) => {
                self.log(LogLevel::Info, format!("Wrote {}", path.display()));
                written.push(path);
            }
            Err(source) => {
                let err = PersistenceError { path, source };
                self.log(LogLevel::Error, err.to_string());
                errors.push(err);
            }
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

/// `<stem>.md`, or `<stem>-<n>.md` for the n-th chapter sharing a stem.
fn unique_file_name(stem: &str, used: &mut HashSet<String>) -> String {
    let mut name = format!("{stem}.md");
    let mut occurrence = 1;
    while used.contains(&name) {
        occurrence += 1;
        name = format!("{stem}-{occurrence}.md");
    }
    used.insert(name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::VecLogSink;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct ScriptedGenerator {
        responses: Mutex<VecDeque<Result<String, String>>>,
        models: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<Result<&str, &str>>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                models: Mutex::new(Vec::new()),
            }
        }

        fn models(&self) -> Vec<String> {
            self.models.lock().unwrap().clone()
        }
    }

    impl TextGenerator for ScriptedGenerator {
        fn generate(&self, _prompt: &str, model: &str) -> Result<String, GenerationError> {
            self.models.lock().unwrap().push(model.to_string());
            let next = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err("no more scripted responses".to_string()));
            next.map_err(|message| {
                GenerationError::new(io::Error::new(io::ErrorKind::Other, message))
            })
        }
    }

    fn pipeline<'a>(prompts: &'a PromptRegistry, sink: &'a VecLogSink) -> BookPipeline<'a> {
        BookPipeline::new(prompts, sink, ModelRoles::new("writer", "critic", "judge"))
    }

    #[test]
    fn synopsis_failure_aborts_before_the_gate() {
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let output = tempdir().unwrap();
        let generator = ScriptedGenerator::new(vec![Ok("ideas"), Err("model offline")]);

        let err = pipeline(&prompts, &sink)
            .run(&generator, output.path(), &BookRequest::new("sky whales"))
            .expect_err("synopsis failure is fatal");

        assert!(matches!(
            err,
            BookError::Generation {
                stage: BookStage::Synopsis,
                ..
            }
        ));
        assert_eq!(generator.models(), vec!["writer", "writer"]);
        assert_eq!(fs::read_dir(output.path()).unwrap().count(), 0);
    }

    #[test]
    fn quality_review_failure_is_informational() {
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let output = tempdir().unwrap();
        let generator = ScriptedGenerator::new(vec![
            Ok("ideas"),
            Ok("synopsis"),
            Err("review timed out"),
            Ok("NO"),
        ]);

        let outcome = pipeline(&prompts, &sink)
            .run(&generator, output.path(), &BookRequest::new("sky whales"))
            .unwrap();

        match outcome {
            BookOutcome::Cancelled { artifacts } => {
                assert_eq!(artifacts.quality_report, None);
                assert_eq!(artifacts.final_check, "NO");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(sink.contains("Quality review unavailable"));
        assert_eq!(generator.models(), vec!["writer", "writer", "critic", "judge"]);
    }

    #[test]
    fn unparseable_structure_writes_only_the_outline() {
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let output = tempdir().unwrap();
        let generator = ScriptedGenerator::new(vec![
            Ok("ideas"),
            Ok("synopsis"),
            Ok("report"),
            Ok("YES"),
            Ok("A lovely book with no outline at all."),
        ]);

        let outcome = pipeline(&prompts, &sink)
            .run(&generator, output.path(), &BookRequest::new("sky whales"))
            .unwrap();

        let BookOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        assert!(report.chapters.is_empty());
        assert_eq!(report.book_dir, output.path().join("Fantasy_Book"));
        assert_eq!(report.written_files, vec![report.book_dir.join(STRUCTURE_FILE_NAME)]);
        assert!(sink.contains("nothing to generate"));
    }

    #[test]
    fn unwritable_output_root_is_fatal() {
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let output = tempdir().unwrap();
        let blocker = output.path().join("occupied");
        fs::write(&blocker, "not a directory").unwrap();
        let generator = ScriptedGenerator::new(vec![
            Ok("ideas"),
            Ok("synopsis"),
            Ok("report"),
            Ok("YES"),
            Ok("TITLE: Anything\nCHAPTER 1: One\nSYNOPSIS: s"),
        ]);

        let err = pipeline(&prompts, &sink)
            .run(&generator, &blocker, &BookRequest::new("sky whales"))
            .expect_err("cannot create directory under a file");

        assert!(matches!(err, BookError::CreateDir { .. }));
    }

    #[test]
    fn final_check_reads_reasoning_blocks() {
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let output = tempdir().unwrap();
        let generator = ScriptedGenerator::new(vec![
            Ok("ideas"),
            Ok("synopsis"),
            Ok("report"),
            Ok("<think>The pacing works, so yes.</think>\nNO"),
            Ok("No outline here."),
        ]);

        let outcome = pipeline(&prompts, &sink)
            .run(&generator, output.path(), &BookRequest::new("sky whales"))
            .unwrap();

        let BookOutcome::Completed(report) = outcome else {
            panic!("expected the gate to pass");
        };
        assert!(report.artifacts.final_check.starts_with("<think>"));
    }

    #[test]
    fn reasoning_only_verdict_is_not_a_generation_failure() {
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let output = tempdir().unwrap();
        let generator = ScriptedGenerator::new(vec![
            Ok("ideas"),
            Ok("synopsis"),
            Ok("report"),
            Ok("<think>yes</think>"),
            Ok("No outline here."),
        ]);

        let outcome = pipeline(&prompts, &sink)
            .run(&generator, output.path(), &BookRequest::new("sky whales"))
            .unwrap();

        assert!(matches!(outcome, BookOutcome::Completed(_)));
        assert_eq!(generator.models().len(), 5);
    }

    #[test]
    fn repeated_chapter_numbers_get_distinct_files() {
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let output = tempdir().unwrap();
        let generator = ScriptedGenerator::new(vec![
            Ok("ideas"),
            Ok("synopsis"),
            Ok("report"),
            Ok("YES"),
            Ok("TITLE: Twins\nCHAPTER 2: First\nSYNOPSIS: a\nCHAPTER 2: Second\nSYNOPSIS: b"),
            Ok("draft a"),
            Ok("YES"),
            Ok("first final"),
            Ok("draft b"),
            Ok("YES"),
            Ok("second final"),
        ]);

        let outcome = pipeline(&prompts, &sink)
            .run(&generator, output.path(), &BookRequest::new("sky whales"))
            .unwrap();

        let BookOutcome::Completed(report) = outcome else {
            panic!("expected a completed run");
        };
        let book_dir = output.path().join("Twins");
        assert_eq!(
            report.written_files,
            vec![
                book_dir.join(STRUCTURE_FILE_NAME),
                book_dir.join("2.md"),
                book_dir.join("2-2.md"),
            ]
        );
        assert_eq!(
            fs::read_to_string(book_dir.join("2.md")).unwrap(),
            "# Chapter 2: First\n\nfirst final\n"
        );
        assert_eq!(
            fs::read_to_string(book_dir.join("2-2.md")).unwrap(),
            "# Chapter 2: Second\n\nsecond final\n"
        );
        assert!(sink.contains("2.md is already taken"));
    }

    #[test]
    fn chapter_named_like_the_outline_does_not_replace_it() {
        let mut used = HashSet::from([STRUCTURE_FILE_NAME.to_string()]);
        assert_eq!(unique_file_name("structure", &mut used), "structure-2.md");
        assert_eq!(unique_file_name("1", &mut used), "1.md");
        assert_eq!(unique_file_name("1", &mut used), "1-2.md");
        assert_eq!(unique_file_name("1", &mut used), "1-3.md");
    }
}
