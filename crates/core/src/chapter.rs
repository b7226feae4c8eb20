use std::fmt;

use thiserror::Error;

use crate::approval::approve;
use crate::config::{ModelRoles, DEFAULT_MAX_CHAPTER_ATTEMPTS};
use crate::generation::{generate_cleaned, TextGenerator};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{self, PromptError, PromptRegistry};
use crate::structure::ChapterDescriptor;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChapterStage {
    Draft,
    Verification,
    Finalization,
}

impl ChapterStage {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Verification => "verification",
            Self::Finalization => "finalization",
        }
    }

    fn prompt_key(&self) -> &'static str {
        match self {
            Self::Draft => prompts::CHAPTER_DRAFT,
            Self::Verification => prompts::CHAPTER_VERIFICATION,
            Self::Finalization => prompts::FINAL_CHAPTER,
        }
    }
}

impl fmt::Display for ChapterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ChapterError {
    #[error("failed to render {stage} prompt for chapter {chapter}: {source}")]
    Prompt {
        chapter: String,
        stage: ChapterStage,
        #[source]
        source: PromptError,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChapterState {
    Drafting,
    Verifying,
    Approved,
    Rejected,
    Finalized,
    Failed,
}

impl ChapterState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }
}

/// One draft that made it to verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationAttempt {
    pub chapter: ChapterDescriptor,
    pub draft_text: String,
    pub verification_verdict: bool,
    pub attempt_index: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChapterResult {
    pub chapter: ChapterDescriptor,
    pub final_text: Option<String>,
    /// A draft passed verification. Finalization may still have failed.
    pub approved: bool,
    pub state: ChapterState,
    pub attempts_used: usize,
    pub attempts: Vec<GenerationAttempt>,
}

impl ChapterResult {
    pub fn is_finalized(&self) -> bool {
        self.state == ChapterState::Finalized && self.final_text.is_some()
    }

    /// Result for a chapter that could not be attempted at all.
    pub fn aborted(chapter: ChapterDescriptor) -> Self {
        Self {
            chapter,
            final_text: None,
            approved: false,
            state: ChapterState::Failed,
            attempts_used: 0,
            attempts: Vec::new(),
        }
    }
}

/// Draft → verify loop with a bounded number of attempts, followed by a
/// single finalization call once a draft is approved.
///
/// Generation failures never escape: a failed draft uses up an attempt, a
/// failed verification counts as a rejection and a failed finalization ends
/// the chapter as [`ChapterState::Failed`]. Only prompt rendering errors are
/// returned, since retrying cannot fix them.
pub struct ChapterPipeline<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    models: ModelRoles,
    max_attempts: usize,
}

impl<'a> ChapterPipeline<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink, models: ModelRoles) -> Self {
        Self {
            prompts,
            sink,
            models,
            max_attempts: DEFAULT_MAX_CHAPTER_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn run<G: TextGenerator + ?Sized>(
        &self,
        generator: &G,
        chapter: &ChapterDescriptor,
    ) -> Result<ChapterResult, ChapterError> {
        let label = chapter.heading();
        let mut state = ChapterState::Drafting;
        let mut attempt = 0usize;
        let mut draft = String::new();
        let mut attempts = Vec::new();
        let mut final_text = None;
        let mut approved = false;

        while !state.is_terminal() {
            state = match state {
                ChapterState::Drafting => {
                    attempt += 1;
                    self.log(
                        LogLevel::Info,
                        format!("{label}: drafting (attempt {attempt}/{})", self.max_attempts),
                    );
                    let prompt = self.render(chapter, ChapterStage::Draft, None)?;
                    match generate_cleaned(generator, &prompt, &self.models.creative) {
                        Ok(text) => {
                            self.log(LogLevel::Debug, format!("{label}: draft\n{text}"));
                            draft = text;
                            ChapterState::Verifying
                        }
                        Err(err) => {
                            self.log(
                                LogLevel::Warn,
                                format!("{label}: draft generation failed (attempt {attempt}): {err}"),
                            );
                            ChapterState::Rejected
                        }
                    }
                }
                ChapterState::Verifying => {
                    let prompt = self.render(chapter, ChapterStage::Verification, Some(&draft))?;
                    let verdict = match generator.generate(&prompt, &self.models.verifier) {
                        Ok(text) => {
                            self.log(LogLevel::Debug, format!("{label}: verdict\n{text}"));
                            approve(&text)
                        }
                        Err(err) => {
                            self.log(
                                LogLevel::Warn,
                                format!("{label}: verification failed (attempt {attempt}): {err}"),
                            );
                            false
                        }
                    };
                    attempts.push(GenerationAttempt {
                        chapter: chapter.clone(),
                        draft_text: draft.clone(),
                        verification_verdict: verdict,
                        attempt_index: attempt,
                    });
                    if verdict {
                        ChapterState::Approved
                    } else {
                        self.log(LogLevel::Info, format!("{label}: draft rejected"));
                        ChapterState::Rejected
                    }
                }
                ChapterState::Rejected => {
                    if attempt < self.max_attempts {
                        ChapterState::Drafting
                    } else {
                        self.log(
                            LogLevel::Warn,
                            format!(
                                "{label}: no approved draft after {} attempts, skipping",
                                self.max_attempts
                            ),
                        );
                        ChapterState::Failed
                    }
                }
                ChapterState::Approved => {
                    approved = true;
                    self.log(LogLevel::Info, format!("{label}: draft approved, finalizing"));
                    let prompt = self.render(chapter, ChapterStage::Finalization, Some(&draft))?;
                    match generate_cleaned(generator, &prompt, &self.models.creative) {
                        Ok(text) => {
                            final_text = Some(text);
                            ChapterState::Finalized
                        }
                        Err(err) => {
                            self.log(
                                LogLevel::Error,
                                format!("{label}: finalization failed: {err}"),
                            );
                            ChapterState::Failed
                        }
                    }
                }
                ChapterState::Finalized | ChapterState::Failed => state,
            };
        }

        Ok(ChapterResult {
            chapter: chapter.clone(),
            final_text,
            approved,
            state,
            attempts_used: attempt,
            attempts,
        })
    }

    fn render(
        &self,
        chapter: &ChapterDescriptor,
        stage: ChapterStage,
        draft: Option<&str>,
    ) -> Result<String, ChapterError> {
        let mut arguments = vec![
            ("chapter_num", chapter.number.clone()),
            ("chapter_title", chapter.title.clone()),
            ("chapter_synopsis", chapter.synopsis.clone()),
        ];
        match stage {
            ChapterStage::Draft => {}
            ChapterStage::Verification => {
                arguments.push(("chapter_content", draft.unwrap_or_default().to_string()));
            }
            ChapterStage::Finalization => {
                arguments.push(("chapter_content_draft", draft.unwrap_or_default().to_string()));
            }
        }

        self.prompts
            .format_with(stage.prompt_key(), arguments)
            .map_err(|source| ChapterError::Prompt {
                chapter: chapter.number.clone(),
                stage,
                source,
            })
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}
