pub mod approval;
pub mod book;
pub mod chapter;
pub mod config;
pub mod generation;
pub mod logging;
pub mod prompts;
pub mod structure;

pub use approval::{approve, Verdict};
pub use book::{
    BookArtifacts, BookError, BookOutcome, BookPipeline, BookReport, BookRequest, BookStage,
    PersistenceError, STRUCTURE_FILE_NAME,
};
pub use chapter::{
    ChapterError, ChapterPipeline, ChapterResult, ChapterStage, ChapterState, GenerationAttempt,
};
pub use config::{
    BookConfig, Config, ConfigError, ConfigStore, LlmConfig, ModelRoles, PromptConfig,
    RecentUsage,
};
pub use generation::{clean_response, generate_cleaned, GenerationError, TextGenerator};
pub use logging::{
    LogLevel, LogRecord, LogSink, NullLogSink, StdoutLogSink, VecLogSink,
};
pub use prompts::{PromptArguments, PromptError, PromptRegistry, PromptSource, PromptTemplate};
pub use structure::{
    extract_title, parse_chapters, sanitize_path_component, BookStructure, ChapterDescriptor,
    FALLBACK_TITLE,
};
