use clap::{Args, Parser, Subcommand};
use fablesmith_adapters::{create_text_generator, AdapterError, ProfileTextGenerator};
use fablesmith_core::config::{DEFAULT_OUTPUT_DIR, DEFAULT_THEME};
use fablesmith_core::{
    generate_cleaned, BookError, BookOutcome, BookPipeline, BookReport, BookRequest, ChapterState,
    Config, ConfigError, ConfigStore, GenerationError, LogLevel, LogRecord, LogSink, PromptError,
    PromptRegistry, StdoutLogSink,
};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

const PROBE_PROMPT: &str = "Please reply 'OK'";

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let sink = if cli.verbose {
        StdoutLogSink::with_min_level(LogLevel::Debug)
    } else {
        StdoutLogSink::new()
    };
    install_log_bridge(&sink, cli.verbose);

    match cli.command {
        Command::Generate(args) => run_generate(&cli.config, args, &sink),
        Command::Config(command) => handle_config(&cli.config, command, &sink),
        Command::Prompts(command) => handle_prompts(&cli.config, command),
    }
}

/// Forwards `log` records emitted by the workspace crates (transport
/// retries, truncated responses) into the progress sink.
struct SinkLogger<S> {
    sink: S,
    max_level: log::LevelFilter,
}

impl<S: LogSink> SinkLogger<S> {
    fn new(sink: S, verbose: bool) -> Self {
        let max_level = if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        };
        Self { sink, max_level }
    }
}

impl<S: LogSink> log::Log for SinkLogger<S> {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.max_level && metadata.target().starts_with("fablesmith")
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            self.sink.log(LogRecord::new(
                sink_level(record.level()),
                record.args().to_string(),
            ));
        }
    }

    fn flush(&self) {}
}

fn sink_level(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

fn install_log_bridge(sink: &StdoutLogSink, verbose: bool) {
    static LOGGER: OnceLock<SinkLogger<StdoutLogSink>> = OnceLock::new();
    let logger = LOGGER.get_or_init(|| SinkLogger::new(sink.clone(), verbose));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(logger.max_level);
    }
}

fn handle_config(
    config_path: &Path,
    command: ConfigCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::Init(args) => run_config_init(config_path, args, sink),
        ConfigCommand::TestLlm(args) => run_test_llm(config_path, args, sink),
    }
}

fn handle_prompts(config_path: &Path, command: PromptsCommand) -> Result<(), CliError> {
    let store = ConfigStore::open(config_path.to_path_buf())?;
    let prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;

    match command {
        PromptsCommand::List => {
            for key in prompts.keys() {
                let Some(template) = prompts.get(key) else {
                    continue;
                };
                let origin = template
                    .source()
                    .as_path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "built-in".to_string());
                let placeholders: Vec<&str> = template.placeholders().collect();
                println!(
                    "{key} [{}] ({origin}){}",
                    placeholders.join(", "),
                    template
                        .description()
                        .map(|text| format!(": {text}"))
                        .unwrap_or_default()
                );
            }
        }
        PromptsCommand::Show(args) => {
            let template = prompts
                .get(&args.key)
                .ok_or_else(|| PromptError::NotFound(args.key.clone()))?;
            println!("{}", template.template());
        }
    }

    Ok(())
}

fn run_generate(config_path: &Path, args: GenerateArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;

    let roles = store.resolved_roles().ok_or(CliError::MissingLlmProfile)?;
    let theme = pick_theme(args.theme.as_deref(), &store.config().book.theme);
    let output_root = args.output.unwrap_or_else(|| {
        let configured = store.config().book.output_dir.trim();
        PathBuf::from(if configured.is_empty() {
            DEFAULT_OUTPUT_DIR
        } else {
            configured
        })
    });
    let max_attempts = args
        .max_attempts
        .unwrap_or(store.config().book.max_chapter_attempts);
    if max_attempts == 0 {
        return Err(CliError::InvalidMaxAttempts);
    }

    let prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;
    let generator = create_text_generator(store.config(), &roles)?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "Models: creative `{}`, quality `{}`, verifier `{}`",
            roles.creative, roles.quality, roles.verifier
        ),
    ));
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("Output directory: {}", output_root.display()),
    ));

    let pipeline = BookPipeline::new(&prompts, sink, roles.clone())
        .with_max_chapter_attempts(max_attempts);
    let outcome = pipeline.run(&generator, &output_root, &BookRequest::new(theme))?;

    match outcome {
        BookOutcome::Cancelled { artifacts } => {
            sink.log(LogRecord::new(
                LogLevel::Warn,
                "The synopsis did not pass the final check. Book generation cancelled.",
            ));
            sink.log(LogRecord::new(
                LogLevel::Debug,
                format!("Final check answer: {}", artifacts.final_check),
            ));
        }
        BookOutcome::Completed(report) => print_summary(&report, sink),
    }

    store.touch_llm_profile(roles.creative);
    store.save()?;

    Ok(())
}

fn print_summary(report: &BookReport, sink: &dyn LogSink) {
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "Book \"{}\" written to {}",
            report.structure.title(),
            report.book_dir.display()
        ),
    ));
    for chapter in &report.chapters {
        let status = match chapter.state {
            ChapterState::Finalized => "finalized",
            _ if chapter.approved => "approved, finalization failed",
            _ => "not approved",
        };
        sink.log(LogRecord::new(
            LogLevel::Info,
            format!(
                "  {} | {} after {} attempt(s)",
                chapter.chapter.heading(),
                status,
                chapter.attempts_used
            ),
        ));
    }
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!(
            "{} of {} chapters finalized.",
            report.finalized_count(),
            report.chapters.len()
        ),
    ));
    for failure in &report.persistence_errors {
        sink.log(LogRecord::new(LogLevel::Error, failure.to_string()));
    }
}

fn run_config_init(config_path: &Path, args: InitArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    if config_path.exists() && !args.force {
        return Err(CliError::ConfigExists(config_path.to_path_buf()));
    }

    Config::starter().to_path(config_path)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("Starter configuration written to {}", config_path.display()),
    ));
    Ok(())
}

fn run_test_llm(config_path: &Path, args: TestLlmArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;

    let selected = select_llm_profile(&store, args.profile)?;
    let profile = store
        .config()
        .get_llm_profile(&selected)
        .cloned()
        .ok_or_else(|| CliError::UnknownProfile(selected.clone()))?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("Testing LLM profile `{selected}`"),
    ));
    sink.log(LogRecord::new(
        LogLevel::Debug,
        format!(
            "model: {} | interface: {} | base URL: {}",
            profile.model_name, profile.interface_format, profile.base_url
        ),
    ));

    let generator = ProfileTextGenerator::from_profiles(store.config(), [selected.as_str()])?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("Sending probe prompt: {PROBE_PROMPT}"),
    ));

    match generate_cleaned(&generator, PROBE_PROMPT, &selected) {
        Ok(response) => {
            sink.log(LogRecord::new(LogLevel::Info, "LLM profile test succeeded."));
            sink.log(LogRecord::new(
                LogLevel::Debug,
                format!("Probe response: {response}"),
            ));
        }
        Err(err) => {
            sink.log(LogRecord::new(
                LogLevel::Error,
                format!("LLM profile test failed: {err}"),
            ));
            return Err(CliError::Generation(err));
        }
    }

    store.touch_llm_profile(selected);
    store.save()?;

    Ok(())
}

fn select_llm_profile(store: &ConfigStore, preferred: Option<String>) -> Result<String, CliError> {
    if let Some(name) = normalize_preference(preferred) {
        if store.config().llm_profiles.contains_key(&name) {
            return Ok(name);
        }
        return Err(CliError::UnknownProfile(name));
    }

    if let Some(name) = store.last_llm_profile() {
        return Ok(name.to_string());
    }

    if let Some(name) = store.config().llm_profiles.keys().next() {
        return Ok(name.clone());
    }

    Err(CliError::MissingLlmProfile)
}

fn pick_theme(preferred: Option<&str>, configured: &str) -> String {
    [preferred.unwrap_or_default(), configured]
        .into_iter()
        .map(str::trim)
        .find(|theme| !theme.is_empty())
        .unwrap_or(DEFAULT_THEME)
        .to_string()
}

fn normalize_preference(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Debug, Error)]
enum CliError {
    #[error("config file error: {0}")]
    Config(#[from] ConfigError),
    #[error("no LLM profile configured; run `fablesmith config init` first")]
    MissingLlmProfile,
    #[error("no LLM profile named `{0}`")]
    UnknownProfile(String),
    #[error("config file `{0}` already exists; pass --force to overwrite it")]
    ConfigExists(PathBuf),
    #[error("--max-attempts must be at least 1")]
    InvalidMaxAttempts,
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("LLM call failed: {0}")]
    Generation(#[from] GenerationError),
    #[error("failed to load prompts: {0}")]
    Prompt(#[from] PromptError),
    #[error("book generation failed: {0}")]
    Book(#[from] BookError),
}

#[derive(Parser)]
#[command(
    name = "fablesmith",
    version,
    about = "Generates fantasy novels chapter by chapter with local language models"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    /// Show prompts, responses and other debug output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a complete book
    Generate(GenerateArgs),
    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Inspect the effective prompt set
    #[command(subcommand)]
    Prompts(PromptsCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write a starter configuration with local Ollama profiles
    Init(InitArgs),
    /// Send a probe prompt through an LLM profile
    TestLlm(TestLlmArgs),
}

#[derive(Subcommand)]
enum PromptsCommand {
    /// List prompt keys with their placeholders and origin
    List,
    /// Print the template behind a prompt key
    Show(ShowPromptArgs),
}

#[derive(Args)]
struct GenerateArgs {
    /// Theme handed to idea generation; defaults to `book.theme`
    #[arg(long)]
    theme: Option<String>,

    /// Root directory for generated books; defaults to `book.output_dir`
    #[arg(long)]
    output: Option<PathBuf>,

    /// Draft attempts per chapter; defaults to `book.max_chapter_attempts`
    #[arg(long)]
    max_attempts: Option<usize>,
}

#[derive(Args)]
struct InitArgs {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct TestLlmArgs {
    /// Profile to test; defaults to the most recently used one
    #[arg(long)]
    profile: Option<String>,
}

#[derive(Args)]
struct ShowPromptArgs {
    key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use fablesmith_core::{LlmConfig, NullLogSink, VecLogSink};
    use tempfile::tempdir;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_generate_overrides() {
        let cli = Cli::try_parse_from([
            "fablesmith",
            "--config",
            "custom.json",
            "generate",
            "--theme",
            "a city of bells",
            "--max-attempts",
            "5",
        ])
        .expect("parse");
        assert_eq!(cli.config, PathBuf::from("custom.json"));
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.theme.as_deref(), Some("a city of bells"));
        assert_eq!(args.max_attempts, Some(5));
        assert!(args.output.is_none());
    }

    #[test]
    fn adapter_log_records_reach_the_sink() {
        let logger = SinkLogger::new(VecLogSink::new(), false);
        let emit = |target: &str, level: log::Level, message: &str| {
            log::Log::log(
                &logger,
                &log::Record::builder()
                    .target(target)
                    .level(level)
                    .args(format_args!("{message}"))
                    .build(),
            );
        };

        emit("fablesmith_adapters::retry", log::Level::Warn, "attempt 1/3 failed");
        emit("fablesmith_adapters::generator", log::Level::Debug, "prompt bytes");
        emit("reqwest::connect", log::Level::Warn, "connection noise");

        let records = logger.sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, LogLevel::Warn);
        assert_eq!(records[0].message, "attempt 1/3 failed");
    }

    #[test]
    fn theme_falls_back_to_config_then_default() {
        assert_eq!(pick_theme(Some(" sky whales "), "ignored"), "sky whales");
        assert_eq!(pick_theme(Some("  "), "configured"), "configured");
        assert_eq!(pick_theme(None, ""), DEFAULT_THEME);
    }

    #[test]
    fn selects_last_used_then_first_profile() {
        let temp = tempdir().expect("temp dir");
        let mut store = ConfigStore::open(temp.path().join("config.json")).expect("store");
        assert!(matches!(
            select_llm_profile(&store, None),
            Err(CliError::MissingLlmProfile)
        ));

        store
            .config_mut()
            .upsert_llm_profile("alpha", LlmConfig::ollama("gemma3:1b"));
        store
            .config_mut()
            .upsert_llm_profile("beta", LlmConfig::ollama("gemma3:1b"));
        assert_eq!(select_llm_profile(&store, None).unwrap(), "alpha");

        store.touch_llm_profile("beta");
        assert_eq!(select_llm_profile(&store, None).unwrap(), "beta");
        assert!(matches!(
            select_llm_profile(&store, Some("gamma".into())),
            Err(CliError::UnknownProfile(name)) if name == "gamma"
        ));
    }

    #[test]
    fn config_init_refuses_to_overwrite_without_force() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("config.json");

        run_config_init(&path, InitArgs { force: false }, &NullLogSink).expect("first init");
        let written = Config::from_path(&path).expect("starter config");
        assert_eq!(written.llm_profiles.len(), 3);

        let err = run_config_init(&path, InitArgs { force: false }, &NullLogSink)
            .expect_err("existing file");
        assert!(matches!(err, CliError::ConfigExists(_)));
        run_config_init(&path, InitArgs { force: true }, &NullLogSink).expect("forced init");
    }
}
