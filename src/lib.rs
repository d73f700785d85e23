pub mod commands;
pub mod conversation;
pub mod inference;
pub mod processing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use conversation::{ConversationStore, SessionError};
use inference::types::SourcePreference;
use inference::{AppConfig, InferenceDispatcher, ResourceGate};
use processing::{ProcessedResponse, ResponseProcessor};

const LOG_FILE_NAME: &str = "coderelay.log";
const DB_FILE_NAME: &str = "coderelay.db";

/// Number of rotated log files kept next to the current one.
const KEPT_LOGS: u32 = 3;

// ─── Application State ──────────────────────────────────────────────────────

/// Everything a command needs, wired once at startup and passed by reference.
pub struct AppState {
    pub config: AppConfig,
    pub store: ConversationStore,
    pub dispatcher: InferenceDispatcher,
    pub processor: ResponseProcessor,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: ConversationStore,
        dispatcher: InferenceDispatcher,
        processor: ResponseProcessor,
    ) -> Self {
        Self {
            config,
            store,
            dispatcher,
            processor,
        }
    }

    /// Build real backends from `config`.
    ///
    /// With `db_path` the store is persisted in SQLite and reloaded from it;
    /// without, sessions live in memory only.
    pub fn from_config(config: AppConfig, db_path: Option<&Path>) -> Result<Self, SessionError> {
        let gate = Arc::new(ResourceGate::with_system_probe(config.resources.clone()));
        let dispatcher = InferenceDispatcher::from_config(&config, gate);
        let store = match db_path {
            Some(path) => ConversationStore::open(path)?,
            None => ConversationStore::in_memory(),
        };
        Ok(Self::new(config, store, dispatcher, ResponseProcessor::new()))
    }
}

// ─── Paths ──────────────────────────────────────────────────────────────────

/// Return the platform-standard data directory for coderelay.
///
/// - macOS: `~/Library/Application Support/com.coderelay.app/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.coderelay.app\`
/// - Linux: `$XDG_DATA_HOME/com.coderelay.app/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.coderelay/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.coderelay.app");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".coderelay")
}

/// Path of the session database, creating the data directory if needed.
pub fn resolve_db_path() -> PathBuf {
    let dir = data_dir();
    if !dir.exists() {
        let _ = std::fs::create_dir_all(&dir);
    }
    dir.join(DB_FILE_NAME)
}

// ─── Logging ────────────────────────────────────────────────────────────────

/// Install the tracing subscriber, writing to `<data_dir>/coderelay.log`.
///
/// Previous logs are rotated first. Set `CODERELAY_LOG_FORMAT=json` for JSON
/// lines. If the log file cannot be opened, logs go to stderr instead.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join(LOG_FILE_NAME);

    rotate_log_file(&log_path, KEPT_LOGS);

    let writer = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => BoxMakeWriter::new(FlushingWriter::new(file)),
        Err(e) => {
            eprintln!("coderelay: cannot open {}: {e}; logging to stderr", log_path.display());
            BoxMakeWriter::new(std::io::stderr)
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("coderelay=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let json = std::env::var("CODERELAY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("coderelay: tracing already initialized: {e}");
        return;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== coderelay starting ==="
    );
}

/// Rotate log files: `coderelay.log` → `coderelay.log.1` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ─── CLI ────────────────────────────────────────────────────────────────────

/// Generate code from a prompt using the configured local model or remote provider.
#[derive(Parser)]
#[command(name = "coderelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// What to generate
    prompt: String,

    /// Inference source: local, remote or auto
    #[arg(short, long, default_value = "auto")]
    source: SourcePreference,

    /// Expected code language (e.g. rust, python)
    #[arg(short, long)]
    language: Option<String>,

    /// Continue a persisted session instead of a one-shot generation
    #[arg(long)]
    session: Option<String>,

    /// Print the full reply as JSON
    #[arg(long)]
    json: bool,
}

/// Entry point for the `coderelay` binary.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cwd = std::env::current_dir().context("cannot read the working directory")?;
    let config = inference::config::load_or_default(&cwd).context("failed to load configuration")?;

    let db_path = cli.session.as_ref().map(|_| resolve_db_path());
    let state = AppState::from_config(config, db_path.as_deref())
        .context("failed to open the session database")?;

    let (response, processed) = match &cli.session {
        Some(session_id) => {
            let reply = commands::chat::send_message(&state, session_id, cli.prompt.clone())
                .await
                .map_err(anyhow::Error::msg)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reply)?);
            }
            (reply.response, reply.processed)
        }
        None => {
            let options = commands::chat::GenerateOptions {
                source: cli.source,
                language: cli.language.clone(),
                ..Default::default()
            };
            let reply = commands::chat::generate(&state, cli.prompt.clone(), options).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reply)?);
            }
            (reply.response, reply.processed)
        }
    };

    if response.is_error() {
        anyhow::bail!(
            "generation failed ({:?}): {}",
            response.finish_reason,
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    if !cli.json {
        if let Some(processed) = processed {
            print_processed(&processed);
        }
    }
    Ok(())
}

fn print_processed(processed: &ProcessedResponse) {
    println!("{}", processed.code);
    for finding in &processed.validity.findings {
        eprintln!("warning: {finding}");
    }
    for finding in &processed.security_findings {
        eprintln!(
            "security: line {}: {} [{}] `{}`",
            finding.line, finding.message, finding.category, finding.snippet
        );
    }
}

// ─── Test Support ───────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_keeps_three() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join(LOG_FILE_NAME);

        for round in 0..5 {
            std::fs::write(&base, format!("run {round}")).unwrap();
            rotate_log_file(&base, KEPT_LOGS);
        }

        assert!(!base.exists());
        let read = |suffix: u32| std::fs::read_to_string(format!("{}.{suffix}", base.display())).unwrap();
        assert_eq!(read(1), "run 4");
        assert_eq!(read(2), "run 3");
        assert_eq!(read(3), "run 2");
        assert!(!PathBuf::from(format!("{}.4", base.display())).exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_cli_parses_source_and_language() {
        let cli = Cli::try_parse_from(["coderelay", "write a parser", "-s", "remote", "-l", "rust"]).unwrap();
        assert_eq!(cli.prompt, "write a parser");
        assert_eq!(cli.source, SourcePreference::Remote);
        assert_eq!(cli.language.as_deref(), Some("rust"));

        let cli = Cli::try_parse_from(["coderelay", "x"]).unwrap();
        assert_eq!(cli.source, SourcePreference::Auto);
        assert!(Cli::try_parse_from(["coderelay", "x", "--source", "cloud"]).is_err());
    }

    #[test]
    fn test_from_config_without_sources_or_db() {
        let state = AppState::from_config(AppConfig::default(), None).unwrap();
        assert!(!state.dispatcher.has_local());
        assert!(!state.dispatcher.has_remote());
        assert!(state.store.is_empty());
    }
}
