use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use quizfetch_core::browser::{BrowserError, Credentials};
use quizfetch_core::{load_exporter_config, ExporterConfig};

mod commands;

pub use commands::check::CheckArgs;
pub use commands::history::{AttemptEntry, HistoryArgs, HistoryList, RunEntry};
pub use commands::run::RunArgs;

pub type Result<T> = std::result::Result<T, AppError>;

const EMAIL_VARS: [&str; 2] = ["QUIZFETCH_EMAIL", "ZIPGRADE_EMAIL"];
const PASSWORD_VARS: [&str; 2] = ["QUIZFETCH_PASSWORD", "ZIPGRADE_PASSWORD"];
const DOWNLOAD_DIR_VARS: [&str; 2] = ["QUIZFETCH_DOWNLOAD_DIR", "DOWNLOAD_DIR"];

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] quizfetch_core::ConfigError),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("credentials missing: set QUIZFETCH_EMAIL and QUIZFETCH_PASSWORD (or a .env file)")]
    MissingCredentials,
    #[error("cannot create output directory {path}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Exports quiz result files from ZipGrade", long_about = None)]
pub struct Cli {
    /// Path to a quizfetch.toml; built-in defaults when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in, enumerate quizzes and download their exports
    Run(RunArgs),
    /// Show recent runs and failed attempts
    History(HistoryArgs),
    /// Validate configuration, directories and credentials
    Check(CheckArgs),
    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    load_dotenv();

    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "quizfetchctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    let env = |key: &str| std::env::var(key).ok();

    match &cli.command {
        Commands::Run(args) => {
            let report = commands::run::execute(&context, args, &env)?;
            render(&report, cli.format)?;
        }
        Commands::History(args) => {
            let history = commands::history::list(&context, args)?;
            render(&history, cli.format)?;
        }
        Commands::Check(args) => {
            let report = commands::check::health_check(&context, args, &env);
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_dotenv() {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            warn!(error = %err, "failed to read .env file");
        }
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

/// First non-blank value among `keys`, returned untrimmed.
fn first_env(env: &dyn Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| env(key))
        .find(|value| !value.trim().is_empty())
}

pub fn credentials_from(env: &dyn Fn(&str) -> Option<String>) -> Result<Credentials> {
    match (first_env(env, &EMAIL_VARS), first_env(env, &PASSWORD_VARS)) {
        (Some(email), Some(password)) => Ok(Credentials::new(email.trim(), password)),
        _ => Err(AppError::MissingCredentials),
    }
}

#[derive(Debug)]
pub struct AppContext {
    config: Arc<ExporterConfig>,
    config_path: Option<PathBuf>,
}

impl AppContext {
    pub fn new(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => load_exporter_config(path)?,
            None => ExporterConfig::default(),
        };
        Ok(Self::from_config(config, cli.config.clone()))
    }

    pub fn from_config(config: ExporterConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            config: Arc::new(config),
            config_path,
        }
    }

    pub fn config(&self) -> &Arc<ExporterConfig> {
        &self.config
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// `--download-dir`, then the environment, then `paths.download_dir`.
    pub fn download_dir(
        &self,
        flag: Option<&Path>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> PathBuf {
        if let Some(path) = flag {
            return path.to_path_buf();
        }
        match first_env(env, &DOWNLOAD_DIR_VARS) {
            Some(dir) => PathBuf::from(dir.trim()),
            None => self.config.resolve_path(&self.config.paths.download_dir),
        }
    }

    pub fn history_db(&self) -> PathBuf {
        self.config
            .resolve_path(&self.config.observability.history_db)
    }

    pub fn failure_log(&self) -> PathBuf {
        self.config
            .resolve_path(&self.config.observability.failure_log)
    }

    fn open_database(&self, path: &Path) -> Result<Connection> {
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "history database missing: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(conn)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
        Ok(_) => HealthEntry::error(name, format!("{} is not a directory", path.display())),
        Err(_) => HealthEntry::warn(
            name,
            format!("{} not found, created on first run", path.display()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "quizfetchctl",
            "run",
            "--only",
            "unit",
            "--max",
            "2",
            "--dry-run",
            "--headful",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.only.as_deref(), Some("unit"));
                assert_eq!(args.max, Some(2));
                assert!(args.dry_run);
                assert!(args.headful);
                assert!(args.download_dir.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn credentials_prefer_primary_names_and_fall_back_to_aliases() {
        let env = env_of(&[
            ("QUIZFETCH_EMAIL", "primary@example.com"),
            ("ZIPGRADE_EMAIL", "alias@example.com"),
            ("ZIPGRADE_PASSWORD", "pw"),
        ]);
        let creds = credentials_from(&env).unwrap();
        assert_eq!(creds.email(), "primary@example.com");
    }

    #[test]
    fn blank_credentials_are_missing() {
        let env = env_of(&[("QUIZFETCH_EMAIL", "a@b.c"), ("QUIZFETCH_PASSWORD", "  ")]);
        assert!(matches!(
            credentials_from(&env),
            Err(AppError::MissingCredentials)
        ));
    }

    #[test]
    fn password_whitespace_is_preserved() {
        let env = env_of(&[
            ("QUIZFETCH_EMAIL", " grader@example.com "),
            ("QUIZFETCH_PASSWORD", " pass phrase "),
        ]);
        let creds = credentials_from(&env).unwrap();
        assert_eq!(creds.email(), "grader@example.com");
        assert_eq!(creds.password(), " pass phrase ");
    }

    #[test]
    fn download_dir_precedence() {
        let mut config = ExporterConfig::default();
        config.paths.base_dir = "/srv/quizfetch".into();
        let context = AppContext::from_config(config, None);

        let empty = env_of(&[]);
        assert_eq!(
            context.download_dir(None, &empty),
            PathBuf::from("/srv/quizfetch/zipgrade_downloads")
        );
        let env = env_of(&[("QUIZFETCH_DOWNLOAD_DIR", "/tmp/exports")]);
        assert_eq!(
            context.download_dir(None, &env),
            PathBuf::from("/tmp/exports")
        );
        assert_eq!(
            context.download_dir(Some(Path::new("out")), &env),
            PathBuf::from("out")
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::try_parse_from([
            "quizfetchctl",
            "--config",
            "/nonexistent/quizfetch.toml",
            "check",
        ])
        .unwrap();
        assert!(matches!(AppContext::new(&cli), Err(AppError::Config(_))));
    }
}
