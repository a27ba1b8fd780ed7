use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::browser::{LocatorCandidate, LocatorSet};
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ExporterConfig {
    pub site: SiteSection,
    pub paths: PathsSection,
    pub chromium: ChromiumSection,
    pub flags: FlagsSection,
    pub timeouts: TimeoutSection,
    pub export: ExportSection,
    pub retry: RetrySection,
    pub pacing: PacingSection,
    pub selectors: SelectorSection,
    pub observability: ObservabilitySection,
}

impl ExporterConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSection {
    pub base_url: String,
    pub login_url: String,
    pub listing_url: String,
}

impl Default for SiteSection {
    fn default() -> Self {
        Self {
            base_url: "https://www.zipgrade.com".into(),
            login_url: "https://www.zipgrade.com/login/".into(),
            listing_url: "https://www.zipgrade.com/quiz/".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub download_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".".into(),
            download_dir: "zipgrade_downloads".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub window_size: [u32; 2],
    pub request_timeout_seconds: Option<u64>,
}

impl Default for ChromiumSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            sandbox: false,
            disable_gpu: false,
            window_size: [1366, 768],
            request_timeout_seconds: Some(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlagsSection {
    pub no_first_run: bool,
    pub disable_dev_shm_usage: bool,
    pub lang: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for FlagsSection {
    fn default() -> Self {
        Self {
            no_first_run: true,
            disable_dev_shm_usage: true,
            lang: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    pub short_seconds: u64,
    pub default_seconds: u64,
    pub long_seconds: u64,
    pub locator_poll_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            short_seconds: 10,
            default_seconds: 20,
            long_seconds: 45,
            locator_poll_ms: 250,
        }
    }
}

impl TimeoutSection {
    pub fn short(&self) -> Duration {
        Duration::from_secs(self.short_seconds)
    }

    pub fn standard(&self) -> Duration {
        Duration::from_secs(self.default_seconds)
    }

    pub fn long(&self) -> Duration {
        Duration::from_secs(self.long_seconds)
    }

    pub fn locator_poll(&self) -> Duration {
        Duration::from_millis(self.locator_poll_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSection {
    /// Marker appended to every canonical filename (`... - full.csv`).
    pub export_kind: String,
    pub rate_limit_phrase: String,
    pub poll_interval_ms: u64,
    pub ceiling_seconds: u64,
    pub popup_grace_ms: u64,
    pub trigger_settle_ms: u64,
    pub in_progress_suffixes: Vec<String>,
    pub max_title_chars: usize,
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            export_kind: "full".into(),
            rate_limit_phrase: "too many attempts".into(),
            poll_interval_ms: 1000,
            ceiling_seconds: 60,
            popup_grace_ms: 500,
            trigger_settle_ms: 500,
            in_progress_suffixes: vec![".crdownload".into(), ".part".into(), ".tmp".into()],
            max_title_chars: 180,
        }
    }
}

impl ExportSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_rounds: usize,
    pub base_backoff_seconds: u64,
    pub max_popup_requeues: u32,
    pub stop_on_stalled_round: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            base_backoff_seconds: 30,
            max_popup_requeues: 3,
            stop_on_stalled_round: true,
        }
    }
}

impl RetrySection {
    pub fn backoff_for_round(&self, round: usize) -> Duration {
        Duration::from_secs(self.base_backoff_seconds.saturating_mul(round as u64))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingSection {
    pub delay_range_ms: [u64; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    pub login_email: LocatorSet,
    pub login_password: LocatorSet,
    pub login_submit: LocatorSet,
    pub listing_link: LocatorSet,
    pub rows: LocatorSet,
    pub title_link: LocatorSet,
    pub date_cell: LocatorSet,
    pub export_trigger: LocatorSet,
    pub full_export_link: LocatorSet,
}

impl Default for SelectorSection {
    fn default() -> Self {
        use LocatorCandidate as L;
        Self {
            login_email: vec![
                L::name("email"),
                L::name("username"),
                L::css("input[type='email']"),
                L::id("email"),
                L::id("username"),
            ]
            .into(),
            login_password: vec![
                L::name("password"),
                L::css("input[type='password']"),
                L::id("password"),
            ]
            .into(),
            login_submit: vec![
                L::css("button[type='submit']"),
                L::css("input[type='submit']"),
                L::xpath("//button[contains(., 'Log in') or contains(., 'Sign in') or contains(., 'Ingresar')]"),
                L::xpath("//input[@type='submit']"),
            ]
            .into(),
            listing_link: vec![
                L::link_text("Quizzes"),
                L::partial_link_text("Quiz"),
                L::xpath("//a[contains(., 'Quizzes') or contains(., 'Quiz')]"),
            ]
            .into(),
            rows: vec![
                L::css("table tbody tr"),
                L::css("[role='row']"),
                L::css(".table tbody tr"),
                L::xpath("//tr[td]"),
            ]
            .into(),
            title_link: vec![L::css("a"), L::css("td a"), L::xpath(".//a")].into(),
            date_cell: vec![
                L::css("td:nth-child(2)"),
                L::css(".date, time"),
                L::xpath(".//td[contains(@class, 'date') or .//time]"),
            ]
            .into(),
            export_trigger: vec![
                L::xpath("//div[contains(translate(., 'abcdefghijklmnopqrstuvwxyz','ABCDEFGHIJKLMNOPQRSTUVWXYZ'),'QUIZ STATISTICS')]//button[contains(@class,'dropdown-toggle') and contains(.,'CSV')]"),
                L::xpath("//button[contains(@class,'dropdown-toggle') and contains(.,'CSV')]"),
                L::css("button.btn.btn-circle.btn-default.dropdown-toggle"),
                L::xpath("//button[.//i[contains(@class,'fa-floppy-o')] and contains(normalize-space(.), 'CSV')]"),
            ]
            .into(),
            full_export_link: vec![
                L::css("ul.dropdown-menu a[target='export'][href*='/quiz/full/'][href*='/all/'][href$='.CSV']"),
                L::css("ul.dropdown-menu a[target='export'][href*='/quiz/full/'][href*='/all/'][href$='.csv']"),
                L::xpath("//ul[contains(@class,'dropdown-menu')]//a[contains(@href,'/quiz/full/') and contains(@href,'/all/') and (contains(@href,'.CSV') or contains(@href,'.csv'))]"),
                L::xpath("//ul[contains(@class,'dropdown-menu')]//a[contains(., 'Full Format') and contains(., 'student responses')]"),
                L::xpath("//ul[contains(@class,'dropdown-menu')]//a[contains(., 'Full format') and contains(., 'student responses')]"),
                L::xpath("//a[contains(., 'Full format with student responses')]"),
                L::partial_link_text("Full format"),
            ]
            .into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub enabled: bool,
    pub failure_log: String,
    pub history_db: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_log: "logs/export_failures.jsonl".into(),
            history_db: "data/history.sqlite".into(),
        }
    }
}

pub fn load_exporter_config<P: AsRef<Path>>(path: P) -> Result<ExporterConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::LocatorStrategy;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/quizfetch.toml");
        let config = load_exporter_config(path).expect("fixture config should parse");
        assert_eq!(config.site.login_url, "https://www.zipgrade.com/login/");
        assert_eq!(config.retry.max_rounds, 3);
        assert_eq!(config.export.export_kind, "full");
        assert!(config.selectors.full_export_link.len() >= 3);
        assert_eq!(
            config.selectors.listing_link.candidates()[0].by,
            LocatorStrategy::LinkText
        );
    }

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: ExporterConfig = toml::from_str(
            r#"
            [retry]
            max_rounds = 5

            [export]
            rate_limit_phrase = "slow down"
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_rounds, 5);
        assert_eq!(config.retry.base_backoff_seconds, 30);
        assert_eq!(config.export.rate_limit_phrase, "slow down");
        assert_eq!(config.export.ceiling_seconds, 60);
        assert!(!config.selectors.rows.is_empty());
    }

    #[test]
    fn backoff_grows_linearly() {
        let retry = RetrySection::default();
        assert_eq!(retry.backoff_for_round(1), Duration::from_secs(30));
        assert_eq!(retry.backoff_for_round(3), Duration::from_secs(90));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_exporter_config("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
