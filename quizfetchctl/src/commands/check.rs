use std::env;
use std::path::{Path, PathBuf};

use clap::Args;

use crate::{check_directory, credentials_from, AppContext, HealthEntry};

const BROWSER_BINARIES: [&str; 4] = [
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
];

#[derive(Args, Debug, Clone)]
pub struct CheckArgs {
    /// Directory the export would write into
    #[arg(long, value_name = "PATH")]
    pub download_dir: Option<PathBuf>,
}

pub fn health_check(
    context: &AppContext,
    args: &CheckArgs,
    env: &dyn Fn(&str) -> Option<String>,
) -> Vec<HealthEntry> {
    let mut entries = Vec::new();

    entries.push(match context.config_path() {
        Some(path) => HealthEntry::ok("config", format!("{}", path.display())),
        None => HealthEntry::ok("config", "built-in defaults"),
    });

    let download_dir = context.download_dir(args.download_dir.as_deref(), env);
    entries.push(check_directory("download_dir", &download_dir));

    entries.push(check_browser(context, env));

    entries.push(match credentials_from(env) {
        Ok(credentials) => HealthEntry::ok("credentials", credentials.email().to_string()),
        Err(err) => HealthEntry::error("credentials", err.to_string()),
    });

    entries.push(check_history(context));
    entries
}

fn check_browser(context: &AppContext, env: &dyn Fn(&str) -> Option<String>) -> HealthEntry {
    let name = "chromium";
    if let Some(configured) = &context.config().chromium.executable_path {
        let path = Path::new(configured);
        return if path.is_file() {
            HealthEntry::ok(name, configured.clone())
        } else {
            HealthEntry::error(name, format!("{configured} does not exist"))
        };
    }
    match env("PATH").and_then(|paths| find_in_path(&paths, &BROWSER_BINARIES)) {
        Some(found) => HealthEntry::ok(name, format!("{}", found.display())),
        None => HealthEntry::warn(
            name,
            "no chromium binary on PATH, relying on browser auto-detection",
        ),
    }
}

fn find_in_path(paths: &str, binaries: &[&str]) -> Option<PathBuf> {
    env::split_paths(paths).find_map(|dir| {
        binaries
            .iter()
            .map(|binary| dir.join(binary))
            .find(|candidate| candidate.is_file())
    })
}

fn check_history(context: &AppContext) -> HealthEntry {
    let name = "history_db";
    let path = context.history_db();
    if !path.exists() {
        return HealthEntry::warn(
            name,
            format!("{} not found, created on first run", path.display()),
        );
    }
    match context.open_database(&path) {
        Ok(conn) => {
            let pragma: rusqlite::Result<String> =
                conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
            match pragma {
                Ok(result) if result.eq_ignore_ascii_case("ok") => {
                    HealthEntry::ok(name, "integrity ok")
                }
                Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                Err(err) => HealthEntry::warn(name, format!("error: {err}")),
            }
        }
        Err(err) => HealthEntry::error(name, format!("cannot open: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    use quizfetch_core::browser::AutomationTelemetry;
    use quizfetch_core::ExporterConfig;
    use tempfile::tempdir;

    use crate::CheckStatus;

    fn status_of(entries: &[HealthEntry], name: &str) -> CheckStatus {
        entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.status)
            .unwrap_or_else(|| panic!("no entry named {name}"))
    }

    #[test]
    fn fresh_install_warns_but_missing_credentials_fail() {
        let dir = tempdir().unwrap();
        let mut config = ExporterConfig::default();
        config.paths.base_dir = dir.path().to_string_lossy().to_string();
        let context = AppContext::from_config(config, None);

        let entries = health_check(&context, &CheckArgs { download_dir: None }, &|_: &str| None);

        assert_eq!(status_of(&entries, "config"), CheckStatus::Ok);
        assert_eq!(status_of(&entries, "download_dir"), CheckStatus::Warn);
        assert_eq!(status_of(&entries, "chromium"), CheckStatus::Warn);
        assert_eq!(status_of(&entries, "credentials"), CheckStatus::Error);
        assert_eq!(status_of(&entries, "history_db"), CheckStatus::Warn);
    }

    #[test]
    fn ready_install_passes() {
        let dir = tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("chromium"), "").unwrap();
        let exports = dir.path().join("exports");
        fs::create_dir_all(&exports).unwrap();

        let mut config = ExporterConfig::default();
        config.paths.base_dir = dir.path().to_string_lossy().to_string();
        let context = AppContext::from_config(config, Some(PathBuf::from("quizfetch.toml")));
        AutomationTelemetry::new(context.failure_log(), context.history_db()).unwrap();

        let bin_path = bin.to_string_lossy().to_string();
        let env = move |key: &str| match key {
            "PATH" => Some(bin_path.clone()),
            "QUIZFETCH_EMAIL" => Some("grader@example.com".to_string()),
            "QUIZFETCH_PASSWORD" => Some("pw".to_string()),
            _ => None,
        };
        let entries = health_check(
            &context,
            &CheckArgs {
                download_dir: Some(exports),
            },
            &env,
        );

        assert!(
            entries.iter().all(|entry| entry.status == CheckStatus::Ok),
            "{entries:?}"
        );
    }

    #[test]
    fn configured_browser_must_exist() {
        let mut config = ExporterConfig::default();
        config.chromium.executable_path = Some("/nonexistent/chrome".to_string());
        let context = AppContext::from_config(config, None);

        assert_eq!(check_browser(&context, &|_: &str| None).status, CheckStatus::Error);
    }

    #[test]
    fn download_dir_that_is_a_file_fails() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("exports");
        fs::write(&file, "").unwrap();
        let context = AppContext::from_config(ExporterConfig::default(), None);

        let entries = health_check(
            &context,
            &CheckArgs {
                download_dir: Some(file),
            },
            &|_: &str| None,
        );
        assert_eq!(status_of(&entries, "download_dir"), CheckStatus::Error);
    }
}
