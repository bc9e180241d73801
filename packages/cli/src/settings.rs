//! CLI settings.
//!
//! Values come from, in increasing priority: built-in defaults, the TOML
//! settings file, the environment, and command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use guestbox_runtime::resolver::RUNTIME_SETTING;
use guestbox_runtime::{Configuration, GuestProfile, LauncherOptions};

use crate::CliError;

/// Environment variable overriding the runtime repository.
pub const RUNTIME_ENV: &str = "GUESTBOX_RUNTIME";

const DEFAULT_GITHUB_API: &str = "https://api.github.com";
const DEFAULT_GITHUB_RAW: &str = "https://raw.githubusercontent.com";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Repository holding the guest runtime, e.g. `https://github.com/owner/repo`.
    pub runtime: Option<String>,

    pub handshake_timeout_secs: Option<u64>,

    /// Base URL of the GitHub REST API.
    pub github_api_url: Option<String>,

    /// Base URL serving raw repository files.
    pub github_raw_url: Option<String>,

    /// Directory for downloaded runtime files. Defaults to the user cache dir.
    pub cache_dir: Option<PathBuf>,

    pub profile: GuestProfile,
}

impl Settings {
    /// `<config_dir>/guestbox/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("guestbox").join("config.toml"))
    }

    /// Read a settings file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&content).map_err(|e| CliError::Settings {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Apply environment overrides using the given lookup.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(runtime) = lookup(RUNTIME_ENV).filter(|v| !v.trim().is_empty()) {
            self.runtime = Some(runtime);
        }
        self
    }

    /// Apply command-line overrides.
    pub fn with_flags(mut self, runtime: Option<String>, timeout_secs: Option<u64>) -> Self {
        if runtime.is_some() {
            self.runtime = runtime;
        }
        if timeout_secs.is_some() {
            self.handshake_timeout_secs = timeout_secs;
        }
        self
    }

    pub fn github_api_url(&self) -> &str {
        self.github_api_url.as_deref().unwrap_or(DEFAULT_GITHUB_API)
    }

    pub fn github_raw_url(&self) -> &str {
        self.github_raw_url.as_deref().unwrap_or(DEFAULT_GITHUB_RAW)
    }

    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("guestbox")))
    }

    pub fn launcher_options(&self) -> LauncherOptions {
        let mut options = LauncherOptions {
            profile: self.profile.clone(),
            ..Default::default()
        };
        if let Some(secs) = self.handshake_timeout_secs {
            options.handshake_timeout = Duration::from_secs(secs);
        }
        options
    }
}

impl Configuration for Settings {
    fn get(&self, key: &str) -> Option<String> {
        match key {
            RUNTIME_SETTING => self.runtime.clone(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_settings(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.get(RUNTIME_SETTING), None);
        assert_eq!(
            settings.launcher_options().handshake_timeout,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn reads_toml_file() {
        let file = write_settings(
            r#"
            runtime = "https://github.com/me/my-python"
            handshake_timeout_secs = 3

            [profile]
            flags = ["-X", "utf8"]
            "#,
        );
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(
            settings.get(RUNTIME_SETTING).as_deref(),
            Some("https://github.com/me/my-python")
        );
        let options = settings.launcher_options();
        assert_eq!(options.handshake_timeout, Duration::from_secs(3));
        assert_eq!(options.profile.flags, ["-X", "utf8"]);
        assert_eq!(options.profile.interpreter, "python");
    }

    #[test]
    fn invalid_toml_is_reported() {
        let file = write_settings("runtime = [");
        assert!(matches!(
            Settings::load(file.path()),
            Err(CliError::Settings { .. })
        ));
    }

    #[test]
    fn flag_beats_env_beats_file() {
        let file = write_settings(r#"runtime = "https://github.com/file/repo""#);
        let env = |key: &str| (key == RUNTIME_ENV).then(|| "https://github.com/env/repo".to_string());

        let from_file = Settings::load(file.path()).unwrap();
        assert_eq!(from_file.runtime.as_deref(), Some("https://github.com/file/repo"));

        let from_env = from_file.clone().with_env(env);
        assert_eq!(from_env.runtime.as_deref(), Some("https://github.com/env/repo"));

        let from_flag = from_env
            .clone()
            .with_flags(Some("https://github.com/flag/repo".into()), None);
        assert_eq!(from_flag.runtime.as_deref(), Some("https://github.com/flag/repo"));

        let no_flag = from_env.with_flags(None, Some(1));
        assert_eq!(no_flag.runtime.as_deref(), Some("https://github.com/env/repo"));
        assert_eq!(no_flag.handshake_timeout_secs, Some(1));
    }

    #[test]
    fn blank_env_is_ignored() {
        let settings = Settings::default().with_env(|_| Some("  ".to_string()));
        assert_eq!(settings.runtime, None);
    }
}
