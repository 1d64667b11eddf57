//! Immutable application settings, loaded once at start-up.
//!
//! Every field has a default, so an empty file is valid. Unknown keys are
//! rejected so typos surface instead of silently falling back to defaults.
//!
//! ```toml
//! project_name = "askeda"
//! max_retries = 3
//! delivery = "broadcast"
//!
//! [mailbox]
//! capacity = 0
//! put_timeout_ms = 500
//!
//! [dispatch]
//! strict = false
//!
//! [store]
//! data_dir = "./data"
//!
//! [actor]
//! idle_timeout_ms = 300000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How committed events reach the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Broadcast synchronously right after each commit. Needs a push broker.
    #[default]
    Broadcast,
    /// Leave events on the mailbox for the background relay.
    Relay,
}

/// Mailbox sizing and producer back-pressure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MailboxSettings {
    /// Maximum queued messages; `0` means unbounded.
    pub capacity: usize,
    /// How long a commit waits for mailbox space; unset waits forever.
    pub put_timeout_ms: Option<u64>,
}

impl MailboxSettings {
    /// [`put_timeout_ms`](Self::put_timeout_ms) as a [`Duration`].
    pub fn put_timeout(&self) -> Option<Duration> {
        self.put_timeout_ms.map(Duration::from_millis)
    }
}

/// Dispatcher behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchSettings {
    /// Report messages without a handler instead of dropping them.
    pub strict: bool,
}

/// Event store location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Directory of the persistent store; unset keeps events in memory.
    pub data_dir: Option<PathBuf>,
}

/// Aggregate actor lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActorSettings {
    /// An actor with no messages for this long shuts down.
    pub idle_timeout_ms: u64,
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 300_000,
        }
    }
}

impl ActorSettings {
    /// [`idle_timeout_ms`](Self::idle_timeout_ms) as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Application settings.
///
/// # Examples
///
/// ```
/// use askeda::{Delivery, Settings};
///
/// let settings = Settings::from_toml_str("delivery = \"relay\"\n[mailbox]\ncapacity = 64\n")
///     .expect("settings should parse");
/// assert_eq!(settings.delivery, Delivery::Relay);
/// assert_eq!(settings.mailbox.capacity, 64);
/// assert_eq!(settings.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Name used in log spans.
    pub project_name: String,
    /// Extra load-decide-commit attempts after a concurrency conflict.
    pub max_retries: u32,
    /// How committed events reach the dispatcher.
    pub delivery: Delivery,
    pub mailbox: MailboxSettings,
    pub dispatch: DispatchSettings,
    pub store: StoreSettings,
    pub actor: ActorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_name: "askeda".to_string(),
            max_retries: 3,
            delivery: Delivery::default(),
            mailbox: MailboxSettings::default(),
            dispatch: DispatchSettings::default(),
            store: StoreSettings::default(),
            actor: ActorSettings::default(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML text.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(s)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read and parse a TOML settings file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Settings::from_toml_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let settings = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.as_ref().display(), "settings loaded");
        Ok(settings)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "project_name must not be empty".into(),
            ));
        }
        if self.actor.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "actor.idle_timeout_ms must be positive".into(),
            ));
        }
        if self.mailbox.put_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "mailbox.put_timeout_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn empty_input_yields_defaults() {
        let settings = Settings::from_toml_str("").expect("empty settings should parse");
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.delivery, Delivery::Broadcast);
        assert_eq!(settings.actor.idle_timeout(), Duration::from_secs(300));
        assert_eq!(settings.mailbox.put_timeout(), None);
    }

    #[test]
    fn full_file_parses() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let path = tmp.path().join("askeda.toml");
        std::fs::write(
            &path,
            r#"
project_name = "demo"
max_retries = 5
delivery = "relay"

[mailbox]
capacity = 32
put_timeout_ms = 250

[dispatch]
strict = true

[store]
data_dir = "/var/lib/demo"

[actor]
idle_timeout_ms = 1000
"#,
        )
        .expect("write should succeed");

        let settings = Settings::from_file(&path).expect("settings should load");
        assert_eq!(settings.project_name, "demo");
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.delivery, Delivery::Relay);
        assert_eq!(settings.mailbox.capacity, 32);
        assert_eq!(settings.mailbox.put_timeout(), Some(Duration::from_millis(250)));
        assert!(settings.dispatch.strict);
        assert_eq!(settings.store.data_dir, Some(PathBuf::from("/var/lib/demo")));
        assert_eq!(settings.actor.idle_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Settings::from_toml_str("max_retry = 2").expect_err("typo must be rejected");
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = Settings::from_toml_str("[mailbox]\nsize = 2")
            .expect_err("nested typo must be rejected");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn out_of_range_values_are_invalid() {
        let err = Settings::from_toml_str("[actor]\nidle_timeout_ms = 0")
            .expect_err("zero idle timeout must be rejected");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let tmp = TempDir::new().expect("failed to create temp dir");
        let err = Settings::from_file(tmp.path().join("absent.toml"))
            .expect_err("missing file must fail");
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
