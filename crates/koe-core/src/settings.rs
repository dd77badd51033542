//! Layered configuration.
//!
//! 1. Compiled defaults ([`KoeSettings::default()`])
//! 2. Optional JSON file (`~/.koe/settings.json`), deep-merged over defaults
//! 3. `KOE_*` environment variables (highest priority)
//!
//! The identity salt is a secret and is only ever read from the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const DEV_SALT: &str = "koe-development-salt";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{key} = {value} is outside {min}..={max}")]
    OutOfRange {
        key: &'static str,
        value: String,
        min: u64,
        max: u64,
    },
}

/// Inclusive bounds for numeric keys. File values and env overrides share
/// them.
const MAX_TURNS: (u64, u64) = (1, 100);
const SESSION_TIMEOUT_SECS: (u64, u64) = (1, 86_400);
const POINTS_PER_OPINION: (u64, u64) = (0, 10_000);
const ENGINE_TIMEOUT_SECS: (u64, u64) = (1, 600);
const LOCK_MAX_AGE_SECS: (u64, u64) = (1, 86_400);
const LOCK_POLL_INTERVAL_MS: (u64, u64) = (1, 60_000);
const LOCK_ACQUIRE_TIMEOUT_SECS: (u64, u64) = (0, 3_600);

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KoeSettings {
    pub chat: ChatSettings,
    pub engine: EngineSettings,
    pub store: StoreSettings,
    pub lock: LockSettings,
    #[serde(skip)]
    pub identity_salt: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatSettings {
    pub max_turns: u32,
    pub session_timeout_secs: u64,
    pub points_per_opinion: i64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_turns: 5,
            session_timeout_secs: 600,
            points_per_opinion: 10,
        }
    }
}

impl ChatSettings {
    /// Clamped to the accepted range, so an unvalidated value cannot wrap
    /// or overflow.
    pub fn session_timeout(&self) -> chrono::Duration {
        let (min, max) = SESSION_TIMEOUT_SECS;
        let secs = self.session_timeout_secs.clamp(min, max);
        i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::seconds(86_400))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub chat_temperature: f64,
    pub chat_max_tokens: u32,
    pub summary_max_tokens: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            timeout_secs: 30,
            chat_temperature: 0.7,
            chat_max_tokens: 200,
            summary_max_tokens: 300,
        }
    }
}

impl EngineSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreSettings {
    pub db_path: PathBuf,
    pub log_db_path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let dir = koe_home().join("database");
        Self {
            db_path: dir.join("koe.db"),
            log_db_path: dir.join("koe-logs.db"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockSettings {
    pub dir: PathBuf,
    pub max_age_secs: u64,
    pub poll_interval_ms: u64,
    pub acquire_timeout_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("koe_analysis_locks"),
            max_age_secs: 600,
            poll_interval_ms: 500,
            acquire_timeout_secs: 10,
        }
    }
}

impl KoeSettings {
    /// Reject numeric values outside their accepted bounds.
    pub fn validate(&self) -> Result<(), SettingsError> {
        check_range("chat.max_turns", self.chat.max_turns.into(), MAX_TURNS)?;
        check_range(
            "chat.session_timeout_secs",
            self.chat.session_timeout_secs,
            SESSION_TIMEOUT_SECS,
        )?;
        let (min, max) = POINTS_PER_OPINION;
        let points = u64::try_from(self.chat.points_per_opinion).map_err(|_| SettingsError::OutOfRange {
            key: "chat.points_per_opinion",
            value: self.chat.points_per_opinion.to_string(),
            min,
            max,
        })?;
        check_range("chat.points_per_opinion", points, POINTS_PER_OPINION)?;
        check_range("engine.timeout_secs", self.engine.timeout_secs, ENGINE_TIMEOUT_SECS)?;
        check_range("lock.max_age_secs", self.lock.max_age_secs, LOCK_MAX_AGE_SECS)?;
        check_range("lock.poll_interval_ms", self.lock.poll_interval_ms, LOCK_POLL_INTERVAL_MS)?;
        check_range(
            "lock.acquire_timeout_secs",
            self.lock.acquire_timeout_secs,
            LOCK_ACQUIRE_TIMEOUT_SECS,
        )?;
        Ok(())
    }

    /// Salt for hashing platform user ids. Falls back to a development salt
    /// with a warning so local runs work out of the box.
    pub fn identity_salt(&self) -> SecretString {
        match &self.identity_salt {
            Some(salt) => SecretString::from(salt.expose_secret().to_owned()),
            None => {
                warn!("KOE_ID_SALT not set, using development salt");
                SecretString::from(DEV_SALT.to_owned())
            }
        }
    }
}

pub fn koe_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".koe")
}

pub fn settings_path() -> PathBuf {
    koe_home().join("settings.json")
}

pub fn load_settings() -> Result<KoeSettings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Missing file means defaults; a present but invalid file is an error, as
/// is any numeric value outside its bounds.
pub fn load_settings_from_path(path: &Path) -> Result<KoeSettings, SettingsError> {
    let defaults = serde_json::to_value(KoeSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: KoeSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Objects merge per key; everything else is replaced. Nulls in `source`
/// are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut KoeSettings) {
    if let Some(v) = read_env_u64("KOE_MAX_CHAT_TURNS", MAX_TURNS) {
        settings.chat.max_turns = u32::try_from(v).unwrap_or(settings.chat.max_turns);
    }
    if let Some(v) = read_env_u64("KOE_CHAT_SESSION_TIMEOUT", SESSION_TIMEOUT_SECS) {
        settings.chat.session_timeout_secs = v;
    }
    if let Some(v) = read_env_u64("KOE_POINT_CHAT_OPINION", POINTS_PER_OPINION) {
        settings.chat.points_per_opinion = i64::try_from(v).unwrap_or(settings.chat.points_per_opinion);
    }
    if let Some(v) = read_env_string("KOE_ENGINE_URL") {
        settings.engine.base_url = v;
    }
    if let Some(v) = read_env_string("KOE_ENGINE_MODEL") {
        settings.engine.model = v;
    }
    if let Some(v) = read_env_u64("KOE_ENGINE_TIMEOUT", ENGINE_TIMEOUT_SECS) {
        settings.engine.timeout_secs = v;
    }
    if let Some(v) = read_env_string("KOE_DB_PATH") {
        settings.store.db_path = PathBuf::from(v);
    }
    if let Some(v) = read_env_string("KOE_LOCK_DIR") {
        settings.lock.dir = PathBuf::from(v);
    }
    if let Some(v) = read_env_u64("KOE_LOCK_MAX_AGE", LOCK_MAX_AGE_SECS) {
        settings.lock.max_age_secs = v;
    }
    if let Some(v) = read_env_string("KOE_ID_SALT") {
        settings.identity_salt = Some(SecretString::from(v));
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn check_range(key: &'static str, value: u64, (min, max): (u64, u64)) -> Result<(), SettingsError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SettingsError::OutOfRange {
            key,
            value: value.to_string(),
            min,
            max,
        })
    }
}

fn read_env_u64(name: &str, (min, max): (u64, u64)) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        warn!(key = name, value = %val, "invalid numeric env var, ignoring");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_deployment_values() {
        let s = KoeSettings::default();
        assert_eq!(s.chat.max_turns, 5);
        assert_eq!(s.chat.session_timeout_secs, 600);
        assert_eq!(s.chat.points_per_opinion, 10);
        assert_eq!(s.engine.timeout_secs, 30);
        assert_eq!(s.lock.max_age_secs, 600);
        assert_eq!(s.lock.poll_interval_ms, 500);
        assert!(s.identity_salt.is_none());
    }

    #[test]
    fn deep_merge_overrides_nested_keys_only() {
        let merged = deep_merge(
            json!({"chat": {"max_turns": 5, "session_timeout_secs": 600}}),
            json!({"chat": {"max_turns": 3, "session_timeout_secs": null}}),
        );
        assert_eq!(merged["chat"]["max_turns"], 3);
        assert_eq!(merged["chat"]["session_timeout_secs"], 600);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = std::env::temp_dir().join(format!("koe-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{"chat": {"max_turns": 7}, "engine": {"model": "qwen2.5"}}"#).unwrap();

        let s = load_settings_from_path(&path).unwrap();
        assert_eq!(s.chat.max_turns, 7);
        assert_eq!(s.chat.session_timeout_secs, 600);
        assert_eq!(s.engine.model, "qwen2.5");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("koe-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    fn load_file(content: &str) -> Result<KoeSettings, SettingsError> {
        let dir = std::env::temp_dir().join(format!("koe-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, content).unwrap();
        let result = load_settings_from_path(&path);
        let _ = std::fs::remove_dir_all(&dir);
        result
    }

    #[test]
    fn zero_turn_cap_in_file_is_rejected() {
        let err = load_file(r#"{"chat": {"max_turns": 0}}"#).unwrap_err();
        assert!(matches!(err, SettingsError::OutOfRange { key: "chat.max_turns", .. }));
    }

    #[test]
    fn huge_session_timeout_in_file_is_rejected() {
        let err = load_file(r#"{"chat": {"session_timeout_secs": 18446744073709551615, "max_turns": 0}}"#)
            .unwrap_err();
        assert!(matches!(err, SettingsError::OutOfRange { .. }));

        let err = load_file(r#"{"chat": {"session_timeout_secs": 9300000000000000}}"#).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::OutOfRange { key: "chat.session_timeout_secs", .. }
        ));
    }

    #[test]
    fn negative_points_in_file_are_rejected() {
        let err = load_file(r#"{"chat": {"points_per_opinion": -5}}"#).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::OutOfRange { key: "chat.points_per_opinion", ref value, .. } if value == "-5"
        ));
    }

    #[test]
    fn lock_poll_interval_must_be_positive() {
        let err = load_file(r#"{"lock": {"poll_interval_ms": 0}}"#).unwrap_err();
        assert!(matches!(err, SettingsError::OutOfRange { key: "lock.poll_interval_ms", .. }));
    }

    #[test]
    fn session_timeout_never_wraps() {
        let chat = ChatSettings {
            session_timeout_secs: u64::MAX,
            ..ChatSettings::default()
        };
        assert_eq!(chat.session_timeout(), chrono::Duration::seconds(86_400));
        assert_eq!(ChatSettings::default().session_timeout(), chrono::Duration::seconds(600));
    }

    #[test]
    fn defaults_validate() {
        KoeSettings::default().validate().unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let s = load_settings_from_path(Path::new("/nonexistent/koe/settings.json")).unwrap();
        assert_eq!(s.chat, ChatSettings::default());
    }

    #[test]
    fn numeric_parsing_is_range_checked() {
        assert_eq!(parse_u64_range("5", 1, 100), Some(5));
        assert_eq!(parse_u64_range("0", 1, 100), None);
        assert_eq!(parse_u64_range("abc", 1, 100), None);
        assert_eq!(parse_u64_range(" 42 ", 1, 100), Some(42));
    }
}
