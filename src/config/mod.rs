#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::core::worker::parse_duration;
use crate::error::DispatchError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub priority: PriorityConfig,
    pub charging: ChargingConfig,
    pub fleet: FleetConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_interval: String,
    pub lock_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub travel_cost_weight: f64,
    pub unknown_travel_cost: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: "2s".to_owned(),
            lock_timeout_ms: 50,
            retry_attempts: 3,
            retry_backoff_ms: 20,
            travel_cost_weight: 0.1,
            unknown_travel_cost: 1000.0,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn tick_interval(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.tick_interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PriorityConfig {
    pub urgency_window_secs: u64,
    pub urgency_max_bonus: i64,
    pub overdue_bonus: i64,
    pub critical_boost: i64,
    pub aging_interval_secs: u64,
    pub aging_bonus: i64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            urgency_window_secs: 300,
            urgency_max_bonus: 30,
            overdue_bonus: 50,
            critical_boost: 50,
            aging_interval_secs: 0,
            aging_bonus: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChargingConfig {
    pub min_battery_threshold: u8,
    pub max_concurrent_charging: usize,
    pub resume_battery_level: u8,
    pub critical_cutoff: i64,
    pub critical_min_battery: u8,
    pub auto_charging_enabled: bool,
    pub charging_location: String,
}

impl Default for ChargingConfig {
    fn default() -> Self {
        Self {
            min_battery_threshold: 30,
            max_concurrent_charging: 1,
            resume_battery_level: 95,
            critical_cutoff: 100,
            critical_min_battery: 10,
            auto_charging_enabled: true,
            charging_location: "Charging Station".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FleetConfig {
    pub site_file: String,
    pub home_location: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            site_file: "~/.config/robodispatch/site.yaml".to_owned(),
            home_location: "Kitchen".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Json,
            dir: "~/.config/robodispatch/state".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Json,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UiConfig {
    pub icons: bool,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { icons: true }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
}

pub fn default_paths() -> anyhow::Result<ConfigPaths> {
    if let Some(v) = std::env::var_os("ROBODISPATCH_CONFIG") {
        return Ok(ConfigPaths {
            config_file: PathBuf::from(v),
        });
    }
    let unix = home_config_path_unix();
    if !cfg!(windows) || unix.exists() {
        return Ok(ConfigPaths { config_file: unix });
    }

    let proj = ProjectDirs::from("com", "robodispatch", "robodispatch")
        .context("failed to determine platform config directory")?;
    Ok(ConfigPaths {
        config_file: proj.config_dir().join("config.toml"),
    })
}

fn home_config_path_unix() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("~"));
    home.join(".config").join("robodispatch").join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // $VAR and ${VAR}; unknown vars stay as written.
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

pub fn load() -> anyhow::Result<(Config, ConfigPaths)> {
    let paths = default_paths()?;
    let (_doc, cfg) = load_from_file(&paths.config_file)?;
    cfg.validate()?;
    Ok((cfg, paths))
}

pub fn list_resolved_toml() -> anyhow::Result<String> {
    let (cfg, _paths) = load()?;
    Ok(toml::to_string_pretty(&cfg)?)
}

pub fn get_value_string(key: &str) -> anyhow::Result<Option<String>> {
    let paths = default_paths()?;
    get_value_string_at_path(&paths.config_file, key)
}

pub fn set_value_string(key: &str, value: &str) -> anyhow::Result<()> {
    let paths = default_paths()?;
    set_value_string_at_path(&paths.config_file, key, value)
}

pub fn load_from_file(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    if !path.exists() {
        return Ok((toml_edit::DocumentMut::new(), Config::default()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;
    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let (_doc, cfg) = load_from_file(path)?;
    cfg.validate()?;
    Ok(lookup_value(&cfg, key).map(format_value_for_stdout))
}

pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let (mut doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let item = parse_value_for_key(key, value)?;
    apply_set(&mut doc, key, item)?;

    // Re-parse so a bad value never reaches disk.
    let new_raw = doc.to_string();
    let new_cfg: Config = toml::from_str(&new_raw)
        .with_context(|| format!("config update produced invalid TOML for {}", path.display()))?;
    new_cfg.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, new_raw.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), DispatchError> {
        if !parse_duration(&self.engine.tick_interval).is_ok_and(|d| !d.is_zero()) {
            return Err(DispatchError::Config(format!(
                "engine.tick_interval must be a non-zero duration, got '{}'",
                self.engine.tick_interval
            )));
        }
        if self.engine.lock_timeout_ms == 0 {
            return Err(DispatchError::Config(
                "engine.lock_timeout_ms must be >= 1".to_owned(),
            ));
        }
        if self.engine.retry_attempts == 0 {
            return Err(DispatchError::Config(
                "engine.retry_attempts must be >= 1".to_owned(),
            ));
        }
        if self.engine.travel_cost_weight < 0.0 || self.engine.unknown_travel_cost < 0.0 {
            return Err(DispatchError::Config(
                "engine travel costs must not be negative".to_owned(),
            ));
        }
        if self.priority.critical_boost < 0 {
            return Err(DispatchError::Config(
                "priority.critical_boost must not be negative".to_owned(),
            ));
        }
        let c = &self.charging;
        if c.min_battery_threshold > 100 || c.resume_battery_level > 100 {
            return Err(DispatchError::Config(
                "charging battery levels must be within 0..=100".to_owned(),
            ));
        }
        if c.resume_battery_level <= c.min_battery_threshold {
            return Err(DispatchError::Config(
                "charging.resume_battery_level must be above charging.min_battery_threshold"
                    .to_owned(),
            ));
        }
        if c.critical_min_battery > c.min_battery_threshold {
            return Err(DispatchError::Config(
                "charging.critical_min_battery must not exceed charging.min_battery_threshold"
                    .to_owned(),
            ));
        }
        if c.charging_location.trim().is_empty() || self.fleet.home_location.trim().is_empty() {
            return Err(DispatchError::Config(
                "charging.charging_location and fleet.home_location must not be empty".to_owned(),
            ));
        }
        if self.storage.dir.trim().is_empty() {
            return Err(DispatchError::Config(
                "storage.dir must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Bool,
    Int,
    Float,
    String,
    Duration,
    Enum(&'static [&'static str]),
}

fn key_type(key: &str) -> Option<KeyType> {
    Some(match key {
        "charging.charging_location"
        | "fleet.site_file"
        | "fleet.home_location"
        | "storage.dir"
        | "logging.filter" => KeyType::String,

        "charging.auto_charging_enabled" | "ui.icons" => KeyType::Bool,

        "engine.lock_timeout_ms"
        | "engine.retry_attempts"
        | "engine.retry_backoff_ms"
        | "priority.urgency_window_secs"
        | "priority.urgency_max_bonus"
        | "priority.overdue_bonus"
        | "priority.critical_boost"
        | "priority.aging_interval_secs"
        | "priority.aging_bonus"
        | "charging.min_battery_threshold"
        | "charging.max_concurrent_charging"
        | "charging.resume_battery_level"
        | "charging.critical_cutoff"
        | "charging.critical_min_battery" => KeyType::Int,

        "engine.travel_cost_weight" | "engine.unknown_travel_cost" => KeyType::Float,

        "engine.tick_interval" => KeyType::Duration,

        "storage.backend" => KeyType::Enum(&["json", "memory"]),
        "logging.format" => KeyType::Enum(&["pretty", "json"]),

        _ => return None,
    })
}

fn parse_value_for_key(key: &str, value: &str) -> anyhow::Result<toml_edit::Item> {
    let invalid = |msg: String| DispatchError::InvalidConfigValue {
        key: key.to_owned(),
        msg,
    };
    let key_type = key_type(key).ok_or_else(|| DispatchError::InvalidConfigKey(key.to_owned()))?;
    let item = match key_type {
        KeyType::Bool => toml_edit::value(parse_bool(value).map_err(invalid)?),
        KeyType::Int => toml_edit::value(parse_int(value).map_err(invalid)?),
        KeyType::Float => toml_edit::value(parse_float(value).map_err(invalid)?),
        KeyType::String => toml_edit::value(value),
        KeyType::Duration => {
            parse_duration(value).map_err(|e| invalid(e.to_string()))?;
            toml_edit::value(value.trim())
        }
        KeyType::Enum(allowed) => {
            let v = value.trim();
            if !allowed.contains(&v) {
                return Err(invalid(format!("must be one of: {}", allowed.join(", "))).into());
            }
            toml_edit::value(v)
        }
    };
    Ok(item)
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true|false, got '{other}'")),
    }
}

fn parse_int(s: &str) -> Result<i64, String> {
    s.trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))
}

fn parse_float(s: &str) -> Result<f64, String> {
    s.trim()
        .parse::<f64>()
        .map_err(|e| format!("expected number, got '{s}': {e}"))
}

fn apply_set(
    doc: &mut toml_edit::DocumentMut,
    key: &str,
    value: toml_edit::Item,
) -> anyhow::Result<()> {
    let parts: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
    let Some((leaf, tables)) = parts.split_last() else {
        return Err(DispatchError::InvalidConfigKey(key.to_owned()).into());
    };

    let mut cur = doc.as_table_mut();
    for seg in tables {
        if !cur.contains_key(seg) {
            let mut t = toml_edit::Table::new();
            t.set_implicit(true);
            cur.insert(seg, toml_edit::Item::Table(t));
        }
        cur = cur[seg].as_table_mut().ok_or_else(|| {
            DispatchError::Config(format!("cannot set {key}: '{seg}' is not a table"))
        })?;
    }
    cur.insert(leaf, value);
    Ok(())
}

fn lookup_value(cfg: &Config, key: &str) -> Option<serde_json::Value> {
    let mut v = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        match v {
            serde_json::Value::Object(mut map) => {
                v = map.remove(seg)?;
            }
            _ => return None,
        }
    }
    Some(v)
}

fn format_value_for_stdout(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_owned(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn validation_catches_inverted_battery_levels() {
        let mut cfg = Config::default();
        cfg.charging.resume_battery_level = 20;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.engine.tick_interval = "soon".to_owned();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_set_and_get_dot_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        set_value_string_at_path(&path, "charging.max_concurrent_charging", "2").unwrap();
        set_value_string_at_path(&path, "engine.tick_interval", "500ms").unwrap();
        set_value_string_at_path(&path, "storage.backend", "memory").unwrap();
        set_value_string_at_path(&path, "engine.travel_cost_weight", "0.25").unwrap();

        assert_eq!(
            get_value_string_at_path(&path, "charging.max_concurrent_charging")
                .unwrap()
                .as_deref(),
            Some("2")
        );
        assert_eq!(
            get_value_string_at_path(&path, "engine.tick_interval")
                .unwrap()
                .as_deref(),
            Some("500ms")
        );

        let (_doc, cfg) = load_from_file(&path).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert!((cfg.engine.travel_cost_weight - 0.25).abs() < f64::EPSILON);
        assert_eq!(
            cfg.engine.tick_interval().unwrap(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn config_set_rejects_unknown_keys_and_bad_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        assert!(set_value_string_at_path(&path, "engine.warp_speed", "9").is_err());
        assert!(set_value_string_at_path(&path, "logging.format", "xml").is_err());
        assert!(set_value_string_at_path(&path, "charging.min_battery_threshold", "99").is_err());
        assert!(!path.exists());
    }
}
