//! Mount configuration for immutfs
//!
//! A [`MountConfig`] is assembled once at startup from an optional JSON
//! file, environment overrides and the comma separated `-o` option list,
//! then shared read-only for the life of the mount.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding the grace period from a config file
pub const GRACE_ENV: &str = "IMMUTFS_GRACE";

/// How extended-attribute removal is treated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum XattrRemovalPolicy {
    /// Removal is allowed inside the grace window like any other mutation
    #[default]
    Grace,
    /// Removal is always refused
    Deny,
}

/// Immutable configuration of one mount
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MountConfig {
    /// Window after an object's birth during which it may still change.
    /// Zero disables the window entirely.
    #[serde(with = "duration_serde")]
    pub grace_period: Duration,

    /// Record denials and grace-window mutations
    pub audit_enabled: bool,

    /// Present permission-less objects as 0644/0755
    pub null_permissions: bool,

    /// Allow users other than the mounting user to access the mount
    pub allow_other: bool,

    /// Refuse every mutation, creation included
    pub read_only: bool,

    /// Verbose tracing
    pub debug: bool,

    /// Extended-attribute removal policy
    pub xattr_removal: XattrRemovalPolicy,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            grace_period: Duration::ZERO,
            audit_enabled: false,
            null_permissions: false,
            allow_other: false,
            read_only: false,
            debug: false,
            xattr_removal: XattrRemovalPolicy::Grace,
        }
    }
}

impl MountConfig {
    /// Load configuration from a JSON file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: MountConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(grace) = std::env::var(GRACE_ENV) {
            let grace = grace.trim();
            if !grace.is_empty() {
                self.grace_period = parse_duration(grace)?;
            }
        }
        Ok(())
    }

    /// Apply a comma separated mount option list such as `log,grace=5s`.
    ///
    /// Unknown options are ignored. A malformed `grace=` value is an error.
    pub fn apply_options(&mut self, options: &str) -> Result<()> {
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match option.split_once('=') {
                Some(("grace", value)) => self.grace_period = parse_duration(value)?,
                Some(_) => debug!("Ignoring unknown mount option {:?}", option),
                None => match option {
                    "debug" => self.debug = true,
                    "null" => self.null_permissions = true,
                    "log" => self.audit_enabled = true,
                    "ro" => self.read_only = true,
                    "allow_other" => self.allow_other = true,
                    "xattr_strict" => self.xattr_removal = XattrRemovalPolicy::Deny,
                    _ => debug!("Ignoring unknown mount option {:?}", option),
                },
            }
        }
        Ok(())
    }

    /// Whether destructive operations can ever be allowed
    pub fn grace_enabled(&self) -> bool {
        !self.read_only && !self.grace_period.is_zero()
    }
}

/// Parse a duration made of `<integer><unit>` groups, e.g. `5s`, `10m`,
/// `1h30m`. Units are `ns`, `us`/`µs`, `ms`, `s`, `m` and `h`. A bare `0`
/// is accepted; any other number needs a unit.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::InvalidDuration("empty duration".to_string()));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(Error::InvalidDuration(format!("expected a number in {:?}", input)));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| Error::InvalidDuration(format!("number out of range in {:?}", input)))?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "ns" => Duration::from_nanos(value),
            "us" | "µs" => Duration::from_micros(value),
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => value.checked_mul(60).map(Duration::from_secs).ok_or_else(|| overflow(input))?,
            "h" => value.checked_mul(3600).map(Duration::from_secs).ok_or_else(|| overflow(input))?,
            "" => {
                return Err(Error::InvalidDuration(format!("missing unit in {:?}", input)));
            }
            other => {
                return Err(Error::InvalidDuration(format!(
                    "unknown unit {:?} in {:?}",
                    other, input
                )));
            }
        };
        total = total.checked_add(part).ok_or_else(|| overflow(input))?;
    }

    Ok(total)
}

fn overflow(input: &str) -> Error {
    Error::InvalidDuration(format!("duration out of range: {:?}", input))
}

/// Render a duration in the syntax accepted by [`parse_duration`]
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0".to_string();
    }
    if d.subsec_nanos() != 0 {
        let nanos = d.as_nanos();
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}us", nanos / 1_000)
        } else {
            format!("{}ns", nanos)
        };
    }

    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    out
}

/// Human readable duration serialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Tests that touch the process environment take this lock
    static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("7us").unwrap(), Duration::from_micros(7));
        assert_eq!(parse_duration("7µs").unwrap(), Duration::from_micros(7));
        assert_eq!(parse_duration("9ns").unwrap(), Duration::from_nanos(9));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_duration_composite() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_duration("1m500ms").unwrap(),
            Duration::from_millis(60_500)
        );
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("1.5s").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("99999999999999999999h").is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(
            parse_duration(&format_duration(Duration::from_secs(3661))).unwrap(),
            Duration::from_secs(3661)
        );
    }

    #[test]
    fn test_apply_options() {
        let mut config = MountConfig::default();
        config
            .apply_options("debug,null,log,ro,allow_other,grace=10m,xattr_strict")
            .unwrap();

        assert!(config.debug);
        assert!(config.null_permissions);
        assert!(config.audit_enabled);
        assert!(config.read_only);
        assert!(config.allow_other);
        assert_eq!(config.grace_period, Duration::from_secs(600));
        assert_eq!(config.xattr_removal, XattrRemovalPolicy::Deny);
    }

    #[test]
    fn test_unknown_options_ignored() {
        let mut config = MountConfig::default();
        config.apply_options("fsname=foo,,bogus, log ").unwrap();
        assert!(config.audit_enabled);
        assert_eq!(config, MountConfig { audit_enabled: true, ..Default::default() });
    }

    #[test]
    fn test_bad_grace_is_error() {
        let mut config = MountConfig::default();
        assert!(matches!(
            config.apply_options("grace=soon"),
            Err(Error::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_grace_enabled() {
        let mut config = MountConfig::default();
        assert!(!config.grace_enabled());
        config.grace_period = Duration::from_secs(5);
        assert!(config.grace_enabled());
        config.read_only = true;
        assert!(!config.grace_enabled());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("immutfs.json");

        let config = MountConfig {
            grace_period: Duration::from_secs(90),
            audit_enabled: true,
            ..Default::default()
        };
        config.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"1m30s\""));

        let _env = ENV_LOCK.lock();
        std::env::remove_var(GRACE_ENV);
        let loaded = MountConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "read_only": true }"#).unwrap();

        let _env = ENV_LOCK.lock();
        std::env::remove_var(GRACE_ENV);
        let loaded = MountConfig::load(&path).unwrap();
        assert!(loaded.read_only);
        assert_eq!(loaded.grace_period, Duration::ZERO);
        assert_eq!(loaded.xattr_removal, XattrRemovalPolicy::Grace);
    }

    #[test]
    fn test_env_grace_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("immutfs.json");
        std::fs::write(&path, r#"{ "grace_period": "5s", "audit_enabled": true }"#).unwrap();

        let _env = ENV_LOCK.lock();
        std::env::set_var(GRACE_ENV, " 10m ");
        let loaded = MountConfig::load(&path);
        std::env::set_var(GRACE_ENV, "");
        let blank = MountConfig::load(&path);
        std::env::remove_var(GRACE_ENV);

        let loaded = loaded.unwrap();
        assert_eq!(loaded.grace_period, Duration::from_secs(600));
        assert!(loaded.audit_enabled);
        // A blank value leaves the file's setting alone.
        assert_eq!(blank.unwrap().grace_period, Duration::from_secs(5));
    }

    #[test]
    fn test_env_grace_malformed() {
        let _env = ENV_LOCK.lock();
        std::env::set_var(GRACE_ENV, "forever");
        let mut config = MountConfig::default();
        let result = config.apply_env_overrides();
        std::env::remove_var(GRACE_ENV);

        assert!(matches!(result, Err(Error::InvalidDuration(_))));
        assert_eq!(config.grace_period, Duration::ZERO);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            MountConfig::load("/nonexistent/immutfs.json"),
            Err(Error::Config(_))
        ));
    }
}
