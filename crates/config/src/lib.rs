//! Typed configuration-value accessors over the Maat store.
//!
//! Configuration values live in the store as strings; this crate layers
//! typed access on top of any [`KeyValueSource`]: strings, integers, floats,
//! booleans, durations, timestamps, and serde-deserializable values.
//!
//! Every accessor comes in two shapes: a fallback variant (`get_*`) that
//! returns the fallback when the key is missing or unparseable, and an error
//! variant (`get_*_or_error`) that reports what went wrong. There is no
//! panicking variant baked into the library; callers that want
//! crash-on-missing semantics use the explicit [`must`] helper, keeping the
//! abort decision at the call site.

use chrono::{DateTime, Utc};
use maat_common::{Error, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Anything that can serve configuration strings by key.
///
/// The store façade implements this over its local state machine map.
pub trait KeyValueSource {
    /// Returns the raw value stored at `path`, if any.
    fn get(&self, path: &str) -> Option<String>;
}

impl<S: KeyValueSource + ?Sized> KeyValueSource for Arc<S> {
    fn get(&self, path: &str) -> Option<String> {
        (**self).get(path)
    }
}

impl<S: KeyValueSource + ?Sized> KeyValueSource for &S {
    fn get(&self, path: &str) -> Option<String> {
        (**self).get(path)
    }
}

/// Typed accessors over a key/value source.
pub struct Config<S> {
    source: S,
}

impl<S: KeyValueSource> Config<S> {
    /// Wraps a source in the typed accessor surface.
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Raw string value, or `fallback` when the key is missing.
    pub fn get_str(&self, path: &str, fallback: &str) -> String {
        self.source
            .get(path)
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Raw string value; missing keys are an error.
    pub fn get_str_or_error(&self, path: &str) -> Result<String> {
        self.fetch(path)
    }

    /// Signed integer, or `fallback` when missing or unparseable.
    pub fn get_int(&self, path: &str, fallback: i64) -> i64 {
        self.get_int_or_error(path).unwrap_or(fallback)
    }

    /// Signed integer; missing or unparseable values are an error.
    pub fn get_int_or_error(&self, path: &str) -> Result<i64> {
        let raw = self.fetch(path)?;
        raw.trim()
            .parse()
            .map_err(|e| Error::Config(format!("{path}: invalid integer {raw:?}: {e}")))
    }

    /// Unsigned integer, or `fallback` when missing or unparseable.
    pub fn get_uint(&self, path: &str, fallback: u64) -> u64 {
        self.get_uint_or_error(path).unwrap_or(fallback)
    }

    /// Unsigned integer; missing or unparseable values are an error.
    pub fn get_uint_or_error(&self, path: &str) -> Result<u64> {
        let raw = self.fetch(path)?;
        raw.trim()
            .parse()
            .map_err(|e| Error::Config(format!("{path}: invalid unsigned integer {raw:?}: {e}")))
    }

    /// Boolean, or `fallback` when missing or unparseable.
    pub fn get_bool(&self, path: &str, fallback: bool) -> bool {
        self.get_bool_or_error(path).unwrap_or(fallback)
    }

    /// Boolean; missing or unparseable values are an error.
    ///
    /// Accepts `1`/`0`, `t`/`f`, `true`/`false` in any casing.
    pub fn get_bool_or_error(&self, path: &str) -> Result<bool> {
        let raw = self.fetch(path)?;
        parse_bool(raw.trim())
            .ok_or_else(|| Error::Config(format!("{path}: invalid boolean {raw:?}")))
    }

    /// Float, or `fallback` when missing or unparseable.
    pub fn get_float(&self, path: &str, fallback: f64) -> f64 {
        self.get_float_or_error(path).unwrap_or(fallback)
    }

    /// Float; missing or unparseable values are an error.
    pub fn get_float_or_error(&self, path: &str) -> Result<f64> {
        let raw = self.fetch(path)?;
        raw.trim()
            .parse()
            .map_err(|e| Error::Config(format!("{path}: invalid float {raw:?}: {e}")))
    }

    /// Duration, or `fallback` when missing or unparseable.
    pub fn get_duration(&self, path: &str, fallback: Duration) -> Duration {
        self.get_duration_or_error(path).unwrap_or(fallback)
    }

    /// Duration; missing or unparseable values are an error.
    ///
    /// Values are suffixed strings such as `"150ms"`, `"30s"`, or `"2m30s"`,
    /// with units `ns`, `us`, `ms`, `s`, `m`, `h`.
    pub fn get_duration_or_error(&self, path: &str) -> Result<Duration> {
        let raw = self.fetch(path)?;
        parse_duration(raw.trim())
            .ok_or_else(|| Error::Config(format!("{path}: invalid duration {raw:?}")))
    }

    /// Timestamp, or `fallback` when missing or unparseable.
    pub fn get_time(&self, path: &str, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.get_time_or_error(path).unwrap_or(fallback)
    }

    /// RFC 3339 timestamp; missing or unparseable values are an error.
    pub fn get_time_or_error(&self, path: &str) -> Result<DateTime<Utc>> {
        let raw = self.fetch(path)?;
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Config(format!("{path}: invalid timestamp {raw:?}: {e}")))
    }

    /// Deserializes a JSON value, or returns `fallback` when missing or
    /// undecodable.
    pub fn get_value<T: DeserializeOwned>(&self, path: &str, fallback: T) -> T {
        self.get_value_or_error(path).unwrap_or(fallback)
    }

    /// Deserializes a JSON value; missing or undecodable values are an error.
    pub fn get_value_or_error<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let raw = self.fetch(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{path}: invalid value: {e}")))
    }

    fn fetch(&self, path: &str) -> Result<String> {
        self.source
            .get(path)
            .ok_or_else(|| Error::Config(format!("key not found: {path}")))
    }
}

/// Unwraps a configuration result or aborts with its error.
///
/// The explicit companion to the `_or_error` accessors for call sites where
/// a missing value makes the process unable to continue.
///
/// # Panics
///
/// Panics with the error's message when `result` is an error.
pub fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(error) => panic!("required configuration value: {error}"),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

/// Parses suffixed duration strings (`"1h"`, `"2m30s"`, `"1.5s"`, `"100ms"`).
fn parse_duration(raw: &str) -> Option<Duration> {
    if raw.is_empty() {
        return None;
    }

    const UNITS: &[(&str, f64)] = &[
        ("ns", 1e-9),
        ("us", 1e-6),
        ("ms", 1e-3),
        ("s", 1.0),
        ("m", 60.0),
        ("h", 3600.0),
    ];

    let mut rest = raw;
    let mut total_secs = 0f64;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        // Longest unit first so "ms" is not read as "m"
        let (unit, scale) = UNITS
            .iter()
            .filter(|(unit, _)| rest.starts_with(unit))
            .max_by_key(|(unit, _)| unit.len())?;
        rest = &rest[unit.len()..];

        total_secs += value * scale;
    }

    if !total_secs.is_finite() || total_secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapSource(HashMap<String, String>);

    impl MapSource {
        fn with(pairs: &[(&str, &str)]) -> Self {
            Self(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        }
    }

    impl KeyValueSource for MapSource {
        fn get(&self, path: &str) -> Option<String> {
            self.0.get(path).cloned()
        }
    }

    #[test]
    fn test_str_accessors() {
        let config = Config::new(MapSource::with(&[("region", "us-east-1")]));

        assert_eq!(config.get_str("region", "none"), "us-east-1");
        assert_eq!(config.get_str("missing", "none"), "none");
        assert_eq!(config.get_str_or_error("region").unwrap(), "us-east-1");
        assert!(config.get_str_or_error("missing").is_err());
    }

    #[test]
    fn test_int_accessors() {
        let config = Config::new(MapSource::with(&[("limit", "42"), ("bad", "forty-two")]));

        assert_eq!(config.get_int("limit", 0), 42);
        assert_eq!(config.get_int("missing", 7), 7);
        assert_eq!(config.get_int("bad", 7), 7);
        assert!(config.get_int_or_error("bad").is_err());
    }

    #[test]
    fn test_uint_rejects_negative() {
        let config = Config::new(MapSource::with(&[("count", "-3")]));

        assert!(config.get_uint_or_error("count").is_err());
        assert_eq!(config.get_uint("count", 9), 9);
    }

    #[test]
    fn test_bool_accessors() {
        let config = Config::new(MapSource::with(&[
            ("on", "true"),
            ("off", "0"),
            ("shout", "TRUE"),
            ("bad", "si"),
        ]));

        assert!(config.get_bool("on", false));
        assert!(!config.get_bool("off", true));
        assert!(config.get_bool("shout", false));
        assert!(config.get_bool("bad", true));
        assert!(config.get_bool_or_error("bad").is_err());
    }

    #[test]
    fn test_float_accessors() {
        let config = Config::new(MapSource::with(&[("ratio", "0.75")]));

        assert_eq!(config.get_float("ratio", 0.0), 0.75);
        assert_eq!(config.get_float("missing", 0.5), 0.5);
    }

    #[test]
    fn test_duration_accessors() {
        let config = Config::new(MapSource::with(&[
            ("simple", "30s"),
            ("compound", "2m30s"),
            ("fractional", "1.5s"),
            ("small", "250ms"),
            ("bare_number", "10"),
        ]));

        assert_eq!(
            config.get_duration_or_error("simple").unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.get_duration_or_error("compound").unwrap(),
            Duration::from_secs(150)
        );
        assert_eq!(
            config.get_duration_or_error("fractional").unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(
            config.get_duration_or_error("small").unwrap(),
            Duration::from_millis(250)
        );

        // A bare number has no unit and is rejected
        assert!(config.get_duration_or_error("bare_number").is_err());
        assert_eq!(
            config.get_duration("bare_number", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_duration_units() {
        let config = Config::new(MapSource::with(&[
            ("h", "1h"),
            ("us", "100us"),
            ("ns", "500ns"),
        ]));

        assert_eq!(
            config.get_duration_or_error("h").unwrap(),
            Duration::from_secs(3600)
        );
        assert_eq!(
            config.get_duration_or_error("us").unwrap(),
            Duration::from_micros(100)
        );
        assert_eq!(
            config.get_duration_or_error("ns").unwrap(),
            Duration::from_nanos(500)
        );
    }

    #[test]
    fn test_time_accessors() {
        let config = Config::new(MapSource::with(&[(
            "deadline",
            "2026-03-01T12:00:00Z",
        )]));

        let parsed = config.get_time_or_error("deadline").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-03-01T12:00:00+00:00");

        let fallback = Utc::now();
        assert_eq!(config.get_time("missing", fallback), fallback);
    }

    #[test]
    fn test_value_accessors() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Limits {
            max_conns: u32,
            burst: u32,
        }

        let config = Config::new(MapSource::with(&[(
            "limits",
            r#"{"max_conns": 512, "burst": 64}"#,
        )]));

        let limits: Limits = config.get_value_or_error("limits").unwrap();
        assert_eq!(
            limits,
            Limits {
                max_conns: 512,
                burst: 64
            }
        );

        let fallback = Limits {
            max_conns: 1,
            burst: 1,
        };
        let got: Limits = config.get_value("missing", fallback);
        assert_eq!(got.max_conns, 1);
    }

    #[test]
    fn test_must_unwraps_ok() {
        let config = Config::new(MapSource::with(&[("present", "here")]));
        assert_eq!(must(config.get_str_or_error("present")), "here");
    }

    #[test]
    #[should_panic(expected = "required configuration value")]
    fn test_must_aborts_on_missing() {
        let config = Config::new(MapSource::with(&[]));
        must(config.get_str_or_error("absent"));
    }

    #[test]
    fn test_source_through_arc() {
        let source = Arc::new(MapSource::with(&[("k", "v")]));
        let config = Config::new(source);
        assert_eq!(config.get_str("k", ""), "v");
    }
}
