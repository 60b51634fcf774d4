//! Chunkserver configuration file parsing.
//!
//! The configuration is a plain `KEY = value` text file. Only the keys the
//! storage engine consumes are interpreted here; anything else (network,
//! master addresses, ...) belongs to other subsystems and is ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};

use sfs_datastore::HddConfig;

/// Parses a human-readable size like `256MiB`, `1 G` or `65536`.
///
/// Decimal suffixes (`k`, `M`, `G`, `T`, `P`, `E`) multiply by powers of
/// 1000; with a trailing `i` (`Ki`, `Mi`, ...) by powers of 1024. A lone
/// trailing `B` is accepted.
pub fn parse_size(text: &str) -> Result<u64, Error> {
    let trimmed = text.trim();
    let digits_end = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(digits_end);

    let value: f64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid size value: {text}"))?;

    let mut suffix = suffix.trim();
    if let Some(stripped) = suffix.strip_suffix('B') {
        suffix = stripped;
    }
    let binary = suffix.ends_with('i');
    if binary {
        suffix = &suffix[..suffix.len() - 1];
    }

    let exponent = match suffix {
        "" => 0,
        "k" | "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        _ => bail!("invalid size suffix in: {text}"),
    };
    let base: f64 = if binary { 1024.0 } else { 1000.0 };

    let result = value * base.powi(exponent);
    if result < 0.0 || !result.is_finite() {
        bail!("invalid size: {text}");
    }
    Ok(result as u64)
}

fn parse_bool(value: &str) -> bool {
    value.trim() != "0"
}

/// Reads the `KEY = value` file into a map; `#` starts a comment, blank
/// lines are skipped.
fn read_key_values(path: &Path) -> Result<HashMap<String, String>, Error> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("can't read config file {}", path.display()))?;

    let mut values = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        values.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(values)
}

/// Loads the storage engine configuration from the chunkserver config file.
/// Missing keys fall back to their documented defaults.
pub fn load_hdd_config(path: &Path) -> Result<HddConfig, Error> {
    let values = read_key_values(path)?;
    hdd_config_from_values(&values)
}

fn hdd_config_from_values(values: &HashMap<String, String>) -> Result<HddConfig, Error> {
    let mut cfg = HddConfig::default();

    if let Some(value) = values.get("HDD_CONF_FILENAME") {
        cfg.hdd_conf_filename = PathBuf::from(value);
    }
    if let Some(value) = values.get("HDD_TEST_FREQ") {
        let seconds: f64 = value
            .parse()
            .with_context(|| format!("invalid HDD_TEST_FREQ: {value}"))?;
        cfg.hdd_test_freq_ms = (seconds.clamp(0.001, 1_000_000.0) * 1000.0) as u64;
    }
    if let Some(value) = values.get("HDD_CHECK_CRC_WHEN_READING") {
        cfg.check_crc_when_reading = parse_bool(value);
    }
    if let Some(value) = values.get("HDD_CHECK_CRC_WHEN_WRITING") {
        cfg.check_crc_when_writing = parse_bool(value);
    }
    if let Some(value) = values.get("HDD_ADVISE_NO_CACHE") {
        cfg.advise_no_cache = parse_bool(value);
    }
    if let Some(value) = values.get("HDD_PUNCH_HOLES") {
        cfg.punch_holes = parse_bool(value);
    }
    if let Some(value) = values.get("HDD_LEAVE_SPACE_DEFAULT") {
        match parse_size(value) {
            Ok(size) => cfg.leave_space_default = size,
            Err(err) => {
                log::warn!("HDD_LEAVE_SPACE_DEFAULT parse error ({err}) - using default");
            }
        }
    }
    if let Some(value) = values.get("PERFORM_FSYNC") {
        cfg.perform_fsync = parse_bool(value);
    }
    if let Some(value) = values.get("METADATA_CACHE_PATH") {
        if !value.is_empty() {
            cfg.metadata_cache_path = Some(PathBuf::from(value));
        }
    }

    Ok(cfg)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("65536").unwrap(), 65536);
        assert_eq!(parse_size("1k").unwrap(), 1000);
        assert_eq!(parse_size("1Ki").unwrap(), 1024);
        assert_eq!(parse_size("256MiB").unwrap(), 256 << 20);
        assert_eq!(parse_size("256 MiB").unwrap(), 256 << 20);
        assert_eq!(parse_size("2G").unwrap(), 2_000_000_000);
        assert_eq!(parse_size("0.5Gi").unwrap(), 512 << 20);
        assert!(parse_size("abc").is_err());
        assert!(parse_size("1X").is_err());
    }

    #[test]
    fn config_defaults_and_overrides() {
        let mut values = HashMap::new();
        let cfg = hdd_config_from_values(&values).unwrap();
        assert_eq!(cfg.hdd_conf_filename, PathBuf::from("sfshdd.cfg"));
        assert_eq!(cfg.hdd_test_freq_ms, 10_000);
        assert!(cfg.check_crc_when_reading);
        assert!(cfg.check_crc_when_writing);
        assert!(!cfg.advise_no_cache);
        assert!(!cfg.punch_holes);
        assert_eq!(cfg.leave_space_default, 256 << 20);
        assert!(cfg.perform_fsync);
        assert!(cfg.metadata_cache_path.is_none());

        values.insert("HDD_CONF_FILENAME".into(), "/etc/sfshdd.cfg".into());
        values.insert("HDD_TEST_FREQ".into(), "2.5".into());
        values.insert("HDD_CHECK_CRC_WHEN_READING".into(), "0".into());
        values.insert("HDD_LEAVE_SPACE_DEFAULT".into(), "1Gi".into());
        values.insert("METADATA_CACHE_PATH".into(), "/var/lib/cache".into());
        values.insert("SOME_UNRELATED_KEY".into(), "whatever".into());

        let cfg = hdd_config_from_values(&values).unwrap();
        assert_eq!(cfg.hdd_conf_filename, PathBuf::from("/etc/sfshdd.cfg"));
        assert_eq!(cfg.hdd_test_freq_ms, 2500);
        assert!(!cfg.check_crc_when_reading);
        assert_eq!(cfg.leave_space_default, 1 << 30);
        assert_eq!(
            cfg.metadata_cache_path,
            Some(PathBuf::from("/var/lib/cache"))
        );
    }
}
