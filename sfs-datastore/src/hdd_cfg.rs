//! Parsing of the hdd configuration file (one disk per line).
//!
//! ```text
//! # comment
//! /mnt/hdd_02
//! */mnt/ssd_08                  <- marked for removal
//! /mnt/nvme01 | /mnt/hdd01     <- metadata on the left, data on the right
//! zonefs:/mnt/meta | /mnt/zns0 <- zoned device (alternate back-end)
//! ```

use std::path::PathBuf;

use anyhow::{bail, Error};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskCfgLine {
    pub meta_path: PathBuf,
    pub data_path: PathBuf,
    pub is_marked_for_removal: bool,
    pub is_zoned: bool,
}

impl DiskCfgLine {
    /// `[*]metaPath[ | dataPath]`, as logged and reported to the master.
    pub fn description(&self) -> String {
        let mut result = String::new();
        if self.is_marked_for_removal {
            result.push('*');
        }
        result.push_str(&self.meta_path.to_string_lossy());
        if self.data_path != self.meta_path {
            result.push_str(" | ");
            result.push_str(&self.data_path.to_string_lossy());
        }
        result
    }
}

fn normalize_path(raw: &str) -> Result<PathBuf, Error> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        bail!("empty disk path");
    }
    Ok(PathBuf::from(trimmed))
}

/// Parses one line of the hdd configuration file. Comments and blank lines
/// yield `Ok(None)`.
pub fn parse_hdd_cfg_line(line: &str) -> Result<Option<DiskCfgLine>, Error> {
    let mut rest = line.trim();
    if rest.is_empty() || rest.starts_with('#') {
        return Ok(None);
    }

    let is_marked_for_removal = rest.starts_with('*');
    if is_marked_for_removal {
        rest = rest[1..].trim_start();
    }

    let is_zoned = rest.starts_with("zonefs:");
    if is_zoned {
        rest = rest["zonefs:".len()..].trim_start();
    }

    let (meta_raw, data_raw) = match rest.split_once('|') {
        Some((meta, data)) => (meta, Some(data)),
        None => (rest, None),
    };

    let meta_path = normalize_path(meta_raw)?;
    let data_path = match data_raw {
        Some(raw) => normalize_path(raw)?,
        None => meta_path.clone(),
    };

    if is_zoned && data_path == meta_path {
        bail!("zoned disk needs separate metadata and data paths: {line}");
    }

    Ok(Some(DiskCfgLine {
        meta_path,
        data_path,
        is_marked_for_removal,
        is_zoned,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_plain_and_removal_lines() {
        assert_eq!(parse_hdd_cfg_line("").unwrap(), None);
        assert_eq!(parse_hdd_cfg_line("   # comment").unwrap(), None);

        let line = parse_hdd_cfg_line("/mnt/hdd_02/").unwrap().unwrap();
        assert_eq!(line.meta_path, PathBuf::from("/mnt/hdd_02"));
        assert_eq!(line.data_path, PathBuf::from("/mnt/hdd_02"));
        assert!(!line.is_marked_for_removal);
        assert!(!line.is_zoned);

        let line = parse_hdd_cfg_line("*/mnt/ssd_08").unwrap().unwrap();
        assert!(line.is_marked_for_removal);
        assert_eq!(line.description(), "*/mnt/ssd_08");
    }

    #[test]
    fn parses_split_meta_data_paths() {
        let line = parse_hdd_cfg_line("/mnt/nvme01 | /mnt/hdd01").unwrap().unwrap();
        assert_eq!(line.meta_path, PathBuf::from("/mnt/nvme01"));
        assert_eq!(line.data_path, PathBuf::from("/mnt/hdd01"));
        assert_eq!(line.description(), "/mnt/nvme01 | /mnt/hdd01");
    }

    #[test]
    fn parses_zoned_lines() {
        let line = parse_hdd_cfg_line("zonefs:/mnt/meta0 | /mnt/zns0")
            .unwrap()
            .unwrap();
        assert!(line.is_zoned);
        assert!(parse_hdd_cfg_line("zonefs:/mnt/zns0").is_err());
    }

    #[test]
    fn rejects_empty_paths() {
        assert!(parse_hdd_cfg_line("*").is_err());
        assert!(parse_hdd_cfg_line("/mnt/a |").is_err());
    }
}
