//! Runtime configuration, read from the environment of the process we are
//! preloaded into.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::{error::TrackError, util::num};

/// Base path of the backing file; the pid is appended
pub const FILE_VAR: &str = "MEM_TRACK_FILE";
/// Table capacity in slots
pub const LEN_VAR: &str = "MEM_TRACK_LEN";
/// Print a line to stderr for every intercepted call
pub const VERBOSE_VAR: &str = "MEM_TRACK_VERBOSE";

pub const DEFAULT_PATH_BASE: &str = "mem.track";
/// Largest prime not above 2^29. About 12GiB of (sparse) backing file.
pub const DEFAULT_CAPACITY: usize = 536_870_909;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub path_base: PathBuf,
    pub capacity: usize,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path_base: PathBuf::from(DEFAULT_PATH_BASE),
            capacity: DEFAULT_CAPACITY,
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, TrackError> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    /// Build a config from `lookup`, which plays the role of the environment.
    /// Unset keys take their defaults; set but malformed keys are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self, TrackError> {
        let mut config = Self::default();
        if let Some(base) = lookup(FILE_VAR) {
            if base.is_empty() {
                return Err(invalid(FILE_VAR, &base));
            }
            config.path_base = PathBuf::from(base);
        }
        if let Some(len) = lookup(LEN_VAR) {
            let capacity = len
                .to_str()
                .and_then(num::parse_auto_radix)
                .and_then(|n| usize::try_from(n).ok())
                .filter(|&n| n > 0)
                .ok_or_else(|| invalid(LEN_VAR, &len))?;
            config.capacity = capacity;
        }
        if let Some(verbose) = lookup(VERBOSE_VAR) {
            config.verbose = match verbose.to_str() {
                Some("1" | "true" | "yes" | "on") => true,
                Some("" | "0" | "false" | "no" | "off") => false,
                _ => return Err(invalid(VERBOSE_VAR, &verbose)),
            };
        }
        Ok(config)
    }

    pub fn with_path_base(mut self, path_base: impl Into<PathBuf>) -> Self {
        self.path_base = path_base.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Use the largest prime capacity not above `capacity`. Addresses are
    /// multiples of 16, so a prime spreads them over every slot.
    pub fn with_capacity_near(self, capacity: usize) -> Result<Self, TrackError> {
        let prime = num::prime_at_or_below(capacity as u64)
            .ok_or(TrackError::InvalidCapacity(capacity as u64))?;
        Ok(self.with_capacity(prime as usize))
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// `<path_base>.<pid>`
    pub fn backing_path(&self, pid: u32) -> PathBuf {
        suffixed(&self.path_base, pid)
    }
}

fn suffixed(base: &Path, pid: u32) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(format!(".{pid}"));
    PathBuf::from(path)
}

fn invalid(key: &'static str, value: &OsString) -> TrackError {
    TrackError::InvalidConfig {
        key,
        value: value.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let map: HashMap<String, OsString> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(env(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.backing_path(1234), PathBuf::from("mem.track.1234"));
    }

    #[test]
    fn keys_are_read() {
        let config = Config::from_lookup(env(&[
            (FILE_VAR, "/tmp/run/app"),
            (LEN_VAR, "0x65"),
            (VERBOSE_VAR, "1"),
        ]))
        .unwrap();
        assert_eq!(config.capacity, 101);
        assert!(config.verbose);
        assert_eq!(config.backing_path(7), PathBuf::from("/tmp/run/app.7"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        for (key, value) in [
            (LEN_VAR, "lots"),
            (LEN_VAR, "0"),
            (FILE_VAR, ""),
            (VERBOSE_VAR, "perhaps"),
        ] {
            match Config::from_lookup(env(&[(key, value)])) {
                Err(TrackError::InvalidConfig { key: k, value: v }) => {
                    assert_eq!(k, key);
                    assert_eq!(v, value);
                }
                other => panic!("{key}={value:?} gave {other:?}"),
            }
        }
    }

    #[test]
    fn capacity_can_be_rounded_to_a_prime() {
        let config = Config::default().with_capacity_near(1000).unwrap();
        assert_eq!(config.capacity, 997);
        assert!(Config::default().with_capacity_near(1).is_err());
    }
}
