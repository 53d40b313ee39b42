//! Engine configuration strings
//!
//! The host hands the engine a single string of `key=value` pairs separated
//! by `;`, e.g. `cache_size=64m;use_cas=true;pool_path=/mnt/pmem/cache`.
//! A backslash escapes the next character, so values may contain `;` or `=`.
//! `config_file=<path>` splices in the pairs from a file, one or more per
//! line.
//!
//! Keys understood by other engines of the same host (slab tuning,
//! collection limits, vbuckets) are type-checked and kept in
//! [`EngineSettings`] but have no effect on this engine.

use std::path::{Path, PathBuf};

use pmcache_core::Config;
use thiserror::Error;
use tracing::debug;

/// Nesting limit for `config_file`
const MAX_INCLUDE_DEPTH: usize = 4;

/// Configuration string errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("Malformed config entry {entry:?}: expected key=value")]
    Malformed { entry: String },

    #[error("Unknown config key {key:?}")]
    UnknownKey { key: String },

    #[error("Invalid value {value:?} for {key}: expected {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("Failed to read config file {}: {message}", .path.display())]
    File { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a configuration string can set.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Settings the engine acts on
    pub core: Config,
    pub eviction: bool,
    pub num_threads: u64,
    pub sticky_limit: u64,
    pub preallocate: bool,
    pub factor: f64,
    pub chunk_size: u64,
    pub item_size_max: u64,
    pub max_list_size: u64,
    pub max_set_size: u64,
    pub max_map_size: u64,
    pub max_btree_size: u64,
    pub ignore_vbucket: bool,
    pub prefix_delimiter: char,
    pub vb0: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            core: Config::server(),
            eviction: true,
            num_threads: 0,
            sticky_limit: 0,
            preallocate: false,
            factor: 1.25,
            chunk_size: 48,
            item_size_max: 1024 * 1024,
            max_list_size: 50_000,
            max_set_size: 50_000,
            max_map_size: 50_000,
            max_btree_size: 50_000,
            ignore_vbucket: false,
            prefix_delimiter: ':',
            vb0: false,
        }
    }
}

impl EngineSettings {
    /// Defaults overridden by `config_str`, validated.
    pub fn parse(config_str: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply(config_str)?;
        settings.core.validate().map_err(ConfigError::Invalid)?;
        Ok(settings)
    }

    /// Apply the pairs in `config_str` on top of the current values.
    pub fn apply(&mut self, config_str: &str) -> Result<(), ConfigError> {
        self.apply_nested(config_str, 0)
    }

    fn apply_nested(&mut self, config_str: &str, depth: usize) -> Result<(), ConfigError> {
        for (key, value) in tokenize(config_str)? {
            debug!(key = %key, value = %value, "config entry");
            match key.as_str() {
                "use_cas" => self.core.use_cas = parse_bool(&key, &value)?,
                "verbose" => self.core.verbose = parse_size(&key, &value)? as usize,
                "cache_size" => self.core.maxbytes = parse_size(&key, &value)?,
                "pool_path" => self.core.pool_path = PathBuf::from(&value),
                "pool_size" => self.core.pool_size = parse_size(&key, &value)?,
                "log_size" => self.core.log_size = parse_size(&key, &value)?,
                "hash_power" => {
                    self.core.hash_power =
                        u8::try_from(parse_size(&key, &value)?).map_err(|_| {
                            ConfigError::InvalidValue {
                                key: key.clone(),
                                value: value.clone(),
                                expected: "0..=255",
                            }
                        })?
                }
                "framing_suffix_len" => {
                    self.core.framing_suffix_len = parse_size(&key, &value)? as usize
                }
                "eviction" => self.eviction = parse_bool(&key, &value)?,
                "num_threads" => self.num_threads = parse_size(&key, &value)?,
                "sticky_limit" => self.sticky_limit = parse_size(&key, &value)?,
                "preallocate" => self.preallocate = parse_bool(&key, &value)?,
                "factor" => {
                    self.factor = value.parse().map_err(|_| ConfigError::InvalidValue {
                        key: key.clone(),
                        value: value.clone(),
                        expected: "a number",
                    })?
                }
                "chunk_size" => self.chunk_size = parse_size(&key, &value)?,
                "item_size_max" => self.item_size_max = parse_size(&key, &value)?,
                "max_list_size" => self.max_list_size = parse_size(&key, &value)?,
                "max_set_size" => self.max_set_size = parse_size(&key, &value)?,
                "max_map_size" => self.max_map_size = parse_size(&key, &value)?,
                "max_btree_size" => self.max_btree_size = parse_size(&key, &value)?,
                "ignore_vbucket" => self.ignore_vbucket = parse_bool(&key, &value)?,
                "prefix_delimiter" => {
                    let mut chars = value.chars();
                    self.prefix_delimiter = match (chars.next(), chars.next()) {
                        (Some(c), None) => c,
                        _ => {
                            return Err(ConfigError::InvalidValue {
                                key,
                                value,
                                expected: "a single character",
                            })
                        }
                    };
                }
                "vb0" => self.vb0 = parse_bool(&key, &value)?,
                "config_file" => {
                    if depth >= MAX_INCLUDE_DEPTH {
                        return Err(ConfigError::InvalidValue {
                            key,
                            value,
                            expected: "config files nested at most 4 deep",
                        });
                    }
                    let contents = read_config_file(Path::new(&value))?;
                    self.apply_nested(&contents, depth + 1)?;
                }
                _ => return Err(ConfigError::UnknownKey { key }),
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    // One pair per line is allowed; comments start with '#'.
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect::<Vec<_>>()
        .join(";"))
}

/// Split a config string into trimmed `(key, value)` pairs.
fn tokenize(config_str: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut pairs = Vec::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = config_str.chars();

    let mut finish = |key: &mut String, value: &mut String, in_value: &mut bool| {
        let k = key.trim().to_string();
        let v = value.trim().to_string();
        let had_value = *in_value;
        key.clear();
        value.clear();
        *in_value = false;
        match (k.is_empty(), had_value) {
            (true, false) => Ok(()),
            (false, true) => {
                pairs.push((k, v));
                Ok(())
            }
            _ => Err(ConfigError::Malformed { entry: format!("{}={}", k, v) }),
        }
    };

    while let Some(c) = chars.next() {
        let c = match c {
            '\\' => match chars.next() {
                Some(escaped) => {
                    if in_value { value.push(escaped) } else { key.push(escaped) }
                    continue;
                }
                None => return Err(ConfigError::Malformed { entry: config_str.to_string() }),
            },
            c => c,
        };
        match c {
            ';' => finish(&mut key, &mut value, &mut in_value)?,
            '=' if !in_value => in_value = true,
            c if in_value => value.push(c),
            c => key.push(c),
        }
    }
    finish(&mut key, &mut value, &mut in_value)?;
    Ok(pairs)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected: "true or false",
        }),
    }
}

/// Unsigned size with an optional k/m/g/t (binary) suffix.
fn parse_size(key: &str, value: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected: "an unsigned size, optionally suffixed k/m/g/t",
    };
    let (digits, shift) = match value.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&value[..value.len() - 1], 10),
        Some('m') => (&value[..value.len() - 1], 20),
        Some('g') => (&value[..value.len() - 1], 30),
        Some('t') => (&value[..value.len() - 1], 40),
        _ => (value, 0),
    };
    let base: u64 = digits.parse().map_err(|_| invalid())?;
    base.checked_mul(1u64 << shift).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_gives_defaults() {
        let settings = EngineSettings::parse("").unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert!(settings.core.use_cas);
        assert_eq!(settings.core.maxbytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_core_keys() {
        let settings = EngineSettings::parse(
            "use_cas=false; verbose=2; cache_size=32m; pool_path=/tmp/x.pool; \
             pool_size=64m; log_size=512k; hash_power=12; framing_suffix_len=2",
        )
        .unwrap();
        assert!(!settings.core.use_cas);
        assert_eq!(settings.core.verbose, 2);
        assert_eq!(settings.core.maxbytes, 32 << 20);
        assert_eq!(settings.core.pool_path, PathBuf::from("/tmp/x.pool"));
        assert_eq!(settings.core.pool_size, 64 << 20);
        assert_eq!(settings.core.log_size, 512 << 10);
        assert_eq!(settings.core.hash_power, 12);
        assert_eq!(settings.core.framing_suffix_len, 2);
    }

    #[test]
    fn test_legacy_keys_accepted() {
        let settings = EngineSettings::parse(
            "eviction=false;num_threads=4;sticky_limit=1k;preallocate=true;factor=1.5;\
             chunk_size=96;item_size_max=2m;max_list_size=10;max_set_size=11;max_map_size=12;\
             max_btree_size=13;ignore_vbucket=true;prefix_delimiter=|;vb0=true",
        )
        .unwrap();
        assert!(!settings.eviction);
        assert_eq!(settings.num_threads, 4);
        assert_eq!(settings.sticky_limit, 1024);
        assert!(settings.preallocate);
        assert_eq!(settings.factor, 1.5);
        assert_eq!(settings.max_btree_size, 13);
        assert_eq!(settings.prefix_delimiter, '|');
        assert!(settings.vb0);
    }

    #[test]
    fn test_escapes_and_trailing_separator() {
        let settings = EngineSettings::parse("pool_path=/tmp/a\\;b\\=c.pool;").unwrap();
        assert_eq!(settings.core.pool_path, PathBuf::from("/tmp/a;b=c.pool"));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(EngineSettings::parse("bogus=1"), Err(ConfigError::UnknownKey { .. })));
        assert!(matches!(EngineSettings::parse("use_cas"), Err(ConfigError::Malformed { .. })));
        assert!(matches!(EngineSettings::parse("=5"), Err(ConfigError::Malformed { .. })));
        for bad in ["use_cas=maybe", "cache_size=12q", "prefix_delimiter=ab"] {
            assert!(
                matches!(EngineSettings::parse(bad), Err(ConfigError::InvalidValue { .. })),
                "{}",
                bad
            );
        }
        assert!(matches!(EngineSettings::parse("hash_power=0"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_size_suffixes() {
        assert_eq!(parse_size("k", "10").unwrap(), 10);
        assert_eq!(parse_size("k", "3K").unwrap(), 3 << 10);
        assert_eq!(parse_size("k", "2g").unwrap(), 2 << 30);
        assert!(parse_size("k", "99999999999t").is_err());
        assert!(parse_size("k", "").is_err());
    }

    #[test]
    fn test_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("engine.conf");
        std::fs::write(&path, "# pmcache\nhash_power=10\n\ncache_size=1m\n").unwrap();
        let config_str = format!("use_cas=false;config_file={}", path.display());
        let settings = EngineSettings::parse(&config_str).unwrap();
        assert_eq!(settings.core.hash_power, 10);
        assert_eq!(settings.core.maxbytes, 1 << 20);
        assert!(!settings.core.use_cas);

        let missing = EngineSettings::parse("config_file=/nonexistent/pmcache.conf");
        assert!(matches!(missing, Err(ConfigError::File { .. })));
    }

    #[test]
    fn test_config_file_recursion_bounded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("loop.conf");
        std::fs::write(&path, format!("config_file={}\n", path.display())).unwrap();
        let result = EngineSettings::parse(&format!("config_file={}", path.display()));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
