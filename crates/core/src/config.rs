//! Reader configuration
//!
//! One explicitly constructed value covering the page cache and typography.
//! It can be built in code, loaded from `READER_*` environment variables or
//! read from a `key = value` file. Keys map onto the closed [`ConfigKey`]
//! set; unknown keys are ignored and absent keys keep their defaults.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use reader_cache::{CacheConfig, BYTES_PER_MB};
use reader_layout::TypographyConfig;
use serde::{Deserialize, Serialize};

/// Errors that can occur while loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A key was recognised but its value could not be parsed
    #[error("invalid value {value:?} for configuration key `{key}`")]
    InvalidValue { key: String, value: String },

    /// Reading or writing the configuration file failed
    #[error("configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every setting the reader understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    RawCacheCapacity,
    FilterCacheCapacity,
    MaxMemoryFraction,
    MemoryWarningThreshold,
    TargetUtilization,
    MemoryLimitMb,
    MemoryLimitBytes,
    TextSize,
    LineSpacing,
    ParagraphSpacing,
    TitleSize,
    MarginTop,
    MarginRight,
    MarginBottom,
    MarginLeft,
    ImageDefaultFraction,
    ImageMaxFraction,
    ImageSpacing,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 18] = [
        ConfigKey::RawCacheCapacity,
        ConfigKey::FilterCacheCapacity,
        ConfigKey::MaxMemoryFraction,
        ConfigKey::MemoryWarningThreshold,
        ConfigKey::TargetUtilization,
        ConfigKey::MemoryLimitMb,
        ConfigKey::MemoryLimitBytes,
        ConfigKey::TextSize,
        ConfigKey::LineSpacing,
        ConfigKey::ParagraphSpacing,
        ConfigKey::TitleSize,
        ConfigKey::MarginTop,
        ConfigKey::MarginRight,
        ConfigKey::MarginBottom,
        ConfigKey::MarginLeft,
        ConfigKey::ImageDefaultFraction,
        ConfigKey::ImageMaxFraction,
        ConfigKey::ImageSpacing,
    ];

    /// Key as written in configuration files
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::RawCacheCapacity => "raw_cache_capacity",
            ConfigKey::FilterCacheCapacity => "filter_cache_capacity",
            ConfigKey::MaxMemoryFraction => "max_memory_fraction",
            ConfigKey::MemoryWarningThreshold => "memory_warning_threshold",
            ConfigKey::TargetUtilization => "target_utilization",
            ConfigKey::MemoryLimitMb => "memory_limit_mb",
            ConfigKey::MemoryLimitBytes => "memory_limit_bytes",
            ConfigKey::TextSize => "text_size",
            ConfigKey::LineSpacing => "line_spacing",
            ConfigKey::ParagraphSpacing => "paragraph_spacing",
            ConfigKey::TitleSize => "title_size",
            ConfigKey::MarginTop => "margin_top",
            ConfigKey::MarginRight => "margin_right",
            ConfigKey::MarginBottom => "margin_bottom",
            ConfigKey::MarginLeft => "margin_left",
            ConfigKey::ImageDefaultFraction => "image_default_fraction",
            ConfigKey::ImageMaxFraction => "image_max_fraction",
            ConfigKey::ImageSpacing => "image_spacing",
        }
    }

    /// Environment variable for keys that can be set from the environment
    pub fn env_var(self) -> Option<&'static str> {
        match self {
            ConfigKey::RawCacheCapacity => Some("READER_RAW_CACHE_CAPACITY"),
            ConfigKey::FilterCacheCapacity => Some("READER_FILTER_CACHE_CAPACITY"),
            ConfigKey::MaxMemoryFraction => Some("READER_MAX_MEMORY_FRACTION"),
            ConfigKey::TargetUtilization => Some("READER_TARGET_UTILIZATION"),
            ConfigKey::MemoryLimitMb => Some("READER_MEMORY_LIMIT_MB"),
            ConfigKey::TextSize => Some("READER_TEXT_SIZE"),
            ConfigKey::LineSpacing => Some("READER_LINE_SPACING"),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name() == name)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Complete reader configuration
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub cache: CacheConfig,
    pub typography: TypographyConfig,
}

impl ReaderConfig {
    pub fn new(cache: CacheConfig, typography: TypographyConfig) -> Self {
        Self { cache, typography }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_typography(mut self, typography: TypographyConfig) -> Self {
        self.typography = typography;
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `READER_RAW_CACHE_CAPACITY`: raw tier entries (default: 12)
    /// - `READER_FILTER_CACHE_CAPACITY`: filter tier entries (default: 6)
    /// - `READER_MAX_MEMORY_FRACTION`: share of memory for images (default: 0.25)
    /// - `READER_TARGET_UTILIZATION`: usage ratio to trim back to (default: 0.7)
    /// - `READER_MEMORY_LIMIT_MB`: total memory override in MB
    /// - `READER_TEXT_SIZE`: body text size in px (default: 18)
    /// - `READER_LINE_SPACING`: line height multiplier (default: 1.5)
    ///
    /// # Errors
    /// Returns an error if any variable holds a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for key in ConfigKey::ALL {
            if let Some(var) = key.env_var() {
                if let Ok(value) = std::env::var(var) {
                    config.set(key, &value)?;
                }
            }
        }
        Ok(config.validated())
    }

    /// Loads configuration from a `key = value` file.
    ///
    /// ```text
    /// # comments and blank lines are skipped
    /// raw_cache_capacity = 16
    /// text_size = 20
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        contents.parse()
    }

    /// Writes every key to `path` in the format [`from_file`] reads.
    ///
    /// [`from_file`]: ReaderConfig::from_file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_config_string())?;
        Ok(())
    }

    /// Render as `key = value` lines
    pub fn to_config_string(&self) -> String {
        let mut out = String::from("# Reader configuration\n");
        for key in ConfigKey::ALL {
            if let Some(value) = self.get(key) {
                out.push_str(&format!("{} = {}\n", key.name(), value));
            }
        }
        out
    }

    /// Current value of `key` in file syntax; `None` for unset optionals.
    ///
    /// A memory limit is reported under `memory_limit_mb` when it is a whole
    /// number of megabytes and under `memory_limit_bytes` otherwise, never both.
    pub fn get(&self, key: ConfigKey) -> Option<String> {
        let cache = &self.cache;
        let typo = &self.typography;
        let value = match key {
            ConfigKey::RawCacheCapacity => cache.raw_capacity.to_string(),
            ConfigKey::FilterCacheCapacity => cache.filter_capacity.to_string(),
            ConfigKey::MaxMemoryFraction => cache.memory.max_allowed_fraction.to_string(),
            ConfigKey::MemoryWarningThreshold => cache.memory.warning_threshold.to_string(),
            ConfigKey::TargetUtilization => cache.memory.target_utilization.to_string(),
            ConfigKey::MemoryLimitMb => {
                let limit = cache.memory.memory_limit.filter(|bytes| bytes % BYTES_PER_MB == 0)?;
                (limit / BYTES_PER_MB).to_string()
            }
            ConfigKey::MemoryLimitBytes => cache
                .memory
                .memory_limit
                .filter(|bytes| bytes % BYTES_PER_MB != 0)?
                .to_string(),
            ConfigKey::TextSize => typo.text_size.to_string(),
            ConfigKey::LineSpacing => typo.line_spacing.to_string(),
            ConfigKey::ParagraphSpacing => typo.paragraph_spacing.to_string(),
            ConfigKey::TitleSize => typo.title_size.to_string(),
            ConfigKey::MarginTop => typo.margins.top.to_string(),
            ConfigKey::MarginRight => typo.margins.right.to_string(),
            ConfigKey::MarginBottom => typo.margins.bottom.to_string(),
            ConfigKey::MarginLeft => typo.margins.left.to_string(),
            ConfigKey::ImageDefaultFraction => typo.default_image_fraction.to_string(),
            ConfigKey::ImageMaxFraction => typo.max_image_fraction.to_string(),
            ConfigKey::ImageSpacing => typo.image_spacing.to_string(),
        };
        Some(value)
    }

    /// Parse `value` and store it under `key`
    pub fn set(&mut self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        let value = value.trim().trim_matches('"');
        let cache = &mut self.cache;
        let typo = &mut self.typography;
        match key {
            ConfigKey::RawCacheCapacity => cache.raw_capacity = parse(key, value)?,
            ConfigKey::FilterCacheCapacity => cache.filter_capacity = parse(key, value)?,
            ConfigKey::MaxMemoryFraction => cache.memory.max_allowed_fraction = parse(key, value)?,
            ConfigKey::MemoryWarningThreshold => {
                cache.memory.warning_threshold = parse(key, value)?
            }
            ConfigKey::TargetUtilization => cache.memory.target_utilization = parse(key, value)?,
            ConfigKey::MemoryLimitMb => {
                let megabytes: usize = parse(key, value)?;
                let bytes = megabytes
                    .checked_mul(BYTES_PER_MB)
                    .ok_or_else(|| invalid(key, value))?;
                cache.memory.memory_limit = Some(bytes);
            }
            ConfigKey::MemoryLimitBytes => cache.memory.memory_limit = Some(parse(key, value)?),
            ConfigKey::TextSize => typo.text_size = parse(key, value)?,
            ConfigKey::LineSpacing => typo.line_spacing = parse(key, value)?,
            ConfigKey::ParagraphSpacing => typo.paragraph_spacing = parse(key, value)?,
            ConfigKey::TitleSize => typo.title_size = parse(key, value)?,
            ConfigKey::MarginTop => typo.margins.top = parse(key, value)?,
            ConfigKey::MarginRight => typo.margins.right = parse(key, value)?,
            ConfigKey::MarginBottom => typo.margins.bottom = parse(key, value)?,
            ConfigKey::MarginLeft => typo.margins.left = parse(key, value)?,
            ConfigKey::ImageDefaultFraction => typo.default_image_fraction = parse(key, value)?,
            ConfigKey::ImageMaxFraction => typo.max_image_fraction = parse(key, value)?,
            ConfigKey::ImageSpacing => typo.image_spacing = parse(key, value)?,
        }
        Ok(())
    }

    /// Copy with every value pulled into its valid range
    pub fn validated(self) -> Self {
        Self {
            cache: self.cache.validated(),
            typography: self.typography.validated(),
        }
    }
}

impl FromStr for ReaderConfig {
    type Err = ConfigError;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        let mut config = Self::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((name, value)) = line.split_once('=') {
                // Unknown keys are ignored
                if let Some(key) = ConfigKey::from_name(name.trim()) {
                    config.set(key, value)?;
                }
            }
        }
        Ok(config.validated())
    }
}

fn parse<T: FromStr>(key: ConfigKey, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| invalid(key, value))
}

fn invalid(key: ConfigKey, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.name().to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = ReaderConfig::default();
        assert_eq!(config.cache.raw_capacity, 12);
        assert_eq!(config.cache.filter_capacity, 6);
        assert_eq!(config.typography.text_size, 18.0);
        assert_eq!(config, config.validated());
    }

    #[test]
    fn test_key_names_roundtrip() {
        for key in ConfigKey::ALL {
            assert_eq!(ConfigKey::from_name(key.name()), Some(key));
        }
        assert_eq!(ConfigKey::from_name("no_such_key"), None);
    }

    #[test]
    fn test_from_str() {
        let config: ReaderConfig = "
            # cache
            raw_cache_capacity = 20
            filter_cache_capacity = \"4\"
            memory_limit_mb = 256

            text_size = 22.5
            margin_left = 8
            unknown_key = whatever
        "
        .parse()
        .unwrap();

        assert_eq!(config.cache.raw_capacity, 20);
        assert_eq!(config.cache.filter_capacity, 4);
        assert_eq!(config.cache.memory.memory_limit, Some(256 * 1024 * 1024));
        assert_eq!(config.typography.text_size, 22.5);
        assert_eq!(config.typography.margins.left, 8.0);
        // Untouched keys keep defaults
        assert_eq!(config.typography.line_spacing, 1.5);
    }

    #[test]
    fn test_invalid_value_is_an_error() {
        let err = "text_size = large".parse::<ReaderConfig>().unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value } => {
                assert_eq!(key, "text_size");
                assert_eq!(value, "large");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_overflowing_memory_limit_is_an_error() {
        let err = "memory_limit_mb = 18446744073709551615"
            .parse::<ReaderConfig>()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "memory_limit_mb"
        ));

        let mut config = ReaderConfig::default();
        assert!(config
            .set(ConfigKey::MemoryLimitMb, &usize::MAX.to_string())
            .is_err());
        assert_eq!(config.cache.memory.memory_limit, None);
    }

    #[test]
    fn test_memory_limit_written_in_exact_unit() {
        let mut config = ReaderConfig::default();
        config.cache.memory.memory_limit = Some(3 * BYTES_PER_MB + 512);
        assert_eq!(config.get(ConfigKey::MemoryLimitMb), None);
        assert_eq!(
            config.get(ConfigKey::MemoryLimitBytes),
            Some((3 * BYTES_PER_MB + 512).to_string())
        );
        let loaded: ReaderConfig = config.to_config_string().parse().unwrap();
        assert_eq!(loaded.cache.memory.memory_limit, Some(3 * BYTES_PER_MB + 512));

        config.cache.memory.memory_limit = Some(8 * BYTES_PER_MB);
        assert_eq!(config.get(ConfigKey::MemoryLimitMb), Some("8".to_string()));
        assert_eq!(config.get(ConfigKey::MemoryLimitBytes), None);
    }

    #[test]
    fn test_target_utilization_key() {
        let config: ReaderConfig = "target_utilization = 0.55".parse().unwrap();
        assert_eq!(config.cache.memory.target_utilization, 0.55);
        assert!(config.to_config_string().contains("target_utilization = 0.55\n"));
    }

    #[test]
    fn test_parsed_values_are_validated() {
        let config: ReaderConfig = "raw_cache_capacity = 0\nmax_memory_fraction = 3.0\ntext_size = -4"
            .parse()
            .unwrap();
        assert_eq!(config.cache.raw_capacity, 1);
        assert!(config.cache.memory.max_allowed_fraction < 1.0);
        assert_eq!(config.typography.text_size, 18.0);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader.conf");

        let mut config = ReaderConfig::default();
        config.set(ConfigKey::RawCacheCapacity, "9").unwrap();
        config.set(ConfigKey::LineSpacing, "1.25").unwrap();
        config.set(ConfigKey::MemoryLimitMb, "64").unwrap();
        config.save_to_file(&path).unwrap();

        let loaded = ReaderConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ReaderConfig::from_file(dir.path().join("absent.conf"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_json_partial() {
        let config: ReaderConfig =
            serde_json::from_str(r#"{"typography": {"text_size": 30.0}}"#).unwrap();
        assert_eq!(config.typography.text_size, 30.0);
        assert_eq!(config.cache.raw_capacity, 12);
    }

    const ENV_VARS: [&str; 7] = [
        "READER_RAW_CACHE_CAPACITY",
        "READER_FILTER_CACHE_CAPACITY",
        "READER_MAX_MEMORY_FRACTION",
        "READER_TARGET_UTILIZATION",
        "READER_MEMORY_LIMIT_MB",
        "READER_TEXT_SIZE",
        "READER_LINE_SPACING",
    ];

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ENV_VARS);

        env::set_var("READER_RAW_CACHE_CAPACITY", "30");
        env::set_var("READER_FILTER_CACHE_CAPACITY", "10");
        env::set_var("READER_MAX_MEMORY_FRACTION", "0.5");
        env::set_var("READER_TARGET_UTILIZATION", "0.6");
        env::set_var("READER_MEMORY_LIMIT_MB", "512");
        env::set_var("READER_TEXT_SIZE", "16");
        env::set_var("READER_LINE_SPACING", "1.2");

        let config = ReaderConfig::from_env().unwrap();
        assert_eq!(config.cache.raw_capacity, 30);
        assert_eq!(config.cache.filter_capacity, 10);
        assert_eq!(config.cache.memory.max_allowed_fraction, 0.5);
        assert_eq!(config.cache.memory.target_utilization, 0.6);
        assert_eq!(config.cache.memory.memory_limit, Some(512 * 1024 * 1024));
        assert_eq!(config.typography.text_size, 16.0);
        assert_eq!(config.typography.line_spacing, 1.2);
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&ENV_VARS);
        for var in ENV_VARS {
            env::remove_var(var);
        }
        env::set_var("READER_TEXT_SIZE", "24");

        let config = ReaderConfig::from_env().unwrap();
        assert_eq!(config.typography.text_size, 24.0);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ENV_VARS);
        env::set_var("READER_RAW_CACHE_CAPACITY", "lots");
        assert!(ReaderConfig::from_env().is_err());
    }

    // Saves and restores environment variables around a test
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }
}
