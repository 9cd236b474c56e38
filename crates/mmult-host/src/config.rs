//! Host configuration.
//!
//! Loads [`HostConfig`] from a TOML file with environment variable
//! overrides via `MMULT_*` prefixed variables. Every field has a default,
//! so a partial file (or no file at all) is valid.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffers::{BankPlacement, MemoryBank};
use crate::context::{ContextOptions, DEFAULT_BUILD_LOG_LIMIT};
use crate::dispatch::Dimensions;
use crate::matrix::element_count;
use crate::runtime::QueueProperties;

/// Log output style for the CLI subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Run configuration for the accelerator pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Exact platform vendor string to select.
    /// Override: `MMULT_PLATFORM_VENDOR`
    pub platform_vendor: String,

    /// Exact accelerator device name to select.
    /// Override: `MMULT_DEVICE_NAME`
    pub device_name: String,

    /// Kernel entry point inside the device binary.
    /// Override: `MMULT_KERNEL_NAME`
    pub kernel_name: String,

    /// Matrix dimension N (matrices are N x N).
    /// Override: `MMULT_DIMENSION`
    pub dimension: usize,

    /// Memory banks exposed by the card. Used by backends that cannot
    /// query the count from the driver.
    /// Override: `MMULT_MEMORY_BANKS`
    pub memory_banks: u32,

    /// Maximum bytes of build log kept on a program build failure.
    /// Override: `MMULT_BUILD_LOG_LIMIT`
    pub build_log_limit: usize,

    /// Default log filter when `RUST_LOG` is unset.
    /// Override: `MMULT_LOG_LEVEL`
    pub log_level: String,

    /// Override: `MMULT_LOG_FORMAT`
    pub log_format: LogFormat,

    /// Bank assignment of A, B and C. Kept last so it serializes as a
    /// trailing TOML table.
    /// Overrides: `MMULT_BANK_A`, `MMULT_BANK_B`, `MMULT_BANK_C`
    pub placement: BankPlacement,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            platform_vendor: "Xilinx".to_string(),
            device_name: "xilinx_u200_xdma_201830_2".to_string(),
            kernel_name: "mmult".to_string(),
            dimension: 16,
            memory_banks: 4,
            build_log_limit: DEFAULT_BUILD_LOG_LIMIT,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            placement: BankPlacement::default(),
        }
    }
}

/// Errors that can occur when loading or validating a [`HostConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl HostConfig {
    /// Load from a TOML file, then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from a TOML string, then apply environment overrides and
    /// validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: HostConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Render the defaults as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::default())
            .map_err(|e| ConfigError::Validation(format!("default config does not serialize: {e}")))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("platform_vendor", &self.platform_vendor),
            ("device_name", &self.device_name),
            ("kernel_name", &self.kernel_name),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!("{name} must not be empty")));
            }
        }
        if self.dimension == 0 {
            return Err(ConfigError::Validation("dimension must be > 0".into()));
        }
        if i32::try_from(self.dimension).is_err() || element_count(self.dimension).is_err() {
            return Err(ConfigError::Validation(format!(
                "dimension {} is too large",
                self.dimension
            )));
        }
        if self.memory_banks == 0 {
            return Err(ConfigError::Validation("memory_banks must be > 0".into()));
        }
        if self.build_log_limit == 0 {
            return Err(ConfigError::Validation("build_log_limit must be > 0".into()));
        }
        self.placement
            .ensure_distinct()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(())
    }

    /// Apply `MMULT_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("MMULT_PLATFORM_VENDOR") {
            self.platform_vendor = val;
        }
        if let Ok(val) = std::env::var("MMULT_DEVICE_NAME") {
            self.device_name = val;
        }
        if let Ok(val) = std::env::var("MMULT_KERNEL_NAME") {
            self.kernel_name = val;
        }
        if let Some(v) = parse_env::<usize>("MMULT_DIMENSION")? {
            self.dimension = v;
        }
        if let Some(v) = parse_env::<u32>("MMULT_MEMORY_BANKS")? {
            self.memory_banks = v;
        }
        if let Some(v) = parse_env::<usize>("MMULT_BUILD_LOG_LIMIT")? {
            self.build_log_limit = v;
        }
        if let Some(bank) = bank_env("MMULT_BANK_A")? {
            self.placement.a = bank;
        }
        if let Some(bank) = bank_env("MMULT_BANK_B")? {
            self.placement.b = bank;
        }
        if let Some(bank) = bank_env("MMULT_BANK_C")? {
            self.placement.c = bank;
        }
        if let Ok(val) = std::env::var("MMULT_LOG_LEVEL") {
            self.log_level = val;
        }
        if let Ok(val) = std::env::var("MMULT_LOG_FORMAT") {
            self.log_format = val.parse::<LogFormat>().map_err(|reason| ConfigError::EnvOverride {
                key: "MMULT_LOG_FORMAT".into(),
                value: val.clone(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Options for building the execution context.
    pub fn context_options(&self) -> ContextOptions {
        ContextOptions {
            kernel_name: self.kernel_name.clone(),
            queue: QueueProperties { out_of_order: true, profiling: true },
            build_log_limit: self.build_log_limit,
        }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::square(self.dimension)
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val.parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
            key: key.into(),
            value: val.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

fn bank_env(key: &str) -> Result<Option<MemoryBank>, ConfigError> {
    let Some(raw) = parse_env::<u8>(key)? else {
        return Ok(None);
    };
    MemoryBank::try_from(raw).map(Some).map_err(|reason| ConfigError::EnvOverride {
        key: key.into(),
        value: raw.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_VARS: [&str; 11] = [
        "MMULT_PLATFORM_VENDOR",
        "MMULT_DEVICE_NAME",
        "MMULT_KERNEL_NAME",
        "MMULT_DIMENSION",
        "MMULT_MEMORY_BANKS",
        "MMULT_BUILD_LOG_LIMIT",
        "MMULT_BANK_A",
        "MMULT_BANK_B",
        "MMULT_BANK_C",
        "MMULT_LOG_LEVEL",
        "MMULT_LOG_FORMAT",
    ];

    fn with_env<F: FnOnce()>(set: &[(&str, &str)], f: F) {
        let vars: Vec<(&str, Option<&str>)> = ALL_VARS
            .iter()
            .map(|&k| (k, set.iter().find(|(name, _)| *name == k).map(|(_, v)| *v)))
            .collect();
        temp_env::with_vars(vars, f);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(HostConfig::default().validate().is_ok());
    }

    #[test]
    fn default_toml_round_trips() {
        let toml_str = HostConfig::default_toml().unwrap();
        let cfg: HostConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg, HostConfig::default());
    }

    #[test]
    #[serial(mmult_env)]
    fn partial_toml_keeps_defaults() {
        with_env(&[], || {
            let cfg = HostConfig::from_toml("dimension = 8\n").unwrap();
            assert_eq!(cfg.dimension, 8);
            assert_eq!(cfg.platform_vendor, "Xilinx");
            assert_eq!(cfg.kernel_name, "mmult");
        });
    }

    #[test]
    #[serial(mmult_env)]
    fn full_toml() {
        let toml_str = r#"
platform_vendor = "Xilinx"
device_name = "xilinx_u250_gen3x16_xdma_shell_4_1"
kernel_name = "mmult"
dimension = 16
memory_banks = 4
build_log_limit = 1024
log_level = "debug"
log_format = "json"

[placement]
a = 3
b = 2
c = 1
"#;
        with_env(&[], || {
            let cfg = HostConfig::from_toml(toml_str).unwrap();
            assert_eq!(cfg.device_name, "xilinx_u250_gen3x16_xdma_shell_4_1");
            assert_eq!(cfg.build_log_limit, 1024);
            assert_eq!(cfg.placement.a, MemoryBank::Bank3);
            assert_eq!(cfg.placement.c, MemoryBank::Bank1);
            assert_eq!(cfg.log_format, LogFormat::Json);
        });
    }

    #[test]
    fn out_of_range_bank_in_toml_is_parse_error() {
        let err = toml::from_str::<HostConfig>("[placement]\na = 7\nb = 1\nc = 2\n").unwrap_err();
        assert!(err.to_string().contains("0..=3"));
    }

    #[test]
    fn validation_zero_dimension() {
        let cfg = HostConfig { dimension: 0, ..Default::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("dimension must be > 0"));
    }

    #[test]
    fn validation_huge_dimension() {
        let cfg = HostConfig { dimension: usize::MAX, ..Default::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("too large"));
    }

    #[test]
    fn validation_empty_device_name() {
        let cfg = HostConfig { device_name: String::new(), ..Default::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("device_name"));
    }

    #[test]
    fn validation_shared_bank() {
        let mut cfg = HostConfig::default();
        cfg.placement.b = cfg.placement.a;
        assert!(cfg.validate().unwrap_err().to_string().contains("distinct"));
    }

    #[test]
    fn validation_zero_banks() {
        let cfg = HostConfig { memory_banks: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    #[serial(mmult_env)]
    fn env_overrides_apply() {
        with_env(
            &[
                ("MMULT_DEVICE_NAME", "xilinx_u280_xdma_201920_3"),
                ("MMULT_DIMENSION", "4"),
                ("MMULT_BANK_C", "3"),
                ("MMULT_LOG_FORMAT", "pretty"),
            ],
            || {
                let cfg = HostConfig::from_env().unwrap();
                assert_eq!(cfg.device_name, "xilinx_u280_xdma_201920_3");
                assert_eq!(cfg.dimension, 4);
                assert_eq!(cfg.placement.c, MemoryBank::Bank3);
                assert_eq!(cfg.log_format, LogFormat::Pretty);
            },
        );
    }

    #[test]
    #[serial(mmult_env)]
    fn env_override_bad_number() {
        with_env(&[("MMULT_DIMENSION", "sixteen")], || {
            let err = HostConfig::from_env().unwrap_err();
            assert!(matches!(
                err,
                ConfigError::EnvOverride { ref key, .. } if key == "MMULT_DIMENSION"
            ));
        });
    }

    #[test]
    #[serial(mmult_env)]
    fn env_override_bad_bank() {
        with_env(&[("MMULT_BANK_A", "9")], || {
            let err = HostConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("MMULT_BANK_A"));
        });
    }

    #[test]
    #[serial(mmult_env)]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mmult.toml");
        std::fs::write(&path, "kernel_name = \"mmult_systolic\"\n").unwrap();
        with_env(&[], || {
            let cfg = HostConfig::load(&path).unwrap();
            assert_eq!(cfg.kernel_name, "mmult_systolic");
        });
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = HostConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn context_options_follow_config() {
        let cfg = HostConfig { kernel_name: "k".into(), build_log_limit: 64, ..Default::default() };
        let opts = cfg.context_options();
        assert_eq!(opts.kernel_name, "k");
        assert_eq!(opts.build_log_limit, 64);
        assert!(opts.queue.out_of_order && opts.queue.profiling);
    }
}
