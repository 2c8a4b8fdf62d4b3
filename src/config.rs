use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::lease::DEFAULT_MAX_RENEWALS;
use crate::strategy::Strategy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store_file: String,
    pub default_lease_duration_seconds: u32,
    pub default_max_renewals: u32,
    pub default_strategy: Strategy,
    pub lock_timeout_millis: u64,
    pub sweep_interval_seconds: u64,
    pub default_interface: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_file: "leasepool.json".to_string(),
            default_lease_duration_seconds: 86400,
            default_max_renewals: DEFAULT_MAX_RENEWALS,
            default_strategy: Strategy::FirstFit,
            lock_timeout_millis: 5000,
            sweep_interval_seconds: 300,
            default_interface: None,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_file.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "store_file must not be empty".to_string(),
            ));
        }

        if self.default_lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "default_lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.lock_timeout_millis == 0 {
            return Err(Error::InvalidConfig(
                "lock_timeout_millis must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "sweep_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if let Some(interface) = &self.default_interface
            && interface.trim().is_empty()
        {
            return Err(Error::InvalidConfig(
                "default_interface must not be blank".to_string(),
            ));
        }

        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_millis)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestGuard(String);
    impl Drop for TestGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_lease_duration() {
        let config = Config {
            default_lease_duration_seconds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_lock_timeout() {
        let config = Config {
            lock_timeout_millis: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_default_interface() {
        let config = Config {
            default_interface: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let config = Config::default();
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_load_or_create_roundtrip() {
        let path = "test_config_roundtrip.json".to_string();
        let _guard = TestGuard(path.clone());

        let created = Config::load_or_create(&path).unwrap();
        assert!(Path::new(&path).exists());

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.store_file, created.store_file);
        assert_eq!(loaded.default_strategy, Strategy::FirstFit);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let path = "test_config_invalid.json".to_string();
        let _guard = TestGuard(path.clone());

        let config = Config {
            sweep_interval_seconds: 0,
            ..Default::default()
        };
        config.save(&path).unwrap();

        assert!(matches!(
            Config::load_or_create(&path),
            Err(Error::InvalidConfig(_))
        ));
    }
}
