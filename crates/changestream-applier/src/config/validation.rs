//! Configuration validation.

use super::Config;
use crate::coerce::is_valid_offset;
use crate::error::{ReplicateError, Result};

/// Upper bound on point read retries; anything larger stalls a partition for
/// too long on a single event.
const MAX_READ_RETRIES: u32 = 100;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if !is_valid_offset(&config.source.timezone_offset) {
        return Err(ReplicateError::Config(format!(
            "source.timezone_offset must look like +HH:MM or -HH:MM, got '{}'",
            config.source.timezone_offset
        )));
    }

    if config.catalog.path.as_os_str().is_empty() {
        return Err(ReplicateError::Config("catalog.path is required".into()));
    }

    let retry = &config.translation.read_retry;
    if retry.max_retries > MAX_READ_RETRIES {
        return Err(ReplicateError::Config(format!(
            "translation.read_retry.max_retries must be at most {}",
            MAX_READ_RETRIES
        )));
    }
    if retry.attempt_timeout_secs == 0 {
        return Err(ReplicateError::Config(
            "translation.read_retry.attempt_timeout_secs must be at least 1".into(),
        ));
    }

    if config.failsafe.log_throttle_secs == 0 {
        return Err(ReplicateError::Config(
            "failsafe.log_throttle_secs must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use std::path::PathBuf;

    fn valid_config() -> Config {
        Config {
            source: SourceConfig::default(),
            catalog: CatalogConfig {
                path: PathBuf::from("catalog.yaml"),
            },
            translation: TranslationConfig::default(),
            failsafe: FailsafeConfig::default(),
            partition: PartitionConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_bad_offset() {
        let mut config = valid_config();
        config.source.timezone_offset = "UTC".to_string();
        assert!(validate(&config).is_err());

        config.source.timezone_offset = "-05:00".to_string();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_catalog_path() {
        let mut config = valid_config();
        config.catalog.path = PathBuf::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_retry_bounds() {
        let mut config = valid_config();
        config.translation.read_retry.max_retries = 101;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.translation.read_retry.attempt_timeout_secs = 0;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.translation.read_retry.max_retries = 0;
        config.translation.read_retry.backoff_ms = 0;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_throttle_interval() {
        let mut config = valid_config();
        config.failsafe.log_throttle_secs = 0;
        assert!(validate(&config).is_err());
    }
}
