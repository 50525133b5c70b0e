//! Configuration traits and utilities.

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::LoggingConfig;
use crate::error::{ServiceError, Result};

/// Trait for service configuration types.
///
/// Implement this trait for a service's configuration struct to get
/// JSON5 loading, validation, and a defaults fallback when no file is given.
///
/// # Example
///
/// ```ignore
/// use serde::Deserialize;
/// use pistats_framework::{LoggingConfig, ServiceConfig};
///
/// #[derive(Debug, Default, Deserialize)]
/// pub struct MyConfig {
///     #[serde(default)]
///     pub logging: LoggingConfig,
/// }
///
/// impl ServiceConfig for MyConfig {
///     fn logging(&self) -> &LoggingConfig {
///         &self.logging
///     }
/// }
/// ```
pub trait ServiceConfig: Sized + DeserializeOwned + Default {
    /// Get the logging configuration.
    fn logging(&self) -> &LoggingConfig;

    /// Mutable access to the logging configuration, used for CLI overrides.
    fn logging_mut(&mut self) -> &mut LoggingConfig;

    /// Validate the configuration.
    ///
    /// Called automatically after loading. Override to add custom validation.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Load configuration from a file path.
    ///
    /// Supports JSON5 format. Calls [`validate`](Self::validate) after loading.
    fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ServiceError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&content)?;

        config.validate()?;

        Ok(config)
    }

    /// Load the configuration for a service start.
    ///
    /// An explicit path must exist. Without one, `default_file` in the working
    /// directory is used if present, otherwise built-in defaults apply.
    fn load_or_default(path: Option<&Path>, default_file: &str) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let fallback = Path::new(default_file);
        if fallback.exists() {
            return Self::load(fallback);
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize)]
    struct TestConfig {
        #[serde(default)]
        logging: LoggingConfig,
        #[serde(default)]
        interval_secs: u64,
    }

    impl ServiceConfig for TestConfig {
        fn logging(&self) -> &LoggingConfig {
            &self.logging
        }

        fn logging_mut(&mut self) -> &mut LoggingConfig {
            &mut self.logging
        }

        fn validate(&self) -> Result<()> {
            if self.interval_secs > 3600 {
                return Err(ServiceError::validation("interval_secs too large"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_config_not_found() {
        let result = TestConfig::load("/nonexistent/path.json5");
        assert!(matches!(result, Err(ServiceError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_explicit_missing_path_is_an_error() {
        let result =
            TestConfig::load_or_default(Some(Path::new("/nonexistent/x.json5")), "x.json5");
        assert!(matches!(result, Err(ServiceError::ConfigNotFound { .. })));
    }

    #[test]
    fn test_defaults_without_file() {
        let config =
            TestConfig::load_or_default(None, "definitely-not-present-pistats.json5").unwrap();
        assert_eq!(config.interval_secs, 0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json5");
        std::fs::write(&path, "{ interval_secs: 7200 }").unwrap();

        let result = TestConfig::load(&path);
        assert!(matches!(result, Err(ServiceError::ConfigValidation(_))));
    }

    #[test]
    fn test_load_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json5");
        std::fs::write(&path, "{ interval_secs: ").unwrap();

        let result = TestConfig::load(&path);
        assert!(matches!(result, Err(ServiceError::ConfigParse(_))));
    }
}
