use std::{env, num::ParseIntError, time::Duration};

use thiserror::Error;

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(1000);

pub const COMMAND_TIMEOUT_ENV: &str = "AVDECC_COMMAND_TIMEOUT_MS";
pub const REFRESH_INTERVAL_ENV: &str = "AVDECC_REFRESH_INTERVAL_MS";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("invalid {var}={value:?}, must be an integer number of milliseconds")]
  InvalidDuration { var: &'static str, value: String, #[source] source: ParseIntError },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
  /// How long a dispatcher waits for the reply to one command.
  pub command_timeout: Duration,
  /// Period of the end station list refresh.
  pub refresh_interval: Duration,
}

impl Default for ControllerConfig {
  fn default() -> Self {
    Self { command_timeout: DEFAULT_COMMAND_TIMEOUT, refresh_interval: DEFAULT_REFRESH_INTERVAL }
  }
}

impl ControllerConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|var| env::var(var).ok())
  }

  fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
    let millis = |var: &'static str, default: Duration| match lookup(var) {
      None => Ok(default),
      Some(value) => match value.trim().parse::<u64>() {
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(source) => Err(ConfigError::InvalidDuration { var, value, source }),
      },
    };
    Ok(Self {
      command_timeout: millis(COMMAND_TIMEOUT_ENV, DEFAULT_COMMAND_TIMEOUT)?,
      refresh_interval: millis(REFRESH_INTERVAL_ENV, DEFAULT_REFRESH_INTERVAL)?,
    })
  }

  pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
    self.command_timeout = timeout;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_without_env() {
    let config = ControllerConfig::from_lookup(|_| None).unwrap();
    assert_eq!(config, ControllerConfig::default());
  }

  #[test]
  fn test_env_overrides() {
    let config = ControllerConfig::from_lookup(|var| match var {
      COMMAND_TIMEOUT_ENV => Some("250".to_owned()),
      _ => None,
    }).unwrap();
    assert_eq!(config.command_timeout, Duration::from_millis(250));
    assert_eq!(config.refresh_interval, DEFAULT_REFRESH_INTERVAL);
  }

  #[test]
  fn test_invalid_value_is_an_error() {
    let result = ControllerConfig::from_lookup(|var| match var {
      REFRESH_INTERVAL_ENV => Some("soon".to_owned()),
      _ => None,
    });
    assert!(matches!(result, Err(ConfigError::InvalidDuration { var: REFRESH_INTERVAL_ENV, .. })));
  }
}
