//! Launcher configuration

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{ProcessError, Result};

/// Default time a terminated process gets between SIGTERM and SIGKILL
const DEFAULT_TERMINATION_GRACE_MS: u64 = 2000;

/// Environment prefix read by [`ConfigLoader`]
const DEFAULT_ENV_PREFIX: &str = "PREDICTED";

/// How shell commands are turned into OS processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Shell interpreter the command is handed to
    pub shell: String,
    /// Argument telling the shell to run the next argument as a command
    pub shell_arg: String,
    /// Grace period between the termination request and a forced kill
    pub termination_grace_ms: u64,
}

impl LauncherConfig {
    /// Create configuration with platform defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shell interpreter
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Set the shell's command argument
    pub fn shell_arg(mut self, arg: impl Into<String>) -> Self {
        self.shell_arg = arg.into();
        self
    }

    /// Set the termination grace period
    pub fn termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Grace period as a [`Duration`]
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    /// Check that the configuration can launch anything at all
    pub fn validate(&self) -> Result<()> {
        if self.shell.trim().is_empty() {
            return Err(ProcessError::InvalidConfig(
                "Shell must not be empty".to_string(),
            ));
        }
        if self.termination_grace_ms == 0 {
            return Err(ProcessError::InvalidConfig(
                "Termination grace period must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        #[cfg(windows)]
        let (shell, shell_arg) = ("cmd", "/C");
        #[cfg(not(windows))]
        let (shell, shell_arg) = ("/bin/sh", "-c");

        Self {
            shell: shell.to_string(),
            shell_arg: shell_arg.to_string(),
            termination_grace_ms: DEFAULT_TERMINATION_GRACE_MS,
        }
    }
}

/// Loads [`LauncherConfig`] from an optional file and the environment
pub struct ConfigLoader {
    /// Configuration file path (missing file is not an error)
    config_path: Option<PathBuf>,
    /// Environment prefix
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a loader reading only the environment
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    /// Create a loader reading `path` first, then the environment
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: Some(path.into()),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    /// Override the environment prefix
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Build and validate the configuration
    pub fn load(&self) -> Result<LauncherConfig> {
        let mut builder = Config::builder();
        if let Some(path) = &self.config_path {
            builder = builder.add_source(File::from(path.clone()).required(false));
        }
        builder = builder.add_source(Environment::with_prefix(&self.env_prefix).try_parsing(true));

        let config: LauncherConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
