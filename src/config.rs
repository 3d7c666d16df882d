//! Application configuration
//!
//! Defaults, optionally overlaid by a TOML file, then by environment / CLI flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Application configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    /// Address the HTTP API listens on
    pub bind: String,
    /// SQLite event store
    pub database: PathBuf,
    /// Default tracing filter directive
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            database: PathBuf::from("monitoring.db"),
            log_filter: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Defaults, or the given TOML file on top of them.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn with_bind(mut self, bind: Option<String>) -> Self {
        if let Some(bind) = bind {
            self.bind = bind;
        }
        self
    }

    pub fn with_database(mut self, database: Option<PathBuf>) -> Self {
        if let Some(database) = database {
            self.database = database;
        }
        self
    }

    pub fn with_log_filter(mut self, filter: Option<String>) -> Self {
        if let Some(filter) = filter {
            self.log_filter = filter;
        }
        self
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::InvalidAddr(self.bind.clone()))
    }

    /// Filter directive for the given `-v` count.
    pub fn log_level(&self, verbose: u8) -> String {
        match verbose {
            0 => self.log_filter.clone(),
            1 => "debug".to_string(),
            2 => "trace".to_string(),
            _ => "trace,hyper=debug,tower=debug".to_string(),
        }
    }
}
