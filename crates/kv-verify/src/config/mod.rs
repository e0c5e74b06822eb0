//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl CheckConfig {
    /// Validate the check settings without the store sections.
    pub fn validate(&self) -> Result<()> {
        validation::validate_check(self)
    }
}

impl StoreConfig {
    /// Fully qualified, quoted table reference.
    pub fn qualified_table(&self) -> String {
        format!(
            "{}.{}",
            quote_pg_ident(&self.schema),
            quote_pg_ident(&self.table)
        )
    }

    /// Human-readable endpoint for logs (no credentials).
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

/// Quote a PostgreSQL identifier.
pub(crate) fn quote_pg_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
