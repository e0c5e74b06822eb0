//! Configuration validation.

use super::{CheckConfig, Config, StoreConfig};
use crate::error::{Result, VerifyError};
use crate::store::SslMode;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    validate_store("source", &config.source)?;
    validate_store("destination", &config.destination)?;

    // Comparing a table with itself proves nothing
    if config.source.host == config.destination.host
        && config.source.port == config.destination.port
        && config.source.database == config.destination.database
        && config.source.schema == config.destination.schema
        && config.source.table == config.destination.table
    {
        return Err(VerifyError::Config(
            "source and destination cannot be the same table".into(),
        ));
    }

    validate_check(&config.check)
}

/// Validate the `check` section on its own.
pub fn validate_check(check: &CheckConfig) -> Result<()> {
    for (name, value) in [
        ("check.token_ranges", check.token_ranges),
        ("check.batch_size", check.batch_size),
        ("check.origin_read_parallelism", check.origin_read_parallelism),
        ("check.target_read_parallelism", check.target_read_parallelism),
        ("check.page_size", check.page_size),
    ] {
        if value == 0 {
            return Err(VerifyError::Config(format!("{} must be at least 1", name)));
        }
    }
    if check.status_interval_secs == 0 {
        return Err(VerifyError::Config(
            "check.status_interval_secs must be at least 1".into(),
        ));
    }
    if let Some(0) = check.lookup_timeout_ms {
        return Err(VerifyError::Config(
            "check.lookup_timeout_ms must be at least 1".into(),
        ));
    }
    check.domain()?;

    Ok(())
}

fn validate_store(side: &str, store: &StoreConfig) -> Result<()> {
    for (field, value) in [
        ("host", &store.host),
        ("database", &store.database),
        ("user", &store.user),
        ("table", &store.table),
        ("key_column", &store.key_column),
        ("value_column", &store.value_column),
    ] {
        if value.is_empty() {
            return Err(VerifyError::Config(format!(
                "{}.{} is required",
                side, field
            )));
        }
    }
    if store.max_connections == 0 {
        return Err(VerifyError::Config(format!(
            "{}.max_connections must be at least 1",
            side
        )));
    }
    let ssl_mode = SslMode::parse(&store.ssl_mode)?;
    if store.ssl_root_cert.is_some() && !ssl_mode.verifies_chain() {
        return Err(VerifyError::Config(format!(
            "{}.ssl_root_cert requires ssl_mode verify-ca or verify-full",
            side
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(host: &str) -> StoreConfig {
        StoreConfig {
            host: host.to_string(),
            port: 5432,
            database: "app".to_string(),
            user: "reader".to_string(),
            password: "password".to_string(),
            schema: "public".to_string(),
            table: "keyvalue".to_string(),
            key_column: "key".to_string(),
            value_column: "value".to_string(),
            ttl_column: None,
            ssl_mode: "disable".to_string(),
            ssl_root_cert: None,
            max_connections: 8,
        }
    }

    fn valid_config() -> Config {
        Config {
            source: store("origin"),
            destination: store("target"),
            check: CheckConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_source_host() {
        let mut config = valid_config();
        config.source.host = "".to_string();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("source.host"));
    }

    #[test]
    fn test_same_table_rejected() {
        let mut config = valid_config();
        config.destination.host = "origin".to_string();
        assert!(validate(&config).is_err());

        config.destination.table = "keyvalue_copy".to_string();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = valid_config();
        config.check.batch_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_ranges_rejected() {
        let mut config = valid_config();
        config.check.token_ranges = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_check_section_validates_alone() {
        assert!(validate_check(&CheckConfig::default()).is_ok());

        for check in [
            CheckConfig {
                origin_read_parallelism: 0,
                ..Default::default()
            },
            CheckConfig {
                target_read_parallelism: 0,
                ..Default::default()
            },
            CheckConfig {
                status_interval_secs: 0,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                validate_check(&check),
                Err(VerifyError::Config(_))
            ));
        }
    }

    #[test]
    fn test_inverted_domain_rejected() {
        let mut config = valid_config();
        config.check.token_min = Some(10);
        config.check.token_max = Some(-10);
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_unknown_ssl_mode_rejected() {
        let mut config = valid_config();
        config.destination.ssl_mode = "sometimes".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_root_cert_requires_verifying_mode() {
        let mut config = valid_config();
        config.source.ssl_root_cert = Some("/etc/ssl/origin-ca.pem".to_string());
        assert!(validate(&config).is_err());

        config.source.ssl_mode = "verify-ca".to_string();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_store_config_debug_redacts_password() {
        let mut config = valid_config();
        config.source.password = "super_secret_password_123".to_string();
        let debug_output = format!("{:?}", config.source);
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super_secret_password_123"));
    }
}
