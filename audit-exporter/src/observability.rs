//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::{Error, Result}};

/// Initialize JSON tracing output filtered by `service.log_level`
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!("Tracing initialized for service: {}", config.service.name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice_does_not_panic() {
        let config = Config::default();
        let _ = init_tracing(&config);
        // A second subscriber is rejected, not a panic
        assert!(init_tracing(&config).is_err());
    }
}
