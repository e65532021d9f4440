use crate::backend::{command::CommandBackend, echo::EchoBackend, GenerationBackend};
use crate::config::Config;
use crate::error::{HostError, Result};
use std::sync::Arc;
use std::time::Duration;

/// Backend factory for creating generation backends based on the backend name
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend instance from the host configuration
    ///
    /// # Errors
    /// * Returns `HostError::ConfigError` if the backend name is unknown or
    ///   the `command` backend has no program configured
    pub fn create(config: &Config) -> Result<Arc<dyn GenerationBackend>> {
        match config.backend.to_lowercase().as_str() {
            "echo" => Ok(Arc::new(EchoBackend::new(
                config.echo_available,
                Duration::from_millis(config.echo_delay_ms),
                config.stream_buffer,
            ))),
            "command" => {
                let program = config.command.clone().ok_or_else(|| {
                    HostError::ConfigError(
                        "backend = \"command\" requires a `command` entry".to_string(),
                    )
                })?;
                Ok(Arc::new(CommandBackend::new(
                    program,
                    config.args.clone(),
                    config.stream_buffer,
                )))
            }
            _ => Err(HostError::ConfigError(format!(
                "Unknown backend: {}\nSupported backends: {}",
                config.backend,
                Self::supported_backends().join(", ")
            ))),
        }
    }

    /// Get a list of all supported backend names
    pub fn supported_backends() -> Vec<&'static str> {
        vec!["echo", "command"]
    }
}
