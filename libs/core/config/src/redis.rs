use crate::{ConfigError, FromEnv, env_required};

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl FromEnv for RedisConfig {
    /// Reads `REDIS_URL`, falling back to `REDIS_HOST`. One of them must be set.
    fn from_env() -> Result<Self, ConfigError> {
        let url = match env_required("REDIS_URL") {
            Ok(url) => url,
            Err(_) => env_required("REDIS_HOST")
                .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?,
        };

        Ok(Self { url })
    }
}
