use std::time::Duration;

use crate::configuration::UpstreamConfig;

pub const MODELS_PATH: &str = "/v1/models";
pub const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// The upstream completion service: its endpoints, the service credential,
/// and the shared HTTP client used to reach it.
#[derive(Clone, Debug)]
pub struct Upstream {
    base_url: String,
    api_key: String,
    validation_timeout: Duration,
    relay_timeout: Duration,
    client: reqwest::Client,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            validation_timeout: Duration::from_secs(config.validation_timeout_secs),
            relay_timeout: Duration::from_secs(config.relay_timeout_secs),
            client,
        })
    }

    pub fn models_url(&self) -> String {
        format!("{}{MODELS_PATH}", self.base_url)
    }

    pub fn completions_url(&self) -> String {
        format!("{}{COMPLETIONS_PATH}", self.base_url)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn validation_timeout(&self) -> Duration {
        self.validation_timeout
    }

    pub fn relay_timeout(&self) -> Duration {
        self.relay_timeout
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_ignore_trailing_slash() {
        let config = UpstreamConfig {
            base_url: "http://10.0.0.1:9000/".into(),
            ..UpstreamConfig::default()
        };
        let upstream = Upstream::new(&config).unwrap();
        assert_eq!(upstream.models_url(), "http://10.0.0.1:9000/v1/models");
        assert_eq!(
            upstream.completions_url(),
            "http://10.0.0.1:9000/v1/chat/completions"
        );
    }

    #[test]
    fn carries_service_key_and_timeout() {
        let config = UpstreamConfig {
            api_key: "sk-service".into(),
            validation_timeout_secs: 7,
            relay_timeout_secs: 90,
            ..UpstreamConfig::default()
        };
        let upstream = Upstream::new(&config).unwrap();
        assert_eq!(upstream.api_key(), "sk-service");
        assert_eq!(upstream.validation_timeout(), Duration::from_secs(7));
        assert_eq!(upstream.relay_timeout(), Duration::from_secs(90));
    }
}
