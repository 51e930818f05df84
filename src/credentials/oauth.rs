//! HTTP token exchanger
//!
//! Performs the OAuth2 `refresh_token` grant against a backend's token
//! endpoint (Dropbox- and Google-Drive-style APIs). Construction is cheap;
//! the actual exchange is serialized per mount by the credential store.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;

use super::{OAuthToken, RefreshError, TokenExchanger};

/// Response structure from the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Some providers rotate the refresh token on every exchange
    refresh_token: Option<String>,
    /// Token lifetime in seconds from now
    expires_in: Option<u64>,
}

/// Configuration for the HTTP token exchanger.
#[derive(Debug, Clone)]
pub struct HttpTokenExchangerConfig {
    /// Token endpoint URL
    pub endpoint: String,
    /// OAuth client/app id
    pub client_id: String,
    /// OAuth client/app secret
    pub client_secret: String,
}

/// Exchanges a refresh token for a fresh access token over HTTP.
pub struct HttpTokenExchanger {
    config: HttpTokenExchangerConfig,
    client: reqwest::Client,
}

impl HttpTokenExchanger {
    pub fn new(config: HttpTokenExchangerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(&self, token: &OAuthToken) -> Result<OAuthToken, RefreshError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", token.refresh_token.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(&self.config.endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| RefreshError(format!("token endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // 4xx means the grant itself was rejected (revoked, bad app
            // key/secret); administrator action is required either way.
            return Err(RefreshError(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| RefreshError(format!("malformed token response: {}", e)))?;

        let expires_at = parsed
            .expires_in
            .map(|secs| SystemTime::now() + Duration::from_secs(secs));

        Ok(OAuthToken {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .unwrap_or_else(|| token.refresh_token.clone()),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_response_parsing() {
        let json = r#"{"access_token":"at-1","expires_in":14400}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.access_token, "at-1");
        assert_eq!(parsed.expires_in, Some(14400));
        assert!(parsed.refresh_token.is_none());
    }

    #[test]
    fn test_token_response_with_rotated_refresh_token() {
        let json = r#"{"access_token":"at-2","refresh_token":"rt-2","expires_in":3600}"#;
        let parsed: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.refresh_token.as_deref(), Some("rt-2"));
    }
}
