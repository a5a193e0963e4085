use std::net::SocketAddr;

use http_tunnel_core::{ConfigError, TunnelConfig};

use crate::auth::ProxyCredentials;

pub const OPTION_PROXY_ADDRESS: &str = "proxyaddress";
pub const OPTION_PROXY_USERNAME: &str = "proxyusername";
pub const OPTION_PROXY_PASSWORD: &str = "proxypassword";

/// Client tunnel settings: the shared tunnel knobs plus the optional
/// forward proxy both sub-connections go through.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub tunnel: TunnelConfig,
    proxy_address: Option<SocketAddr>,
    proxy_username: Option<String>,
    proxy_password: Option<String>,
}

impl ClientConfig {
    pub fn new(tunnel: TunnelConfig) -> Self {
        Self {
            tunnel,
            ..Self::default()
        }
    }

    pub fn proxy_address(&self) -> Option<SocketAddr> {
        self.proxy_address
    }

    pub fn set_proxy_address(&mut self, proxy: Option<SocketAddr>) {
        self.proxy_address = proxy;
    }

    pub fn with_proxy(mut self, proxy: SocketAddr) -> Self {
        self.proxy_address = Some(proxy);
        self
    }

    pub fn with_proxy_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.proxy_username = Some(username.into());
        self.proxy_password = Some(password.into());
        self
    }

    /// Credentials are only offered when both halves are configured.
    pub fn proxy_credentials(&self) -> Option<ProxyCredentials> {
        match (&self.proxy_username, &self.proxy_password) {
            (Some(username), Some(password)) => Some(ProxyCredentials::new(username, password)),
            _ => None,
        }
    }

    /// Applies a named option, falling back to the shared tunnel options.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<bool, ConfigError> {
        match key.to_ascii_lowercase().as_str() {
            OPTION_PROXY_ADDRESS => {
                let trimmed = value.trim();
                self.proxy_address = if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.parse().map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?)
                };
                Ok(true)
            }
            OPTION_PROXY_USERNAME => {
                self.proxy_username = Some(value.to_string());
                Ok(true)
            }
            OPTION_PROXY_PASSWORD => {
                self.proxy_password = Some(value.to_string());
                Ok(true)
            }
            _ => self.tunnel.set_option(key, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_options_and_fallthrough() {
        let mut config = ClientConfig::default();
        assert!(config.set_option("proxyAddress", "127.0.0.1:3128").unwrap());
        assert_eq!(
            config.proxy_address(),
            Some("127.0.0.1:3128".parse().unwrap())
        );
        assert!(config.proxy_credentials().is_none());
        assert!(config.set_option("ProxyUsername", "user").unwrap());
        assert!(config.set_option("proxyPassword", "pw").unwrap());
        assert_eq!(
            config.proxy_credentials(),
            Some(ProxyCredentials::new("user", "pw"))
        );
        assert!(config.set_option("pingDelay", "9").unwrap());
        assert!(!config.set_option("tcpNoDelay", "true").unwrap());
        assert!(config.set_option("proxyAddress", "not an address").is_err());
        assert!(config.set_option("proxyAddress", "").unwrap());
        assert_eq!(config.proxy_address(), None);
    }
}
