//! Proxy authentication for tunnel sub-connections.
//!
//! A [`ProxyAuthNegotiator`] sits between a sub-connection and the proxy. It
//! decorates every outgoing request and, when the proxy answers `407`, picks
//! a scheme from the challenge so the same request can be sent again with
//! credentials. Digest is preferred over Basic.

mod basic;
mod digest;
pub mod params;

use std::{collections::HashMap, fmt};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Request};
use http_tunnel_core::{protocol::duplicate_request, TunnelError};
use rand::RngCore;
use thiserror::Error;

pub use basic::basic_authorization;
pub use digest::DigestChallenge;
use params::parse_parameters;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyAuthError {
    #[error("Malformed or missing proxy auth headers")]
    MalformedChallenge,
    #[error("unsupported proxy auth scheme(s): {0}")]
    UnsupportedScheme(String),
    #[error("digest challenge is missing {0}")]
    MissingParameter(&'static str),
    #[error("unsupported digest algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("unsupported digest qop {0}")]
    UnsupportedQop(String),
    #[error("proxy requested authentication but no credentials are configured")]
    MissingCredentials,
    #[error("Received HTTP 407 response even though we already provided credentials")]
    CredentialsRejected,
    #[error("credentials cannot be encoded as a header value")]
    InvalidHeader,
}

impl ProxyAuthError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::MalformedChallenge => "malformed_challenge",
            Self::UnsupportedScheme(_) => "unsupported_scheme",
            Self::MissingParameter(_) | Self::UnsupportedAlgorithm(_) | Self::UnsupportedQop(_) => {
                "unsupported_digest"
            }
            Self::MissingCredentials => "missing_credentials",
            Self::CredentialsRejected => "credentials_rejected",
            Self::InvalidHeader => "invalid_header",
        }
    }
}

impl From<ProxyAuthError> for TunnelError {
    fn from(err: ProxyAuthError) -> Self {
        TunnelError::ProxyAuthentication(err.to_string())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    username: String,
    password: String,
}

impl ProxyCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
enum Scheme {
    Basic,
    Digest(DigestChallenge),
}

impl Scheme {
    fn name(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Digest(_) => "digest",
        }
    }
}

#[derive(Debug)]
pub struct ProxyAuthNegotiator {
    credentials: Option<ProxyCredentials>,
    scheme: Option<Scheme>,
    cnonce: String,
    nonce_count: u32,
    credentials_outstanding: bool,
}

impl ProxyAuthNegotiator {
    pub fn new(credentials: Option<ProxyCredentials>) -> Self {
        let mut raw = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut raw);
        Self {
            credentials,
            scheme: None,
            cnonce: hex::encode(raw),
            nonce_count: 0,
            credentials_outstanding: false,
        }
    }

    pub fn scheme_name(&self) -> Option<&'static str> {
        self.scheme.as_ref().map(Scheme::name)
    }

    /// Copies `request` with the proxy headers attached, including
    /// credentials once a challenge has been answered.
    pub fn decorate(&mut self, request: &Request<Bytes>) -> Result<Request<Bytes>, ProxyAuthError> {
        let mut decorated = duplicate_request(request);
        let authorization = match (&self.scheme, &self.credentials) {
            (Some(Scheme::Basic), Some(credentials)) => Some(basic_authorization(credentials)),
            (Some(Scheme::Digest(challenge)), Some(credentials)) => {
                self.nonce_count = self.nonce_count.wrapping_add(1);
                Some(challenge.authorization(
                    credentials,
                    request.method().as_str(),
                    &request.uri().to_string(),
                    &self.cnonce,
                    self.nonce_count,
                ))
            }
            _ => None,
        };

        let headers = decorated.headers_mut();
        if let Some(authorization) = &authorization {
            let value =
                HeaderValue::from_str(authorization).map_err(|_| ProxyAuthError::InvalidHeader)?;
            headers.insert(header::PROXY_AUTHORIZATION, value);
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("No-Cache"));
        self.credentials_outstanding = authorization.is_some();
        Ok(decorated)
    }

    /// Handles a `407`. Fails when credentials were already attached to the
    /// request being answered, or when no usable scheme is offered.
    pub fn on_challenge(&mut self, headers: &HeaderMap) -> Result<(), ProxyAuthError> {
        if self.credentials_outstanding {
            return Err(ProxyAuthError::CredentialsRejected);
        }
        let challenges = parse_challenges(headers);
        if challenges.is_empty() {
            return Err(ProxyAuthError::MalformedChallenge);
        }
        if self.credentials.is_none() {
            return Err(ProxyAuthError::MissingCredentials);
        }

        let scheme = if let Some(params) = challenges.get("digest") {
            Scheme::Digest(DigestChallenge::from_params(params)?)
        } else if challenges.contains_key("basic") {
            Scheme::Basic
        } else {
            let mut offered: Vec<_> = challenges.keys().cloned().collect();
            offered.sort();
            return Err(ProxyAuthError::UnsupportedScheme(offered.join(", ")));
        };
        self.scheme = Some(scheme);
        Ok(())
    }

    /// Called for every response that is not a `407`.
    pub fn on_response(&mut self) {
        self.credentials_outstanding = false;
    }
}

fn parse_challenges(headers: &HeaderMap) -> HashMap<String, HashMap<String, String>> {
    headers
        .get_all(header::PROXY_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| {
            let (scheme, params) = value.split_once(' ').unwrap_or((value, ""));
            (scheme.to_ascii_lowercase(), parse_parameters(params, ','))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::*;

    fn request() -> Request<Bytes> {
        Request::builder()
            .method(Method::POST)
            .uri("http://127.0.0.1:8080/http-tunnel/open")
            .body(Bytes::new())
            .unwrap()
    }

    fn challenge(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(header::PROXY_AUTHENTICATE, HeaderValue::from_static(value));
        }
        headers
    }

    fn negotiator() -> ProxyAuthNegotiator {
        ProxyAuthNegotiator::new(Some(ProxyCredentials::new("user", "secret")))
    }

    #[test]
    fn decorates_without_credentials_before_challenge() {
        let mut negotiator = negotiator();
        let decorated = negotiator.decorate(&request()).unwrap();
        assert!(decorated.headers().get(header::PROXY_AUTHORIZATION).is_none());
        assert_eq!(decorated.headers()[header::CONNECTION], "Keep-Alive");
        assert_eq!(decorated.headers()[header::PRAGMA], "No-Cache");
    }

    #[test]
    fn prefers_digest_and_counts_nonces() {
        let mut negotiator = negotiator();
        negotiator
            .on_challenge(&challenge(&[
                "Basic realm=\"proxy\"",
                "Digest realm=\"proxy\", nonce=\"abc\", qop=\"auth\"",
            ]))
            .unwrap();
        assert_eq!(negotiator.scheme_name(), Some("digest"));

        let first = negotiator.decorate(&request()).unwrap();
        negotiator.on_response();
        let second = negotiator.decorate(&request()).unwrap();
        let first = first.headers()[header::PROXY_AUTHORIZATION].to_str().unwrap();
        let second = second.headers()[header::PROXY_AUTHORIZATION].to_str().unwrap();
        assert!(first.starts_with("Digest realm=\"proxy\", nonce=\"abc\", username=\"user\""));
        assert!(first.contains("nc=00000001"));
        assert!(second.contains("nc=00000002"));
        let cnonce = |value: &str| value.split("cnonce=").nth(1).map(|rest| rest[..18].to_string());
        assert_eq!(cnonce(first), cnonce(second));
    }

    #[test]
    fn basic_when_only_basic_offered() {
        let mut negotiator = negotiator();
        negotiator
            .on_challenge(&challenge(&["Basic realm=\"proxy\""]))
            .unwrap();
        let decorated = negotiator.decorate(&request()).unwrap();
        assert_eq!(
            decorated.headers()[header::PROXY_AUTHORIZATION],
            "Basic dXNlcjpzZWNyZXQ="
        );
    }

    #[test]
    fn second_challenge_for_same_request_fails() {
        let mut negotiator = negotiator();
        let headers = challenge(&["Basic realm=\"proxy\""]);
        negotiator.on_challenge(&headers).unwrap();
        negotiator.decorate(&request()).unwrap();
        assert_eq!(
            negotiator.on_challenge(&headers),
            Err(ProxyAuthError::CredentialsRejected)
        );
    }

    #[test]
    fn rejects_unusable_challenges() {
        let mut negotiator = negotiator();
        assert_eq!(
            negotiator.on_challenge(&HeaderMap::new()),
            Err(ProxyAuthError::MalformedChallenge)
        );
        assert_eq!(
            negotiator.on_challenge(&challenge(&["NTLM", "Negotiate abc"])),
            Err(ProxyAuthError::UnsupportedScheme("negotiate, ntlm".into()))
        );

        let mut anonymous = ProxyAuthNegotiator::new(None);
        assert_eq!(
            anonymous.on_challenge(&challenge(&["Basic realm=\"proxy\""])),
            Err(ProxyAuthError::MissingCredentials)
        );
    }
}
