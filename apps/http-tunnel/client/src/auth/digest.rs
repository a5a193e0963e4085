use std::collections::HashMap;

use super::{ProxyAuthError, ProxyCredentials};

/// A validated `Digest` challenge (MD5, `qop=auth`).
#[derive(Debug, Clone)]
pub struct DigestChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
}

impl DigestChallenge {
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, ProxyAuthError> {
        let required = |key: &'static str| {
            params
                .get(key)
                .cloned()
                .ok_or(ProxyAuthError::MissingParameter(key))
        };
        let realm = required("realm")?;
        let nonce = required("nonce")?;
        let qop = required("qop")?;

        if let Some(algorithm) = params.get("algorithm") {
            let md5 = algorithm
                .split(',')
                .any(|candidate| candidate.trim().eq_ignore_ascii_case("md5"));
            if !md5 {
                return Err(ProxyAuthError::UnsupportedAlgorithm(algorithm.clone()));
            }
        }
        if !qop.split(',').any(|option| option.trim() == "auth") {
            return Err(ProxyAuthError::UnsupportedQop(qop));
        }

        Ok(Self {
            realm,
            nonce,
            opaque: params.get("opaque").cloned(),
        })
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Renders the `Proxy-Authorization` value for one request.
    pub fn authorization(
        &self,
        credentials: &ProxyCredentials,
        method: &str,
        uri: &str,
        cnonce: &str,
        nonce_count: u32,
    ) -> String {
        let nc = format!("{nonce_count:08x}");
        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            credentials.username(),
            self.realm,
            credentials.password()
        ));
        let ha2 = md5_hex(&format!("{method}:{uri}"));
        let response = md5_hex(&format!(
            "{ha1}:{}:{nc}:{cnonce}:auth:{ha2}",
            self.nonce
        ));

        let mut parts = vec![
            format!("realm=\"{}\"", self.realm),
            format!("nonce=\"{}\"", self.nonce),
            format!("username=\"{}\"", credentials.username()),
            format!("uri=\"{uri}\""),
            "qop=auth".to_string(),
            format!("cnonce=\"{cnonce}\""),
            format!("nc={nc}"),
        ];
        if let Some(opaque) = &self.opaque {
            parts.push(format!("opaque=\"{opaque}\""));
        }
        parts.push(format!("response=\"{response}\""));
        format!("Digest {}", parts.join(", "))
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}
