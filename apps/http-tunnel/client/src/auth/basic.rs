use base64::{engine::general_purpose::STANDARD, Engine};

use super::ProxyCredentials;

pub fn basic_authorization(credentials: &ProxyCredentials) -> String {
    let token = STANDARD.encode(format!(
        "{}:{}",
        credentials.username(),
        credentials.password()
    ));
    format!("Basic {token}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_user_and_password() {
        let credentials = ProxyCredentials::new("Aladdin", "open sesame");
        assert_eq!(
            basic_authorization(&credentials),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }
}
