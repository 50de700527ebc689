//! Control-plane authentication: HTTP Basic (or WebSocket-subprotocol Basic)
//! against a single configured credential.
//!
//! There is no user store here, just one operator credential per
//! `[ui_server.authentication]`, so the comparison is done directly rather
//! than through a password-hashing pipeline (see DESIGN.md).

use base64::Engine;

use crate::config::AuthenticationConfig;

/// Constant-time byte comparison, independent of `subtle`: this is the only
/// place the crate compares secrets, so a small hand-rolled accumulator is
/// enough to avoid an early-exit timing leak.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verify a raw `Authorization: Basic <base64>` header value.
pub fn verify_basic_auth(header_value: &str, config: &AuthenticationConfig) -> bool {
    if !config.enabled {
        return true;
    }
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    constant_time_eq(user.as_bytes(), config.username.as_bytes())
        && constant_time_eq(pass.as_bytes(), config.password.as_bytes())
}

/// Verify the same credential pair carried as a WebSocket subprotocol token
/// (`protocolBasicAuth`): `base64("user:pass")` sent as the chosen subprotocol.
pub fn verify_protocol_basic_auth(subprotocol: &str, config: &AuthenticationConfig) -> bool {
    if !config.enabled {
        return true;
    }
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(subprotocol) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return false;
    };
    constant_time_eq(user.as_bytes(), config.username.as_bytes())
        && constant_time_eq(pass.as_bytes(), config.password.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthenticationConfig {
        AuthenticationConfig {
            enabled: true,
            r#type: crate::config::AuthenticationType::BasicAuth,
            username: "admin".into(),
            password: "secret".into(),
        }
    }

    #[test]
    fn disabled_auth_always_passes() {
        let mut cfg = config();
        cfg.enabled = false;
        assert!(verify_basic_auth("garbage", &cfg));
    }

    #[test]
    fn correct_basic_credentials_pass() {
        let cfg = config();
        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("admin:secret")
        );
        assert!(verify_basic_auth(&header, &cfg));
    }

    #[test]
    fn wrong_password_fails() {
        let cfg = config();
        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("admin:wrong")
        );
        assert!(!verify_basic_auth(&header, &cfg));
    }
}
