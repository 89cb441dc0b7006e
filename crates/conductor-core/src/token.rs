//! Scoped worker tokens for the status callback.
//!
//! The internal callback endpoint only accepts loopback traffic, but the
//! container also carries an HMAC-SHA256 token scoped to its task so a
//! neighbouring process on the host cannot forge status updates.
//! Format: `cdr_wt_<task_id>_<hmac_hex>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "cdr_wt_";

/// Errors from token validation.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,
}

/// Generate the callback token for a task.
pub fn generate(secret: &[u8], task_id: &str) -> String {
    let mac = compute_hmac(secret, task_id.as_bytes());
    format!("{TOKEN_PREFIX}{task_id}_{}", hex::encode(mac))
}

/// Validate a token and return the task id it is scoped to.
///
/// Verification is constant-time on the HMAC comparison.
pub fn validate(secret: &[u8], token: &str) -> Result<String, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat(format!("token must start with {TOKEN_PREFIX:?}"))
    })?;

    let (task_id, mac_hex) = rest
        .rsplit_once('_')
        .ok_or_else(|| TokenError::InvalidFormat("missing HMAC segment".to_string()))?;
    if task_id.is_empty() {
        return Err(TokenError::InvalidFormat("empty task id".to_string()));
    }
    let mac_bytes = hex::decode(mac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("HMAC is not hex: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(task_id.as_bytes());
    mac.verify_slice(&mac_bytes)
        .map_err(|_| TokenError::HmacMismatch)?;

    Ok(task_id.to_string())
}

fn compute_hmac(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn round_trip() {
        let token = generate(SECRET, "t-000042");
        assert!(token.starts_with("cdr_wt_t-000042_"));
        assert_eq!(validate(SECRET, &token).unwrap(), "t-000042");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = generate(SECRET, "t-000042");
        let err = validate(b"another-secret-entirely-32-bytes", &token).unwrap_err();
        assert!(matches!(err, TokenError::HmacMismatch));
    }

    #[test]
    fn token_is_scoped_to_its_task() {
        let token = generate(SECRET, "t-000001");
        let forged = token.replace("t-000001", "t-000002");
        assert!(validate(SECRET, &forged).is_err());
    }

    #[test]
    fn malformed_tokens_rejected() {
        assert!(matches!(
            validate(SECRET, "nonsense"),
            Err(TokenError::InvalidFormat(_))
        ));
        assert!(validate(SECRET, "cdr_wt_").is_err());
        assert!(validate(SECRET, "cdr_wt_t-000001_nothex!").is_err());
    }

    #[test]
    fn task_ids_with_underscores_still_validate() {
        // rsplit keeps the last segment as the HMAC even when the id itself
        // carries underscores.
        let token = generate(SECRET, "custom_task_id");
        assert_eq!(validate(SECRET, &token).unwrap(), "custom_task_id");
    }
}
