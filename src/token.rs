//! 卡片令牌：`{code}.{base64url(HMAC-SHA256(secret, code))}`。

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn signature(&self, code: &str) -> Vec<u8> {
        // HMAC accepts keys of any length, including empty ones
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(code.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    pub fn issue(&self, code: &str) -> String {
        format!("{code}.{}", URL_SAFE_NO_PAD.encode(self.signature(code)))
    }

    /// Returns the card code a well-formed, correctly signed token carries.
    pub fn verify(&self, token: &str) -> Option<String> {
        let (code, signature) = token.trim().split_once('.')?;
        if code.is_empty() || !code.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let provided = URL_SAFE_NO_PAD.decode(signature).ok()?;
        let expected = self.signature(code);
        if expected.is_empty() || !bool::from(provided.ct_eq(&expected)) {
            return None;
        }
        Some(code.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_tokens_verify() {
        let signer = TokenSigner::new("s3cret");
        let token = signer.issue("123456789");
        assert!(token.starts_with("123456789."));
        assert_eq!(signer.verify(&token).as_deref(), Some("123456789"));
    }

    #[test]
    fn tampered_or_foreign_tokens_fail() {
        let signer = TokenSigner::new("s3cret");
        let token = signer.issue("123456789");

        let swapped = token.replacen("123456789", "123456780", 1);
        assert!(signer.verify(&swapped).is_none());
        assert!(TokenSigner::new("other").verify(&token).is_none());
        assert!(signer.verify("123456789").is_none());
        assert!(signer.verify("123456789.!!!").is_none());
        assert!(signer.verify(".abc").is_none());
    }
}
