use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::collaborators::AttestationProvider;
use crate::error::BackendError;

/// Bytes signed with the installation key when exchanging for a backend session.
pub fn attestation_digest(inbox_id: &str, installation_id: &str, token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(inbox_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(installation_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Timestamped random nonce; for development backends without device attestation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NonceAttestation;

#[async_trait]
impl AttestationProvider for NonceAttestation {
    async fn attestation_token(&self) -> Result<String, BackendError> {
        let nonce: [u8; 16] = rand::random();
        Ok(format!(
            "{}.{}",
            chrono::Utc::now().timestamp(),
            hex::encode(nonce)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_binds_every_field() {
        let base = attestation_digest("inbox", "inst", "tok");
        assert_eq!(base.len(), 32);
        assert_eq!(base, attestation_digest("inbox", "inst", "tok"));
        assert_ne!(base, attestation_digest("inbox", "inst2", "tok"));
        // Field separators keep concatenation ambiguity out.
        assert_ne!(
            attestation_digest("ab", "c", "t"),
            attestation_digest("a", "bc", "t")
        );
    }

    #[tokio::test]
    async fn nonce_tokens_are_unique() {
        let a = NonceAttestation.attestation_token().await.unwrap();
        let b = NonceAttestation.attestation_token().await.unwrap();
        assert_ne!(a, b);
        assert!(a.contains('.'));
    }
}
