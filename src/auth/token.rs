//! Signed tokens for node-to-node auth and CSRF protection
//!
//! Both token kinds are an AES-256-GCM sealed JSON payload carried as
//! base64. The key is derived from the shared secret with SHA-256, so
//! every node configured with the same serverSecret can verify peers.
//!
//! The two windows are deliberately different: peer tokens are minted per
//! request and bound to the exact path (120 s skew), while the CSRF cookie
//! rides a browser tab across interactions (2400 s skew).

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::util::now_ms;

/// Peer tokens expire 120 s from minting; replay beyond that is rejected.
pub const PEER_TOKEN_MAX_SKEW_MS: u64 = 120_000;

/// CSRF cookie tokens stay valid for 2400 s.
pub const CSRF_TOKEN_MAX_SKEW_MS: u64 = 2_400_000;

const NONCE_LEN: usize = 12;

/// Sealed-payload cipher shared by both token kinds
#[derive(Clone)]
pub struct TokenCrypto {
    cipher: Aes256Gcm,
}

impl TokenCrypto {
    /// Derive the AES key from a shared secret.
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Seal a payload: base64(nonce || ciphertext).
    fn seal(&self, payload: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, payload)
            .map_err(|_| anyhow!("Token encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(B64.encode(out))
    }

    /// Open a sealed token. Any tampering fails authentication.
    fn open(&self, token: &str) -> Result<Vec<u8>> {
        let raw = B64.decode(token).context("Token is not valid base64")?;
        if raw.len() <= NONCE_LEN {
            bail!("Token too short");
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("Token failed authentication"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer auth tokens (x-moloch-auth)
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of an `x-moloch-auth` header
#[derive(Debug, Serialize, Deserialize)]
pub struct PeerToken {
    /// Mint time, ms since epoch
    pub date: u64,
    pub pid: u32,
    #[serde(rename = "user")]
    pub user_id: String,
    /// The exact request URL the token authorizes
    pub path: String,
}

/// Mint a peer token bound to `path` for the on-behalf-of user.
pub fn sign_peer(crypto: &TokenCrypto, user_id: &str, path: &str) -> Result<String> {
    let token = PeerToken {
        date: now_ms(),
        pid: std::process::id(),
        user_id: user_id.to_string(),
        path: path.to_string(),
    };
    let payload = serde_json::to_vec(&token)?;
    crypto.seal(&payload)
}

/// Verify a peer token against the request URL. Accepts only if the
/// decoded path equals `request_path` and the mint time is within the
/// 120 s window of `now`.
pub fn verify_peer(
    crypto: &TokenCrypto,
    token: &str,
    request_path: &str,
    now: u64,
) -> Result<PeerToken> {
    let payload = crypto.open(token)?;
    let token: PeerToken = serde_json::from_slice(&payload).context("Malformed peer token")?;
    if token.path != request_path {
        bail!("Peer token path mismatch");
    }
    if now.abs_diff(token.date) > PEER_TOKEN_MAX_SKEW_MS {
        bail!("Peer token expired");
    }
    Ok(token)
}

// ─────────────────────────────────────────────────────────────────────────────
// CSRF cookie tokens (x-moloch-cookie)
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of the CSRF cookie
#[derive(Debug, Serialize, Deserialize)]
pub struct CsrfToken {
    pub date: u64,
    pub pid: u32,
    #[serde(rename = "user")]
    pub user_id: String,
}

/// Mint the CSRF cookie value for a user.
pub fn sign_csrf(crypto: &TokenCrypto, user_id: &str) -> Result<String> {
    let token = CsrfToken {
        date: now_ms(),
        pid: std::process::id(),
        user_id: user_id.to_string(),
    };
    let payload = serde_json::to_vec(&token)?;
    crypto.seal(&payload)
}

/// Verify the header copy of the CSRF cookie: must decode, belong to the
/// session user, and be within the 2400 s window.
pub fn verify_csrf(crypto: &TokenCrypto, token: &str, user_id: &str, now: u64) -> Result<()> {
    let payload = crypto.open(token)?;
    let token: CsrfToken = serde_json::from_slice(&payload).context("Malformed cookie token")?;
    if token.user_id != user_id {
        bail!("Cookie token user mismatch");
    }
    if now.abs_diff(token.date) > CSRF_TOKEN_MAX_SKEW_MS {
        bail!("Cookie token expired");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crypto() -> TokenCrypto {
        TokenCrypto::new("test secret")
    }

    #[test]
    fn test_peer_token_roundtrip() {
        let c = crypto();
        let token = sign_peer(&c, "alice", "/cap01/hunt/h1/remote/s1").unwrap();
        let decoded = verify_peer(&c, &token, "/cap01/hunt/h1/remote/s1", now_ms()).unwrap();
        assert_eq!(decoded.user_id, "alice");
        assert_eq!(decoded.pid, std::process::id());
    }

    #[test]
    fn test_peer_token_rejects_path_mismatch() {
        let c = crypto();
        let token = sign_peer(&c, "alice", "/cap01/hunt/h1/remote/s1").unwrap();
        assert!(verify_peer(&c, &token, "/cap01/hunt/h1/remote/s2", now_ms()).is_err());
    }

    #[test]
    fn test_peer_token_rejects_replay_beyond_window() {
        let c = crypto();
        let token = sign_peer(&c, "alice", "/p").unwrap();
        let later = now_ms() + PEER_TOKEN_MAX_SKEW_MS + 1_000;
        assert!(verify_peer(&c, &token, "/p", later).is_err());
    }

    #[test]
    fn test_peer_token_accepts_within_window() {
        let c = crypto();
        let token = sign_peer(&c, "alice", "/p").unwrap();
        let later = now_ms() + PEER_TOKEN_MAX_SKEW_MS - 5_000;
        assert!(verify_peer(&c, &token, "/p", later).is_ok());
    }

    #[test]
    fn test_peer_token_rejects_wrong_secret() {
        let token = sign_peer(&crypto(), "alice", "/p").unwrap();
        let other = TokenCrypto::new("different secret");
        assert!(verify_peer(&other, &token, "/p", now_ms()).is_err());
    }

    #[test]
    fn test_peer_token_rejects_tampering() {
        let c = crypto();
        let token = sign_peer(&c, "alice", "/p").unwrap();
        let mut raw = B64.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = B64.encode(raw);
        assert!(verify_peer(&c, &tampered, "/p", now_ms()).is_err());
    }

    #[test]
    fn test_csrf_token_roundtrip_and_user_binding() {
        let c = crypto();
        let token = sign_csrf(&c, "alice").unwrap();
        assert!(verify_csrf(&c, &token, "alice", now_ms()).is_ok());
        assert!(verify_csrf(&c, &token, "bob", now_ms()).is_err());
    }

    #[test]
    fn test_csrf_window_is_wider_than_peer_window() {
        // The two windows must stay distinct
        assert!(CSRF_TOKEN_MAX_SKEW_MS > PEER_TOKEN_MAX_SKEW_MS);

        let c = crypto();
        let token = sign_csrf(&c, "alice").unwrap();
        // A time that would kill a peer token is still fine for the cookie
        let later = now_ms() + PEER_TOKEN_MAX_SKEW_MS + 60_000;
        assert!(verify_csrf(&c, &token, "alice", later).is_ok());
        // But the cookie window is enforced too
        let much_later = now_ms() + CSRF_TOKEN_MAX_SKEW_MS + 60_000;
        assert!(verify_csrf(&c, &token, "alice", much_later).is_err());
    }
}
