//! HTTP digest authentication (RFC 2617, MD5)
//!
//! The stored credential is HA1 (`md5(user:realm:pass)`); plaintext
//! passwords never reach this process. Nonces are stateless: an opaque
//! value derived from mint time and the password secret, checked for age
//! on verification.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;

use crate::util::now_ms;

/// Nonces older than 10 minutes force a fresh challenge.
const NONCE_MAX_AGE_MS: u64 = 600_000;

/// Compute the stored credential for a user.
pub fn ha1(user: &str, realm: &str, password: &str) -> String {
    format!(
        "{:x}",
        md5::compute(format!("{}:{}:{}", user, realm, password))
    )
}

/// Mint a nonce: `<nowMs hex>.<md5(nowMs:secret)>`.
pub fn make_nonce(secret: &str) -> String {
    let now = now_ms();
    let check = md5::compute(format!("{}:{}", now, secret));
    format!("{:x}.{:x}", now, check)
}

/// Validate a nonce we minted: intact and not expired.
fn check_nonce(nonce: &str, secret: &str, now: u64) -> Result<()> {
    let (ts_hex, check) = nonce.split_once('.').context("Malformed nonce")?;
    let ts = u64::from_str_radix(ts_hex, 16).context("Malformed nonce timestamp")?;
    let expected = format!("{:x}", md5::compute(format!("{}:{}", ts, secret)));
    if check != expected {
        bail!("Nonce not ours");
    }
    if now.abs_diff(ts) > NONCE_MAX_AGE_MS {
        bail!("Nonce expired");
    }
    Ok(())
}

/// The challenge value for a 401 WWW-Authenticate header.
pub fn challenge(realm: &str, secret: &str) -> String {
    format!(
        "Digest realm=\"{}\", nonce=\"{}\", qop=\"auth\"",
        realm,
        make_nonce(secret)
    )
}

/// Parsed fields of a `Authorization: Digest ...` header
#[derive(Debug)]
pub struct DigestAuthorization {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
}

/// Parse the parameter list of a Digest header value (after the scheme).
pub fn parse_authorization(header: &str) -> Result<DigestAuthorization> {
    let params = header
        .strip_prefix("Digest ")
        .context("Not a Digest authorization")?;

    let mut fields: HashMap<String, String> = HashMap::new();
    // Parameters are comma-separated key=value pairs; values may be quoted
    // and quoted values may contain commas (uri often does).
    let mut rest = params.trim();
    while !rest.is_empty() {
        let eq = match rest.find('=') {
            Some(i) => i,
            None => break,
        };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = stripped.find('"').context("Unterminated quoted value")?;
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }
        fields.insert(key, value);
    }

    let take = |k: &str| -> Result<String> {
        fields
            .get(k)
            .cloned()
            .with_context(|| format!("Digest header missing {}", k))
    };

    Ok(DigestAuthorization {
        username: take("username")?,
        realm: take("realm")?,
        nonce: take("nonce")?,
        uri: take("uri")?,
        response: take("response")?,
        qop: fields.get("qop").cloned(),
        nc: fields.get("nc").cloned(),
        cnonce: fields.get("cnonce").cloned(),
    })
}

/// Verify a digest response against the stored HA1.
pub fn verify(
    auth: &DigestAuthorization,
    method: &str,
    ha1: &str,
    secret: &str,
    now: u64,
) -> Result<()> {
    check_nonce(&auth.nonce, secret, now)?;

    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, auth.uri)));
    let expected = match auth.qop.as_deref() {
        Some("auth") => {
            let nc = auth.nc.as_deref().context("Digest header missing nc")?;
            let cnonce = auth.cnonce.as_deref().context("Digest header missing cnonce")?;
            format!(
                "{:x}",
                md5::compute(format!(
                    "{}:{}:{}:{}:auth:{}",
                    ha1, auth.nonce, nc, cnonce, ha2
                ))
            )
        }
        None => format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, auth.nonce, ha2))),
        Some(other) => bail!("Unsupported qop {}", other),
    };

    if expected != auth.response {
        bail!("Digest response mismatch");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit secret";

    /// Build a valid client response the way a browser would.
    fn client_response(
        user: &str,
        realm: &str,
        pass: &str,
        method: &str,
        uri: &str,
        nonce: &str,
    ) -> String {
        let ha1 = ha1(user, realm, pass);
        let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
        format!(
            "{:x}",
            md5::compute(format!("{}:{}:00000001:abcdef:auth:{}", ha1, nonce, ha2))
        )
    }

    #[test]
    fn test_parse_authorization_quoted_fields() {
        let header = "Digest username=\"alice\", realm=\"Moloch\", nonce=\"n1\", \
                      uri=\"/sessions?a=1,2\", response=\"cafe\", qop=auth, \
                      nc=00000001, cnonce=\"abcdef\"";
        let auth = parse_authorization(header).unwrap();
        assert_eq!(auth.username, "alice");
        assert_eq!(auth.uri, "/sessions?a=1,2");
        assert_eq!(auth.qop.as_deref(), Some("auth"));
        assert_eq!(auth.nc.as_deref(), Some("00000001"));
    }

    #[test]
    fn test_parse_authorization_rejects_basic() {
        assert!(parse_authorization("Basic YWxpY2U6cHc=").is_err());
    }

    #[test]
    fn test_verify_accepts_valid_response() {
        let nonce = make_nonce(SECRET);
        let response = client_response("alice", "Moloch", "pw", "GET", "/sessions", &nonce);
        let auth = DigestAuthorization {
            username: "alice".to_string(),
            realm: "Moloch".to_string(),
            nonce,
            uri: "/sessions".to_string(),
            response,
            qop: Some("auth".to_string()),
            nc: Some("00000001".to_string()),
            cnonce: Some("abcdef".to_string()),
        };
        let stored = ha1("alice", "Moloch", "pw");
        assert!(verify(&auth, "GET", &stored, SECRET, now_ms()).is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_password() {
        let nonce = make_nonce(SECRET);
        let response = client_response("alice", "Moloch", "wrong", "GET", "/sessions", &nonce);
        let auth = DigestAuthorization {
            username: "alice".to_string(),
            realm: "Moloch".to_string(),
            nonce,
            uri: "/sessions".to_string(),
            response,
            qop: Some("auth".to_string()),
            nc: Some("00000001".to_string()),
            cnonce: Some("abcdef".to_string()),
        };
        let stored = ha1("alice", "Moloch", "pw");
        assert!(verify(&auth, "GET", &stored, SECRET, now_ms()).is_err());
    }

    #[test]
    fn test_verify_rejects_foreign_or_stale_nonce() {
        let stored = ha1("alice", "Moloch", "pw");

        // Nonce minted with a different secret
        let foreign = make_nonce("other");
        let auth = DigestAuthorization {
            username: "alice".to_string(),
            realm: "Moloch".to_string(),
            nonce: foreign.clone(),
            uri: "/".to_string(),
            response: client_response("alice", "Moloch", "pw", "GET", "/", &foreign),
            qop: Some("auth".to_string()),
            nc: Some("00000001".to_string()),
            cnonce: Some("abcdef".to_string()),
        };
        assert!(verify(&auth, "GET", &stored, SECRET, now_ms()).is_err());

        // Our nonce, but long expired
        let nonce = make_nonce(SECRET);
        let auth = DigestAuthorization {
            nonce: nonce.clone(),
            response: client_response("alice", "Moloch", "pw", "GET", "/", &nonce),
            uri: "/".to_string(),
            username: "alice".to_string(),
            realm: "Moloch".to_string(),
            qop: Some("auth".to_string()),
            nc: Some("00000001".to_string()),
            cnonce: Some("abcdef".to_string()),
        };
        let later = now_ms() + NONCE_MAX_AGE_MS + 1_000;
        assert!(verify(&auth, "GET", &stored, SECRET, later).is_err());
    }
}
