//! Access token decoding and claim normalization.
//!
//! Tokens issued by the backend come in more than one shape: some carry
//! `role`/`permissions` at the top level, older ones nest them under `data`.
//! [`normalize_claims`] folds every shape into a single [`AccessClaims`] so
//! the rest of the gate never looks at raw JSON.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Serialize;
use serde_json::Value;

use super::permissions::{PermissionSet, Role};
use crate::error::TokenError;

const DEFAULT_LEEWAY_SECS: u64 = 30;

/// Claims extracted from a decoded access token. Built per request and
/// dropped once the routing decision is made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessClaims {
    pub subject_id: Option<String>,
    pub role: Role,
    pub permissions: PermissionSet,
    pub email: Option<String>,
    pub expires_at: Option<i64>,
}

impl AccessClaims {
    pub fn new(role: Role) -> Self {
        Self {
            subject_id: None,
            role,
            permissions: PermissionSet::new(),
            email: None,
            expires_at: None,
        }
    }

    pub fn with_permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// First non-empty string found under `keys`, checked at the top level and
/// then under the nested `data` object.
fn claim_lookup(
    claims: &Value,
    keys: &[&str],
    read: fn(&Value, &[&str]) -> Option<String>,
) -> Option<String> {
    let nested = claims.get("data");
    std::iter::once(claims)
        .chain(nested)
        .find_map(|scope| read(scope, keys))
}

fn claim_str(claims: &Value, keys: &[&str]) -> Option<String> {
    claim_lookup(claims, keys, crate::value_str)
}

/// Subject ids may be issued as numbers.
fn claim_id(claims: &Value, keys: &[&str]) -> Option<String> {
    claim_lookup(claims, keys, crate::value_id)
}

fn claim_permissions(claims: &Value) -> PermissionSet {
    let list = claims
        .get("permissions")
        .and_then(Value::as_array)
        .or_else(|| {
            claims
                .get("data")
                .and_then(|d| d.get("permissions"))
                .and_then(Value::as_array)
        });
    match list {
        Some(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect(),
        None => PermissionSet::new(),
    }
}

/// Normalize a decoded claim object into [`AccessClaims`].
///
/// The role must be present (top-level `role` or `data.role`) and be one of
/// the known roles; anything else is [`TokenError::MissingRole`].
pub fn normalize_claims(claims: &Value) -> Result<AccessClaims, TokenError> {
    let role = claim_str(claims, &["role"])
        .as_deref()
        .and_then(Role::parse)
        .ok_or(TokenError::MissingRole)?;

    Ok(AccessClaims {
        subject_id: claim_id(claims, &["sub", "id", "userId"]),
        role,
        permissions: claim_permissions(claims),
        email: claim_str(claims, &["email"]),
        expires_at: claims.get("exp").and_then(Value::as_i64),
    })
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum DecoderMode {
    Hs256(DecodingKey),
    Unverified,
}

/// Decodes raw bearer tokens into [`AccessClaims`].
///
/// Both modes enforce `exp`; only `hs256` checks the signature.
#[derive(Clone)]
pub struct TokenDecoder {
    mode: DecoderMode,
    leeway: u64,
}

impl TokenDecoder {
    /// Verify HS256 signatures with a shared secret.
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            mode: DecoderMode::Hs256(DecodingKey::from_secret(secret)),
            leeway: DEFAULT_LEEWAY_SECS,
        }
    }

    /// Read claims without verifying the signature. The backend owns token
    /// signing; this mode only gates navigation.
    pub fn unverified() -> Self {
        Self {
            mode: DecoderMode::Unverified,
            leeway: DEFAULT_LEEWAY_SECS,
        }
    }

    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway = leeway_secs;
        self
    }

    pub fn verifies_signature(&self) -> bool {
        matches!(self.mode, DecoderMode::Hs256(_))
    }

    /// Decode and validate `token`, returning the raw claim object.
    pub fn decode_raw(&self, token: &str) -> Result<Value, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Empty);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.leeway;
        validation.validate_aud = false;

        let data = match &self.mode {
            DecoderMode::Hs256(key) => jsonwebtoken::decode::<Value>(token, key, &validation)?,
            DecoderMode::Unverified => {
                validation.insecure_disable_signature_validation();
                jsonwebtoken::decode::<Value>(token, &DecodingKey::from_secret(&[]), &validation)?
            }
        };
        Ok(data.claims)
    }

    pub fn decode(&self, token: &str) -> Result<AccessClaims, TokenError> {
        let raw = self.decode_raw(token)?;
        normalize_claims(&raw)
    }
}

impl std::fmt::Debug for TokenDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenDecoder")
            .field("verifies_signature", &self.verifies_signature())
            .field("leeway", &self.leeway)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use jsonwebtoken::{EncodingKey, Header};
    use serde_json::Value;

    pub const SECRET: &[u8] = b"test-secret";

    pub fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Sign `claims` with HS256, adding a one-hour `exp` when absent.
    pub fn mint(mut claims: Value) -> String {
        if claims.get("exp").is_none() {
            claims["exp"] = serde_json::json!(now() + 3600);
        }
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .expect("encode test token")
    }
}
