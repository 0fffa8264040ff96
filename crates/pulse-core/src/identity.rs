//! Signed visitor identity tokens.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Separator every signed token carries between payload and signature.
pub const TOKEN_SEPARATOR: char = '.';

/// A token must be longer than this (after trimming) to count as signed.
pub const SIGNED_TOKEN_MIN_LEN: usize = 16;

/// Structural check for a backend-issued signed identity.
///
/// Only the shape is checked (separator present, long enough); the signature
/// itself is opaque to the client.
#[must_use]
pub fn is_signed_token(raw: &str) -> bool {
    let trimmed = raw.trim();
    trimmed.contains(TOKEN_SEPARATOR) && trimmed.len() > SIGNED_TOKEN_MIN_LEN
}

/// Short tag for a credential: values longer than 18 characters keep their
/// first 10 and last 6 characters joined by `…`.
#[must_use]
pub fn credential_fingerprint(raw: &str) -> String {
    let trimmed = raw.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= 18 {
        return trimmed.to_string();
    }
    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{head}…{tail}")
}

/// A validated signed identity token.
///
/// `Debug` and `Display` never print the full value.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdentityToken(String);

impl IdentityToken {
    /// Validate and wrap a raw token. Returns `None` when it does not look signed.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if is_signed_token(raw) {
            Some(Self(raw.trim().to_string()))
        } else {
            None
        }
    }

    /// The raw credential, for request headers and stream URLs.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short tag used in cache keys and logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        credential_fingerprint(&self.0)
    }
}

impl TryFrom<String> for IdentityToken {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| "identity token is not signed".to_string())
    }
}

impl From<IdentityToken> for String {
    fn from(token: IdentityToken) -> Self {
        token.0
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdentityToken")
            .field(&self.fingerprint())
            .finish()
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}
