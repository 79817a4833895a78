//! Session naming.
//!
//! A session name is `{prefix}-{session_id}` where `prefix` is the first
//! [`PREFIX_LEN`] hex characters of SHA-256(credential). The raw credential
//! never appears in a name, and `session_id` is restricted to
//! `[A-Za-z0-9_-]{1,32}` so it is safe to interpolate into host commands.

use ring::digest::{digest, SHA256};
use std::fmt;
use thiserror::Error;

/// Number of hex characters kept from the credential digest.
pub const PREFIX_LEN: usize = 16;

/// Longest accepted caller-chosen session id.
pub const MAX_SESSION_ID_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamingError {
    #[error("invalid session id (expected 1-32 characters of [A-Za-z0-9_-])")]
    InvalidSessionId,
}

/// Derive the namespace prefix for a credential.
pub fn credential_to_prefix(credential: &str) -> String {
    let hash = digest(&SHA256, credential.as_bytes());
    let mut prefix = String::with_capacity(PREFIX_LEN);
    for byte in &hash.as_ref()[..PREFIX_LEN / 2] {
        prefix.push_str(&format!("{byte:02x}"));
    }
    prefix
}

/// Allow-list check for caller-supplied session ids.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Compose the session name for `credential` and an optional session id.
///
/// Without a session id the bare prefix is returned, which is the name
/// used by clients that predate per-session ids.
pub fn build_session_name(
    credential: &str,
    session_id: Option<&str>,
) -> Result<SessionName, NamingError> {
    let prefix = credential_to_prefix(credential);
    match session_id {
        None => Ok(SessionName(prefix)),
        Some(id) if is_valid_session_id(id) => Ok(SessionName(format!("{prefix}-{id}"))),
        Some(_) => Err(NamingError::InvalidSessionId),
    }
}

/// A validated multiplexer session name.
///
/// Only constructible through [`build_session_name`] or [`SessionName::parse`],
/// so every value is safe to pass to the host as a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionName(String);

impl SessionName {
    /// Accept a name read back from the host if it has the shape this
    /// module produces; foreign sessions yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() < PREFIX_LEN || !raw.is_char_boundary(PREFIX_LEN) {
            return None;
        }
        let (prefix, rest) = raw.split_at(PREFIX_LEN);
        if !prefix
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }
        if rest.is_empty() {
            return Some(Self(raw.to_string()));
        }
        match rest.strip_prefix('-') {
            Some(id) if is_valid_session_id(id) => Some(Self(raw.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The credential-derived namespace part.
    pub fn prefix(&self) -> &str {
        &self.0[..PREFIX_LEN]
    }

    /// The caller-chosen part, `None` for a bare-prefix name.
    pub fn session_id(&self) -> Option<&str> {
        self.0.get(PREFIX_LEN + 1..)
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_is_deterministic_and_fixed_length() {
        let a = credential_to_prefix("tok1");
        let b = credential_to_prefix("tok1");
        assert_eq!(a, b);
        assert_eq!(a.len(), PREFIX_LEN);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn prefix_never_embeds_credential() {
        let credential = "super-secret-credential";
        let name = build_session_name(credential, Some("main")).unwrap();
        assert!(!name.as_str().contains(credential));
    }

    #[test]
    fn different_credentials_different_prefixes() {
        let a = build_session_name("tok1", Some("t1")).unwrap();
        let b = build_session_name("tok2", Some("t1")).unwrap();
        assert_ne!(a.prefix(), b.prefix());
        assert_eq!(a.session_id(), b.session_id());
    }

    #[test]
    fn same_inputs_same_name() {
        let a = build_session_name("tok1", Some("t1")).unwrap();
        let b = build_session_name("tok1", Some("t1")).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), format!("{}-t1", credential_to_prefix("tok1")));
    }

    #[test]
    fn omitted_session_id_is_bare_prefix() {
        let name = build_session_name("tok1", None).unwrap();
        assert_eq!(name.as_str(), credential_to_prefix("tok1"));
        assert_eq!(name.session_id(), None);
    }

    #[test]
    fn rejects_malformed_ids() {
        let too_long = "a".repeat(MAX_SESSION_ID_LEN + 1);
        for bad in [
            "",
            too_long.as_str(),
            "a/b",
            "..",
            "../etc",
            "a b",
            "tab\t",
            "new\nline",
            "x;rm",
            "$(id)",
            "`id`",
            "a|b",
            "a&b",
            "a:b",
            "a.b",
            "é",
        ] {
            assert!(!is_valid_session_id(bad), "accepted {bad:?}");
            assert_eq!(
                build_session_name("tok", Some(bad)),
                Err(NamingError::InvalidSessionId)
            );
        }
    }

    #[test]
    fn accepts_well_formed_ids() {
        let max = "Z9".repeat(MAX_SESSION_ID_LEN / 2);
        for good in ["a", "abc-123_X", max.as_str()] {
            assert!(is_valid_session_id(good), "rejected {good:?}");
        }
    }

    #[test]
    fn parse_round_trips_built_names() {
        let built = build_session_name("tok1", Some("abc-123_X")).unwrap();
        assert_eq!(SessionName::parse(built.as_str()), Some(built.clone()));
        let bare = build_session_name("tok1", None).unwrap();
        assert_eq!(SessionName::parse(bare.as_str()), Some(bare));
    }

    #[test]
    fn parse_rejects_foreign_sessions() {
        for raw in ["0", "main", "work-1", "ABCDEF0123456789-x", "0123456789abcdef_x"] {
            assert_eq!(SessionName::parse(raw), None, "accepted {raw:?}");
        }
        assert_eq!(SessionName::parse("0123456789abcdef-a/b"), None);
    }
}
