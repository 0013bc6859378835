//! Stable commit identities carried in a `Stack-Commit-ID` trailer.
//!
//! A commit's hash changes every time it is amended or rebased; its identity
//! does not. The identity names the commit's remote branch and therefore its
//! pull request.

use std::fmt;

/// The reserved trailer key.
pub const TRAILER_KEY: &str = "Stack-Commit-ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The message carries the trailer more than once.
    Ambiguous { count: usize },
    /// Two commits of one stack carry the same identity.
    Duplicate {
        identity: String,
        first: String,
        second: String,
    },
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ambiguous { count } => {
                write!(f, "ambiguous identity: {count} {TRAILER_KEY} trailers")
            }
            Self::Duplicate {
                identity,
                first,
                second,
            } => write!(
                f,
                "duplicate identity {identity}: commits {first} and {second} share a {TRAILER_KEY} trailer"
            ),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Extract the identity from a commit message.
///
/// Returns `Ok(None)` when no trailer line carries a value. A blank value is
/// no identity at all.
pub fn resolve(message: &str) -> Result<Option<String>, IdentityError> {
    let values: Vec<&str> = message
        .lines()
        .filter_map(trailer_value)
        .filter(|value| !value.is_empty())
        .collect();
    match values.as_slice() {
        [] => Ok(None),
        [value] => Ok(Some(value.to_string())),
        _ => Err(IdentityError::Ambiguous {
            count: values.len(),
        }),
    }
}

/// The value of `line` if it is an identity trailer line.
pub(crate) fn trailer_value(line: &str) -> Option<&str> {
    line.strip_prefix(TRAILER_KEY)?
        .strip_prefix(':')
        .map(str::trim)
}

/// Deterministic identity for a commit that has none yet.
pub fn fallback_identity(commit_hash: &str) -> String {
    format!("{:x}", md5::compute(commit_hash.as_bytes()))
}

/// The full trailer line for `identity`.
pub fn trailer(identity: &str) -> String {
    format!("{TRAILER_KEY}: {identity}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_trailer_is_empty_identity() {
        let message = "Add feature\n\nSome body text.\nSigned-off-by: Someone <a@b.c>";
        assert_eq!(resolve(message), Ok(None));
        assert_eq!(resolve(""), Ok(None));
    }

    #[test]
    fn test_single_trailer_value() {
        let message = "Add feature\n\nBody.\n\nStack-Commit-ID: 123abc";
        assert_eq!(resolve(message), Ok(Some("123abc".to_string())));

        let message = "Stack-Commit-ID: abc-123\nThis is a sample text.";
        assert_eq!(resolve(message), Ok(Some("abc-123".to_string())));
    }

    #[test]
    fn test_multiple_trailers_are_ambiguous() {
        let message = "Title\n\nStack-Commit-ID: 123abc\nStack-Commit-ID: 456def";
        assert_eq!(resolve(message), Err(IdentityError::Ambiguous { count: 2 }));
    }

    #[test]
    fn test_blank_trailer_is_no_identity() {
        assert_eq!(resolve("Title\n\nStack-Commit-ID:   "), Ok(None));
        assert_eq!(resolve("Title\n\nStack-Commit-ID:"), Ok(None));
        // A blank line next to a real one does not make it ambiguous.
        let message = "Title\n\nStack-Commit-ID:\nStack-Commit-ID: abc";
        assert_eq!(resolve(message), Ok(Some("abc".to_string())));
    }

    #[test]
    fn test_similar_keys_do_not_match() {
        let message = "Title\n\nStack-Commit-IDs: nope\nX-Stack-Commit-ID: nope";
        assert_eq!(resolve(message), Ok(None));
    }

    #[test]
    fn test_fallback_identity_is_fixed_length_hex() {
        let a = fallback_identity("8c7a65312345");
        assert_eq!(a, fallback_identity("8c7a65312345"));
        assert_ne!(a, fallback_identity("c053af6"));
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_trailer_round_trips_through_resolve() {
        let id = fallback_identity("deadbeef");
        let message = format!("Title\n\n{}", trailer(&id));
        assert_eq!(resolve(&message), Ok(Some(id)));
    }
}
