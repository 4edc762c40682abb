//! # Remote Paths
//!
//! Path construction for the remote tree.
//!
//! ## Layout
//! ```text
//! users/
//! └── {userId}/
//!     ├── gameState                 ← singleton blob
//!     ├── dailyData/
//!     │   ├── 2024-06-01            ← keyed blob
//!     │   └── 2024-06-02
//!     └── templates/
//!         ├── tpl-1                 ← item-synced row
//!         └── tpl-2
//! ```
//!
//! Every segment is validated so that `pathFor` stays collision-free: a key
//! containing `/` would otherwise address a different node.

use crate::error::{CoreResult, ValidationError};

/// Root node under which every user's data lives.
pub const USERS_ROOT: &str = "users";

/// User id used when no user resolver is configured.
pub const DEFAULT_USER_ID: &str = "user";

/// Characters the remote tree does not accept inside a segment.
const FORBIDDEN_CHARS: [char; 6] = ['.', '#', '$', '[', ']', '/'];

/// Longest accepted segment, in bytes.
const MAX_SEGMENT_LEN: usize = 768;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validates a single path segment.
///
/// ## Rules
/// - Must not be empty
/// - Must be at most 768 bytes
/// - Must not contain `.`, `#`, `$`, `[`, `]` or `/`
///
/// ## Example
/// ```rust
/// use dayflow_core::paths::validate_segment;
///
/// assert!(validate_segment("key", "2024-06-01").is_ok());
/// assert!(validate_segment("key", "a/b").is_err());
/// assert!(validate_segment("key", "").is_err());
/// ```
pub fn validate_segment(field: &str, segment: &str) -> ValidationResult<()> {
    if segment.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if segment.len() > MAX_SEGMENT_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_SEGMENT_LEN,
        });
    }

    if let Some(c) = segment.chars().find(|c| FORBIDDEN_CHARS.contains(c)) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("contains forbidden character '{}'", c),
        });
    }

    Ok(())
}

/// Builds `users/{userId}/{collection}[/{key}]`.
///
/// ## Example
/// ```rust
/// use dayflow_core::paths::remote_path;
///
/// let path = remote_path("u1", "dailyData", Some("2024-06-01")).unwrap();
/// assert_eq!(path, "users/u1/dailyData/2024-06-01");
///
/// let path = remote_path("u1", "gameState", None).unwrap();
/// assert_eq!(path, "users/u1/gameState");
/// ```
pub fn remote_path(user_id: &str, collection: &str, key: Option<&str>) -> CoreResult<String> {
    validate_segment("userId", user_id)?;
    validate_segment("collection", collection)?;

    let mut path = format!("{}/{}/{}", USERS_ROOT, user_id, collection);
    if let Some(key) = key {
        validate_segment("key", key)?;
        path.push('/');
        path.push_str(key);
    }
    Ok(path)
}

/// Appends one validated segment to an existing path.
pub fn child_path(base: &str, child: &str) -> CoreResult<String> {
    validate_segment("child", child)?;
    Ok(format!("{}/{}", base.trim_end_matches('/'), child))
}

/// Returns the last segment of a path.
pub fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Identity of a key-range query on a path.
///
/// Different start keys on the same base path are distinct listeners.
pub fn key_range_identity(path: &str, start_at: &str) -> String {
    format!("{}?orderByKey&startAt={}", path, start_at)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[test]
    fn test_remote_path_with_and_without_key() {
        assert_eq!(
            remote_path("user", "templates", Some("tpl-1")).unwrap(),
            "users/user/templates/tpl-1"
        );
        assert_eq!(
            remote_path("user", "settings", None).unwrap(),
            "users/user/settings"
        );
    }

    #[test]
    fn test_remote_path_rejects_colliding_keys() {
        // "a/b" would alias the child "b" of key "a"
        let err = remote_path("user", "dailyData", Some("a/b")).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));

        assert!(remote_path("", "dailyData", None).is_err());
        assert!(remote_path("user", "daily.data", None).is_err());
    }

    #[test]
    fn test_validate_segment_length() {
        let long = "k".repeat(MAX_SEGMENT_LEN + 1);
        assert!(matches!(
            validate_segment("key", &long),
            Err(ValidationError::TooLong { .. })
        ));
        assert!(validate_segment("key", &long[1..]).is_ok());
    }

    #[test]
    fn test_child_path() {
        assert_eq!(
            child_path("users/u/templates", "tpl-9").unwrap(),
            "users/u/templates/tpl-9"
        );
        assert_eq!(
            child_path("users/u/templates/", "tpl-9").unwrap(),
            "users/u/templates/tpl-9"
        );
        assert!(child_path("users/u/templates", "x#y").is_err());
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("users/u/dailyData/2024-06-01"), "2024-06-01");
        assert_eq!(last_segment("root"), "root");
    }

    #[test]
    fn test_key_range_identity_is_distinct_per_start_key() {
        let a = key_range_identity("users/u/dailyData", "2024-06-01");
        let b = key_range_identity("users/u/dailyData", "2024-06-02");
        assert_ne!(a, b);
        assert_eq!(a, "users/u/dailyData?orderByKey&startAt=2024-06-01");
    }
}
