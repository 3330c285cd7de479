//! Access control levels, scopes and rows.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Access level granted by an ACL row.
///
/// Levels are ordered: `Owner` implies `Editor`, which implies `Reader`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Read dataset contents.
    Reader,
    /// Trigger syncs and manage dataset versions.
    Editor,
    /// Full control, including event ledger operations.
    Owner,
}

impl AccessLevel {
    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reader" => Ok(Self::Reader),
            "editor" => Ok(Self::Editor),
            "owner" => Ok(Self::Owner),
            other => Err(crate::Error::InvalidAccessLevel(other.to_string())),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reader => "reader",
            Self::Editor => "editor",
            Self::Owner => "owner",
        }
    }

    /// Check if this level implies another level.
    pub fn implies(&self, other: &Self) -> bool {
        self >= other
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resource scope an ACL row applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclScope {
    /// The whole server; the resource is the server id.
    Server,
    /// A single dataset; the resource is the dataset slug.
    Dataset,
}

impl AclScope {
    /// Parse from string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "dataset" => Ok(Self::Dataset),
            other => Err(crate::Error::InvalidScope(other.to_string())),
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Dataset => "dataset",
        }
    }
}

impl fmt::Display for AclScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single grant as stored in the user or permalink ACL table.
///
/// For the user table `principal` is the authenticated user id; for the
/// permalink table it is the SHA-256 hex digest of the share token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlRow {
    #[serde(alias = "user_uuid", alias = "token_hash")]
    pub principal: String,
    #[serde(default = "default_scope")]
    pub scope: AclScope,
    pub resource: String,
    #[serde(default = "default_level")]
    pub level: AccessLevel,
}

fn default_scope() -> AclScope {
    AclScope::Dataset
}

fn default_level() -> AccessLevel {
    AccessLevel::Reader
}

impl AccessControlRow {
    /// Create a dataset-scoped grant.
    pub fn dataset(principal: &str, slug: &str, level: AccessLevel) -> Self {
        Self {
            principal: principal.to_string(),
            scope: AclScope::Dataset,
            resource: slug.to_string(),
            level,
        }
    }

    /// Create a server-scoped grant.
    pub fn server(principal: &str, server_id: &str, level: AccessLevel) -> Self {
        Self {
            principal: principal.to_string(),
            scope: AclScope::Server,
            resource: server_id.to_string(),
            level,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_implies() {
        assert!(AccessLevel::Owner.implies(&AccessLevel::Reader));
        assert!(AccessLevel::Owner.implies(&AccessLevel::Editor));
        assert!(AccessLevel::Owner.implies(&AccessLevel::Owner));

        assert!(AccessLevel::Editor.implies(&AccessLevel::Reader));
        assert!(AccessLevel::Editor.implies(&AccessLevel::Editor));
        assert!(!AccessLevel::Editor.implies(&AccessLevel::Owner));

        assert!(AccessLevel::Reader.implies(&AccessLevel::Reader));
        assert!(!AccessLevel::Reader.implies(&AccessLevel::Editor));
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(AccessLevel::parse("reader").unwrap(), AccessLevel::Reader);
        assert_eq!(AccessLevel::parse(" Editor ").unwrap(), AccessLevel::Editor);
        assert_eq!(AccessLevel::parse("OWNER").unwrap(), AccessLevel::Owner);
        assert!(AccessLevel::parse("admin").is_err());
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(AclScope::parse("server").unwrap(), AclScope::Server);
        assert_eq!(AclScope::parse("dataset").unwrap(), AclScope::Dataset);
        assert!(AclScope::parse("branch").is_err());
    }

    #[test]
    fn test_row_deserialize_supabase_columns() {
        let json = r#"{"user_uuid": "u-1", "resource": "fasttrack"}"#;
        let row: AccessControlRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.principal, "u-1");
        assert_eq!(row.scope, AclScope::Dataset);
        assert_eq!(row.level, AccessLevel::Reader);

        let json = r#"{"token_hash": "abc", "scope": "server", "resource": "small-waffle", "level": "owner"}"#;
        let row: AccessControlRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.principal, "abc");
        assert_eq!(row.scope, AclScope::Server);
        assert_eq!(row.level, AccessLevel::Owner);
    }
}
