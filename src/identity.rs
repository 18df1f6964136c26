//! Changelist identities on both sides of the mapping.
//!
//! A remote changelist is identified by the connection it lives on plus its
//! number. The number alone carries the classification:
//!
//! - `0` is the connection's default changelist,
//! - positive numbers are real pending changelists on the server,
//! - negative numbers are local-only placeholders that have not been created
//!   on the server yet.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of characters kept as the name of a single-line description.
pub const MAX_SINGLE_LINE_NAME: usize = 20;

/// Opaque identifier of a (server configuration, workspace) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionRef(String);

impl ConnectionRef {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionRef(id.into())
    }

    /// Build the reference for a server configuration and client workspace.
    pub fn for_client(server_id: &str, client: &str) -> Self {
        ConnectionRef(format!("{}|{}", server_id, client))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionRef {
    fn from(s: &str) -> Self {
        ConnectionRef::new(s)
    }
}

/// Classification of a remote changelist number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangelistKind {
    Default,
    Pending,
    LocalOnly,
}

/// Identity of a changelist on one connection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RemoteChangelistId {
    pub connection: ConnectionRef,
    pub number: i64,
}

impl RemoteChangelistId {
    pub fn new(connection: ConnectionRef, number: i64) -> Self {
        Self { connection, number }
    }

    /// The always-present default changelist of a connection.
    pub fn default_for(connection: &ConnectionRef) -> Self {
        Self {
            connection: connection.clone(),
            number: 0,
        }
    }

    pub fn kind(&self) -> ChangelistKind {
        match self.number {
            0 => ChangelistKind::Default,
            n if n > 0 => ChangelistKind::Pending,
            _ => ChangelistKind::LocalOnly,
        }
    }

    pub fn is_default(&self) -> bool {
        self.kind() == ChangelistKind::Default
    }

    pub fn is_pending(&self) -> bool {
        self.kind() == ChangelistKind::Pending
    }

    pub fn is_local_only(&self) -> bool {
        self.kind() == ChangelistKind::LocalOnly
    }
}

impl fmt::Display for RemoteChangelistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.connection, self.number)
    }
}

/// A remote changelist as reported by the server during one refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChangelistSnapshot {
    pub id: RemoteChangelistId,
    pub description: String,
}

impl RemoteChangelistSnapshot {
    pub fn new(id: RemoteChangelistId, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
        }
    }

    /// Name and comment a local group should carry for this changelist.
    pub fn parts(&self, default_name: &str) -> DescriptionParts {
        if self.id.is_default() {
            return DescriptionParts {
                name: default_name.to_string(),
                comment: String::new(),
            };
        }
        DescriptionParts::split(&self.description)
    }
}

/// A changelist description split into a display name and a comment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DescriptionParts {
    pub name: String,
    pub comment: String,
}

impl DescriptionParts {
    pub fn split(description: &str) -> Self {
        if let Some((first, rest)) = description.split_once('\n') {
            return Self {
                name: first.trim().to_string(),
                comment: rest.trim().to_string(),
            };
        }
        if description.chars().count() > MAX_SINGLE_LINE_NAME {
            let name: String = description.chars().take(MAX_SINGLE_LINE_NAME).collect();
            return Self {
                name: name.trim().to_string(),
                comment: description.trim().to_string(),
            };
        }
        Self {
            name: description.trim().to_string(),
            comment: String::new(),
        }
    }
}

/// Identifier of a local changelist record owned by the editing surface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalGroupId(String);

impl LocalGroupId {
    pub fn new(id: impl Into<String>) -> Self {
        LocalGroupId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocalGroupId {
    fn from(s: &str) -> Self {
        LocalGroupId::new(s)
    }
}

/// A local group as the editing surface currently reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalGroup {
    pub id: LocalGroupId,
    pub name: String,
    pub comment: String,
}

impl LocalGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            id: LocalGroupId::new(id),
            name: name.into(),
            comment: comment.into(),
        }
    }

    pub fn is_default(&self, default_name: &str) -> bool {
        self.name == default_name
    }

    /// Description to send to the server for this group.
    pub fn description(&self) -> String {
        let mut description = String::new();
        if !self.name.is_empty() {
            description.push_str(&self.name);
            if !self.comment.is_empty() {
                description.push('\n');
            }
        }
        description.push_str(&self.comment);
        description
    }
}
