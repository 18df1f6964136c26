use serde::{Deserialize, Serialize};

use crate::identity::{ConnectionRef, LocalGroupId};

/// On-disk form of the identity mapping: one record per local group with
/// its remote links nested underneath.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PersistedMapping {
    /// RFC 3339 timestamp of the last save
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<String>,

    #[serde(default)]
    pub local_groups: Vec<PersistedGroup>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PersistedGroup {
    pub id: LocalGroupId,

    #[serde(default)]
    pub remote_links: Vec<PersistedLink>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PersistedLink {
    pub connection: ConnectionRef,
    pub number: i64,
}
