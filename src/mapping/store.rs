use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use super::{MappingBackend, PersistedGroup, PersistedLink, PersistedMapping};
use crate::{
    error::{Error, Result},
    identity::{ConnectionRef, LocalGroup, LocalGroupId, RemoteChangelistId},
};

/// Both directions of the local group <-> remote changelist mapping.
///
/// The two tables only ever change together, through the methods below, so
/// every entry in one has its mirror in the other. Default changelists are
/// never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTables {
    /// local group -> (connection -> remote changelist)
    local_to_remote: BTreeMap<LocalGroupId, BTreeMap<ConnectionRef, RemoteChangelistId>>,

    /// remote changelist -> local group
    remote_to_local: BTreeMap<RemoteChangelistId, LocalGroupId>,
}

/// Links that had to be dropped to make room for a new one.
#[derive(Debug, Default)]
struct Displaced {
    /// The remote the local group used to have on the same connection
    previous_remote: Option<RemoteChangelistId>,
    /// The local group that used to own the remote
    previous_owner: Option<LocalGroupId>,
}

impl MappingTables {
    pub fn remote_for(
        &self,
        local: &LocalGroupId,
        connection: &ConnectionRef,
    ) -> Option<&RemoteChangelistId> {
        self.local_to_remote
            .get(local)
            .and_then(|per_connection| per_connection.get(connection))
    }

    pub fn local_for(&self, remote: &RemoteChangelistId) -> Option<&LocalGroupId> {
        self.remote_to_local.get(remote)
    }

    /// All links, ordered by remote changelist.
    pub fn links(&self) -> impl Iterator<Item = (&RemoteChangelistId, &LocalGroupId)> {
        self.remote_to_local.iter()
    }

    pub fn len(&self) -> usize {
        self.remote_to_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remote_to_local.is_empty()
    }

    /// Describe every way the two tables disagree. Empty when consistent.
    pub fn violations(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (local, per_connection) in &self.local_to_remote {
            if per_connection.is_empty() {
                problems.push(format!("local group {} has an empty link table", local));
            }
            for (connection, remote) in per_connection {
                if &remote.connection != connection {
                    problems.push(format!(
                        "local group {} lists {} under connection {}",
                        local, remote, connection
                    ));
                }
                if remote.is_default() {
                    problems.push(format!("local group {} stores default {}", local, remote));
                }
                match self.remote_to_local.get(remote) {
                    Some(owner) if owner == local => {}
                    Some(owner) => problems.push(format!(
                        "{} is linked from {} but owned by {}",
                        remote, local, owner
                    )),
                    None => problems.push(format!(
                        "{} is linked from {} but has no reverse entry",
                        remote, local
                    )),
                }
            }
        }

        for (remote, local) in &self.remote_to_local {
            if self.remote_for(local, &remote.connection) != Some(remote) {
                problems.push(format!(
                    "{} points at {} which does not link back",
                    remote, local
                ));
            }
        }

        problems
    }

    fn link(&mut self, local: &LocalGroupId, remote: &RemoteChangelistId) -> Displaced {
        let mut displaced = Displaced::default();

        if let Some(previous) = self.remote_for(local, &remote.connection).cloned() {
            if &previous != remote {
                self.unlink_remote(&previous);
                displaced.previous_remote = Some(previous);
            }
        }
        if let Some(owner) = self.remote_to_local.get(remote).cloned() {
            if &owner != local {
                self.unlink_remote(remote);
                displaced.previous_owner = Some(owner);
            }
        }

        self.local_to_remote
            .entry(local.clone())
            .or_default()
            .insert(remote.connection.clone(), remote.clone());
        self.remote_to_local.insert(remote.clone(), local.clone());

        displaced
    }

    fn unlink_remote(&mut self, remote: &RemoteChangelistId) -> Option<LocalGroupId> {
        let owner = self.remote_to_local.remove(remote)?;
        if let Some(per_connection) = self.local_to_remote.get_mut(&owner) {
            if per_connection.get(&remote.connection) == Some(remote) {
                per_connection.remove(&remote.connection);
            }
            if per_connection.is_empty() {
                self.local_to_remote.remove(&owner);
            }
        }
        Some(owner)
    }

    fn detach_local(&mut self, local: &LocalGroupId) -> BTreeMap<ConnectionRef, RemoteChangelistId> {
        let detached = self.local_to_remote.remove(local).unwrap_or_default();
        for remote in detached.values() {
            self.remote_to_local.remove(remote);
        }
        detached
    }

    fn to_persisted(&self) -> PersistedMapping {
        let local_groups = self
            .local_to_remote
            .iter()
            .map(|(local, per_connection)| PersistedGroup {
                id: local.clone(),
                remote_links: per_connection
                    .values()
                    .filter(|remote| !remote.is_default())
                    .map(|remote| PersistedLink {
                        connection: remote.connection.clone(),
                        number: remote.number,
                    })
                    .collect(),
            })
            .collect();

        PersistedMapping {
            saved_at: Some(chrono::Utc::now().to_rfc3339()),
            local_groups,
        }
    }

    fn from_persisted(persisted: &PersistedMapping) -> Self {
        let mut tables = MappingTables::default();
        for group in &persisted.local_groups {
            for link in &group.remote_links {
                let remote = RemoteChangelistId::new(link.connection.clone(), link.number);
                if remote.is_default() {
                    tracing::warn!(
                        "Ignoring persisted default changelist link for local group {}",
                        group.id
                    );
                    continue;
                }
                let displaced = tables.link(&group.id, &remote);
                if displaced.previous_remote.is_some() || displaced.previous_owner.is_some() {
                    tracing::warn!(
                        "Duplicate persisted link {} for local group {}; keeping the last one",
                        remote,
                        group.id
                    );
                }
            }
        }
        tables
    }
}

/// Process-wide, thread-safe owner of the identity mapping.
///
/// One coarse lock covers both tables, so a reader never sees one table
/// updated without the other.
pub struct MappingStore {
    default_name: String,
    tables: Mutex<MappingTables>,
}

impl MappingStore {
    /// Create an empty store. `default_name` is the name of the local group
    /// that stands for every connection's default changelist.
    pub fn new(default_name: impl Into<String>) -> Self {
        Self::with_tables(default_name, MappingTables::default())
    }

    fn with_tables(default_name: impl Into<String>, tables: MappingTables) -> Self {
        Self {
            default_name: default_name.into(),
            tables: Mutex::new(tables),
        }
    }

    /// Build a store from whatever the backend has persisted.
    pub fn load_from<B: MappingBackend + ?Sized>(
        backend: &B,
        default_name: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let persisted = backend.read_mapping()?;
        let tables = MappingTables::from_persisted(&persisted);
        tracing::debug!("Loaded {} changelist link(s)", tables.len());
        Ok(Self::with_tables(default_name, tables))
    }

    /// Flush the current tables to the backend.
    pub fn save_to<B: MappingBackend + ?Sized>(&self, backend: &B) -> anyhow::Result<()> {
        let persisted = self.tables().to_persisted();
        backend.write_mapping(&persisted)
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Consistent copy of both tables.
    pub fn snapshot(&self) -> MappingTables {
        self.tables().clone()
    }

    pub fn check_invariants(&self) -> Vec<String> {
        self.tables().violations()
    }

    /// Local group for a remote changelist. The default changelist resolves
    /// to whichever of `known` carries the default name.
    pub fn get_local_for(
        &self,
        remote: &RemoteChangelistId,
        known: &[LocalGroup],
    ) -> Option<LocalGroupId> {
        if remote.is_default() {
            return known
                .iter()
                .find(|group| group.is_default(&self.default_name))
                .map(|group| group.id.clone());
        }
        self.tables().local_for(remote).cloned()
    }

    /// Remote changelist for a local group on one connection. The default
    /// group falls back to the connection's default changelist.
    pub fn get_remote_for(
        &self,
        local: &LocalGroup,
        connection: &ConnectionRef,
    ) -> Option<RemoteChangelistId> {
        if let Some(remote) = self.tables().remote_for(&local.id, connection) {
            return Some(remote.clone());
        }
        if local.is_default(&self.default_name) {
            return Some(RemoteChangelistId::default_for(connection));
        }
        None
    }

    pub fn get_all_remotes_for(&self, local: &LocalGroupId) -> BTreeSet<RemoteChangelistId> {
        self.tables()
            .local_to_remote
            .get(local)
            .map(|per_connection| per_connection.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_remote(&self, local: &LocalGroupId) -> bool {
        self.tables().local_to_remote.contains_key(local)
    }

    /// Link a local group to a remote changelist.
    ///
    /// Existing links on either side are overwritten with a warning. Binding
    /// the default group to a non-default changelist (or the reverse) is
    /// rejected without touching the tables.
    pub fn bind(&self, local: &LocalGroup, remote: &RemoteChangelistId) -> Result<()> {
        let local_is_default = local.is_default(&self.default_name);
        if local_is_default && remote.is_default() {
            // implicit mapping, nothing to store
            return Ok(());
        }
        if local_is_default || remote.is_default() {
            tracing::error!(
                "Attempted to bind a default changelist to a non-default changelist: {} ({}) to {}",
                local.name,
                local.id,
                remote
            );
            return Err(Error::InvalidOperation(format!(
                "cannot bind local group {} to {}: default may only map to default",
                local.id, remote
            )));
        }

        let mut tables = self.tables();
        if tables.local_for(remote) == Some(&local.id) {
            tracing::debug!("Local group {} already bound to {}", local.id, remote);
            return Ok(());
        }

        let displaced = tables.link(&local.id, remote);
        if let Some(previous) = displaced.previous_remote {
            tracing::warn!(
                "Already have mapping for local group {} to {}; overwriting with {}",
                local.id,
                previous,
                remote
            );
        }
        if let Some(owner) = displaced.previous_owner {
            tracing::warn!(
                "Already have mapping for {} to local group {}; overwriting with {}",
                remote,
                owner,
                local.id
            );
        }
        tracing::info!("Mapped local group {} to {}", local.id, remote);
        Ok(())
    }

    /// Move a link from a local-only placeholder to the number the server
    /// assigned when the changelist was finally created.
    pub fn replace(
        &self,
        old_remote: &RemoteChangelistId,
        new_remote: &RemoteChangelistId,
    ) -> Result<()> {
        if old_remote.connection != new_remote.connection {
            return Err(Error::InvalidOperation(format!(
                "connection must match: was {}, now {}",
                old_remote.connection, new_remote.connection
            )));
        }
        if old_remote.number == new_remote.number {
            return Ok(());
        }
        if !old_remote.is_local_only() {
            return Err(Error::InvalidOperation(format!(
                "can only replace a local-only changelist, not {}",
                old_remote
            )));
        }
        if new_remote.is_default() {
            return Err(Error::InvalidOperation(format!(
                "cannot replace {} with the default changelist",
                old_remote
            )));
        }

        let mut tables = self.tables();
        let Some(owner) = tables.local_for(old_remote).cloned() else {
            tracing::debug!("No local group bound to {}; nothing to replace", old_remote);
            return Ok(());
        };
        if let Some(existing) = tables.local_for(new_remote) {
            if existing != &owner {
                return Err(Error::MappingConflict(format!(
                    "{} is already mapped to local group {}",
                    new_remote, existing
                )));
            }
        }

        tables.unlink_remote(old_remote);
        tables.link(&owner, new_remote);
        tracing::info!(
            "Replaced {} with {} for local group {}",
            old_remote,
            new_remote,
            owner
        );
        Ok(())
    }

    /// Detach every link of a group that has just been renamed to the default
    /// name, returning them so the caller can move their files.
    pub fn rebind_as_default(
        &self,
        local: &LocalGroup,
    ) -> Result<BTreeMap<ConnectionRef, RemoteChangelistId>> {
        if !local.is_default(&self.default_name) {
            return Err(Error::InvalidOperation(format!(
                "local group {} must be renamed to '{}' before rebinding as default",
                local.id, self.default_name
            )));
        }
        let detached = self.tables().detach_local(&local.id);
        tracing::info!("Mapped local group {} to the default changelist", local.id);
        Ok(detached)
    }

    /// Drop links on `connection` whose remote changelist is no longer live.
    /// Returns the links that were removed.
    pub fn cleanup(
        &self,
        connection: &ConnectionRef,
        live: &BTreeSet<RemoteChangelistId>,
    ) -> Vec<(LocalGroupId, RemoteChangelistId)> {
        let mut tables = self.tables();
        let stale: Vec<RemoteChangelistId> = tables
            .remote_to_local
            .keys()
            .filter(|remote| &remote.connection == connection && !live.contains(*remote))
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for remote in stale {
            if let Some(owner) = tables.unlink_remote(&remote) {
                tracing::debug!("Removed stale link {} from local group {}", remote, owner);
                removed.push((owner, remote));
            }
        }
        removed
    }

    /// Forget every link of a local group.
    pub fn forget_local(&self, local: &LocalGroupId) -> BTreeMap<ConnectionRef, RemoteChangelistId> {
        self.tables().detach_local(local)
    }

    /// Forget the link of a single remote changelist.
    pub fn unbind(&self, remote: &RemoteChangelistId) -> Option<LocalGroupId> {
        self.tables().unlink_remote(remote)
    }

    fn tables(&self) -> MutexGuard<'_, MappingTables> {
        // The tables are only mutated through methods that cannot panic midway
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
