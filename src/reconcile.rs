use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    collaborator::{ChangelistServer, LocalSurface},
    error::Result,
    identity::{ConnectionRef, LocalGroup, LocalGroupId, RemoteChangelistId},
    mapping::MappingStore,
    matcher::{self, MatchTarget},
};

/// Remote changelist -> local group, for one connection.
pub type Association = BTreeMap<RemoteChangelistId, LocalGroupId>;

/// Pairs a connection's open changelists with local groups, creating local
/// groups for changelists nothing matches.
pub struct ReconciliationEngine {
    store: Arc<MappingStore>,
    server: Arc<dyn ChangelistServer>,
    surface: Arc<dyn LocalSurface>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<MappingStore>,
        server: Arc<dyn ChangelistServer>,
        surface: Arc<dyn LocalSurface>,
    ) -> Self {
        Self {
            store,
            server,
            surface,
        }
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    /// Run one reconciliation pass for `connection`.
    ///
    /// If the changelists cannot be fetched the error is returned before
    /// anything is touched, so the connection keeps its previous links.
    pub fn reconcile(&self, connection: &ConnectionRef) -> Result<Association> {
        let snapshots = self.server.list_open_changelists(connection)?;

        let live: BTreeSet<RemoteChangelistId> =
            snapshots.iter().map(|snapshot| snapshot.id.clone()).collect();
        let removed = self.store.cleanup(connection, &live);
        if !removed.is_empty() {
            tracing::info!(
                "Removed {} stale changelist link(s) for {}",
                removed.len(),
                connection
            );
        }

        let default_name = self.store.default_name().to_string();
        let mut groups = self.surface.local_groups()?;
        let mut association = Association::new();
        let mut claimed: BTreeSet<LocalGroupId> = BTreeSet::new();
        let mut unmapped: Vec<MatchTarget> = Vec::new();

        for snapshot in snapshots.iter().filter(|snapshot| !snapshot.id.is_default()) {
            match self.store.get_local_for(&snapshot.id, &groups) {
                Some(local) if groups.iter().any(|group| group.id == local) => {
                    claimed.insert(local.clone());
                    association.insert(snapshot.id.clone(), local);
                }
                Some(local) => {
                    tracing::debug!(
                        "{} is mapped to local group {} which no longer exists",
                        snapshot.id,
                        local
                    );
                    unmapped.push(MatchTarget::from_snapshot(snapshot, &default_name));
                }
                None => unmapped.push(MatchTarget::from_snapshot(snapshot, &default_name)),
            }
        }

        let default_group = self.default_group(&mut groups, &default_name)?;
        tracing::debug!(
            "Associating {} default changelist with local group {}",
            connection,
            default_group.id
        );
        claimed.insert(default_group.id.clone());
        association.insert(RemoteChangelistId::default_for(connection), default_group.id);

        if unmapped.is_empty() {
            return Ok(association);
        }

        tracing::debug!(
            "Matching {} unmapped changelist(s) on {} against local groups",
            unmapped.len(),
            connection
        );
        let pool: Vec<LocalGroup> = groups
            .iter()
            .filter(|group| !claimed.contains(&group.id) && !group.is_default(&default_name))
            .cloned()
            .collect();
        let outcome = matcher::run_chain(&unmapped, &pool);

        for claim in outcome.claims {
            let Some(target) = unmapped.iter().find(|target| target.remote == claim.remote) else {
                continue;
            };
            let name = unique_name(&target.name, &groups, Some(&claim.local));
            let group = self.apply_name(&mut groups, &claim.local, &name, &target.comment)?;
            tracing::info!(
                "Associating {} with local group {} ({})",
                claim.remote,
                group.id,
                group.name
            );
            self.bind(&group, &claim.remote);
            association.insert(claim.remote, group.id);
        }

        for target in outcome.unmatched {
            let base = if target.name.is_empty() {
                format!("@{}", target.remote.number)
            } else {
                target.name.clone()
            };
            let name = unique_name(&base, &groups, None);
            let group = self
                .surface
                .find_or_create_local_group(&name, &target.comment)?;
            tracing::info!(
                "Mapped {} to new local group {} ({})",
                target.remote,
                group.id,
                group.name
            );
            if !groups.iter().any(|known| known.id == group.id) {
                groups.push(group.clone());
            }
            self.bind(&group, &target.remote);
            association.insert(target.remote, group.id);
        }

        Ok(association)
    }

    fn default_group(&self, groups: &mut Vec<LocalGroup>, default_name: &str) -> Result<LocalGroup> {
        if let Some(group) = groups.iter().find(|group| group.is_default(default_name)) {
            return Ok(group.clone());
        }
        tracing::info!("Creating local group '{}' for default changelists", default_name);
        let group = self.surface.find_or_create_local_group(default_name, "")?;
        groups.push(group.clone());
        Ok(group)
    }

    /// Give a claimed group its display name and comment, skipping the
    /// surface call when nothing changes.
    fn apply_name(
        &self,
        groups: &mut [LocalGroup],
        id: &LocalGroupId,
        name: &str,
        comment: &str,
    ) -> Result<LocalGroup> {
        let Some(group) = groups.iter_mut().find(|group| &group.id == id) else {
            return Err(crate::Error::Surface(format!("local group {} disappeared", id)));
        };
        if group.name != name || group.comment != comment {
            tracing::debug!("Renaming local group {} from '{}' to '{}'", id, group.name, name);
            self.surface.update_local_group(id, name, comment)?;
            group.name = name.to_string();
            group.comment = comment.to_string();
        }
        Ok(group.clone())
    }

    fn bind(&self, group: &LocalGroup, remote: &RemoteChangelistId) {
        if let Err(e) = self.store.bind(group, remote) {
            tracing::warn!("Could not bind {} to local group {}: {}", remote, group.id, e);
        }
    }
}

/// `base`, or `base (n)` with the smallest `n` no other group uses.
fn unique_name(base: &str, groups: &[LocalGroup], exclude: Option<&LocalGroupId>) -> String {
    let taken = |candidate: &str| {
        groups
            .iter()
            .any(|group| Some(&group.id) != exclude && group.name == candidate)
    };

    let mut name = base.to_string();
    let mut index = 0;
    while taken(&name) {
        name = format!("{} ({})", base, index);
        index += 1;
    }
    name
}
