use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
};

use crate::{
    collaborator::{ChangelistServer, LocalSurface},
    error::{Error, Result},
    identity::{ConnectionRef, LocalGroup, LocalGroupId, RemoteChangelistId},
    mapping::MappingStore,
};

/// A change the user made to local groups.
#[derive(Debug, Clone)]
pub enum LocalEvent {
    Added(LocalGroup),
    Removed(LocalGroup),
    /// `group` carries the new name.
    Renamed { group: LocalGroup, old_name: String },
    CommentChanged { group: LocalGroup, old_comment: String },
    FilesAdded { group: LocalGroup, files: Vec<PathBuf> },
    FilesMoved {
        from: Option<LocalGroup>,
        to: LocalGroup,
        files: Vec<PathBuf>,
    },
}

/// What a propagated event did on the server.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PropagationReport {
    pub created: Vec<RemoteChangelistId>,
    pub renamed: Vec<RemoteChangelistId>,
    pub deleted: Vec<RemoteChangelistId>,
    pub files_moved: usize,
    /// Connections whose part of the event failed, with the reason.
    pub failures: Vec<(ConnectionRef, String)>,
}

impl PropagationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, connection: &ConnectionRef, error: &Error) {
        tracing::warn!("Failed to propagate change to {}: {}", connection, error);
        self.failures.push((connection.clone(), error.to_string()));
    }
}

/// Pushes local group edits to the server.
pub struct PropagationHandler {
    store: Arc<MappingStore>,
    server: Arc<dyn ChangelistServer>,
    surface: Arc<dyn LocalSurface>,
}

impl PropagationHandler {
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

    /// Apply `event` on every affected connection. A failure on one
    /// connection is recorded in the report and does not stop the others.
    pub fn handle(&self, event: &LocalEvent) -> PropagationReport {
        let mut report = PropagationReport::default();
        let default_name = self.store.default_name();

        match event {
            LocalEvent::Added(group) => {
                tracing::debug!("Local group {} ({}) added", group.id, group.name);
            }
            LocalEvent::Removed(group) => self.remove(group, &mut report),
            LocalEvent::Renamed { group, old_name } => {
                let was_default = old_name == default_name;
                let is_default = group.is_default(default_name);
                if is_default && !was_default {
                    self.become_default(group, &mut report);
                } else if was_default && !is_default {
                    self.leave_default(group, &mut report);
                } else {
                    self.rename(group, &mut report);
                }
            }
            LocalEvent::CommentChanged { group, .. } => self.rename(group, &mut report),
            LocalEvent::FilesAdded { group, files } => self.move_files(group, files, &mut report),
            LocalEvent::FilesMoved { from, to, files } => {
                if let Some(from) = from {
                    tracing::debug!(
                        "Moving {} file(s) from local group {} to {}",
                        files.len(),
                        from.id,
                        to.id
                    );
                }
                self.move_files(to, files, &mut report);
            }
        }

        report
    }

    /// Create a local-only changelist on the server and move its link to the
    /// real number.
    pub fn promote(
        &self,
        local_only: &RemoteChangelistId,
        description: &str,
    ) -> Result<RemoteChangelistId> {
        if !local_only.is_local_only() {
            return Err(Error::InvalidOperation(format!(
                "{} is not a local-only changelist",
                local_only
            )));
        }
        let created = self.server.create_remote(&local_only.connection, description)?;
        self.store.replace(local_only, &created)?;
        tracing::info!("Promoted {} to {}", local_only, created);
        Ok(created)
    }

    /// Local group that owns `remote`. The default changelist resolves to
    /// the surface's default group.
    pub fn resolve_local_group(&self, remote: &RemoteChangelistId) -> Result<Option<LocalGroupId>> {
        if remote.is_default() {
            let groups = self.surface.local_groups()?;
            return Ok(self.store.get_local_for(remote, &groups));
        }
        Ok(self.store.get_local_for(remote, &[]))
    }

    pub fn resolve_remote(
        &self,
        connection: &ConnectionRef,
        group: &LocalGroup,
    ) -> Option<RemoteChangelistId> {
        self.store.get_remote_for(group, connection)
    }

    fn remove(&self, group: &LocalGroup, report: &mut PropagationReport) {
        for remote in self.store.get_all_remotes_for(&group.id) {
            // unlink first so a failed delete leaves no dangling entry
            self.store.unbind(&remote);
            if !remote.is_pending() {
                tracing::debug!("{} is not on the server; nothing to delete", remote);
                continue;
            }
            match self.server.delete_remote(&remote) {
                Ok(()) => {
                    tracing::info!("Deleted {} for removed local group {}", remote, group.id);
                    report.deleted.push(remote);
                }
                Err(e) => report.fail(&remote.connection, &e),
            }
        }
    }

    fn rename(&self, group: &LocalGroup, report: &mut PropagationReport) {
        let description = group.description();
        for remote in self.store.get_all_remotes_for(&group.id) {
            if !remote.is_pending() {
                tracing::debug!("Skipping rename of {}; not on the server yet", remote);
                continue;
            }
            match self.server.rename_remote(&remote, &description) {
                Ok(()) => {
                    tracing::debug!("Renamed {} to {:?}", remote, description);
                    report.renamed.push(remote);
                }
                Err(e) => report.fail(&remote.connection, &e),
            }
        }
    }

    fn become_default(&self, group: &LocalGroup, report: &mut PropagationReport) {
        let detached = match self.store.rebind_as_default(group) {
            Ok(detached) => detached,
            Err(e) => {
                tracing::warn!("Could not rebind {} as default: {}", group.id, e);
                return;
            }
        };

        for (connection, old_remote) in detached {
            let result = self
                .files_in(&connection, &old_remote)
                .and_then(|files| {
                    if files.is_empty() {
                        return Ok(0);
                    }
                    let default = RemoteChangelistId::default_for(&connection);
                    self.server.move_files_to_remote(&files, &default)?;
                    Ok(files.len())
                });
            match result {
                Ok(moved) => report.files_moved += moved,
                Err(e) => report.fail(&connection, &e),
            }
        }
    }

    fn leave_default(&self, group: &LocalGroup, report: &mut PropagationReport) {
        for connection in self.server.connections() {
            let default = RemoteChangelistId::default_for(&connection);
            let result = self.files_in(&connection, &default).and_then(|files| {
                if files.is_empty() {
                    return Ok(0);
                }
                let target = self.target_for(&connection, group, report)?;
                self.server.move_files_to_remote(&files, &target)?;
                Ok(files.len())
            });
            match result {
                Ok(moved) => report.files_moved += moved,
                Err(e) => report.fail(&connection, &e),
            }
        }
    }

    fn move_files(&self, group: &LocalGroup, files: &[PathBuf], report: &mut PropagationReport) {
        let mut by_connection: BTreeMap<ConnectionRef, Vec<PathBuf>> = BTreeMap::new();
        for file in files {
            match self.server.connection_for_file(file) {
                Some(connection) => by_connection.entry(connection).or_default().push(file.clone()),
                None => tracing::debug!("{:?} is not under any connection", file),
            }
        }

        for (connection, files) in by_connection {
            let result = self
                .target_for(&connection, group, report)
                .and_then(|target| self.server.move_files_to_remote(&files, &target));
            match result {
                Ok(()) => report.files_moved += files.len(),
                Err(e) => report.fail(&connection, &e),
            }
        }
    }

    /// The group's changelist on `connection`, created and bound if missing.
    fn target_for(
        &self,
        connection: &ConnectionRef,
        group: &LocalGroup,
        report: &mut PropagationReport,
    ) -> Result<RemoteChangelistId> {
        if let Some(remote) = self.store.get_remote_for(group, connection) {
            return Ok(remote);
        }
        let created = self.server.create_remote(connection, &group.description())?;
        self.store.bind(group, &created)?;
        tracing::info!("Created {} for local group {}", created, group.id);
        report.created.push(created.clone());
        Ok(created)
    }

    fn files_in(&self, connection: &ConnectionRef, remote: &RemoteChangelistId) -> Result<Vec<PathBuf>> {
        Ok(self
            .server
            .list_open_file_actions(connection)?
            .into_iter()
            .filter(|action| &action.remote == remote)
            .map(|action| action.file)
            .collect())
    }
}
