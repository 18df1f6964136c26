use std::path::{Path, PathBuf};

use crate::{
    error::Result,
    identity::{ConnectionRef, LocalGroup, LocalGroupId, RemoteChangelistId, RemoteChangelistSnapshot},
};

/// A file the workspace has open, and the changelist it is open in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAction {
    pub file: PathBuf,
    pub remote: RemoteChangelistId,
}

/// Changelist commands against the server, one workspace connection at a time.
pub trait ChangelistServer: Send + Sync {
    /// Every connection the host currently knows about.
    fn connections(&self) -> Vec<ConnectionRef>;

    /// The connection whose workspace contains `file`, if any.
    fn connection_for_file(&self, file: &Path) -> Option<ConnectionRef>;

    /// Open changelists for a connection, including its default changelist.
    /// Fails with [`crate::Error::Connection`] when the server is unreachable.
    fn list_open_changelists(&self, connection: &ConnectionRef)
        -> Result<Vec<RemoteChangelistSnapshot>>;

    /// Create a new pending changelist. May return a local-only id when the
    /// server is offline and the creation has been queued.
    fn create_remote(
        &self,
        connection: &ConnectionRef,
        description: &str,
    ) -> Result<RemoteChangelistId>;

    /// Replace the description of an existing changelist.
    fn rename_remote(&self, remote: &RemoteChangelistId, description: &str) -> Result<()>;

    fn delete_remote(&self, remote: &RemoteChangelistId) -> Result<()>;

    /// Reopen `files` into the given changelist.
    fn move_files_to_remote(&self, files: &[PathBuf], remote: &RemoteChangelistId) -> Result<()>;

    /// Files currently open on a connection.
    fn list_open_file_actions(&self, connection: &ConnectionRef) -> Result<Vec<FileAction>>;
}

/// The local editing surface that owns local groups.
pub trait LocalSurface: Send + Sync {
    /// Every local group, including the default one.
    fn local_groups(&self) -> Result<Vec<LocalGroup>>;

    /// Return the group called `name`, creating it with `comment` if absent.
    fn find_or_create_local_group(&self, name: &str, comment: &str) -> Result<LocalGroup>;

    /// Change the display name and comment of an existing group.
    fn update_local_group(&self, id: &LocalGroupId, name: &str, comment: &str) -> Result<()>;
}

/// Receives the outcome of a refresh. Implementations must be driven from
/// the surface's own serialization context.
pub trait ChangeSink {
    /// `file` belongs in `group`.
    fn process_change(&mut self, file: &Path, group: &LocalGroupId);

    /// `file` is under a connection but not open in any known changelist.
    fn process_not_opened(&mut self, file: &Path);

    /// `file` is outside every connection.
    fn process_unversioned(&mut self, file: &Path);
}
