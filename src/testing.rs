//! In-memory collaborators for unit tests.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{
    collaborator::{ChangeSink, ChangelistServer, FileAction, LocalSurface},
    error::{Error, Result},
    identity::{ConnectionRef, LocalGroup, LocalGroupId, RemoteChangelistId, RemoteChangelistSnapshot},
};

pub const DEFAULT_NAME: &str = "Default Changelist";

struct Workspace {
    root: PathBuf,
    offline: bool,
    broken: bool,
    next_number: i64,
    changelists: BTreeMap<i64, String>,
    files: Vec<FileAction>,
}

#[derive(Default)]
struct ServerState {
    workspaces: BTreeMap<ConnectionRef, Workspace>,
    calls: Vec<String>,
    list_count: usize,
}

#[derive(Default)]
pub struct FakeServer {
    state: Mutex<ServerState>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, name: &str, root: &str) -> ConnectionRef {
        let connection = ConnectionRef::new(name);
        self.state.lock().unwrap().workspaces.insert(
            connection.clone(),
            Workspace {
                root: PathBuf::from(root),
                offline: false,
                broken: false,
                next_number: 100,
                changelists: BTreeMap::new(),
                files: Vec::new(),
            },
        );
        connection
    }

    pub fn add_changelist(&self, connection: &ConnectionRef, number: i64, description: &str) {
        self.with_workspace(connection, |ws| {
            ws.changelists.insert(number, description.to_string());
        });
    }

    pub fn remove_changelist(&self, connection: &ConnectionRef, number: i64) {
        self.with_workspace(connection, |ws| {
            ws.changelists.remove(&number);
        });
    }

    pub fn open_file(&self, connection: &ConnectionRef, file: &str, number: i64) {
        let remote = RemoteChangelistId::new(connection.clone(), number);
        self.with_workspace(connection, |ws| {
            ws.files.push(FileAction {
                file: PathBuf::from(file),
                remote,
            });
        });
    }

    pub fn set_offline(&self, connection: &ConnectionRef, offline: bool) {
        self.with_workspace(connection, |ws| ws.offline = offline);
    }

    /// Make every command on `connection` fail with a non-connection error.
    pub fn set_broken(&self, connection: &ConnectionRef, broken: bool) {
        self.with_workspace(connection, |ws| ws.broken = broken);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn list_count(&self) -> usize {
        self.state.lock().unwrap().list_count
    }

    pub fn files_in(&self, remote: &RemoteChangelistId) -> Vec<PathBuf> {
        let state = self.state.lock().unwrap();
        state.workspaces[&remote.connection]
            .files
            .iter()
            .filter(|action| &action.remote == remote)
            .map(|action| action.file.clone())
            .collect()
    }

    pub fn description_of(&self, remote: &RemoteChangelistId) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.workspaces[&remote.connection]
            .changelists
            .get(&remote.number)
            .cloned()
    }

    fn with_workspace<T>(&self, connection: &ConnectionRef, f: impl FnOnce(&mut Workspace) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(state.workspaces.get_mut(connection).expect("unknown connection"))
    }

    fn online<T>(
        &self,
        connection: &ConnectionRef,
        call: String,
        f: impl FnOnce(&mut Workspace) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        let ws = state
            .workspaces
            .get_mut(connection)
            .ok_or_else(|| Error::Remote(format!("unknown connection {}", connection)))?;
        if ws.offline {
            return Err(Error::Connection(format!("{} is offline", connection)));
        }
        if ws.broken {
            return Err(Error::Remote(format!("{} rejected the command", connection)));
        }
        f(ws)
    }
}

impl ChangelistServer for FakeServer {
    fn connections(&self) -> Vec<ConnectionRef> {
        self.state.lock().unwrap().workspaces.keys().cloned().collect()
    }

    fn connection_for_file(&self, file: &Path) -> Option<ConnectionRef> {
        let state = self.state.lock().unwrap();
        state
            .workspaces
            .iter()
            .find(|(_, ws)| file.starts_with(&ws.root))
            .map(|(connection, _)| connection.clone())
    }

    fn list_open_changelists(
        &self,
        connection: &ConnectionRef,
    ) -> Result<Vec<RemoteChangelistSnapshot>> {
        self.state.lock().unwrap().list_count += 1;
        self.online(connection, format!("list {}", connection), |ws| {
            let mut snapshots = vec![RemoteChangelistSnapshot::new(
                RemoteChangelistId::default_for(connection),
                "<default>",
            )];
            snapshots.extend(ws.changelists.iter().map(|(number, description)| {
                RemoteChangelistSnapshot::new(
                    RemoteChangelistId::new(connection.clone(), *number),
                    description.clone(),
                )
            }));
            Ok(snapshots)
        })
    }

    fn create_remote(
        &self,
        connection: &ConnectionRef,
        description: &str,
    ) -> Result<RemoteChangelistId> {
        self.online(connection, format!("create {} {:?}", connection, description), |ws| {
            let number = ws.next_number;
            ws.next_number += 1;
            ws.changelists.insert(number, description.to_string());
            Ok(RemoteChangelistId::new(connection.clone(), number))
        })
    }

    fn rename_remote(&self, remote: &RemoteChangelistId, description: &str) -> Result<()> {
        self.online(
            &remote.connection,
            format!("rename {} {:?}", remote, description),
            |ws| {
                ws.changelists.insert(remote.number, description.to_string());
                Ok(())
            },
        )
    }

    fn delete_remote(&self, remote: &RemoteChangelistId) -> Result<()> {
        self.online(&remote.connection, format!("delete {}", remote), |ws| {
            ws.changelists.remove(&remote.number);
            Ok(())
        })
    }

    fn move_files_to_remote(&self, files: &[PathBuf], remote: &RemoteChangelistId) -> Result<()> {
        self.online(
            &remote.connection,
            format!("move {} file(s) to {}", files.len(), remote),
            |ws| {
                for file in files {
                    match ws.files.iter_mut().find(|action| &action.file == file) {
                        Some(action) => action.remote = remote.clone(),
                        None => ws.files.push(FileAction {
                            file: file.clone(),
                            remote: remote.clone(),
                        }),
                    }
                }
                Ok(())
            },
        )
    }

    fn list_open_file_actions(&self, connection: &ConnectionRef) -> Result<Vec<FileAction>> {
        self.online(connection, format!("opened {}", connection), |ws| Ok(ws.files.clone()))
    }
}

struct SurfaceState {
    groups: Vec<LocalGroup>,
    next_id: usize,
    updates: usize,
    created: usize,
    failing: bool,
    listing_fails: bool,
}

pub struct FakeSurface {
    state: Mutex<SurfaceState>,
}

impl FakeSurface {
    /// A surface holding only the default group, with id `default`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SurfaceState {
                groups: vec![LocalGroup::new("default", DEFAULT_NAME, "")],
                next_id: 1,
                updates: 0,
                created: 0,
                failing: false,
                listing_fails: false,
            }),
        }
    }

    pub fn add_group(&self, name: &str, comment: &str) -> LocalGroup {
        let mut state = self.state.lock().unwrap();
        let group = LocalGroup::new(format!("local-{}", state.next_id), name, comment);
        state.next_id += 1;
        state.groups.push(group.clone());
        group
    }

    pub fn group(&self, id: &LocalGroupId) -> Option<LocalGroup> {
        let state = self.state.lock().unwrap();
        state.groups.iter().find(|group| &group.id == id).cloned()
    }

    pub fn rename(&self, id: &LocalGroupId, name: &str) -> LocalGroup {
        let mut state = self.state.lock().unwrap();
        let group = state
            .groups
            .iter_mut()
            .find(|group| &group.id == id)
            .expect("unknown group");
        group.name = name.to_string();
        group.clone()
    }

    pub fn remove(&self, id: &LocalGroupId) {
        self.state.lock().unwrap().groups.retain(|group| &group.id != id);
    }

    /// Make group creation fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    /// Make `local_groups` fail until cleared.
    pub fn set_listing_fails(&self, fails: bool) {
        self.state.lock().unwrap().listing_fails = fails;
    }

    pub fn updates(&self) -> usize {
        self.state.lock().unwrap().updates
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }
}

impl LocalSurface for FakeSurface {
    fn local_groups(&self) -> Result<Vec<LocalGroup>> {
        let state = self.state.lock().unwrap();
        if state.listing_fails {
            return Err(Error::Surface("local groups unavailable".to_string()));
        }
        Ok(state.groups.clone())
    }

    fn find_or_create_local_group(&self, name: &str, comment: &str) -> Result<LocalGroup> {
        let mut state = self.state.lock().unwrap();
        if let Some(group) = state.groups.iter().find(|group| group.name == name) {
            return Ok(group.clone());
        }
        if state.failing {
            return Err(Error::Surface(format!("cannot create local group {:?}", name)));
        }
        let group = LocalGroup::new(format!("local-{}", state.next_id), name, comment);
        state.next_id += 1;
        state.created += 1;
        state.groups.push(group.clone());
        Ok(group)
    }

    fn update_local_group(&self, id: &LocalGroupId, name: &str, comment: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let group = state
            .groups
            .iter_mut()
            .find(|group| &group.id == id)
            .ok_or_else(|| Error::Surface(format!("no local group {}", id)))?;
        group.name = name.to_string();
        group.comment = comment.to_string();
        state.updates += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub changes: Vec<(PathBuf, LocalGroupId)>,
    pub not_opened: Vec<PathBuf>,
    pub unversioned: Vec<PathBuf>,
}

impl ChangeSink for RecordingSink {
    fn process_change(&mut self, file: &Path, group: &LocalGroupId) {
        self.changes.push((file.to_path_buf(), group.clone()));
    }

    fn process_not_opened(&mut self, file: &Path) {
        self.not_opened.push(file.to_path_buf());
    }

    fn process_unversioned(&mut self, file: &Path) {
        self.unversioned.push(file.to_path_buf());
    }
}
