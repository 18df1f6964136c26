use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

use crate::{
    collaborator::{ChangeSink, ChangelistServer, LocalSurface},
    error::Result,
    identity::{ConnectionRef, LocalGroup, LocalGroupId, RemoteChangelistId},
    mapping::MappingStore,
    reconcile::{Association, ReconciliationEngine},
};

/// Where the orchestrator is in a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshPhase {
    Idle,
    Refreshing,
    CacheHit,
    FullPass,
}

/// Files the surface wants classified.
#[derive(Debug, Clone, Default)]
pub struct RefreshRequest {
    pub dirty_files: Vec<PathBuf>,
}

impl RefreshRequest {
    pub fn new(dirty_files: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            dirty_files: dirty_files.into_iter().map(Into::into).collect(),
        }
    }
}

/// What a cached refresh result is valid for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSignature {
    dirty_files: BTreeSet<PathBuf>,
    local_groups: BTreeSet<LocalGroupId>,
}

impl ScopeSignature {
    pub fn new(dirty_files: &[PathBuf], groups: &[LocalGroup]) -> Self {
        Self {
            dirty_files: dirty_files.iter().cloned().collect(),
            local_groups: groups.iter().map(|group| group.id.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshResult {
    pub associations: BTreeMap<ConnectionRef, Association>,
    /// Dirty files open in a mapped changelist, with their local group.
    pub assignments: Vec<(PathBuf, LocalGroupId)>,
    pub not_opened: Vec<PathBuf>,
    pub unversioned: Vec<PathBuf>,
    /// Connections whose pass failed this cycle. Their previous links are
    /// kept and their files are left out of the result.
    pub skipped_connections: Vec<ConnectionRef>,
    pub computed_at: DateTime<Utc>,
}

impl RefreshResult {
    fn empty() -> Self {
        Self {
            associations: BTreeMap::new(),
            assignments: Vec::new(),
            not_opened: Vec::new(),
            unversioned: Vec::new(),
            skipped_connections: Vec::new(),
            computed_at: Utc::now(),
        }
    }

    /// Replay the result into the surface.
    pub fn apply_to(&self, sink: &mut dyn ChangeSink) {
        for (file, group) in &self.assignments {
            sink.process_change(file, group);
        }
        for file in &self.not_opened {
            sink.process_not_opened(file);
        }
        for file in &self.unversioned {
            sink.process_unversioned(file);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    CacheHit(RefreshResult),
    FullPass(RefreshResult),
}

impl RefreshOutcome {
    pub fn result(&self) -> &RefreshResult {
        match self {
            RefreshOutcome::CacheHit(result) | RefreshOutcome::FullPass(result) => result,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        matches!(self, RefreshOutcome::CacheHit(_))
    }
}

struct CachedRefresh {
    scope: ScopeSignature,
    computed: Instant,
    result: RefreshResult,
}

struct OrchestratorState {
    phase: RefreshPhase,
    cache: Option<CachedRefresh>,
}

/// Drives reconciliation for every connection and answers refresh requests,
/// replaying the previous answer while it is fresh.
pub struct SyncOrchestrator {
    engine: ReconciliationEngine,
    server: Arc<dyn ChangelistServer>,
    surface: Arc<dyn LocalSurface>,
    ttl: Duration,
    state: Mutex<OrchestratorState>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<MappingStore>,
        server: Arc<dyn ChangelistServer>,
        surface: Arc<dyn LocalSurface>,
        ttl: Duration,
    ) -> Self {
        Self {
            engine: ReconciliationEngine::new(store, server.clone(), surface.clone()),
            server,
            surface,
            ttl,
            state: Mutex::new(OrchestratorState {
                phase: RefreshPhase::Idle,
                cache: None,
            }),
        }
    }

    pub fn phase(&self) -> RefreshPhase {
        self.state().phase
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        self.engine.store()
    }

    /// Drop the cached result so the next refresh runs a full pass.
    pub fn invalidate(&self) {
        self.state().cache = None;
    }

    /// Classify `request.dirty_files`, reconciling every connection unless a
    /// fresh result for the same scope is cached.
    pub fn refresh(&self, request: &RefreshRequest) -> Result<RefreshOutcome> {
        self.set_phase(RefreshPhase::Refreshing);
        let outcome = self.run(request);
        if let Err(e) = &outcome {
            tracing::warn!("Refresh failed, clearing cached result: {}", e);
            self.invalidate();
        }
        self.set_phase(RefreshPhase::Idle);
        outcome
    }

    fn run(&self, request: &RefreshRequest) -> Result<RefreshOutcome> {
        let groups = self.surface.local_groups()?;
        let scope = ScopeSignature::new(&request.dirty_files, &groups);

        {
            let mut state = self.state();
            if let Some(cached) = state.cache.as_ref() {
                if cached.scope == scope && cached.computed.elapsed() < self.ttl {
                    tracing::debug!(
                        "Using cached refresh from {} ({} assignment(s))",
                        cached.result.computed_at.to_rfc3339(),
                        cached.result.assignments.len()
                    );
                    let result = cached.result.clone();
                    state.phase = RefreshPhase::CacheHit;
                    return Ok(RefreshOutcome::CacheHit(result));
                }
            }
            state.phase = RefreshPhase::FullPass;
        }

        let result = self.full_pass(request);

        // the pass may have created groups; cache under the set it left behind
        let groups = self.surface.local_groups()?;
        self.state().cache = Some(CachedRefresh {
            scope: ScopeSignature::new(&request.dirty_files, &groups),
            computed: Instant::now(),
            result: result.clone(),
        });
        Ok(RefreshOutcome::FullPass(result))
    }

    /// Reconcile every connection and classify the dirty files. A failure
    /// on one connection only skips that connection.
    fn full_pass(&self, request: &RefreshRequest) -> RefreshResult {
        let mut result = RefreshResult::empty();
        let mut skipped: BTreeSet<ConnectionRef> = BTreeSet::new();

        for connection in self.server.connections() {
            match self.engine.reconcile(&connection) {
                Ok(association) => {
                    tracing::debug!(
                        "Reconciled {} ({} changelist(s))",
                        connection,
                        association.len()
                    );
                    result.associations.insert(connection, association);
                }
                Err(e) if e.is_server_side() => {
                    tracing::warn!("Skipping {}: {}", connection, e);
                    skipped.insert(connection);
                }
                Err(e) => {
                    tracing::error!("Reconciling {} failed, skipping it: {}", connection, e);
                    skipped.insert(connection);
                }
            }
        }

        let mut opened: BTreeMap<ConnectionRef, BTreeMap<PathBuf, RemoteChangelistId>> =
            BTreeMap::new();
        let dirty: BTreeSet<&PathBuf> = request.dirty_files.iter().collect();

        for file in dirty {
            let Some(connection) = self.server.connection_for_file(file) else {
                result.unversioned.push(file.clone());
                continue;
            };
            if skipped.contains(&connection) {
                tracing::debug!("Leaving {:?} alone; {} was skipped", file, connection);
                continue;
            }
            if !opened.contains_key(&connection) {
                match self.server.list_open_file_actions(&connection) {
                    Ok(actions) => {
                        let by_file = actions
                            .into_iter()
                            .map(|action| (action.file, action.remote))
                            .collect();
                        opened.insert(connection.clone(), by_file);
                    }
                    Err(e) => {
                        tracing::warn!("Skipping {}: {}", connection, e);
                        skipped.insert(connection);
                        continue;
                    }
                }
            }

            let remote = opened.get(&connection).and_then(|by_file| by_file.get(file));
            let local = remote.and_then(|remote| {
                result
                    .associations
                    .get(&connection)
                    .and_then(|association| association.get(remote))
            });
            match (remote, local) {
                (Some(_), Some(local)) => result.assignments.push((file.clone(), local.clone())),
                (Some(remote), None) => {
                    tracing::warn!("{:?} is open in {} which has no local group", file, remote);
                    result.not_opened.push(file.clone());
                }
                (None, _) => result.not_opened.push(file.clone()),
            }
        }

        result.skipped_connections = skipped.into_iter().collect();
        result
    }

    fn set_phase(&self, phase: RefreshPhase) {
        self.state().phase = phase;
    }

    fn state(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::Error,
        testing::{FakeServer, FakeSurface, RecordingSink, DEFAULT_NAME},
    };

    struct Fixture {
        store: Arc<MappingStore>,
        server: Arc<FakeServer>,
        surface: Arc<FakeSurface>,
        connection: ConnectionRef,
    }

    fn fixture() -> Fixture {
        let server = Arc::new(FakeServer::new());
        let connection = server.add_connection("srv|ws", "/ws");
        Fixture {
            store: Arc::new(MappingStore::new(DEFAULT_NAME)),
            server,
            surface: Arc::new(FakeSurface::new()),
            connection,
        }
    }

    fn orchestrator(f: &Fixture, ttl: Duration) -> SyncOrchestrator {
        SyncOrchestrator::new(f.store.clone(), f.server.clone(), f.surface.clone(), ttl)
    }

    #[test]
    fn test_full_pass_classifies_dirty_files() {
        let f = fixture();
        f.server.add_changelist(&f.connection, 5, "Feature");
        f.server.open_file(&f.connection, "/ws/open.txt", 5);
        f.server.open_file(&f.connection, "/ws/default.txt", 0);
        let sync = orchestrator(&f, Duration::from_secs(10));

        let request = RefreshRequest::new([
            "/ws/open.txt",
            "/ws/default.txt",
            "/ws/untouched.txt",
            "/tmp/outside.txt",
        ]);
        let outcome = sync.refresh(&request).unwrap();
        assert!(!outcome.is_cache_hit());
        assert_eq!(sync.phase(), RefreshPhase::Idle);

        let result = outcome.result();
        let feature = result.associations[&f.connection]
            [&RemoteChangelistId::new(f.connection.clone(), 5)]
            .clone();
        assert_eq!(f.surface.group(&feature).unwrap().name, "Feature");

        let mut sink = RecordingSink::default();
        result.apply_to(&mut sink);
        assert_eq!(
            sink.changes,
            vec![
                (PathBuf::from("/ws/default.txt"), LocalGroupId::new("default")),
                (PathBuf::from("/ws/open.txt"), feature),
            ]
        );
        assert_eq!(sink.not_opened, vec![PathBuf::from("/ws/untouched.txt")]);
        assert_eq!(sink.unversioned, vec![PathBuf::from("/tmp/outside.txt")]);
    }

    #[test]
    fn test_cache_hit_within_ttl() {
        let f = fixture();
        f.server.add_changelist(&f.connection, 5, "Feature");
        let sync = orchestrator(&f, Duration::from_secs(60));
        let request = RefreshRequest::new(["/ws/a.txt"]);

        let first = sync.refresh(&request).unwrap();
        let lists = f.server.list_count();
        let second = sync.refresh(&request).unwrap();

        assert!(second.is_cache_hit());
        assert_eq!(first.result(), second.result());
        assert_eq!(f.server.list_count(), lists);
    }

    #[test]
    fn test_scope_change_forces_full_pass() {
        let f = fixture();
        let sync = orchestrator(&f, Duration::from_secs(60));

        sync.refresh(&RefreshRequest::new(["/ws/a.txt"])).unwrap();
        let other_files = sync.refresh(&RefreshRequest::new(["/ws/b.txt"])).unwrap();
        assert!(!other_files.is_cache_hit());

        f.surface.add_group("New group", "");
        let new_group = sync.refresh(&RefreshRequest::new(["/ws/b.txt"])).unwrap();
        assert!(!new_group.is_cache_hit());

        let same = sync.refresh(&RefreshRequest::new(["/ws/b.txt"])).unwrap();
        assert!(same.is_cache_hit());
    }

    #[test]
    fn test_expired_cache_and_invalidate() {
        let f = fixture();
        let request = RefreshRequest::new(["/ws/a.txt"]);

        let expired = orchestrator(&f, Duration::ZERO);
        expired.refresh(&request).unwrap();
        assert!(!expired.refresh(&request).unwrap().is_cache_hit());

        let sync = orchestrator(&f, Duration::from_secs(60));
        sync.refresh(&request).unwrap();
        sync.invalidate();
        assert!(!sync.refresh(&request).unwrap().is_cache_hit());
    }

    #[test]
    fn test_offline_connection_is_skipped() {
        let f = fixture();
        let other = f.server.add_connection("srv|other", "/other");
        f.server.add_changelist(&f.connection, 5, "Feature");
        f.server.add_changelist(&other, 7, "Other work");
        let sync = orchestrator(&f, Duration::from_secs(10));
        sync.refresh(&RefreshRequest::default()).unwrap();
        let before = f.store.get_local_for(&RemoteChangelistId::new(f.connection.clone(), 5), &[]);

        f.server.set_offline(&f.connection, true);
        sync.invalidate();
        let outcome = sync
            .refresh(&RefreshRequest::new(["/ws/a.txt", "/other/b.txt"]))
            .unwrap();

        let result = outcome.result();
        assert_eq!(result.skipped_connections, vec![f.connection.clone()]);
        assert!(result.associations.contains_key(&other));
        assert_eq!(result.not_opened, vec![PathBuf::from("/other/b.txt")]);
        assert_eq!(
            f.store.get_local_for(&RemoteChangelistId::new(f.connection.clone(), 5), &[]),
            before
        );
    }

    #[test]
    fn test_rejected_connection_is_skipped() {
        let f = fixture();
        f.server.set_broken(&f.connection, true);
        let sync = orchestrator(&f, Duration::from_secs(10));

        let outcome = sync.refresh(&RefreshRequest::new(["/ws/a.txt"])).unwrap();
        assert_eq!(outcome.result().skipped_connections, vec![f.connection.clone()]);
        assert!(outcome.result().not_opened.is_empty());
    }

    #[test]
    fn test_failed_refresh_clears_cache() {
        let f = fixture();
        let sync = orchestrator(&f, Duration::from_secs(60));
        let request = RefreshRequest::new(["/ws/a.txt"]);
        sync.refresh(&request).unwrap();

        f.surface.set_listing_fails(true);
        let err = sync.refresh(&request).unwrap_err();
        assert!(matches!(err, Error::Surface(_)));
        assert_eq!(sync.phase(), RefreshPhase::Idle);

        f.surface.set_listing_fails(false);
        let lists = f.server.list_count();
        let outcome = sync.refresh(&request).unwrap();
        assert!(!outcome.is_cache_hit());
        assert!(f.server.list_count() > lists);
    }

    #[test]
    fn test_cache_hit_after_pass_creates_groups() {
        let f = fixture();
        f.server.add_changelist(&f.connection, 5, "Feature");
        f.server.add_changelist(&f.connection, 6, "Refactor");
        let sync = orchestrator(&f, Duration::from_secs(60));
        let request = RefreshRequest::new(["/ws/a.txt"]);

        assert!(!sync.refresh(&request).unwrap().is_cache_hit());
        assert_eq!(f.surface.created(), 2);

        let lists = f.server.list_count();
        assert!(sync.refresh(&request).unwrap().is_cache_hit());
        assert_eq!(f.server.list_count(), lists);
    }

    #[test]
    fn test_failing_connection_does_not_abort_others() {
        let f = fixture();
        let other = f.server.add_connection("srv|other", "/other");
        f.server.add_changelist(&f.connection, 3, "New work");
        f.server.add_changelist(&other, 7, "Existing");
        f.server.open_file(&other, "/other/b.txt", 7);
        let existing = f.surface.add_group("Existing", "");
        f.surface.set_failing(true);
        let sync = orchestrator(&f, Duration::from_secs(10));

        let outcome = sync
            .refresh(&RefreshRequest::new(["/ws/a.txt", "/other/b.txt"]))
            .unwrap();

        let result = outcome.result();
        assert_eq!(result.skipped_connections, vec![f.connection.clone()]);
        assert_eq!(
            result.assignments,
            vec![(PathBuf::from("/other/b.txt"), existing.id.clone())]
        );
        assert_eq!(
            f.store.get_local_for(&RemoteChangelistId::new(other.clone(), 7), &[]),
            Some(existing.id)
        );
        assert_eq!(f.surface.created(), 0);
    }
}
