#![deny(clippy::mod_module_files)]
//! Keeps an editor's local changelist groups in step with pending
//! changelists on one or more Perforce connections.

pub mod collaborator;
pub mod config;
pub mod error;
pub mod identity;
pub mod mapping;
pub mod matcher;
pub mod orchestrator;
pub mod propagate;
pub mod reconcile;

#[cfg(test)]
mod testing;

pub use collaborator::{ChangeSink, ChangelistServer, FileAction, LocalSurface};
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use identity::{
    ChangelistKind, ConnectionRef, DescriptionParts, LocalGroup, LocalGroupId, RemoteChangelistId,
    RemoteChangelistSnapshot,
};
pub use mapping::{FileMappingBackend, MappingBackend, MappingStore, MappingTables};
pub use matcher::MatchStrategy;
pub use orchestrator::{
    RefreshOutcome, RefreshPhase, RefreshRequest, RefreshResult, ScopeSignature, SyncOrchestrator,
};
pub use propagate::{LocalEvent, PropagationHandler, PropagationReport};
pub use reconcile::{Association, ReconciliationEngine};
