//! vigil: local monitoring stack
//!
//! Turns a periodically-mutated on-disk datastore into a live multi-client
//! event feed, and keeps a fleet of background daemons alive without
//! operator intervention.
//!
//! ## Architecture
//!
//! - **Stream**: fixed-cadence change detection over the store, fanned out
//!   to SSE clients through per-client bounded queues
//! - **Supervisor**: fast watchdog restarts plus a slow pattern-matching
//!   self-heal layer with verification and escalation
//! - **Event log**: append-only heal/recovery outcome records for the
//!   external reporting collaborator

pub mod api;
pub mod config;
pub mod eventlog;
pub mod store;
pub mod stream;
pub mod supervisor;

// Re-export configuration
pub use config::VigilConfig;

// Re-export streaming types
pub use stream::{
    ChangeDetector, ChangeEvent, ClientRegistry, DetectorStats, EventBroadcaster, Fingerprinter,
    QueryGroup,
};

// Re-export supervision types
pub use supervisor::{
    DaemonDescriptor, DaemonHandle, DaemonState, FailurePattern, FailurePatternLibrary, Liveness,
    Matcher, Observation, Observer, PatternSeverity, ProcessWatchdog, Remedy, ScanOutcome,
    SelfHealSupervisor, SupervisorState, SystemObserver,
};

// Re-export storage
pub use eventlog::{EventLog, EventLogError, HealEvent, RecoveryEvent, RecoveryStats};
pub use store::{ProcessLock, Store, StoreError};
