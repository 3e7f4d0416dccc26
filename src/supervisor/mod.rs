//! Daemon supervision: fast watchdog restarts and slow pattern-matched
//! self-healing over a declared daemon fleet.
//!
//! The two layers share one state store and one per-daemon remedy token.
//! The watchdog handles the common case (process crashed, plain restart);
//! repeated watchdog failures escalate to the self-heal supervisor, which
//! classifies the condition against the failure pattern library, applies
//! the mapped remedy, verifies, and eventually latches Degraded rather
//! than retry-storming.

pub mod daemon;
pub mod healer;
pub mod patterns;
pub mod remedy;
pub mod state;
pub mod watchdog;

pub use daemon::{DaemonDescriptor, DaemonHandle, Liveness, LivenessProbe, ProcessDaemon, RestartPolicy};
pub use healer::{ScanOutcome, SelfHealSupervisor};
pub use patterns::{
    FailurePattern, FailurePatternLibrary, Matcher, Observation, Observer, PatternSeverity,
    SystemObserver,
};
pub use remedy::{ClearStaleLock, CommandRemedy, ManualIntervention, Remedy, RemedyContext, RestartDaemon, RotateLogs};
pub use state::{DaemonSnapshot, DaemonState, EscalationState, SupervisorState};
pub use watchdog::ProcessWatchdog;
