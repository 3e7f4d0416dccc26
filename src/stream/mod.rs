//! Change-detection streaming layer.
//!
//! A fixed-cadence detector fingerprints a configured set of read queries
//! against the store and emits a [`ChangeEvent`] whenever a query group's
//! digest moves. The broadcaster serializes each event once and fans it out
//! through the client registry, where every connected stream client owns a
//! bounded queue with an explicit drop-oldest / disconnect policy. One slow
//! client never stalls detection or any other client.

pub mod broadcaster;
pub mod detector;
pub mod fingerprint;
pub mod registry;

pub use broadcaster::EventBroadcaster;
pub use detector::{ChangeDetector, ChangeEvent, DetectorStats};
pub use fingerprint::{Fingerprint, Fingerprinter, QueryGroup};
pub use registry::{ClientId, ClientQueue, ClientRegistry, PushOutcome, StreamFrame};
