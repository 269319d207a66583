//! Core data-plane logic for a LISP mobile-node ITR: packet classification,
//! EID-to-RLOC resolution, LISP-over-UDP-over-IPv4 encapsulation, and the
//! map-cache entry lifecycle.
//!
//! Single-threaded by design (component concurrency model): state is shared
//! via `Rc<RefCell<_>>` across a `tokio::task::LocalSet`, never `Arc<Mutex<_>>`.
//! Callers own the `LocalSet` and runtime; this crate only assumes
//! `spawn_local` is available where it runs.

pub mod address;
pub mod cache;
pub mod control_plane;
pub mod eid_db;
pub mod engine;
pub mod entry;
pub mod error;
pub mod mapping;
pub mod metrics;
pub mod packet;
pub mod timer;

pub use address::{Family, IpAddress, IpPrefix};
pub use cache::MapCacheStore;
pub use control_plane::{ControlPlane, LoggingControlPlane};
pub use eid_db::{EidSnapshot, LocalEidDb, SwappableEidDb};
pub use engine::{EgressEngine, EgressEngineConfig, UnderlaySink, LISP_CONTROL_PORT, LISP_DATA_PORT};
pub use entry::{EntryConfig, EntryState, HowLearned, MapCacheEntry};
pub use error::{LispError, Result};
pub use mapping::{Locator, Mapping};
pub use metrics::Metrics;
