//! Failover Leader Election
//!
//! This crate provides leader election and leader liveness tracking on top of a
//! linearizable coordination store with leases, compare-and-swap transactions
//! and watches.
//!
//! - [`LeaderElector`] campaigns for a leader key and keeps the lease alive
//! - [`CampaignCoordinator`] caches the current holder of one leader key
//! - [`GroupWatcher`] tracks the leaders of every role under a prefix
//! - [`ElectionSession`] keeps their watches alive across store outages

pub mod campaign;
pub mod config;
pub mod elector;
pub mod error;
pub mod factory;
pub mod member;
pub mod session;
pub mod store;
pub mod watcher;

pub use campaign::{CampaignCoordinator, CampaignParameters};
pub use config::{FailoverConfig, SessionConfig};
pub use elector::{ElectorState, LeaderElector};
pub use error::{ElectionError, Result};
pub use factory::ElectionFactory;
pub use member::Member;
pub use session::{ElectionSession, WatchStrategy};
pub use store::{
    CoordinationClient, KeyValue, LeaseId, MemoryStore, TxnOutcome, Watch, WatchEvent,
    WatchEventKind, WatchTarget,
};
pub use watcher::GroupWatcher;
