//! sriovnet: SR-IOV VF lifecycle management for container sandboxes.
//!
//! This crate allocates a VF on a master PF, binds it to a kernel network
//! driver or a userspace poll-mode driver, places its netdev(s) into the
//! sandbox network namespace with VLAN tagging applied, and reverses all of
//! it at teardown, including rollback after partial failures.
//!
//! # Architecture
//!
//! ```text
//! Orchestrator (lifecycle) --> Topology (sysfs, read-only)
//!        |                         |
//!        +--> DriverBinder --------+--> PCI bus bind/unbind + BindRecord
//!        |                                      (outlives the process)
//!        +--> LinkClient (rtnetlink) --> down/rename/up/move across netns
//!        +--> vlan --> PF control path, mirrored to shared siblings
//! ```
//!
//! Every invocation is a fresh, short-lived, single operation; the only
//! state crossing invocations is the persisted [`record::BindRecord`].
//! Namespace-entering operations require a pinned OS thread, so callers run
//! the crate on a current-thread runtime.

pub mod alloc;
pub mod bind;
pub mod config;
pub mod drivers;
pub mod lifecycle;
pub mod link;
pub mod netns;
pub mod record;
pub mod rollback;
pub mod sysfs;
pub mod vlan;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

// Re-export commonly used types
pub use bind::DriverBinder;
pub use config::{DeviceConfig, NetConf};
pub use drivers::DriverRegistry;
pub use lifecycle::{LifecycleError, Orchestrator};
pub use netns::NetNs;
pub use record::{BindRecord, FileRecordStore, RecordStore};
pub use sysfs::Topology;
