//! OVN egress-policy reconciliation engine
//!
//! This library provides:
//! - Ownership tagging and deterministic naming of northbound objects
//! - The northbound object model and the `NbClient` seam to the database
//! - Liveness (BFD) session, port group and address set reconciliation
//! - The three-tier routing policy reconciler and gateway teardown
//! - Per-key serialization and retry backoff for the controller shell

pub mod error;
pub mod family;
pub mod tag;
pub mod nb;
pub mod memory;
pub mod bfd;
pub mod membership;
pub mod policy;
pub mod teardown;
pub mod feed;
pub mod workqueue;

pub use error::{CoreError, Result};
pub use family::{AddressFamily, PerFamily};
pub use tag::{ExternalIds, Owner};
pub use nb::{AddressSet, BfdParams, BfdSession, NbClient, PolicyAction, PortGroup, RouterPolicy, WriteStats};
pub use memory::MemoryNb;
pub use bfd::{LivenessConfig, LivenessPlan};
pub use policy::{FamilyInputs, FamilyOutcome, GatewayOutcome, GatewayTarget, PolicyReconciler, Tier};
pub use teardown::teardown;
pub use feed::{FeedContext, RouteFeed, RouteInputs};
pub use workqueue::{KeyGuard, KeyMutex, RetryBackoff};
