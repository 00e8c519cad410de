//! Northbound database object model
//!
//! Field-level shapes of the objects the engine owns, and the `NbClient`
//! trait through which every read and write reaches the database.

use crate::{ExternalIds, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::AddAssign;

/// Named set of logical switch port identifiers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortGroup {
    pub uuid: String,
    pub name: String,
    pub ports: Vec<String>,
    pub external_ids: ExternalIds,
}

/// Named set of addresses/CIDRs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSet {
    pub uuid: String,
    pub name: String,
    pub addresses: Vec<String>,
    pub external_ids: ExternalIds,
}

/// BFD timers of a liveness session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BfdParams {
    /// Minimum transmit interval (ms)
    pub min_tx: i64,
    /// Minimum receive interval (ms)
    pub min_rx: i64,
    /// Detection multiplier
    pub detect_mult: i64,
}

impl Default for BfdParams {
    fn default() -> Self {
        Self {
            min_tx: 1000,
            min_rx: 1000,
            detect_mult: 3,
        }
    }
}

/// Liveness (BFD) session between a router port and a next-hop
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BfdSession {
    pub uuid: String,
    /// Monitoring (logical router) port
    pub logical_port: String,
    pub dst_ip: String,
    pub params: BfdParams,
    pub external_ids: ExternalIds,
}

/// Routing policy action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyAction {
    Reroute,
    Drop,
    Allow,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Reroute => "reroute",
            PolicyAction::Drop => "drop",
            PolicyAction::Allow => "allow",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reroute" => Some(PolicyAction::Reroute),
            "drop" => Some(PolicyAction::Drop),
            "allow" => Some(PolicyAction::Allow),
            _ => None,
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical router policy; `uuid` is ignored on creation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterPolicy {
    pub uuid: String,
    pub priority: i64,
    pub match_expr: String,
    pub action: PolicyAction,
    pub next_hops: Vec<String>,
    pub bfd_sessions: Vec<String>,
    pub external_ids: ExternalIds,
}

impl RouterPolicy {
    /// Whether next-hops or session references differ from the given sets,
    /// ignoring order
    pub fn differs_from(&self, next_hops: &BTreeSet<String>, bfd_sessions: &BTreeSet<String>) -> bool {
        let current_hops: BTreeSet<&str> = self.next_hops.iter().map(String::as_str).collect();
        let current_sessions: BTreeSet<&str> = self.bfd_sessions.iter().map(String::as_str).collect();
        current_hops != next_hops.iter().map(String::as_str).collect::<BTreeSet<&str>>()
            || current_sessions != bfd_sessions.iter().map(String::as_str).collect::<BTreeSet<&str>>()
    }
}

/// Counts of remote writes issued during a pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl WriteStats {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

impl AddAssign for WriteStats {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.deleted += other.deleted;
    }
}

/// Access to the northbound database
///
/// Listing operations return only objects whose `external_ids` include
/// every entry of the given tag. Creates are not idempotent on their own:
/// callers list or get first and create only what is missing.
#[async_trait]
pub trait NbClient: Send + Sync {
    async fn get_port_group(&self, name: &str) -> Result<Option<PortGroup>>;
    async fn list_port_groups(&self, tag: &ExternalIds) -> Result<Vec<PortGroup>>;
    async fn create_port_group(&self, name: &str, external_ids: &ExternalIds) -> Result<()>;
    async fn set_port_group_ports(&self, name: &str, ports: &[String]) -> Result<()>;
    async fn delete_port_group(&self, name: &str) -> Result<()>;

    async fn get_address_set(&self, name: &str) -> Result<Option<AddressSet>>;
    async fn list_address_sets(&self, tag: &ExternalIds) -> Result<Vec<AddressSet>>;
    async fn create_address_set(&self, name: &str, external_ids: &ExternalIds) -> Result<()>;
    async fn set_address_set_addresses(&self, name: &str, addresses: &[String]) -> Result<()>;
    async fn delete_address_set(&self, name: &str) -> Result<()>;

    async fn list_bfd_sessions(&self, tag: &ExternalIds) -> Result<Vec<BfdSession>>;
    async fn create_bfd_session(
        &self,
        logical_port: &str,
        dst_ip: &str,
        params: &BfdParams,
        external_ids: &ExternalIds,
    ) -> Result<BfdSession>;
    async fn update_bfd_session(&self, uuid: &str, params: &BfdParams) -> Result<()>;
    async fn delete_bfd_session(&self, uuid: &str) -> Result<()>;

    /// Policies attached to `router`, optionally restricted to one priority
    async fn list_router_policies(
        &self,
        router: &str,
        priority: Option<i64>,
        tag: &ExternalIds,
    ) -> Result<Vec<RouterPolicy>>;
    /// Attach a new policy to `router`, returning its uuid
    async fn create_router_policy(&self, router: &str, policy: &RouterPolicy) -> Result<String>;
    async fn update_router_policy(&self, uuid: &str, next_hops: &[String], bfd_sessions: &[String]) -> Result<()>;
    async fn delete_router_policy(&self, router: &str, uuid: &str) -> Result<()>;
}
