//! Route/workload feed
//!
//! The reconciler never looks at Kubernetes objects. Whatever resource kind
//! describes a gateway, a `RouteFeed` turns it into `RouteInputs`: next-hops,
//! source ranges and port membership per address family.

use crate::family::PerFamily;
use crate::Result;
use async_trait::async_trait;
use egress_api::TrafficPolicy;
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// Inputs of one reconciliation pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteInputs {
    /// Network attachment of the gateway replicas, "namespace/name"
    pub attachment_network: String,
    /// Node name to next-hop, only nodes running a ready replica
    pub next_hops: PerFamily<BTreeMap<String, IpAddr>>,
    /// Union of forwarded and masqueraded source ranges
    pub sources: PerFamily<BTreeSet<IpNetwork>>,
    /// Source ranges forwarded without masquerading
    pub forward_sources: PerFamily<BTreeSet<IpNetwork>>,
    /// Logical switch ports of selector-matched pods
    pub ports: BTreeSet<String>,
    /// Node name to the node's local port group, for the nodes in `next_hops`
    pub local_port_groups: BTreeMap<String, String>,
}

/// Gateway facts resolved by the caller before the feed runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedContext {
    pub vpc: String,
    pub router: String,
    pub traffic_policy: TrafficPolicy,
}

/// Computes the inputs of a pass from a gateway resource
#[async_trait]
pub trait RouteFeed: Send + Sync {
    type Resource: Send + Sync;

    async fn route_inputs(&self, resource: &Self::Resource, ctx: &FeedContext) -> Result<RouteInputs>;
}
