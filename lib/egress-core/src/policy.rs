//! Policy tier reconciler
//!
//! Converges the northbound state of one gateway, one address family at a
//! time, in a fixed order:
//!
//! 1. port group membership
//! 2. address set contents
//! 3. liveness sessions (stale ones are only collected)
//! 4. Local tier, one policy per node and match
//! 5. Global tier, two policies balancing over every next-hop
//! 6. Drop tier, two policies catching traffic once every next-hop is down
//! 7. deletion of the stale liveness sessions
//!
//! Every step lists what the gateway owns, compares, and writes only the
//! difference, so a pass can be interrupted and re-run at any point.

use crate::bfd::{reconcile_liveness, LivenessConfig, LivenessPlan};
use crate::feed::RouteInputs;
use crate::membership::{ensure_address_set, ensure_port_group};
use crate::nb::{NbClient, PolicyAction, RouterPolicy, WriteStats};
use crate::{AddressFamily, CoreError, ExternalIds, Owner, PerFamily, Result};
use egress_api::TrafficPolicy;
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, info, info_span, Instrument};

pub const LOCAL_POLICY_PRIORITY: i64 = 29100;
pub const GLOBAL_POLICY_PRIORITY: i64 = 29000;
pub const DROP_POLICY_PRIORITY: i64 = 28900;

/// Routing policy tier, by decreasing priority
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Local,
    Global,
    Drop,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Local, Tier::Global, Tier::Drop];

    pub fn priority(self) -> i64 {
        match self {
            Tier::Local => LOCAL_POLICY_PRIORITY,
            Tier::Global => GLOBAL_POLICY_PRIORITY,
            Tier::Drop => DROP_POLICY_PRIORITY,
        }
    }

    pub fn action(self) -> PolicyAction {
        match self {
            Tier::Local | Tier::Global => PolicyAction::Reroute,
            Tier::Drop => PolicyAction::Drop,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Global => write!(f, "global"),
            Tier::Drop => write!(f, "drop"),
        }
    }
}

/// Inputs of one address family
#[derive(Clone, Debug)]
pub struct FamilyInputs<'a> {
    pub family: AddressFamily,
    pub router: &'a str,
    pub traffic_policy: TrafficPolicy,
    /// Unset when liveness detection is disabled
    pub liveness: Option<&'a LivenessConfig>,
    pub next_hops: &'a BTreeMap<String, IpAddr>,
    pub sources: &'a BTreeSet<IpNetwork>,
    pub ports: &'a BTreeSet<String>,
    pub local_port_groups: &'a BTreeMap<String, String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FamilyOutcome {
    /// No ready next-hop, nothing was touched
    pub skipped: bool,
    pub stats: WriteStats,
}

/// Gateway settings shared by both families
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayTarget {
    pub router: String,
    pub traffic_policy: TrafficPolicy,
    pub liveness: PerFamily<Option<LivenessConfig>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GatewayOutcome {
    pub families: PerFamily<FamilyOutcome>,
}

impl GatewayOutcome {
    /// Whether neither family had a ready next-hop
    pub fn skipped(&self) -> bool {
        self.families.v4.skipped && self.families.v6.skipped
    }

    pub fn stats(&self) -> WriteStats {
        let mut stats = self.families.v4.stats;
        stats += self.families.v6.stats;
        stats
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct DesiredPolicy {
    next_hops: BTreeSet<String>,
    bfd_sessions: BTreeSet<String>,
}

/// Match expressions of one gateway and family
struct Matches {
    family: AddressFamily,
    port_group: String,
    address_set: String,
}

impl Matches {
    fn new(family: AddressFamily, port_group: &str, address_set: &str) -> Self {
        let ip = ip_prefix(family);
        Self {
            family,
            port_group: format!("{ip}.src == ${port_group}_{ip}"),
            address_set: format!("{ip}.src == ${address_set}"),
        }
    }

    fn global(&self) -> [String; 2] {
        [self.port_group.clone(), self.address_set.clone()]
    }

    /// Global matches narrowed to the sources attached to a node
    fn local(&self, local_port_group: &str) -> [String; 2] {
        let ip = ip_prefix(self.family);
        let local = format!("{ip}.src == ${local_port_group}_{ip}");
        [
            format!("{} && {}", local, self.port_group),
            format!("{} && {}", local, self.address_set),
        ]
    }
}

fn ip_prefix(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::V4 => "ip4",
        AddressFamily::V6 => "ip6",
    }
}

/// Reconciles the routing state owned by one gateway
pub struct PolicyReconciler<'a> {
    nb: &'a dyn NbClient,
    owner: &'a Owner,
}

impl<'a> PolicyReconciler<'a> {
    pub fn new(nb: &'a dyn NbClient, owner: &'a Owner) -> Self {
        Self { nb, owner }
    }

    /// Reconcile both families, IPv4 first.
    ///
    /// A failure aborts the pass; writes already issued, including those of
    /// a fully reconciled IPv4 family, stay in place.
    pub async fn reconcile(&self, target: &GatewayTarget, inputs: &RouteInputs) -> Result<GatewayOutcome> {
        let mut outcome = GatewayOutcome::default();
        for family in AddressFamily::ALL {
            let family_inputs = FamilyInputs {
                family,
                router: &target.router,
                traffic_policy: target.traffic_policy,
                liveness: target.liveness[family].as_ref(),
                next_hops: &inputs.next_hops[family],
                sources: &inputs.sources[family],
                ports: &inputs.ports,
                local_port_groups: &inputs.local_port_groups,
            };
            let span = info_span!("reconcile_family", gateway = %self.owner.key(), family = %family);
            outcome.families[family] = self.reconcile_family(&family_inputs).instrument(span).await?;
        }
        Ok(outcome)
    }

    pub async fn reconcile_family(&self, inputs: &FamilyInputs<'_>) -> Result<FamilyOutcome> {
        let family = inputs.family;
        if inputs.next_hops.is_empty() {
            debug!("No ready next-hop for {}, skipping", family);
            return Ok(FamilyOutcome {
                skipped: true,
                stats: WriteStats::default(),
            });
        }
        if let Some(ip) = inputs.next_hops.values().find(|ip| AddressFamily::of_ip(ip) != family) {
            return Err(CoreError::InvalidAddress(format!("next-hop {} is not {}", ip, family)));
        }
        if inputs.liveness.is_some_and(|l| l.port.is_empty()) {
            return Err(CoreError::Precondition(format!(
                "liveness is enabled but no {} monitoring port is available",
                family
            )));
        }

        let mut stats = WriteStats::default();
        let tag = self.owner.family_tag(family);
        let port_group = self.owner.port_group_name();
        let address_set = self.owner.address_set_name(family);

        ensure_port_group(self.nb, &port_group, &self.owner.tag(), inputs.ports, &mut stats).await?;
        let addresses: BTreeSet<String> = inputs.sources.iter().map(ToString::to_string).collect();
        ensure_address_set(self.nb, &address_set, &tag, &addresses, &mut stats).await?;

        let destinations: BTreeSet<IpAddr> = inputs.next_hops.values().copied().collect();
        let plan = reconcile_liveness(self.nb, &tag, inputs.liveness, &destinations, &mut stats).await?;

        let matches = Matches::new(family, &port_group, &address_set);

        let local = match inputs.traffic_policy {
            TrafficPolicy::Local => local_policies(inputs, &matches, &plan),
            TrafficPolicy::Cluster => BTreeMap::new(),
        };
        self.converge_tier(inputs.router, Tier::Local, &tag, local, &mut stats).await?;

        let balanced = DesiredPolicy {
            next_hops: destinations.iter().map(ToString::to_string).collect(),
            bfd_sessions: plan.sessions_for(&destinations),
        };
        let global = matches
            .global()
            .into_iter()
            .map(|m| (m, balanced.clone()))
            .collect();
        self.converge_tier(inputs.router, Tier::Global, &tag, global, &mut stats).await?;

        let drop = match inputs.liveness {
            Some(_) => matches
                .global()
                .into_iter()
                .map(|m| (m, DesiredPolicy::default()))
                .collect(),
            None => BTreeMap::new(),
        };
        self.converge_tier(inputs.router, Tier::Drop, &tag, drop, &mut stats).await?;

        // no policy references a stale session past this point
        for uuid in &plan.stale {
            info!("Deleting stale BFD session {}", uuid);
            self.nb.delete_bfd_session(uuid).await?;
            stats.deleted += 1;
        }

        info!(
            created = stats.created,
            updated = stats.updated,
            deleted = stats.deleted,
            "Reconciled {} routes of {}",
            family,
            self.owner
        );
        Ok(FamilyOutcome { skipped: false, stats })
    }

    /// Converge the policies of one tier towards `desired`, keyed by match.
    ///
    /// Existing policies are patched in place when only their next-hops or
    /// session references differ; policies with an unknown match, a
    /// duplicate match or the wrong action are deleted.
    async fn converge_tier(
        &self,
        router: &str,
        tier: Tier,
        tag: &ExternalIds,
        mut desired: BTreeMap<String, DesiredPolicy>,
        stats: &mut WriteStats,
    ) -> Result<()> {
        let existing = self.nb.list_router_policies(router, Some(tier.priority()), tag).await?;

        for policy in existing {
            let wanted = if policy.action == tier.action() {
                desired.remove(&policy.match_expr)
            } else {
                None
            };
            let Some(wanted) = wanted else {
                info!("Deleting {} policy {:?} ({})", tier, policy.match_expr, policy.uuid);
                self.nb.delete_router_policy(router, &policy.uuid).await?;
                stats.deleted += 1;
                continue;
            };
            if !policy.differs_from(&wanted.next_hops, &wanted.bfd_sessions) {
                debug!("{} policy {:?} up to date", tier, policy.match_expr);
                continue;
            }
            let next_hops: Vec<String> = wanted.next_hops.into_iter().collect();
            let bfd_sessions: Vec<String> = wanted.bfd_sessions.into_iter().collect();
            info!(next_hops = ?next_hops, "Updating {} policy {:?}", tier, policy.match_expr);
            self.nb.update_router_policy(&policy.uuid, &next_hops, &bfd_sessions).await?;
            stats.updated += 1;
        }

        for (match_expr, wanted) in desired {
            let policy = RouterPolicy {
                uuid: String::new(),
                priority: tier.priority(),
                match_expr,
                action: tier.action(),
                next_hops: wanted.next_hops.into_iter().collect(),
                bfd_sessions: wanted.bfd_sessions.into_iter().collect(),
                external_ids: tag.clone(),
            };
            let uuid = self.nb.create_router_policy(router, &policy).await?;
            info!(next_hops = ?policy.next_hops, "Created {} policy {:?} ({})", tier, policy.match_expr, uuid);
            stats.created += 1;
        }
        Ok(())
    }
}

/// Two policies per node with a next-hop, pinning the node's own sources to
/// its own replica. Nodes without a known local port group are left out.
fn local_policies(
    inputs: &FamilyInputs<'_>,
    matches: &Matches,
    plan: &LivenessPlan,
) -> BTreeMap<String, DesiredPolicy> {
    let mut desired = BTreeMap::new();
    for (node, next_hop) in inputs.next_hops {
        let Some(local_port_group) = inputs.local_port_groups.get(node) else {
            debug!("Node {} has no local port group, skipping local policies", node);
            continue;
        };
        let policy = DesiredPolicy {
            next_hops: BTreeSet::from([next_hop.to_string()]),
            bfd_sessions: plan.sessions_for([next_hop]),
        };
        for m in matches.local(local_port_group) {
            desired.insert(m, policy.clone());
        }
    }
    desired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ObjectKind, Operation, Write};
    use crate::{AddressSet, BfdParams, BfdSession, MemoryNb, PortGroup};

    const ROUTER: &str = "ovn-cluster";

    fn owner() -> Owner {
        Owner::new("vpc-egress-gateway", "default", "gw1")
    }

    fn inputs(next_hops: &[(&str, &str)], sources: &[&str]) -> RouteInputs {
        let mut inputs = RouteInputs {
            attachment_network: "default/ext".to_string(),
            ..Default::default()
        };
        for (node, ip) in next_hops {
            let ip: IpAddr = ip.parse().unwrap();
            inputs.next_hops[AddressFamily::of_ip(&ip)].insert(node.to_string(), ip);
            inputs
                .local_port_groups
                .insert(node.to_string(), format!("node.{}", node));
        }
        for source in sources {
            let network: IpNetwork = source.parse().unwrap();
            inputs.sources[AddressFamily::of_network(&network)].insert(network);
        }
        inputs
    }

    fn target(traffic_policy: TrafficPolicy, liveness: bool) -> GatewayTarget {
        let config = LivenessConfig {
            port: "lrp-bfd".to_string(),
            params: BfdParams::default(),
        };
        GatewayTarget {
            router: ROUTER.to_string(),
            traffic_policy,
            liveness: PerFamily::new(liveness.then(|| config.clone()), liveness.then_some(config)),
        }
    }

    fn tier(nb: &MemoryNb, tier: Tier) -> Vec<RouterPolicy> {
        nb.policies(ROUTER)
            .into_iter()
            .filter(|p| p.priority == tier.priority())
            .collect()
    }

    async fn run(nb: &MemoryNb, target: &GatewayTarget, inputs: &RouteInputs) -> GatewayOutcome {
        let owner = owner();
        PolicyReconciler::new(nb, &owner).reconcile(target, inputs).await.unwrap()
    }

    #[tokio::test]
    async fn test_cluster_without_liveness() {
        let nb = MemoryNb::new();
        let hash = owner().short_hash();

        run(&nb, &target(TrafficPolicy::Cluster, false), &inputs(&[("nodeA", "10.0.0.5")], &["192.168.1.0/24"])).await;

        let sets = nb.address_sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].name, format!("AS.{}.ipv4", hash));
        assert_eq!(sets[0].addresses, vec!["192.168.1.0/24"]);
        assert!(nb.bfd_sessions().is_empty());
        assert!(tier(&nb, Tier::Local).is_empty());
        assert!(tier(&nb, Tier::Drop).is_empty());

        let global = tier(&nb, Tier::Global);
        assert_eq!(global.len(), 2);
        let matches: BTreeSet<&str> = global.iter().map(|p| p.match_expr.as_str()).collect();
        assert!(matches.contains(format!("ip4.src == $PG.{}_ip4", hash).as_str()));
        assert!(matches.contains(format!("ip4.src == $AS.{}.ipv4", hash).as_str()));
        for policy in &global {
            assert_eq!(policy.action, PolicyAction::Reroute);
            assert_eq!(policy.next_hops, vec!["10.0.0.5"]);
            assert!(policy.bfd_sessions.is_empty());
        }
    }

    #[tokio::test]
    async fn test_cluster_with_liveness() {
        let nb = MemoryNb::new();

        run(&nb, &target(TrafficPolicy::Cluster, true), &inputs(&[("nodeA", "10.0.0.5")], &["192.168.1.0/24"])).await;

        let sessions = nb.bfd_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].logical_port, "lrp-bfd");
        assert_eq!(sessions[0].dst_ip, "10.0.0.5");

        let global = tier(&nb, Tier::Global);
        assert_eq!(global.len(), 2);
        assert!(global.iter().all(|p| p.bfd_sessions == vec![sessions[0].uuid.clone()]));

        let drop = tier(&nb, Tier::Drop);
        assert_eq!(drop.len(), 2);
        for policy in &drop {
            assert_eq!(policy.action, PolicyAction::Drop);
            assert!(policy.next_hops.is_empty());
            assert!(policy.bfd_sessions.is_empty());
        }
    }

    #[tokio::test]
    async fn test_local_policies_per_node() {
        let nb = MemoryNb::new();

        run(
            &nb,
            &target(TrafficPolicy::Local, true),
            &inputs(&[("nodeA", "10.0.0.5"), ("nodeB", "10.0.0.6")], &["192.168.1.0/24"]),
        )
        .await;

        let sessions: BTreeMap<String, String> = nb
            .bfd_sessions()
            .into_iter()
            .map(|s| (s.dst_ip, s.uuid))
            .collect();
        let local = tier(&nb, Tier::Local);
        assert_eq!(local.len(), 4);
        for (node, ip) in [("nodeA", "10.0.0.5"), ("nodeB", "10.0.0.6")] {
            let own: Vec<&RouterPolicy> = local
                .iter()
                .filter(|p| p.match_expr.starts_with(&format!("ip4.src == $node.{}_ip4 && ", node)))
                .collect();
            assert_eq!(own.len(), 2);
            for policy in own {
                assert_eq!(policy.next_hops, vec![ip]);
                assert_eq!(policy.bfd_sessions, vec![sessions[ip].clone()]);
            }
        }

        let global = tier(&nb, Tier::Global);
        assert_eq!(global.len(), 2);
        assert!(global.iter().all(|p| p.next_hops == vec!["10.0.0.5", "10.0.0.6"]));
        assert!(global.iter().all(|p| p.bfd_sessions.len() == 2));
    }

    #[tokio::test]
    async fn test_second_pass_writes_nothing() {
        let nb = MemoryNb::new();
        let target = target(TrafficPolicy::Local, true);
        let mut inputs = inputs(
            &[("nodeA", "10.0.0.5"), ("nodeB", "10.0.0.6"), ("nodeA", "fd00::5")],
            &["192.168.1.0/24", "10.1.0.0/16", "fd00:10::/64"],
        );
        inputs.ports = ["pod1.default".to_string(), "pod2.default".to_string()].into();

        let first = run(&nb, &target, &inputs).await;
        assert!(first.stats().total() > 0);
        nb.clear_writes();

        let second = run(&nb, &target, &inputs).await;
        assert_eq!(second.stats().total(), 0);
        assert!(nb.writes().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_objects_untouched() {
        let nb = MemoryNb::new();
        let other = Owner::new("vpc-egress-gateway", "default", "gw2");
        for t in Tier::ALL {
            nb.insert_policy(
                ROUTER,
                RouterPolicy {
                    uuid: format!("foreign-{}", t),
                    priority: t.priority(),
                    match_expr: "ip4.src == $AS.foreign.ipv4".to_string(),
                    action: t.action(),
                    next_hops: vec!["10.9.9.9".to_string()],
                    bfd_sessions: vec![],
                    external_ids: other.family_tag(AddressFamily::V4),
                },
            );
        }
        nb.insert_bfd_session(BfdSession {
            uuid: "foreign-bfd".to_string(),
            logical_port: "lrp-bfd".to_string(),
            dst_ip: "10.0.0.5".to_string(),
            params: BfdParams::default(),
            external_ids: other.family_tag(AddressFamily::V4),
        });
        nb.insert_port_group(PortGroup {
            uuid: "foreign-pg".to_string(),
            name: other.port_group_name(),
            ports: vec!["pod9.default".to_string()],
            external_ids: other.tag(),
        });
        let before = nb.policies(ROUTER);

        run(&nb, &target(TrafficPolicy::Local, true), &inputs(&[("nodeA", "10.0.0.5")], &["192.168.1.0/24"])).await;

        for foreign in &before {
            assert!(nb.policies(ROUTER).contains(foreign));
        }
        assert!(nb.bfd_sessions().iter().any(|s| s.uuid == "foreign-bfd"));
        assert!(nb.port_groups().iter().any(|pg| pg.ports == vec!["pod9.default"]));
        assert!(nb.writes().iter().all(|w| !w.id.starts_with("foreign")));
    }

    #[tokio::test]
    async fn test_same_name_foreign_objects_rejected() {
        let owner = owner();
        let foreign_ids = ExternalIds::from([("vendor".to_string(), "someone-else".to_string())]);
        let target = target(TrafficPolicy::Cluster, false);
        let inputs = inputs(&[("nodeA", "10.0.0.5")], &["192.168.1.0/24"]);

        // untagged port group under the gateway's own name
        let nb = MemoryNb::new();
        let group = PortGroup {
            uuid: "foreign-pg".to_string(),
            name: owner.port_group_name(),
            ports: vec![],
            external_ids: ExternalIds::new(),
        };
        nb.insert_port_group(group.clone());

        let err = PolicyReconciler::new(&nb, &owner)
            .reconcile(&target, &inputs)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ForeignObject { .. }));
        assert_eq!(nb.port_groups(), vec![group]);
        assert!(nb.writes().is_empty());
        assert!(nb.policies(ROUTER).is_empty());

        // differently tagged address set under the gateway's own name
        let nb = MemoryNb::new();
        let set = AddressSet {
            uuid: "foreign-as".to_string(),
            name: owner.address_set_name(AddressFamily::V4),
            addresses: vec!["10.9.0.0/16".to_string()],
            external_ids: foreign_ids,
        };
        nb.insert_address_set(set.clone());

        let err = PolicyReconciler::new(&nb, &owner)
            .reconcile(&target, &inputs)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "ForeignObject");
        assert_eq!(nb.address_sets(), vec![set]);
        assert!(nb.writes().iter().all(|w| w.kind != ObjectKind::AddressSet));
        assert!(nb.policies(ROUTER).is_empty());
    }

    #[tokio::test]
    async fn test_toggle_local_and_back() {
        let nb = MemoryNb::new();
        let inputs = inputs(&[("nodeA", "10.0.0.5"), ("nodeB", "10.0.0.6")], &["192.168.1.0/24"]);
        run(&nb, &target(TrafficPolicy::Cluster, false), &inputs).await;
        let global = tier(&nb, Tier::Global);
        nb.clear_writes();

        run(&nb, &target(TrafficPolicy::Local, false), &inputs).await;
        let writes = nb.writes();
        assert_eq!(writes.len(), 4);
        assert!(writes
            .iter()
            .all(|w| w.op == Operation::Create && w.kind == ObjectKind::RouterPolicy));
        assert_eq!(tier(&nb, Tier::Local).len(), 4);
        assert_eq!(tier(&nb, Tier::Global), global);
        nb.clear_writes();

        run(&nb, &target(TrafficPolicy::Cluster, false), &inputs).await;
        let writes = nb.writes();
        assert_eq!(writes.len(), 4);
        assert!(writes.iter().all(|w| w.op == Operation::Delete));
        assert!(tier(&nb, Tier::Local).is_empty());
        assert_eq!(tier(&nb, Tier::Global), global);
    }

    #[tokio::test]
    async fn test_disabling_liveness_drops_references_first() {
        let nb = MemoryNb::new();
        let inputs = inputs(&[("nodeA", "10.0.0.5"), ("nodeB", "10.0.0.6")], &["192.168.1.0/24"]);
        run(&nb, &target(TrafficPolicy::Local, true), &inputs).await;
        nb.clear_writes();

        run(&nb, &target(TrafficPolicy::Local, false), &inputs).await;

        assert!(nb.bfd_sessions().is_empty());
        assert!(tier(&nb, Tier::Drop).is_empty());
        assert!(nb.policies(ROUTER).iter().all(|p| p.bfd_sessions.is_empty()));

        let writes = nb.writes();
        let first_session_delete = writes
            .iter()
            .position(|w| w.kind == ObjectKind::BfdSession)
            .unwrap();
        assert!(writes[..first_session_delete]
            .iter()
            .all(|w| w.kind == ObjectKind::RouterPolicy));
        assert!(writes[first_session_delete..]
            .iter()
            .all(|w| *w == Write { op: Operation::Delete, kind: ObjectKind::BfdSession, id: w.id.clone() }));
        assert_eq!(writes.len() - first_session_delete, 2);
    }

    #[tokio::test]
    async fn test_removed_next_hop() {
        let nb = MemoryNb::new();
        let target = target(TrafficPolicy::Local, true);
        run(&nb, &target, &inputs(&[("nodeA", "10.0.0.5"), ("nodeB", "10.0.0.6")], &["192.168.1.0/24"])).await;
        let node_a: Vec<RouterPolicy> = tier(&nb, Tier::Local)
            .into_iter()
            .filter(|p| p.next_hops == vec!["10.0.0.5"])
            .collect();
        nb.clear_writes();

        run(&nb, &target, &inputs(&[("nodeA", "10.0.0.5")], &["192.168.1.0/24"])).await;

        assert_eq!(tier(&nb, Tier::Local), node_a);
        let sessions = nb.bfd_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].dst_ip, "10.0.0.5");
        assert!(tier(&nb, Tier::Global).iter().all(|p| p.next_hops == vec!["10.0.0.5"]));
        assert!(nb.writes().iter().all(|w| node_a.iter().all(|p| p.uuid != w.id)));
    }

    #[tokio::test]
    async fn test_no_next_hop_is_skipped() {
        let nb = MemoryNb::new();

        let outcome = run(&nb, &target(TrafficPolicy::Cluster, true), &inputs(&[], &["192.168.1.0/24"])).await;

        assert!(outcome.skipped());
        assert!(nb.writes().is_empty());
    }

    #[tokio::test]
    async fn test_failed_family_keeps_other_family() {
        let nb = MemoryNb::new();
        let owner = owner();
        let mut target = target(TrafficPolicy::Cluster, true);
        target.liveness.v4 = None;
        let inputs = inputs(&[("nodeA", "10.0.0.5"), ("nodeA", "fd00::5")], &["192.168.1.0/24", "fd00:10::/64"]);

        nb.fail_next(Operation::Create, ObjectKind::BfdSession);
        let err = PolicyReconciler::new(&nb, &owner)
            .reconcile(&target, &inputs)
            .await
            .unwrap_err();
        assert!(!err.is_precondition());

        let v4_global: Vec<RouterPolicy> = tier(&nb, Tier::Global)
            .into_iter()
            .filter(|p| p.match_expr.starts_with("ip4"))
            .collect();
        assert_eq!(v4_global.len(), 2);
        nb.clear_writes();

        let outcome = run(&nb, &target, &inputs).await;
        assert_eq!(outcome.families.v4.stats.total(), 0);
        assert!(outcome.families.v6.stats.created > 0);
        assert_eq!(tier(&nb, Tier::Global).len(), 4);
    }

    #[tokio::test]
    async fn test_liveness_without_port_fails_before_writes() {
        let nb = MemoryNb::new();
        let owner = owner();
        let mut target = target(TrafficPolicy::Cluster, true);
        target.liveness.v4 = Some(LivenessConfig {
            port: String::new(),
            params: BfdParams::default(),
        });

        let err = PolicyReconciler::new(&nb, &owner)
            .reconcile(&target, &inputs(&[("nodeA", "10.0.0.5")], &["192.168.1.0/24"]))
            .await
            .unwrap_err();

        assert!(err.is_precondition());
        assert!(nb.writes().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_policies_replaced() {
        let nb = MemoryNb::new();
        let owner = owner();
        let tag = owner.family_tag(AddressFamily::V4);
        let hash = owner.short_hash();
        let canonical = format!("ip4.src == $AS.{}.ipv4", hash);
        let seeded = [
            ("dup-1", canonical.clone(), PolicyAction::Reroute),
            ("dup-2", canonical.clone(), PolicyAction::Reroute),
            ("stray", "ip4.src == 10.0.0.0/8".to_string(), PolicyAction::Reroute),
            ("wrong-action", format!("ip4.src == $PG.{}_ip4", hash), PolicyAction::Allow),
        ];
        for (uuid, match_expr, action) in seeded {
            nb.insert_policy(
                ROUTER,
                RouterPolicy {
                    uuid: uuid.to_string(),
                    priority: GLOBAL_POLICY_PRIORITY,
                    match_expr,
                    action,
                    next_hops: vec!["10.0.0.5".to_string()],
                    bfd_sessions: vec![],
                    external_ids: tag.clone(),
                },
            );
        }

        run(&nb, &target(TrafficPolicy::Cluster, false), &inputs(&[("nodeA", "10.0.0.5")], &["192.168.1.0/24"])).await;

        let global = tier(&nb, Tier::Global);
        assert_eq!(global.len(), 2);
        assert!(global.iter().all(|p| p.action == PolicyAction::Reroute));
        assert_eq!(global.iter().filter(|p| p.match_expr == canonical).count(), 1);
        assert!(global.iter().all(|p| p.uuid != "stray" && p.uuid != "wrong-action"));
    }

    #[test]
    fn test_match_expressions() {
        let matches = Matches::new(AddressFamily::V6, "PG.abc", "AS.abc.ipv6");
        assert_eq!(matches.global(), ["ip6.src == $PG.abc_ip6".to_string(), "ip6.src == $AS.abc.ipv6".to_string()]);
        assert_eq!(
            matches.local("node.n1"),
            [
                "ip6.src == $node.n1_ip6 && ip6.src == $PG.abc_ip6".to_string(),
                "ip6.src == $node.n1_ip6 && ip6.src == $AS.abc.ipv6".to_string(),
            ]
        );
    }

    #[test]
    fn test_tier_order() {
        assert!(Tier::Local.priority() > Tier::Global.priority());
        assert!(Tier::Global.priority() > Tier::Drop.priority());
        assert_eq!(Tier::Drop.action(), PolicyAction::Drop);
    }
}
