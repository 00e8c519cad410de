//! Kubernetes-backed route feed
//!
//! Reads the gateway's workload pods, the subnets its policies refer to, the
//! pods its selectors match and the nodes running replicas, and turns them
//! into the per-family inputs of the policy reconciler.

use async_trait::async_trait;
use egress_api::ovn::Subnet;
use egress_api::v1::{
    EgressPolicy, EgressSelector, ALLOCATED_ANNOTATION, GATEWAY_LABEL, LOGICAL_ROUTER_ANNOTATION,
    PORT_NAME_ANNOTATION,
};
use egress_api::{TrafficPolicy, VpcEgressGateway};
use egress_core::{AddressFamily, CoreError, FeedContext, PerFamily, Result, RouteFeed, RouteInputs};
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::{Namespace, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::debug;

type Sources = PerFamily<BTreeSet<IpNetwork>>;

pub struct KubeFeed {
    client: Client,
}

impl KubeFeed {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn subnets(&self, policies: &[EgressPolicy]) -> Result<BTreeMap<String, Subnet>> {
        let api: Api<Subnet> = Api::all(self.client.clone());
        let mut subnets = BTreeMap::new();
        for name in policies.iter().flat_map(|p| p.subnets.iter()) {
            if subnets.contains_key(name) {
                continue;
            }
            match api.get_opt(name).await? {
                Some(subnet) => {
                    subnets.insert(name.clone(), subnet);
                }
                None => return Err(CoreError::Precondition(format!("subnet {} not found", name))),
            }
        }
        Ok(subnets)
    }

    async fn attachment_network(&self, external_subnet: &str) -> Result<String> {
        let api: Api<Subnet> = Api::all(self.client.clone());
        let subnet = api
            .get_opt(external_subnet)
            .await?
            .ok_or_else(|| CoreError::Precondition(format!("external subnet {} not found", external_subnet)))?;
        subnet.attachment_network().ok_or_else(|| {
            CoreError::Precondition(format!(
                "provider {:?} of subnet {} does not name a network attachment",
                subnet.spec.provider, external_subnet
            ))
        })
    }

    async fn workload_pods(&self, namespace: &str, name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&format!("{}={}", GATEWAY_LABEL, name));
        Ok(api.list(&params).await?.items)
    }

    async fn selected_pods(&self, selectors: &[EgressSelector]) -> Result<(Vec<Namespace>, Vec<Pod>)> {
        if selectors.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespaces = namespaces.list(&ListParams::default()).await?.items;

        let mut pods = Vec::new();
        for namespace in selected_namespaces(selectors, &namespaces)? {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            pods.extend(api.list(&ListParams::default()).await?.items);
        }
        Ok((namespaces, pods))
    }

    async fn local_port_groups<'a>(&self, nodes: impl Iterator<Item = &'a String>) -> Result<BTreeMap<String, String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let mut groups = BTreeMap::new();
        for name in nodes {
            match api.get_opt(name).await? {
                Some(node) => {
                    groups.insert(name.clone(), local_port_group(&node)?);
                }
                None => debug!("Node {} is gone, skipping its local port group", name),
            }
        }
        Ok(groups)
    }
}

#[async_trait]
impl RouteFeed for KubeFeed {
    type Resource = VpcEgressGateway;

    async fn route_inputs(&self, gateway: &VpcEgressGateway, ctx: &FeedContext) -> Result<RouteInputs> {
        let namespace = gateway
            .namespace()
            .ok_or_else(|| CoreError::Precondition("gateway has no namespace".to_string()))?;
        let name = gateway.name_any();
        let spec = &gateway.spec;
        if spec.policies.is_empty() && spec.selectors.is_empty() {
            return Err(CoreError::Precondition(format!(
                "gateway {}/{} has neither policies nor selectors",
                namespace, name
            )));
        }

        let attachment_network = self.attachment_network(&spec.external_subnet).await?;
        let subnets = self.subnets(&spec.policies).await?;
        let (sources, forward_sources) = egress_sources(&spec.policies, &subnets)?;

        let workload = self.workload_pods(&namespace, &name).await?;
        let next_hops = gateway_next_hops(&workload);

        let (namespaces, pods) = self.selected_pods(&spec.selectors).await?;
        let ports = selected_ports(&spec.selectors, &namespaces, &pods, &ctx.router)?;

        let local_port_groups = match ctx.traffic_policy {
            TrafficPolicy::Local => {
                let nodes: BTreeSet<&String> = next_hops.v4.keys().chain(next_hops.v6.keys()).collect();
                self.local_port_groups(nodes.into_iter()).await?
            }
            TrafficPolicy::Cluster => BTreeMap::new(),
        };

        Ok(RouteInputs {
            attachment_network,
            next_hops,
            sources,
            forward_sources,
            ports,
            local_port_groups,
        })
    }
}

/// Parse a comma separated list of CIDRs or bare addresses
fn parse_networks(value: &str) -> Result<Vec<IpNetwork>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNetwork>()
                .map_err(|e| CoreError::InvalidAddress(format!("{}: {}", s, e)))
        })
        .collect()
}

/// Source ranges of the gateway, as (all sources, forwarded without SNAT)
pub fn egress_sources(policies: &[EgressPolicy], subnets: &BTreeMap<String, Subnet>) -> Result<(Sources, Sources)> {
    let mut snat = Sources::default();
    let mut forward = Sources::default();

    for policy in policies {
        let target = if policy.snat { &mut snat } else { &mut forward };
        for block in &policy.ip_blocks {
            for network in parse_networks(block)? {
                target[AddressFamily::of_network(&network)].insert(network);
            }
        }
        for name in &policy.subnets {
            let subnet = subnets
                .get(name)
                .ok_or_else(|| CoreError::Precondition(format!("subnet {} not found", name)))?;
            if subnet.is_not_validated() {
                return Err(CoreError::Precondition(format!("subnet {} is not validated", name)));
            }
            for network in parse_networks(&subnet.spec.cidr_block)? {
                target[AddressFamily::of_network(&network)].insert(network);
            }
        }
    }

    let mut sources = forward.clone();
    for family in AddressFamily::ALL {
        sources[family].extend(snat[family].iter().copied());
    }
    Ok((sources, forward))
}

/// Whether a pod is neither terminating nor terminated
pub fn is_pod_alive(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    !matches!(phase, Some("Succeeded") | Some("Failed"))
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// Next-hop of every node running a ready replica: the replica's first IP of
/// each family. With several replicas on one node the first by name wins.
pub fn gateway_next_hops(pods: &[Pod]) -> PerFamily<BTreeMap<String, IpAddr>> {
    let mut pods: Vec<&Pod> = pods.iter().filter(|p| is_pod_alive(p) && is_pod_ready(p)).collect();
    pods.sort_by_key(|p| p.name_any());

    let mut next_hops: PerFamily<BTreeMap<String, IpAddr>> = PerFamily::default();
    for pod in pods {
        let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.as_ref()).filter(|n| !n.is_empty()) else {
            continue;
        };
        let ips = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ips.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|ip| ip.ip.parse::<IpAddr>().ok());
        for ip in ips {
            next_hops[AddressFamily::of_ip(&ip)].entry(node.clone()).or_insert(ip);
        }
    }
    next_hops
}

/// Match a label set against a selector. An absent selector matches nothing
/// and an empty one matches everything.
pub fn selector_matches(selector: Option<&LabelSelector>, labels: &BTreeMap<String, String>) -> Result<bool> {
    let Some(selector) = selector else {
        return Ok(false);
    };

    if let Some(match_labels) = &selector.match_labels {
        if match_labels.iter().any(|(k, v)| labels.get(k) != Some(v)) {
            return Ok(false);
        }
    }

    for requirement in selector.match_expressions.iter().flatten() {
        let value = labels.get(&requirement.key);
        let values = requirement.values.as_deref().unwrap_or_default();
        let matched = match requirement.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => value.map_or(true, |v| !values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            other => {
                return Err(CoreError::Precondition(format!(
                    "unsupported label selector operator {:?}",
                    other
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Names of the namespaces matched by any selector
pub fn selected_namespaces(selectors: &[EgressSelector], namespaces: &[Namespace]) -> Result<BTreeSet<String>> {
    let mut selected = BTreeSet::new();
    for namespace in namespaces {
        for selector in selectors {
            if selector_matches(selector.namespace_selector.as_ref(), namespace.labels())? {
                selected.insert(namespace.name_any());
                break;
            }
        }
    }
    Ok(selected)
}

/// Logical switch port of a selected pod, or `None` when the pod is not
/// attached to `router` or not allocated yet
pub fn member_port(pod: &Pod, router: &str) -> Option<String> {
    if pod.spec.as_ref().and_then(|s| s.host_network).unwrap_or(false) || !is_pod_alive(pod) {
        return None;
    }
    let annotations = pod.annotations();
    if annotations.get(LOGICAL_ROUTER_ANNOTATION).map(String::as_str) != Some(router)
        || annotations.get(ALLOCATED_ANNOTATION).map(String::as_str) != Some("true")
    {
        return None;
    }
    Some(format!("{}.{}", pod.name_any(), pod.namespace()?))
}

/// Ports of every pod matched by a selector
pub fn selected_ports(
    selectors: &[EgressSelector],
    namespaces: &[Namespace],
    pods: &[Pod],
    router: &str,
) -> Result<BTreeSet<String>> {
    let namespace_labels: BTreeMap<String, &BTreeMap<String, String>> =
        namespaces.iter().map(|ns| (ns.name_any(), ns.labels())).collect();

    let mut ports = BTreeSet::new();
    for pod in pods {
        let Some(labels) = pod.namespace().and_then(|ns| namespace_labels.get(&ns).copied()) else {
            continue;
        };
        for selector in selectors {
            if selector_matches(selector.namespace_selector.as_ref(), labels)?
                && selector_matches(selector.pod_selector.as_ref(), pod.labels())?
            {
                if let Some(port) = member_port(pod, router) {
                    ports.insert(port);
                }
                break;
            }
        }
    }
    Ok(ports)
}

/// Port group holding the join port of a node
pub fn local_port_group(node: &Node) -> Result<String> {
    node.annotations()
        .get(PORT_NAME_ANNOTATION)
        .filter(|name| !name.is_empty())
        .map(|name| name.replace('-', "."))
        .ok_or_else(|| {
            CoreError::Precondition(format!(
                "node {} has no {} annotation",
                node.name_any(),
                PORT_NAME_ANNOTATION
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use egress_api::ovn::SubnetSpec;
    use serde_json::json;

    fn pod(value: serde_json::Value) -> Pod {
        serde_json::from_value(value).unwrap()
    }

    fn replica(name: &str, node: &str, ips: &[&str], ready: bool) -> Pod {
        let ips: Vec<_> = ips.iter().map(|ip| json!({"ip": ip})).collect();
        let ready = if ready { "True" } else { "False" };
        pod(json!({
            "metadata": {"name": name, "namespace": "kube-system", "labels": {GATEWAY_LABEL: "gw1"}},
            "spec": {"nodeName": node, "containers": []},
            "status": {
                "phase": "Running",
                "podIPs": ips,
                "conditions": [{"type": "Ready", "status": ready}],
            },
        }))
    }

    fn workload(name: &str, namespace: &str, labels: serde_json::Value, router: &str) -> Pod {
        pod(json!({
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": labels,
                "annotations": {LOGICAL_ROUTER_ANNOTATION: router, ALLOCATED_ANNOTATION: "true"},
            },
            "spec": {"containers": []},
            "status": {"phase": "Running"},
        }))
    }

    fn namespace(name: &str, labels: serde_json::Value) -> Namespace {
        serde_json::from_value(json!({"metadata": {"name": name, "labels": labels}})).unwrap()
    }

    fn selector(value: serde_json::Value) -> EgressSelector {
        serde_json::from_value(value).unwrap()
    }

    fn subnet(name: &str, cidr: &str) -> Subnet {
        Subnet::new(
            name,
            SubnetSpec {
                cidr_block: cidr.to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_next_hops_from_ready_replicas() {
        let pods = vec![
            replica("gw1-b", "nodeB", &["10.0.0.6", "fd00::6"], true),
            replica("gw1-a", "nodeA", &["10.0.0.5", "fd00::5"], true),
            replica("gw1-c", "nodeC", &["10.0.0.7"], false),
            replica("gw1-d", "", &["10.0.0.8"], true),
        ];

        let next_hops = gateway_next_hops(&pods);
        assert_eq!(next_hops.v4.len(), 2);
        assert_eq!(next_hops.v4["nodeA"], "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(next_hops.v4["nodeB"], "10.0.0.6".parse::<IpAddr>().unwrap());
        assert_eq!(next_hops.v6["nodeA"], "fd00::5".parse::<IpAddr>().unwrap());
        assert!(!next_hops.v4.contains_key("nodeC"));
    }

    #[test]
    fn test_next_hops_first_replica_per_node_wins() {
        let pods = vec![
            replica("gw1-z", "nodeA", &["10.0.0.9"], true),
            replica("gw1-a", "nodeA", &["10.0.0.5"], true),
        ];
        let next_hops = gateway_next_hops(&pods);
        assert_eq!(next_hops.v4.len(), 1);
        assert_eq!(next_hops.v4["nodeA"], "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_terminating_replica_is_not_a_next_hop() {
        let mut terminating = replica("gw1-a", "nodeA", &["10.0.0.5"], true);
        terminating.metadata.deletion_timestamp = serde_json::from_value(json!("2024-05-01T10:00:00Z")).unwrap();
        assert!(gateway_next_hops(&[terminating]).v4.is_empty());
    }

    #[test]
    fn test_egress_sources() {
        let policies: Vec<EgressPolicy> = serde_json::from_value(json!([
            {"snat": true, "ipBlocks": ["192.168.1.0/24", "fd00:1::/64"]},
            {"snat": false, "ipBlocks": ["10.10.0.5"], "subnets": ["internal"]},
        ]))
        .unwrap();
        let mut subnets = BTreeMap::new();
        subnets.insert("internal".to_string(), subnet("internal", "10.20.0.0/16,fd00:20::/120"));

        let (sources, forward) = egress_sources(&policies, &subnets).unwrap();
        let v4: Vec<String> = sources.v4.iter().map(ToString::to_string).collect();
        assert_eq!(v4, vec!["10.10.0.5/32", "10.20.0.0/16", "192.168.1.0/24"]);
        assert_eq!(sources.v6.len(), 2);
        assert_eq!(forward.v4.len(), 2);
        assert_eq!(forward.v6.len(), 1);
        assert!(!forward.v4.contains(&"192.168.1.0/24".parse().unwrap()));
    }

    #[test]
    fn test_egress_sources_rejects_bad_input() {
        let policies: Vec<EgressPolicy> =
            serde_json::from_value(json!([{"snat": true, "ipBlocks": ["not-a-cidr"]}])).unwrap();
        let err = egress_sources(&policies, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidAddress(_)));

        let policies: Vec<EgressPolicy> = serde_json::from_value(json!([{"subnets": ["missing"]}])).unwrap();
        let err = egress_sources(&policies, &BTreeMap::new()).unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn test_selector_matches() {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "web".to_string());
        labels.insert("tier".to_string(), "front".to_string());

        let all = LabelSelector::default();
        assert!(selector_matches(Some(&all), &labels).unwrap());
        assert!(!selector_matches(None, &labels).unwrap());

        let by_label: LabelSelector = serde_json::from_value(json!({"matchLabels": {"app": "web"}})).unwrap();
        assert!(selector_matches(Some(&by_label), &labels).unwrap());

        let by_expr: LabelSelector = serde_json::from_value(json!({"matchExpressions": [
            {"key": "tier", "operator": "In", "values": ["front", "edge"]},
            {"key": "legacy", "operator": "DoesNotExist"},
        ]}))
        .unwrap();
        assert!(selector_matches(Some(&by_expr), &labels).unwrap());

        let not_in: LabelSelector = serde_json::from_value(json!({"matchExpressions": [
            {"key": "app", "operator": "NotIn", "values": ["web"]},
        ]}))
        .unwrap();
        assert!(!selector_matches(Some(&not_in), &labels).unwrap());

        let bad: LabelSelector = serde_json::from_value(json!({"matchExpressions": [
            {"key": "app", "operator": "Gt", "values": ["1"]},
        ]}))
        .unwrap();
        assert!(selector_matches(Some(&bad), &labels).is_err());
    }

    #[test]
    fn test_selected_ports() {
        let selectors = vec![selector(json!({
            "namespaceSelector": {"matchLabels": {"egress": "on"}},
            "podSelector": {"matchLabels": {"app": "web"}},
        }))];
        let namespaces = vec![
            namespace("team-a", json!({"egress": "on"})),
            namespace("team-b", json!({})),
        ];
        let mut host_network = workload("web-host", "team-a", json!({"app": "web"}), "ovn-cluster");
        host_network.spec.as_mut().unwrap().host_network = Some(true);
        let pods = vec![
            workload("web-1", "team-a", json!({"app": "web"}), "ovn-cluster"),
            workload("db-1", "team-a", json!({"app": "db"}), "ovn-cluster"),
            workload("web-2", "team-b", json!({"app": "web"}), "ovn-cluster"),
            workload("web-3", "team-a", json!({"app": "web"}), "vpc1"),
            host_network,
        ];

        assert_eq!(
            selected_namespaces(&selectors, &namespaces).unwrap(),
            BTreeSet::from(["team-a".to_string()])
        );
        let ports = selected_ports(&selectors, &namespaces, &pods, "ovn-cluster").unwrap();
        assert_eq!(ports, BTreeSet::from(["web-1.team-a".to_string()]));
    }

    #[test]
    fn test_custom_vpc_members_follow_gateway_router() {
        let selectors = vec![selector(json!({"namespaceSelector": {}, "podSelector": {}}))];
        let namespaces = vec![namespace("team-a", json!({}))];
        let pods = vec![
            workload("web-1", "team-a", json!({}), "ovn-cluster"),
            workload("web-2", "team-a", json!({}), "vpc1"),
        ];

        let ports = selected_ports(&selectors, &namespaces, &pods, "vpc1").unwrap();
        assert_eq!(ports, BTreeSet::from(["web-2.team-a".to_string()]));
    }

    #[test]
    fn test_unallocated_pod_is_not_a_member() {
        let mut pod = workload("web-1", "team-a", json!({}), "ovn-cluster");
        assert_eq!(member_port(&pod, "ovn-cluster").as_deref(), Some("web-1.team-a"));
        pod.annotations_mut().insert(ALLOCATED_ANNOTATION.to_string(), "false".to_string());
        assert_eq!(member_port(&pod, "ovn-cluster"), None);
    }

    #[test]
    fn test_local_port_group() {
        let node: Node = serde_json::from_value(json!({
            "metadata": {"name": "nodeA", "annotations": {PORT_NAME_ANNOTATION: "node-nodeA"}},
        }))
        .unwrap();
        assert_eq!(local_port_group(&node).unwrap(), "node.nodeA");

        let bare: Node = serde_json::from_value(json!({"metadata": {"name": "nodeB"}})).unwrap();
        assert!(local_port_group(&bare).unwrap_err().is_precondition());
    }
}
