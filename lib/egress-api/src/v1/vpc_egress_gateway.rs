use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// VpcEgressGateway forwards egress traffic from a VPC to an external network
/// through a set of gateway replicas
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kubeovn.io",
    version = "v1",
    kind = "VpcEgressGateway",
    plural = "vpc-egress-gateways",
    shortname = "vpc-egress-gw",
    namespaced,
    derive = "Default",
)]
#[serde(rename_all = "camelCase")]
pub struct VpcEgressGatewaySpec {
    /// VPC the gateway serves; the default VPC is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vpc: Option<String>,

    /// Workload replicas
    #[serde(default)]
    pub replicas: i32,

    /// Name prefix of the generated workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Image used by the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Subnet the workload is attached to inside the VPC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_subnet: Option<String>,

    /// Subnet providing the external network attachment
    pub external_subnet: String,

    /// Fixed internal IPs of the replicas
    #[serde(default, rename = "internalIPs")]
    pub internal_ips: Vec<String>,

    /// Fixed external IPs of the replicas
    #[serde(default, rename = "externalIPs")]
    pub external_ips: Vec<String>,

    /// How traffic is spread across the replicas
    #[serde(default)]
    pub traffic_policy: TrafficPolicy,

    /// Liveness detection between the VPC router and the replicas
    #[serde(default)]
    pub bfd: BfdConfig,

    /// Source CIDRs/subnets forwarded through the gateway
    #[serde(default)]
    pub policies: Vec<EgressPolicy>,

    /// Pods forwarded through the gateway, by namespace and pod labels
    #[serde(default)]
    pub selectors: Vec<EgressSelector>,

    /// Nodes the workload may run on
    #[serde(default)]
    pub node_selector: Vec<GatewayNodeSelector>,
}

/// Traffic policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum TrafficPolicy {
    /// Balance across all replicas
    #[default]
    Cluster,
    /// Prefer the replica running on the source's node
    Local,
}

/// BFD configuration
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct BfdConfig {
    /// Whether to establish BFD sessions with the replicas
    #[serde(default)]
    pub enabled: bool,

    /// Minimum receive interval (ms)
    #[serde(default = "default_bfd_interval", rename = "minRX")]
    pub min_rx: i32,

    /// Minimum transmit interval (ms)
    #[serde(default = "default_bfd_interval", rename = "minTX")]
    pub min_tx: i32,

    /// Detection multiplier
    #[serde(default = "default_bfd_multiplier")]
    pub multiplier: i32,
}

impl Default for BfdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_rx: default_bfd_interval(),
            min_tx: default_bfd_interval(),
            multiplier: default_bfd_multiplier(),
        }
    }
}

/// Egress policy selecting sources by address
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressPolicy {
    /// Masquerade traffic leaving the gateway
    #[serde(default)]
    pub snat: bool,

    /// Source CIDRs
    #[serde(default)]
    pub ip_blocks: Vec<String>,

    /// Source subnets, by name
    #[serde(default)]
    pub subnets: Vec<String>,
}

/// Egress selector choosing source pods by labels
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressSelector {
    /// Namespaces to select pods from; an empty selector matches every
    /// namespace and an absent one none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Pods to select within the matched namespaces, with the same
    /// empty/absent semantics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<LabelSelector>,
}

/// Node placement term
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayNodeSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default)]
    pub match_expressions: Vec<NodeSelectorRequirement>,

    #[serde(default)]
    pub match_fields: Vec<NodeSelectorRequirement>,
}

impl VpcEgressGatewaySpec {
    /// VPC name, falling back to the given default
    pub fn vpc_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.vpc.as_deref() {
            Some(vpc) if !vpc.is_empty() => vpc,
            _ => default,
        }
    }
}

fn default_bfd_interval() -> i32 {
    1000
}

fn default_bfd_multiplier() -> i32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_defaults() {
        let spec: VpcEgressGatewaySpec = serde_json::from_value(json!({
            "externalSubnet": "ext",
            "policies": [{"snat": true, "ipBlocks": ["10.1.0.0/16"]}],
        }))
        .unwrap();

        assert_eq!(spec.traffic_policy, TrafficPolicy::Cluster);
        assert!(!spec.bfd.enabled);
        assert_eq!(spec.bfd.min_rx, 1000);
        assert_eq!(spec.bfd.multiplier, 3);
        assert_eq!(spec.policies[0].ip_blocks, vec!["10.1.0.0/16"]);
        assert_eq!(spec.vpc_or("ovn-cluster"), "ovn-cluster");
    }

    #[test]
    fn test_spec_field_names() {
        let spec: VpcEgressGatewaySpec = serde_json::from_value(json!({
            "vpc": "vpc1",
            "externalSubnet": "ext",
            "internalIPs": ["10.0.0.10"],
            "trafficPolicy": "Local",
            "bfd": {"enabled": true, "minRX": 300, "minTX": 200, "multiplier": 5},
        }))
        .unwrap();

        assert_eq!(spec.vpc_or("ovn-cluster"), "vpc1");
        assert_eq!(spec.internal_ips, vec!["10.0.0.10"]);
        assert_eq!(spec.traffic_policy, TrafficPolicy::Local);
        assert_eq!(spec.bfd.min_rx, 300);
        assert_eq!(spec.bfd.min_tx, 200);
        assert_eq!(spec.bfd.multiplier, 5);
    }
}
