use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// VPC - a logical router with its attached subnets
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kubeovn.io",
    version = "v1",
    kind = "Vpc",
    plural = "vpcs",
    derive = "Default",
    status = "VpcStatus",
)]
#[serde(rename_all = "camelCase")]
pub struct VpcSpec {
    /// Namespaces bound to this VPC
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Default subnet of the VPC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_subnet: Option<String>,
}

/// Status of a VPC
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VpcStatus {
    /// Name of the logical router backing the VPC
    #[serde(default)]
    pub router: String,

    /// Name of the default logical switch
    #[serde(default)]
    pub default_logical_switch: String,

    /// Router port terminating BFD sessions
    #[serde(default)]
    pub bfd_port: BfdPortStatus,
}

/// BFD logical router port of a VPC
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct BfdPortStatus {
    #[serde(default)]
    pub enabled: bool,

    /// Port IPs, comma separated for dual stack
    #[serde(default)]
    pub ip: String,

    /// Logical router port name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub nodes: Vec<String>,
}

impl BfdPortStatus {
    /// Whether the port is usable as a BFD endpoint
    pub fn is_ready(&self) -> bool {
        !self.ip.is_empty() && !self.name.is_empty()
    }
}
