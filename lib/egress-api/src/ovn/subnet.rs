use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Subnet - a logical switch with its address range
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kubeovn.io",
    version = "v1",
    kind = "Subnet",
    plural = "subnets",
    derive = "Default",
    status = "SubnetStatus",
)]
#[serde(rename_all = "camelCase")]
pub struct SubnetSpec {
    /// CIDR block(s), comma separated for dual stack
    #[serde(default)]
    pub cidr_block: String,

    /// Gateway IP(s), comma separated for dual stack
    #[serde(default)]
    pub gateway: String,

    /// Provider, "<nad>.<namespace>[.ovn]" for attachment networks
    #[serde(default)]
    pub provider: String,

    /// VPC the subnet belongs to
    #[serde(default)]
    pub vpc: String,
}

/// Status of a Subnet
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct SubnetStatus {
    #[serde(default)]
    pub conditions: Vec<SubnetCondition>,
}

/// Subnet condition
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct SubnetCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Subnet {
    /// Whether validation of the subnet explicitly failed
    pub fn is_not_validated(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.type_ == "Validated" && c.status == "False")
            })
            .unwrap_or(false)
    }

    /// Network attachment name "<namespace>/<name>" derived from the provider
    pub fn attachment_network(&self) -> Option<String> {
        let mut parts = self.spec.provider.split('.');
        match (parts.next(), parts.next()) {
            (Some(name), Some(namespace)) if !name.is_empty() && !namespace.is_empty() => {
                Some(format!("{}/{}", namespace, name))
            }
            _ => None,
        }
    }
}
