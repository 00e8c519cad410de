/// API version v1 for egress gateway CRDs

pub mod vpc_egress_gateway;

pub use vpc_egress_gateway::{
    BfdConfig, EgressPolicy, EgressSelector, GatewayNodeSelector, TrafficPolicy, VpcEgressGateway,
    VpcEgressGatewaySpec,
};

/// API group for egress gateway resources
pub const API_GROUP: &str = "kubeovn.io";
/// API version for egress gateway resources
pub const API_VERSION: &str = "v1";

/// Label carried by every pod of a gateway workload; the value is the gateway name
pub const GATEWAY_LABEL: &str = "ovn.kubernetes.io/vpc-egress-gateway";
/// Node annotation holding the name of the node's join port
pub const PORT_NAME_ANNOTATION: &str = "ovn.kubernetes.io/port_name";
/// Pod annotation naming the logical router the pod is attached to
pub const LOGICAL_ROUTER_ANNOTATION: &str = "ovn.kubernetes.io/logical_router";
/// Pod annotation set to "true" once the pod's addresses are allocated
pub const ALLOCATED_ANNOTATION: &str = "ovn.kubernetes.io/allocated";
