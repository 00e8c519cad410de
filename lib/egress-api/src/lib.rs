//! Egress gateway API types and CRDs for Kubernetes integration
//!
//! This library defines the custom resource reconciled by the egress controller:
//! - VpcEgressGateway: forwards egress traffic of selected VPC sources through
//!   a set of gateway replicas
//!
//! It also carries read-only bindings to the network resources a gateway
//! refers to (VPCs and subnets), which are owned by the network controller.

pub mod v1;
pub mod ovn;

pub use v1::{VpcEgressGateway, VpcEgressGatewaySpec, TrafficPolicy, BfdConfig, EgressPolicy, EgressSelector};
pub use ovn::{Vpc, Subnet};
