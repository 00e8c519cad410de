/// Bindings to the network CRDs owned by the network controller
///
/// A gateway refers to a VPC (which names the logical router and its BFD
/// port) and to subnets (whose CIDRs become egress sources). These resources
/// are only ever read by the egress controller.

pub mod vpc;
pub mod subnet;

pub use vpc::{Vpc, VpcSpec, VpcStatus, BfdPortStatus};
pub use subnet::{Subnet, SubnetSpec, SubnetStatus};
