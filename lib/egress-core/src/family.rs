//! Address families and per-family containers

use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use std::ops::{Index, IndexMut};

/// IP address family, reconciled independently of each other
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Both families, in reconciliation order
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    /// 4 or 6
    pub fn number(self) -> u8 {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 6,
        }
    }

    pub fn of_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn of_network(network: &IpNetwork) -> Self {
        match network {
            IpNetwork::V4(_) => AddressFamily::V4,
            IpNetwork::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipv{}", self.number())
    }
}

/// One value per address family
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerFamily<T> {
    pub v4: T,
    pub v6: T,
}

impl<T> PerFamily<T> {
    pub fn new(v4: T, v6: T) -> Self {
        Self { v4, v6 }
    }

    pub fn iter(&self) -> impl Iterator<Item = (AddressFamily, &T)> {
        [(AddressFamily::V4, &self.v4), (AddressFamily::V6, &self.v6)].into_iter()
    }
}

impl<T> Index<AddressFamily> for PerFamily<T> {
    type Output = T;

    fn index(&self, family: AddressFamily) -> &T {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }
}

impl<T> IndexMut<AddressFamily> for PerFamily<T> {
    fn index_mut(&mut self, family: AddressFamily) -> &mut T {
        match family {
            AddressFamily::V4 => &mut self.v4,
            AddressFamily::V6 => &mut self.v6,
        }
    }
}

/// Split a comma separated dual-stack string ("10.0.0.1,fd00::1") into its
/// IPv4 and IPv6 parts, ignoring entries of neither family
pub fn split_dual_stack(value: &str) -> PerFamily<Vec<String>> {
    let mut result: PerFamily<Vec<String>> = PerFamily::default();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let addr = item.split('/').next().unwrap_or(item);
        match addr.parse::<IpAddr>() {
            Ok(ip) => result[AddressFamily::of_ip(&ip)].push(item.to_string()),
            Err(_) => continue,
        }
    }
    result
}
