//! Ownership tagging of northbound objects
//!
//! Every object the engine creates carries the owner's tag in its
//! `external_ids`. Listing by tag is the only way the engine discovers the
//! objects it owns, so two gateways never touch each other's objects.

use crate::AddressFamily;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

pub type ExternalIds = BTreeMap<String, String>;

/// External-id key naming the controller that owns an object
pub const EXTERNAL_ID_VENDOR: &str = "vendor";
/// External-id key holding the address family an object belongs to
pub const EXTERNAL_ID_FAMILY: &str = "af";
/// Value of the vendor external id
pub const VENDOR: &str = "kube-ovn";

const SHORT_HASH_LEN: usize = 12;

/// Identity of a gateway owning northbound objects
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Owner {
    /// External-id key for the owning resource kind, e.g. "vpc-egress-gateway"
    kind: &'static str,
    /// "namespace/name"
    key: String,
}

impl Owner {
    pub fn new(kind: &'static str, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            key: format!("{}/{}", namespace, name),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Tag matching every object of this owner, regardless of family
    pub fn tag(&self) -> ExternalIds {
        let mut ids = ExternalIds::new();
        ids.insert(EXTERNAL_ID_VENDOR.to_string(), VENDOR.to_string());
        ids.insert(self.kind.to_string(), self.key.clone());
        ids
    }

    /// Tag of the objects this owner keeps for one address family
    pub fn family_tag(&self, family: AddressFamily) -> ExternalIds {
        let mut ids = self.tag();
        ids.insert(EXTERNAL_ID_FAMILY.to_string(), family.number().to_string());
        ids
    }

    /// Hash of "kind/namespace/name", so owners of different kinds never
    /// share a port group or address set name
    pub fn short_hash(&self) -> String {
        short_hash(&format!("{}/{}", self.kind, self.key))
    }

    /// Name of the port group shared by both families
    pub fn port_group_name(&self) -> String {
        format!("PG.{}", self.short_hash())
    }

    /// Name of the per-family address set
    pub fn address_set_name(&self, family: AddressFamily) -> String {
        format!("AS.{}.{}", self.short_hash(), family)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

/// Truncated hex SHA-256 of the input
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(SHORT_HASH_LEN);
    hash
}

/// Whether `external_ids` carries every entry of `tag`
pub fn is_tagged(external_ids: &ExternalIds, tag: &ExternalIds) -> bool {
    tag.iter().all(|(k, v)| external_ids.get(k) == Some(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_deterministic() {
        let a = Owner::new("vpc-egress-gateway", "default", "gw1");
        let b = Owner::new("vpc-egress-gateway", "default", "gw1");
        assert_eq!(a.port_group_name(), b.port_group_name());
        assert_eq!(a.address_set_name(AddressFamily::V4), b.address_set_name(AddressFamily::V4));

        let hash = a.short_hash();
        assert_eq!(hash.len(), 12);
        assert_eq!(a.port_group_name(), format!("PG.{}", hash));
        assert_eq!(a.address_set_name(AddressFamily::V6), format!("AS.{}.ipv6", hash));
    }

    #[test]
    fn test_names_differ_per_gateway() {
        let a = Owner::new("vpc-egress-gateway", "default", "gw1");
        let b = Owner::new("vpc-egress-gateway", "default", "gw2");
        let c = Owner::new("vpc-egress-gateway", "other", "gw1");
        let d = Owner::new("vpc-nat-gateway", "default", "gw1");
        assert_ne!(a.port_group_name(), b.port_group_name());
        assert_ne!(a.port_group_name(), c.port_group_name());
        assert_ne!(a.port_group_name(), d.port_group_name());
        assert_ne!(a.address_set_name(AddressFamily::V4), d.address_set_name(AddressFamily::V4));
    }

    #[test]
    fn test_short_hash_known_value() {
        let full = hex::encode(Sha256::digest(b"vpc-egress-gateway/default/gw1"));
        assert_eq!(short_hash("vpc-egress-gateway/default/gw1"), full[..12]);
        assert_eq!(Owner::new("vpc-egress-gateway", "default", "gw1").short_hash(), full[..12]);
    }

    #[test]
    fn test_tags() {
        let owner = Owner::new("vpc-egress-gateway", "default", "gw1");
        let tag = owner.tag();
        assert_eq!(tag.get("vendor").map(String::as_str), Some(VENDOR));
        assert_eq!(tag.get("vpc-egress-gateway").map(String::as_str), Some("default/gw1"));
        assert!(!tag.contains_key("af"));

        let v4 = owner.family_tag(AddressFamily::V4);
        assert_eq!(v4.get("af").map(String::as_str), Some("4"));
        assert!(is_tagged(&v4, &tag));
        assert!(!is_tagged(&tag, &v4));
        assert!(!is_tagged(&owner.family_tag(AddressFamily::V6), &v4));

        let other = Owner::new("vpc-egress-gateway", "default", "gw2");
        assert!(!is_tagged(&other.family_tag(AddressFamily::V4), &tag));
    }
}
