//! Port group and address set membership

use crate::nb::{NbClient, WriteStats};
use crate::tag::is_tagged;
use crate::{CoreError, ExternalIds, Result};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Ensure the port group `name` exists with exactly `ports` as members.
///
/// An existing group not carrying `external_ids` belongs to someone else and
/// is never written.
pub async fn ensure_port_group(
    nb: &dyn NbClient,
    name: &str,
    external_ids: &ExternalIds,
    ports: &BTreeSet<String>,
    stats: &mut WriteStats,
) -> Result<()> {
    let current = match nb.get_port_group(name).await? {
        Some(group) => {
            if !is_tagged(&group.external_ids, external_ids) {
                return Err(foreign("port group", name, external_ids));
            }
            group.ports
        }
        None => {
            info!(port_group = %name, "Creating port group");
            nb.create_port_group(name, external_ids).await?;
            stats.created += 1;
            Vec::new()
        }
    };

    if sorted(&current) == *ports {
        debug!(port_group = %name, "Port group membership up to date");
        return Ok(());
    }

    let desired: Vec<String> = ports.iter().cloned().collect();
    info!(port_group = %name, ports = desired.len(), "Updating port group membership");
    nb.set_port_group_ports(name, &desired).await?;
    stats.updated += 1;
    Ok(())
}

/// Ensure the address set `name` exists with exactly `addresses`, under the
/// same ownership rule as `ensure_port_group`
pub async fn ensure_address_set(
    nb: &dyn NbClient,
    name: &str,
    external_ids: &ExternalIds,
    addresses: &BTreeSet<String>,
    stats: &mut WriteStats,
) -> Result<()> {
    let current = match nb.get_address_set(name).await? {
        Some(set) => {
            if !is_tagged(&set.external_ids, external_ids) {
                return Err(foreign("address set", name, external_ids));
            }
            set.addresses
        }
        None => {
            info!(address_set = %name, "Creating address set");
            nb.create_address_set(name, external_ids).await?;
            stats.created += 1;
            Vec::new()
        }
    };

    if sorted(&current) == *addresses {
        debug!(address_set = %name, "Address set up to date");
        return Ok(());
    }

    let desired: Vec<String> = addresses.iter().cloned().collect();
    info!(address_set = %name, addresses = ?desired, "Updating address set");
    nb.set_address_set_addresses(name, &desired).await?;
    stats.updated += 1;
    Ok(())
}

fn foreign(kind: &'static str, name: &str, tag: &ExternalIds) -> CoreError {
    let owner: Vec<String> = tag.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    CoreError::ForeignObject {
        kind,
        name: name.to_string(),
        owner: owner.join(","),
    }
}

fn sorted(items: &[String]) -> BTreeSet<String> {
    items.iter().cloned().collect()
}
