//! Removal of everything a gateway owns

use crate::nb::{NbClient, WriteStats};
use crate::{CoreError, Owner, Result};
use tracing::{info, warn};

/// Delete every northbound object tagged with `owner`, across tiers and
/// families.
///
/// Policies go first so that no liveness session is still referenced when it
/// is deleted. A failed step does not stop the others; the failures are
/// reported together once everything else has been attempted.
pub async fn teardown(nb: &dyn NbClient, router: &str, owner: &Owner) -> Result<WriteStats> {
    let tag = owner.tag();
    let mut stats = WriteStats::default();
    let mut failures = Vec::new();

    match nb.list_router_policies(router, None, &tag).await {
        Ok(policies) => {
            for policy in policies {
                match nb.delete_router_policy(router, &policy.uuid).await {
                    Ok(()) => {
                        info!("Deleted policy {:?} of {}", policy.match_expr, owner);
                        stats.deleted += 1;
                    }
                    Err(e) => failures.push(format!("policy {}: {}", policy.uuid, e)),
                }
            }
        }
        Err(e) => failures.push(format!("listing policies: {}", e)),
    }

    match nb.list_bfd_sessions(&tag).await {
        Ok(sessions) => {
            for session in sessions {
                match nb.delete_bfd_session(&session.uuid).await {
                    Ok(()) => {
                        info!("Deleted BFD session {} of {}", session.dst_ip, owner);
                        stats.deleted += 1;
                    }
                    Err(e) => failures.push(format!("bfd session {}: {}", session.uuid, e)),
                }
            }
        }
        Err(e) => failures.push(format!("listing bfd sessions: {}", e)),
    }

    match nb.list_port_groups(&tag).await {
        Ok(groups) => {
            for group in groups {
                match nb.delete_port_group(&group.name).await {
                    Ok(()) => {
                        info!("Deleted port group {} of {}", group.name, owner);
                        stats.deleted += 1;
                    }
                    Err(e) => failures.push(format!("port group {}: {}", group.name, e)),
                }
            }
        }
        Err(e) => failures.push(format!("listing port groups: {}", e)),
    }

    match nb.list_address_sets(&tag).await {
        Ok(sets) => {
            for set in sets {
                match nb.delete_address_set(&set.name).await {
                    Ok(()) => {
                        info!("Deleted address set {} of {}", set.name, owner);
                        stats.deleted += 1;
                    }
                    Err(e) => failures.push(format!("address set {}: {}", set.name, e)),
                }
            }
        }
        Err(e) => failures.push(format!("listing address sets: {}", e)),
    }

    if failures.is_empty() {
        Ok(stats)
    } else {
        warn!("Teardown of {} incomplete: {} failure(s)", owner, failures.len());
        Err(CoreError::Teardown(failures))
    }
}
