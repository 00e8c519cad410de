//! Liveness session manager

use crate::nb::{BfdParams, NbClient, WriteStats};
use crate::{CoreError, ExternalIds, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tracing::{debug, info};

/// Liveness monitoring of the next-hops of one address family
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Logical router port the sessions are bound to
    pub port: String,
    pub params: BfdParams,
}

/// Result of a liveness pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LivenessPlan {
    /// Session uuid kept or created for each desired destination
    pub active: BTreeMap<IpAddr, String>,
    /// Sessions to delete once no policy references them anymore
    pub stale: BTreeSet<String>,
}

impl LivenessPlan {
    /// Session uuids for the given next-hops, skipping those without one
    pub fn sessions_for<'a>(&self, next_hops: impl IntoIterator<Item = &'a IpAddr>) -> BTreeSet<String> {
        next_hops
            .into_iter()
            .filter_map(|ip| self.active.get(ip).cloned())
            .collect()
    }
}

/// Converge the sessions tagged with `tag` towards `destinations`.
///
/// With `liveness` unset every existing session is stale. Stale sessions are
/// only reported, never deleted here: the caller removes them after the
/// router policies stopped referencing them.
pub async fn reconcile_liveness(
    nb: &dyn NbClient,
    tag: &ExternalIds,
    liveness: Option<&LivenessConfig>,
    destinations: &BTreeSet<IpAddr>,
    stats: &mut WriteStats,
) -> Result<LivenessPlan> {
    if liveness.is_some_and(|config| config.port.is_empty()) {
        return Err(CoreError::Precondition(
            "liveness is enabled but the monitoring port is unknown".to_string(),
        ));
    }

    let mut plan = LivenessPlan::default();

    for session in nb.list_bfd_sessions(tag).await? {
        let Some(config) = liveness else {
            plan.stale.insert(session.uuid);
            continue;
        };
        if session.logical_port != config.port {
            debug!(uuid = %session.uuid, port = %session.logical_port, "BFD session bound to another port");
            plan.stale.insert(session.uuid);
            continue;
        }
        let dst = match session.dst_ip.parse::<IpAddr>() {
            Ok(dst) if destinations.contains(&dst) => dst,
            _ => {
                plan.stale.insert(session.uuid);
                continue;
            }
        };
        if plan.active.contains_key(&dst) {
            // duplicate session for the same next-hop
            plan.stale.insert(session.uuid);
            continue;
        }
        if session.params != config.params {
            info!(uuid = %session.uuid, dst = %dst, "Updating BFD session parameters");
            nb.update_bfd_session(&session.uuid, &config.params).await?;
            stats.updated += 1;
        }
        plan.active.insert(dst, session.uuid);
    }

    let Some(config) = liveness else {
        return Ok(plan);
    };
    for dst in destinations {
        if plan.active.contains_key(dst) {
            continue;
        }
        let session = nb
            .create_bfd_session(&config.port, &dst.to_string(), &config.params, tag)
            .await?;
        info!(uuid = %session.uuid, dst = %dst, port = %config.port, "Created BFD session");
        stats.created += 1;
        plan.active.insert(*dst, session.uuid);
    }

    Ok(plan)
}
