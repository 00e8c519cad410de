//! VpcEgressGateway controller
//!
//! Every pass resolves the gateway's VPC, asks the route feed for next-hops
//! and sources, and converges the northbound routing state. Deletion is
//! gated by a finalizer that is only released once every owned northbound
//! object is gone.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::{Metrics, PassResult};
use egress_api::v1::{VpcEgressGatewaySpec, GATEWAY_LABEL};
use egress_api::{Vpc, VpcEgressGateway};
use egress_core::family::split_dual_stack;
use egress_core::{
    teardown, BfdParams, CoreError, FeedContext, GatewayOutcome, GatewayTarget, KeyMutex, LivenessConfig,
    NbClient, Owner, PerFamily, PolicyReconciler, RetryBackoff, RouteFeed,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::{self, Action, Controller};
use kube_runtime::finalizer::{finalizer, Event};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

pub const FINALIZER: &str = "kubeovn.io/egress-gateway-controller";
/// External-id key carrying the owning gateway
pub const OWNER_KIND: &str = "vpc-egress-gateway";

pub type GatewayFeed = dyn RouteFeed<Resource = VpcEgressGateway>;

/// Shared state of the reconcilers
pub struct Context {
    pub client: Client,
    pub nb: Arc<dyn NbClient>,
    pub feed: Arc<GatewayFeed>,
    pub config: Config,
    pub metrics: Metrics,
    pub locks: KeyMutex,
    pub backoff: RetryBackoff,
}

impl Context {
    pub fn new(client: Client, nb: Arc<dyn NbClient>, feed: Arc<GatewayFeed>, config: Config, metrics: Metrics) -> Self {
        let backoff = RetryBackoff::new(config.retry_base_delay, config.retry_max_delay);
        Self {
            client,
            nb,
            feed,
            config,
            metrics,
            locks: KeyMutex::new(),
            backoff,
        }
    }
}

/// Run the controller until a shutdown signal is received
pub async fn run(ctx: Arc<Context>) {
    let gateways: Api<VpcEgressGateway> = Api::all(ctx.client.clone());
    let pods: Api<Pod> = Api::all(ctx.client.clone());
    let config = controller::Config::default().concurrency(ctx.config.workers);

    info!("Starting VpcEgressGateway reconciliation with {} workers", ctx.config.workers);
    Controller::new(gateways, watcher::Config::default())
        .with_config(config)
        .watches(pods, watcher::Config::default().labels(GATEWAY_LABEL), gateway_of_pod)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((gateway, _)) => debug!("Reconciled VpcEgressGateway {}", gateway),
                Err(e) => debug!("Reconciliation stream error: {}", e),
            }
        })
        .await;
}

/// Gateway a workload pod belongs to
fn gateway_of_pod(pod: Pod) -> Option<ObjectRef<VpcEgressGateway>> {
    let name = pod.labels().get(GATEWAY_LABEL).filter(|name| !name.is_empty())?;
    let namespace = pod.namespace()?;
    Some(ObjectRef::new(name).within(&namespace))
}

fn owner_of(gateway: &VpcEgressGateway) -> Result<Owner> {
    let namespace = gateway.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let name = gateway.metadata.name.as_deref().ok_or(Error::MissingObjectKey("name"))?;
    Ok(Owner::new(OWNER_KIND, &namespace, name))
}

pub async fn reconcile(gateway: Arc<VpcEgressGateway>, ctx: Arc<Context>) -> Result<Action> {
    let owner = owner_of(&gateway)?;
    let key = owner.key().to_string();
    let namespace = gateway.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let api: Api<VpcEgressGateway> = Api::namespaced(ctx.client.clone(), &namespace);

    let guard = ctx.locks.lock(&key).await;
    let span = info_span!("reconcile", gateway = %key);
    let ctx_ref: &Context = &ctx;
    let owner_ref = &owner;
    let result = finalizer(&api, FINALIZER, gateway, |event| async move {
        match event {
            Event::Apply(gateway) => apply(&gateway, owner_ref, ctx_ref).await,
            Event::Cleanup(gateway) => cleanup(&gateway, owner_ref, ctx_ref).await,
        }
    })
    .instrument(span)
    .await
    .map_err(Error::from);
    drop(guard);
    ctx.locks.forget(&key);

    if result.is_ok() {
        ctx.backoff.forget(&key);
    }
    result
}

pub fn error_policy(gateway: Arc<VpcEgressGateway>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = format!("{}/{}", gateway.namespace().unwrap_or_default(), gateway.name_any());
    let delay = ctx.backoff.next_delay(&key);
    warn!(
        reason = error.reason(),
        failures = ctx.backoff.failures(&key),
        "Reconciling {} failed, retrying in {:?}: {}",
        key,
        delay,
        error
    );
    Action::requeue(delay)
}

async fn apply(gateway: &VpcEgressGateway, owner: &Owner, ctx: &Context) -> Result<Action> {
    let started = Instant::now();
    info!("Reconciling {}", owner);

    let vpc_name = gateway.spec.vpc_or(&ctx.config.cluster_router);
    let vpcs: Api<Vpc> = Api::all(ctx.client.clone());
    let result = match vpcs.get_opt(vpc_name).await {
        Ok(Some(vpc)) => converge(gateway, owner, &vpc, ctx.feed.as_ref(), ctx.nb.as_ref(), &ctx.config.cluster_router).await,
        Ok(None) => Err(CoreError::Precondition(format!("vpc {} not found", vpc_name)).into()),
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(outcome) => {
            ctx.metrics.record_writes(&outcome.stats());
            if outcome.skipped() {
                info!("No ready replica of {} yet", owner);
                ctx.metrics.record_pass(PassResult::Skipped, started.elapsed());
            } else {
                ctx.metrics.record_pass(PassResult::Success, started.elapsed());
            }
            Ok(Action::requeue(ctx.config.resync_interval))
        }
        Err(e) => {
            ctx.metrics.record_pass(PassResult::Error, started.elapsed());
            Err(e)
        }
    }
}

async fn cleanup(gateway: &VpcEgressGateway, owner: &Owner, ctx: &Context) -> Result<Action> {
    info!("Tearing down {}", owner);
    let vpc_name = gateway.spec.vpc_or(&ctx.config.cluster_router);
    let vpcs: Api<Vpc> = Api::all(ctx.client.clone());
    let router = match vpcs.get_opt(vpc_name).await? {
        Some(vpc) => router_of(&vpc).unwrap_or_else(|| vpc_name.to_string()),
        None => vpc_name.to_string(),
    };

    match teardown(ctx.nb.as_ref(), &router, owner).await {
        Ok(stats) => {
            ctx.metrics.record_writes(&stats);
            ctx.metrics.record_teardown(true);
            info!(deleted = stats.deleted, "Tore down {}", owner);
            Ok(Action::await_change())
        }
        Err(e) => {
            ctx.metrics.record_teardown(false);
            Err(e.into())
        }
    }
}

/// Run one pass against an already resolved VPC
pub async fn converge(
    gateway: &VpcEgressGateway,
    owner: &Owner,
    vpc: &Vpc,
    feed: &GatewayFeed,
    nb: &dyn NbClient,
    cluster_router: &str,
) -> Result<GatewayOutcome> {
    let target = gateway_target(&gateway.spec, vpc)?;
    let feed_ctx = FeedContext {
        vpc: gateway.spec.vpc_or(cluster_router).to_string(),
        router: target.router.clone(),
        traffic_policy: target.traffic_policy,
    };

    let inputs = feed.route_inputs(gateway, &feed_ctx).await?;
    debug!(
        attachment_network = %inputs.attachment_network,
        forward_sources = ?inputs.forward_sources,
        ports = inputs.ports.len(),
        "Computed route inputs of {}",
        owner
    );

    Ok(PolicyReconciler::new(nb, owner).reconcile(&target, &inputs).await?)
}

fn router_of(vpc: &Vpc) -> Option<String> {
    vpc.status
        .as_ref()
        .map(|status| status.router.clone())
        .filter(|router| !router.is_empty())
}

/// Router and per-family liveness settings of a gateway in `vpc`.
///
/// Liveness runs for a family only when the VPC's BFD port has an address
/// of that family.
pub fn gateway_target(spec: &VpcEgressGatewaySpec, vpc: &Vpc) -> Result<GatewayTarget> {
    let vpc_name = vpc.name_any();
    let router = router_of(vpc)
        .ok_or_else(|| CoreError::Precondition(format!("vpc {} has no logical router yet", vpc_name)))?;

    let mut liveness: PerFamily<Option<LivenessConfig>> = PerFamily::default();
    if spec.bfd.enabled {
        let bfd_port = vpc.status.as_ref().map(|status| &status.bfd_port);
        let Some(bfd_port) = bfd_port.filter(|port| port.is_ready()) else {
            return Err(CoreError::Precondition(format!(
                "VpcBfdPortNotEnabled: bfd port of vpc {} is not enabled or not ready",
                vpc_name
            ))
            .into());
        };
        let config = LivenessConfig {
            port: bfd_port.name.clone(),
            params: BfdParams {
                min_tx: spec.bfd.min_tx.into(),
                min_rx: spec.bfd.min_rx.into(),
                detect_mult: spec.bfd.multiplier.into(),
            },
        };
        let ips = split_dual_stack(&bfd_port.ip);
        for (family, family_ips) in ips.iter() {
            if !family_ips.is_empty() {
                liveness[family] = Some(config.clone());
            }
        }
    }

    Ok(GatewayTarget {
        router,
        traffic_policy: spec.traffic_policy,
        liveness,
    })
}
