//! # Watch Loop
//!
//! Runs one controller per resource kind and keeps them running until
//! shutdown.
//!
//! - A ServiceInstance change also triggers the bindings that reference it
//! - A ServiceBinding change also triggers the instance it references, so a
//!   deletion blocked on bindings resumes as soon as the last one is gone
//! - Every object is reconciled again on each resync tick
//! - Watch stream errors are classified and backed off; a controller whose
//!   stream ends is restarted after a delay

use crate::config::SharedControllerConfig;
use crate::controller::reconciler::{ReconcileAction, Reconciler, ReconcilerError, ResourceKey};
use crate::controller::server::ServerState;
use crate::crd::{ServiceBinding, ServiceInstance};
use crate::observability::metrics;
use crate::runtime::error_policy::{
    handle_reconciliation_error, handle_watch_stream_error, reset_error_backoff,
};
use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, SinkExt, Stream, StreamExt};
use kube::api::Api;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::{self, Action};
use kube_runtime::reflector::{ObjectRef, Store};
use kube_runtime::{Controller, watcher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, info, info_span, warn};

/// Shortest resync period; a zero interval would spin
const MIN_RESYNC_INTERVAL: Duration = Duration::from_secs(1);

type ShutdownSignal = Shared<BoxFuture<'static, ()>>;
type ControllerResult<K> =
    Result<(ObjectRef<K>, Action), controller::Error<ReconcilerError, watcher::Error>>;

/// Resource kinds with their own controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    ServiceInstance,
    ServiceBinding,
}

impl ResourceKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ServiceInstance => "ServiceInstance",
            ResourceKind::ServiceBinding => "ServiceBinding",
        }
    }
}

/// Scheduling action for the outcome of a pass
#[must_use]
pub fn to_action(action: ReconcileAction) -> Action {
    match action {
        ReconcileAction::Done => Action::await_change(),
        ReconcileAction::Requeue { after, reason } => {
            metrics::increment_requeues(reason.as_str());
            Action::requeue(after)
        }
        ReconcileAction::RequeueNow => Action::requeue(Duration::ZERO),
    }
}

/// Run one pass for the object the controller handed us
async fn reconcile_object<K: Resource>(
    obj: Arc<K>,
    reconciler: Arc<Reconciler>,
    kind: ResourceKind,
) -> Result<Action, ReconcilerError> {
    let Some(key) = ResourceKey::from_resource(obj.as_ref()) else {
        warn!("Skipping {} without a namespace or name", kind.as_str());
        return Ok(Action::await_change());
    };
    let span = info_span!(
        "controller.watch.reconcile",
        resource.kind = kind.as_str(),
        resource.namespace = key.namespace.as_str(),
        resource.name = key.name.as_str(),
    );
    async move {
        let started = Instant::now();
        metrics::increment_reconciliations(kind.as_str());
        let result = match kind {
            ResourceKind::ServiceInstance => reconciler.reconcile_instance(&key).await,
            ResourceKind::ServiceBinding => reconciler.reconcile_binding(&key).await,
        };
        metrics::observe_reconciliation_duration(kind.as_str(), started.elapsed().as_secs_f64());

        let action = result?;
        reset_error_backoff(kind.as_str(), &key, &reconciler);
        debug!("{} {} reconciled: {:?}", kind.as_str(), key, action);
        Ok(to_action(action))
    }
    .instrument(span)
    .await
}

fn error_policy<K: Resource>(
    obj: &K,
    error: &ReconcilerError,
    reconciler: &Reconciler,
    kind: ResourceKind,
) -> Action {
    match ResourceKey::from_resource(obj) {
        Some(key) => to_action(handle_reconciliation_error(
            kind.as_str(),
            &key,
            error,
            reconciler,
        )),
        None => Action::await_change(),
    }
}

/// Bindings in `bindings` that reference `instance`
#[must_use]
pub fn bindings_of(
    bindings: &Store<ServiceBinding>,
    instance: &ServiceInstance,
) -> Vec<ObjectRef<ServiceBinding>> {
    let Some(namespace) = instance.namespace() else {
        return Vec::new();
    };
    let name = instance.name_any();
    bindings
        .state()
        .iter()
        .filter(|b| {
            b.spec.instance_ref.name == name && b.namespace().as_deref() == Some(namespace.as_str())
        })
        .map(|b| ObjectRef::from_obj(b.as_ref()))
        .collect()
}

/// The instance `binding` references
#[must_use]
pub fn instance_of(binding: &ServiceBinding) -> Option<ObjectRef<ServiceInstance>> {
    let namespace = binding.namespace()?;
    Some(ObjectRef::new(&binding.spec.instance_ref.name).within(&namespace))
}

/// Yields once per `interval`, starting one interval from now
fn resync_ticks(interval: Duration) -> impl Stream<Item = ()> + Send + Sync + 'static {
    let (mut tx, rx) = futures::channel::mpsc::channel(0);
    let interval = interval.max(MIN_RESYNC_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires at once; the initial list covers it
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("Resync tick");
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            futures::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}

fn controller_config(config: &SharedControllerConfig) -> controller::Config {
    let concurrency = u16::try_from(config.concurrent_syncs.max(1)).unwrap_or(u16::MAX);
    controller::Config::default().concurrency(concurrency)
}

fn instance_controller(
    client: &Client,
    reconciler: &Arc<Reconciler>,
    config: &SharedControllerConfig,
    shutdown: &ShutdownSignal,
) -> impl Stream<Item = ControllerResult<ServiceInstance>> {
    Controller::new(
        Api::<ServiceInstance>::all(client.clone()),
        watcher::Config::default(),
    )
    .with_config(controller_config(config))
    .watches(
        Api::<ServiceBinding>::all(client.clone()),
        watcher::Config::default(),
        |binding| instance_of(&binding),
    )
    .reconcile_all_on(resync_ticks(config.resync_interval))
    .graceful_shutdown_on(shutdown.clone())
    .run(
        |obj, ctx| reconcile_object(obj, ctx, ResourceKind::ServiceInstance),
        |obj, error, ctx| error_policy(obj.as_ref(), error, &ctx, ResourceKind::ServiceInstance),
        Arc::clone(reconciler),
    )
}

fn binding_controller(
    client: &Client,
    reconciler: &Arc<Reconciler>,
    config: &SharedControllerConfig,
    shutdown: &ShutdownSignal,
) -> impl Stream<Item = ControllerResult<ServiceBinding>> {
    let controller = Controller::new(
        Api::<ServiceBinding>::all(client.clone()),
        watcher::Config::default(),
    )
    .with_config(controller_config(config));
    let bindings = controller.store();
    controller
        .watches(
            Api::<ServiceInstance>::all(client.clone()),
            watcher::Config::default(),
            move |instance| bindings_of(&bindings, &instance),
        )
        .reconcile_all_on(resync_ticks(config.resync_interval))
        .graceful_shutdown_on(shutdown.clone())
        .run(
            |obj, ctx| reconcile_object(obj, ctx, ResourceKind::ServiceBinding),
            |obj, error, ctx| error_policy(obj.as_ref(), error, &ctx, ResourceKind::ServiceBinding),
            Arc::clone(reconciler),
        )
}

/// Drive the controller built by `start` until shutdown, restarting it when
/// its stream ends
async fn supervise<K, S, F>(
    kind: ResourceKind,
    config: SharedControllerConfig,
    server_state: Arc<ServerState>,
    mut start: F,
) where
    K: Resource<DynamicType = ()>,
    S: Stream<Item = ControllerResult<K>>,
    F: FnMut() -> S,
{
    loop {
        if !server_state.ready() {
            break;
        }
        info!("Starting {} controller...", kind.as_str());
        let mut throttle_backoff = config.retry_initial_backoff;
        let stream = start();
        futures::pin_mut!(stream);
        while let Some(result) = stream.next().await {
            match result {
                Ok((object, action)) => {
                    throttle_backoff = config.retry_initial_backoff;
                    debug!("{} {} scheduled: {:?}", kind.as_str(), object.name, action);
                }
                Err(controller::Error::QueueError(e)) => {
                    handle_watch_stream_error(
                        kind.as_str(),
                        &format!("{e:?}"),
                        &mut throttle_backoff,
                        config.operation_polling_maximum_backoff,
                        config.watch_restart_delay,
                    )
                    .await;
                }
                // Already handled by the error policy
                Err(controller::Error::ReconcilerFailed(e, _)) => {
                    debug!("{} pass failed: {}", kind.as_str(), e);
                }
                Err(e) => warn!("{} controller error: {}", kind.as_str(), e),
            }
        }

        if !server_state.ready() {
            break;
        }
        warn!(
            "{} controller stream ended, restarting in {} seconds...",
            kind.as_str(),
            config.watch_restart_delay.as_secs()
        );
        tokio::time::sleep(config.watch_restart_delay).await;
    }
    info!("Shutdown requested, {} controller stopped", kind.as_str());
}

/// Run the controllers until SIGINT/SIGTERM
///
/// On shutdown the server is marked not ready, the controllers stop picking
/// up new work and in-flight passes are allowed to finish.
pub async fn run_watch_loop(
    client: Client,
    reconciler: Arc<Reconciler>,
    server_state: Arc<ServerState>,
    controller_config: SharedControllerConfig,
) -> Result<(), anyhow::Error> {
    let shutdown: ShutdownSignal = shutdown_signal().boxed().shared();
    {
        let shutdown = shutdown.clone();
        let server_state = Arc::clone(&server_state);
        tokio::spawn(async move {
            shutdown.await;
            info!("Received shutdown signal (SIGINT/SIGTERM), initiating graceful shutdown...");
            server_state.set_ready(false);
            info!("Marked server as not ready, waiting for in-flight reconciliations to complete...");
        });
    }

    info!(
        "Starting controllers with {} concurrent reconciliations per resource kind",
        controller_config.concurrent_syncs
    );
    let instances = supervise(
        ResourceKind::ServiceInstance,
        controller_config.clone(),
        Arc::clone(&server_state),
        || instance_controller(&client, &reconciler, &controller_config, &shutdown),
    )
    .instrument(info_span!("controller.watch", resource.kind = "ServiceInstance"));
    let bindings = supervise(
        ResourceKind::ServiceBinding,
        controller_config.clone(),
        Arc::clone(&server_state),
        || binding_controller(&client, &reconciler, &controller_config, &shutdown),
    )
    .instrument(info_span!("controller.watch", resource.kind = "ServiceBinding"));
    futures::future::join(instances, bindings).await;

    info!("Controller stopped gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::reconciler::RequeueReason;
    use crate::crd::{LocalObjectReference, ServiceBindingSpec, ServiceInstanceSpec};
    use kube_runtime::reflector;

    fn binding(namespace: &str, name: &str, instance: &str) -> ServiceBinding {
        let mut binding = ServiceBinding::new(
            name,
            ServiceBindingSpec {
                instance_ref: LocalObjectReference {
                    name: instance.to_string(),
                },
                parameters: None,
                parameters_from: Vec::new(),
                secret_name: None,
                secret_transforms: Vec::new(),
                external_id: None,
                user_info: None,
            },
        );
        binding.metadata.namespace = Some(namespace.to_string());
        binding
    }

    fn instance(namespace: &str, name: &str) -> ServiceInstance {
        let mut instance = ServiceInstance::new(
            name,
            ServiceInstanceSpec {
                broker_name: "ups-broker".to_string(),
                class_external_name: "database".to_string(),
                plan_external_name: "small".to_string(),
                parameters: None,
                parameters_from: Vec::new(),
                external_id: None,
                user_info: None,
                update_requests: 0,
            },
        );
        instance.metadata.namespace = Some(namespace.to_string());
        instance
    }

    #[test]
    fn test_instance_change_maps_to_its_bindings() {
        let (store, mut writer) = reflector::store::<ServiceBinding>();
        for b in [
            binding("default", "creds-a", "db"),
            binding("default", "creds-b", "db"),
            binding("default", "creds-c", "cache"),
            binding("other", "creds-d", "db"),
        ] {
            writer.apply_watcher_event(&watcher::Event::Apply(b));
        }

        let mut names: Vec<String> = bindings_of(&store, &instance("default", "db"))
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["creds-a", "creds-b"]);
        assert!(bindings_of(&store, &instance("default", "queue")).is_empty());
    }

    #[test]
    fn test_binding_change_maps_to_its_instance() {
        let target = instance_of(&binding("default", "creds", "db")).unwrap();
        assert_eq!(target.name, "db");
        assert_eq!(target.namespace.as_deref(), Some("default"));

        let mut orphan = binding("default", "creds", "db");
        orphan.metadata.namespace = None;
        assert!(instance_of(&orphan).is_none());
    }

    #[test]
    fn test_pass_outcomes_map_to_controller_actions() {
        let render = |action: Action| format!("{action:?}");
        assert_eq!(
            render(to_action(ReconcileAction::Done)),
            render(Action::await_change())
        );
        assert_eq!(
            render(to_action(ReconcileAction::RequeueNow)),
            render(Action::requeue(Duration::ZERO))
        );
        assert_eq!(
            render(to_action(ReconcileAction::Requeue {
                after: Duration::from_secs(8),
                reason: RequeueReason::Poll,
            })),
            render(Action::requeue(Duration::from_secs(8)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_ticks_once_per_interval() {
        let started = tokio::time::Instant::now();
        let ticks = resync_ticks(Duration::from_secs(60));
        futures::pin_mut!(ticks);

        assert_eq!(ticks.next().await, Some(()));
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(ticks.next().await, Some(()));
        assert!(started.elapsed() >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_interval_has_a_floor() {
        let started = tokio::time::Instant::now();
        let ticks = resync_ticks(Duration::ZERO);
        futures::pin_mut!(ticks);

        assert_eq!(ticks.next().await, Some(()));
        assert!(started.elapsed() >= MIN_RESYNC_INTERVAL);
    }
}
