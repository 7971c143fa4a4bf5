use crate::error::Error;
use crate::helm::config::{ActionConfigGetter, GvkResolver};
use crate::metrics::Metrics;
use crate::reconciler::dependents::DependentWatchManager;
use crate::reconciler::{reconcile, Reconciler, DEFAULT_RECONCILE_PERIOD};
use crate::watches::Watch;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, ListParams};
use kube::client::Client;
use kube::core::Selector;
use kube::discovery::ApiResource;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::events::Reporter;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::ResourceExt;
use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{error, info};

const TRIGGER_BUFFER_SIZE: usize = 256;
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Diagnostics to be exposed by the web server.
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "helmop-controller".into(),
        }
    }
}

/// State shared between the controllers and the web server.
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Arc<Metrics>,
    registry: Arc<Registry>,
}

impl State {
    pub fn new(mut registry: Registry) -> Self {
        let metrics = Arc::new(Metrics::new(&mut registry));
        State {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics,
            registry: Arc::new(registry),
        }
    }

    /// Encoded metrics for the `/metrics` endpoint.
    pub fn metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn shared_metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Create a controller context that can update this state.
    pub fn to_context(
        &self,
        client: Client,
        reconciler: Arc<Reconciler>,
        dependents: Arc<DependentWatchManager>,
    ) -> Arc<Context> {
        Arc::new(Context {
            client,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            reconciler,
            dependents,
        })
    }
}

/// Context injected into each reconcile invocation.
pub struct Context {
    pub client: Client,
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub metrics: Arc<Metrics>,
    pub reconciler: Arc<Reconciler>,
    pub dependents: Arc<DependentWatchManager>,
}

fn error_policy(obj: Arc<DynamicObject>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        msg = "failed reconciliation",
        namespace = %obj.namespace().unwrap_or_default(),
        name = %obj.name_any(),
        %error,
    );
    ctx.metrics.reconcile.set_failure(&obj, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// Run one controller per watch entry until shutdown.
pub async fn run(
    state: State,
    client: Client,
    config: kube::Config,
    watches: Vec<Watch>,
    namespaces: Vec<String>,
) {
    let resolver = Arc::new(GvkResolver::new(client.clone()));
    let controllers = watches.into_iter().map(|watch| {
        run_watch(
            state.clone(),
            client.clone(),
            config.clone(),
            resolver.clone(),
            watch,
            namespaces.clone(),
        )
    });
    futures::future::join_all(controllers).await;
}

async fn run_watch(
    state: State,
    client: Client,
    config: kube::Config,
    resolver: Arc<GvkResolver>,
    watch: Watch,
    namespaces: Vec<String>,
) {
    let gvk = watch.gvk();
    let resolved = match resolver.resolve(&gvk).await {
        Ok(resolved) => resolved,
        Err(e) => {
            error!("cannot resolve {}/{} {}: {e}. Is the CRD installed?", gvk.group, gvk.version, gvk.kind);
            std::process::exit(1);
        }
    };

    // One controller per configured namespace; an empty list watches the
    // whole cluster.
    let targets: Vec<Option<String>> = if namespaces.is_empty() {
        vec![None]
    } else {
        namespaces.into_iter().map(Some).collect()
    };

    // Every controller gets its own trigger stream; the shared dependent
    // watch manager broadcasts owner requests to all of them.
    let mut trigger_txs = Vec::with_capacity(targets.len());
    let mut trigger_rxs = Vec::with_capacity(targets.len());
    for _ in &targets {
        let (tx, rx) = mpsc::channel(TRIGGER_BUFFER_SIZE);
        trigger_txs.push(tx);
        trigger_rxs.push(rx);
    }
    let dependents = Arc::new(DependentWatchManager::new(
        client.clone(),
        resolver.clone(),
        resolved.resource.clone(),
        resolved.namespaced,
        trigger_txs,
        state.shared_metrics(),
    ));

    let Some(chart) = watch.chart_tree() else {
        error!("watch for {} has no loaded chart", gvk.kind);
        std::process::exit(1);
    };
    let getter = ActionConfigGetter::new(client.clone(), config, resolver.clone());
    let reconciler = Reconciler::builder(resolved.resource.clone(), chart, getter)
        .with_override_values(watch.override_values.clone())
        .with_reconcile_period(watch.reconcile_period.unwrap_or(DEFAULT_RECONCILE_PERIOD))
        .with_watch_dependent_resources(watch.watch_dependent_resources);
    let reconciler = match reconciler.build() {
        Ok(reconciler) => Arc::new(reconciler),
        Err(e) => {
            error!("invalid watch configuration for {}: {e}", gvk.kind);
            std::process::exit(1);
        }
    };

    let mut watcher_config = watcher::Config::default().any_semantic();
    if let Some(selector) = &watch.selector {
        match Selector::try_from(selector.clone()) {
            Ok(selector) => watcher_config = watcher_config.labels_from(&selector),
            Err(e) => {
                error!("invalid selector for {}: {e}", gvk.kind);
                std::process::exit(1);
            }
        }
    }

    let ctx = state.to_context(client.clone(), reconciler, dependents);
    ctx.metrics.ready_set(1);

    let concurrency = watch.max_concurrent_reconciles.unwrap_or(1);
    let controllers = targets.into_iter().zip(trigger_rxs).map(|(target, trigger_rx)| {
        let api = match &target {
            Some(namespace) => {
                Api::namespaced_with(client.clone(), namespace, &resolved.resource)
            }
            None => Api::all_with(client.clone(), &resolved.resource),
        };
        run_controller(
            api,
            watcher_config.clone(),
            resolved.resource.clone(),
            gvk.kind.clone(),
            target,
            concurrency,
            trigger_rx,
            ctx.clone(),
        )
    });
    futures::future::join_all(controllers).await;
}

#[allow(clippy::too_many_arguments)]
async fn run_controller(
    api: Api<DynamicObject>,
    watcher_config: watcher::Config,
    resource: ApiResource,
    kind: String,
    namespace: Option<String>,
    concurrency: u16,
    trigger_rx: mpsc::Receiver<ObjectRef<DynamicObject>>,
    ctx: Arc<Context>,
) {
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    info!(
        msg = "starting controller",
        %kind,
        namespace = %namespace.as_deref().unwrap_or("<all>"),
    );
    Controller::new_with(api, watcher_config, resource)
        .with_config(
            controller::Config::default()
                .concurrency(concurrency)
                .debounce(DEBOUNCE),
        )
        .reconcile_on(trigger_rx)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
