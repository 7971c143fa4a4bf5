pub mod annotations;
pub mod dependents;
pub mod state;

use crate::controller::Context;
use crate::error::{Error, Result};
use crate::helm::chart::Chart;
use crate::helm::client::{ActionClient, Install, Uninstall, Upgrade};
use crate::helm::config::ActionConfigGetter;
use crate::helm::release::Release;
use crate::status::updater::{
    ensure_condition, ensure_deployed_release, ensure_finalizer, remove_condition,
    remove_deployed_release, remove_finalizer, Updater,
};
use crate::status::{
    Condition, ConditionStatus, ConditionType, REASON_INSTALL_ERROR, REASON_INSTALL_SUCCESSFUL,
    REASON_UNINSTALL_ERROR, REASON_UNINSTALL_SUCCESSFUL, REASON_UPGRADE_ERROR,
    REASON_UPGRADE_SUCCESSFUL,
};
use crate::telemetry;
use crate::values::{self, Translator, Values};
use annotations::AnnotationHandler;
use state::{deletion_state, ReleaseState};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, DynamicObject};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::Resource;
use kube::ResourceExt;
use tokio::time::Duration;
use tracing::{debug, error, field, info, instrument, warn, Span};

/// Finalizer that keeps a CR alive until its release is uninstalled.
pub const UNINSTALL_FINALIZER: &str = "helm.sdk.operatorframework.io/uninstall-release";

/// Default periodic reconcile interval when the watch does not set one.
pub const DEFAULT_RECONCILE_PERIOD: Duration = Duration::from_secs(60);

const DELETION_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const DELETION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hooks around each reconcile. Begin hooks run before state selection
/// and abort on error; end hooks run after a successful non-uninstall
/// action and their errors are only logged.
#[async_trait]
pub trait ReconcilerExtension: Send + Sync {
    async fn begin_reconcile(&self, _cr: &DynamicObject) -> Result<()> {
        Ok(())
    }
    async fn end_reconcile(&self, _cr: &DynamicObject) -> Result<()> {
        Ok(())
    }
}

/// The per-CR orchestrator for one watched GVK.
pub struct Reconciler {
    resource: ApiResource,
    chart: Arc<Chart>,
    finalizer: String,
    override_values: BTreeMap<String, String>,
    translator: Option<Arc<dyn Translator>>,
    reconcile_period: Duration,
    watch_dependent_resources: bool,
    install_handlers: Vec<AnnotationHandler<Install>>,
    upgrade_handlers: Vec<AnnotationHandler<Upgrade>>,
    uninstall_handlers: Vec<AnnotationHandler<Uninstall>>,
    extensions: Vec<Arc<dyn ReconcilerExtension>>,
    getter: ActionConfigGetter,
}

pub struct ReconcilerBuilder {
    resource: ApiResource,
    chart: Arc<Chart>,
    override_values: BTreeMap<String, String>,
    translator: Option<Arc<dyn Translator>>,
    reconcile_period: Duration,
    watch_dependent_resources: bool,
    install_handlers: Vec<AnnotationHandler<Install>>,
    upgrade_handlers: Vec<AnnotationHandler<Upgrade>>,
    uninstall_handlers: Vec<AnnotationHandler<Uninstall>>,
    extensions: Vec<Arc<dyn ReconcilerExtension>>,
    getter: ActionConfigGetter,
}

impl Reconciler {
    pub fn builder(
        resource: ApiResource,
        chart: Arc<Chart>,
        getter: ActionConfigGetter,
    ) -> ReconcilerBuilder {
        ReconcilerBuilder {
            resource,
            chart,
            override_values: BTreeMap::new(),
            translator: None,
            reconcile_period: DEFAULT_RECONCILE_PERIOD,
            watch_dependent_resources: true,
            install_handlers: annotations::default_install_handlers(),
            upgrade_handlers: annotations::default_upgrade_handlers(),
            uninstall_handlers: annotations::default_uninstall_handlers(),
            extensions: Vec::new(),
            getter,
        }
    }

    pub fn api_resource(&self) -> &ApiResource {
        &self.resource
    }

    pub fn watches_dependents(&self) -> bool {
        self.watch_dependent_resources
    }
}

impl ReconcilerBuilder {
    /// Override values, as already-expanded `dot.path` → literal pairs.
    pub fn with_override_values(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.override_values = overrides;
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Periodic reconcile interval; zero disables periodic reconciles.
    pub fn with_reconcile_period(mut self, period: Duration) -> Self {
        self.reconcile_period = period;
        self
    }

    pub fn with_watch_dependent_resources(mut self, watch: bool) -> Self {
        self.watch_dependent_resources = watch;
        self
    }

    pub fn with_install_handler(mut self, handler: AnnotationHandler<Install>) -> Self {
        self.install_handlers.push(handler);
        self
    }

    pub fn with_upgrade_handler(mut self, handler: AnnotationHandler<Upgrade>) -> Self {
        self.upgrade_handlers.push(handler);
        self
    }

    pub fn with_uninstall_handler(mut self, handler: AnnotationHandler<Uninstall>) -> Self {
        self.uninstall_handlers.push(handler);
        self
    }

    pub fn with_extension(mut self, extension: Arc<dyn ReconcilerExtension>) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Validate and build. Misconfigured overrides and duplicate
    /// annotation names fail here, before any reconcile runs.
    pub fn build(self) -> Result<Reconciler> {
        let mut names = HashSet::new();
        let all_names = self
            .install_handlers
            .iter()
            .map(|h| h.name.as_str())
            .chain(self.upgrade_handlers.iter().map(|h| h.name.as_str()))
            .chain(self.uninstall_handlers.iter().map(|h| h.name.as_str()));
        for name in all_names {
            if !names.insert(name.to_string()) {
                return Err(Error::ConfigError(format!(
                    "duplicate annotation handler {name:?}"
                )));
            }
        }

        let mut probe = Values::new();
        values::apply_overrides(&mut probe, &self.override_values)?;

        Ok(Reconciler {
            resource: self.resource,
            chart: self.chart,
            finalizer: UNINSTALL_FINALIZER.to_string(),
            override_values: self.override_values,
            translator: self.translator,
            reconcile_period: self.reconcile_period,
            watch_dependent_resources: self.watch_dependent_resources,
            install_handlers: self.install_handlers,
            upgrade_handlers: self.upgrade_handlers,
            uninstall_handlers: self.uninstall_handlers,
            extensions: self.extensions,
            getter: self.getter,
        })
    }
}

/// Controller entry point for one reconcile request.
#[instrument(skip(cr, ctx), fields(trace_id))]
pub async fn reconcile(cr: Arc<DynamicObject>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));

    let _timer = ctx.metrics.reconcile.count_and_measure(&trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    let reconciler = ctx.reconciler.clone();
    let name = cr.name_any();
    let namespace = cr.namespace().ok_or_else(|| {
        Error::ConfigError(format!(
            "resource {name} has no namespace; watched kinds must be namespace-scoped"
        ))
    })?;
    let api: Api<DynamicObject> =
        Api::namespaced_with(ctx.client.clone(), &namespace, &reconciler.resource);

    // Fresh read; a CR deleted since the event was queued is
    // success-with-no-action.
    let Some(cr) = api.get_opt(&name).await.map_err(Error::KubeError)? else {
        debug!(msg = "resource gone, nothing to do", %namespace, %name);
        return Ok(Action::await_change());
    };

    info!(msg = "reconciling", kind = %reconciler.resource.kind, %namespace, %name);

    let mut updater = Updater::new();
    let result = reconciler
        .run(&cr, &namespace, &api, &ctx, &mut updater)
        .await;
    let status_result = updater.apply(&api, &cr).await;

    // A status error supersedes a nil action error but never masks a
    // non-nil one.
    match (result, status_result) {
        (Ok(action), Ok(())) => Ok(action),
        (Ok(_), Err(status_err)) => Err(status_err),
        (Err(action_err), Ok(())) => Err(action_err),
        (Err(action_err), Err(status_err)) => {
            error!(msg = "failed to publish status", error = %status_err);
            Err(action_err)
        }
    }
}

impl Reconciler {
    async fn run(
        &self,
        cr: &DynamicObject,
        namespace: &str,
        api: &Api<DynamicObject>,
        ctx: &Arc<Context>,
        updater: &mut Updater,
    ) -> Result<Action> {
        for extension in &self.extensions {
            if let Err(e) = extension.begin_reconcile(cr).await {
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                return Err(e);
            }
        }

        match deletion_state(cr, &self.finalizer) {
            Some(ReleaseState::AlreadyUninstalled) => {
                debug!(msg = "resource is terminated, skipping", name = %cr.name_any());
                return Ok(Action::await_change());
            }
            Some(ReleaseState::NeedsUninstall) => {
                return self.do_uninstall(cr, api, updater).await;
            }
            _ => {}
        }

        let values = match self.values_for(cr) {
            Ok(v) => v,
            Err(e) => {
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                return Err(e);
            }
        };
        let client = match self.getter.config_for(cr) {
            Ok(config) => ActionClient::from_config(config),
            Err(e) => {
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                return Err(e);
            }
        };

        // The finalizer must be persisted before any mutating release
        // action; a crash between action and finalizer would leak the
        // release.
        updater.update_spec(ensure_finalizer(&self.finalizer));
        updater.update_status(ensure_condition(Condition::initialized()));
        updater.apply(api, cr).await?;

        let (release_state, existing) = self
            .determine_state(cr, namespace, &client, &values, updater)
            .await?;
        debug!(msg = "determined release state", state = ?release_state);

        match release_state {
            ReleaseState::NeedsInstall => {
                self.do_install(cr, namespace, &client, &values, ctx, updater)
                    .await
            }
            ReleaseState::NeedsUpgrade => {
                self.do_upgrade(cr, namespace, &client, &values, ctx, updater)
                    .await
            }
            ReleaseState::Unchanged => {
                // safe unwrap: Unchanged implies a deployed release was found
                let existing = existing.unwrap();
                self.do_reconcile_release(cr, &client, existing, ctx, updater)
                    .await
            }
            // deletion states are decided before state detection
            ReleaseState::NeedsUninstall | ReleaseState::AlreadyUninstalled => {
                Ok(self.requeue_action())
            }
        }
    }

    async fn determine_state(
        &self,
        cr: &DynamicObject,
        namespace: &str,
        client: &ActionClient,
        values: &Values,
        updater: &mut Updater,
    ) -> Result<(ReleaseState, Option<Release>)> {
        let name = cr.name_any();
        let existing = match client.get(&name).await {
            Ok(release) => release,
            Err(e) if e.is_release_not_found() => return Ok((ReleaseState::NeedsInstall, None)),
            Err(e) => {
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                return Err(e);
            }
        };
        if !existing.status.is_deployed() {
            return Ok((ReleaseState::NeedsUpgrade, Some(existing)));
        }

        // A dry-run upgrade renders the candidate manifest; drift against
        // the stored one means an upgrade is due.
        let dry_run: Vec<crate::helm::client::UpgradeOption> =
            vec![Box::new(|u: &mut Upgrade| u.dry_run = true)];
        let candidate = match client
            .upgrade(&name, namespace, &self.chart, values, &dry_run)
            .await
        {
            Ok(candidate) => candidate,
            Err(e) => {
                updater.update_status(ensure_condition(Condition::release_failed(
                    REASON_UPGRADE_ERROR,
                    e.to_string(),
                )));
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                return Err(e);
            }
        };
        if candidate.manifest != existing.manifest {
            Ok((ReleaseState::NeedsUpgrade, Some(existing)))
        } else {
            Ok((ReleaseState::Unchanged, Some(existing)))
        }
    }

    async fn do_install(
        &self,
        cr: &DynamicObject,
        namespace: &str,
        client: &ActionClient,
        values: &Values,
        ctx: &Arc<Context>,
        updater: &mut Updater,
    ) -> Result<Action> {
        let name = cr.name_any();
        let options = AnnotationHandler::bind(&self.install_handlers, cr.annotations());
        match client
            .install(&name, namespace, &self.chart, values, &options)
            .await
        {
            Ok(release) => {
                info!(msg = "release installed", release = %release.name, version = release.version);
                self.emit_override_events(cr, ctx).await;
                self.register_dependents(&release, ctx, updater).await?;
                let notes = release.notes.clone().unwrap_or_default();
                updater.update_status(ensure_condition(Condition::deployed(
                    ConditionStatus::True,
                    REASON_INSTALL_SUCCESSFUL,
                    notes,
                )));
                updater.update_status(ensure_condition(Condition::release_succeeded()));
                updater.update_status(ensure_condition(Condition::reconciled()));
                updater.update_status(ensure_deployed_release(&release.name, &release.manifest));
                self.run_end_extensions(cr).await;
                Ok(self.requeue_action())
            }
            Err(e) => {
                updater.update_status(ensure_condition(Condition::release_failed(
                    REASON_INSTALL_ERROR,
                    e.to_string(),
                )));
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                Err(e)
            }
        }
    }

    async fn do_upgrade(
        &self,
        cr: &DynamicObject,
        namespace: &str,
        client: &ActionClient,
        values: &Values,
        ctx: &Arc<Context>,
        updater: &mut Updater,
    ) -> Result<Action> {
        let name = cr.name_any();
        let options = AnnotationHandler::bind(&self.upgrade_handlers, cr.annotations());
        match client
            .upgrade(&name, namespace, &self.chart, values, &options)
            .await
        {
            Ok(release) => {
                info!(msg = "release upgraded", release = %release.name, version = release.version);
                self.emit_override_events(cr, ctx).await;
                self.register_dependents(&release, ctx, updater).await?;
                let notes = release.notes.clone().unwrap_or_default();
                updater.update_status(ensure_condition(Condition::deployed(
                    ConditionStatus::True,
                    REASON_UPGRADE_SUCCESSFUL,
                    notes,
                )));
                updater.update_status(ensure_condition(Condition::release_succeeded()));
                updater.update_status(ensure_condition(Condition::reconciled()));
                updater.update_status(ensure_deployed_release(&release.name, &release.manifest));
                self.run_end_extensions(cr).await;
                Ok(self.requeue_action())
            }
            Err(e) => {
                updater.update_status(ensure_condition(Condition::release_failed(
                    REASON_UPGRADE_ERROR,
                    e.to_string(),
                )));
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                Err(e)
            }
        }
    }

    async fn do_reconcile_release(
        &self,
        cr: &DynamicObject,
        client: &ActionClient,
        release: Release,
        ctx: &Arc<Context>,
        updater: &mut Updater,
    ) -> Result<Action> {
        updater.update_status(remove_condition(ConditionType::ReleaseFailed));
        match client.reconcile(&release).await {
            Ok(()) => {
                debug!(msg = "release reconciled", release = %release.name);
                self.register_dependents(&release, ctx, updater).await?;
                updater.update_status(ensure_condition(Condition::reconciled()));
                updater.update_status(ensure_deployed_release(&release.name, &release.manifest));
                self.run_end_extensions(cr).await;
                Ok(self.requeue_action())
            }
            Err(e) => {
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                Err(e)
            }
        }
    }

    async fn do_uninstall(
        &self,
        cr: &DynamicObject,
        api: &Api<DynamicObject>,
        updater: &mut Updater,
    ) -> Result<Action> {
        let name = cr.name_any();
        let client = match self.getter.config_for(cr) {
            Ok(config) => ActionClient::from_config(config),
            Err(e) => {
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                return Err(e);
            }
        };
        let options = AnnotationHandler::bind(&self.uninstall_handlers, cr.annotations());
        match client.uninstall(&name, &options).await {
            Ok(release) => {
                info!(msg = "release uninstalled", release = %release.name);
            }
            Err(e) if e.is_release_not_found() => {
                debug!(msg = "release already uninstalled", release = %name);
            }
            Err(e) => {
                updater.update_status(ensure_condition(Condition::release_failed(
                    REASON_UNINSTALL_ERROR,
                    e.to_string(),
                )));
                updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
                return Err(e);
            }
        }

        updater.update_status(ensure_condition(Condition::deployed(
            ConditionStatus::False,
            REASON_UNINSTALL_SUCCESSFUL,
            "",
        )));
        updater.update_status(remove_deployed_release());
        updater.update_status(ensure_condition(Condition::reconciled()));
        updater.update_spec(remove_finalizer(&self.finalizer));
        // Status lands before the finalizer removal that frees the object
        // for garbage collection.
        updater.apply(api, cr).await?;

        self.wait_for_deletion(api, &name).await;
        Ok(Action::await_change())
    }

    /// Best-effort wait for the CR to vanish so a re-queued event does not
    /// see stale state and decide `NeedsInstall`.
    async fn wait_for_deletion(&self, api: &Api<DynamicObject>, name: &str) {
        let waited = tokio::time::timeout(DELETION_WAIT_TIMEOUT, async {
            loop {
                match api.get_opt(name).await {
                    Ok(None) => break,
                    Ok(Some(_)) => tokio::time::sleep(DELETION_POLL_INTERVAL).await,
                    Err(e) => {
                        debug!(msg = "error polling for deletion", %name, error = %e);
                        tokio::time::sleep(DELETION_POLL_INTERVAL).await;
                    }
                }
            }
        })
        .await;
        if waited.is_err() {
            debug!(msg = "timed out waiting for resource deletion", %name);
        }
    }

    async fn register_dependents(
        &self,
        release: &Release,
        ctx: &Arc<Context>,
        updater: &mut Updater,
    ) -> Result<()> {
        if !self.watch_dependent_resources {
            return Ok(());
        }
        if let Err(e) = ctx.dependents.watch_dependents(&release.manifest).await {
            updater.update_status(ensure_condition(Condition::irreconcilable(e.to_string())));
            return Err(e);
        }
        Ok(())
    }

    fn values_for(&self, cr: &DynamicObject) -> Result<Values> {
        let mut derived = match &self.translator {
            Some(translator) => translator.translate(cr)?,
            None => values::from_resource(cr)?,
        };
        values::apply_overrides(&mut derived, &self.override_values)?;
        Ok(values::coalesce(derived, &self.chart.default_values))
    }

    async fn emit_override_events(&self, cr: &DynamicObject, ctx: &Arc<Context>) {
        if self.override_values.is_empty() {
            return;
        }
        let reporter = ctx.diagnostics.read().await.reporter.clone();
        let reference = cr.object_ref(&self.resource);
        let recorder = Recorder::new(ctx.client.clone(), reporter, reference.into());
        for (key, value) in &self.override_values {
            let event = Event {
                type_: EventType::Warning,
                reason: "ValueOverridden".to_string(),
                note: Some(format!(
                    "Chart value \"{key}\" overridden to \"{value}\" by operator"
                )),
                action: "Reconciling".to_string(),
                secondary: None,
            };
            if let Err(e) = recorder.publish(event).await {
                warn!(msg = "failed to publish override event", error = %e);
            }
        }
    }

    async fn run_end_extensions(&self, cr: &DynamicObject) {
        for extension in &self.extensions {
            if let Err(e) = extension.end_reconcile(cr).await {
                error!(msg = "end reconcile extension failed", error = %e);
            }
        }
    }

    fn requeue_action(&self) -> Action {
        if self.reconcile_period.is_zero() {
            Action::await_change()
        } else {
            Action::requeue(self.reconcile_period)
        }
    }
}
