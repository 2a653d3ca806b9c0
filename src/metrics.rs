use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::deploy::{RunReport, RunState, Trigger};

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RunLabels {
    pub trigger: TriggerLabel,
    pub outcome: OutcomeLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TriggerLabels {
    pub trigger: TriggerLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TriggerLabel {
    Webhook,
    Manual,
}

impl From<Trigger> for TriggerLabel {
    fn from(t: Trigger) -> Self {
        match t {
            Trigger::Webhook => Self::Webhook,
            Trigger::Manual => Self::Manual,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum OutcomeLabel {
    Succeeded,
    SyncFailed,
    ScriptFailed,
    ScriptNotFound,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResultLabels {
    pub result: StepResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum StepResult {
    Ok,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WebhookLabels {
    pub result: WebhookResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum WebhookResult {
    Accepted,
    Ignored,
    Invalid,
    Unauthorized,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProviderLabels {
    pub endpoint: String,
    pub status: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the service.
pub struct Metrics {
    // -- deployments --
    pub deploy_runs_total: Family<RunLabels, Counter>,
    pub deploy_duration_seconds: Family<TriggerLabels, Histogram>,
    pub deploys_in_progress: Gauge,

    // -- git --
    pub git_syncs_total: Family<ResultLabels, Counter>,

    // -- locks --
    pub workdir_lock_waits: Counter,

    // -- webhook --
    pub webhook_deliveries_total: Family<WebhookLabels, Counter>,

    // -- provider API --
    pub provider_api_calls_total: Family<ProviderLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let deploy_runs_total = Family::<RunLabels, Counter>::default();
        registry.register(
            "pushdeploy_deploy_runs",
            "Finished deployment runs by trigger and outcome",
            deploy_runs_total.clone(),
        );

        let deploy_duration_seconds =
            Family::<TriggerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.5, 2.0, 12))
            });
        registry.register(
            "pushdeploy_deploy_duration_seconds",
            "Wall-clock duration of deployment runs",
            deploy_duration_seconds.clone(),
        );

        let deploys_in_progress: Gauge = Gauge::default();
        registry.register(
            "pushdeploy_deploys_in_progress",
            "Deployment runs currently executing",
            deploys_in_progress.clone(),
        );

        let git_syncs_total = Family::<ResultLabels, Counter>::default();
        registry.register(
            "pushdeploy_git_syncs",
            "Clone-or-pull operations by result",
            git_syncs_total.clone(),
        );

        let workdir_lock_waits = Counter::default();
        registry.register(
            "pushdeploy_workdir_lock_waits",
            "Runs that had to wait for another run on the same working directory",
            workdir_lock_waits.clone(),
        );

        let webhook_deliveries_total = Family::<WebhookLabels, Counter>::default();
        registry.register(
            "pushdeploy_webhook_deliveries",
            "Inbound webhook deliveries by result",
            webhook_deliveries_total.clone(),
        );

        let provider_api_calls_total = Family::<ProviderLabels, Counter>::default();
        registry.register(
            "pushdeploy_provider_api_calls",
            "Provider API calls by endpoint and status class",
            provider_api_calls_total.clone(),
        );

        Self {
            deploy_runs_total,
            deploy_duration_seconds,
            deploys_in_progress,
            git_syncs_total,
            workdir_lock_waits,
            webhook_deliveries_total,
            provider_api_calls_total,
        }
    }

    /// Record a finished run.
    pub fn observe_run(&self, report: &RunReport) {
        let outcome = match report.state {
            RunState::Succeeded => OutcomeLabel::Succeeded,
            RunState::SyncFailed => OutcomeLabel::SyncFailed,
            RunState::ScriptNotFound => OutcomeLabel::ScriptNotFound,
            _ => OutcomeLabel::ScriptFailed,
        };
        let trigger = TriggerLabel::from(report.trigger);
        self.deploy_runs_total
            .get_or_create(&RunLabels {
                trigger: trigger.clone(),
                outcome,
            })
            .inc();
        self.deploy_duration_seconds
            .get_or_create(&TriggerLabels { trigger })
            .observe(report.duration_secs());
    }

    pub fn observe_sync(&self, ok: bool) {
        let result = if ok { StepResult::Ok } else { StepResult::Failed };
        self.git_syncs_total
            .get_or_create(&ResultLabels { result })
            .inc();
    }

    pub fn observe_webhook(&self, result: WebhookResult) {
        self.webhook_deliveries_total
            .get_or_create(&WebhookLabels { result })
            .inc();
    }

    pub fn observe_provider_call(&self, endpoint: &str, status: u16) {
        let class = match status {
            0 => "error".to_string(),
            s => format!("{}xx", s / 100),
        };
        self.provider_api_calls_total
            .get_or_create(&ProviderLabels {
                endpoint: endpoint.to_string(),
                status: class,
            })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in `AppState`.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all service metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
