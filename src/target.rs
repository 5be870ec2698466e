// ============================================================================
// TARGETS
// ============================================================================
// A `Target` is one monitored database instance. It owns its metric instances
// and their schedule state outright; the only things that leave the target's
// loop are emitted points (through the dispatch queue) and a read-only view
// of attached metrics used to resolve formulas.
// ============================================================================

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex as TokioMutex, MutexGuard};
use tracing::{debug, error, info};

use crate::error::{FormulaError, FormulaResult, TargetError, TargetResult};
use crate::formula::{MetricReference, MetricResolver, ResolvedSeries};
use crate::logging::{report_error, LogLevel};
use crate::metric::{MetricDefinition, MetricInstance, MetricInterval};
use crate::query::QuerySource;
use crate::queue::DispatchQueue;
use crate::schedule::{LoopControl, Periodic, PeriodicTimer};
use crate::types::{canonical_target_name, Timestamp};

/// `[graphite_root.]identifier.{interval}seconds`, `None` when disabled.
fn build_metric_root(graphite_root: Option<&str>, identifier: &str, interval: MetricInterval) -> Option<String> {
    let secs = interval.as_secs()?;
    let mut root = match graphite_root {
        Some(r) if !r.is_empty() => format!("{r}."),
        _ => String::new(),
    };
    root.push_str(identifier);
    root.push_str(&format!(".{secs}seconds"));
    Some(root)
}

// ----------------------------------------------------------------------------
// Published View
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MetricView {
    definition: MetricDefinition,
    interval: MetricInterval,
    root: Option<String>,
}

/// Snapshot of a target's attached metrics, replaced whenever they change.
#[derive(Debug, Clone, Default)]
pub struct TargetView {
    identifier: String,
    metrics: HashMap<String, MetricView>,
}

impl TargetView {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.metrics.contains_key(metric)
    }

    pub fn resolve(&self, reference: &MetricReference) -> FormulaResult<ResolvedSeries> {
        let view = self
            .metrics
            .get(reference.metric())
            .ok_or_else(|| FormulaError::MetricNotFound {
                server: self.identifier.clone(),
                metric: reference.metric().to_string(),
            })?;
        let root = view.root.as_deref().ok_or_else(|| FormulaError::MetricDisabled {
            server: self.identifier.clone(),
            metric: reference.metric().to_string(),
        })?;

        Ok(ResolvedSeries {
            path: view
                .definition
                .build_path(&reference.key_row(), reference.measurement(), root),
            interval: view.interval,
        })
    }
}

// ----------------------------------------------------------------------------
// Target
// ----------------------------------------------------------------------------

/// Source of "now" for scheduling decisions.
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

pub struct Target {
    instance: String,
    identifier: String,
    graphite_root: Option<String>,
    metrics: Vec<MetricInstance>,
    source: Arc<dyn QuerySource>,
    queue: Option<Arc<DispatchQueue>>,
    view: Arc<ArcSwap<TargetView>>,
    clock: Clock,
}

impl Target {
    /// `instance` is `server` or `server\instance`.
    pub fn new(instance: impl Into<String>, graphite_root: Option<String>, source: Arc<dyn QuerySource>) -> Self {
        let instance = instance.into();
        let identifier = canonical_target_name(&instance);
        let view = Arc::new(ArcSwap::from_pointee(TargetView {
            identifier: identifier.clone(),
            metrics: HashMap::new(),
        }));
        Self {
            instance,
            identifier,
            graphite_root: graphite_root.filter(|r| !r.is_empty()),
            metrics: Vec::new(),
            source,
            queue: None,
            view,
            clock: Arc::new(Timestamp::now),
        }
    }

    /// Replace the wall clock used for attaching and scheduling metrics.
    pub fn with_clock(mut self, clock: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Dot-separated name used in paths and as the registry key.
    pub fn name(&self) -> &str {
        &self.identifier
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn graphite_root(&self) -> Option<&str> {
        self.graphite_root.as_deref()
    }

    pub fn metric(&self, name: &str) -> Option<&MetricInstance> {
        self.metrics.iter().find(|m| m.name() == name)
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(|m| m.name())
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn view(&self) -> Arc<ArcSwap<TargetView>> {
        Arc::clone(&self.view)
    }

    /// Queue that executed metrics feed. Assigned by the runner at start.
    pub fn attach_queue(&mut self, queue: Arc<DispatchQueue>) {
        self.queue = Some(queue);
    }

    /// Attach a copy of `definition`. A name that is already attached is
    /// logged and rejected, leaving the existing instance untouched.
    pub fn add_metric(&mut self, definition: &MetricDefinition, interval: Option<MetricInterval>) -> bool {
        if self.metric(definition.name()).is_some() {
            error!(target: "sqlgraphite::target", target_name = %self.identifier, metric = %definition.name(),
                "Cannot add the same metric to a target more than once. Change the interval of the attached metric instead");
            return false;
        }

        let instance = MetricInstance::attach(definition, interval, (self.clock)());
        debug!(target: "sqlgraphite::target", target_name = %self.identifier, metric = %instance.name(),
            interval = %instance.interval(), "Metric attached");
        self.metrics.push(instance);
        self.publish();
        true
    }

    pub fn remove_metric(&mut self, name: &str) -> TargetResult<MetricInstance> {
        let position = self
            .metrics
            .iter()
            .position(|m| m.name() == name)
            .ok_or_else(|| self.metric_not_found(name))?;
        let removed = self.metrics.remove(position);
        debug!(target: "sqlgraphite::target", target_name = %self.identifier, metric = %name, "Metric removed");
        self.publish();
        Ok(removed)
    }

    pub fn set_metric_interval(&mut self, name: &str, interval: MetricInterval) -> TargetResult<()> {
        let not_found = self.metric_not_found(name);
        let now = (self.clock)();
        let metric = self
            .metrics
            .iter_mut()
            .find(|m| m.name() == name)
            .ok_or(not_found)?;
        metric.set_interval(interval, now);
        info!(target: "sqlgraphite::target", target_name = %self.identifier, metric = %name,
            interval = %interval, "Metric interval changed");
        self.publish();
        Ok(())
    }

    /// Root path of an attached metric, `None` when it is disabled or not
    /// attached.
    pub fn metric_root(&self, name: &str) -> Option<String> {
        let metric = self.metric(name)?;
        build_metric_root(self.graphite_root.as_deref(), &self.identifier, metric.interval())
    }

    /// Run every metric due at `now` in attach order and return how many
    /// succeeded.
    ///
    /// Each run reschedules its metric to `now + interval`. A fatal metric
    /// error stops the pass and is returned; the metrics it did not reach
    /// keep their schedule.
    pub async fn check_metrics(&mut self, now: Timestamp) -> TargetResult<usize> {
        let Some(queue) = self.queue.clone() else {
            debug!(target: "sqlgraphite::target", target_name = %self.identifier, "No queue attached yet");
            return Ok(0);
        };

        let due: Vec<usize> = self
            .metrics
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_due(now))
            .map(|(i, _)| i)
            .collect();

        let mut succeeded = 0;
        for index in due {
            let root = build_metric_root(
                self.graphite_root.as_deref(),
                &self.identifier,
                self.metrics[index].interval(),
            )
            .unwrap_or_default();

            let metric = &mut self.metrics[index];
            match metric
                .execute(self.source.as_ref(), &self.identifier, &queue, &root)
                .await
            {
                Ok(ok) => {
                    metric.reschedule(now, ok);
                    succeeded += usize::from(ok);
                }
                Err(source) => {
                    let err = TargetError::Execution {
                        target: self.identifier.clone(),
                        metric: metric.name().to_string(),
                        source,
                    };
                    report_error(LogLevel::Error, "target", "Metric execution failed", &err);
                    return Err(err);
                }
            }
        }
        Ok(succeeded)
    }

    fn metric_not_found(&self, name: &str) -> TargetError {
        TargetError::MetricNotFound {
            target: self.identifier.clone(),
            metric: name.to_string(),
        }
    }

    fn publish(&self) {
        let metrics = self
            .metrics
            .iter()
            .map(|m| {
                let view = MetricView {
                    definition: m.definition().clone(),
                    interval: m.interval(),
                    root: build_metric_root(self.graphite_root.as_deref(), &self.identifier, m.interval()),
                };
                (m.name().to_string(), view)
            })
            .collect();
        self.view.store(Arc::new(TargetView {
            identifier: self.identifier.clone(),
            metrics,
        }));
    }
}

impl Debug for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("identifier", &self.identifier)
            .field("graphite_root", &self.graphite_root)
            .field("metrics", &self.metrics.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("has_queue", &self.queue.is_some())
            .finish()
    }
}

#[async_trait]
impl Periodic for Target {
    async fn on_tick(&mut self) -> LoopControl {
        let now = (self.clock)();
        match self.check_metrics(now).await {
            Ok(_) => LoopControl::Continue,
            Err(e) => {
                error!(target: "sqlgraphite::target", target_name = %self.identifier, error = %e,
                    "Target loop stopped");
                LoopControl::Stop
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Target Handle
// ----------------------------------------------------------------------------

/// A target together with the timer that drives it.
#[derive(Debug)]
pub struct TargetHandle {
    name: String,
    state: Arc<TokioMutex<Target>>,
    view: Arc<ArcSwap<TargetView>>,
    timer: PeriodicTimer,
}

impl TargetHandle {
    pub fn new(target: Target, tick: Duration, start_delay: Duration) -> Self {
        let name = target.name().to_string();
        let view = target.view();
        Self {
            timer: PeriodicTimer::new(format!("target:{name}"), tick).with_initial_delay(start_delay),
            name,
            state: Arc::new(TokioMutex::new(target)),
            view,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn view(&self) -> Arc<ArcSwap<TargetView>> {
        Arc::clone(&self.view)
    }

    /// Exclusive access to the target, waiting for an in-flight tick.
    pub async fn lock(&self) -> MutexGuard<'_, Target> {
        self.state.lock().await
    }

    /// Hand the target its queue and start the scheduling loop.
    pub async fn start(&mut self, queue: Arc<DispatchQueue>) -> bool {
        self.state.lock().await.attach_queue(queue);
        self.run()
    }

    pub fn run(&mut self) -> bool {
        let started = self.timer.start(Arc::clone(&self.state));
        if started {
            info!(target: "sqlgraphite::target", target_name = %self.name, "Target running");
        }
        started
    }

    pub async fn pause(&mut self) {
        self.timer.stop().await;
        info!(target: "sqlgraphite::target", target_name = %self.name, "Target paused");
    }

    /// Stop the loop for good. The target can still be inspected.
    pub async fn quit(&mut self) {
        self.timer.stop().await;
        debug!(target: "sqlgraphite::target", target_name = %self.name, "Target timer released");
    }

    pub fn is_running(&self) -> bool {
        self.timer.is_running()
    }
}

// ----------------------------------------------------------------------------
// Target Directory
// ----------------------------------------------------------------------------

/// Live views of every registered target, keyed by canonical name.
#[derive(Debug, Default)]
pub struct TargetDirectory {
    views: DashMap<String, Arc<ArcSwap<TargetView>>>,
}

impl TargetDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the name is already registered.
    pub fn register(&self, name: &str, view: Arc<ArcSwap<TargetView>>) -> bool {
        match self.views.entry(canonical_target_name(name)) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(view);
                true
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.views.contains_key(&canonical_target_name(name))
    }

    pub fn snapshot(&self, name: &str) -> Option<Arc<TargetView>> {
        self.views
            .get(&canonical_target_name(name))
            .map(|view| view.load_full())
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

impl MetricResolver for TargetDirectory {
    fn resolve(&self, reference: &MetricReference) -> FormulaResult<ResolvedSeries> {
        let view = self
            .snapshot(reference.server())
            .ok_or_else(|| FormulaError::TargetNotFound {
                server: reference.server().to_string(),
            })?;
        view.resolve(reference)
    }
}
