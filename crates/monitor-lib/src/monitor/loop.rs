//! The tick-driven polling loop
//!
//! One iteration per configured interval: list containers, pair raw stats
//! with the previous tick's readings, compute normalized metrics, run
//! the scaling policy, cascade-clean clones of removed originals, and
//! publish a snapshot batch.
//!
//! The update channel is a broadcast channel: the producer never blocks,
//! and a consumer that falls behind skips the oldest pending batches
//! (bounded staleness instead of backpressure). Dropping the sender on
//! shutdown closes the channel and unblocks any draining consumer.

use super::{Command, MonitorHandle, SharedBatchSender};
use crate::error::EngineError;
use crate::gateway::EngineGateway;
use crate::host::HostSampler;
use crate::metrics::{cpu_percent, memory_usage_of};
use crate::models::{
    ContainerDescriptor, ContainerSnapshot, RawStatsSample, ScalingEvent, SnapshotBatch,
};
use crate::observability::MonitorMetrics;
use crate::policy::{ClonePolicyConfig, CloneRegistry, ScalingEvaluator};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Configuration for the polling loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between ticks (default: 2 seconds)
    pub poll_interval: Duration,
    /// Whether stopped containers appear in snapshots
    pub include_stopped: bool,
    /// Update channel capacity in batches
    pub channel_capacity: usize,
    /// Foreground command queue depth
    pub command_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            include_stopped: true,
            channel_capacity: 16,
            command_buffer: 8,
        }
    }
}

/// The background polling loop. Owns the clone registry mutations and the
/// per-identity rolling stats slots; nothing else touches either.
pub struct MonitorLoop {
    gateway: Arc<dyn EngineGateway>,
    evaluator: ScalingEvaluator,
    host_sampler: Box<dyn HostSampler>,
    policy: Arc<RwLock<ClonePolicyConfig>>,
    config: MonitorConfig,
    metrics: MonitorMetrics,
    batch_tx: SharedBatchSender,
    command_rx: mpsc::Receiver<Command>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Rolling slot of size 1 per identity; this tick's reading becomes
    /// the next tick's "previous"
    prev_stats: HashMap<String, RawStatsSample>,
    tick: u64,
}

impl MonitorLoop {
    /// Build the loop and its foreground handle
    pub fn new(
        gateway: Arc<dyn EngineGateway>,
        host_sampler: Box<dyn HostSampler>,
        policy: ClonePolicyConfig,
        config: MonitorConfig,
    ) -> (Self, MonitorHandle) {
        let registry = Arc::new(CloneRegistry::new());
        let policy = Arc::new(RwLock::new(policy));
        let (batch_tx, _) = broadcast::channel(config.channel_capacity.max(1));
        let batch_tx: SharedBatchSender = Arc::new(RwLock::new(Some(batch_tx)));
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = MonitorHandle::new(
            registry.clone(),
            policy.clone(),
            command_tx,
            batch_tx.clone(),
            shutdown_tx,
        );

        let loop_instance = Self {
            evaluator: ScalingEvaluator::new(gateway.clone(), registry),
            gateway,
            host_sampler,
            policy,
            config,
            metrics: MonitorMetrics::new(),
            batch_tx,
            command_rx,
            shutdown_rx,
            prev_stats: HashMap::new(),
            tick: 0,
        };

        (loop_instance, handle)
    }

    /// Run until shutdown. The update channel closes when the loop
    /// exits, unblocking every draining subscriber.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            "starting container polling loop"
        );

        self.reconcile_on_startup().await;

        let mut ticker = interval(self.config.poll_interval);
        // A slow tick must not be followed by a burst of catch-up ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    self.run_tick().await;
                    self.metrics.observe_tick_latency(start.elapsed().as_secs_f64());
                }
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }
                _ = self.shutdown_rx.recv() => {
                    info!("shutting down polling loop");
                    break;
                }
            }
        }

        // Empty the shared slot so the channel closes even while handle
        // clones are still alive
        self.batch_tx
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    /// Rebuild clone records from provenance labels after a restart
    async fn reconcile_on_startup(&self) {
        match self.gateway.list_containers(true).await {
            Ok(listing) => self.evaluator.registry().reconcile(&listing),
            Err(e) => {
                warn!(error = %e, "could not reconcile clone records at startup");
            }
        }
    }

    /// One full tick
    async fn run_tick(&mut self) {
        // Copy-on-read: one policy snapshot per tick, updates apply next
        // tick, never mid-tick
        let policy = self
            .policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let listing = match self.gateway.list_containers(self.config.include_stopped).await {
            Ok(listing) => listing,
            Err(e) => {
                // Keep ticking so the loop recovers by itself once the
                // engine is reachable again; scaling pauses meanwhile.
                warn!(error = %e, "engine unreachable, skipping tick");
                self.metrics.inc_collection_errors();
                self.metrics.set_engine_up(false);
                let tick = self.next_tick();
                self.publish(SnapshotBatch {
                    tick,
                    captured_at: Utc::now(),
                    engine_reachable: false,
                    containers: Vec::new(),
                    events: Vec::new(),
                });
                return;
            }
        };
        self.metrics.set_engine_up(true);

        let mut events = self.cleanup_removed(&listing).await;

        let host = self.host_sampler.sample();
        let mut containers = Vec::with_capacity(listing.len());

        for descriptor in &listing {
            let Some(snapshot) = self.snapshot_container(descriptor).await else {
                continue;
            };

            if let Some(event) = self.evaluator.evaluate(&snapshot, &policy, host).await {
                self.metrics.count_scaling_event(&event);
                events.push(event);
            }
            containers.push(snapshot);
        }

        self.metrics.set_containers_monitored(containers.len() as i64);

        let tick = self.next_tick();
        self.publish(SnapshotBatch {
            tick,
            captured_at: Utc::now(),
            engine_reachable: true,
            containers,
            events,
        });
    }

    /// Build one container's snapshot, pairing raw stats with the rolling
    /// slot. Returns `None` only when the container vanished mid-tick.
    async fn snapshot_container(
        &mut self,
        descriptor: &ContainerDescriptor,
    ) -> Option<ContainerSnapshot> {
        let mut snapshot = ContainerSnapshot {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            state: descriptor.state,
            cpu_percent: 0.0,
            memory_used_mb: 0.0,
            memory_limit_bytes: 0,
            memory_percent: 0.0,
            labels: descriptor.labels.clone(),
        };

        if !descriptor.state.is_running() {
            // Counters reset across restarts; a stale slot would produce
            // a bogus delta on the next start
            self.prev_stats.remove(&descriptor.id);
            return Some(snapshot);
        }

        let current = match self.gateway.fetch_raw_stats(&descriptor.id).await {
            Ok(sample) => sample,
            Err(EngineError::ContainerGone { .. }) => {
                debug!(container = %descriptor.name, "container vanished before stats");
                self.prev_stats.remove(&descriptor.id);
                return None;
            }
            Err(e) => {
                // One container's stats failure must not abort the tick;
                // report it with zeroed metrics
                debug!(container = %descriptor.name, error = %e, "stats fetch failed");
                self.metrics.inc_collection_errors();
                return Some(snapshot);
            }
        };

        if let Some(previous) = self.prev_stats.get(&descriptor.id) {
            snapshot.cpu_percent = cpu_percent(&current, previous);
        }
        let memory = memory_usage_of(&current);
        snapshot.memory_used_mb = memory.used_mb;
        snapshot.memory_percent = memory.percent;
        snapshot.memory_limit_bytes = current.memory_limit_bytes;

        self.prev_stats.insert(descriptor.id.clone(), current);
        Some(snapshot)
    }

    /// Drop bookkeeping for containers absent from the current listing:
    /// cascade away the clones of a removed original, and drop records
    /// for clones removed behind our back. Runs before evaluation, so a
    /// record inserted this tick is never swept on the tick that created
    /// it.
    async fn cleanup_removed(&mut self, listing: &[ContainerDescriptor]) -> Vec<ScalingEvent> {
        let present: HashSet<&str> = listing.iter().map(|d| d.id.as_str()).collect();
        self.prev_stats.retain(|id, _| present.contains(id.as_str()));

        let mut events = Vec::new();

        for original_id in self.evaluator.registry().originals() {
            if present.contains(original_id.as_str()) {
                continue;
            }
            if let Some(event) = self.evaluator.reap_clones_of(&original_id).await {
                self.metrics.count_scaling_event(&event);
                events.push(event);
            }
        }

        // The surviving originals still exist; any of their recorded
        // clones missing from the listing was removed externally
        for original_id in self.evaluator.registry().originals() {
            for record in self.evaluator.registry().clones_of(&original_id) {
                if present.contains(record.clone_id.as_str()) {
                    continue;
                }
                if self
                    .evaluator
                    .registry()
                    .remove_clone(&record.clone_id)
                    .is_some()
                {
                    debug!(
                        clone_id = %record.clone_id,
                        original_id = %record.original_id,
                        "clone removed externally, dropping record"
                    );
                }
            }
        }

        events
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestClone { original_id, reply } => {
                let result = self.manual_clone(&original_id).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Execute a foreground clone request on the loop task
    async fn manual_clone(&mut self, original_id: &str) -> Result<ScalingEvent, EngineError> {
        let policy = self
            .policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let listing = self.gateway.list_containers(true).await?;
        let descriptor = listing
            .iter()
            .find(|d| d.id == original_id || d.name == original_id || d.id.starts_with(original_id))
            .ok_or_else(|| EngineError::gone(original_id))?;

        let snapshot = ContainerSnapshot {
            id: descriptor.id.clone(),
            name: descriptor.name.clone(),
            state: descriptor.state,
            cpu_percent: 0.0,
            memory_used_mb: 0.0,
            memory_limit_bytes: 0,
            memory_percent: 0.0,
            labels: descriptor.labels.clone(),
        };

        match self.evaluator.request_clone(&snapshot, &policy).await {
            Ok(ScalingEvent::CloneFailed { reason, .. }) => {
                Err(EngineError::clone_failed(&snapshot.name, reason))
            }
            Ok(event) => {
                self.metrics.count_scaling_event(&event);
                Ok(event)
            }
            Err(denied) => Err(EngineError::clone_failed(&snapshot.name, denied.to_string())),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Publish a batch. Never blocks; with no subscriber the batch is
    /// simply dropped.
    fn publish(&self, batch: SnapshotBatch) {
        let guard = self
            .batch_tx
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(batch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineResult;
    use crate::gateway::async_trait;
    use crate::host::{FixedSampler, HostResources};
    use crate::models::{
        CloneSource, ContainerState, LABEL_CLONE, LABEL_CLONEABLE, LABEL_ORIGINAL,
    };
    use std::sync::Mutex;

    /// Scriptable fake engine: the listing can be swapped between ticks
    #[derive(Default)]
    struct ScriptedGateway {
        listing: Mutex<Vec<ContainerDescriptor>>,
        stats: Mutex<HashMap<String, RawStatsSample>>,
        removed: Mutex<Vec<String>>,
        unreachable: Mutex<bool>,
    }

    impl ScriptedGateway {
        fn set_listing(&self, listing: Vec<ContainerDescriptor>) {
            *self.listing.lock().unwrap() = listing;
        }

        fn set_stats(&self, id: &str, sample: RawStatsSample) {
            self.stats.lock().unwrap().insert(id.to_string(), sample);
        }
    }

    #[async_trait]
    impl EngineGateway for ScriptedGateway {
        async fn ping(&self) -> EngineResult<()> {
            Ok(())
        }

        async fn list_containers(&self, _: bool) -> EngineResult<Vec<ContainerDescriptor>> {
            if *self.unreachable.lock().unwrap() {
                return Err(EngineError::unavailable("scripted outage"));
            }
            Ok(self.listing.lock().unwrap().clone())
        }

        async fn fetch_raw_stats(&self, id: &str) -> EngineResult<RawStatsSample> {
            self.stats
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| EngineError::gone(id))
        }

        async fn inspect_source(&self, _: &str) -> EngineResult<CloneSource> {
            Ok(CloneSource {
                image: "nginx:latest".into(),
                ..Default::default()
            })
        }

        async fn create_clone(
            &self,
            _: &CloneSource,
            name: &str,
            _: HashMap<String, String>,
        ) -> EngineResult<String> {
            Ok(format!("id-{name}"))
        }

        async fn stop_and_remove(&self, id: &str, _: bool) -> EngineResult<()> {
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn running(id: &str, labels: &[(&str, &str)]) -> ContainerDescriptor {
        ContainerDescriptor {
            id: id.into(),
            name: format!("{id}-name"),
            state: ContainerState::Running,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn sample(total: u64, system: u64) -> RawStatsSample {
        RawStatsSample {
            cpu_total_usage: total,
            system_cpu_usage: system,
            online_cpus: 4,
            memory_usage_bytes: 100 * 1024 * 1024,
            memory_limit_bytes: 500 * 1024 * 1024,
            ..Default::default()
        }
    }

    fn build_loop(
        gateway: Arc<ScriptedGateway>,
        policy: ClonePolicyConfig,
    ) -> (MonitorLoop, MonitorHandle) {
        let sampler = FixedSampler(HostResources {
            free_memory_bytes: 8 << 30,
            free_cpu_percent: 90.0,
        });
        MonitorLoop::new(
            gateway,
            Box::new(sampler),
            policy,
            MonitorConfig::default(),
        )
    }

    #[tokio::test]
    async fn tick_publishes_batch_with_metrics() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_listing(vec![running("c1", &[])]);
        gateway.set_stats("c1", sample(800, 4000));

        let (mut monitor, handle) = build_loop(gateway.clone(), ClonePolicyConfig::default());
        let mut rx = handle.subscribe();

        monitor.run_tick().await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.tick, 1);
        assert!(first.engine_reachable);
        assert_eq!(first.containers.len(), 1);
        // First observation has no previous reading to pair with
        assert_eq!(first.containers[0].cpu_percent, 0.0);
        assert_eq!(first.containers[0].memory_used_mb, 100.0);
        assert_eq!(first.containers[0].memory_percent, 20.0);

        gateway.set_stats("c1", sample(1000, 5000));
        monitor.run_tick().await;
        let second = rx.recv().await.unwrap();
        assert_eq!(second.tick, 2);
        // (200 / 1000) * 4 * 100
        assert_eq!(second.containers[0].cpu_percent, 80.0);
    }

    #[tokio::test]
    async fn engine_outage_keeps_ticking_and_flags_batches() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_listing(vec![running("c1", &[])]);
        gateway.set_stats("c1", sample(800, 4000));

        let (mut monitor, handle) = build_loop(gateway.clone(), ClonePolicyConfig::default());
        let mut rx = handle.subscribe();

        monitor.run_tick().await;
        assert!(rx.recv().await.unwrap().engine_reachable);

        *gateway.unreachable.lock().unwrap() = true;
        monitor.run_tick().await;
        let degraded = rx.recv().await.unwrap();
        assert!(!degraded.engine_reachable);
        assert!(degraded.containers.is_empty());

        *gateway.unreachable.lock().unwrap() = false;
        monitor.run_tick().await;
        assert!(rx.recv().await.unwrap().engine_reachable);
    }

    #[tokio::test]
    async fn removed_original_cascades_clone_removal() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut policy = ClonePolicyConfig::default();
        policy.auto_scaling_enabled = true;
        policy.cpu_threshold_percent = 50.0;
        policy.max_clones_per_original = 2;

        gateway.set_listing(vec![running("orig", &[(LABEL_CLONEABLE, "true")])]);
        gateway.set_stats("orig", sample(800, 4000));

        let (mut monitor, handle) = build_loop(gateway.clone(), policy);
        let mut rx = handle.subscribe();

        // Two ticks: the second has a cpu delta breaching the threshold
        monitor.run_tick().await;
        gateway.set_stats("orig", sample(2000, 5000));
        monitor.run_tick().await;

        let _ = rx.recv().await.unwrap();
        let breach = rx.recv().await.unwrap();
        assert!(matches!(
            breach.events.as_slice(),
            [ScalingEvent::CloneCreated { .. }]
        ));
        assert_eq!(handle.clones_of("orig").len(), 1);
        let clone_id = handle.clones_of("orig")[0].clone_id.clone();

        // The original disappears from the listing
        gateway.set_listing(vec![]);
        monitor.run_tick().await;

        let cleanup = rx.recv().await.unwrap();
        assert!(matches!(
            cleanup.events.as_slice(),
            [ScalingEvent::ClonesReaped { reaped: 1, .. }]
        ));
        assert!(handle.clones_of("orig").is_empty());
        assert!(gateway.removed.lock().unwrap().contains(&clone_id));
    }

    #[tokio::test]
    async fn vanished_container_is_skipped_not_fatal() {
        let gateway = Arc::new(ScriptedGateway::default());
        // c2 is listed but has no stats: the fake answers ContainerGone
        gateway.set_listing(vec![running("c1", &[]), running("c2", &[])]);
        gateway.set_stats("c1", sample(800, 4000));

        let (mut monitor, handle) = build_loop(gateway, ClonePolicyConfig::default());
        let mut rx = handle.subscribe();

        monitor.run_tick().await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.containers.len(), 1);
        assert_eq!(batch.containers[0].id, "c1");
    }

    #[tokio::test]
    async fn slow_consumer_skips_oldest_batches() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_listing(vec![]);

        let gw: Arc<ScriptedGateway> = gateway.clone();
        let sampler = FixedSampler(HostResources {
            free_memory_bytes: 8 << 30,
            free_cpu_percent: 90.0,
        });
        let config = MonitorConfig {
            channel_capacity: 2,
            ..Default::default()
        };
        let (mut monitor, handle) =
            MonitorLoop::new(gw, Box::new(sampler), ClonePolicyConfig::default(), config);
        let mut rx = handle.subscribe();

        // Produce far more batches than the channel holds; the producer
        // must never block
        for _ in 0..10 {
            monitor.run_tick().await;
        }

        // The lagged consumer first observes the overflow, then drains
        // the newest batches
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let batch = rx.recv().await.unwrap();
        assert!(batch.tick >= 9);
    }

    #[tokio::test]
    async fn externally_removed_clone_record_is_dropped() {
        let gateway = Arc::new(ScriptedGateway::default());
        let clone_labels = [(LABEL_CLONE, "true"), (LABEL_ORIGINAL, "orig")];
        gateway.set_listing(vec![
            running("orig", &[]),
            running("clone-1", &clone_labels),
        ]);
        gateway.set_stats("orig", sample(800, 4000));
        gateway.set_stats("clone-1", sample(100, 4000));

        let (mut monitor, handle) = build_loop(gateway.clone(), ClonePolicyConfig::default());

        // Seed the registry the way startup reconciliation would
        monitor.reconcile_on_startup().await;
        assert_eq!(handle.clones_of("orig").len(), 1);

        monitor.run_tick().await;

        // The clone disappears while its original stays
        gateway.set_listing(vec![running("orig", &[])]);
        monitor.run_tick().await;

        assert!(handle.clones_of("orig").is_empty());
        // The original is still alive, so nothing was force-removed
        assert!(gateway.removed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_is_dropped_when_clone_vanishes_before_any_listing() {
        let gateway = Arc::new(ScriptedGateway::default());
        let mut policy = ClonePolicyConfig::default();
        policy.auto_scaling_enabled = true;
        policy.cpu_threshold_percent = 50.0;
        policy.max_clones_per_original = 1;

        gateway.set_listing(vec![running("orig", &[(LABEL_CLONEABLE, "true")])]);
        gateway.set_stats("orig", sample(800, 4000));

        let (mut monitor, handle) = build_loop(gateway.clone(), policy);

        monitor.run_tick().await;
        gateway.set_stats("orig", sample(2000, 5000));
        monitor.run_tick().await;
        assert_eq!(handle.clones_of("orig").len(), 1);

        // The clone was killed externally before it ever appeared in a
        // listing; its record must not survive the next tick, or the
        // per-original cap would stay consumed forever
        monitor.run_tick().await;
        assert!(handle.clones_of("orig").is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_update_channel() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_listing(vec![]);

        let (monitor, handle) = build_loop(gateway, ClonePolicyConfig::default());
        let mut rx = handle.subscribe();

        let task = tokio::spawn(monitor.run());
        handle.shutdown();
        task.await.unwrap();

        // The handle is still alive, yet shutdown alone must close the
        // channel so a draining consumer unblocks
        loop {
            match rx.recv().await {
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) | Ok(_) => continue,
            }
        }

        // Late subscribers get an already-closed stream
        let mut late = handle.subscribe();
        assert!(matches!(
            late.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn manual_clone_command_runs_on_loop_task() {
        let gateway = Arc::new(ScriptedGateway::default());
        gateway.set_listing(vec![running("orig", &[])]);
        gateway.set_stats("orig", sample(800, 4000));

        let (monitor, handle) = build_loop(gateway, ClonePolicyConfig::default());
        let task = tokio::spawn(monitor.run());

        let event = handle.request_clone("orig").await.unwrap();
        assert!(matches!(event, ScalingEvent::CloneCreated { .. }));
        assert_eq!(handle.clones_of("orig").len(), 1);

        // Unknown identity is surfaced synchronously
        let err = handle.request_clone("nope").await.unwrap_err();
        assert!(matches!(err, EngineError::ContainerGone { .. }));

        handle.shutdown();
        task.await.unwrap();
    }
}
