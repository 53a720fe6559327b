//! Periodic CPU/memory sampling.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::session::{EventBroadcaster, ResourceSample, RingBuffer, ServiceEvent};
use crate::subprocess::shutdown_requested;

/// Provider of host utilization figures, in percent.
pub trait MetricsSource: Send + 'static {
    fn cpu_percent(&mut self) -> f32;
    fn memory_percent(&mut self) -> f32;
}

/// Host-wide figures from `sysinfo`.
pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first reading.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn cpu_percent(&mut self) -> f32 {
        self.system.refresh_cpu_usage();
        self.system.global_cpu_usage()
    }

    #[allow(clippy::cast_precision_loss)]
    fn memory_percent(&mut self) -> f32 {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return 0.0;
        }
        (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
    }
}

/// Bounded sample history shared with status readers.
pub struct ResourceHistory {
    samples: Mutex<RingBuffer<ResourceSample>>,
}

impl ResourceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    pub fn push(&self, sample: ResourceSample) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
    }

    pub fn latest(&self) -> Option<ResourceSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest()
            .copied()
    }

    /// Retained samples, oldest first.
    pub fn snapshot(&self) -> Vec<ResourceSample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_vec()
    }
}

/// Samples on a fixed interval, records and publishes each sample.
pub struct ResourceSampler<S> {
    source: S,
    interval: Duration,
    history: Arc<ResourceHistory>,
    broadcaster: Arc<EventBroadcaster>,
}

impl<S: MetricsSource> ResourceSampler<S> {
    pub const fn new(
        source: S,
        interval: Duration,
        history: Arc<ResourceHistory>,
        broadcaster: Arc<EventBroadcaster>,
    ) -> Self {
        Self {
            source,
            interval,
            history,
            broadcaster,
        }
    }

    /// Take one sample, retain it and publish it.
    pub fn sample_once(&mut self) -> ResourceSample {
        let sample = ResourceSample {
            cpu_percent: self.source.cpu_percent(),
            memory_percent: self.source.memory_percent(),
            timestamp: Utc::now(),
        };
        self.history.push(sample);
        let delivered = self
            .broadcaster
            .publish(ServiceEvent::Resource(sample));
        debug!(
            cpu = sample.cpu_percent,
            memory = sample.memory_percent,
            delivered,
            "Resource sample"
        );
        sample
    }

    /// Run until shutdown is flagged.
    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?self.interval, "Resource sampler started");
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        self.sample_once();
                    }
                    () = shutdown_requested(&mut shutdown) => break,
                }
            }
            info!("Resource sampler stopped");
        })
    }
}
