//! Memory / CPU load governor.
//!
//! Samples system pressure at a fixed cadence and publishes a frame
//! acceptance policy for the capture/decode stage upstream of the core.
//! It never discards frames already inside the frame slot — latest-wins
//! already bounds memory there.
//!
//! Both signals are debounced: a state transition requires the same
//! condition across [`HYSTERESIS_SAMPLES`] consecutive samples, so a
//! transient spike cannot flip the policy back and forth.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::MiraError;
use crate::stats::{GovernorState, PipelineStats};

/// Consecutive samples required before a transition takes effect.
pub const HYSTERESIS_SAMPLES: u32 = 3;

/// Default sampling cadence.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Memory margin below which the governor degrades, as a fraction of
/// total pages.
const LOW_MEMORY_FRACTION: f64 = 0.10;

/// Margin above which the governor recovers.
const RECOVERED_MEMORY_FRACTION: f64 = 0.20;

/// CPU utilization above which the CPU governor degrades.
const HIGH_CPU_FRACTION: f64 = 0.90;

/// Utilization below which the CPU governor recovers.
const RECOVERED_CPU_FRACTION: f64 = 0.60;

// ── Samples ──────────────────────────────────────────────────────

/// Memory pressure sample. `free_equivalent_pages` counts reclaimable
/// cache pages as free, not just raw free memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub free_equivalent_pages: u64,
    pub total_pages: u64,
}

/// Cumulative CPU time sample; utilization is the delta between two
/// consecutive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSample {
    pub busy_ticks: u64,
    pub total_ticks: u64,
}

/// Source of system load signals. Production uses [`ProcSampler`];
/// tests substitute a scripted fake.
pub trait SystemSampler: Send {
    fn memory(&mut self) -> Option<MemorySample>;
    fn cpu(&mut self) -> Option<CpuSample>;
}

// ── FramePolicy ──────────────────────────────────────────────────

/// Frame acceptance policy published to upstream collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FramePolicy {
    /// `Some(n)`: drop every nth frame before decode.
    pub drop_interval: Option<u32>,
    /// `Some(fps)`: ask the remote encoder for a lower frame rate.
    pub target_fps: Option<u32>,
}

// ── LoadGovernor ─────────────────────────────────────────────────

/// Debounce tracker for one signal.
#[derive(Debug, Default)]
struct Debounce {
    degraded: bool,
    streak: u32,
}

impl Debounce {
    /// Feed one sample's verdict; returns `true` when the state flipped.
    fn observe(&mut self, over_limit: bool, under_recovery: bool) -> bool {
        let wants = if self.degraded {
            // Leaving degraded requires sustained recovery.
            if under_recovery { Some(false) } else { None }
        } else if over_limit {
            Some(true)
        } else {
            None
        };

        match wants {
            Some(target) => {
                self.streak += 1;
                if self.streak >= HYSTERESIS_SAMPLES {
                    self.degraded = target;
                    self.streak = 0;
                    return true;
                }
                false
            }
            None => {
                self.streak = 0;
                false
            }
        }
    }
}

/// Governor configuration.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Drop cadence applied while memory-degraded.
    pub degraded_drop_interval: u32,
    /// Frame rate requested while cpu-degraded (CPU governor only).
    pub reduced_fps: u32,
    /// The CPU governor is a no-op unless explicitly enabled.
    pub cpu_governor_enabled: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            degraded_drop_interval: 2,
            reduced_fps: 30,
            cpu_governor_enabled: false,
        }
    }
}

/// Periodic observer of memory margin and CPU utilization delta.
pub struct LoadGovernor {
    sampler: Box<dyn SystemSampler>,
    config: GovernorConfig,
    memory: Debounce,
    cpu: Debounce,
    prev_cpu: Option<CpuSample>,
    policy_tx: watch::Sender<FramePolicy>,
    stats: Arc<PipelineStats>,
}

impl LoadGovernor {
    pub fn new(
        sampler: impl SystemSampler + 'static,
        config: GovernorConfig,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let (policy_tx, _) = watch::channel(FramePolicy::default());
        Self {
            sampler: Box::new(sampler),
            config,
            memory: Debounce::default(),
            cpu: Debounce::default(),
            prev_cpu: None,
            policy_tx,
            stats,
        }
    }

    /// Subscribe to policy updates.
    pub fn policy(&self) -> watch::Receiver<FramePolicy> {
        self.policy_tx.subscribe()
    }

    /// Take one sample of each signal and update the published policy.
    /// Intended to run at a fixed timer cadence.
    pub fn update(&mut self) {
        let mut changed = false;

        if let Some(mem) = self.sampler.memory() {
            changed |= self.update_memory(mem);
        }
        if self.config.cpu_governor_enabled {
            if let Some(cpu) = self.sampler.cpu() {
                changed |= self.update_cpu(cpu);
            }
        }

        if changed {
            let policy = self.current_policy();
            self.stats.set_governor_state(if self.memory.degraded || self.cpu.degraded {
                GovernorState::Degraded
            } else {
                GovernorState::Normal
            });
            info!(?policy, "frame policy changed");
            let _ = self.policy_tx.send(policy);
        }
    }

    /// Drive `update()` on a timer until the watch channel has no
    /// subscribers left.
    pub async fn run(mut self, interval: Duration) -> Result<(), MiraError> {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.update();
            if self.policy_tx.receiver_count() == 0 {
                debug!("no policy subscribers, governor exiting");
                return Ok(());
            }
        }
    }

    fn current_policy(&self) -> FramePolicy {
        FramePolicy {
            drop_interval: self
                .memory
                .degraded
                .then_some(self.config.degraded_drop_interval),
            target_fps: (self.cpu.degraded && self.config.cpu_governor_enabled)
                .then_some(self.config.reduced_fps),
        }
    }

    fn update_memory(&mut self, sample: MemorySample) -> bool {
        if sample.total_pages == 0 {
            warn!("memory sample with zero total pages, ignoring");
            return false;
        }
        let margin = sample.free_equivalent_pages as f64 / sample.total_pages as f64;
        let flipped = self
            .memory
            .observe(margin < LOW_MEMORY_FRACTION, margin > RECOVERED_MEMORY_FRACTION);
        if flipped {
            debug!(margin, degraded = self.memory.degraded, "memory state flipped");
        }
        flipped
    }

    fn update_cpu(&mut self, sample: CpuSample) -> bool {
        let Some(prev) = self.prev_cpu.replace(sample) else {
            // First sample only establishes the baseline.
            return false;
        };
        let total = sample.total_ticks.saturating_sub(prev.total_ticks);
        if total == 0 {
            return false;
        }
        let busy = sample.busy_ticks.saturating_sub(prev.busy_ticks);
        let utilization = busy as f64 / total as f64;
        let flipped = self.cpu.observe(
            utilization > HIGH_CPU_FRACTION,
            utilization < RECOVERED_CPU_FRACTION,
        );
        if flipped {
            debug!(utilization, degraded = self.cpu.degraded, "cpu state flipped");
        }
        flipped
    }
}

// ── ProcSampler ──────────────────────────────────────────────────

/// `/proc`-backed sampler (Linux).
#[derive(Debug, Default)]
pub struct ProcSampler;

impl SystemSampler for ProcSampler {
    fn memory(&mut self) -> Option<MemorySample> {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total = None;
        let mut available = None;
        for line in meminfo.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total = parse_kib(rest);
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                // MemAvailable already counts reclaimable caches as free.
                available = parse_kib(rest);
            }
        }
        Some(MemorySample {
            free_equivalent_pages: available? / 4,
            total_pages: total? / 4,
        })
    }

    fn cpu(&mut self) -> Option<CpuSample> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Some(CpuSample {
            busy_ticks: total - idle,
            total_ticks: total,
        })
    }
}

fn parse_kib(rest: &str) -> Option<u64> {
    rest.trim().split_whitespace().next()?.parse().ok()
}

// ── Tests ────────────────────────────────────────────────────────
