//! Memory budget management for cached page images
//!
//! Decides how much memory decoded and filtered pages may occupy, how far a
//! decode must be downsampled to fit a target footprint, and when to tell
//! listeners that the cache is under memory pressure.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bitmap::PageBitmap;

/// Ceiling used when the platform cannot report its memory size.
pub const FALLBACK_TOTAL_MEMORY: usize = 512 * BYTES_PER_MB;

pub const BYTES_PER_MB: usize = 1024 * 1024;

/// Memory pressure level indicating cache health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryPressure {
    /// Memory usage is low (< 50% utilization)
    Low,
    /// Memory usage is moderate (50-75% utilization)
    Moderate,
    /// Memory usage is high (75-90% utilization)
    High,
    /// Memory usage is critical (> 90% utilization)
    Critical,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// Returns true if memory pressure requires action (High or Critical)
    pub fn needs_eviction(&self) -> bool {
        matches!(self, MemoryPressure::High | MemoryPressure::Critical)
    }
}

/// Thresholds for the image memory budget
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryBudgetConfig {
    /// Share of total memory that cached images may use, in (0, 1)
    pub max_allowed_fraction: f64,
    /// Usage ratio (of the allowed budget) at which listeners are warned
    pub warning_threshold: f64,
    /// Target usage ratio after a pressure-driven trim
    pub target_utilization: f64,
    /// Overrides the probed total memory, in bytes
    pub memory_limit: Option<usize>,
}

impl Default for MemoryBudgetConfig {
    fn default() -> Self {
        Self {
            max_allowed_fraction: 0.25,
            warning_threshold: 0.85,
            target_utilization: 0.70,
            memory_limit: None,
        }
    }
}

impl MemoryBudgetConfig {
    /// Set the share of total memory cached images may use
    pub fn with_max_allowed_fraction(mut self, fraction: f64) -> Self {
        self.max_allowed_fraction = fraction;
        self
    }

    /// Set the warning threshold (0.0 to 1.0)
    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the target utilization after eviction (0.0 to 1.0)
    pub fn with_target_utilization(mut self, target: f64) -> Self {
        self.target_utilization = target.clamp(0.0, 1.0);
        self
    }

    /// Pin total memory instead of asking the platform, in megabytes.
    /// Saturates at `usize::MAX` bytes.
    pub fn with_memory_limit_mb(mut self, megabytes: usize) -> Self {
        self.memory_limit = Some(megabytes.saturating_mul(BYTES_PER_MB));
        self
    }

    /// Clamp every ratio into its valid range.
    ///
    /// `max_allowed_fraction` stays strictly inside (0, 1) so the allowed
    /// budget is always below total memory.
    pub fn validated(mut self) -> Self {
        let fraction = if self.max_allowed_fraction.is_finite() {
            self.max_allowed_fraction
        } else {
            Self::default().max_allowed_fraction
        };
        self.max_allowed_fraction = fraction.clamp(0.01, 0.95);
        self.warning_threshold = self.warning_threshold.clamp(0.0, 1.0);
        self.target_utilization = self.target_utilization.clamp(0.0, 1.0);
        self.memory_limit = self.memory_limit.filter(|limit| *limit > 0);
        self
    }
}

/// Source of the runtime memory ceiling.
pub trait MemoryProbe: Send + Sync {
    /// Total memory available to the process in bytes, if known.
    fn total_memory(&self) -> Option<usize>;
}

/// Asks the operating system for physical memory size.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemoryProbe;

impl MemoryProbe for SystemMemoryProbe {
    #[cfg(target_os = "linux")]
    fn total_memory(&self) -> Option<usize> {
        let mut info = std::mem::MaybeUninit::<libc::sysinfo>::uninit();
        let rc = unsafe { libc::sysinfo(info.as_mut_ptr()) };
        if rc != 0 {
            return None;
        }
        let info = unsafe { info.assume_init() };
        let total = (info.totalram as u64).saturating_mul(info.mem_unit as u64);
        usize::try_from(total).ok().filter(|total| *total > 0)
    }

    #[cfg(not(target_os = "linux"))]
    fn total_memory(&self) -> Option<usize> {
        None
    }
}

/// Reports a fixed total, for tests and explicit overrides.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub usize);

impl MemoryProbe for FixedMemoryProbe {
    fn total_memory(&self) -> Option<usize> {
        Some(self.0)
    }
}

/// Snapshot of the image memory budget.
///
/// Always consistent: `used <= total`, `max_allowed < total`,
/// `available <= max_allowed` and `usage_ratio` in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryReport {
    /// Total memory ceiling in bytes
    pub total: usize,
    /// Bytes still available to cached images
    pub available: usize,
    /// Bytes currently charged by cached images
    pub used: usize,
    /// Bytes cached images may use at most
    pub max_allowed: usize,
    /// `used / max_allowed`, clamped to `[0, 1]`
    pub usage_ratio: f64,
}

impl MemoryReport {
    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.usage_ratio)
    }
}

/// Identifies a registered memory-warning listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type WarningListener = Arc<dyn Fn(&MemoryReport) + Send + Sync>;

/// Memory budget manager shared by the cache and the page pipeline.
///
/// Cached bytes are tracked with atomics so the cache can charge and refund
/// entries without taking another lock.
///
/// # Example
///
/// ```
/// use reader_cache::{FixedMemoryProbe, MemoryBudgetConfig, MemoryBudgetManager};
///
/// let manager = MemoryBudgetManager::with_probe(
///     MemoryBudgetConfig::default(),
///     FixedMemoryProbe(1024 * 1024 * 1024),
/// );
///
/// // A 4000x6000 scan shown in a 1000x1500 viewport decodes at 1/4 size
/// assert_eq!(MemoryBudgetManager::calculate_sample_size(4000, 6000, 1000, 1500), 4);
///
/// let report = manager.memory_report();
/// assert!(report.max_allowed < report.total);
/// ```
pub struct MemoryBudgetManager {
    config: MemoryBudgetConfig,
    probe: Box<dyn MemoryProbe>,
    current_usage: AtomicUsize,
    listeners: Mutex<Vec<(ListenerId, WarningListener)>>,
    next_listener: AtomicU64,
}

impl MemoryBudgetManager {
    /// Create a manager that asks the operating system for total memory
    pub fn new(config: MemoryBudgetConfig) -> Self {
        Self::with_probe(config, SystemMemoryProbe)
    }

    /// Create a manager with a custom memory probe
    pub fn with_probe<P: MemoryProbe + 'static>(config: MemoryBudgetConfig, probe: P) -> Self {
        Self {
            config: config.validated(),
            probe: Box::new(probe),
            current_usage: AtomicUsize::new(0),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Largest power-of-two divisor that still covers the target size.
    ///
    /// Returns 1 when the source already fits. Doubles while halving the
    /// source keeps both dimensions at or above the target, so a source of
    /// exactly 2× the target yields 2 and 4× yields 4.
    pub fn calculate_sample_size(
        original_width: u32,
        original_height: u32,
        target_width: u32,
        target_height: u32,
    ) -> u32 {
        let target_width = target_width.max(1);
        let target_height = target_height.max(1);
        let mut sample_size = 1u32;

        if original_width > target_width || original_height > target_height {
            let half_width = original_width / 2;
            let half_height = original_height / 2;
            while half_width / sample_size >= target_width
                && half_height / sample_size >= target_height
            {
                sample_size *= 2;
            }
        }

        sample_size
    }

    /// Total memory ceiling in bytes (configured override, probe, or fallback)
    pub fn total_memory(&self) -> usize {
        self.config
            .memory_limit
            .or_else(|| self.probe.total_memory())
            .filter(|total| *total > 0)
            .unwrap_or(FALLBACK_TOTAL_MEMORY)
    }

    /// Bytes cached images may use at most; strictly below total memory
    pub fn max_allowed_memory(&self) -> usize {
        let total = self.total_memory();
        let allowed = (total as f64 * self.config.max_allowed_fraction) as usize;
        allowed.min(total.saturating_sub(1))
    }

    /// Bytes still available to cached images
    pub fn available_memory(&self) -> usize {
        self.max_allowed_memory().saturating_sub(self.current_usage())
    }

    /// Bytes currently charged by cached images
    pub fn current_usage(&self) -> usize {
        self.current_usage.load(Ordering::Relaxed)
    }

    /// Record a memory allocation
    pub fn record_allocation(&self, bytes: usize) {
        self.current_usage.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a memory deallocation
    pub fn record_deallocation(&self, bytes: usize) {
        self.current_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            })
            .ok();
    }

    /// Check if the given allocation fits in what is left of the budget
    pub fn can_allocate(&self, bytes: usize) -> bool {
        self.current_usage().saturating_add(bytes) <= self.max_allowed_memory()
    }

    /// Bytes to drop to get back down to the target utilization
    pub fn bytes_to_evict(&self) -> usize {
        let target = (self.max_allowed_memory() as f64 * self.config.target_utilization) as usize;
        self.current_usage().saturating_sub(target)
    }

    /// Snapshot of total/available/used/max-allowed memory
    pub fn memory_report(&self) -> MemoryReport {
        let total = self.total_memory();
        let max_allowed = self.max_allowed_memory();
        let used = self.current_usage().min(total);
        let usage_ratio = if max_allowed == 0 {
            if used == 0 {
                0.0
            } else {
                1.0
            }
        } else {
            (used as f64 / max_allowed as f64).clamp(0.0, 1.0)
        };

        MemoryReport {
            total,
            available: max_allowed.saturating_sub(used),
            used,
            max_allowed,
            usage_ratio,
        }
    }

    /// Get the current memory pressure level
    pub fn pressure(&self) -> MemoryPressure {
        self.memory_report().pressure()
    }

    /// Release a bitmap's pixels.
    ///
    /// `None` and already-released bitmaps are a no-op. Returns true when
    /// this call freed the pixels.
    pub fn recycle_bitmap(&self, bitmap: Option<&PageBitmap>) -> bool {
        match bitmap {
            Some(bitmap) => bitmap.recycle(),
            None => false,
        }
    }

    /// Register a listener fired by [`check_memory_pressure`] once usage
    /// crosses the warning threshold. Never fails.
    ///
    /// [`check_memory_pressure`]: MemoryBudgetManager::check_memory_pressure
    pub fn add_memory_warning_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MemoryReport) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_memory_warning_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Evaluate current usage and notify listeners if over the warning
    /// threshold. Returns the pressure level observed.
    pub fn check_memory_pressure(&self) -> MemoryPressure {
        let report = self.memory_report();
        let pressure = report.pressure();

        if report.usage_ratio >= self.config.warning_threshold && report.used > 0 {
            // Listeners run outside the lock so they may call back into us
            let listeners: Vec<WarningListener> = self
                .listeners
                .lock()
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            warn!(
                used = report.used,
                max_allowed = report.max_allowed,
                ratio = report.usage_ratio,
                listeners = listeners.len(),
                "image memory over warning threshold"
            );
            for listener in listeners {
                listener(&report);
            }
        } else {
            debug!(used = report.used, ratio = report.usage_ratio, "memory check");
        }

        pressure
    }

    /// Get the configuration
    pub fn config(&self) -> &MemoryBudgetConfig {
        &self.config
    }
}

impl Default for MemoryBudgetManager {
    fn default() -> Self {
        Self::new(MemoryBudgetConfig::default())
    }
}

impl std::fmt::Debug for MemoryBudgetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBudgetManager")
            .field("config", &self.config)
            .field("current_usage", &self.current_usage())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}
