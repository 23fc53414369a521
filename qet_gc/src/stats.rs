//! Collector statistics.
//!
//! Atomic counters updated from mutators and the collector alike; cheap
//! enough to keep on unconditionally.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about allocation and collection activity.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Total objects allocated since start.
    pub objects_allocated: AtomicU64,
    /// Total bytes allocated since start.
    pub bytes_allocated: AtomicU64,
    /// Total objects reclaimed since start.
    pub objects_freed: AtomicU64,
    /// Total bytes reclaimed since start.
    pub bytes_freed: AtomicU64,
    /// Completed collection cycles.
    pub cycles: AtomicU64,
    /// Interned strings created (not hits on existing nodes).
    pub strings_interned: AtomicU64,
    /// Interned strings condemned by the sweep race.
    pub strings_evicted: AtomicU64,
}

impl GcStats {
    /// Create new zeroed statistics.
    pub const fn new() -> Self {
        Self {
            objects_allocated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            objects_freed: AtomicU64::new(0),
            bytes_freed: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            strings_interned: AtomicU64::new(0),
            strings_evicted: AtomicU64::new(0),
        }
    }

    /// Record one allocation.
    #[inline]
    pub fn record_allocation(&self, bytes: usize) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one reclamation.
    #[inline]
    pub fn record_free(&self, bytes: usize) {
        self.objects_freed.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record a completed cycle.
    #[inline]
    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Live object estimate (allocated minus freed).
    pub fn live_objects(&self) -> u64 {
        self.objects_allocated
            .load(Ordering::Relaxed)
            .saturating_sub(self.objects_freed.load(Ordering::Relaxed))
    }

    /// Live byte estimate.
    pub fn live_bytes(&self) -> u64 {
        self.bytes_allocated
            .load(Ordering::Relaxed)
            .saturating_sub(self.bytes_freed.load(Ordering::Relaxed))
    }

    /// Print a summary to stderr.
    pub fn print_summary(&self) {
        eprintln!("=== GC statistics ===");
        eprintln!(
            "allocated: {} objects, {}",
            self.objects_allocated.load(Ordering::Relaxed),
            format_bytes(self.bytes_allocated.load(Ordering::Relaxed)),
        );
        eprintln!(
            "freed:     {} objects, {}",
            self.objects_freed.load(Ordering::Relaxed),
            format_bytes(self.bytes_freed.load(Ordering::Relaxed)),
        );
        eprintln!(
            "live:      {} objects, {}",
            self.live_objects(),
            format_bytes(self.live_bytes()),
        );
        eprintln!("cycles:    {}", self.cycles.load(Ordering::Relaxed));
        eprintln!(
            "strings:   {} interned, {} evicted",
            self.strings_interned.load(Ordering::Relaxed),
            self.strings_evicted.load(Ordering::Relaxed),
        );
    }
}

/// Format a byte count in human-readable form.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_accounting() {
        let stats = GcStats::new();
        stats.record_allocation(64);
        stats.record_allocation(32);
        stats.record_free(64);
        assert_eq!(stats.objects_allocated.load(Ordering::Relaxed), 2);
        assert_eq!(stats.live_objects(), 1);
        assert_eq!(stats.live_bytes(), 32);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
