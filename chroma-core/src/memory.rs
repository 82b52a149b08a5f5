use std::{
    alloc::{GlobalAlloc, Layout, System},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

const GIB: f64 = (1u64 << 30) as f64;

/// Source of peak-memory readings.
///
/// The controller reads and resets the peak at each stage boundary, so every reading covers
/// exactly one phase.
pub trait MemoryTracker {
    /// Highest number of bytes in use since the last reset.
    fn read_peak(&self) -> u64;

    fn reset_peak(&self);
}

static LIVE_BYTES: AtomicU64 = AtomicU64::new(0);
static PEAK_BYTES: AtomicU64 = AtomicU64::new(0);

/// System allocator wrapper that counts live and peak heap bytes.
///
/// Install it in the binary with `#[global_allocator]`; [`AllocatorMemory`] then reports
/// its counters. On the CPU device this covers model weights and activations.
pub struct TrackingAllocator;

impl TrackingAllocator {
    fn grew(size: usize) {
        let live = LIVE_BYTES.fetch_add(size as u64, Ordering::Relaxed) + size as u64;
        PEAK_BYTES.fetch_max(live, Ordering::Relaxed);
    }

    fn shrank(size: usize) {
        LIVE_BYTES.fetch_sub(size as u64, Ordering::Relaxed);
    }
}

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            Self::grew(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            Self::grew(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        Self::shrank(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            if new_size > layout.size() {
                Self::grew(new_size - layout.size());
            } else {
                Self::shrank(layout.size() - new_size);
            }
        }
        new_ptr
    }
}

/// Reads the counters maintained by [`TrackingAllocator`].
///
/// Readings stay at zero when the allocator is not installed.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocatorMemory;

impl MemoryTracker for AllocatorMemory {
    fn read_peak(&self) -> u64 {
        PEAK_BYTES.load(Ordering::Relaxed)
    }

    fn reset_peak(&self) {
        PEAK_BYTES.store(0, Ordering::Relaxed);
    }
}

/// Per-phase measurements of one generation run.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Telemetry {
    pub peak_conditioning: u64,
    pub peak_generation: u64,
    pub peak_decoding: u64,
    /// Wall-clock time of the denoising loop only.
    pub denoising_time: Duration,
}

impl Telemetry {
    /// Phases never overlap, so the largest phase peak bounds the whole run.
    pub fn overall_peak(&self) -> u64 {
        self.peak_conditioning
            .max(self.peak_generation)
            .max(self.peak_decoding)
    }

    pub fn report(&self) -> TelemetryReport<'_> {
        TelemetryReport(self)
    }
}

/// Operator-facing rendering of [`Telemetry`].
pub struct TelemetryReport<'a>(&'a Telemetry);

impl fmt::Display for TelemetryReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let gb = |bytes: u64| bytes as f64 / GIB;
        let t = self.0;
        writeln!(
            f,
            "Peak memory used for the text:       {:.3} GB",
            gb(t.peak_conditioning)
        )?;
        writeln!(
            f,
            "Peak memory used for the generation: {:.3} GB",
            gb(t.peak_generation)
        )?;
        writeln!(
            f,
            "Peak memory used for the decoding:   {:.3} GB",
            gb(t.peak_decoding)
        )?;
        writeln!(
            f,
            "Peak memory used overall:            {:.3} GB",
            gb(t.overall_peak())
        )?;
        write!(
            f,
            "Prompt execution time:               {:.4} Seconds",
            t.denoising_time.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_is_max_not_sum() {
        let telemetry = Telemetry {
            peak_conditioning: 3 << 30,
            peak_generation: 9 << 30,
            peak_decoding: 5 << 30,
            denoising_time: Duration::from_millis(1500),
        };
        assert_eq!(telemetry.overall_peak(), 9 << 30);
    }

    #[test]
    fn report_format() {
        let telemetry = Telemetry {
            peak_conditioning: 1 << 30,
            peak_generation: 3 << 29,
            peak_decoding: 0,
            denoising_time: Duration::from_millis(2500),
        };
        let report = telemetry.report().to_string();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(
            lines,
            [
                "Peak memory used for the text:       1.000 GB",
                "Peak memory used for the generation: 1.500 GB",
                "Peak memory used for the decoding:   0.000 GB",
                "Peak memory used overall:            1.500 GB",
                "Prompt execution time:               2.5000 Seconds",
            ]
        );
    }

    #[test]
    fn allocator_counters_track_peak() {
        let allocator = TrackingAllocator;
        let memory = AllocatorMemory;
        memory.reset_peak();
        let layout = Layout::from_size_align(1 << 20, 8).unwrap();
        unsafe {
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            assert!(memory.read_peak() >= 1 << 20);
            allocator.dealloc(ptr, layout);
        }
        memory.reset_peak();
        assert_eq!(memory.read_peak(), 0);
    }
}
