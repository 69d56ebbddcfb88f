//! Cache protocol bandwidth statistics.
//!
//! Tracks bytes actually written for cache references and inits against an
//! estimated uncached baseline, and renders the end-of-session summary line.

/// Estimates the bytes a rectangle would have cost without the cache.
///
/// The default assumes 10:1 compression over raw pixel bytes, which is
/// deliberately conservative; codec-specific estimators can be swapped in
/// per connection where better figures are known.
pub trait BaselineEstimator: Send {
    /// Estimated compressed payload size for `area` pixels at
    /// `bytes_per_pixel`, encoded with `encoding`.
    fn estimate(&self, area: u64, bytes_per_pixel: u64, encoding: i32) -> u64;
}

/// 10:1 compression over raw pixel bytes, whatever the codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEstimator;

impl BaselineEstimator for DefaultEstimator {
    fn estimate(&self, area: u64, bytes_per_pixel: u64, _encoding: i32) -> u64 {
        (area * bytes_per_pixel) / 10
    }
}

/// Rectangle header plus encoding id: the fixed per-rectangle wire cost.
const RECT_OVERHEAD: u64 = 16;

/// Per-connection bandwidth accounting for one cache protocol.
pub struct BandwidthStats {
    /// Bytes on the wire for reference messages.
    pub cached_ref_bytes: u64,
    pub cached_ref_count: u32,

    /// Bytes on the wire for init messages.
    pub cached_init_bytes: u64,
    pub cached_init_count: u32,

    /// Estimated bytes that would have been sent without the cache.
    pub alternative_bytes: u64,

    estimator: Box<dyn BaselineEstimator>,
}

impl std::fmt::Debug for BandwidthStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthStats")
            .field("cached_ref_bytes", &self.cached_ref_bytes)
            .field("cached_ref_count", &self.cached_ref_count)
            .field("cached_init_bytes", &self.cached_init_bytes)
            .field("cached_init_count", &self.cached_init_count)
            .field("alternative_bytes", &self.alternative_bytes)
            .finish()
    }
}

impl Default for BandwidthStats {
    fn default() -> Self {
        Self::new(Box::new(DefaultEstimator))
    }
}

impl BandwidthStats {
    pub fn new(estimator: Box<dyn BaselineEstimator>) -> Self {
        Self {
            cached_ref_bytes: 0,
            cached_ref_count: 0,
            cached_init_bytes: 0,
            cached_init_count: 0,
            alternative_bytes: 0,
            estimator,
        }
    }

    /// Record a session reference: 12-byte header + 8-byte id on the wire,
    /// against a baseline of header + estimated compressed payload.
    pub fn record_session_ref(&mut self, area: u64, bytes_per_pixel: u64, encoding: i32) {
        let wire = 12 + 8;
        let baseline = RECT_OVERHEAD + self.estimator.estimate(area, bytes_per_pixel, encoding);
        self.cached_ref_bytes = self.cached_ref_bytes.saturating_add(wire);
        self.alternative_bytes = self.alternative_bytes.saturating_add(baseline);
        self.cached_ref_count = self.cached_ref_count.saturating_add(1);
    }

    /// Record a session init: header + id + encoding + payload on the wire,
    /// against a baseline of header + encoding + the same payload.
    pub fn record_session_init(&mut self, payload_bytes: u64) {
        let wire = 12 + 8 + 4 + payload_bytes;
        self.cached_init_bytes = self.cached_init_bytes.saturating_add(wire);
        self.alternative_bytes = self
            .alternative_bytes
            .saturating_add(RECT_OVERHEAD + payload_bytes);
        self.cached_init_count = self.cached_init_count.saturating_add(1);
    }

    /// Record a persistent reference: header + hash-length byte + hash +
    /// flags on the wire.
    pub fn record_persistent_ref(
        &mut self,
        area: u64,
        bytes_per_pixel: u64,
        encoding: i32,
        hash_len: u64,
    ) {
        let wire = 12 + 1 + hash_len + 2;
        let baseline = RECT_OVERHEAD + self.estimator.estimate(area, bytes_per_pixel, encoding);
        self.cached_ref_bytes = self.cached_ref_bytes.saturating_add(wire);
        self.alternative_bytes = self.alternative_bytes.saturating_add(baseline);
        self.cached_ref_count = self.cached_ref_count.saturating_add(1);
    }

    /// Record a persistent init.
    pub fn record_persistent_init(&mut self, hash_len: u64, payload_bytes: u64) {
        let wire = 12 + 1 + hash_len + 4 + 4 + payload_bytes;
        self.cached_init_bytes = self.cached_init_bytes.saturating_add(wire);
        self.alternative_bytes = self
            .alternative_bytes
            .saturating_add(RECT_OVERHEAD + payload_bytes);
        self.cached_init_count = self.cached_init_count.saturating_add(1);
    }

    /// Estimated bytes saved compared to the uncached baseline.
    pub fn saved_bytes(&self) -> u64 {
        let used = self.cached_ref_bytes + self.cached_init_bytes;
        self.alternative_bytes.saturating_sub(used)
    }

    /// Estimated reduction percentage vs the uncached baseline.
    pub fn reduction_pct(&self) -> f64 {
        let used = self.cached_ref_bytes + self.cached_init_bytes;
        if self.alternative_bytes == 0 || used >= self.alternative_bytes {
            0.0
        } else {
            100.0 * (self.alternative_bytes - used) as f64 / self.alternative_bytes as f64
        }
    }

    /// Single-line human-readable summary for the shutdown log.
    pub fn format_summary(&self, label: &str) -> String {
        format!(
            "{}: {} bandwidth saving ({:.1}% reduction, {} refs, {} inits)",
            label,
            human_bytes(self.saved_bytes()),
            self.reduction_pct(),
            self.cached_ref_count,
            self.cached_init_count,
        )
    }
}

/// IEC-style byte formatter (B, KiB, MiB, GiB).
fn human_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    let b = bytes as f64;
    if b >= GIB {
        format!("{:.3} GiB", b / GIB)
    } else if b >= MIB {
        format!("{:.3} MiB", b / MIB)
    } else if b >= KIB {
        format!("{:.3} KiB", b / KIB)
    } else {
        format!("{} B", bytes)
    }
}
