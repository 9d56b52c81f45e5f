//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, MetricBuilder};

use crate::size::ByteSize;

/// アロケータのメトリクス.
///
/// 全てのアロケータ実装が共通で保持する. `subsystem`ラベルにアロケータの種別が入る.
#[derive(Debug, Clone)]
pub struct AllocatorMetrics {
    pub(crate) allocations: Counter,
    pub(crate) allocated_bytes: Counter,
    pub(crate) releases: Counter,
    pub(crate) released_bytes: Counter,
    pub(crate) nospace_failures: Counter,
    pub(crate) expansions: Counter,
}
impl AllocatorMetrics {
    /// 割当操作の成功回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// leanalloc_{allocator}_allocations_total <COUNTER>
    /// ```
    pub fn allocations(&self) -> u64 {
        self.allocations.value() as u64
    }

    /// これまでに割り当てたバイト数の合計.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// leanalloc_{allocator}_allocated_bytes_total <COUNTER>
    /// ```
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.value() as u64
    }

    /// 解放操作の回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// leanalloc_{allocator}_releases_total <COUNTER>
    /// ```
    pub fn releases(&self) -> u64 {
        self.releases.value() as u64
    }

    /// これまでに解放されたバイト数の合計.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// leanalloc_{allocator}_released_bytes_total <COUNTER>
    /// ```
    pub fn released_bytes(&self) -> u64 {
        self.released_bytes.value() as u64
    }

    /// 空き領域不足による割当失敗回数.
    ///
    /// アリーナアロケータの場合は、フォールバック先への委譲回数がこの値になる.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// leanalloc_{allocator}_nospace_failures_total <COUNTER>
    /// ```
    pub fn nospace_failures(&self) -> u64 {
        self.nospace_failures.value() as u64
    }

    /// `try_expand`によるその場拡張の成功回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// leanalloc_{allocator}_expansions_total <COUNTER>
    /// ```
    pub fn expansions(&self) -> u64 {
        self.expansions.value() as u64
    }

    /// 現在生きている割当の数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// leanalloc_{allocator}_allocations_total - leanalloc_{allocator}_releases_total
    /// ```
    pub fn live_allocations(&self) -> u64 {
        // NOTE: 以下の順番で値を取得しないとアンダーフローする可能性がある
        let dec = self.releases();
        let inc = self.allocations();
        inc - dec
    }

    /// 現在の使用量(バイト単位).
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// leanalloc_{allocator}_allocated_bytes_total - leanalloc_{allocator}_released_bytes_total
    /// ```
    pub fn usage_bytes(&self) -> u64 {
        // NOTE: 以下の順番で値を取得しないとアンダーフローする可能性がある
        let dec = self.released_bytes();
        let inc = self.allocated_bytes();
        inc - dec
    }

    pub(crate) fn new(builder: &MetricBuilder, subsystem: &str) -> Self {
        let mut builder = builder.clone();
        builder.namespace("leanalloc").subsystem(subsystem);
        AllocatorMetrics {
            allocations: builder
                .counter("allocations_total")
                .help("Number of successful allocations")
                .finish()
                .expect("Never fails"),
            allocated_bytes: builder
                .counter("allocated_bytes_total")
                .help("Number of allocated bytes")
                .finish()
                .expect("Never fails"),
            releases: builder
                .counter("releases_total")
                .help("Number of releases")
                .finish()
                .expect("Never fails"),
            released_bytes: builder
                .counter("released_bytes_total")
                .help("Number of released bytes")
                .finish()
                .expect("Never fails"),
            nospace_failures: builder
                .counter("nospace_failures_total")
                .help("Number of allocation failures caused by no available space")
                .finish()
                .expect("Never fails"),
            expansions: builder
                .counter("expansions_total")
                .help("Number of successful in-place expansions")
                .finish()
                .expect("Never fails"),
        }
    }

    pub(crate) fn count_allocation(&self, bytes: ByteSize) {
        self.allocations.increment();
        self.allocated_bytes.add_u64(bytes as u64);
    }

    pub(crate) fn count_releasion(&self, bytes: ByteSize) {
        self.releases.increment();
        self.released_bytes.add_u64(bytes as u64);
    }
}
