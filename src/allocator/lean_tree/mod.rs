//! Lean tree (buddy)アロケータ.
//!
//! 獲得元から確保した単一の固定領域を二冪サイズのbuddyブロック群として管理する.
//! 空き情報は「レベル」毎の圧縮配列として領域の先頭に保持され、
//! ユーザメモリ側には一切のヘッダを埋め込まない.
//!
//! 下位レベル(小さいブロック)は1ブロック1ビット、上位レベルは1ブロック1バイトで
//! 最大空きスパンを記録しており、上位での高速なbest-fit探索と、
//! 下位でのメタデータ密度を両立している.
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::fmt;
use std::ptr::NonNull;

use self::level_map::{
    is_partial, partial, partial_log2, state_lfs, LevelMap, BIT_LEVELS, FREE_SOLID,
    FULL_FRAGMENTED, FULL_SOLID,
};
use crate::allocator::{AllocResult, Allocator, AllocatorHandle};
use crate::metrics::AllocatorMetrics;
use crate::size::{Alignment, ByteSize, Power2};
use crate::{ErrorKind, Result};

mod level_map;

/// 木が最低限持つべきレベル数.
///
/// `total_size`および`max_alloc_size`は`basic_block_size << MIN_LEVELS`以上に丸められる.
const MIN_LEVELS: u8 = 6;

/// `LeanTreeAllocator`の構成パラメータ.
///
/// 各サイズは二冪でなければならないため、[`Power2`]/[`Alignment`]で表現される.
/// 制限の範囲外の値はコンストラクタで丸められ、丸めはログに出力される.
///
/// [`Power2`]: ../size/struct.Power2.html
/// [`Alignment`]: ../size/struct.Alignment.html
#[derive(Debug, Clone)]
pub struct LeanTreeParams {
    /// 管理の最小単位となる基本ブロックのサイズ.
    ///
    /// デフォルト値は`16`バイト. 下限は4バイト.
    pub basic_block_size: Power2,

    /// 管理領域全体のサイズ. 獲得元からこのサイズの領域を一括で確保する.
    ///
    /// デフォルト値は`64KiB`.
    pub total_size: Power2,

    /// 一つの割当の最大サイズ (buddy木一本が扱う範囲).
    ///
    /// デフォルト値は`8KiB`.
    pub max_alloc_size: Power2,

    /// 管理領域自体のアライメント. システムアライメント未満は許容されない.
    pub alignment: Alignment,

    /// ロガー. パラメータの丸めと`validate`の診断が出力される.
    pub logger: Logger,

    /// メトリクス用の共通設定.
    pub metrics: MetricBuilder,
}
impl Default for LeanTreeParams {
    fn default() -> Self {
        LeanTreeParams {
            basic_block_size: Power2::from_bytes(16),
            total_size: Power2::from_bytes(64 * 1024),
            max_alloc_size: Power2::from_bytes(8 * 1024),
            alignment: Alignment::system(),
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }
}

/// `LeanTreeAllocator`の統計情報.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeanTreeStats {
    /// 管理領域全体のサイズ(バイト単位).
    pub total_bytes: ByteSize,

    /// ユーザへ割当済みのバイト数. メタデータ分は含まれない.
    pub bytes_used: ByteSize,

    /// 領域先頭のメタデータとして確保されているバイト数.
    pub metadata_bytes: ByteSize,

    /// 現在割当可能な最大の連続ブロックのサイズ(バイト単位).
    pub largest_free_bytes: ByteSize,
}

/// Lean tree (buddy)アロケータ.
///
/// # 割当戦略
///
/// このアロケータは"BestFit"戦略を採用している.
///
/// 木の最上位レベルの各エントリは自身の最大空きスパンを記録しており、
/// 割当要求の際には「要求サイズを満たす空きスパンの中で、一番小さいもの」を持つ
/// エントリが選択される (同値の場合はインデックスが小さい方).
/// 木を降りる際の子の選択も同じ規則に従う (同値の場合は左).
///
/// 解放の際には、buddy同士が共に空きになった時点で即座に合体が行われる.
///
/// # メタデータ
///
/// 領域先頭のメタデータ領域は、構築時に通常の割当と同じ経路で「使用中」として
/// 確保される. そのため`free`にメタデータ内のポインタを渡すと
/// `ErrorKind::InvalidFree`になる.
pub struct LeanTreeAllocator {
    backing: AllocatorHandle,
    params: LeanTreeParams,
    base: NonNull<u8>,
    map: LevelMap,
    levels: u8,
    bytes_used: ByteSize,
    metadata_size: ByteSize,
    metrics: AllocatorMetrics,
    logger: Logger,
}
impl LeanTreeAllocator {
    /// 獲得元から`params.total_size`の領域を確保して、新しい`LeanTreeAllocator`を構築する.
    ///
    /// # Errors
    ///
    /// 獲得元が領域の確保に失敗した場合は`ErrorKind::MemoryFull`が返される.
    pub fn new(backing: AllocatorHandle, params: LeanTreeParams) -> Result<Self> {
        let params = Self::validate_and_correct(params);
        let logger = params.logger.clone();

        let levels = Self::level_count(&params);
        let total_basic_blocks =
            (params.total_size / params.basic_block_size).value() as u64;

        // 領域全体を一括で確保する. メタデータもこの中に置かれる.
        let region_alignment =
            params.alignment.max(Alignment::from(params.basic_block_size));
        let result = backing.alloc(params.total_size.value(), region_alignment);
        track_assert!(result.is_success(), ErrorKind::MemoryFull);

        let map = unsafe { LevelMap::new(result.buffer, total_basic_blocks, levels) };
        info!(logger, "lean tree initialized";
              "total_size" => params.total_size.value() as u64,
              "basic_block_size" => params.basic_block_size.value() as u64,
              "levels" => levels,
              "metadata_bytes" => map.metadata_bytes() as u64);

        let mut allocator = LeanTreeAllocator {
            backing,
            base: unsafe { NonNull::new_unchecked(result.buffer) },
            map,
            levels,
            bytes_used: 0,
            metadata_size: 0,
            metrics: AllocatorMetrics::new(&params.metrics, "lean_tree"),
            logger,
            params,
        };
        allocator.alloc_metadata();
        Ok(allocator)
    }

    /// (丸め済みの)構成パラメータを返す.
    pub fn params(&self) -> &LeanTreeParams {
        &self.params
    }

    /// 統計情報を返す.
    pub fn stats(&self) -> LeanTreeStats {
        let top = self.top_level();
        let largest = (0..self.top_blocks())
            .map(|i| state_lfs(self.map.byte(top, i), top))
            .max()
            .unwrap_or(0);
        LeanTreeStats {
            total_bytes: self.params.total_size.value(),
            bytes_used: self.bytes_used,
            metadata_bytes: self.metadata_size,
            largest_free_bytes: largest as ByteSize * self.params.basic_block_size.value(),
        }
    }

    /// アロケータのメトリクスを返す.
    pub fn metrics(&self) -> &AllocatorMetrics {
        &self.metrics
    }

    /// 木全体を走査して、内部の不変条件を検査する.
    ///
    /// 検査項目:
    ///
    /// 1. ビットレベルの"solid"フラグが立つノードの配下では、レベル0のビットが一様
    /// 2. バイトレベルの`Partial(k)`について、`2^k`が子の最大空きスパンに一致し、
    ///    かつ両方の子が完全な空きではない
    /// 3. `FULL_FRAGMENTED`のノードの子は共に空きスパンを持たない
    /// 4. 使用中の基本ブロック数と`bytes_used + metadata_bytes`の釣り合い
    ///
    /// 失敗の詳細はロガーに出力される.
    pub fn validate(&self) -> Result<()> {
        let mut used_blocks = 0;
        for i in 0..self.top_blocks() {
            let summary = track!(self.validate_node(self.top_level(), i))?;
            used_blocks += summary.used;
        }

        let bbs = self.params.basic_block_size.value();
        let expected = ((self.bytes_used + self.metadata_size) / bbs) as u64;
        if used_blocks != expected {
            crit!(self.logger, "used block accounting mismatch";
                  "used_blocks" => used_blocks, "expected" => expected);
            track_panic!(ErrorKind::InconsistentState);
        }
        Ok(())
    }

    fn validate_and_correct(params: LeanTreeParams) -> LeanTreeParams {
        let mut corrected = params;
        let logger = corrected.logger.clone();

        let min_block = Power2::from_bytes(4);
        if corrected.basic_block_size < min_block {
            warn!(logger, "basic_block_size raised to the minimum";
                  "requested" => corrected.basic_block_size.value() as u64);
            corrected.basic_block_size = min_block;
        }
        if corrected.alignment < Alignment::system() {
            corrected.alignment = Alignment::system();
        }
        if Power2::from(corrected.alignment) > corrected.basic_block_size {
            // 基本ブロック境界がそのまま割当のアライメントになる
            warn!(logger, "basic_block_size raised to the configured alignment";
                  "alignment" => corrected.alignment.bytes() as u64);
            corrected.basic_block_size = Power2::from(corrected.alignment);
        }

        let min_total =
            Power2::from_log2(corrected.basic_block_size.log2() + MIN_LEVELS);
        if corrected.total_size < min_total {
            warn!(logger, "total_size raised to the minimum";
                  "requested" => corrected.total_size.value() as u64,
                  "minimum" => min_total.value() as u64);
            corrected.total_size = min_total;
        }
        if corrected.max_alloc_size < min_total {
            corrected.max_alloc_size = min_total;
        }
        if corrected.max_alloc_size > corrected.total_size {
            warn!(logger, "max_alloc_size clamped to total_size";
                  "requested" => corrected.max_alloc_size.value() as u64);
            corrected.max_alloc_size = corrected.total_size;
        }
        corrected
    }

    fn level_count(params: &LeanTreeParams) -> u8 {
        (params.max_alloc_size / params.basic_block_size).log2() + 1
    }

    fn top_level(&self) -> u8 {
        self.levels - 1
    }

    fn top_blocks(&self) -> u64 {
        (self.params.total_size / self.params.max_alloc_size).value() as u64
    }

    fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    // メタデータ領域を通常の割当と同じ経路で「使用中」として確保する.
    // トップレベルブロックを先頭から必要分丸ごと取り、端数は二冪に切り上げて取る.
    fn alloc_metadata(&mut self) {
        let bbs = self.params.basic_block_size.value();
        let raw_bytes = self.map.metadata_bytes();
        let blocks_needed = ((raw_bytes + bbs - 1) / bbs) as u64;
        let top = self.top_level();
        let top_span = 1u64 << top;

        let mut marked = 0;
        for i in 0..(blocks_needed / top_span) {
            let index = self.alloc_at_level(top, i, top);
            debug_assert_eq!(index, i * top_span);
            marked += top_span;
        }
        let remainder = blocks_needed - marked;
        if remainder > 0 {
            let log = Power2::from_bytes(remainder as ByteSize).log2();
            let index = self.alloc_at_level(top, marked / top_span, log);
            debug_assert_eq!(index, marked);
            marked += 1 << log;
        }
        self.metadata_size = marked as ByteSize * bbs;
    }

    // 最上位レベルの全エントリからbest-fitでブロックを選んで割り当てる.
    // 成功時は割り当てた先頭の基本ブロック番号を返す.
    fn top_level_alloc(&mut self, log_blocks: u8) -> Option<u64> {
        let top = self.top_level();
        let need = 1u64 << log_blocks;

        let mut selected: Option<(u64, u64)> = None;
        for i in 0..self.top_blocks() {
            let lfs = state_lfs(self.map.byte(top, i), top);
            if lfs >= need && selected.map_or(true, |(best_lfs, _)| lfs < best_lfs) {
                selected = Some((lfs, i));
            }
        }

        let (_, index) = selected?;
        Some(self.alloc_at_level(top, index, log_blocks))
    }

    // `level`のノード`index`の配下に`2^log_blocks`基本ブロックの割当を行う.
    // 呼び出し側は、配下に十分な空きスパンがあることを保証する.
    fn alloc_at_level(&mut self, level: u8, index: u64, log_blocks: u8) -> u64 {
        if log_blocks == level {
            // ブロック全体を使う
            if level >= BIT_LEVELS {
                debug_assert_eq!(self.map.byte(level, index), FREE_SOLID);
                self.map.set_byte(level, index, FULL_SOLID);
            } else {
                self.map.mark_used(index << level, 1 << level);
                if level > 0 {
                    self.map.set_solid(level, index);
                }
            }
            index << level
        } else {
            self.pre_split(level, index);
            let child = self.select_child(level, index, log_blocks);
            let result = self.alloc_at_level(level - 1, index * 2 + child, log_blocks);
            self.update_largest_free(level, index);
            result
        }
    }

    // 分割前の準備: solidな空きブロックを2つの子に展開する.
    fn pre_split(&mut self, level: u8, index: u64) {
        if level < BIT_LEVELS {
            // ビットレベルでは「混在」をsolidフラグを落とすことで表現する.
            // レベル0のビットは既に正しい内容を持っている.
            self.map.clear_solid(level, index);
            return;
        }

        if self.map.byte(level, index) != FREE_SOLID {
            // 既に分割済み
            return;
        }
        if level - 1 >= BIT_LEVELS {
            self.map.set_byte(level - 1, index * 2, FREE_SOLID);
            self.map.set_byte(level - 1, index * 2 + 1, FREE_SOLID);
        } else {
            // 最上位ビットレベルへ降りる境界. この部分木のビット配列を初期化する.
            self.map.mark_free(index << level, 1 << level);
            for bit_level in 1..BIT_LEVELS {
                let count = 1 << (level - bit_level);
                self.map.set_solid_range(bit_level, index << (level - bit_level), count);
            }
        }
        self.map.set_byte(level, index, partial(level - 1));
    }

    // 子のbest-fit選択: 要求を満たす最小の空きスパンを持つ子. 同値なら左.
    fn select_child(&self, level: u8, index: u64, log_blocks: u8) -> u64 {
        let (left, right) = self.children_lfs(level, index);
        let need = 1u64 << log_blocks;

        if left >= need && (left <= right || right < need) {
            0
        } else {
            debug_assert!(right >= need);
            1
        }
    }

    fn children_lfs(&self, level: u8, index: u64) -> (u64, u64) {
        let child_level = level - 1;
        if child_level >= BIT_LEVELS {
            (
                state_lfs(self.map.byte(child_level, index * 2), child_level),
                state_lfs(self.map.byte(child_level, index * 2 + 1), child_level),
            )
        } else {
            (
                self.map.bit_lfs(child_level, index * 2),
                self.map.bit_lfs(child_level, index * 2 + 1),
            )
        }
    }

    // バイトレベルのノードの状態を、子の空きスパンから計算し直す.
    fn update_largest_free(&mut self, level: u8, index: u64) {
        if level < BIT_LEVELS {
            // ビットレベルの状態はレベル0から導出できる
            return;
        }
        let (left, right) = self.children_lfs(level, index);
        let state = if left + right == 0 {
            FULL_FRAGMENTED
        } else {
            partial(log2_floor(left.max(right)))
        };
        self.map.set_byte(level, index, state);
    }

    // `index`の基本ブロックから始まる割当を解放して、解放したブロック数の対数を返す.
    fn free_at_block(&mut self, index: u64, level: u8) -> Result<u8> {
        if level == 0 {
            track_assert!(
                self.map.level0_bit(index),
                ErrorKind::InvalidFree,
                "the block is not allocated: index={}",
                index
            );
            self.map.mark_free(index, 1);
            return Ok(0);
        }

        let node = index >> level;
        if level < BIT_LEVELS {
            if self.map.solid_bit(level, node) {
                // この部分木は一様: 全体が単一の割当か、全体が空き
                track_assert!(
                    self.map.level0_bit(index),
                    ErrorKind::InvalidFree,
                    "the block is not allocated: index={}",
                    index
                );
                track_assert_eq!(
                    index & ((1 << level) - 1),
                    0,
                    ErrorKind::InvalidFree,
                    "the pointer is not the start of the allocation"
                );
                self.map.mark_free(index, 1 << level);
                Ok(level)
            } else {
                let freed = track!(self.free_at_block(index, level - 1))?;
                self.coalesce(node, level);
                Ok(freed)
            }
        } else {
            let state = self.map.byte(level, node);
            if state == FULL_SOLID {
                track_assert_eq!(
                    index & ((1 << level) - 1),
                    0,
                    ErrorKind::InvalidFree,
                    "the pointer is not the start of the allocation"
                );
                self.map.set_byte(level, node, FREE_SOLID);
                Ok(level)
            } else if state == FREE_SOLID {
                track_panic!(
                    ErrorKind::InvalidFree,
                    "the block is not allocated: index={}",
                    index
                );
            } else {
                let freed = track!(self.free_at_block(index, level - 1))?;
                self.coalesce(node, level);
                Ok(freed)
            }
        }
    }

    // 解放で空きが増えた後に、buddy同士の合体を試みる.
    fn coalesce(&mut self, index: u64, level: u8) {
        if level < BIT_LEVELS {
            if self.map.is_all_free(index << level, 1 << level) {
                self.map.set_solid(level, index);
            }
        } else if level - 1 >= BIT_LEVELS {
            let left = self.map.byte(level - 1, index * 2);
            let right = self.map.byte(level - 1, index * 2 + 1);
            if left == FREE_SOLID && right == FREE_SOLID {
                self.map.set_byte(level, index, FREE_SOLID);
            } else {
                self.update_largest_free(level, index);
            }
        } else if self.map.is_all_free(index << level, 1 << level) {
            self.map.set_byte(level, index, FREE_SOLID);
        } else {
            self.update_largest_free(level, index);
        }
    }

    fn validate_node(&self, level: u8, index: u64) -> Result<NodeSummary> {
        let span = 1u64 << level;
        if level < BIT_LEVELS {
            if level == 0 {
                let used = if self.map.level0_bit(index) { 1 } else { 0 };
                return Ok(NodeSummary {
                    used,
                    lfs: 1 - used,
                });
            }
            if self.map.solid_bit(level, index) {
                let used = self.map.used_blocks_in(index << level, span);
                if used != 0 && used != span {
                    crit!(self.logger, "solid subtree has mixed level-0 bits";
                          "level" => level, "index" => index, "used" => used);
                    track_panic!(ErrorKind::InconsistentState);
                }
                let lfs = if used == 0 { span } else { 0 };
                Ok(NodeSummary { used, lfs })
            } else {
                let left = track!(self.validate_node(level - 1, index * 2))?;
                let right = track!(self.validate_node(level - 1, index * 2 + 1))?;
                Ok(NodeSummary {
                    used: left.used + right.used,
                    lfs: left.lfs.max(right.lfs),
                })
            }
        } else {
            let state = self.map.byte(level, index);
            if state == FREE_SOLID {
                if !self.map.is_all_free(index << level, span) {
                    crit!(self.logger, "free-solid subtree has used level-0 bits";
                          "level" => level, "index" => index);
                    track_panic!(ErrorKind::InconsistentState);
                }
                Ok(NodeSummary { used: 0, lfs: span })
            } else if state == FULL_SOLID {
                Ok(NodeSummary { used: span, lfs: 0 })
            } else {
                let left = track!(self.validate_node(level - 1, index * 2))?;
                let right = track!(self.validate_node(level - 1, index * 2 + 1))?;
                let lfs = left.lfs.max(right.lfs);

                if state == FULL_FRAGMENTED {
                    if lfs != 0 {
                        crit!(self.logger, "full-fragmented node has free descendants";
                              "level" => level, "index" => index, "lfs" => lfs);
                        track_panic!(ErrorKind::InconsistentState);
                    }
                } else if is_partial(state) {
                    let recorded = 1u64 << partial_log2(state);
                    if recorded != lfs {
                        crit!(self.logger, "recorded largest free span is stale";
                              "level" => level, "index" => index,
                              "recorded" => recorded, "actual" => lfs);
                        track_panic!(ErrorKind::InconsistentState);
                    }
                    let half = span / 2;
                    if left.lfs == half && right.lfs == half {
                        crit!(self.logger, "partial node should have been coalesced";
                              "level" => level, "index" => index);
                        track_panic!(ErrorKind::InconsistentState);
                    }
                } else {
                    crit!(self.logger, "unknown node state";
                          "level" => level, "index" => index, "state" => state);
                    track_panic!(ErrorKind::InconsistentState);
                }
                Ok(NodeSummary {
                    used: left.used + right.used,
                    lfs,
                })
            }
        }
    }
}
impl Allocator for LeanTreeAllocator {
    fn name(&self) -> &'static str {
        "lean_tree"
    }
    fn alloc(&mut self, bytes: ByteSize, alignment: Alignment) -> AllocResult {
        let bbs = self.params.basic_block_size;
        if Power2::from(alignment) > bbs {
            // 基本ブロック境界を超えるアライメントは保証できない
            return AllocResult::failure();
        }

        let corrected = Power2::from_bytes(bytes).max(bbs);
        if corrected > self.params.max_alloc_size {
            self.metrics.nospace_failures.increment();
            return AllocResult::failure();
        }

        let log_blocks = (corrected / bbs).log2();
        if let Some(block_index) = self.top_level_alloc(log_blocks) {
            self.bytes_used += corrected.value();
            self.metrics.count_allocation(corrected.value());
            AllocResult {
                buffer: unsafe {
                    self.base_ptr().add(block_index as usize * bbs.value())
                },
                bytes: corrected.value(),
            }
        } else {
            self.metrics.nospace_failures.increment();
            AllocResult::failure()
        }
    }
    fn try_expand(&mut self, _new_bytes: ByteSize, _buffer: *mut u8) -> ByteSize {
        // 理論上は空きのbuddyへ伸ばせる場合があるが、現時点では未実装
        0
    }
    fn free(&mut self, buffer: *mut u8) -> Result<()> {
        let base = self.base_ptr() as usize;
        let address = buffer as usize;
        let total = self.params.total_size.value();
        track_assert!(
            address >= base && address < base + total,
            ErrorKind::InvalidFree,
            "the pointer is outside the managed region: {:?}",
            buffer
        );

        let offset = address - base;
        track_assert!(
            self.params.basic_block_size.is_aligned(offset),
            ErrorKind::InvalidFree,
            "the pointer is not aligned to a basic block boundary: {:?}",
            buffer
        );
        track_assert!(
            offset >= self.metadata_size,
            ErrorKind::InvalidFree,
            "the pointer refers to the metadata region: {:?}",
            buffer
        );

        let bbs = self.params.basic_block_size.value();
        let index = (offset / bbs) as u64;
        let freed_log = track!(self.free_at_block(index, self.top_level()))?;

        let freed_bytes = (1usize << freed_log) * bbs;
        self.bytes_used -= freed_bytes;
        self.metrics.count_releasion(freed_bytes);
        Ok(())
    }
}
impl Drop for LeanTreeAllocator {
    fn drop(&mut self) {
        let _ = self.backing.free(self.base_ptr());
    }
}
impl fmt::Debug for LeanTreeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LeanTreeAllocator {{ stats: {:?} }}", self.stats())
    }
}

struct NodeSummary {
    used: u64,
    lfs: u64,
}

fn log2_floor(n: u64) -> u8 {
    debug_assert!(n > 0);
    (63 - n.leading_zeros()) as u8
}
