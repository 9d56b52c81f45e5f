use prometrics::metrics::MetricBuilder;
use std::cmp;
use std::fmt;
use std::io::Write;
use std::mem;
use std::ptr;

use crate::allocator::{AllocResult, Allocator, AllocatorHandle};
use crate::metrics::AllocatorMetrics;
use crate::size::{Alignment, ByteSize, Count};
use crate::{ErrorKind, Result};

/// 一つの割当の最大サイズ.
const MAX_ALLOC_SIZE: ByteSize = 0x8000_0000;

/// 一つのブロックの最大サイズ. これを超える割当には専用の特大ブロックが割り当てられる.
const MAX_BLOCK_SIZE: ByteSize = 0x0800_0000;

/// ブロックサイズの下限.
const MIN_BLOCK_SIZE: Count = 0x20;

fn min_alignment() -> Alignment {
    Alignment::system()
}

/// チャンク毎に指定可能なアライメントの上限 (3bitでエンコードされる).
fn max_alignment() -> Alignment {
    min_alignment() << 7
}

// ChunkMetaは以下をu32にパックして保持する:
//  - offset: 28 bits
//  - alignment: 3 bits (最小アライメントからの対数差分)
//  - used flag: 1 bit
#[derive(Debug, Clone, Copy)]
struct ChunkMeta(u32);
impl ChunkMeta {
    // 生成直後のチャンクは使用中
    fn new(offset: Count, alignment: Alignment) -> Self {
        let align_value = u32::from(alignment.log2() - min_alignment().log2());
        ChunkMeta((offset << 4) | (align_value << 1) | 1)
    }

    fn offset(self) -> Count {
        self.0 >> 4
    }

    fn used(self) -> bool {
        (self.0 & 1) != 0
    }

    fn alignment(self) -> Alignment {
        let align_value = ((self.0 >> 1) & 0x7) as u8;
        Alignment::from_log2(align_value + min_alignment().log2())
    }

    fn release(&mut self) {
        self.0 &= !1;
    }
}

// 各ブロックのレイアウト:
//
// ```text
// [BlockHeader][データ領域 (上方向に成長) ...][... チャンクメタデータ列 (下方向に成長)]
// ```
//
// メタデータ列は逆順(新しいものほど低アドレス)に積まれる.
#[repr(C)]
struct BlockHeader {
    next: *mut BlockHeader,
    capacity: Count,
    data_bytes_used: Count,
    alloc_count: Count,
}

unsafe fn data_ptr(block: *mut BlockHeader) -> *mut u8 {
    block.add(1) as *mut u8
}

unsafe fn free_space(block: *mut BlockHeader) -> *mut u8 {
    data_ptr(block).add((*block).data_bytes_used as usize)
}

unsafe fn free_bytes(block: *mut BlockHeader) -> Count {
    (*block).capacity
        - (*block).data_bytes_used
        - (*block).alloc_count * mem::size_of::<ChunkMeta>() as Count
}

unsafe fn max_chunk_size(block: *mut BlockHeader) -> Count {
    let free = free_bytes(block);
    if free >= mem::size_of::<ChunkMeta>() as Count {
        free - mem::size_of::<ChunkMeta>() as Count
    } else {
        0
    }
}

unsafe fn chunks_end(block: *mut BlockHeader) -> *mut ChunkMeta {
    data_ptr(block).add((*block).capacity as usize) as *mut ChunkMeta
}

// 最も新しいチャンクのメタデータを返す
unsafe fn chunk_top(block: *mut BlockHeader) -> *mut ChunkMeta {
    chunks_end(block).sub((*block).alloc_count as usize)
}

unsafe fn contains(block: *mut BlockHeader, buffer: *mut u8) -> bool {
    let base = data_ptr(block) as usize;
    let address = buffer as usize;
    address >= base && address < base + (*block).capacity as usize
}

unsafe fn fits_in_block(block: *mut BlockHeader, corrected: ByteSize, alignment: Alignment) -> bool {
    if block.is_null() {
        return false;
    }
    let padding = alignment.padding(free_space(block));

    // オフセットは28bitでエンコードされるため、それを超える位置には積めない
    let offset = (*block).data_bytes_used as ByteSize + padding;
    if offset >= (1 << 28) {
        return false;
    }
    max_chunk_size(block) as ByteSize >= padding + corrected
}

unsafe fn push_chunk(block: *mut BlockHeader, bytes: Count, alignment: Alignment) -> AllocResult {
    let prev_free_space = free_space(block);
    let padding = alignment.padding(prev_free_space) as Count;

    let meta = chunk_top(block).sub(1);
    (*block).alloc_count += 1;
    ptr::write(meta, ChunkMeta::new((*block).data_bytes_used + padding, alignment));
    (*block).data_bytes_used += bytes + padding;

    AllocResult {
        buffer: prev_free_space.add(padding as usize),
        bytes: bytes as ByteSize,
    }
}

// チャンクが見つかって解放できた場合は、そのチャンクが占めていたバイト数を返す
unsafe fn try_free_in_block(block: *mut BlockHeader, buffer: *mut u8) -> Option<ByteSize> {
    if !contains(block, buffer) {
        return None;
    }
    let base = data_ptr(block);
    let chunks_end = chunks_end(block);

    // メタデータ列は逆順なので、先頭(最も新しいチャンク)から探す
    let mut end_offset = (*block).data_bytes_used;
    let mut chunk = chunk_top(block);
    while chunk < chunks_end {
        let offset = (*chunk).offset();
        if buffer == base.add(offset as usize) && (*chunk).used() {
            (*chunk).release();
            return Some((end_offset - offset) as ByteSize);
        }
        end_offset = offset;
        chunk = chunk.add(1);
    }
    None
}

unsafe fn validate_block(block: *mut BlockHeader) -> bool {
    if (*block).capacity == 0 {
        return false;
    }
    if (*block).data_bytes_used > (*block).capacity {
        return false;
    }
    let max_chunk_count = (*block).capacity / mem::size_of::<ChunkMeta>() as Count;
    (*block).alloc_count <= max_chunk_count
}

unsafe fn validate_chunk(block: *mut BlockHeader, chunk: *mut ChunkMeta) -> bool {
    let offset = (*chunk).offset();

    if offset >= (*block).capacity {
        return false;
    }
    if offset > (*block).data_bytes_used {
        return false;
    }

    // 一つ古いチャンクのオフセットはこのチャンク以下でなければならない.
    // サイズゼロのチャンクが許されるため、等しいのは正常.
    let next = chunk.add(1);
    if next < chunks_end(block) && (*next).offset() > offset {
        return false;
    }
    true
}

/// `StackAllocator`の構成パラメータ.
#[derive(Debug, Clone)]
pub struct StackParams {
    /// ブロックサイズの最小値. 最初のブロックは少なくともこのサイズになる.
    ///
    /// デフォルト値は`256`.
    pub min_block_size: Count,

    /// ブロックサイズの最大値. 新規ブロックはこのサイズを超えて成長しない.
    ///
    /// ただし単一の割当がこの値を超える場合には、例外的にそれを収める
    /// 専用の特大ブロックが確保される.
    ///
    /// デフォルト値は`1MiB`.
    pub max_block_size: Count,

    /// メトリクス用の共通設定.
    pub metrics: MetricBuilder,
}
impl Default for StackParams {
    fn default() -> Self {
        StackParams {
            min_block_size: 256,
            max_block_size: 1024 * 1024,
            metrics: MetricBuilder::new(),
        }
    }
}

/// `StackAllocator`の統計情報.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StackStats {
    /// 獲得元から確保している総メモリ量(バイト単位).
    pub total_memory: ByteSize,

    /// 現在生きている割当の数.
    pub alloc_count: Count,

    /// 現在のブロック数.
    pub block_count: Count,
}

/// スタック(LIFO)アロケータ.
///
/// 獲得元から確保したブロックの連鎖の上で、各ブロック内をLIFO順に割り当てる.
/// 各割当のメタデータはブロック末尾の降順スタックに記録され、ユーザ領域側には
/// 一切のヘッダを埋め込まない.
///
/// # 割当ポリシー
///
/// - 先頭ブロックに収まらない場合にのみ、獲得元から新規ブロックを確保する
/// - 新規ブロックのサイズは「それまでの総確保量」まで成長する (`max_block_size`で頭打ち)
/// - LIFO順の解放では、先頭ブロックの自動コンパクションが走り、
///   空になったブロックは獲得元へ返却される
///
/// # 制限
///
/// - LIFO順でない解放は内部に穴を残す. 穴は、その上に積まれたチャンク群が
///   全て解放されるまで再利用されない
/// - `try_expand`は各ブロックの最上位チャンクに対してのみ機能する
pub struct StackAllocator {
    backing: AllocatorHandle,
    params: StackParams,
    stats: StackStats,
    metrics: AllocatorMetrics,
    first_block: *mut BlockHeader,
}
impl StackAllocator {
    /// 新しい`StackAllocator`インスタンスを生成する.
    ///
    /// `params`の値が制限の範囲外の場合には、範囲内に丸められる.
    pub fn new(backing: AllocatorHandle, params: StackParams) -> Self {
        let mut params = params;
        params.min_block_size = cmp::max(params.min_block_size, MIN_BLOCK_SIZE);
        params.max_block_size = cmp::max(params.min_block_size, params.max_block_size);
        params.max_block_size = cmp::min(params.max_block_size, MAX_BLOCK_SIZE as Count);
        let metrics = AllocatorMetrics::new(&params.metrics, "stack");
        StackAllocator {
            backing,
            params,
            stats: StackStats::default(),
            metrics,
            first_block: ptr::null_mut(),
        }
    }

    /// 統計情報を返す.
    pub fn stats(&self) -> StackStats {
        self.stats
    }

    /// 構成パラメータを返す.
    pub fn params(&self) -> &StackParams {
        &self.params
    }

    /// アロケータのメトリクスを返す.
    pub fn metrics(&self) -> &AllocatorMetrics {
        &self.metrics
    }

    /// 内部の不変条件を検査する.
    pub fn validate(&self) -> Result<()> {
        if self.first_block.is_null() {
            track_assert_eq!(self.stats.alloc_count, 0, ErrorKind::InconsistentState);
            track_assert_eq!(self.stats.block_count, 0, ErrorKind::InconsistentState);
            track_assert_eq!(self.stats.total_memory, 0, ErrorKind::InconsistentState);
            return Ok(());
        }

        unsafe {
            let mut block = self.first_block;
            while !block.is_null() {
                track_assert!(validate_block(block), ErrorKind::InconsistentState);

                let chunks_end = chunks_end(block);
                let mut chunk = chunk_top(block);
                while chunk < chunks_end {
                    track_assert!(validate_chunk(block, chunk), ErrorKind::InconsistentState);
                    chunk = chunk.add(1);
                }
                block = (*block).next;
            }
        }
        Ok(())
    }

    /// 全ブロックのチャンク一覧をCSV形式で書き出す.
    ///
    /// 列は`Block;Offset;Size;Address;Status`の五つ. ブロックおよびチャンクは新しい順に並ぶ.
    pub fn dump_chunks<W: Write>(&self, mut writer: W) -> Result<()> {
        track_io!(writeln!(writer, "Block;Offset;Size;Address;Status"))?;

        unsafe {
            let mut block = self.first_block;
            let mut block_index = 0;
            while !block.is_null() {
                let base = data_ptr(block);
                let chunks_end = chunks_end(block);
                let mut end_offset = (*block).data_bytes_used;

                let mut chunk = chunk_top(block);
                while chunk < chunks_end {
                    let status = if (*chunk).used() { "USED" } else { "FREE" };
                    if !validate_chunk(block, chunk) {
                        track_io!(writeln!(
                            writer,
                            "{};{};BAD;BAD;{}",
                            block_index,
                            (*chunk).offset(),
                            status
                        ))?;
                        break;
                    }
                    let offset = (*chunk).offset();
                    let size = end_offset - offset;
                    end_offset = offset;
                    track_io!(writeln!(
                        writer,
                        "{};{};{};0x{:x};{}",
                        block_index,
                        offset,
                        size,
                        base.add(offset as usize) as usize,
                        status
                    ))?;
                    chunk = chunk.add(1);
                }
                block = (*block).next;
                block_index += 1;
            }
        }
        Ok(())
    }

    fn push_new_block(&mut self, alloc_size: ByteSize, alignment: Alignment) -> bool {
        let header_alignment = Alignment::of::<BlockHeader>();

        // ブロックの管理オーバーヘッドを加味した必要量
        let need = alloc_size
            + alignment.round_up(mem::size_of::<BlockHeader>())
            + alignment.round_up(mem::size_of::<ChunkMeta>());

        let mut block_size = cmp::max(self.params.min_block_size as ByteSize, self.stats.total_memory);
        block_size = cmp::max(block_size, need);
        block_size = cmp::min(block_size, self.params.max_block_size as ByteSize);
        if need > self.params.max_block_size as ByteSize {
            // 専用の特大ブロック
            block_size = need;
        }

        let result = self.backing.alloc(block_size, header_alignment);
        if result.is_failure() {
            self.metrics.nospace_failures.increment();
            return false;
        }

        unsafe {
            let block = result.buffer as *mut BlockHeader;
            // メタデータ列の境界を保つため、端数は切り捨てる
            let capacity = ((result.bytes - mem::size_of::<BlockHeader>())
                & !(mem::size_of::<ChunkMeta>() - 1)) as Count;
            ptr::write(
                block,
                BlockHeader {
                    next: self.first_block,
                    capacity,
                    data_bytes_used: 0,
                    alloc_count: 0,
                },
            );
            self.first_block = block;

            self.stats.total_memory += mem::size_of::<BlockHeader>() + capacity as ByteSize;
        }
        self.stats.block_count += 1;
        true
    }

    fn clean_after_free(&mut self) -> Result<()> {
        unsafe {
            while !self.first_block.is_null() {
                let block = self.first_block;

                // 解放済みチャンクが先頭に連続している間は取り除く
                while (*block).alloc_count > 0 {
                    let top = chunk_top(block);
                    if (*top).used() {
                        break;
                    }
                    (*block).data_bytes_used = (*top).offset();
                    (*block).alloc_count -= 1;
                }

                // ブロックが空になった場合にのみ解放して、次のブロックに進む
                if (*block).alloc_count > 0 {
                    break;
                }

                let next = (*block).next;
                self.stats.total_memory -=
                    mem::size_of::<BlockHeader>() + (*block).capacity as ByteSize;
                self.stats.block_count -= 1;

                track!(self.backing.free(block as *mut u8))?;
                self.first_block = next;
            }
        }
        Ok(())
    }
}
impl Allocator for StackAllocator {
    fn name(&self) -> &'static str {
        "stack"
    }
    fn alloc(&mut self, bytes: ByteSize, alignment: Alignment) -> AllocResult {
        if alignment > max_alignment() {
            return AllocResult::failure();
        }
        if bytes > MAX_ALLOC_SIZE {
            return AllocResult::failure();
        }

        let alignment = cmp::max(alignment, min_alignment());
        let corrected = alignment.round_up(bytes);

        unsafe {
            if !fits_in_block(self.first_block, corrected, alignment)
                && !self.push_new_block(corrected, alignment)
            {
                return AllocResult::failure();
            }
            debug_assert!(fits_in_block(self.first_block, corrected, alignment));

            let result = push_chunk(self.first_block, corrected as Count, alignment);
            self.stats.alloc_count += 1;
            self.metrics.count_allocation(result.bytes);
            result
        }
    }
    fn try_expand(&mut self, new_bytes: ByteSize, buffer: *mut u8) -> ByteSize {
        unsafe {
            let mut block = self.first_block;
            while !block.is_null() {
                if !contains(block, buffer) {
                    block = (*block).next;
                    continue;
                }

                if (*block).alloc_count == 0 {
                    return 0;
                }

                // 拡張できるのはブロックの最上位チャンクのみ
                let top = chunk_top(block);
                if !(*top).used() || buffer != data_ptr(block).add((*top).offset() as usize) {
                    return 0;
                }

                let available = free_bytes(block) as ByteSize;
                let alignment = (*top).alignment();
                let current = ((*block).data_bytes_used - (*top).offset()) as ByteSize;
                let max_chunk = alignment.round_down(available + current);
                let new_size = cmp::min(max_chunk, cmp::max(new_bytes, current));

                if new_size > current {
                    (*block).data_bytes_used += (new_size - current) as Count;
                    self.metrics.expansions.increment();
                    self.metrics.allocated_bytes.add_u64((new_size - current) as u64);
                    return new_size;
                } else {
                    return 0;
                }
            }
        }
        0
    }
    fn free(&mut self, buffer: *mut u8) -> Result<()> {
        unsafe {
            let mut block = self.first_block;
            while !block.is_null() {
                if let Some(released) = try_free_in_block(block, buffer) {
                    self.stats.alloc_count -= 1;
                    self.metrics.count_releasion(released);
                    track!(self.clean_after_free())?;
                    return Ok(());
                }
                block = (*block).next;
            }
        }
        track_panic!(
            ErrorKind::InvalidFree,
            "no chunk corresponds to the pointer: {:?}",
            buffer
        );
    }
}
impl Drop for StackAllocator {
    fn drop(&mut self) {
        unsafe {
            let mut block = self.first_block;
            self.first_block = ptr::null_mut();
            while !block.is_null() {
                let next = (*block).next;
                let _ = self.backing.free(block as *mut u8);
                block = next;
            }
        }
    }
}
impl fmt::Debug for StackAllocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "StackAllocator {{ stats: {:?} }}", self.stats)
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::allocator::heap_allocator;
    use crate::allocator::testing::TracingAllocator;

    fn params(min_block_size: Count, max_block_size: Count) -> StackParams {
        StackParams {
            min_block_size,
            max_block_size,
            ..StackParams::default()
        }
    }

    #[test]
    fn chunk_meta_packing_works() {
        let a = Alignment::system() << 3;
        let mut meta = ChunkMeta::new(12345, a);
        assert_eq!(meta.offset(), 12345);
        assert_eq!(meta.alignment(), a);
        assert!(meta.used());

        meta.release();
        assert!(!meta.used());
        assert_eq!(meta.offset(), 12345);
        assert_eq!(meta.alignment(), a);
    }

    #[test]
    fn it_works() -> TestResult {
        let mut stack = StackAllocator::new(heap_allocator(), StackParams::default());
        let a = Alignment::system();

        let r0 = stack.alloc(100, a);
        assert!(r0.is_success());
        assert!(r0.bytes >= 100);
        assert!(a.is_aligned(r0.buffer as usize));

        let r1 = stack.alloc(50, a);
        assert!(r1.is_success());
        assert!(r1.buffer as usize >= r0.buffer as usize + r0.bytes);

        track!(stack.validate())?;
        track!(stack.free(r1.buffer))?;
        track!(stack.free(r0.buffer))?;
        track!(stack.validate())?;
        assert_eq!(stack.stats(), StackStats::default());
        Ok(())
    }

    #[test]
    fn lifo_free_compacts_to_zero() -> TestResult {
        // 一つのブロックに32バイトを三回積んで、逆順に解放する
        let mut stack = StackAllocator::new(heap_allocator(), params(256, 1024 * 1024));

        let r0 = stack.alloc(32, Alignment::system());
        let r1 = stack.alloc(32, Alignment::system());
        let r2 = stack.alloc(32, Alignment::system());
        assert_eq!(stack.stats().alloc_count, 3);
        assert_eq!(stack.stats().block_count, 1);

        track!(stack.free(r2.buffer))?;
        assert_eq!(stack.stats().alloc_count, 2);

        track!(stack.free(r1.buffer))?;
        assert_eq!(stack.stats().alloc_count, 1);

        track!(stack.free(r0.buffer))?;
        assert_eq!(stack.stats().alloc_count, 0);
        assert_eq!(stack.stats().block_count, 0);
        assert_eq!(stack.stats().total_memory, 0);
        Ok(())
    }

    #[test]
    fn non_lifo_free_leaves_hole() -> TestResult {
        // 真ん中のチャンクを先に解放しても、ブロックの使用量は変わらない
        let mut stack = StackAllocator::new(heap_allocator(), params(256, 1024 * 1024));

        let r0 = stack.alloc(32, Alignment::system());
        let r1 = stack.alloc(32, Alignment::system());
        let r2 = stack.alloc(32, Alignment::system());

        let used_before = unsafe { (*stack.first_block).data_bytes_used };
        track!(stack.free(r1.buffer))?;
        assert_eq!(stack.stats().alloc_count, 2);
        assert_eq!(stack.stats().block_count, 1);
        assert_eq!(unsafe { (*stack.first_block).data_bytes_used }, used_before);

        // 穴の上が解放されれば、穴ごとまとめて回収される
        track!(stack.free(r2.buffer))?;
        track!(stack.free(r0.buffer))?;
        assert_eq!(stack.stats(), StackStats::default());
        Ok(())
    }

    #[test]
    fn try_expand_grows_top_chunk_only() -> TestResult {
        let mut stack = StackAllocator::new(heap_allocator(), params(256, 1024 * 1024));

        let r0 = stack.alloc(32, Alignment::system());
        let r1 = stack.alloc(32, Alignment::system());

        // 最上位以外のチャンクは拡張できない
        assert_eq!(stack.try_expand(64, r0.buffer), 0);

        // 最上位チャンクはブロック内の空きの範囲で拡張できる
        let expanded = stack.try_expand(64, r1.buffer);
        assert!(expanded >= 64);

        // 拡張は縮小しない
        assert_eq!(stack.try_expand(16, r1.buffer), 0);

        // 未知のポインタは黙って0を返す
        let mut unrelated = 0u8;
        assert_eq!(stack.try_expand(64, &mut unrelated), 0);

        track!(stack.free(r1.buffer))?;
        track!(stack.free(r0.buffer))?;
        Ok(())
    }

    #[test]
    fn try_expand_is_bounded_by_block() -> TestResult {
        let mut stack = StackAllocator::new(heap_allocator(), params(64, 64));

        let r0 = stack.alloc(16, Alignment::system());
        let granted = stack.try_expand(1024 * 1024, r0.buffer);

        // ブロック内の空きを超えない範囲で、可能なだけ拡張される
        assert!(granted > 16);
        assert!(granted < 1024 * 1024);
        track!(stack.free(r0.buffer))?;
        Ok(())
    }

    #[test]
    fn invalid_free_is_detected() {
        let mut stack = StackAllocator::new(heap_allocator(), StackParams::default());
        let r0 = stack.alloc(32, Alignment::system());

        let mut unrelated = 0u8;
        let e = stack.free(&mut unrelated).err().expect("must fail");
        assert_eq!(*e.kind(), ErrorKind::InvalidFree);

        // 二重解放も検出される
        stack.free(r0.buffer).unwrap();
        let e = stack.free(r0.buffer).err().expect("must fail");
        assert_eq!(*e.kind(), ErrorKind::InvalidFree);
    }

    #[test]
    fn rejects_excessive_requests() {
        let mut stack = StackAllocator::new(heap_allocator(), StackParams::default());

        assert!(stack.alloc(32, max_alignment() << 1).is_failure());
        assert!(stack.alloc(MAX_ALLOC_SIZE + 1, Alignment::system()).is_failure());
    }

    #[test]
    fn oversized_allocation_gets_dedicated_block() -> TestResult {
        let mut stack = StackAllocator::new(heap_allocator(), params(64, 128));

        let r0 = stack.alloc(16, Alignment::system());
        let r1 = stack.alloc(4096, Alignment::system());
        assert!(r1.is_success());
        assert_eq!(stack.stats().block_count, 2);
        assert!(stack.stats().total_memory > 4096);

        track!(stack.validate())?;
        track!(stack.free(r1.buffer))?;
        track!(stack.free(r0.buffer))?;
        assert_eq!(stack.stats(), StackStats::default());
        Ok(())
    }

    #[test]
    fn blocks_grow_progressively() -> TestResult {
        let mut stack = StackAllocator::new(heap_allocator(), params(64, 1024 * 1024));

        let mut buffers = Vec::new();
        for _ in 0..64 {
            let r = stack.alloc(48, Alignment::system());
            assert!(r.is_success());
            buffers.push(r.buffer);
        }
        // 新規ブロックは総確保量まで成長するため、ブロック数は割当数よりずっと少ない
        assert!(stack.stats().block_count < 16);

        for buffer in buffers.iter().rev() {
            track!(stack.free(*buffer))?;
        }
        assert_eq!(stack.stats(), StackStats::default());
        Ok(())
    }

    #[test]
    fn blocks_are_released_to_backing_on_drop() {
        let (backing, handle) = TracingAllocator::shared();
        let mut stack = StackAllocator::new(handle, StackParams::default());

        stack.alloc(100, Alignment::system());
        stack.alloc(200, Alignment::system());
        let mut allocated = backing.borrow().allocated.clone();
        assert!(!allocated.is_empty());

        drop(stack);
        let mut freed = backing.borrow().freed.clone();
        allocated.sort();
        freed.sort();
        assert_eq!(freed, allocated);
    }

    #[test]
    fn dump_chunks_works() -> TestResult {
        let mut stack = StackAllocator::new(heap_allocator(), StackParams::default());
        let r0 = stack.alloc(32, Alignment::system());
        let r1 = stack.alloc(16, Alignment::system());
        track!(stack.free(r0.buffer))?;

        let mut csv = Vec::new();
        track!(stack.dump_chunks(&mut csv))?;
        let csv = String::from_utf8(csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines[0], "Block;Offset;Size;Address;Status");
        assert_eq!(lines.len(), 3);
        // 新しいチャンクが先に出力される
        assert!(lines[1].ends_with("USED"));
        assert!(lines[2].ends_with("FREE"));

        track!(stack.free(r1.buffer))?;
        Ok(())
    }
}
