use prometrics::metrics::MetricBuilder;
use std::fmt;
use std::ptr::NonNull;

use crate::allocator::{AllocResult, Allocator, AllocatorHandle};
use crate::metrics::AllocatorMetrics;
use crate::size::{Alignment, ByteSize};
use crate::{ErrorKind, Result};

enum Buffer {
    /// フォールバック先から取得した領域. 破棄時にフォールバック先へ返却される.
    Acquired { base: NonNull<u8>, capacity: ByteSize },

    /// 利用者から譲渡されたバッファ. フォールバック先へ返却されることはない.
    External(Box<[u8]>),
}

/// アリーナ(バンプポインタ)アロケータ.
///
/// 固定サイズのバッファの先頭から順に割当を行う. 割当毎の管理情報は一切持たず、
/// 使用済みオフセットを進めるだけなので非常に高速.
///
/// バッファが尽きた場合、以降の割当はフォールバック先のアロケータへ委譲される.
///
/// # メモリ管理の規則
///
/// - アリーナ内の割当に対する`free`は何も行わない (領域全体が破棄時にまとめて解放される)
/// - フォールバック先から割り当てられた領域に対する`free`は、フォールバック先へ委譲される
/// - `try_expand`は常に`0`を返す
pub struct ArenaAllocator {
    fallback: AllocatorHandle,
    buffer: Buffer,
    used: ByteSize,
    metrics: AllocatorMetrics,
}
impl ArenaAllocator {
    /// フォールバック先から`capacity`バイトの領域を取得して、アリーナを構築する.
    ///
    /// 取得した領域は、アリーナの破棄時にフォールバック先へ返却される.
    ///
    /// # Errors
    ///
    /// フォールバック先が領域の確保に失敗した場合は`ErrorKind::MemoryFull`が返される.
    pub fn new(capacity: ByteSize, fallback: AllocatorHandle) -> Result<Self> {
        let result = fallback.alloc(capacity, Alignment::system());
        track_assert!(result.is_success(), ErrorKind::MemoryFull);
        Ok(ArenaAllocator {
            fallback,
            buffer: Buffer::Acquired {
                base: unsafe { NonNull::new_unchecked(result.buffer) },
                capacity: result.bytes,
            },
            used: 0,
            metrics: AllocatorMetrics::new(&MetricBuilder::new(), "arena"),
        })
    }

    /// 利用者が用意したバッファの上にアリーナを構築する.
    ///
    /// バッファの所有権はアリーナに移るが、フォールバック先経由で解放されることはない.
    pub fn with_buffer(buffer: Box<[u8]>, fallback: AllocatorHandle) -> Self {
        ArenaAllocator {
            fallback,
            buffer: Buffer::External(buffer),
            used: 0,
            metrics: AllocatorMetrics::new(&MetricBuilder::new(), "arena"),
        }
    }

    /// アリーナの容量(バイト単位)を返す.
    pub fn capacity(&self) -> ByteSize {
        match self.buffer {
            Buffer::Acquired { capacity, .. } => capacity,
            Buffer::External(ref buffer) => buffer.len(),
        }
    }

    /// アリーナ内の使用済みバイト数を返す.
    ///
    /// フォールバック先へ委譲された割当は含まれない.
    pub fn used_bytes(&self) -> ByteSize {
        self.used
    }

    /// アロケータのメトリクスを返す.
    pub fn metrics(&self) -> &AllocatorMetrics {
        &self.metrics
    }

    fn base(&self) -> *mut u8 {
        match self.buffer {
            Buffer::Acquired { base, .. } => base.as_ptr(),
            Buffer::External(ref buffer) => buffer.as_ptr() as *mut u8,
        }
    }

    fn contains(&self, buffer: *mut u8) -> bool {
        let base = self.base() as usize;
        let address = buffer as usize;
        address >= base && address < base + self.capacity()
    }
}
impl Allocator for ArenaAllocator {
    fn name(&self) -> &'static str {
        "arena"
    }
    fn alloc(&mut self, bytes: ByteSize, alignment: Alignment) -> AllocResult {
        let tail = unsafe { self.base().add(self.used) };
        let padding = alignment.padding(tail);
        let corrected = alignment.round_up(bytes);
        let total = padding + corrected;
        let remaining = self.capacity() - self.used;

        if total > remaining {
            self.metrics.nospace_failures.increment();
            return self.fallback.alloc(corrected, alignment);
        }

        let offset = self.used + padding;
        self.used += total;
        self.metrics.count_allocation(corrected);
        AllocResult {
            buffer: unsafe { self.base().add(offset) },
            bytes: corrected,
        }
    }
    fn try_expand(&mut self, _new_bytes: ByteSize, _buffer: *mut u8) -> ByteSize {
        0
    }
    fn free(&mut self, buffer: *mut u8) -> Result<()> {
        if self.contains(buffer) {
            // アリーナ内の解放は何もしない. 領域全体が破棄時に解放される.
            Ok(())
        } else {
            track!(self.fallback.free(buffer))
        }
    }
}
impl Drop for ArenaAllocator {
    fn drop(&mut self) {
        if let Buffer::Acquired { base, .. } = self.buffer {
            let _ = self.fallback.free(base.as_ptr());
        }
    }
}
impl fmt::Debug for ArenaAllocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ArenaAllocator {{ capacity: {}, used: {} }}",
            self.capacity(),
            self.used
        )
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;
    use crate::allocator::testing::TracingAllocator;
    use crate::allocator::heap_allocator;

    #[test]
    fn it_works() -> TestResult {
        let mut arena = track!(ArenaAllocator::new(1024, heap_allocator()))?;
        assert_eq!(arena.capacity(), 1024);
        assert_eq!(arena.used_bytes(), 0);

        let a = Alignment::system();
        let r0 = arena.alloc(100, a);
        assert!(r0.is_success());
        assert!(r0.bytes >= 100);
        assert!(a.is_aligned(r0.buffer as usize));

        let r1 = arena.alloc(100, a);
        assert!(r1.is_success());

        // 割当同士は重ならない
        assert!(r1.buffer as usize >= r0.buffer as usize + r0.bytes);

        track!(arena.free(r0.buffer))?;
        track!(arena.free(r1.buffer))?;
        Ok(())
    }

    #[test]
    fn overflow_falls_back() -> TestResult {
        // 1024バイトのアリーナに900 + 200を要求する
        let (fallback, handle) = TracingAllocator::shared();
        let buffer = vec![0; 1024].into_boxed_slice();
        let mut arena = ArenaAllocator::with_buffer(buffer, handle);

        let r0 = arena.alloc(900, Alignment::system());
        assert!(r0.is_success());
        assert!(arena.contains(r0.buffer));
        assert!(fallback.borrow().allocated.is_empty());

        let r1 = arena.alloc(200, Alignment::system());
        assert!(r1.is_success());
        assert!(!arena.contains(r1.buffer));
        assert_eq!(fallback.borrow().allocated.len(), 1);
        assert_eq!(arena.metrics().nospace_failures(), 1);

        // アリーナ内の解放は何もしない
        track!(arena.free(r0.buffer))?;
        // フォールバック先の割当は委譲されて解放される
        track!(arena.free(r1.buffer))?;
        assert_eq!(fallback.borrow().freed.len(), 1);

        // 利用者のバッファはフォールバック先経由で解放されない
        drop(arena);
        assert_eq!(fallback.borrow().freed.len(), 1);
        Ok(())
    }

    #[test]
    fn acquired_buffer_is_released_on_drop() -> TestResult {
        let (fallback, handle) = TracingAllocator::shared();
        let arena = track!(ArenaAllocator::new(512, handle))?;
        let base = fallback.borrow().allocated[0];

        drop(arena);
        assert_eq!(fallback.borrow().freed, vec![base]);
        Ok(())
    }

    #[test]
    fn alignment_padding_is_applied() -> TestResult {
        let mut arena = track!(ArenaAllocator::new(4096, heap_allocator()))?;
        let a = Alignment::from_bytes(64);

        arena.alloc(1, Alignment::system());
        let r = arena.alloc(10, a);
        assert!(r.is_success());
        assert!(a.is_aligned(r.buffer as usize));
        assert_eq!(r.bytes, 64);
        Ok(())
    }

    #[test]
    fn try_expand_never_grows() -> TestResult {
        let mut arena = track!(ArenaAllocator::new(1024, heap_allocator()))?;
        let r = arena.alloc(100, Alignment::system());
        assert_eq!(arena.try_expand(200, r.buffer), 0);
        Ok(())
    }
}
