use libc;
use std::mem;
use std::ptr;

use crate::allocator::{AllocResult, Allocator};
use crate::size::{Alignment, ByteSize};
use crate::Result;

/// プロセスヒープ(システムの`malloc`)に委譲するアロケータ.
///
/// デフォルトアロケータスタックが空の場合のフォールバック先として使われる.
/// `malloc`自体がスレッドセーフであるため、各スレッドが独立にインスタンスを持っても問題は無い.
///
/// # 注意
///
/// `free`に渡されたポインタの妥当性検査は行えない.
/// `malloc`由来でないポインタを渡した場合の動作は未定義となる.
#[derive(Debug, Default, Clone)]
pub struct HeapAllocator(());
impl HeapAllocator {
    /// 新しい`HeapAllocator`インスタンスを生成する.
    pub fn new() -> Self {
        HeapAllocator(())
    }
}
impl Allocator for HeapAllocator {
    fn name(&self) -> &'static str {
        "heap"
    }
    fn alloc(&mut self, bytes: ByteSize, alignment: Alignment) -> AllocResult {
        // `malloc(0)`はnullを返すことが許されているため、最低1バイトは要求する
        let corrected = bytes.max(1);
        let buffer = if alignment <= Alignment::system() {
            unsafe { libc::malloc(corrected) as *mut u8 }
        } else {
            // `posix_memalign`はポインタサイズ以上のアライメントしか受け付けない
            let align = alignment.bytes().max(mem::size_of::<usize>());
            let mut buffer: *mut libc::c_void = ptr::null_mut();
            let ret = unsafe { libc::posix_memalign(&mut buffer, align, corrected) };
            if ret == 0 {
                buffer as *mut u8
            } else {
                ptr::null_mut()
            }
        };
        if buffer.is_null() {
            AllocResult::failure()
        } else {
            AllocResult {
                buffer,
                bytes: corrected,
            }
        }
    }
    fn try_expand(&mut self, _new_bytes: ByteSize, _buffer: *mut u8) -> ByteSize {
        0
    }
    fn free(&mut self, buffer: *mut u8) -> Result<()> {
        unsafe { libc::free(buffer as *mut libc::c_void) };
        Ok(())
    }
}
