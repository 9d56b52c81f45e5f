use std::cell::RefCell;

use crate::allocator::{AllocatorHandle, HeapAllocator};

thread_local! {
    static DEFAULT_ALLOCATORS: RefCell<Vec<Option<AllocatorHandle>>> = RefCell::new(Vec::new());
    static HEAP: AllocatorHandle = AllocatorHandle::new(HeapAllocator::new());
}

/// 現在のスレッドのプロセスヒープ用ハンドルを返す.
///
/// 返り値は呼び出し毎に同じインスタンスを指す.
pub fn heap_allocator() -> AllocatorHandle {
    HEAP.with(AllocatorHandle::clone)
}

/// 現在のスレッドのデフォルトアロケータを返す.
///
/// デフォルトアロケータは[`AllocatorScope`]によってスレッド毎のスタックに積まれた
/// もののうち、最も新しい生きているハンドル. スタックが空の場合には
/// [`heap_allocator`]が返される.
///
/// [`AllocatorScope`]: ./struct.AllocatorScope.html
/// [`heap_allocator`]: ./fn.heap_allocator.html
pub fn default_allocator() -> AllocatorHandle {
    DEFAULT_ALLOCATORS
        .with(|stack| {
            stack
                .borrow()
                .iter()
                .rev()
                .filter_map(|slot| slot.clone())
                .next()
        })
        .unwrap_or_else(heap_allocator)
}

/// アロケータをスレッドのデフォルトスタックに積むためのスコープガード.
///
/// 構築時にスタックへ積み、破棄時に自分のスロットを取り除く.
///
/// ガード群がLIFO順で破棄されなかった場合でも破綻しないように、
/// 破棄時には自分のスロットへ墓標(None)を立てるだけに留め、
/// スタック末尾に連続する墓標をまとめて回収する方式を取っている.
/// 全てのガードが破棄されれば、スタックは必ず構築前の状態に戻る.
#[derive(Debug)]
pub struct AllocatorScope {
    position: usize,
    active: bool,
}
impl AllocatorScope {
    /// `allocator`をデフォルトスタックに積んだ上で、新しい`AllocatorScope`インスタンスを生成する.
    pub fn new(allocator: AllocatorHandle) -> Self {
        let position = DEFAULT_ALLOCATORS.with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.push(Some(allocator));
            stack.len() - 1
        });
        AllocatorScope {
            position,
            active: true,
        }
    }

    /// スコープの終了を待たずに、スタックから明示的に取り除く.
    pub fn pop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        DEFAULT_ALLOCATORS.with(|stack| {
            let mut stack = stack.borrow_mut();
            if self.position < stack.len() {
                stack[self.position] = None;
            }
            while stack.last().map_or(false, Option::is_none) {
                stack.pop();
            }
        });
    }
}
impl Drop for AllocatorScope {
    fn drop(&mut self) {
        self.pop();
    }
}
