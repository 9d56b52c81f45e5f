//! アロケータのインターフェースと各実装.
//!
//! 全てのアロケータは[`Allocator`]トレイトを実装し、[`AllocatorHandle`]を通して利用される.
//! ハンドルは共有可能であり、あるアロケータの獲得元(backing)として別のハンドルを渡すことで、
//! アロケータ同士を自由に階層化できる.
//!
//! ```
//! use leanalloc::allocator::{heap_allocator, ArenaAllocator, AllocatorHandle};
//! use leanalloc::size::Alignment;
//!
//! // システムヒープの上に1KiBのアリーナを重ねる
//! let arena = ArenaAllocator::new(1024, heap_allocator()).unwrap();
//! let arena = AllocatorHandle::new(arena);
//!
//! let result = arena.alloc(256, Alignment::system());
//! assert!(result.is_success());
//! assert!(result.bytes >= 256);
//! arena.free(result.buffer).unwrap();
//! ```
//!
//! [`Allocator`]: ./trait.Allocator.html
//! [`AllocatorHandle`]: ./struct.AllocatorHandle.html
pub use self::arena::ArenaAllocator;
pub use self::default::{default_allocator, heap_allocator, AllocatorScope};
pub use self::heap::HeapAllocator;
pub use self::lean_tree::{LeanTreeAllocator, LeanTreeParams, LeanTreeStats};
pub use self::stack::{StackAllocator, StackParams, StackStats};

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use crate::sink;
use crate::sink::AllocatorId;
use crate::size::{Alignment, ByteSize};
use crate::{ErrorKind, Result};

mod arena;
mod default;
mod heap;
mod lean_tree;
mod stack;

/// 割当操作の結果.
///
/// 成功時には`buffer`が非nullとなり、`bytes`には実際に利用可能なサイズが入る.
/// `bytes`は要求サイズ以上であることが保証される. 利用側が確保量を計算する際には、
/// 要求値ではなくこの値を使用しなければならない.
///
/// 失敗は`{null, 0}`で表現される.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocResult {
    /// 割り当てられた領域の先頭. 失敗時はnull.
    pub buffer: *mut u8,

    /// 実際に利用可能なサイズ. 要求サイズ以上であることが保証される. 失敗時は`0`.
    pub bytes: ByteSize,
}
impl AllocResult {
    /// 失敗を表す`AllocResult`インスタンスを返す.
    pub fn failure() -> Self {
        AllocResult {
            buffer: ptr::null_mut(),
            bytes: 0,
        }
    }

    /// 割当が失敗したかどうかを返す.
    pub fn is_failure(&self) -> bool {
        self.buffer.is_null()
    }

    /// 割当が成功したかどうかを返す.
    pub fn is_success(&self) -> bool {
        !self.is_failure()
    }
}

/// アロケータが実装すべき操作群.
///
/// このトレイトは実装者向けのインターフェースであり、
/// 利用者は[`AllocatorHandle`]経由で操作を行うことが想定されている
/// (ハンドル経由の呼び出しのみがログシンクへの通知対象となる).
///
/// [`AllocatorHandle`]: ./struct.AllocatorHandle.html
pub trait Allocator {
    /// アロケータ種別の名前を返す (e.g., `"arena"`).
    fn name(&self) -> &'static str;

    /// `bytes`バイト以上の領域を`alignment`境界以上に揃えて割り当てる.
    ///
    /// 空き領域が不足している場合には失敗の結果が返される. この操作がパニックすることはない.
    fn alloc(&mut self, bytes: ByteSize, alignment: Alignment) -> AllocResult;

    /// `buffer`の領域を移動させずに`new_bytes`までの拡張を試みる.
    ///
    /// 拡張できた場合は新しいサイズ(拡張前のサイズ以上)を返す.
    /// その場拡張が不可能な場合は`0`を返す.
    ///
    /// 返り値が`new_bytes`未満のこともあり得る. その場合に移動を伴う再割当を行うかどうかは、
    /// 呼び出し側の責務となる.
    fn try_expand(&mut self, new_bytes: ByteSize, buffer: *mut u8) -> ByteSize;

    /// 割当済みの領域を解放する.
    ///
    /// このアロケータが管理していないポインタが渡された場合には
    /// `ErrorKind::InvalidFree`が返される. nullの処理はディスパッチャ側で
    /// 吸収されるため、実装にnullが渡されることはない.
    fn free(&mut self, buffer: *mut u8) -> Result<()>;
}

/// 共有可能なアロケータへのハンドル.
///
/// 全ての割当操作はこのハンドルを経由して実行され、その際に
/// スレッドローカルに登録された[`LogSink`]群へ通知が行われる (通知は結果に影響しない).
///
/// ハンドルは`Clone`可能で、クローン同士は同じアロケータインスタンスを指す.
///
/// [`LogSink`]: ../sink/trait.LogSink.html
#[derive(Clone)]
pub struct AllocatorHandle(Rc<RefCell<dyn Allocator>>);
impl AllocatorHandle {
    /// `allocator`を包んだ新しい`AllocatorHandle`インスタンスを生成する.
    pub fn new<A>(allocator: A) -> Self
    where
        A: Allocator + 'static,
    {
        AllocatorHandle(Rc::new(RefCell::new(allocator)))
    }

    /// 共有セルから`AllocatorHandle`インスタンスを生成する.
    ///
    /// ハンドル経由の操作と並行して、呼び出し側が実装固有のメソッド
    /// (e.g., `validate`)へアクセスし続けたい場合に使用する.
    pub fn from_shared(allocator: Rc<RefCell<dyn Allocator>>) -> Self {
        AllocatorHandle(allocator)
    }

    /// このハンドルが指すアロケータインスタンスの識別子を返す.
    ///
    /// 識別子は共有セルのアドレスであり、インスタンスが生きている間は一意.
    pub fn id(&self) -> usize {
        let cell: *const RefCell<dyn Allocator> = &*self.0;
        cell as *const u8 as usize
    }

    /// アロケータ種別の名前を返す.
    pub fn name(&self) -> &'static str {
        self.0.borrow().name()
    }

    /// `bytes`バイト以上の領域を`alignment`境界以上に揃えて割り当てる.
    ///
    /// 失敗した場合も含めて、結果は登録済みのログシンク群へ通知される.
    pub fn alloc(&self, bytes: ByteSize, alignment: Alignment) -> AllocResult {
        let result = self.0.borrow_mut().alloc(bytes, alignment);
        sink::notify_alloc(self.allocator_id(), bytes, alignment, result);
        result
    }

    /// `buffer`の領域を移動させずに`new_bytes`までの拡張を試みる.
    pub fn try_expand(&self, new_bytes: ByteSize, buffer: *mut u8) -> ByteSize {
        let new_size = self.0.borrow_mut().try_expand(new_bytes, buffer);
        sink::notify_try_expand(self.allocator_id(), new_bytes, new_size, buffer);
        new_size
    }

    /// 割当済みの領域を解放する.
    ///
    /// `buffer`がnullの場合は何も行わない (シンクへの通知も行われない).
    pub fn free(&self, buffer: *mut u8) -> Result<()> {
        if buffer.is_null() {
            return Ok(());
        }
        track!(self.0.borrow_mut().free(buffer))?;
        sink::notify_free(self.allocator_id(), buffer);
        Ok(())
    }

    /// `value`をこのアロケータ上に配置する.
    ///
    /// # Errors
    ///
    /// 割当に失敗した場合は`ErrorKind::MemoryFull`が返される.
    pub fn create<T>(&self, value: T) -> Result<NonNull<T>> {
        let result = self.alloc(mem::size_of::<T>(), Alignment::of::<T>());
        track_assert!(result.is_success(), ErrorKind::MemoryFull);
        let buffer = result.buffer as *mut T;
        unsafe {
            ptr::write(buffer, value);
            Ok(NonNull::new_unchecked(buffer))
        }
    }

    /// [`create`]で配置した値を破棄して、領域を解放する.
    ///
    /// # Safety
    ///
    /// `buffer`は、このハンドルが指すアロケータの[`create`]が返した有効なポインタであり、
    /// かつ未解放でなければならない.
    ///
    /// [`create`]: #method.create
    pub unsafe fn destroy<T>(&self, buffer: NonNull<T>) -> Result<()> {
        ptr::drop_in_place(buffer.as_ptr());
        track!(self.free(buffer.as_ptr() as *mut u8))
    }

    fn allocator_id(&self) -> AllocatorId {
        AllocatorId {
            id: self.id(),
            name: self.name(),
        }
    }
}
impl fmt::Debug for AllocatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "AllocatorHandle {{ name: {:?}, id: 0x{:x} }}",
            self.name(),
            self.id()
        )
    }
}
