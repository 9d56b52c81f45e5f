//! 割当操作を観測するためのログシンク機構.
//!
//! アロケータの`alloc`/`try_expand`/`free`は、全て[`AllocatorHandle`]のディスパッチャ経由で
//! 実行され、その際にスレッドローカルに登録されたシンク群へ通知が行われる.
//!
//! シンクへの通知はあくまでも副作用であり、割当操作の結果には一切影響を与えない.
//! また、シンク自身がアロケータを呼び出した場合の無限再帰を防ぐために、
//! 通知中は再入ガードが有効になる (シンク起点の割当は成功するが、再通知はされない).
//!
//! [`AllocatorHandle`]: ../allocator/struct.AllocatorHandle.html
use slog::Logger;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::rc::Rc;

use crate::allocator::AllocResult;
use crate::size::{Alignment, ByteSize};
use crate::Result;

/// 共有可能なログシンクへの参照.
pub type LogSinkRef = Rc<RefCell<dyn LogSink>>;

/// 通知元のアロケータを識別するための情報.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorId {
    /// アロケータインスタンスの識別子 (共有セルのアドレス).
    pub id: usize,

    /// アロケータ種別の名前 (e.g., `"arena"`).
    pub name: &'static str,
}

/// 割当操作の通知を受け取るためのトレイト.
pub trait LogSink {
    /// `alloc`の実行が通知された.
    ///
    /// 失敗した割当(`result.is_failure()`)も通知対象に含まれる.
    fn on_alloc(
        &mut self,
        allocator: AllocatorId,
        requested: ByteSize,
        alignment: Alignment,
        result: AllocResult,
    );

    /// `try_expand`の実行が通知された.
    ///
    /// `new_size`が`0`の場合は、その場拡張に失敗したことを意味する.
    fn on_try_expand(
        &mut self,
        allocator: AllocatorId,
        requested: ByteSize,
        new_size: ByteSize,
        buffer: *const u8,
    );

    /// `free`の実行が通知された.
    fn on_free(&mut self, allocator: AllocatorId, buffer: *const u8);
}

thread_local! {
    static SINKS: RefCell<Vec<LogSinkRef>> = RefCell::new(Vec::new());
    static NOTIFY_GUARD: Cell<bool> = Cell::new(false);
}

struct GuardReset;
impl Drop for GuardReset {
    fn drop(&mut self) {
        NOTIFY_GUARD.with(|guard| guard.set(false));
    }
}

fn each_sink<F>(mut f: F)
where
    F: FnMut(&mut dyn LogSink),
{
    let entered = NOTIFY_GUARD.with(|guard| {
        if guard.get() {
            false
        } else {
            guard.set(true);
            true
        }
    });
    if !entered {
        // シンク起点の割当を再通知しない
        return;
    }
    let _reset = GuardReset;

    // 通知中のシンク登録・解除に耐えるように、リストのスナップショットに対して回す
    let sinks = SINKS.with(|sinks| sinks.borrow().clone());
    for sink in sinks {
        f(&mut *sink.borrow_mut());
    }
}

pub(crate) fn notify_alloc(
    allocator: AllocatorId,
    requested: ByteSize,
    alignment: Alignment,
    result: AllocResult,
) {
    each_sink(|sink| sink.on_alloc(allocator, requested, alignment, result));
}

pub(crate) fn notify_try_expand(
    allocator: AllocatorId,
    requested: ByteSize,
    new_size: ByteSize,
    buffer: *const u8,
) {
    each_sink(|sink| sink.on_try_expand(allocator, requested, new_size, buffer));
}

pub(crate) fn notify_free(allocator: AllocatorId, buffer: *const u8) {
    each_sink(|sink| sink.on_free(allocator, buffer));
}

/// ログシンクをスレッドローカルなシンクリストに登録するためのスコープガード.
///
/// 構築時に登録を行い、破棄時に登録を解除する.
/// シンク群への通知は登録順に行われる.
pub struct LogSinkScope {
    sink: Option<LogSinkRef>,
}
impl LogSinkScope {
    /// `sink`を登録した上で、新しい`LogSinkScope`インスタンスを生成する.
    pub fn new(sink: LogSinkRef) -> Self {
        SINKS.with(|sinks| sinks.borrow_mut().push(Rc::clone(&sink)));
        LogSinkScope { sink: Some(sink) }
    }

    /// スコープの終了を待たずに、シンクの登録を明示的に解除する.
    pub fn pop(&mut self) {
        if let Some(sink) = self.sink.take() {
            SINKS.with(|sinks| {
                let mut sinks = sinks.borrow_mut();
                if let Some(i) = sinks.iter().position(|s| Rc::ptr_eq(s, &sink)) {
                    sinks.remove(i);
                }
            });
        }
    }
}
impl Drop for LogSinkScope {
    fn drop(&mut self) {
        self.pop();
    }
}
impl fmt::Debug for LogSinkScope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LogSinkScope {{ registered: {} }}", self.sink.is_some())
    }
}

/// 生きている割当を`(アロケータ, ポインタ)`単位で記録するシンク.
///
/// 全ての割当が解放済みであれば、記録はゼロ件になる.
/// テストやデバッグビルドでのリーク検出を想定した実装.
#[derive(Debug, Default)]
pub struct LeakTrackingSink {
    allocations: BTreeMap<(usize, usize), ByteSize>,
}
impl LeakTrackingSink {
    /// 新しい`LeakTrackingSink`インスタンスを生成する.
    pub fn new() -> Self {
        LeakTrackingSink::default()
    }

    /// 現在記録されている(i.e., 未解放の)割当の数を返す.
    pub fn live_allocation_count(&self) -> usize {
        self.allocations.len()
    }

    /// 未解放の割当の一覧をCSV形式で書き出す.
    ///
    /// 列は`address;size_bytes;allocator`の三つ.
    pub fn dump_live_allocations<W: Write>(&self, mut writer: W) -> Result<()> {
        track_io!(writeln!(writer, "address;size_bytes;allocator"))?;
        for (&(allocator, address), &size) in &self.allocations {
            track_io!(writeln!(writer, "0x{:x};{};0x{:x}", address, size, allocator))?;
        }
        Ok(())
    }
}
impl LogSink for LeakTrackingSink {
    fn on_alloc(
        &mut self,
        allocator: AllocatorId,
        requested: ByteSize,
        _alignment: Alignment,
        result: AllocResult,
    ) {
        if result.is_success() {
            self.allocations
                .insert((allocator.id, result.buffer as usize), requested);
        }
    }
    fn on_try_expand(
        &mut self,
        allocator: AllocatorId,
        _requested: ByteSize,
        new_size: ByteSize,
        buffer: *const u8,
    ) {
        if new_size > 0 {
            if let Some(size) = self.allocations.get_mut(&(allocator.id, buffer as usize)) {
                *size = new_size;
            }
        }
    }
    fn on_free(&mut self, allocator: AllocatorId, buffer: *const u8) {
        if !buffer.is_null() {
            self.allocations.remove(&(allocator.id, buffer as usize));
        }
    }
}

/// 全ての割当操作をslogのロガーに書き出すシンク.
#[derive(Debug, Clone)]
pub struct SlogSink {
    logger: Logger,
}
impl SlogSink {
    /// `logger`に書き出す`SlogSink`インスタンスを生成する.
    pub fn new(logger: Logger) -> Self {
        SlogSink { logger }
    }
}
impl LogSink for SlogSink {
    fn on_alloc(
        &mut self,
        allocator: AllocatorId,
        requested: ByteSize,
        alignment: Alignment,
        result: AllocResult,
    ) {
        debug!(self.logger, "alloc";
               "allocator" => allocator.name,
               "id" => format!("0x{:x}", allocator.id),
               "requested" => requested as u64,
               "alignment" => alignment.bytes() as u64,
               "bytes" => result.bytes as u64,
               "buffer" => format!("0x{:x}", result.buffer as usize));
    }
    fn on_try_expand(
        &mut self,
        allocator: AllocatorId,
        requested: ByteSize,
        new_size: ByteSize,
        buffer: *const u8,
    ) {
        debug!(self.logger, "try_expand";
               "allocator" => allocator.name,
               "id" => format!("0x{:x}", allocator.id),
               "requested" => requested as u64,
               "new_size" => new_size as u64,
               "buffer" => format!("0x{:x}", buffer as usize));
    }
    fn on_free(&mut self, allocator: AllocatorId, buffer: *const u8) {
        debug!(self.logger, "free";
               "allocator" => allocator.name,
               "id" => format!("0x{:x}", allocator.id),
               "buffer" => format!("0x{:x}", buffer as usize));
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    fn id(n: usize) -> AllocatorId {
        AllocatorId { id: n, name: "test" }
    }

    fn success(address: usize, bytes: ByteSize) -> AllocResult {
        AllocResult {
            buffer: address as *mut u8,
            bytes,
        }
    }

    #[test]
    fn leak_tracking_works() {
        let mut sink = LeakTrackingSink::new();
        let a = Alignment::system();

        sink.on_alloc(id(1), 100, a, success(0x1000, 128));
        sink.on_alloc(id(1), 50, a, success(0x2000, 64));
        sink.on_alloc(id(2), 10, a, success(0x1000, 16));
        assert_eq!(sink.live_allocation_count(), 3);

        // 失敗した割当は記録されない
        sink.on_alloc(id(1), 100, a, AllocResult::failure());
        assert_eq!(sink.live_allocation_count(), 3);

        sink.on_free(id(1), 0x1000 as *const u8);
        assert_eq!(sink.live_allocation_count(), 2);

        // 未知のポインタや別アロケータのポインタは無視される
        sink.on_free(id(1), 0x1000 as *const u8);
        sink.on_free(id(9), 0x2000 as *const u8);
        assert_eq!(sink.live_allocation_count(), 2);

        sink.on_free(id(1), 0x2000 as *const u8);
        sink.on_free(id(2), 0x1000 as *const u8);
        assert_eq!(sink.live_allocation_count(), 0);
    }

    #[test]
    fn try_expand_updates_recorded_size() -> TestResult {
        let mut sink = LeakTrackingSink::new();
        let a = Alignment::system();

        sink.on_alloc(id(1), 100, a, success(0x1000, 128));

        // 失敗(new_size == 0)では記録は変わらない
        sink.on_try_expand(id(1), 256, 0, 0x1000 as *const u8);
        // 成功時は記録サイズが更新される
        sink.on_try_expand(id(1), 256, 256, 0x1000 as *const u8);

        let mut csv = Vec::new();
        track!(sink.dump_live_allocations(&mut csv))?;
        let csv = String::from_utf8(csv).unwrap();
        assert_eq!(csv, "address;size_bytes;allocator\n0x1000;256;0x1\n");
        Ok(())
    }

    #[test]
    fn csv_dump_is_sorted_and_complete() -> TestResult {
        let mut sink = LeakTrackingSink::new();
        let a = Alignment::system();
        sink.on_alloc(id(2), 8, a, success(0xb000, 8));
        sink.on_alloc(id(1), 32, a, success(0xa000, 32));

        let mut csv = Vec::new();
        track!(sink.dump_live_allocations(&mut csv))?;
        let csv = String::from_utf8(csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(
            lines,
            vec![
                "address;size_bytes;allocator",
                "0xa000;32;0x1",
                "0xb000;8;0x2",
            ]
        );
        Ok(())
    }
}
