//! Lean Allocators.
//!
//! `leanalloc`は、性能指向のコンテナ群の土台となることを目的とした、組み替え可能なメモリアロケータ集.
//!
//! # 特徴
//!
//! - 全てのアロケータが`alloc`/`try_expand`/`free`という統一インターフェースを実装
//! - アロケータ同士の階層化が可能 (e.g., システムヒープの上にアリーナ、その上にスタック)
//! - スレッド毎の"デフォルトアロケータ"スタックとスコープガードによる切り替え
//! - 割当操作の観測用のログシンク機構と、リーク検出用のシンク実装
//! - ユーザメモリ内にヘッダを埋め込まない (メタデータは全てアロケータ側の管理領域に存在する)
//!
//! # 提供されるアロケータ
//!
//! - [`ArenaAllocator`]: 固定バッファ上のバンプポインタ. 溢れた分はフォールバック先に委譲される
//! - [`StackAllocator`]: ブロックチェーン上のLIFO割当. LIFO順の解放で自動コンパクションが走る
//! - [`LeanTreeAllocator`]: Buddy方式の固定領域アロケータ.
//!   階層化ビットマップ("lean tree")によりメタデータのオーバーヘッドが非常に小さい
//!
//! # モジュールの依存関係
//!
//! ```text
//! allocator => sink => metrics => size
//! ```
//!
//! - [`allocator`]モジュール:
//!   - アロケータのインターフェースと各実装、およびスレッド毎のデフォルトスタックを提供
//!   - `leanalloc`の利用者が直接触るのは主にこのモジュール
//! - [`sink`]モジュール:
//!   - 割当操作を観測するための[`LogSink`]と、リーク追跡用の実装を提供
//! - [`metrics`]モジュール:
//!   - [Prometheus]用のメトリクス群
//! - [`size`]モジュール:
//!   - 二冪サイズおよびアライメント計算用の数値プリミティブ
//!
//! [`ArenaAllocator`]: ./allocator/struct.ArenaAllocator.html
//! [`StackAllocator`]: ./allocator/struct.StackAllocator.html
//! [`LeanTreeAllocator`]: ./allocator/struct.LeanTreeAllocator.html
//! [`allocator`]: ./allocator/index.html
//! [`sink`]: ./sink/index.html
//! [`LogSink`]: ./sink/trait.LogSink.html
//! [`metrics`]: ./metrics/index.html
//! [`size`]: ./size/index.html
//! [Prometheus]: https://prometheus.io/
#![warn(missing_docs)]
extern crate libc;
extern crate prometrics;
#[macro_use]
extern crate slog;
#[macro_use]
extern crate trackable;

pub use crate::error::{Error, ErrorKind};

macro_rules! track_io {
    ($expr:expr) => {
        $expr.map_err(|e: ::std::io::Error| track!(crate::Error::from(e)))
    };
}

pub mod allocator;
pub mod metrics;
pub mod sink;
pub mod size;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
