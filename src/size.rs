//! 二冪のサイズおよびアライメントを扱うための数値プリミティブ.
//!
//! アロケータ群は「サイズは二冪に切り上げて管理する」「ポインタは指定境界に揃える」という
//! 操作を大量に行うため、二冪数を底2の対数で保持する専用の型を提供している.
use std::mem;
use std::ops::{Div, Mul, Shl};

/// バイト数を表現するための型.
pub type ByteSize = usize;

/// 個数を表現するための型.
pub type Count = u32;

/// 二冪のアライメント(バイト境界)を表現するための構造体.
///
/// 内部的には底2の対数のみを保持しているため、サイズは1バイトで済む.
///
/// 境界への切り上げ・切り下げやパディング量の計算といった補助メソッド群も提供している.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Alignment(u8);
impl Alignment {
    /// システム(ポインタ幅)のアライメントを返す.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::mem;
    /// use leanalloc::size::Alignment;
    ///
    /// assert_eq!(Alignment::system().bytes(), mem::align_of::<usize>());
    /// ```
    pub fn system() -> Self {
        Self::from_bytes(mem::align_of::<usize>())
    }

    /// 型`T`のアライメントを返す.
    pub fn of<T>() -> Self {
        Self::from_bytes(mem::align_of::<T>())
    }

    /// `bytes`以上で最小の二冪アライメントを返す.
    ///
    /// `bytes`が`0`の場合は1バイト境界として扱われる.
    ///
    /// # Examples
    ///
    /// ```
    /// use leanalloc::size::Alignment;
    ///
    /// assert_eq!(Alignment::from_bytes(0).bytes(), 1);
    /// assert_eq!(Alignment::from_bytes(8).bytes(), 8);
    /// assert_eq!(Alignment::from_bytes(9).bytes(), 16);
    /// ```
    pub fn from_bytes(bytes: ByteSize) -> Self {
        Alignment(log2_ceil(bytes))
    }

    /// 底2の対数から`Alignment`インスタンスを生成する.
    pub fn from_log2(log2: u8) -> Self {
        Alignment(log2)
    }

    /// 底2の対数を返す.
    pub fn log2(self) -> u8 {
        self.0
    }

    /// アライメントをバイト数として返す.
    ///
    /// 対数がポインタ幅を超えている場合には`usize::MAX`に飽和する.
    pub fn bytes(self) -> ByteSize {
        saturating_pow2(self.0)
    }

    /// アライメントをビット数として返す.
    pub fn bits(self) -> ByteSize {
        self.bytes().saturating_mul(8)
    }

    /// 下位ビットを落とすためのマスク(`!(bytes - 1)`)を返す.
    pub fn mask(self) -> usize {
        !(self.bytes().wrapping_sub(1))
    }

    /// `n`をアライメント境界に切り上げる.
    ///
    /// # Examples
    ///
    /// ```
    /// use leanalloc::size::Alignment;
    ///
    /// let a = Alignment::from_bytes(16);
    /// assert_eq!(a.round_up(0), 0);
    /// assert_eq!(a.round_up(1), 16);
    /// assert_eq!(a.round_up(16), 16);
    /// ```
    pub fn round_up(self, n: ByteSize) -> ByteSize {
        (n + self.bytes() - 1) & self.mask()
    }

    /// `n`をアライメント境界に切り下げる.
    ///
    /// # Examples
    ///
    /// ```
    /// use leanalloc::size::Alignment;
    ///
    /// let a = Alignment::from_bytes(16);
    /// assert_eq!(a.round_down(15), 0);
    /// assert_eq!(a.round_down(17), 16);
    /// ```
    pub fn round_down(self, n: ByteSize) -> ByteSize {
        n & self.mask()
    }

    /// `n`がアライメント境界に沿っているかどうかを判定する.
    pub fn is_aligned(self, n: ByteSize) -> bool {
        (n & !self.mask()) == 0
    }

    /// `ptr`を次のアライメント境界まで進めるのに必要なパディング量を返す.
    ///
    /// `ptr`が既に境界に沿っている場合は`0`.
    pub fn padding(self, ptr: *const u8) -> ByteSize {
        let address = ptr as usize;
        self.round_up(address) - address
    }
}
impl Shl<u8> for Alignment {
    type Output = Alignment;

    fn shl(self, rhs: u8) -> Self::Output {
        Alignment(self.0 + rhs)
    }
}
impl From<Power2> for Alignment {
    fn from(f: Power2) -> Self {
        Alignment(f.0)
    }
}

/// 二冪のサイズを表現するための構造体.
///
/// 内部表現は[`Alignment`]と同じく底2の対数だが、こちらは境界ではなく"量"を意図している.
///
/// [`Alignment`]: ./struct.Alignment.html
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Power2(u8);
impl Power2 {
    /// 底2の対数から`Power2`インスタンスを生成する.
    pub fn from_log2(log2: u8) -> Self {
        Power2(log2)
    }

    /// `bytes`以上で最小の二冪サイズを返す.
    ///
    /// `bytes`が`0`の場合は`1`として扱われる.
    ///
    /// # Examples
    ///
    /// ```
    /// use leanalloc::size::Power2;
    ///
    /// assert_eq!(Power2::from_bytes(3).value(), 4);
    /// assert_eq!(Power2::from_bytes(4096).value(), 4096);
    /// ```
    pub fn from_bytes(bytes: ByteSize) -> Self {
        Power2(log2_ceil(bytes))
    }

    /// `bytes`以下で最大の二冪サイズを返す.
    ///
    /// `bytes`が`0`の場合は`1`として扱われる.
    pub fn from_bytes_floor(bytes: ByteSize) -> Self {
        let bytes = bytes.max(1);
        Power2((usize_bits() - 1 - bytes.leading_zeros() as u8) as u8)
    }

    /// 底2の対数を返す.
    pub fn log2(self) -> u8 {
        self.0
    }

    /// サイズをバイト数として返す.
    ///
    /// 対数がポインタ幅を超えている場合には`usize::MAX`に飽和する.
    ///
    /// # Examples
    ///
    /// ```
    /// use leanalloc::size::Power2;
    ///
    /// assert_eq!(Power2::from_log2(10).value(), 1024);
    /// assert_eq!(Power2::from_log2(200).value(), usize::max_value());
    /// ```
    pub fn value(self) -> ByteSize {
        saturating_pow2(self.0)
    }

    /// 一段階大きい(二倍の)サイズを返す.
    pub fn parent(self) -> Self {
        Power2(self.0 + 1)
    }

    /// 一段階小さい(半分の)サイズを返す.
    ///
    /// 既に`1`の場合は`1`のまま.
    pub fn child(self) -> Self {
        Power2(self.0.saturating_sub(1))
    }

    /// `n`をこのサイズの倍数に切り上げる.
    pub fn round_up(self, n: ByteSize) -> ByteSize {
        Alignment(self.0).round_up(n)
    }

    /// `n`をこのサイズの倍数に切り下げる.
    pub fn round_down(self, n: ByteSize) -> ByteSize {
        Alignment(self.0).round_down(n)
    }

    /// `n`がこのサイズの倍数かどうかを判定する.
    pub fn is_aligned(self, n: ByteSize) -> bool {
        Alignment(self.0).is_aligned(n)
    }
}
impl From<Alignment> for Power2 {
    fn from(f: Alignment) -> Self {
        Power2(f.0)
    }
}
impl Mul for Power2 {
    type Output = Power2;

    fn mul(self, rhs: Power2) -> Self::Output {
        Power2(self.0 + rhs.0)
    }
}
impl Div for Power2 {
    type Output = Power2;

    fn div(self, rhs: Power2) -> Self::Output {
        Power2(self.0.saturating_sub(rhs.0))
    }
}

fn usize_bits() -> u8 {
    (mem::size_of::<usize>() * 8) as u8
}

fn saturating_pow2(log2: u8) -> usize {
    if log2 >= usize_bits() {
        usize::max_value()
    } else {
        1 << log2
    }
}

fn log2_ceil(n: usize) -> u8 {
    let n = n.max(1);
    (usize_bits() as u32 - (n - 1).leading_zeros()) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_works() {
        let a = Alignment::from_bytes(64);
        assert_eq!(a.log2(), 6);
        assert_eq!(a.bytes(), 64);
        assert_eq!(a.bits(), 512);

        assert_eq!(a.round_up(0), 0);
        assert_eq!(a.round_up(63), 64);
        assert_eq!(a.round_up(64), 64);
        assert_eq!(a.round_up(65), 128);
        assert_eq!(a.round_down(63), 0);
        assert_eq!(a.round_down(130), 128);

        assert!(a.is_aligned(0));
        assert!(a.is_aligned(192));
        assert!(!a.is_aligned(100));
    }

    #[test]
    fn alignment_padding_works() {
        let a = Alignment::from_bytes(16);
        assert_eq!(a.padding(32 as *const u8), 0);
        assert_eq!(a.padding(33 as *const u8), 15);
        assert_eq!(a.padding(47 as *const u8), 1);
    }

    #[test]
    fn alignment_is_ordered() {
        assert!(Alignment::from_bytes(8) < Alignment::from_bytes(16));
        assert_eq!(Alignment::from_bytes(8), Alignment::from_log2(3));
        assert_eq!((Alignment::from_bytes(8) << 4).bytes(), 128);
    }

    #[test]
    fn power2_rounding_works() {
        assert_eq!(Power2::from_bytes(0).value(), 1);
        assert_eq!(Power2::from_bytes(1).value(), 1);
        assert_eq!(Power2::from_bytes(1025).value(), 2048);
        assert_eq!(Power2::from_bytes_floor(1025).value(), 1024);
        assert_eq!(Power2::from_bytes_floor(1024).value(), 1024);
    }

    #[test]
    fn power2_tree_navigation_works() {
        let p = Power2::from_bytes(16);
        assert_eq!(p.parent().value(), 32);
        assert_eq!(p.child().value(), 8);
        assert_eq!(Power2::from_log2(0).child().value(), 1);
    }

    #[test]
    fn power2_mul_div_works() {
        let a = Power2::from_bytes(64);
        let b = Power2::from_bytes(16);
        assert_eq!((a * b).value(), 1024);
        assert_eq!((a / b).value(), 4);
        assert_eq!((b / a).value(), 1);
    }
}
