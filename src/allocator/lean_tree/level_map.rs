use std::mem;
use std::ptr;

use crate::size::{Alignment, ByteSize};

/// ビット表現で保持されるレベルの数.
///
/// レベル`0`は基本ブロック毎の使用中フラグ、レベル`1..5`は"solid"フラグを
/// 1ブロック1ビットで保持する. レベル`5`以上は1ブロック1バイトの状態値になる.
pub(crate) const BIT_LEVELS: u8 = 5;

/// バイトレベルの状態: ブロック全体が空き(合体済み).
pub(crate) const FREE_SOLID: u8 = 0x00;

/// バイトレベルの状態: ブロック全体が単一の割当として使用中.
pub(crate) const FULL_SOLID: u8 = 0x02;

/// バイトレベルの状態: ブロックは分割済みで、子孫が全て使用中.
pub(crate) const FULL_FRAGMENTED: u8 = 0x03;

const PARTIAL_FLAG: u8 = 0x80;

/// バイトレベルの状態: 分割済みで一部が空き. 最大空きスパンの対数を併せて記録する.
pub(crate) fn partial(log2_lfs: u8) -> u8 {
    PARTIAL_FLAG | log2_lfs
}

pub(crate) fn is_partial(state: u8) -> bool {
    (state & PARTIAL_FLAG) != 0
}

pub(crate) fn partial_log2(state: u8) -> u8 {
    state & !PARTIAL_FLAG
}

/// バイトレベルの状態値から、そのノードの最大空きスパン(基本ブロック数)を求める.
pub(crate) fn state_lfs(state: u8, level: u8) -> u64 {
    if state == FREE_SOLID {
        1 << level
    } else if is_partial(state) {
        1 << partial_log2(state)
    } else {
        // FULL_SOLID / FULL_FRAGMENTED
        0
    }
}

const WORD_BITS: u64 = (mem::size_of::<usize>() * 8) as u64;

/// lean treeの階層化された空き情報の圧縮表現.
///
/// 各レベルの配列は管理領域の先頭(メタデータ領域)に連続して配置される.
/// ビットレベルはワード境界に切り上げたビット配列、バイトレベルは1ノード1バイトの配列.
pub(crate) struct LevelMap {
    base: *mut u8,
    offsets: Vec<ByteSize>,
    metadata_bytes: ByteSize,
}
impl LevelMap {
    /// 各レベルの配列サイズを計算して、領域先頭のメタデータをゼロ初期化する.
    ///
    /// ゼロ値は「レベル0が全て空き」「全てのバイトレベルが`FREE_SOLID`」を意味するため、
    /// 初期状態(完全な空き)の表現と一致する.
    ///
    /// # Safety
    ///
    /// `base`はワード境界に揃っており、計算されるメタデータサイズ分の書き込みが
    /// 可能でなければならない.
    pub unsafe fn new(base: *mut u8, total_basic_blocks: u64, levels: u8) -> LevelMap {
        let (offsets, metadata_bytes) = Self::layout(total_basic_blocks, levels);
        ptr::write_bytes(base, 0, metadata_bytes);
        LevelMap {
            base,
            offsets,
            metadata_bytes,
        }
    }

    /// 各レベルの先頭オフセットと、メタデータ全体のバイト数を計算する.
    pub fn layout(total_basic_blocks: u64, levels: u8) -> (Vec<ByteSize>, ByteSize) {
        let word = Alignment::of::<usize>();
        let mut offsets = Vec::with_capacity(levels as usize);
        let mut offset = 0;
        for level in 0..levels {
            offsets.push(offset);
            let entries = (total_basic_blocks >> level).max(1) as ByteSize;
            let size = if level < BIT_LEVELS {
                word.round_up((entries + 7) / 8)
            } else {
                word.round_up(entries)
            };
            offset += size;
        }
        (offsets, offset)
    }

    /// メタデータ(レベル配列群)が占めるバイト数を返す.
    pub fn metadata_bytes(&self) -> ByteSize {
        self.metadata_bytes
    }

    unsafe fn word(&self, level: u8, word_index: u64) -> *mut usize {
        (self.base.add(self.offsets[level as usize]) as *mut usize).add(word_index as usize)
    }

    // `index`から`count`ビットのマスクを求める.
    // 呼び出し側は「二冪の`count`が自身のサイズ境界に揃っている」ことを保証するため、
    // スパンがワード境界をまたぐことはない.
    fn word_and_mask(index: u64, count: u64) -> (u64, usize) {
        let bit = index % WORD_BITS;
        debug_assert!(count > 0 && bit + count <= WORD_BITS);
        let mask = if count == WORD_BITS {
            !0
        } else {
            ((1usize << count) - 1) << bit
        };
        (index / WORD_BITS, mask)
    }

    unsafe fn get_bit(&self, level: u8, index: u64) -> bool {
        let (word, mask) = Self::word_and_mask(index, 1);
        (*self.word(level, word) & mask) != 0
    }

    unsafe fn set_bits(&mut self, level: u8, index: u64, count: u64) {
        let (word, mask) = Self::word_and_mask(index, count);
        *self.word(level, word) |= mask;
    }

    unsafe fn clear_bits(&mut self, level: u8, index: u64, count: u64) {
        let (word, mask) = Self::word_and_mask(index, count);
        *self.word(level, word) &= !mask;
    }

    /// レベル0: `index`の基本ブロックが使用中かどうかを返す.
    pub fn level0_bit(&self, index: u64) -> bool {
        unsafe { self.get_bit(0, index) }
    }

    /// レベル0: `index`から`count`個の基本ブロックを使用中にする.
    pub fn mark_used(&mut self, index: u64, count: u64) {
        unsafe { self.set_bits(0, index, count) }
    }

    /// レベル0: `index`から`count`個の基本ブロックを空きにする.
    pub fn mark_free(&mut self, index: u64, count: u64) {
        unsafe { self.clear_bits(0, index, count) }
    }

    /// レベル0: `index`から`count`個の基本ブロックが全て空きかどうかを返す.
    ///
    /// `index`は`count`の倍数でなければならない. ワード幅を超えるスパンにも対応する.
    pub fn is_all_free(&self, index: u64, count: u64) -> bool {
        self.used_blocks_in(index, count) == 0
    }

    /// レベル0: `index`から`count`個の範囲にある使用中の基本ブロック数を返す.
    pub fn used_blocks_in(&self, index: u64, count: u64) -> u64 {
        debug_assert!(index % count == 0);
        unsafe {
            if count <= WORD_BITS {
                let (word, mask) = Self::word_and_mask(index, count);
                (*self.word(0, word) & mask).count_ones() as u64
            } else {
                debug_assert!(index % WORD_BITS == 0 && count % WORD_BITS == 0);
                let first = index / WORD_BITS;
                let words = count / WORD_BITS;
                let mut used = 0;
                for i in 0..words {
                    used += (*self.word(0, first + i)).count_ones() as u64;
                }
                used
            }
        }
    }

    /// ビットレベル(`1..BIT_LEVELS`)の"solid"フラグを返す.
    pub fn solid_bit(&self, level: u8, index: u64) -> bool {
        debug_assert!(level > 0 && level < BIT_LEVELS);
        unsafe { self.get_bit(level, index) }
    }

    /// ビットレベルの"solid"フラグを立てる.
    pub fn set_solid(&mut self, level: u8, index: u64) {
        debug_assert!(level > 0 && level < BIT_LEVELS);
        unsafe { self.set_bits(level, index, 1) }
    }

    /// ビットレベルの"solid"フラグを落とす (ノードが混在状態になった).
    pub fn clear_solid(&mut self, level: u8, index: u64) {
        debug_assert!(level > 0 && level < BIT_LEVELS);
        unsafe { self.clear_bits(level, index, 1) }
    }

    /// ビットレベルの"solid"フラグを`index`から`count`ノード分まとめて立てる.
    pub fn set_solid_range(&mut self, level: u8, index: u64, count: u64) {
        debug_assert!(level > 0 && level < BIT_LEVELS);
        unsafe { self.set_bits(level, index, count) }
    }

    /// バイトレベルのノードの状態値を返す.
    pub fn byte(&self, level: u8, index: u64) -> u8 {
        debug_assert!(level >= BIT_LEVELS);
        unsafe { *self.base.add(self.offsets[level as usize] + index as usize) }
    }

    /// バイトレベルのノードの状態値を書き換える.
    pub fn set_byte(&mut self, level: u8, index: u64, state: u8) {
        debug_assert!(level >= BIT_LEVELS);
        unsafe {
            *self.base.add(self.offsets[level as usize] + index as usize) = state;
        }
    }

    /// ビットレベルの部分木の最大空きスパン(基本ブロック数)を求める.
    ///
    /// ビットレベルには空きスパンの記録が無いため、再帰的に計算する.
    /// "solid"な部分木の空き・使用中は、レベル0のビットで解決される.
    pub fn bit_lfs(&self, level: u8, index: u64) -> u64 {
        debug_assert!(level < BIT_LEVELS);
        if level == 0 {
            return if self.level0_bit(index) { 0 } else { 1 };
        }
        if self.solid_bit(level, index) {
            if self.level0_bit(index << level) {
                0
            } else {
                1 << level
            }
        } else {
            let left = self.bit_lfs(level - 1, index * 2);
            let right = self.bit_lfs(level - 1, index * 2 + 1);
            left.max(right)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapBuffer {
        _storage: Vec<usize>,
        map: LevelMap,
    }

    fn map(total_basic_blocks: u64, levels: u8) -> MapBuffer {
        let (_, bytes) = LevelMap::layout(total_basic_blocks, levels);
        let mut storage = vec![0usize; bytes / mem::size_of::<usize>() + 1];
        let map = unsafe { LevelMap::new(storage.as_mut_ptr() as *mut u8, total_basic_blocks, levels) };
        MapBuffer {
            _storage: storage,
            map,
        }
    }

    #[test]
    fn layout_is_word_padded() {
        // 4096基本ブロック、10レベル (ビット5 + バイト5)
        let (offsets, total) = LevelMap::layout(4096, 10);
        assert_eq!(offsets, vec![0, 512, 768, 896, 960, 992, 1120, 1184, 1216, 1232]);
        assert_eq!(total, 1240);
    }

    #[test]
    fn tiny_levels_still_occupy_a_word() {
        let (offsets, _) = LevelMap::layout(64, 7);
        // レベル4は4ビットしか要らないが、最低でも1ワードは占有する
        let word = mem::size_of::<usize>();
        assert!(offsets[4] + word <= offsets[5]);
    }

    #[test]
    fn level0_bits_work() {
        let mut m = map(4096, 10);
        assert!(!m.map.level0_bit(0));
        assert!(m.map.is_all_free(0, 4096));

        m.map.mark_used(64, 32);
        assert!(m.map.level0_bit(64));
        assert!(m.map.level0_bit(95));
        assert!(!m.map.level0_bit(96));
        assert_eq!(m.map.used_blocks_in(0, 4096), 32);
        assert!(!m.map.is_all_free(64, 32));
        assert!(m.map.is_all_free(96, 32));

        m.map.mark_free(64, 32);
        assert!(m.map.is_all_free(0, 4096));
    }

    #[test]
    fn solid_bits_work() {
        let mut m = map(4096, 10);
        assert!(!m.map.solid_bit(3, 5));

        m.map.set_solid(3, 5);
        assert!(m.map.solid_bit(3, 5));
        assert!(!m.map.solid_bit(3, 4));

        m.map.clear_solid(3, 5);
        assert!(!m.map.solid_bit(3, 5));

        m.map.set_solid_range(1, 16, 16);
        for i in 16..32 {
            assert!(m.map.solid_bit(1, i));
        }
        assert!(!m.map.solid_bit(1, 32));
    }

    #[test]
    fn byte_states_work() {
        let mut m = map(4096, 10);
        assert_eq!(m.map.byte(9, 0), FREE_SOLID);

        m.map.set_byte(9, 0, FULL_SOLID);
        assert_eq!(m.map.byte(9, 0), FULL_SOLID);
        assert_eq!(m.map.byte(9, 1), FREE_SOLID);

        m.map.set_byte(9, 0, partial(7));
        assert!(is_partial(m.map.byte(9, 0)));
        assert_eq!(partial_log2(m.map.byte(9, 0)), 7);
    }

    #[test]
    fn state_lfs_works() {
        assert_eq!(state_lfs(FREE_SOLID, 9), 512);
        assert_eq!(state_lfs(FULL_SOLID, 9), 0);
        assert_eq!(state_lfs(FULL_FRAGMENTED, 9), 0);
        assert_eq!(state_lfs(partial(3), 9), 8);
    }

    #[test]
    fn bit_lfs_works() {
        let mut m = map(4096, 10);

        // 32ブロックの部分木を初期化: 全て空きでsolid
        for level in 1..BIT_LEVELS {
            m.map.set_solid_range(level, 0, 1 << (BIT_LEVELS - level));
        }
        assert_eq!(m.map.bit_lfs(4, 0), 16);

        // 先頭の1ブロックを使用中にすると、ノード(1, 0)が混在になる
        m.map.mark_used(0, 1);
        m.map.clear_solid(4, 0);
        m.map.clear_solid(3, 0);
        m.map.clear_solid(2, 0);
        m.map.clear_solid(1, 0);
        assert_eq!(m.map.bit_lfs(4, 0), 8);
        assert_eq!(m.map.bit_lfs(3, 0), 4);
        assert_eq!(m.map.bit_lfs(2, 0), 2);
        assert_eq!(m.map.bit_lfs(1, 0), 1);
        assert_eq!(m.map.bit_lfs(0, 0), 0);
        assert_eq!(m.map.bit_lfs(0, 1), 1);

        // solidな使用中部分木の空きスパンは0
        m.map.mark_used(16, 16);
        assert_eq!(m.map.bit_lfs(4, 1), 0);
        assert_eq!(m.map.bit_lfs(4, 0), 8);
    }
}
