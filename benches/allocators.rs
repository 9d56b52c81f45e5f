#![feature(test)]
extern crate leanalloc;
extern crate test;
#[macro_use]
extern crate trackable;

use leanalloc::allocator::{
    heap_allocator, ArenaAllocator, LeanTreeAllocator, LeanTreeParams, StackAllocator,
    StackParams,
};
use leanalloc::allocator::{Allocator, AllocatorHandle};
use leanalloc::size::{Alignment, Power2};
use test::Bencher;

#[bench]
fn heap_alloc_free_64(b: &mut Bencher) {
    let heap = heap_allocator();
    b.iter(|| {
        let r = heap.alloc(64, Alignment::system());
        track_try_unwrap!(heap.free(r.buffer));
    });
}

#[bench]
fn arena_alloc_64(b: &mut Bencher) {
    let mut arena =
        track_try_unwrap!(ArenaAllocator::new(64 * 1024 * 1024, heap_allocator()));
    b.iter(|| {
        let r = arena.alloc(64, Alignment::system());
        test::black_box(r.buffer);
    });
}

#[bench]
fn stack_alloc_free_64(b: &mut Bencher) {
    let mut stack = StackAllocator::new(heap_allocator(), StackParams::default());
    b.iter(|| {
        let r = stack.alloc(64, Alignment::system());
        track_try_unwrap!(stack.free(r.buffer));
    });
}

#[bench]
fn lean_tree_alloc_free_64(b: &mut Bencher) {
    let params = LeanTreeParams {
        total_size: Power2::from_bytes(16 * 1024 * 1024),
        ..LeanTreeParams::default()
    };
    let mut tree = track_try_unwrap!(LeanTreeAllocator::new(heap_allocator(), params));
    b.iter(|| {
        let r = tree.alloc(64, Alignment::system());
        track_try_unwrap!(tree.free(r.buffer));
    });
}

#[bench]
fn lean_tree_alloc_free_4k(b: &mut Bencher) {
    let params = LeanTreeParams {
        total_size: Power2::from_bytes(16 * 1024 * 1024),
        ..LeanTreeParams::default()
    };
    let mut tree = track_try_unwrap!(LeanTreeAllocator::new(heap_allocator(), params));
    b.iter(|| {
        let r = tree.alloc(4096, Alignment::system());
        track_try_unwrap!(tree.free(r.buffer));
    });
}

#[bench]
fn lean_tree_via_handle(b: &mut Bencher) {
    let tree = track_try_unwrap!(LeanTreeAllocator::new(
        heap_allocator(),
        LeanTreeParams::default()
    ));
    let handle = AllocatorHandle::new(tree);
    b.iter(|| {
        let r = handle.alloc(64, Alignment::system());
        track_try_unwrap!(handle.free(r.buffer));
    });
}
