//! Proptest strategies for generating operation sequences
//!
//! This module provides strategies for property-based testing of clone
//! trees: sequences of writes, snapshot clones, resizes, zeroing and
//! handle drops applied to a small population of objects.

use proptest::prelude::*;

/// Largest object, in pages
pub const MAX_PAGES: u64 = 4;

// ════════════════════════════════════════════════════════════
// Basic Strategies
// ════════════════════════════════════════════════════════════

/// Index into the live object population (reduced modulo its length)
pub fn object_index() -> impl Strategy<Value = usize> {
    0usize..16
}

/// Page index within an object (reduced modulo its size)
pub fn page_index() -> impl Strategy<Value = u64> {
    0u64..MAX_PAGES
}

/// Object size in pages
pub fn page_count() -> impl Strategy<Value = u64> {
    0u64..=MAX_PAGES
}

/// Non-zero fill byte, so written pages are never mistaken for zero pages
pub fn fill_byte() -> impl Strategy<Value = u8> {
    1u8..=255
}

// ════════════════════════════════════════════════════════════
// Composite Strategies
// ════════════════════════════════════════════════════════════

/// One mutation of the population
#[derive(Debug, Clone)]
pub enum TreeOp {
    Write { obj: usize, page: u64, byte: u8 },
    Clone { obj: usize, offset: u64, size: u64 },
    Resize { obj: usize, size: u64 },
    Zero { obj: usize, page: u64, count: u64 },
    Drop { obj: usize },
}

pub fn tree_op() -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        4 => (object_index(), page_index(), fill_byte())
            .prop_map(|(obj, page, byte)| TreeOp::Write { obj, page, byte }),
        3 => (object_index(), page_count(), page_count())
            .prop_map(|(obj, offset, size)| TreeOp::Clone { obj, offset, size }),
        1 => (object_index(), page_count())
            .prop_map(|(obj, size)| TreeOp::Resize { obj, size }),
        1 => (object_index(), page_index(), 1u64..=2)
            .prop_map(|(obj, page, count)| TreeOp::Zero { obj, page, count }),
        2 => object_index().prop_map(|obj| TreeOp::Drop { obj }),
    ]
}

/// A sequence of operations
pub fn tree_ops(max_len: usize) -> impl Strategy<Value = Vec<TreeOp>> {
    prop::collection::vec(tree_op(), 1..max_len)
}

/// Parent picks for growing a snapshot tree one clone at a time
pub fn clone_parents(max_len: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(object_index(), 1..max_len)
}

/// Leaves to write through, in order; repeats are allowed
pub fn writer_order(max_len: usize) -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(object_index(), 0..max_len)
}

// ════════════════════════════════════════════════════════════
// Pin Strategies
// ════════════════════════════════════════════════════════════

/// Pin or unpin a run of pages
#[derive(Debug, Clone)]
pub enum PinOp {
    Pin { page: u64, count: u64 },
    Unpin { page: u64, count: u64 },
}

pub fn pin_op() -> impl Strategy<Value = PinOp> {
    prop_oneof![
        3 => (page_index(), 1u64..=2).prop_map(|(page, count)| PinOp::Pin { page, count }),
        2 => (page_index(), 1u64..=2).prop_map(|(page, count)| PinOp::Unpin { page, count }),
    ]
}

pub fn pin_ops(max_len: usize) -> impl Strategy<Value = Vec<PinOp>> {
    prop::collection::vec(pin_op(), 1..max_len)
}
