//! Test fixtures for generating queue entries.

use mender_core::{
    InjuredSegment, NodeId, PieceLocator, PlacementConstraint, SegmentPosition, StreamId,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating distinct node ids.
static NODE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Deterministic health scores in `[0, 1)` from a seed.
#[allow(dead_code)]
pub fn seeded_healths(seed: u64, count: usize) -> Vec<f64> {
    let mut state = seed;
    (0..count)
        .map(|_| {
            // Simple LCG, top 53 bits as the mantissa
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            (state >> 11) as f64 / (1u64 << 53) as f64
        })
        .collect()
}

/// A never-attempted segment on a fresh stream.
#[allow(dead_code)]
pub fn segment(health: f64, placement: u16) -> InjuredSegment {
    InjuredSegment::new(
        StreamId::new(),
        SegmentPosition::new(0, 0),
        health,
        PlacementConstraint(placement),
    )
}

/// A node id that no other call in this process returns.
#[allow(dead_code)]
pub fn unique_node_id() -> NodeId {
    let counter = NODE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&counter.to_be_bytes());
    bytes[31] = 0xAA;
    NodeId::from_array(bytes)
}

/// A piece locator on a fresh stream held by `node_id`.
#[allow(dead_code)]
pub fn piece_on(node_id: NodeId, piece_num: i32) -> PieceLocator {
    PieceLocator::new(StreamId::new(), SegmentPosition::new(1, 2), node_id, piece_num)
}
