//! Piece locators and reverification jobs.

use crate::node::NodeId;
use crate::segment::{SegmentPosition, StreamId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Everything needed to find one piece of one segment on one storage node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PieceLocator {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    pub node_id: NodeId,
    pub piece_num: i32,
}

impl PieceLocator {
    pub fn new(
        stream_id: StreamId,
        position: SegmentPosition,
        node_id: NodeId,
        piece_num: i32,
    ) -> Self {
        Self {
            stream_id,
            position,
            node_id,
            piece_num,
        }
    }
}

/// A job as handed out by the reverification queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReverificationJob {
    pub locator: PieceLocator,
    #[serde(with = "time::serde::rfc3339")]
    pub inserted_at: OffsetDateTime,
    /// Number of times this job has been claimed.
    pub reverify_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt: Option<OffsetDateTime>,
}
