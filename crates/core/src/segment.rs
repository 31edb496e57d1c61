//! Segment locators and the injured segment record.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// Identifier of the stream (object version) a segment belongs to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Generate a new random stream ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Decode from the 16 raw bytes stored in the database.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|_| crate::Error::InvalidStreamId(format!("expected 16 bytes, got {}", bytes.len())))
    }

    /// Raw bytes, as stored.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a segment inside its stream.
///
/// Encoded as a single 64-bit integer with the part number in the high
/// 32 bits and the index in the low 32 bits, so encoded positions sort in
/// (part, index) order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    pub fn new(part: u32, index: u32) -> Self {
        Self { part, index }
    }

    /// Encode as `part << 32 | index`.
    pub fn encode(&self) -> u64 {
        (u64::from(self.part) << 32) | u64::from(self.index)
    }

    /// Decode a value produced by [`SegmentPosition::encode`].
    pub fn from_encoded(encoded: u64) -> Self {
        Self {
            part: (encoded >> 32) as u32,
            index: encoded as u32,
        }
    }

    /// Encoded form as stored in a signed BIGINT column.
    pub fn to_db(&self) -> i64 {
        self.encode() as i64
    }

    /// Decode from a signed BIGINT column.
    pub fn from_db(value: i64) -> Self {
        Self::from_encoded(value as u64)
    }
}

impl fmt::Display for SegmentPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.part, self.index)
    }
}

/// Placement constraint tag limiting where a segment's pieces may live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlacementConstraint(pub u16);

impl PlacementConstraint {
    /// Value as stored in a 32-bit integer column.
    pub fn to_db(self) -> i32 {
        i32::from(self.0)
    }

    /// Decode from a 32-bit integer column, rejecting values outside `u16`.
    pub fn from_db(value: i32) -> crate::Result<Self> {
        u16::try_from(value)
            .map(Self)
            .map_err(|_| crate::Error::InvalidPlacement(i64::from(value)))
    }
}

impl From<u16> for PlacementConstraint {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for PlacementConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A segment believed to have too few healthy pieces, queued for repair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InjuredSegment {
    pub stream_id: StreamId,
    pub position: SegmentPosition,
    /// Lower is more urgent.
    pub segment_health: f64,
    pub placement: PlacementConstraint,
    /// `None` until a repair worker claims the segment.
    #[serde(with = "time::serde::rfc3339::option")]
    pub attempted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub inserted_at: OffsetDateTime,
    pub num_normalized_healthy: i16,
    pub num_normalized_retrievable: i16,
    pub num_out_of_placement: i16,
}

impl InjuredSegment {
    /// Create a never-attempted entry with zeroed piece counters.
    pub fn new(
        stream_id: StreamId,
        position: SegmentPosition,
        segment_health: f64,
        placement: PlacementConstraint,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            stream_id,
            position,
            segment_health,
            placement,
            attempted_at: None,
            updated_at: now,
            inserted_at: now,
            num_normalized_healthy: 0,
            num_normalized_retrievable: 0,
            num_out_of_placement: 0,
        }
    }

    /// Set the piece counters reported by the health checker.
    pub fn with_piece_counts(mut self, healthy: i16, retrievable: i16, out_of_placement: i16) -> Self {
        self.num_normalized_healthy = healthy;
        self.num_normalized_retrievable = retrievable;
        self.num_out_of_placement = out_of_placement;
        self
    }

    /// The `(stream_id, position)` identity of this entry.
    pub fn key(&self) -> (StreamId, SegmentPosition) {
        (self.stream_id, self.position)
    }
}
