//! Core domain types for the mender repair and reverification queues.
//!
//! This crate defines the data model shared by the queue stores and their callers:
//! - Segment locators (`StreamId`, `SegmentPosition`) and placement tags
//! - The injured segment record queued for repair
//! - Storage node identifiers and piece locators for reverification audits
//! - Configuration for store backends and queue timing

pub mod config;
pub mod error;
pub mod node;
pub mod piece;
pub mod segment;

pub use config::{AppConfig, MetadataConfig, QueueConfig};
pub use error::{Error, Result};
pub use node::NodeId;
pub use piece::{PieceLocator, ReverificationJob};
pub use segment::{InjuredSegment, PlacementConstraint, SegmentPosition, StreamId};
