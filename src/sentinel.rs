//! Consumed quorum-aggregation interface.
//!
//! Group-authority messages are only actionable once `GROUP_SIZE` matching
//! signed copies from distinct close-group members have accumulated. That
//! aggregation (signature collection, key confirmation, quorum counting)
//! lives outside the routing core behind [`Sentinel`]. The forwarding
//! engine feeds it every group-sourced message at the dispatch gate and
//! acts only on bodies the sentinel releases. Direct messages bypass the
//! gate entirely.

use crate::messages::{MessageHeader, MessageTypeTag};

pub trait Sentinel: Send + 'static {
    /// Accumulate one copy of a group-authority message. Returns the body
    /// to dispatch once quorum has been reached, `None` while still
    /// accumulating. A copy arriving after release is absorbed by the
    /// duplicate filter upstream.
    fn add(&mut self, header: &MessageHeader, tag: MessageTypeTag, body: &[u8])
        -> Option<Vec<u8>>;
}

/// Pass-through sentinel: releases every body immediately, unaggregated.
/// Stands in until a quorum-verifying implementation is plugged in.
#[derive(Default)]
pub struct NullSentinel;

impl Sentinel for NullSentinel {
    fn add(
        &mut self,
        _header: &MessageHeader,
        _tag: MessageTypeTag,
        body: &[u8],
    ) -> Option<Vec<u8>> {
        Some(body.to_vec())
    }
}
