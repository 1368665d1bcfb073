//! Body capture into the rubber allocator
//!
//! Streams a response body into one rubber allocation, bounded by a size
//! limit.  The caches use this to capture bodies for later hits; the
//! capture is always best-effort and must never fail the request that
//! feeds it.

use super::rubber::{Rubber, RubberAllocation};
use crate::body::Body;
use crate::error::Result;
use std::sync::Arc;
use tracing::debug;

/// What became of a capture attempt
pub enum SinkRubberOutcome {
    /// The whole body fits; the allocation has been shrunk to its exact size
    Done(RubberAllocation),

    /// The body was empty; nothing was allocated
    Empty,

    /// The body exceeded the limit
    TooLarge,

    /// The rubber allocator is full
    OutOfMemory,
}

/// Stream `body` into a rubber allocation of at most `max_size` bytes
pub async fn sink_to_rubber(
    rubber: Arc<Rubber>,
    mut body: Body,
    max_size: usize,
) -> Result<SinkRubberOutcome> {
    // preflight: a declared length over the limit fails immediately
    if let Some(len) = body.declared_len() {
        if len > max_size as u64 {
            return Ok(SinkRubberOutcome::TooLarge);
        }
    }

    let reserve = body
        .declared_len()
        .map(|len| len as usize)
        .unwrap_or(max_size);
    if reserve == 0 {
        return Ok(SinkRubberOutcome::Empty);
    }

    let Some(mut allocation) = RubberAllocation::new(rubber, reserve) else {
        debug!(reserve, "rubber sink: out of memory");
        return Ok(SinkRubberOutcome::OutOfMemory);
    };

    let mut position = 0usize;
    while let Some(chunk) = body.next_chunk().await {
        let chunk = chunk?;
        if position + chunk.len() > allocation.size() {
            debug!(
                position,
                chunk = chunk.len(),
                limit = allocation.size(),
                "rubber sink: body too large"
            );
            return Ok(SinkRubberOutcome::TooLarge);
        }
        allocation.with_write(|data| {
            data[position..position + chunk.len()].copy_from_slice(&chunk);
        });
        position += chunk.len();
    }

    if position == 0 {
        return Ok(SinkRubberOutcome::Empty);
    }

    allocation.shrink(position);
    Ok(SinkRubberOutcome::Done(allocation))
}
