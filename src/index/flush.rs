//! Flush policies decide which buffers to flush as documents and deletes arrive.

use std::fmt::Debug;

use crate::index::flush_control::FlushControlState;

const COMPONENT: &str = "FP";

/// Consulted by flush control, under its lock, after every change.
pub trait FlushPolicy: Send + Sync + Debug {
    /// A delete was buffered.
    fn on_delete(&self, state: &mut FlushControlState);

    /// A document was added to `buffer_id`.
    fn on_insert(&self, state: &mut FlushControlState, buffer_id: u64);

    /// A document replaced others in `buffer_id`.
    fn on_update(&self, state: &mut FlushControlState, buffer_id: u64) {
        self.on_insert(state, buffer_id);
        self.on_delete(state);
    }
}

/// Flushes by document count per buffer or by total RAM, whichever hits first.
///
/// - A buffer reaching `max_buffered_docs` is flushed.
/// - Once active plus delete bytes reach the RAM buffer, the largest buffer
///   not yet pending is flushed.
/// - Once delete bytes alone reach the RAM buffer, all deletes are applied.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushByRamOrCountsPolicy;

impl FlushByRamOrCountsPolicy {
    fn mark_largest_pending(&self, state: &mut FlushControlState) {
        if let Some(largest) = state.largest_non_pending_buffer() {
            if state.is_verbose(COMPONENT) {
                state.message(
                    COMPONENT,
                    &format!(
                        "flush: largest buffer {largest} ({} bytes) of {} active bytes, {} delete bytes, ram buffer {} bytes",
                        state.buffer_bytes(largest),
                        state.active_bytes(),
                        state.delete_bytes(),
                        state.ram_buffer_bytes().unwrap_or(0),
                    ),
                );
            }
            state.set_flush_pending(largest);
        }
    }
}

impl FlushPolicy for FlushByRamOrCountsPolicy {
    fn on_delete(&self, state: &mut FlushControlState) {
        let Some(limit) = state.ram_buffer_bytes() else {
            return;
        };
        if state.delete_bytes() >= limit {
            if state.is_verbose(COMPONENT) {
                state.message(
                    COMPONENT,
                    &format!(
                        "force apply deletes: {} delete bytes reach the ram buffer ({limit} bytes)",
                        state.delete_bytes()
                    ),
                );
            }
            state.set_apply_all_deletes();
        }
    }

    fn on_insert(&self, state: &mut FlushControlState, buffer_id: u64) {
        if let Some(max_docs) = state.max_buffered_docs() {
            if state.buffer_num_docs(buffer_id) >= max_docs {
                state.set_flush_pending(buffer_id);
                return;
            }
        }
        if let Some(limit) = state.ram_buffer_bytes() {
            if state.active_bytes() + state.delete_bytes() >= limit {
                self.mark_largest_pending(state);
            }
        }
    }
}
