//! Wave planning: decide what the next wave dispatches, or that the run is
//! done.
//!
//! Queued `ForwardRunRequested` events are drained into a synthetic level
//! that preempts the remaining natural queue. A `WaveRetry` without forward
//! targets asks for skipped guards (`if`/`assume`) to be re-evaluated once,
//! so conditions observing upstream memory writes are not starved.

use cascade_types::{EngineEvent, SkipReason, WaveKind};
use tracing::debug;

use crate::context::RunState;
use crate::dispatcher::DispatchItem;

#[derive(Debug, PartialEq)]
pub(crate) enum WavePlan {
    Dispatch {
        items: Vec<DispatchItem>,
        kind: WaveKind,
    },
    Complete,
}

pub(crate) fn plan_wave(state: &mut RunState) -> WavePlan {
    // A check waiting on human input suspends the run after its level; the
    // event source restarts the engine with the reply injected.
    if state.flags.awaiting_human_input {
        debug!("awaiting human input, suspending run");
        return WavePlan::Complete;
    }

    let mut forwards: Vec<DispatchItem> = Vec::new();
    let mut retry_requested = false;
    while let Some(event) = state.event_queue.pop_front() {
        match event {
            EngineEvent::ForwardRunRequested {
                target,
                scope,
                origin,
                goto_event,
                delay_ms: _,
            } => forwards.push(DispatchItem {
                check_id: target,
                scope,
                origin: Some(origin),
                event_override: goto_event,
            }),
            EngineEvent::WaveRetry { reason } => {
                debug!(%reason, "wave retry requested");
                retry_requested = true;
            }
            other => debug!(event = other.name(), "ignoring event in planning queue"),
        }
    }

    if retry_requested {
        state.flags.guard_retry_pending = true;
    }

    if !forwards.is_empty() {
        return WavePlan::Dispatch {
            items: forwards,
            kind: WaveKind::Forward,
        };
    }

    if state.flags.guard_retry_pending {
        state.flags.guard_retry_pending = false;
        let guard_skipped: Vec<DispatchItem> = state
            .stats
            .iter()
            .filter(|(_, stats)| {
                stats.skipped
                    && matches!(
                        stats.skip_reason,
                        Some(SkipReason::IfCondition) | Some(SkipReason::Assume)
                    )
            })
            .map(|(check_id, _)| DispatchItem::natural(check_id))
            .collect();
        if !guard_skipped.is_empty() {
            return WavePlan::Dispatch {
                items: guard_skipped,
                kind: WaveKind::Retry,
            };
        }
    }

    match state.level_queue.pop_front() {
        Some(level) => WavePlan::Dispatch {
            items: level.into_iter().map(DispatchItem::natural).collect(),
            kind: WaveKind::Initial,
        },
        None => WavePlan::Complete,
    }
}
