//! Cyclic extraction for paginated or polling pages.
//!
//! Each iteration publishes `loop_count`, evaluates the data script into the
//! export buffer and asks the continuation script whether to go on. Every
//! `export_cycle` iterations the full buffer goes to [`Handler::on_loop`];
//! when the continuation stops, whatever is left in the buffer is delivered
//! once more as a partial batch.
//!
//! There is no iteration cap: a continuation that never yields anything but
//! `"true"` keeps the loop running until the handler returns
//! [`LoopControl::Stop`].

use crate::page::Page;
use crate::rule::Loop;
use crate::script::{ScriptBridge, block};
use crate::traits::{Handler, LoopControl, Tab};

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEnd {
    /// The loop's prepare gate did not return `"true"`.
    PrepareClosed,
    /// The continuation script returned something other than `"true"`.
    Exhausted,
    /// The handler returned [`LoopControl::Stop`] for a full batch.
    Stopped,
}

/// Summary of a finished loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
    pub iterations: usize,
    pub batches: usize,
    pub end: LoopEnd,
}

/// Run a rule's loop section against a page.
pub async fn run_loop<T: Tab>(
    bridge: &ScriptBridge<'_, T>,
    page: &Page,
    lp: &Loop,
    handler: &dyn Handler,
) -> LoopSummary {
    let mut summary = LoopSummary {
        iterations: 0,
        batches: 0,
        end: LoopEnd::PrepareClosed,
    };

    if let Some(prepare) = &lp.prepare {
        if !bridge.prepare(prepare).await {
            tracing::info!(page_id = %page.id(), "Loop prepare gate closed");
            return summary;
        }
    }

    let eval = block(&lp.eval);
    let next = block(&lp.next);
    let cycle = lp.export_cycle.max(1);
    let mut buffer = vec![String::new(); cycle];

    loop {
        summary.iterations += 1;
        let i = summary.iterations;
        bridge.publish_counter(i).await;

        buffer[(i - 1) % cycle] = if lp.eval.is_empty() {
            String::new()
        } else {
            bridge.eval_raw(&eval).await
        };

        if i % cycle == 0 {
            summary.batches += 1;
            tracing::debug!(page_id = %page.id(), iteration = i, "Exporting loop batch");
            if handler.on_loop(page, i, &buffer) == LoopControl::Stop {
                tracing::info!(page_id = %page.id(), iteration = i, "Loop stopped by handler");
                summary.end = LoopEnd::Stopped;
                return summary;
            }
            buffer.iter_mut().for_each(String::clear);
        }

        let proceed = !lp.next.is_empty() && bridge.eval_raw(&next).await == "true";
        if !proceed {
            let pending = i % cycle;
            if pending != 0 {
                summary.batches += 1;
                tracing::debug!(page_id = %page.id(), iteration = i, size = pending, "Exporting partial loop batch");
                handler.on_loop(page, i, &buffer[..pending]);
            }
            summary.end = LoopEnd::Exhausted;
            return summary;
        }

        if !lp.wait.is_zero() {
            tokio::time::sleep(lp.wait).await;
        }
    }
}
