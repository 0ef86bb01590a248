//! Message handler thread
//!
//! Round-robins over the peers: process received messages (unless the peer
//! already has too many async tasks in flight), then queue outgoing traffic.
//! Sleeps until woken when no peer has more work.

use crate::net::interfaces::MessageProcessor;
use crate::node::connman::{Connman, DUMP_ADDRESSES_INTERVAL};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest idle wait between passes
const IDLE_WAIT: Duration = Duration::from_millis(100);

pub(crate) fn run(connman: Arc<Connman>) {
    log::debug!("message handler thread started");
    let processor = connman.processor();
    let mut last_flush = Instant::now();

    while !connman.is_interrupted() {
        let more_work = run_pass(&connman, processor.as_ref());
        if connman.is_interrupted() {
            break;
        }

        if last_flush.elapsed() >= DUMP_ADDRESSES_INTERVAL {
            connman.flush();
            last_flush = Instant::now();
        }

        if !more_work {
            connman.wait_for_work(IDLE_WAIT);
        }
    }
    log::debug!("message handler thread exit");
}

/// One round over every peer. Returns whether any peer has more received
/// messages waiting.
pub(crate) fn run_pass(connman: &Connman, processor: &dyn MessageProcessor) -> bool {
    connman.tasks().reap();

    let mut more_work = false;
    for peer in connman.peers().snapshot() {
        if peer.is_disconnecting() {
            continue;
        }
        if connman.tasks().has_too_many_tasks(peer.id) {
            log::trace!("{} has too many async tasks, skipping", peer.id);
        } else {
            more_work |= processor.process_messages(connman, &peer, connman.interrupt_handle());
        }
        if connman.is_interrupted() {
            break;
        }
        processor.send_messages(connman, &peer);
    }
    more_work
}
