//! The per-device message queue controller.
//!
//! Inbound application messages are appended to an ordered local queue and
//! drained strictly one at a time through a dispatcher. Draining suspends
//! while a blocking handler is active and resumes when `handler_complete`
//! fires; handlers may synthesize follow-up entries that jump to the front of
//! the queue so they run before any later network-originated entry.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::session::ProtocolError;

const LOG_TARGET: &str = "whist_core::queue";

/// One parsed inbound application message awaiting dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub descriptor: String,
    pub payload: Value,
    pub origin: Option<String>,
}

impl QueueEntry {
    pub fn new(descriptor: impl Into<String>, payload: Value, origin: Option<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            payload,
            origin,
        }
    }

    /// A locally synthesized entry with no originating peer.
    pub fn synthesized(descriptor: impl Into<String>) -> Self {
        Self::new(descriptor, Value::Null, None)
    }
}

/// Effects a dispatched handler hands back to the controller.
///
/// Follow-ups are inserted at the front of the queue in the order they were
/// synthesized; a busy handler suspends draining until `handler_complete`, at
/// which point registered teardown steps run innermost-first.
pub struct DispatchContext {
    follow_ups: Vec<QueueEntry>,
    busy: bool,
    teardown: Vec<Box<dyn FnOnce() + Send>>,
}

impl DispatchContext {
    pub(crate) fn new() -> Self {
        Self {
            follow_ups: Vec::new(),
            busy: false,
            teardown: Vec::new(),
        }
    }

    /// Queues a synthesized entry for immediate follow-up processing, ahead
    /// of any further network-originated entry.
    pub fn synthesize(&mut self, entry: QueueEntry) {
        self.follow_ups.push(entry);
    }

    /// Marks the handler as blocking; draining stops after this entry.
    pub fn set_busy(&mut self) {
        self.busy = true;
    }

    /// Registers a teardown step to run when the blocking flow completes.
    /// Steps run in reverse registration order (innermost context first).
    pub fn push_teardown(&mut self, step: impl FnOnce() + Send + 'static) {
        self.teardown.push(Box::new(step));
    }
}

/// Destination of drained queue entries.
pub trait MessageDispatcher: Send + Sync {
    fn dispatch(&self, entry: QueueEntry, ctx: &mut DispatchContext) -> Result<(), ProtocolError>;
}

impl<D: MessageDispatcher + ?Sized> MessageDispatcher for std::sync::Arc<D> {
    fn dispatch(&self, entry: QueueEntry, ctx: &mut DispatchContext) -> Result<(), ProtocolError> {
        (**self).dispatch(entry, ctx)
    }
}

struct ControllerState {
    entries: VecDeque<QueueEntry>,
    draining: bool,
    handler_busy: bool,
    teardown: Vec<Box<dyn FnOnce() + Send>>,
}

/// The application-level sequencer for one device.
pub struct MessageQueueController<D: MessageDispatcher> {
    dispatcher: D,
    state: Mutex<ControllerState>,
    drain_tx: watch::Sender<u64>,
}

impl<D: MessageDispatcher> MessageQueueController<D> {
    pub fn new(dispatcher: D) -> Self {
        let (drain_tx, _) = watch::channel(0);
        Self {
            dispatcher,
            state: Mutex::new(ControllerState {
                entries: VecDeque::new(),
                draining: false,
                handler_busy: false,
                teardown: Vec::new(),
            }),
            drain_tx,
        }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Appends an entry at the tail. Never drains; call `process_queue`.
    pub fn enqueue(&self, entry: QueueEntry) {
        let mut state = self.state.lock().expect("queue controller poisoned");
        state.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("queue controller poisoned");
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handler_busy(&self) -> bool {
        let state = self.state.lock().expect("queue controller poisoned");
        state.handler_busy
    }

    /// Monotonic counter bumped each time the queue drains to empty; await
    /// changes with `watch::Receiver::changed`.
    pub fn subscribe_drained(&self) -> watch::Receiver<u64> {
        self.drain_tx.subscribe()
    }

    /// Drains entries one at a time until the queue is empty or a handler
    /// goes busy. Idempotent: a re-entrant or concurrent call while a drain
    /// is running (or while a handler is busy) is a no-op.
    pub fn process_queue(&self) {
        loop {
            let entry = {
                let mut state = self.state.lock().expect("queue controller poisoned");
                if state.draining || state.handler_busy {
                    return;
                }
                match state.entries.pop_front() {
                    Some(entry) => {
                        state.draining = true;
                        entry
                    }
                    None => {
                        self.drain_tx.send_modify(|count| *count += 1);
                        return;
                    }
                }
            };

            let mut ctx = DispatchContext::new();
            let result = self.dispatcher.dispatch(entry.clone(), &mut ctx);
            if let Err(err) = result {
                // Protocol errors drop the entry; the queue keeps moving.
                debug!(
                    target: LOG_TARGET,
                    descriptor = %entry.descriptor,
                    error = %err,
                    "dropping undispatchable entry"
                );
            }

            let mut state = self.state.lock().expect("queue controller poisoned");
            for follow_up in ctx.follow_ups.into_iter().rev() {
                state.entries.push_front(follow_up);
            }
            state.teardown.append(&mut ctx.teardown);
            state.draining = false;
            if ctx.busy {
                state.handler_busy = true;
                return;
            }
        }
    }

    /// External completion signal for a blocking handler: runs the ordered
    /// teardown list innermost-first, clears the busy flag, and resumes
    /// draining.
    pub fn handler_complete(&self) {
        let steps = {
            let mut state = self.state.lock().expect("queue controller poisoned");
            state.handler_busy = false;
            std::mem::take(&mut state.teardown)
        };
        for step in steps.into_iter().rev() {
            step();
        }
        self.process_queue();
    }
}

impl<D: MessageDispatcher> fmt::Debug for MessageQueueController<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.lock() {
            Ok(state) => f
                .debug_struct("MessageQueueController")
                .field("pending_entries", &state.entries.len())
                .field("handler_busy", &state.handler_busy)
                .finish(),
            Err(_) => f
                .debug_struct("MessageQueueController")
                .field("poisoned", &true)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Records every dispatched descriptor; scriptable per-descriptor
    /// effects drive the synthesis/busy paths.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        busy_on: Option<String>,
        synthesize_on: Option<(String, Vec<String>)>,
    }

    impl MessageDispatcher for Recorder {
        fn dispatch(
            &self,
            entry: QueueEntry,
            ctx: &mut DispatchContext,
        ) -> Result<(), ProtocolError> {
            self.seen.lock().unwrap().push(entry.descriptor.clone());
            if self.busy_on.as_deref() == Some(entry.descriptor.as_str()) {
                ctx.set_busy();
            }
            if let Some((trigger, follow_ups)) = &self.synthesize_on {
                if trigger == &entry.descriptor {
                    for descriptor in follow_ups {
                        ctx.synthesize(QueueEntry::synthesized(descriptor.clone()));
                    }
                }
            }
            Ok(())
        }
    }

    fn entry(descriptor: &str) -> QueueEntry {
        QueueEntry::new(descriptor, json!({}), Some("peer".into()))
    }

    #[test]
    fn entries_drain_in_fifo_order() {
        let recorder = Arc::new(Recorder::default());
        let controller = MessageQueueController::new(Arc::clone(&recorder));
        controller.enqueue(entry("settings"));
        controller.enqueue(entry("dealer"));
        controller.enqueue(entry("deal"));
        controller.process_queue();
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["settings", "dealer", "deal"]
        );
    }

    #[test]
    fn enqueue_alone_never_drains() {
        let recorder = Arc::new(Recorder::default());
        let controller = MessageQueueController::new(Arc::clone(&recorder));
        controller.enqueue(entry("settings"));
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert_eq!(controller.len(), 1);
    }

    #[test]
    fn synthesized_entries_jump_the_queue() {
        let recorder = Arc::new(Recorder {
            synthesize_on: Some(("play".into(), vec!["playHand".into()])),
            ..Recorder::default()
        });
        let controller = MessageQueueController::new(Arc::clone(&recorder));
        controller.enqueue(entry("play"));
        controller.enqueue(entry("deal"));
        controller.process_queue();
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["play", "playHand", "deal"]
        );
    }

    #[test]
    fn multiple_follow_ups_keep_their_order() {
        let recorder = Arc::new(Recorder {
            synthesize_on: Some(("scores".into(), vec!["roundSummary".into(), "gameSummary".into()])),
            ..Recorder::default()
        });
        let controller = MessageQueueController::new(Arc::clone(&recorder));
        controller.enqueue(entry("scores"));
        controller.enqueue(entry("dealer"));
        controller.process_queue();
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["scores", "roundSummary", "gameSummary", "dealer"]
        );
    }

    #[test]
    fn busy_handler_suspends_until_completion() {
        let recorder = Arc::new(Recorder {
            busy_on: Some("playHand".into()),
            ..Recorder::default()
        });
        let controller = MessageQueueController::new(Arc::clone(&recorder));
        controller.enqueue(entry("playHand"));
        controller.enqueue(entry("played"));
        controller.process_queue();
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["playHand"]);
        assert!(controller.handler_busy());

        // Repeated calls while busy are no-ops.
        controller.process_queue();
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);

        controller.handler_complete();
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["playHand", "played"]);
        assert!(!controller.handler_busy());
    }

    #[test]
    fn teardown_steps_run_innermost_first() {
        struct TeardownDispatcher {
            order: Arc<Mutex<Vec<&'static str>>>,
        }
        impl MessageDispatcher for TeardownDispatcher {
            fn dispatch(
                &self,
                _entry: QueueEntry,
                ctx: &mut DispatchContext,
            ) -> Result<(), ProtocolError> {
                let order = Arc::clone(&self.order);
                ctx.push_teardown(move || order.lock().unwrap().push("outer"));
                let order = Arc::clone(&self.order);
                ctx.push_teardown(move || order.lock().unwrap().push("inner"));
                ctx.set_busy();
                Ok(())
            }
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let controller = MessageQueueController::new(TeardownDispatcher {
            order: Arc::clone(&order),
        });
        controller.enqueue(QueueEntry::synthesized("roundSummary"));
        controller.process_queue();
        controller.handler_complete();
        assert_eq!(*order.lock().unwrap(), vec!["inner", "outer"]);
    }

    #[test]
    fn no_entry_is_dispatched_twice() {
        struct Counting {
            counts: Mutex<std::collections::HashMap<String, usize>>,
        }
        impl MessageDispatcher for Counting {
            fn dispatch(
                &self,
                entry: QueueEntry,
                _ctx: &mut DispatchContext,
            ) -> Result<(), ProtocolError> {
                *self
                    .counts
                    .lock()
                    .unwrap()
                    .entry(entry.descriptor)
                    .or_insert(0) += 1;
                Ok(())
            }
        }

        let controller = MessageQueueController::new(Counting {
            counts: Mutex::new(Default::default()),
        });
        for i in 0..20 {
            controller.enqueue(QueueEntry::synthesized(format!("m{i}")));
            controller.process_queue();
        }
        controller.process_queue();
        let counts = controller.dispatcher().counts.lock().unwrap();
        assert!(counts.values().all(|&count| count == 1));
        assert_eq!(counts.len(), 20);
    }

    #[test]
    fn drained_signal_fires_when_queue_empties() {
        let recorder = Arc::new(Recorder::default());
        let controller = MessageQueueController::new(Arc::clone(&recorder));
        let rx = controller.subscribe_drained();
        let before = *rx.borrow();
        controller.enqueue(entry("settings"));
        controller.process_queue();
        assert!(*rx.borrow() > before);
    }

    #[test]
    fn undecodable_entry_is_dropped_and_drain_continues() {
        struct Strict {
            ok: AtomicUsize,
        }
        impl MessageDispatcher for Strict {
            fn dispatch(
                &self,
                entry: QueueEntry,
                _ctx: &mut DispatchContext,
            ) -> Result<(), ProtocolError> {
                if entry.descriptor == "bogus" {
                    return Err(ProtocolError::UnknownDescriptor(entry.descriptor));
                }
                self.ok.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let controller = MessageQueueController::new(Strict {
            ok: AtomicUsize::new(0),
        });
        controller.enqueue(QueueEntry::synthesized("bogus"));
        controller.enqueue(QueueEntry::synthesized("dealer"));
        controller.process_queue();
        assert_eq!(controller.dispatcher().ok.load(Ordering::SeqCst), 1);
        assert!(controller.is_empty());
    }
}
