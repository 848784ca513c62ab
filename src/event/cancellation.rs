//! Build-wide cancellation: one signal, fanned out to every worker.

use crossbeam::channel::{Receiver, Sender, unbounded};
use std::sync::{Arc, Mutex};

pub type CancellationMessage = ();

/// Hands a private channel to each subscriber and delivers the cancellation
/// signal to all of them. Clones share the subscriber list, so a signal
/// handler can hold one end while the orchestrator holds the other.
///
/// A build is canceled at most once, which keeps the unbounded channels
/// harmless: no subscriber ever holds more than one pending message.
#[derive(Debug, Clone, Default)]
pub struct CancellationBroadcast {
    subscribers: Arc<Mutex<Vec<Sender<CancellationMessage>>>>,
}

impl CancellationBroadcast {
    pub fn subscribe(&self) -> CancellationConsumer {
        let (sender, receiver) = unbounded();
        self.subscribers
            .lock()
            .expect("poisoned subscriber lock")
            .push(sender);
        CancellationConsumer(receiver)
    }

    /// Signals every live subscriber; consumers whose receiving end was
    /// dropped are pruned from the list instead of failing the call.
    pub fn cancel(&self) {
        self.subscribers
            .lock()
            .expect("poisoned subscriber lock")
            .retain(|subscriber| subscriber.send(()).is_ok());
    }
}

/// Read side of the cancellation signal, one per worker.
pub struct CancellationConsumer(Receiver<CancellationMessage>);

impl CancellationConsumer {
    /// Non-consuming check so a worker can poll it between pipeline steps.
    /// A cancellation message is never followed by more traffic, so a
    /// non-empty channel means cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        !self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_cancelled_until_signal() {
        let broadcast = CancellationBroadcast::default();
        let consumer = broadcast.subscribe();

        assert!(!consumer.is_cancelled());
        broadcast.cancel();
        assert!(consumer.is_cancelled());
        // The check does not consume the message.
        assert!(consumer.is_cancelled());
    }

    #[test]
    fn test_all_subscribers_observe_the_signal() {
        let broadcast = CancellationBroadcast::default();
        let first = broadcast.subscribe();
        let second = broadcast.subscribe();

        // A clone (e.g. held by a signal handler) reaches the same set.
        broadcast.clone().cancel();
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[test]
    fn test_dropped_subscriber_does_not_block_cancellation() {
        let broadcast = CancellationBroadcast::default();
        let kept = broadcast.subscribe();
        drop(broadcast.subscribe());

        broadcast.cancel();
        assert!(kept.is_cancelled());
    }

    #[test]
    fn test_late_subscriber_misses_earlier_signal() {
        let broadcast = CancellationBroadcast::default();
        broadcast.cancel();

        // Workers always subscribe before the build starts; a consumer
        // created afterwards starts clean.
        assert!(!broadcast.subscribe().is_cancelled());
    }
}
