//! One-shot timers for retransmission, expiry and glare back-off
//!
//! Each timer is a spawned tokio task that sleeps and then posts a
//! [`TimerEvent`] to the owning socket's channel; the socket dispatches it on
//! its own event loop so session state is only touched there. Dropping a
//! [`TimerHandle`] aborts the task. A timer that already posted its event
//! before being dropped is filtered out by id when it is dispatched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::registry::AckKey;
use crate::session::WeakSession;

/// Identifier of a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What a timer refers to when it fires
#[derive(Debug, Clone)]
pub(crate) enum TimerTarget {
    /// Retransmission of a reliable 1xx or a 2xx
    Reply(WeakSession),
    /// Expiry of a session-initiated request
    Request(WeakSession),
    /// Glare back-off before re-sending a request
    Glare(WeakSession),
    /// Lifetime of a stored ACK
    Ack(AckKey),
}

#[derive(Debug)]
pub(crate) struct TimerEvent {
    pub id: TimerId,
    pub target: TimerTarget,
}

/// Armed timer; aborted on drop
#[derive(Debug)]
pub(crate) struct TimerHandle {
    id: TimerId,
    task: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) struct TimerService {
    tx: mpsc::UnboundedSender<TimerEvent>,
    next_id: AtomicU64,
}

impl TimerService {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, next_id: AtomicU64::new(1) }, rx)
    }

    /// Arm a timer that fires once after `delay`
    ///
    /// Outside a tokio runtime the returned handle is inert and never fires.
    pub fn schedule(&self, delay: Duration, target: TimerTarget) -> TimerHandle {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(?target, "no tokio runtime, timer will not fire");
                return TimerHandle { id, task: None };
            }
        };

        trace!(?id, ?delay, "timer armed");
        let tx = self.tx.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the socket is shutting down
            let _ = tx.send(TimerEvent { id, target });
        });

        TimerHandle { id, task: Some(task) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (timers, mut rx) = TimerService::new();
        let handle = timers.schedule(Duration::from_millis(500), TimerTarget::Ack(AckKey::new("c", 1)));

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.id, handle.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let (timers, mut rx) = TimerService::new();
        let handle = timers.schedule(Duration::from_millis(100), TimerTarget::Ack(AckKey::new("c", 1)));
        drop(handle);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_inert_without_runtime() {
        let (timers, _rx) = TimerService::new();
        let a = timers.schedule(Duration::from_millis(1), TimerTarget::Ack(AckKey::new("c", 1)));
        let b = timers.schedule(Duration::from_millis(1), TimerTarget::Ack(AckKey::new("c", 2)));
        assert_ne!(a.id(), b.id());
    }
}
