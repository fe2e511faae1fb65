//! Out-of-band change notification.
//!
//! After a commit that touched the backing store, the originating process
//! signals a named broadcast channel with its agent id; peers wake up and
//! poll the operation log. Delivery is at-most-once and best-effort: the
//! watcher's fallback poll covers lost signals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use rand::Rng;

use crate::oplog::operation::AgentId;
use crate::oplog::OpLogError;

/// A transport that can open notify connections and subscriptions on named
/// channels.
pub trait NotifyTransport: Send + Sync {
    fn connect(&self) -> Result<Box<dyn NotifyConnection>, OpLogError>;
    fn subscribe(&self, channel: &str) -> Result<NotifySubscription, OpLogError>;
}

/// One open connection; `notify` delivers a short payload to every current
/// subscriber of the channel.
pub trait NotifyConnection: Send {
    fn notify(&mut self, channel: &str, payload: &str) -> Result<(), OpLogError>;
}

/// Receiving side of a channel subscription.
pub struct NotifySubscription {
    receiver: Receiver<String>,
}

impl NotifySubscription {
    pub fn new(receiver: Receiver<String>) -> Self {
        Self { receiver }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<String, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    pub(crate) fn receiver(&self) -> &Receiver<String> {
        &self.receiver
    }
}

/// Retry/backoff policy for the notifier.
#[derive(Debug, Clone, Copy)]
pub struct NotifyPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_attempts: u32,
}

impl Default for NotifyPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
            max_attempts: 8,
        }
    }
}

/// Signals the shared channel after local commits. One connection is reused,
/// serialized by a lock, and torn down and rebuilt on error.
pub struct ChangeNotifier {
    transport: Arc<dyn NotifyTransport>,
    channel: String,
    agent: AgentId,
    policy: NotifyPolicy,
    connection: Mutex<Option<Box<dyn NotifyConnection>>>,
}

impl ChangeNotifier {
    pub fn new(
        transport: Arc<dyn NotifyTransport>,
        channel: impl Into<String>,
        agent: AgentId,
        policy: NotifyPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            channel: channel.into(),
            agent,
            policy,
            connection: Mutex::new(None),
        })
    }

    /// Fire the signal from a background thread; callers never wait on it.
    pub fn notify_detached(self: &Arc<Self>) {
        let notifier = Arc::clone(self);
        std::thread::Builder::new()
            .name("ripple-notify".into())
            .spawn(move || notifier.notify())
            .map(|_| ())
            .unwrap_or_else(|e| tracing::error!("failed to spawn notify thread: {e}"));
    }

    /// Send the agent id on the channel, retrying with clamped backoff.
    /// Gives up after the policy's attempt budget: a lost signal is covered
    /// by the peers' fallback poll.
    pub fn notify(&self) {
        for attempt in 0..self.policy.max_attempts {
            match self.try_notify() {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(
                        channel = %self.channel,
                        attempt,
                        "notification failed, retrying: {e}"
                    );
                    std::thread::sleep(self.backoff(attempt));
                }
            }
        }
        tracing::warn!(
            channel = %self.channel,
            "giving up on change notification; peers will fall back to polling"
        );
    }

    fn try_notify(&self) -> Result<(), OpLogError> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| OpLogError::LockPoisoned)?;
        if guard.is_none() {
            *guard = Some(self.transport.connect()?);
        }
        let conn = guard.as_mut().ok_or_else(|| OpLogError::Notify {
            reason: "notify connection unavailable".to_string(),
        })?;
        match conn.notify(&self.channel, self.agent.as_str()) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Rebuild from scratch on the next attempt.
                *guard = None;
                Err(e)
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.policy.backoff_base.as_millis() as u64;
        let max = self.policy.backoff_max.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(16)).min(max);
        let jitter = rand::rng().random_range(0..=base.max(1));
        Duration::from_millis(exp.saturating_add(jitter).min(max))
    }
}

/// In-process broadcast hub: the transport used by tests and single-host
/// deployments. Bounded per-subscriber queues; a full queue drops the signal
/// rather than blocking the notifier.
#[derive(Clone)]
pub struct InProcessHub {
    inner: Arc<HubState>,
}

struct HubState {
    channels: Mutex<HashMap<String, Vec<Sender<String>>>>,
    queue_bound: usize,
    /// Test hook: connection attempts fail while this is nonzero.
    fail_connects: Mutex<u32>,
}

impl InProcessHub {
    pub fn new(queue_bound: usize) -> Self {
        Self {
            inner: Arc::new(HubState {
                channels: Mutex::new(HashMap::new()),
                queue_bound: queue_bound.max(1),
                fail_connects: Mutex::new(0),
            }),
        }
    }

    pub fn fail_next_connects(&self, count: u32) {
        if let Ok(mut failures) = self.inner.fail_connects.lock() {
            *failures = count;
        }
    }
}

impl HubState {
    fn broadcast(&self, channel: &str, payload: &str) -> Result<(), OpLogError> {
        let mut channels = self.channels.lock().map_err(|_| OpLogError::LockPoisoned)?;
        let Some(subscribers) = channels.get_mut(channel) else {
            return Ok(());
        };
        subscribers.retain(|sender| match sender.try_send(payload.to_string()) {
            Ok(()) => true,
            // Lagging subscriber: drop the signal, keep the subscriber.
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        Ok(())
    }
}

struct HubConnection {
    hub: Arc<HubState>,
}

impl NotifyConnection for HubConnection {
    fn notify(&mut self, channel: &str, payload: &str) -> Result<(), OpLogError> {
        self.hub.broadcast(channel, payload)
    }
}

impl NotifyTransport for InProcessHub {
    fn connect(&self) -> Result<Box<dyn NotifyConnection>, OpLogError> {
        if let Ok(mut failures) = self.inner.fail_connects.lock() {
            if *failures > 0 {
                *failures -= 1;
                return Err(OpLogError::Notify {
                    reason: "injected connect failure".to_string(),
                });
            }
        }
        Ok(Box::new(HubConnection {
            hub: Arc::clone(&self.inner),
        }))
    }

    fn subscribe(&self, channel: &str) -> Result<NotifySubscription, OpLogError> {
        let (sender, receiver) = bounded(self.inner.queue_bound);
        let mut channels = self
            .inner
            .channels
            .lock()
            .map_err(|_| OpLogError::LockPoisoned)?;
        channels.entry(channel.to_string()).or_default().push(sender);
        Ok(NotifySubscription::new(receiver))
    }
}
