//! Subscriber-side mirror of one publication.
//!
//! The replica runs a connection thread that subscribes, applies pushed
//! `State`/`Invalidate`/`Update` frames, and reconnects with backoff when the
//! channel drops. Readers block while the mirror is stale or disconnected;
//! a stale read fires a `Request` so it does not have to wait for the next
//! push. Updates older than the current value are discarded, so a delayed
//! frame can never roll the mirror backwards.

use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::core::Limits;
use crate::repl::frame::{FrameReader, FrameWriter};
use crate::repl::proto::{
    decode_envelope, encode_envelope, Hello, PublicationId, ReplEnvelope, ReplMessage, Request,
    Subscribe, PROTOCOL_VERSION,
};
use crate::repl::transport::Connector;
use crate::repl::ReplError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaState {
    Disconnected,
    Subscribing,
    Synced,
    Invalidated,
    Disposed,
}

#[derive(Clone, Debug)]
pub struct ReplicaPolicy {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub read_timeout: Duration,
}

impl Default for ReplicaPolicy {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
        }
    }
}

type SharedWriter = Arc<Mutex<FrameWriter<Box<dyn Write + Send>>>>;

struct Inner<T> {
    state: ReplicaState,
    value: Option<Arc<T>>,
    version: u64,
    writer: Option<SharedWriter>,
    requested: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    changed: Condvar,
}

pub struct Replica<T> {
    shared: Arc<Shared<T>>,
    publication_id: PublicationId,
    policy: ReplicaPolicy,
    handle: Option<JoinHandle<()>>,
}

impl<T: DeserializeOwned + Send + Sync + 'static> Replica<T> {
    /// Connect and subscribe in the background; returns immediately.
    pub fn subscribe(
        connector: Arc<dyn Connector>,
        publication_id: PublicationId,
        limits: Limits,
        policy: ReplicaPolicy,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: ReplicaState::Disconnected,
                value: None,
                version: 0,
                writer: None,
                requested: false,
            }),
            changed: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread_policy = policy.clone();
        let handle = std::thread::Builder::new()
            .name("ripple-replica".to_string())
            .spawn(move || {
                run_connection_loop(
                    thread_shared,
                    connector,
                    publication_id,
                    limits,
                    thread_policy,
                )
            })?;

        Ok(Self {
            shared,
            publication_id,
            policy,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> ReplicaState {
        match self.shared.inner.lock() {
            Ok(inner) => inner.state,
            Err(_) => ReplicaState::Disposed,
        }
    }

    pub fn version(&self) -> u64 {
        match self.shared.inner.lock() {
            Ok(inner) => inner.version,
            Err(_) => 0,
        }
    }

    /// Current value, blocking while the mirror is stale or disconnected.
    /// Uses the policy's read timeout.
    pub fn read(&self) -> Result<Arc<T>, ReplError> {
        self.read_timeout(self.policy.read_timeout)
    }

    pub fn read_timeout(&self, timeout: Duration) -> Result<Arc<T>, ReplError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock().map_err(|_| ReplError::LockPoisoned)?;
        loop {
            match inner.state {
                ReplicaState::Disposed => return Err(ReplError::Disposed),
                ReplicaState::Synced => {
                    if let Some(value) = &inner.value {
                        return Ok(Arc::clone(value));
                    }
                }
                ReplicaState::Invalidated => {
                    // Pull rather than waiting for the push that may be
                    // queued behind a slow recompute.
                    if !inner.requested {
                        inner.requested = true;
                        if let Some(writer) = inner.writer.clone() {
                            let request = ReplEnvelope {
                                version: PROTOCOL_VERSION,
                                message: ReplMessage::Request(Request {
                                    publication_id: self.publication_id,
                                }),
                            };
                            drop(inner);
                            send_envelope(&writer, &request)?;
                            inner = self
                                .shared
                                .inner
                                .lock()
                                .map_err(|_| ReplError::LockPoisoned)?;
                            continue;
                        }
                    }
                }
                ReplicaState::Disconnected | ReplicaState::Subscribing => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ReplError::Timeout);
            }
            let (guard, result) = self
                .shared
                .changed
                .wait_timeout(inner, deadline - now)
                .map_err(|_| ReplError::LockPoisoned)?;
            inner = guard;
            if result.timed_out() && inner.state != ReplicaState::Synced {
                return Err(ReplError::Timeout);
            }
        }
    }

    /// Tear down the subscription. Terminal: the connection thread exits and
    /// every subsequent read fails with `Disposed`.
    pub fn dispose(&mut self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.state = ReplicaState::Disposed;
            // Dropping the writer closes the channel, which unblocks the
            // connection thread's reader.
            inner.writer = None;
            inner.value = None;
        }
        self.shared.changed.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl<T> Drop for Replica<T> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.state = ReplicaState::Disposed;
            inner.writer = None;
        }
        self.shared.changed.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn send_envelope(writer: &SharedWriter, envelope: &ReplEnvelope) -> Result<(), ReplError> {
    let bytes = encode_envelope(envelope)?;
    let mut writer = writer.lock().map_err(|_| ReplError::LockPoisoned)?;
    writer.write_frame(&bytes)?;
    Ok(())
}

enum SessionEnd {
    Disconnected,
    Disposed,
}

fn run_connection_loop<T: DeserializeOwned + Send + Sync>(
    shared: Arc<Shared<T>>,
    connector: Arc<dyn Connector>,
    publication_id: PublicationId,
    limits: Limits,
    policy: ReplicaPolicy,
) {
    let client_id = Uuid::new_v4();
    let mut attempt = 0u32;
    loop {
        if is_disposed(&shared) {
            return;
        }
        match run_session(&shared, &connector, publication_id, &limits, client_id) {
            Ok(SessionEnd::Disposed) => return,
            Ok(SessionEnd::Disconnected) => {
                attempt += 1;
            }
            Err(e) => {
                attempt += 1;
                tracing::debug!(publication = %publication_id, "replica session failed: {e}");
            }
        }
        mark_disconnected(&shared);
        if is_disposed(&shared) {
            return;
        }
        std::thread::sleep(backoff_delay(&policy, attempt));
    }
}

fn run_session<T: DeserializeOwned + Send + Sync>(
    shared: &Arc<Shared<T>>,
    connector: &Arc<dyn Connector>,
    publication_id: PublicationId,
    limits: &Limits,
    client_id: Uuid,
) -> Result<SessionEnd, ReplError> {
    let conn = connector.connect().map_err(|e| ReplError::Handshake {
        reason: format!("connect: {e}"),
    })?;
    let mut reader = FrameReader::new(conn.reader, limits.max_frame_bytes);
    let writer: SharedWriter = Arc::new(Mutex::new(FrameWriter::new(
        conn.writer,
        limits.max_frame_bytes,
    )));

    send_envelope(
        &writer,
        &ReplEnvelope {
            version: PROTOCOL_VERSION,
            message: ReplMessage::Hello(Hello {
                protocol_version: PROTOCOL_VERSION,
                client_id,
            }),
        },
    )?;

    let welcome = match reader.read_next()? {
        Some(bytes) => decode_envelope(&bytes, limits)?,
        None => return Ok(SessionEnd::Disconnected),
    };
    match welcome.message {
        ReplMessage::Welcome(msg) if msg.protocol_version == PROTOCOL_VERSION => {}
        other => {
            return Err(ReplError::Handshake {
                reason: format!("expected Welcome, got {other:?}"),
            })
        }
    }

    {
        let mut inner = shared.inner.lock().map_err(|_| ReplError::LockPoisoned)?;
        if inner.state == ReplicaState::Disposed {
            return Ok(SessionEnd::Disposed);
        }
        inner.state = ReplicaState::Subscribing;
        inner.writer = Some(Arc::clone(&writer));
        inner.requested = false;
    }
    shared.changed.notify_all();

    send_envelope(
        &writer,
        &ReplEnvelope {
            version: PROTOCOL_VERSION,
            message: ReplMessage::Subscribe(Subscribe { publication_id }),
        },
    )?;
    // The shared slot now holds the only strong handle on the write half.
    // Disposal clears it, which closes the channel and unblocks the read
    // loop below with EOF.
    drop(writer);

    loop {
        let bytes = match reader.read_next() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(SessionEnd::Disconnected),
            Err(e) => {
                if is_disposed(shared) {
                    return Ok(SessionEnd::Disposed);
                }
                return Err(e.into());
            }
        };
        let envelope = decode_envelope(&bytes, limits)?;
        if apply_message(shared, publication_id, envelope.message)? == Applied::Disposed {
            return Ok(SessionEnd::Disposed);
        }
        if is_disposed(shared) {
            return Ok(SessionEnd::Disposed);
        }
    }
}

#[derive(PartialEq)]
enum Applied {
    Continue,
    Disposed,
}

fn apply_message<T: DeserializeOwned + Send + Sync>(
    shared: &Arc<Shared<T>>,
    publication_id: PublicationId,
    message: ReplMessage,
) -> Result<Applied, ReplError> {
    let mut inner = shared.inner.lock().map_err(|_| ReplError::LockPoisoned)?;
    if inner.state == ReplicaState::Disposed {
        return Ok(Applied::Disposed);
    }
    match message {
        ReplMessage::State(msg) if msg.publication_id == publication_id => {
            // Full resync: accepts an equal version so reconnects settle
            // even when nothing changed while we were away.
            if msg.version >= inner.version {
                apply_payload(&mut inner, msg.version, &msg.payload)?;
                shared.changed.notify_all();
            }
        }
        ReplMessage::Update(msg) if msg.publication_id == publication_id => {
            if msg.version > inner.version {
                apply_payload(&mut inner, msg.version, &msg.payload)?;
                shared.changed.notify_all();
            } else {
                tracing::debug!(
                    got = msg.version,
                    have = inner.version,
                    "discarding stale update"
                );
            }
        }
        ReplMessage::Invalidate(msg) if msg.publication_id == publication_id => {
            if msg.version > inner.version && inner.state != ReplicaState::Invalidated {
                inner.state = ReplicaState::Invalidated;
                inner.requested = false;
                shared.changed.notify_all();
            }
        }
        ReplMessage::Refused(msg) if msg.publication_id == publication_id => {
            tracing::warn!(publication = %publication_id, "subscription refused: {}", msg.reason);
            inner.state = ReplicaState::Disposed;
            inner.writer = None;
            inner.value = None;
            shared.changed.notify_all();
            return Ok(Applied::Disposed);
        }
        ReplMessage::Pong(_) => {}
        other => {
            tracing::debug!("ignoring message: {other:?}");
        }
    }
    Ok(Applied::Continue)
}

fn apply_payload<T: DeserializeOwned>(
    inner: &mut MutexGuard<'_, Inner<T>>,
    version: u64,
    payload: &[u8],
) -> Result<(), ReplError> {
    let value: T = serde_json::from_slice(payload).map_err(|e| ReplError::Payload {
        reason: e.to_string(),
    })?;
    inner.value = Some(Arc::new(value));
    inner.version = version;
    inner.state = ReplicaState::Synced;
    inner.requested = false;
    Ok(())
}

fn is_disposed<T>(shared: &Arc<Shared<T>>) -> bool {
    match shared.inner.lock() {
        Ok(inner) => inner.state == ReplicaState::Disposed,
        Err(_) => true,
    }
}

fn mark_disconnected<T>(shared: &Arc<Shared<T>>) {
    if let Ok(mut inner) = shared.inner.lock() {
        if inner.state != ReplicaState::Disposed {
            inner.state = ReplicaState::Disconnected;
            inner.writer = None;
            inner.requested = false;
        }
    }
    shared.changed.notify_all();
}

fn backoff_delay(policy: &ReplicaPolicy, attempt: u32) -> Duration {
    let base = policy.backoff_base.as_millis() as u64;
    let max = policy.backoff_max.as_millis() as u64;
    let exp = base.saturating_mul(1u64 << attempt.min(16)).min(max.max(1));
    let jitter = rand::rng().random_range(0..=exp / 4 + 1);
    Duration::from_millis(exp.saturating_add(jitter).min(max.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_clamped() {
        let policy = ReplicaPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(800),
            read_timeout: Duration::from_secs(1),
        };
        for attempt in 0..12 {
            assert!(backoff_delay(&policy, attempt) <= Duration::from_millis(800));
        }
        assert!(backoff_delay(&policy, 0) >= Duration::from_millis(100));
    }
}
