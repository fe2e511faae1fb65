//! Publication registry and push worker.
//!
//! Each publication binds one computed value to a stable id. An
//! invalidation hook on the current cell enqueues the publication as dirty;
//! the worker pushes `Invalidate` to subscribers first, recomputes, then
//! pushes `Update`. Subscribers therefore learn they are stale before the
//! fresh value exists, never after.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Sender};
use serde::Serialize;
use uuid::Uuid;

use crate::core::{CancelToken, ComputeCtx, ComputeDef, Computed, Limits, Phase, Registry};
use crate::repl::frame::FrameWriter;
use crate::repl::proto::{
    encode_envelope, Invalidate, PublicationId, ReplEnvelope, ReplMessage, State, Update,
    PROTOCOL_VERSION,
};
use crate::repl::ReplError;

type SourceFn =
    Box<dyn Fn(&Registry) -> Result<(Arc<Computed>, Vec<u8>), ReplError> + Send + Sync>;

struct Snapshot {
    version: u64,
    // None while a recompute is pending or has failed.
    payload: Option<Vec<u8>>,
}

struct Publication {
    id: PublicationId,
    source: SourceFn,
    snapshot: Mutex<Snapshot>,
    /// Strong hold on the current cell: the registry only keeps a weak
    /// reference, and a dropped cell takes its invalidation hook with it.
    cell: Mutex<Arc<Computed>>,
}

/// Write half of one subscriber session, shared between the session reader
/// thread and the push worker.
pub(crate) struct SessionOut {
    writer: Mutex<FrameWriter<Box<dyn Write + Send>>>,
}

impl SessionOut {
    pub(crate) fn new(writer: FrameWriter<Box<dyn Write + Send>>) -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(writer),
        })
    }

    pub(crate) fn send(&self, envelope: &ReplEnvelope) -> Result<(), ReplError> {
        let bytes = encode_envelope(envelope)?;
        let mut writer = self.writer.lock().map_err(|_| ReplError::LockPoisoned)?;
        writer.write_frame(&bytes)?;
        Ok(())
    }
}

struct Session {
    out: Arc<SessionOut>,
    subscriptions: Mutex<HashSet<PublicationId>>,
}

struct PublisherInner {
    publisher_id: Uuid,
    registry: Registry,
    limits: Limits,
    publications: Mutex<HashMap<PublicationId, Arc<Publication>>>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_session: AtomicU64,
    dirty: Sender<PublicationId>,
}

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

/// Owns the push worker; dropping stops it.
pub struct PublisherHandle {
    shutdown: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Publisher {
    pub fn start(registry: Registry, limits: Limits) -> std::io::Result<(Self, PublisherHandle)> {
        let (dirty, dirty_rx) = channel::unbounded();
        let publisher = Self {
            inner: Arc::new(PublisherInner {
                publisher_id: Uuid::new_v4(),
                registry,
                limits,
                publications: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                dirty,
            }),
        };

        let (shutdown, shutdown_rx) = channel::bounded::<()>(1);
        let worker = publisher.clone();
        let handle = std::thread::Builder::new()
            .name("ripple-publisher".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(shutdown_rx) -> _ => break,
                    recv(dirty_rx) -> msg => match msg {
                        Ok(id) => worker.refresh(id),
                        Err(_) => break,
                    },
                }
            })?;

        Ok((
            publisher,
            PublisherHandle {
                shutdown,
                handle: Some(handle),
            },
        ))
    }

    pub fn publisher_id(&self) -> Uuid {
        self.inner.publisher_id
    }

    pub fn limits(&self) -> &Limits {
        &self.inner.limits
    }

    /// Expose one computed value as a publication. The initial value is
    /// computed eagerly so the first subscriber gets `State` without waiting.
    pub fn publish<A, T>(
        &self,
        def: &ComputeDef<A, T>,
        args: A,
    ) -> Result<PublicationId, ReplError>
    where
        A: Serialize + Send + Sync + 'static,
        T: Serialize + Send + Sync + 'static,
    {
        let id = PublicationId::generate();
        let def = def.clone();
        let source: SourceFn = Box::new(move |registry| {
            let cx = ComputeCtx::new(registry, Phase::Execute, CancelToken::new());
            let cell = def.call_computed(&cx, &args)?;
            let value = cell.value::<T>()?;
            let payload = serde_json::to_vec(value.as_ref()).map_err(|e| ReplError::Payload {
                reason: e.to_string(),
            })?;
            Ok((cell, payload))
        });

        let (cell, payload) = source(&self.inner.registry)?;
        let publication = Arc::new(Publication {
            id,
            source,
            snapshot: Mutex::new(Snapshot {
                version: 1,
                payload: Some(payload),
            }),
            cell: Mutex::new(Arc::clone(&cell)),
        });
        self.arm_hook(id, &cell);

        let mut publications = self
            .inner
            .publications
            .lock()
            .map_err(|_| ReplError::LockPoisoned)?;
        publications.insert(id, publication);
        tracing::debug!(publication = %id, "published");
        Ok(id)
    }

    fn arm_hook(&self, id: PublicationId, cell: &Arc<Computed>) {
        let dirty = self.inner.dirty.clone();
        cell.on_invalidated(move || {
            let _ = dirty.send(id);
        });
    }

    /// One dirty cycle: stale push, recompute, fresh push.
    fn refresh(&self, id: PublicationId) {
        let Some(publication) = self.get_publication(id) else {
            return;
        };

        let next_version = {
            let Ok(mut snapshot) = publication.snapshot.lock() else {
                return;
            };
            snapshot.version += 1;
            snapshot.payload = None;
            snapshot.version
        };
        self.broadcast(
            id,
            ReplMessage::Invalidate(Invalidate {
                publication_id: id,
                version: next_version,
            }),
        );

        match (publication.source)(&self.inner.registry) {
            Ok((cell, payload)) => {
                self.arm_hook(id, &cell);
                if let Ok(mut held) = publication.cell.lock() {
                    *held = Arc::clone(&cell);
                }
                if let Ok(mut snapshot) = publication.snapshot.lock() {
                    if snapshot.version == next_version {
                        snapshot.payload = Some(payload.clone());
                    }
                }
                self.broadcast(
                    id,
                    ReplMessage::Update(Update {
                        publication_id: id,
                        version: next_version,
                        payload,
                    }),
                );
            }
            Err(e) => {
                // Subscribers stay invalidated; a later Request retries.
                tracing::error!(publication = %id, "publication refresh failed: {e}");
            }
        }
    }

    fn get_publication(&self, id: PublicationId) -> Option<Arc<Publication>> {
        let publications = self.inner.publications.lock().ok()?;
        publications.get(&id).cloned()
    }

    /// Current full state, recomputing if the last refresh failed or is
    /// still pending.
    pub(crate) fn state_for(&self, id: PublicationId) -> Result<State, ReplError> {
        let publication = self
            .get_publication(id)
            .ok_or_else(|| ReplError::Refused {
                reason: format!("unknown publication {id}"),
            })?;

        {
            let snapshot = publication
                .snapshot
                .lock()
                .map_err(|_| ReplError::LockPoisoned)?;
            if let Some(payload) = &snapshot.payload {
                return Ok(State {
                    publication_id: id,
                    version: snapshot.version,
                    payload: payload.clone(),
                });
            }
        }

        let (cell, payload) = (publication.source)(&self.inner.registry)?;
        self.arm_hook(id, &cell);
        if let Ok(mut held) = publication.cell.lock() {
            *held = Arc::clone(&cell);
        }
        let mut snapshot = publication
            .snapshot
            .lock()
            .map_err(|_| ReplError::LockPoisoned)?;
        if snapshot.payload.is_none() {
            snapshot.payload = Some(payload.clone());
        }
        Ok(State {
            publication_id: id,
            version: snapshot.version,
            payload,
        })
    }

    pub(crate) fn attach_session(&self, out: Arc<SessionOut>) -> u64 {
        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.insert(
                session_id,
                Arc::new(Session {
                    out,
                    subscriptions: Mutex::new(HashSet::new()),
                }),
            );
        }
        session_id
    }

    pub(crate) fn detach_session(&self, session_id: u64) {
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.remove(&session_id);
        }
    }

    /// Registers the subscription before snapshotting. A refresh racing this
    /// call then reaches the session as a broadcast, and the replica's
    /// version gating orders the late `State` against it; snapshotting first
    /// would let that refresh skip the not-yet-subscribed session and leave
    /// the replica synced on a stale value.
    pub(crate) fn subscribe(
        &self,
        session_id: u64,
        id: PublicationId,
    ) -> Result<State, ReplError> {
        if self.get_publication(id).is_none() {
            return Err(ReplError::Refused {
                reason: format!("unknown publication {id}"),
            });
        }
        {
            let sessions = self
                .inner
                .sessions
                .lock()
                .map_err(|_| ReplError::LockPoisoned)?;
            if let Some(session) = sessions.get(&session_id) {
                session
                    .subscriptions
                    .lock()
                    .map_err(|_| ReplError::LockPoisoned)?
                    .insert(id);
            }
        }
        match self.state_for(id) {
            Ok(state) => Ok(state),
            Err(e) => {
                self.unsubscribe(session_id, id);
                Err(e)
            }
        }
    }

    pub(crate) fn unsubscribe(&self, session_id: u64, id: PublicationId) {
        let Ok(sessions) = self.inner.sessions.lock() else {
            return;
        };
        if let Some(session) = sessions.get(&session_id) {
            if let Ok(mut subscriptions) = session.subscriptions.lock() {
                subscriptions.remove(&id);
            }
        }
    }

    fn broadcast(&self, id: PublicationId, message: ReplMessage) {
        let envelope = ReplEnvelope {
            version: PROTOCOL_VERSION,
            message,
        };
        let targets: Vec<(u64, Arc<Session>)> = match self.inner.sessions.lock() {
            Ok(sessions) => sessions
                .iter()
                .filter(|(_, session)| {
                    session
                        .subscriptions
                        .lock()
                        .map(|subs| subs.contains(&id))
                        .unwrap_or(false)
                })
                .map(|(sid, session)| (*sid, Arc::clone(session)))
                .collect(),
            Err(_) => return,
        };

        for (session_id, session) in targets {
            if let Err(e) = session.out.send(&envelope) {
                tracing::debug!(session_id, "dropping subscriber session: {e}");
                self.detach_session(session_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServiceId;
    use crate::repl::transport::duplex_pair;

    fn held_cell() -> Mutex<Arc<Computed>> {
        let fingerprint = crate::core::Fingerprint::new(
            ServiceId::parse("pulse").unwrap(),
            crate::core::MethodId::parse("seed").unwrap(),
            crate::core::ArgsDigest::of("seed").unwrap(),
        );
        Mutex::new(Arc::new(Computed::new(fingerprint, 0)))
    }

    fn session(publisher: &Publisher) -> u64 {
        let (server_end, _client_end) = duplex_pair();
        let out = SessionOut::new(FrameWriter::new(
            server_end.writer,
            Limits::default().max_frame_bytes,
        ));
        publisher.attach_session(out)
    }

    // A publication with an empty snapshot, so subscribe has to recompute;
    // the source reports whether the session was subscribed when it ran.
    fn recomputing_publication(
        publisher: &Publisher,
        session_id: u64,
        observed: Arc<Mutex<Option<bool>>>,
    ) -> PublicationId {
        let id = PublicationId::generate();
        let service = ServiceId::parse("pulse").unwrap();
        let def = ComputeDef::new(&service, "value", |_cx, _args: &()| Ok(1u64)).unwrap();
        let snooper = publisher.clone();
        let source: SourceFn = Box::new(move |registry| {
            let subscribed = snooper
                .inner
                .sessions
                .lock()
                .unwrap()
                .get(&session_id)
                .map(|s| s.subscriptions.lock().unwrap().contains(&id))
                .unwrap_or(false);
            *observed.lock().unwrap() = Some(subscribed);
            let cx = ComputeCtx::new(registry, Phase::Execute, CancelToken::new());
            let cell = def.call_computed(&cx, &())?;
            let payload = serde_json::to_vec(cell.value::<u64>()?.as_ref()).unwrap();
            Ok((cell, payload))
        });
        publisher.inner.publications.lock().unwrap().insert(
            id,
            Arc::new(Publication {
                id,
                source,
                snapshot: Mutex::new(Snapshot {
                    version: 1,
                    payload: None,
                }),
                cell: held_cell(),
            }),
        );
        id
    }

    #[test]
    fn subscribe_registers_the_session_before_snapshotting() {
        let (publisher, _worker) = Publisher::start(Registry::new(), Limits::default()).unwrap();
        let session_id = session(&publisher);
        let observed = Arc::new(Mutex::new(None));
        let id = recomputing_publication(&publisher, session_id, Arc::clone(&observed));

        let state = publisher.subscribe(session_id, id).unwrap();
        assert_eq!(state.version, 1);
        // A refresh running while the snapshot is taken already sees the
        // subscription, so its broadcasts cannot skip this session.
        assert_eq!(*observed.lock().unwrap(), Some(true));
    }

    #[test]
    fn failed_subscribe_leaves_no_registration() {
        let (publisher, _worker) = Publisher::start(Registry::new(), Limits::default()).unwrap();
        let session_id = session(&publisher);

        let id = PublicationId::generate();
        let source: SourceFn = Box::new(move |_registry| {
            Err(ReplError::Payload {
                reason: "unavailable".to_string(),
            })
        });
        publisher.inner.publications.lock().unwrap().insert(
            id,
            Arc::new(Publication {
                id,
                source,
                snapshot: Mutex::new(Snapshot {
                    version: 1,
                    payload: None,
                }),
                cell: held_cell(),
            }),
        );

        assert!(publisher.subscribe(session_id, id).is_err());
        let sessions = publisher.inner.sessions.lock().unwrap();
        let subs = sessions[&session_id].subscriptions.lock().unwrap();
        assert!(!subs.contains(&id));
    }
}
