//! Publisher/replica behavior over the in-memory transport.

mod fixtures;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ripple::core::{ComputeDef, Limits, Registry, ServiceId};
use ripple::repl::proto::{
    decode_envelope, encode_envelope, PublicationId, ReplEnvelope, ReplMessage, State, Update,
    Welcome, PROTOCOL_VERSION,
};
use ripple::repl::{
    in_memory, FrameReader, FrameWriter, Publisher, Replica, ReplicaPolicy, ReplicaState,
    ReplServer,
};

fn fast_policy() -> ReplicaPolicy {
    ReplicaPolicy {
        backoff_base: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        read_timeout: Duration::from_secs(2),
    }
}

fn counter_def(source: Arc<AtomicU64>) -> (Registry, ComputeDef<(), u64>) {
    let registry = Registry::new();
    let service = ServiceId::parse("metrics").unwrap();
    let def = ComputeDef::new(&service, "total", move |_cx, _args: &()| {
        Ok(source.load(Ordering::SeqCst))
    })
    .unwrap();
    (registry, def)
}

#[test]
fn replica_follows_invalidation_and_update() {
    let source = Arc::new(AtomicU64::new(0));
    let (registry, def) = counter_def(Arc::clone(&source));

    let (publisher, _worker) = Publisher::start(registry.clone(), Limits::default()).unwrap();
    let publication = publisher.publish(&def, ()).unwrap();

    let (connector, listener) = in_memory();
    let _server = ReplServer::spawn(Box::new(listener), publisher.clone()).unwrap();

    let replica: Replica<u64> = Replica::subscribe(
        Arc::new(connector),
        publication,
        Limits::default(),
        fast_policy(),
    )
    .unwrap();

    assert_eq!(*replica.read().unwrap(), 0);
    let initial_version = replica.version();

    source.store(7, Ordering::SeqCst);
    assert!(def.invalidate(&registry, &()).unwrap());

    let synced = fixtures::wait_for(Duration::from_secs(5), || {
        replica
            .read_timeout(Duration::from_millis(500))
            .map(|v| *v == 7)
            .unwrap_or(false)
    });
    assert!(synced, "replica never converged on the new value");
    assert!(replica.version() > initial_version);
    assert_eq!(replica.state(), ReplicaState::Synced);
}

#[test]
fn unknown_publication_disposes_the_replica() {
    let source = Arc::new(AtomicU64::new(0));
    let (registry, _def) = counter_def(source);

    let (publisher, _worker) = Publisher::start(registry, Limits::default()).unwrap();
    let (connector, listener) = in_memory();
    let _server = ReplServer::spawn(Box::new(listener), publisher).unwrap();

    let replica: Replica<u64> = Replica::subscribe(
        Arc::new(connector),
        PublicationId::generate(),
        Limits::default(),
        fast_policy(),
    )
    .unwrap();

    let disposed = fixtures::wait_for(Duration::from_secs(5), || {
        replica.state() == ReplicaState::Disposed
    });
    assert!(disposed);
    assert!(replica.read_timeout(Duration::from_millis(100)).is_err());
}

/// Hand-rolled publisher side, to control exactly which frames arrive.
struct ScriptedSession {
    reader: FrameReader<Box<dyn std::io::Read + Send>>,
    writer: FrameWriter<Box<dyn std::io::Write + Send>>,
    limits: Limits,
    publication: PublicationId,
}

impl ScriptedSession {
    fn accept(listener: &ripple::repl::InMemoryListener) -> Self {
        let conn = ripple::repl::Listener::accept(listener).unwrap();
        let limits = Limits::default();
        Self {
            reader: FrameReader::new(conn.reader, limits.max_frame_bytes),
            writer: FrameWriter::new(conn.writer, limits.max_frame_bytes),
            limits,
            publication: PublicationId::generate(),
        }
    }

    fn handshake(&mut self) {
        let bytes = self.reader.read_next().unwrap().unwrap();
        let envelope = decode_envelope(&bytes, &self.limits).unwrap();
        assert!(matches!(envelope.message, ReplMessage::Hello(_)));
        self.send(ReplMessage::Welcome(Welcome {
            protocol_version: PROTOCOL_VERSION,
            publisher_id: uuid::Uuid::new_v4(),
        }));

        let bytes = self.reader.read_next().unwrap().unwrap();
        let envelope = decode_envelope(&bytes, &self.limits).unwrap();
        match envelope.message {
            ReplMessage::Subscribe(msg) => self.publication = msg.publication_id,
            other => panic!("expected Subscribe, got {other:?}"),
        }
    }

    fn send(&mut self, message: ReplMessage) {
        let bytes = encode_envelope(&ReplEnvelope {
            version: PROTOCOL_VERSION,
            message,
        })
        .unwrap();
        self.writer.write_frame(&bytes).unwrap();
    }

    fn send_state(&mut self, version: u64, value: u64) {
        self.send(ReplMessage::State(State {
            publication_id: self.publication,
            version,
            payload: serde_json::to_vec(&value).unwrap(),
        }));
    }

    fn send_update(&mut self, version: u64, value: u64) {
        self.send(ReplMessage::Update(Update {
            publication_id: self.publication,
            version,
            payload: serde_json::to_vec(&value).unwrap(),
        }));
    }
}

#[test]
fn out_of_order_update_is_discarded() {
    let (connector, listener) = in_memory();
    let publication = PublicationId::generate();

    let server = std::thread::spawn(move || {
        let mut session = ScriptedSession::accept(&listener);
        session.handshake();
        session.send_state(5, 10);
        // Delayed frame from an older version; must not roll the value back.
        session.send_update(4, 4);
        session.send_update(6, 60);
        // Keep the connection open until the replica goes away.
        let _ = session.reader.read_next();
    });

    let replica: Replica<u64> = Replica::subscribe(
        Arc::new(connector),
        publication,
        Limits::default(),
        fast_policy(),
    )
    .unwrap();

    assert_eq!(*replica.read().unwrap(), 10);
    let advanced = fixtures::wait_for(Duration::from_secs(5), || replica.version() == 6);
    assert!(advanced);
    assert_eq!(*replica.read().unwrap(), 60);

    drop(replica);
    server.join().unwrap();
}

#[test]
fn replica_resyncs_after_reconnect() {
    let (connector, listener) = in_memory();
    let publication = PublicationId::generate();

    let server = std::thread::spawn(move || {
        // First session dies immediately after the initial snapshot.
        let mut session = ScriptedSession::accept(&listener);
        session.handshake();
        session.send_state(1, 11);
        drop(session);

        // The replica reconnects and gets a full State again.
        let mut session = ScriptedSession::accept(&listener);
        session.handshake();
        session.send_state(1, 11);
        let _ = session.reader.read_next();
    });

    let replica: Replica<u64> = Replica::subscribe(
        Arc::new(connector),
        publication,
        Limits::default(),
        fast_policy(),
    )
    .unwrap();

    assert_eq!(*replica.read().unwrap(), 11);
    let resynced = fixtures::wait_for(Duration::from_secs(5), || {
        replica.state() == ReplicaState::Synced && *replica.read().unwrap() == 11
    });
    assert!(resynced);

    drop(replica);
    server.join().unwrap();
}
