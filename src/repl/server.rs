//! Accept loop and per-subscriber session handling.

use std::thread::JoinHandle;

use crate::repl::frame::FrameReader;
use crate::repl::proto::{
    decode_envelope, Pong, Refused, ReplEnvelope, ReplMessage, Welcome, PROTOCOL_VERSION,
};
use crate::repl::publisher::{Publisher, SessionOut};
use crate::repl::transport::{DuplexConn, Listener};
use crate::repl::FrameWriter;

/// Accepts subscriber connections for one publisher. The accept thread ends
/// when the listener's connectors are gone; sessions run on their own
/// threads until the peer disconnects.
pub struct ReplServer {
    _handle: JoinHandle<()>,
}

impl ReplServer {
    pub fn spawn(listener: Box<dyn Listener>, publisher: Publisher) -> std::io::Result<Self> {
        let handle = std::thread::Builder::new()
            .name("ripple-repl-accept".to_string())
            .spawn(move || loop {
                match listener.accept() {
                    Ok(conn) => {
                        let publisher = publisher.clone();
                        let spawned = std::thread::Builder::new()
                            .name("ripple-repl-session".to_string())
                            .spawn(move || run_session(publisher, conn));
                        if let Err(e) = spawned {
                            tracing::error!("session thread spawn failed: {e}");
                        }
                    }
                    Err(e) => {
                        tracing::debug!("repl listener closed: {e}");
                        break;
                    }
                }
            })?;
        Ok(Self { _handle: handle })
    }
}

fn run_session(publisher: Publisher, conn: DuplexConn) {
    let limits = publisher.limits().clone();
    let mut reader = FrameReader::new(conn.reader, limits.max_frame_bytes);
    let out = SessionOut::new(FrameWriter::new(conn.writer, limits.max_frame_bytes));

    // Handshake: the first frame must be Hello at our protocol version.
    let hello = match reader.read_next() {
        Ok(Some(bytes)) => match decode_envelope(&bytes, &limits) {
            Ok(ReplEnvelope {
                message: ReplMessage::Hello(hello),
                ..
            }) => hello,
            Ok(_) => {
                tracing::warn!("session opened without Hello");
                return;
            }
            Err(e) => {
                tracing::warn!("handshake decode failed: {e}");
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            tracing::debug!("session read failed before handshake: {e}");
            return;
        }
    };
    if hello.protocol_version != PROTOCOL_VERSION {
        tracing::warn!(
            got = hello.protocol_version,
            want = PROTOCOL_VERSION,
            "unsupported protocol version"
        );
        return;
    }

    let welcome = ReplEnvelope {
        version: PROTOCOL_VERSION,
        message: ReplMessage::Welcome(Welcome {
            protocol_version: PROTOCOL_VERSION,
            publisher_id: publisher.publisher_id(),
        }),
    };
    if out.send(&welcome).is_err() {
        return;
    }

    let session_id = publisher.attach_session(out.clone());
    tracing::debug!(session_id, client = %hello.client_id, "subscriber connected");

    loop {
        let bytes = match reader.read_next() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session_id, "session read failed: {e}");
                break;
            }
        };
        let envelope = match decode_envelope(&bytes, &limits) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(session_id, "bad frame from subscriber: {e}");
                break;
            }
        };
        if handle_message(&publisher, session_id, &out, envelope.message).is_err() {
            break;
        }
    }

    publisher.detach_session(session_id);
    tracing::debug!(session_id, "subscriber disconnected");
}

fn handle_message(
    publisher: &Publisher,
    session_id: u64,
    out: &SessionOut,
    message: ReplMessage,
) -> Result<(), ()> {
    let reply = match message {
        ReplMessage::Subscribe(msg) => {
            match publisher.subscribe(session_id, msg.publication_id) {
                Ok(state) => ReplMessage::State(state),
                Err(e) => ReplMessage::Refused(Refused {
                    publication_id: msg.publication_id,
                    reason: e.to_string(),
                }),
            }
        }
        ReplMessage::Unsubscribe(msg) => {
            publisher.unsubscribe(session_id, msg.publication_id);
            return Ok(());
        }
        ReplMessage::Request(msg) => match publisher.state_for(msg.publication_id) {
            Ok(state) => ReplMessage::State(state),
            Err(e) => ReplMessage::Refused(Refused {
                publication_id: msg.publication_id,
                reason: e.to_string(),
            }),
        },
        ReplMessage::Ping(msg) => ReplMessage::Pong(Pong { nonce: msg.nonce }),
        other => {
            tracing::warn!(session_id, "unexpected message from subscriber: {other:?}");
            return Ok(());
        }
    };

    out.send(&ReplEnvelope {
        version: PROTOCOL_VERSION,
        message: reply,
    })
    .map_err(|e| {
        tracing::debug!(session_id, "session write failed: {e}");
    })
}
