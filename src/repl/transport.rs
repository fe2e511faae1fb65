//! Byte-stream transport for replication sessions.
//!
//! A session only needs a pair of blocking `Read`/`Write` halves, so the
//! publisher and replica are transport-agnostic. The in-memory pipe here is
//! the reference transport; a socket drops in behind the same traits.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam::channel::{self, Receiver, Sender};

pub struct DuplexConn {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

pub trait Connector: Send + Sync {
    fn connect(&self) -> io::Result<DuplexConn>;
}

pub trait Listener: Send {
    /// Block until a peer connects.
    fn accept(&self) -> io::Result<DuplexConn>;
}

/// Two connected in-process byte streams. Dropping either end's writer
/// surfaces as EOF on the peer's reader.
pub fn duplex_pair() -> (DuplexConn, DuplexConn) {
    let ab = Pipe::new();
    let ba = Pipe::new();
    (
        DuplexConn {
            reader: Box::new(PipeReader { pipe: ba.clone() }),
            writer: Box::new(PipeWriter { pipe: ab.clone() }),
        },
        DuplexConn {
            reader: Box::new(PipeReader { pipe: ab }),
            writer: Box::new(PipeWriter { pipe: ba }),
        },
    )
}

#[derive(Clone)]
struct Pipe {
    state: Arc<PipeState>,
}

struct PipeState {
    buf: Mutex<PipeBuf>,
    ready: Condvar,
}

struct PipeBuf {
    bytes: VecDeque<u8>,
    closed: bool,
}

impl Pipe {
    fn new() -> Self {
        Self {
            state: Arc::new(PipeState {
                buf: Mutex::new(PipeBuf {
                    bytes: VecDeque::new(),
                    closed: false,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    fn close(&self) {
        if let Ok(mut buf) = self.state.buf.lock() {
            buf.closed = true;
        }
        self.state.ready.notify_all();
    }
}

struct PipeReader {
    pipe: Pipe,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut buf = self
            .pipe
            .state
            .buf
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe lock poisoned"))?;
        loop {
            if !buf.bytes.is_empty() {
                let mut n = 0;
                while n < out.len() {
                    match buf.bytes.pop_front() {
                        Some(byte) => {
                            out[n] = byte;
                            n += 1;
                        }
                        None => break,
                    }
                }
                return Ok(n);
            }
            if buf.closed {
                return Ok(0);
            }
            buf = self
                .pipe
                .state
                .ready
                .wait(buf)
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe lock poisoned"))?;
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

struct PipeWriter {
    pipe: Pipe,
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .pipe
            .state
            .buf
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "pipe lock poisoned"))?;
        if buf.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        buf.bytes.extend(data.iter().copied());
        drop(buf);
        self.pipe.state.ready.notify_all();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

/// In-process listener half; pairs with [`InMemoryConnector`].
pub struct InMemoryListener {
    incoming: Receiver<DuplexConn>,
}

#[derive(Clone)]
pub struct InMemoryConnector {
    outgoing: Sender<DuplexConn>,
}

pub fn in_memory() -> (InMemoryConnector, InMemoryListener) {
    let (outgoing, incoming) = channel::unbounded();
    (InMemoryConnector { outgoing }, InMemoryListener { incoming })
}

impl Connector for InMemoryConnector {
    fn connect(&self) -> io::Result<DuplexConn> {
        let (client, server) = duplex_pair();
        self.outgoing
            .send(server)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone"))?;
        Ok(client)
    }
}

impl Listener for InMemoryListener {
    fn accept(&self) -> io::Result<DuplexConn> {
        self.incoming
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::NotConnected, "all connectors gone"))
    }
}
