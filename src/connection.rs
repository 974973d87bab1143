/*!
 * Connection State Machine
 *
 * A `Connection` binds a non-blocking socket to a receive `Buffer` and a
 * send `Pipeline`, and owns the readable/writable/error edge handling plus
 * the close/shutdown lifecycle. Edge handlers never resume loops directly;
 * they return a wake directive that the application delivers after the
 * handler releases its borrows.
 */

use crate::buffer::Buffer;
use crate::error::Error;
use crate::loops::{Reply, Waiter};
use crate::pipeline::{Drained, Pipeline};
use crate::BUFSIZ;
use log::trace;
use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

/// The byte stream under a connection. Implemented for `mio::net::TcpStream`;
/// a TLS session type wrapping one can implement it as well, mapping its
/// want-read/want-write conditions to `WouldBlock`.
pub trait Transport: Read + Write + Send {
    fn register(&mut self, registry: &Registry, token: Token, interest: Interest)
        -> io::Result<()>;
    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl Transport for TcpStream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        Source::register(self, registry, token, interest)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        Source::reregister(self, registry, token, interest)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        Source::deregister(self, registry)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// One step of an asynchronous handshake (TLS or similar) driven by the
/// reactor between the raw connect and the established connection.
pub enum HandshakeStep {
    /// Not done yet; re-arm the socket with this interest and call `drive`
    /// again on the next edge.
    Pending { stream: TcpStream, interest: Interest },
    /// Handshake complete; the returned transport carries the session.
    Done(Box<dyn Transport>),
    /// Handshake failed; the socket has been consumed and closed.
    Failed { error: io::Error },
}

/// Contract for handshake providers. The reactor calls `drive` once the raw
/// connect completes and again on every readiness edge until it returns
/// `Done` or `Failed`.
pub trait Handshake: Send {
    fn drive(&mut self, stream: TcpStream) -> HandshakeStep;
}

/// A wake directive produced by an edge handler: which suspended loop to
/// resume, and with what.
pub(crate) type WakeOut = Option<(Waiter, Reply)>;

pub struct Connection {
    /// The non-blocking byte stream, plain TCP or a wrapped session.
    transport: Box<dyn Transport>,
    /// Receive-side accumulator holding the pending match term.
    pub(crate) buffer: Buffer,
    /// Send-side priority queue of outbound chunks.
    pub(crate) pipeline: Pipeline,
    /// Remote address of the peer.
    addr: SocketAddr,
    /// Poll registration token for this connection.
    token: Token,
    /// Whether write interest is currently enabled with the hub.
    writable: bool,
    /// Set exactly once by `shutdown`; terminal.
    closed: bool,
    /// At most one loop may be blocked on this connection's input.
    pub(crate) waiter: Option<Waiter>,
}

impl Connection {
    pub(crate) fn new(transport: Box<dyn Transport>, addr: SocketAddr, token: Token) -> Connection {
        Connection {
            transport,
            buffer: Buffer::new(),
            pipeline: Pipeline::new(),
            addr,
            token,
            writable: false,
            closed: false,
            waiter: None,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Toggle write interest with the hub. Enabled only while the pipeline
    /// has data, to avoid busy writable edges.
    pub(crate) fn set_writable(&mut self, registry: &Registry, on: bool) {
        if self.closed || on == self.writable {
            return;
        }
        let interest = if on {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = self.transport.reregister(registry, self.token, interest) {
            trace!("reregister failed on {:?}: {e}", self.token);
            return;
        }
        self.writable = on;
    }

    /// Request a graceful local close: whatever is queued flushes first,
    /// then the write edge tears the connection down.
    pub(crate) fn close(&mut self, registry: &Registry) {
        self.set_writable(registry, true);
        self.pipeline.close_request();
    }

    /// Tear down the connection. Idempotent; deregisters from the hub
    /// exactly once and marks the connection closed (the socket itself is
    /// closed when the connection is dropped from the table). When the
    /// remote side initiated the close and a loop is waiting on input, that
    /// loop is woken with the residual buffered bytes attached.
    ///
    /// # Arguments
    /// * `registry` - Poll registration handle
    /// * `remote` - True when the peer closed or the socket failed; false
    ///   for a local flush-then-close
    pub(crate) fn shutdown(&mut self, registry: &Registry, remote: bool) -> WakeOut {
        if self.closed {
            return None;
        }
        self.closed = true;
        if let Err(e) = self.transport.deregister(registry) {
            trace!("deregister failed on {:?}: {e}", self.token);
        }
        if remote {
            if let Some(waiter) = self.waiter.take() {
                let residual = self.buffer.pop();
                let residual = (!residual.is_empty()).then_some(residual);
                return Some((waiter, Err(Error::ConnectionClosed(residual))));
            }
        }
        None
    }

    /// Readable edge. Drains the socket in bounded chunks (the poller is
    /// edge-triggered, so stopping early would lose the edge), feeds the
    /// buffer, and delivers the matched chunk if a waiter's term is now
    /// satisfied. Zero bytes or a fatal error is a remote close.
    pub(crate) fn handle_read(&mut self, registry: &Registry) -> WakeOut {
        if self.closed {
            return None;
        }
        let mut tmp = [0u8; BUFSIZ];
        let mut eof = false;
        loop {
            match self.transport.read(&mut tmp) {
                // Connection closed by the peer
                Ok(0) => {
                    eof = true;
                    break;
                }
                // Data received, accumulate it
                Ok(n) => self.buffer.append(&tmp[..n]),
                // No more data available right now
                Err(ref e) if would_block(e) => break,
                // Connection error counts as a remote close
                Err(e) => {
                    trace!("read error on {:?}: {e}", self.token);
                    eof = true;
                    break;
                }
            }
        }

        // Match the term once over everything accumulated; at most one
        // chunk is delivered per edge because there is at most one waiter
        let mut wake = None;
        if self.waiter.is_some() {
            if let Some(chunk) = self.buffer.check() {
                let waiter = self.waiter.take().expect("waiter vanished");
                wake = Some((waiter, Ok(waiter.source.deliver(chunk))));
            }
        }
        if eof {
            // A chunk already extracted wins; otherwise the waiter gets
            // the closed signal with whatever was left in the buffer
            let shut = self.shutdown(registry, true);
            if wake.is_none() {
                wake = shut;
            }
        }
        wake
    }

    /// Writable edge. Draws bounded slices from the pipeline until it is
    /// drained or the socket refuses more; pushes back what did not go out.
    pub(crate) fn handle_write(&mut self, registry: &Registry) -> WakeOut {
        while !self.closed {
            let data = match self.pipeline.read(BUFSIZ) {
                // Drained: stop burning writable edges
                Drained::Empty => {
                    self.set_writable(registry, false);
                    return None;
                }
                // Flushed everything a local close was waiting on
                Drained::CloseRequested => return self.shutdown(registry, false),
                Drained::Data(data) => data,
            };
            match self.transport.write(&data) {
                Ok(sent) => {
                    // Partial send: the suffix goes back to the front
                    if sent < data.len() {
                        self.pipeline.backup(&data[sent..]);
                    }
                }
                // Socket full; retry on the next writable edge
                Err(ref e) if would_block(e) => {
                    self.pipeline.backup(&data);
                    return None;
                }
                // Fatal error is treated like a remote close
                Err(e) => {
                    trace!("write error on {:?}: {e}", self.token);
                    return self.shutdown(registry, true);
                }
            }
        }
        None
    }

    /// Error edge.
    pub(crate) fn handle_error(&mut self, registry: &Registry) -> WakeOut {
        self.shutdown(registry, true)
    }
}

/// Transient conditions a non-blocking socket reports when it simply has
/// nothing for us right now. TLS wrappers surface their want-read and
/// want-write states the same way.
#[inline]
pub(crate) fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
