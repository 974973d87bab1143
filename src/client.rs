/*!
 * Client Wrapper
 *
 * A `Client` owns one outbound connection and the call discipline around
 * it: every marked operation checks the connection is still open, pushes it
 * onto the current loop's connection stack, runs the operation body, and
 * pops on the way out whether or not the body failed. Protocol clients are
 * built by wrapping their operations in `call`.
 */

use crate::connection::Handshake;
use crate::error::Error;
use crate::loops::LoopScope;
use mio::net::TcpStream;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Resolve a host name to its first IPv4 address.
///
/// # Arguments
/// * `host` - Host name or dotted-quad string
///
/// # Returns
/// * The first IPv4 address, or a connect error when none resolves
pub fn resolve(host: &str) -> crate::Result<Ipv4Addr> {
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| Error::Connect(format!("resolve {host}: {e}")))?;
    for addr in addrs {
        if let IpAddr::V4(ip) = addr.ip() {
            return Ok(ip);
        }
    }
    Err(Error::Connect(format!("no IPv4 address for {host}")))
}

/// An agent that connects to a remote host and runs marked operations
/// against that connection from inside a loop.
pub struct Client {
    /// Token of the established connection; None once closed.
    conn: Option<usize>,
    /// False after `close`; call entry checks this first.
    connected: bool,
    /// Remote address this client connected to.
    addr: SocketAddr,
}

impl Client {
    /// Connect to a remote host. Suspends the current loop until the
    /// connection is established, times out, or fails.
    ///
    /// # Arguments
    /// * `scope` - The calling loop's handle
    /// * `host` - Host name or address, resolved to IPv4
    /// * `port` - Remote port
    /// * `timeout` - Give up after this long; the socket is closed and the
    ///   loop resumes with a timeout error
    pub fn connect(
        scope: &mut LoopScope,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
    ) -> crate::Result<Client> {
        Client::establish(scope, host, port, timeout, None)
    }

    /// Connect and then drive the supplied handshake (e.g. TLS) before the
    /// connection is handed back.
    pub fn connect_with(
        scope: &mut LoopScope,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        handshake: Box<dyn Handshake>,
    ) -> crate::Result<Client> {
        Client::establish(scope, host, port, timeout, Some(handshake))
    }

    fn establish(
        scope: &mut LoopScope,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        handshake: Option<Box<dyn Handshake>>,
    ) -> crate::Result<Client> {
        let ip = resolve(host)?;
        let addr = SocketAddr::from((ip, port));

        // Starts the non-blocking connect; the reactor finishes it
        let stream = TcpStream::connect(addr).map_err(|e| Error::Connect(e.to_string()))?;
        let token = scope.connect(stream, addr, timeout, handshake)?;
        Ok(Client {
            conn: Some(token),
            connected: true,
            addr,
        })
    }

    /// Remote address this client connected to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run a marked operation against this client's connection. The
    /// connection is pushed for the duration of `f` and popped afterwards
    /// regardless of the outcome, so nested client calls compose.
    ///
    /// # Arguments
    /// * `scope` - The calling loop's handle
    /// * `f` - Operation body; uses the input/send primitives freely
    ///
    /// # Returns
    /// * Whatever `f` returns, or the closed-connection error when the
    ///   client is no longer usable
    pub fn call<R>(
        &self,
        scope: &mut LoopScope,
        f: impl FnOnce(&mut LoopScope) -> crate::Result<R>,
    ) -> crate::Result<R> {
        // Refuse up front rather than failing inside the body
        if !self.connected {
            return Err(Error::ConnectionClosed(None));
        }
        let token = self.conn.ok_or(Error::ConnectionClosed(None))?;
        if scope.conn_closed(token)? {
            return Err(Error::ConnectionClosed(None));
        }

        // Push for the body, pop no matter how the body came out
        scope.push_connection(token)?;
        let result = f(scope);
        let popped = scope.pop_connection();
        match result {
            Ok(value) => popped.map(|_| value),
            Err(e) => Err(e),
        }
    }

    /// Whether the underlying connection is gone.
    pub fn is_closed(&self, scope: &mut LoopScope) -> crate::Result<bool> {
        match self.conn {
            None => Ok(true),
            Some(token) => scope.conn_closed(token),
        }
    }

    /// Close the connection, flushing anything still queued first. The
    /// client is unusable afterwards.
    pub fn close(&mut self, scope: &mut LoopScope) -> crate::Result<()> {
        if let Some(token) = self.conn.take() {
            scope.conn_close(token)?;
        }
        self.connected = false;
        Ok(())
    }
}
