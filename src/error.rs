/*!
 * Engine Error Taxonomy
 *
 * Every failure a loop can observe at a suspension point is a variant of
 * `Error`. Connection-level errors are delivered as the result of the
 * primitive the loop was suspended in, so user code handles them exactly
 * where the blocking-style call happened.
 */

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The connection was closed, either by the remote host while a loop was
    /// waiting on input, or because an operation targeted an already-closed
    /// connection. Carries any bytes that were still buffered when the
    /// remote end went away.
    #[error("connection closed")]
    ConnectionClosed(Option<Bytes>),

    /// An outbound connect failed before or during establishment.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connect timeout elapsed before the peer accepted.
    #[error("connection timeout")]
    ConnectTimeout,

    /// The parent loop (assigned via `fork_child`) terminated.
    #[error("parent loop died")]
    ParentDied,

    /// Clean-exit signal for the current loop. Not a failure: returning this
    /// from a loop callable ends the loop without an error log, closing any
    /// connection still on its stack.
    #[error("loop terminated")]
    Terminate,

    /// Advisory marker used when a keep-alive loop is being restarted.
    #[error("keep-alive loop restarting")]
    KeepAlive,

    /// An I/O primitive was invoked with no connection on the loop's stack.
    /// This is a programmer error; the loop handle converts it into a panic
    /// rather than returning it.
    #[error("no connection on the stack for this loop")]
    NoConnection,

    /// A loop body or an off-thread job panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// An ambient I/O failure, e.g. binding a service listener.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Bytes that were still buffered when the remote host closed the
    /// connection, if any.
    pub fn residual(&self) -> Option<&Bytes> {
        match self {
            Error::ConnectionClosed(residual) => residual.as_ref(),
            _ => None,
        }
    }
}
