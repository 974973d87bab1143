// Core modules for the weft cooperative network engine
pub mod buffer; // receive-side accumulator with pending match terms
pub mod pipeline; // send-side priority queue with soft close
pub mod connection; // connection state machine + transport/handshake seams
pub mod loops; // Loop, LoopScope and the suspension primitives
pub mod client; // client wrapper + DNS resolve helper
pub mod error; // error taxonomy

mod app; // Application: loop registry, wait index, reactor turn
mod hub; // poll, timers, ready queue, worker pool

// Re-export the public surface for easier access
pub use app::Application;
pub use buffer::{Buffer, Term};
pub use client::{resolve, Client};
pub use connection::{Handshake, HandshakeStep, Transport};
pub use error::Error;
pub use loops::{FireValue, First, FirstOf, Loop, LoopId, LoopScope};
pub use pipeline::{Drained, Pipeline};

pub type Result<T> = std::result::Result<T, Error>;

/// Bounded slice size for socket reads and pipeline draws.
pub const BUFSIZ: usize = 16 * 1024;

/// Line terminator matched by `until_eol`.
pub const CRLF: &[u8] = b"\r\n";
