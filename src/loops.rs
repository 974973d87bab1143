/*!
 * Loops and Their Primitives
 *
 * A `Loop` is one logically-sequential task. Its user callable runs on a
 * dedicated thread, but only one loop executes at a time: every suspending
 * primitive sends a request to the reactor and blocks on the loop's resume
 * channel, so each suspension yields control back to the hub. `LoopScope`
 * is the in-thread handle exposing the primitives.
 */

use crate::buffer::Term;
use crate::connection::Handshake;
use crate::error::Error;
use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender};
use mio::net::TcpStream;
use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Monotonically increasing loop identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub(crate) u64);

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value carried by `fire` to every waiting loop. Fired values are
/// arbitrary; waiters downcast to the type they expect.
pub type FireValue = Arc<dyn Any + Send + Sync>;

pub(crate) type LoopFn = dyn Fn(&mut LoopScope) -> crate::Result<()> + Send + Sync;

pub(crate) type ThreadJob =
    Box<dyn FnOnce() -> Result<Box<dyn Any + Send>, Error> + Send>;

/// Specification of a loop to register with the application: the callable,
/// a human-readable label, and the keep-alive flag.
pub struct Loop {
    /// The body; shared so a keep-alive restart can rerun it.
    pub(crate) callable: Arc<LoopFn>,
    /// Human-readable label used in logs.
    pub(crate) label: String,
    /// Restart after any exit when set.
    pub(crate) keep_alive: bool,
}

impl Loop {
    pub fn new(f: impl Fn(&mut LoopScope) -> crate::Result<()> + Send + Sync + 'static) -> Loop {
        Loop {
            callable: Arc::new(f),
            label: "loop".to_string(),
            keep_alive: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Loop {
        self.label = label.into();
        self
    }

    /// A keep-alive loop is restarted half a second after it ends, however
    /// it ended, with its original label and callable.
    pub fn keep_alive(mut self, on: bool) -> Loop {
        self.keep_alive = on;
        self
    }
}

/// Which form of input a suspended loop armed. Tags from `first` carry
/// through to the resume value so user code can tell the sources apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputSource {
    Input,
    Receive,
    Until,
    UntilEol,
}

impl InputSource {
    pub(crate) fn deliver(self, chunk: Bytes) -> WakeValue {
        match self {
            InputSource::Input => WakeValue::Bytes(chunk),
            InputSource::Receive => WakeValue::First(FirstOf::Receive(chunk)),
            InputSource::Until => WakeValue::First(FirstOf::Until(chunk)),
            InputSource::UntilEol => WakeValue::First(FirstOf::UntilEol(chunk)),
        }
    }
}

/// A loop blocked on a connection's input: who to wake, the wake sequence
/// the arm captured, and how to tag the delivered chunk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter {
    pub lp: LoopId,
    pub seq: u64,
    pub source: InputSource,
}

/// Which armed source completed a `first`, with its payload.
pub enum FirstOf {
    Sleep,
    Wait(String, FireValue),
    Receive(Bytes),
    Until(Bytes),
    UntilEol(Bytes),
}

impl fmt::Debug for FirstOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirstOf::Sleep => write!(f, "Sleep"),
            FirstOf::Wait(name, _) => f.debug_tuple("Wait").field(name).finish(),
            FirstOf::Receive(b) => f.debug_tuple("Receive").field(&b.len()).finish(),
            FirstOf::Until(b) => f.debug_tuple("Until").field(&b.len()).finish(),
            FirstOf::UntilEol(b) => f.debug_tuple("UntilEol").field(&b.len()).finish(),
        }
    }
}

/// The value a wake delivers into a suspended primitive. Each primitive
/// expects the variant matching its request.
pub(crate) enum WakeValue {
    Ready,
    Bytes(Bytes),
    Fired(FireValue),
    First(FirstOf),
    Thread(Box<dyn Any + Send>),
    Conn(usize),
    Flag(bool),
    Forked(LoopId),
    Addr(SocketAddr),
}

pub(crate) type Reply = Result<WakeValue, Error>;

/// A request from the active loop to the reactor. Suspending requests get
/// their reply when a wake fires; the rest are answered immediately.
pub(crate) enum Request {
    Input {
        source: InputSource,
        term: Term,
    },
    Send {
        data: Bytes,
        priority: u8,
    },
    Sleep(Duration),
    Wait(String),
    Fire {
        event: String,
        value: FireValue,
    },
    First {
        sleep: Option<Duration>,
        waits: Vec<String>,
        input: Option<(InputSource, Term)>,
    },
    Connect {
        stream: TcpStream,
        addr: SocketAddr,
        timeout: Option<Duration>,
        handshake: Option<Box<dyn Handshake>>,
    },
    Thread(ThreadJob),
    Fork {
        lp: Loop,
        child: bool,
    },
    Label(String),
    PushConn(usize),
    PopConn,
    ConnClose(usize),
    ConnClosed(usize),
    PeerAddr,
    Halt,
}

pub(crate) enum ControlMsg {
    Request { id: LoopId, req: Request },
    Done { id: LoopId, outcome: crate::Result<()> },
}

/// In-thread handle for one loop. All primitives are methods here; the
/// scope is moved into the loop's thread, so they can only be invoked from
/// inside the loop's own callable.
pub struct LoopScope {
    /// Identity of the loop this scope belongs to.
    id: LoopId,
    /// Control channel into the reactor, shared by all loops.
    ctrl: Sender<ControlMsg>,
    /// This loop's private resume channel; blocking here is suspension.
    resume: Receiver<Reply>,
}

impl LoopScope {
    pub(crate) fn new(id: LoopId, ctrl: Sender<ControlMsg>, resume: Receiver<Reply>) -> LoopScope {
        LoopScope { id, ctrl, resume }
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    /// One request/reply exchange with the reactor. If the reactor is gone
    /// the loop is asked to terminate, which unwinds through the usual `?`
    /// chains in user code.
    fn roundtrip(&mut self, req: Request) -> Reply {
        let msg = ControlMsg::Request { id: self.id, req };
        if self.ctrl.send(msg).is_err() {
            return Err(Error::Terminate);
        }
        match self.resume.recv() {
            Ok(reply) => reply,
            Err(_) => Err(Error::Terminate),
        }
    }

    fn submit(&mut self, req: Request) -> Reply {
        match self.roundtrip(req) {
            Err(Error::NoConnection) => {
                panic!("cannot complete socket operation: no connection on the stack")
            }
            reply => reply,
        }
    }

    /// Read until the delimiter appears; the returned chunk includes it.
    /// Returns synchronously when the buffer already satisfies the term.
    ///
    /// # Arguments
    /// * `delim` - Delimiter bytes to scan for, matched at the earliest
    ///   position
    pub fn until(&mut self, delim: impl AsRef<[u8]>) -> crate::Result<Bytes> {
        self.input(Term::delimiter(delim))
    }

    /// Read one CR-LF terminated line.
    pub fn until_eol(&mut self) -> crate::Result<Bytes> {
        self.input(Term::delimiter(crate::CRLF))
    }

    /// Read exactly `n` bytes.
    pub fn receive(&mut self, n: usize) -> crate::Result<Bytes> {
        self.input(Term::length(n))
    }

    /// Install a term on the top-of-stack connection and block until it is
    /// satisfied.
    pub fn input(&mut self, term: Term) -> crate::Result<Bytes> {
        match self.submit(Request::Input {
            source: InputSource::Input,
            term,
        })? {
            WakeValue::Bytes(chunk) => Ok(chunk),
            _ => unreachable!("input resumed with a mismatched value"),
        }
    }

    /// Queue a payload on the top-of-stack connection at the default
    /// priority. Never suspends.
    pub fn send(&mut self, data: impl Into<Bytes>) -> crate::Result<()> {
        self.send_priority(data, 5)
    }

    /// Queue a payload with an explicit priority; lower values go out
    /// first, equal values keep insertion order.
    ///
    /// # Arguments
    /// * `data` - Payload bytes
    /// * `priority` - Lower wins; `send` uses 5
    pub fn send_priority(&mut self, data: impl Into<Bytes>, priority: u8) -> crate::Result<()> {
        match self.submit(Request::Send {
            data: data.into(),
            priority,
        })? {
            WakeValue::Ready => Ok(()),
            _ => unreachable!("send resumed with a mismatched value"),
        }
    }

    /// Suspend for the given duration. A zero duration yields exactly one
    /// scheduler turn.
    pub fn sleep(&mut self, duration: Duration) -> crate::Result<()> {
        match self.submit(Request::Sleep(duration))? {
            WakeValue::Ready => Ok(()),
            _ => unreachable!("sleep resumed with a mismatched value"),
        }
    }

    /// Suspend until someone fires the named event; resumes with the fired
    /// value.
    pub fn wait(&mut self, event: impl Into<String>) -> crate::Result<FireValue> {
        match self.submit(Request::Wait(event.into()))? {
            WakeValue::Fired(value) => Ok(value),
            _ => unreachable!("wait resumed with a mismatched value"),
        }
    }

    /// Deliver a value to every loop currently waiting on the event. Loops
    /// that register afterwards do not observe this firing. Never suspends.
    ///
    /// # Arguments
    /// * `event` - Event name, the same string waiters passed to `wait`
    /// * `value` - Any value; each waiter receives a shared handle to it
    pub fn fire(
        &mut self,
        event: impl Into<String>,
        value: impl Any + Send + Sync,
    ) -> crate::Result<()> {
        match self.submit(Request::Fire {
            event: event.into(),
            value: Arc::new(value),
        })? {
            WakeValue::Ready => Ok(()),
            _ => unreachable!("fire resumed with a mismatched value"),
        }
    }

    /// Run `f` on a hub worker thread; other loops proceed while it runs.
    /// Resumes with `f`'s result once the worker finishes. A panic inside
    /// `f` comes back as `Error::Panicked` rather than killing anything.
    pub fn thread<R, F>(&mut self, f: F) -> crate::Result<R>
    where
        R: Any + Send,
        F: FnOnce() -> R + Send + 'static,
    {
        let job: ThreadJob = Box::new(move || Ok(Box::new(f()) as Box<dyn Any + Send>));
        match self.submit(Request::Thread(job))? {
            WakeValue::Thread(boxed) => match boxed.downcast::<R>() {
                Ok(result) => Ok(*result),
                Err(_) => unreachable!("thread job resumed with a mismatched type"),
            },
            _ => unreachable!("thread resumed with a mismatched value"),
        }
    }

    /// Start building a `first`: several sources armed at once, resuming
    /// with whichever completes first.
    pub fn first(&mut self) -> First<'_> {
        First {
            scope: self,
            sleep: None,
            waits: Vec::new(),
            input: None,
        }
    }

    /// Register a new independent loop. It starts on the next hub turn.
    ///
    /// # Returns
    /// * The id assigned to the new loop
    pub fn fork(
        &mut self,
        f: impl Fn(&mut LoopScope) -> crate::Result<()> + Send + Sync + 'static,
    ) -> crate::Result<LoopId> {
        self.fork_loop(Loop::new(f), false)
    }

    /// Register a new loop parented to this one: when this loop terminates,
    /// the child observes `Error::ParentDied` at its next resume.
    pub fn fork_child(
        &mut self,
        f: impl Fn(&mut LoopScope) -> crate::Result<()> + Send + Sync + 'static,
    ) -> crate::Result<LoopId> {
        self.fork_loop(Loop::new(f), true)
    }

    pub fn fork_loop(&mut self, lp: Loop, child: bool) -> crate::Result<LoopId> {
        match self.submit(Request::Fork { lp, child })? {
            WakeValue::Forked(id) => Ok(id),
            _ => unreachable!("fork resumed with a mismatched value"),
        }
    }

    /// Replace this loop's human-readable label.
    pub fn label(&mut self, label: impl Into<String>) -> crate::Result<()> {
        match self.submit(Request::Label(label.into()))? {
            WakeValue::Ready => Ok(()),
            _ => unreachable!("label resumed with a mismatched value"),
        }
    }

    /// Ask the application to stop after the current turn.
    pub fn halt(&mut self) -> crate::Result<()> {
        match self.submit(Request::Halt)? {
            WakeValue::Ready => Ok(()),
            _ => unreachable!("halt resumed with a mismatched value"),
        }
    }

    /// Remote address of the top-of-stack connection.
    pub fn peer_addr(&mut self) -> crate::Result<SocketAddr> {
        match self.submit(Request::PeerAddr)? {
            WakeValue::Addr(addr) => Ok(addr),
            _ => unreachable!("peer_addr resumed with a mismatched value"),
        }
    }

    /// Make a connection the target of subsequent I/O primitives. Client
    /// wrappers push on entry and must pop on exit, success or not.
    pub fn push_connection(&mut self, token: usize) -> crate::Result<()> {
        match self.submit(Request::PushConn(token))? {
            WakeValue::Ready => Ok(()),
            _ => unreachable!("push resumed with a mismatched value"),
        }
    }

    pub fn pop_connection(&mut self) -> crate::Result<()> {
        match self.submit(Request::PopConn)? {
            WakeValue::Ready => Ok(()),
            _ => unreachable!("pop resumed with a mismatched value"),
        }
    }

    pub(crate) fn connect(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        timeout: Option<Duration>,
        handshake: Option<Box<dyn Handshake>>,
    ) -> crate::Result<usize> {
        match self.submit(Request::Connect {
            stream,
            addr,
            timeout,
            handshake,
        })? {
            WakeValue::Conn(token) => Ok(token),
            _ => unreachable!("connect resumed with a mismatched value"),
        }
    }

    pub(crate) fn conn_close(&mut self, token: usize) -> crate::Result<()> {
        match self.submit(Request::ConnClose(token))? {
            WakeValue::Ready => Ok(()),
            _ => unreachable!("close resumed with a mismatched value"),
        }
    }

    pub(crate) fn conn_closed(&mut self, token: usize) -> crate::Result<bool> {
        match self.submit(Request::ConnClosed(token))? {
            WakeValue::Flag(closed) => Ok(closed),
            _ => unreachable!("query resumed with a mismatched value"),
        }
    }
}

/// Builder for a multi-source suspension. At most one of the input forms
/// may be armed; zero or more waits and an optional sleep may join it.
pub struct First<'a> {
    /// The loop arming the sources.
    scope: &'a mut LoopScope,
    /// Optional timer source.
    sleep: Option<Duration>,
    /// Event names to wait on, each its own source.
    waits: Vec<String>,
    /// The single input form, when one was requested.
    input: Option<(InputSource, Term)>,
}

impl First<'_> {
    pub fn sleep(mut self, duration: Duration) -> Self {
        self.sleep = Some(duration);
        self
    }

    pub fn wait(mut self, event: impl Into<String>) -> Self {
        self.waits.push(event.into());
        self
    }

    pub fn receive(self, n: usize) -> Self {
        self.set_input(InputSource::Receive, Term::length(n))
    }

    pub fn until(self, delim: impl AsRef<[u8]>) -> Self {
        self.set_input(InputSource::Until, Term::delimiter(delim))
    }

    pub fn until_eol(self) -> Self {
        self.set_input(InputSource::UntilEol, Term::delimiter(crate::CRLF))
    }

    fn set_input(mut self, source: InputSource, term: Term) -> Self {
        assert!(
            self.input.is_none(),
            "only one of receive, until, until_eol may be armed"
        );
        self.input = Some((source, term));
        self
    }

    /// Arm the sources and suspend until the first one completes. When the
    /// input term is already satisfied the result returns synchronously and
    /// the other sources are never armed. Errors delivered to the loop
    /// propagate as `Err`, not as a tagged value.
    pub fn dispatch(self) -> crate::Result<FirstOf> {
        assert!(
            self.sleep.is_some() || !self.waits.is_empty() || self.input.is_some(),
            "first with no sources would never resume"
        );
        match self.scope.submit(Request::First {
            sleep: self.sleep,
            waits: self.waits,
            input: self.input,
        })? {
            WakeValue::First(which) => Ok(which),
            _ => unreachable!("first resumed with a mismatched value"),
        }
    }
}

/// Thread body for one loop. Panics in user code are contained here and
/// reported to the reactor as a failed outcome.
///
/// # Arguments
/// * `scope` - The loop's handle, owned by this thread from now on
/// * `callable` - The user body to run
pub(crate) fn run_loop(mut scope: LoopScope, callable: Arc<LoopFn>) {
    let id = scope.id;
    let ctrl = scope.ctrl.clone();

    // Contain panics so one crashing loop never takes the engine down
    let outcome = match catch_unwind(AssertUnwindSafe(|| callable(&mut scope))) {
        Ok(result) => result,
        Err(payload) => Err(Error::Panicked(panic_message(&*payload))),
    };
    // The reactor may already be gone during shutdown; nothing to do then.
    let _ = ctrl.send(ControlMsg::Done { id, outcome });
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
