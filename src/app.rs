/*!
 * Application Glue and the Reactor Turn
 *
 * The `Application` owns the hub, the connection table, the loop registry,
 * the running set and the event-wait index. Its `run` method is the
 * scheduler: poll for readiness, dispatch edges, expire timers, then drain
 * the ready queue, waking one loop at a time. While a loop runs, the
 * reactor services its requests on the control channel; everything else in
 * the engine is quiescent, so no locks guard any of this state.
 *
 * # Architecture
 * * Token 0 is the waker; every other token maps to a `Slot`
 * * Edge handlers return wake directives instead of resuming loops
 * * A wake delivers only when its captured sequence still matches,
 *   which is how concurrently-armed sources are reduced to one resumption
 */

use crate::connection::{would_block, Connection, Handshake, HandshakeStep, Transport};
use crate::error::Error;
use crate::hub::{Hub, TimerAction, TimerHandle, WakeEntry, WAKER};
use crate::loops::{
    run_loop, ControlMsg, FireValue, FirstOf, InputSource, Loop, LoopFn, LoopId, LoopScope, Reply,
    Request, WakeValue, Waiter,
};
use crate::buffer::Term;
use crossbeam::channel::{unbounded, Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use log::{debug, error, trace, warn};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how long an idle poll blocks.
const POLL_CADENCE: Duration = Duration::from_millis(200);

/// Backoff before a keep-alive loop is restarted.
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Reactor-side record of one loop.
struct LoopState {
    /// Current human-readable label, shown in logs.
    label: String,
    /// Label the loop was registered with; restored on keep-alive restart.
    base_label: String,
    /// The user callable; rerun from the top when the loop restarts.
    callable: Arc<LoopFn>,
    /// Whether to restart this loop after it ends, however it ended.
    keep_alive: bool,
    /// True while the loop's callable is considered alive.
    running: bool,
    /// True once the loop's thread has been spawned.
    started: bool,
    /// Wake sequence. Every armed resumption source captures the current
    /// value; only an exact match delivers, and delivering increments it.
    /// This is what guarantees at most one of several armed sources wakes
    /// the loop.
    seq: u64,
    /// Sending half of the resume channel; how replies and wakes reach
    /// the loop's thread.
    resume: Option<Sender<Reply>>,
    /// Receiving half of the resume channel, handed to the thread at spawn.
    resume_rx: Option<Receiver<Reply>>,
    /// The single pending sleep timer, if one is armed.
    wakeup_timer: Option<TimerHandle>,
    /// Loop-local stack of connections in use; the top is the default
    /// target for I/O primitives.
    stack: Vec<usize>,
    /// Whether the current wait registrations came from `first` and should
    /// resume with a tagged value.
    tagged_wait: bool,
    /// Loop that forked this one via `fork_child`, if any.
    parent: Option<LoopId>,
    /// Loops to notify with a parent-died error when this one terminates.
    children: HashSet<LoopId>,
}

/// An in-progress outbound connect.
struct Connecting {
    /// Socket with the non-blocking connect in flight.
    stream: TcpStream,
    /// Remote address being connected to.
    addr: SocketAddr,
    /// Loop suspended in this connect.
    lp: LoopId,
    /// Wake sequence captured when the connect was armed.
    seq: u64,
    /// Timeout timer; cancelled on every terminal outcome.
    timer: Option<TimerHandle>,
    /// Handshake to drive once the raw connect completes.
    handshake: Option<Box<dyn Handshake>>,
}

/// A connect whose transport handshake is still being driven.
struct Handshaking {
    /// Provider driving the handshake, one readiness edge at a time.
    driver: Box<dyn Handshake>,
    /// Socket handed back by the last `Pending` step.
    stream: TcpStream,
    /// Remote address being connected to.
    addr: SocketAddr,
    /// Loop suspended in this connect.
    lp: LoopId,
    /// Wake sequence captured when the connect was armed.
    seq: u64,
}

/// A listening service and the handler run for each accepted peer.
struct ServiceSlot {
    /// The bound, non-blocking listener.
    listener: TcpListener,
    /// Handler callable cloned into every per-connection loop.
    handler: Arc<LoopFn>,
    /// Label prefix for the per-connection loops.
    label: String,
}

/// What a registered poll token points at.
enum Slot {
    /// Outbound connect in flight.
    Connecting(Connecting),
    /// Transport handshake being driven after the raw connect.
    Handshaking(Handshaking),
    /// Established connection.
    Conn(Connection),
    /// Listening service socket.
    Listener(ServiceSlot),
}

/// Who is waiting on which named event. `fire` snapshots and removes the
/// waiter set atomically, so registrations made after a fire never observe
/// it.
#[derive(Default)]
struct WaitIndex {
    /// Event name to the set of loops suspended on it.
    events: HashMap<String, HashSet<LoopId>>,
}

impl WaitIndex {
    /// Register a loop as a waiter for the named event.
    fn wait(&mut self, lp: LoopId, event: &str) {
        self.events.entry(event.to_string()).or_default().insert(lp);
    }

    /// Remove and return every loop currently waiting on the event.
    fn fire(&mut self, event: &str) -> Vec<LoopId> {
        self.events
            .remove(event)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default()
    }

    /// Remove a loop from every event set. Called as part of the wakeup
    /// rule so a resumed loop holds no stale registrations.
    fn clear(&mut self, lp: LoopId) {
        self.events.retain(|_, set| {
            set.remove(&lp);
            !set.is_empty()
        });
    }
}

pub struct Application {
    /// Reactor services: poll handle, timers, ready queue, worker pool.
    hub: Hub,
    /// Everything registered with the poller, keyed by token.
    conns: HashMap<usize, Slot>,
    /// Next connection token. Tokens are never reused, so a stale client
    /// handle can never alias a newer connection.
    next_token: usize,
    /// Every registered loop, running or suspended.
    loops: HashMap<LoopId, LoopState>,
    /// Loops whose callable is currently alive.
    running: HashSet<LoopId>,
    /// Who is waiting on which named event.
    waits: WaitIndex,
    /// Sending half of the control channel, cloned into every loop scope.
    ctrl_tx: Sender<ControlMsg>,
    /// Receiving half of the control channel, serviced while a loop runs.
    ctrl_rx: Receiver<ControlMsg>,
    /// Next loop id, monotonically increasing.
    next_loop: u64,
    /// Set by the halt primitive; `run` returns at the end of the turn.
    halted: bool,
}

impl Application {
    /// Create an application with a fresh hub, an empty loop registry and
    /// an empty connection table. The hub's worker pool starts here.
    pub fn new() -> crate::Result<Application> {
        // Control channel shared by every loop scope
        let (ctrl_tx, ctrl_rx) = unbounded();
        Ok(Application {
            hub: Hub::new()?,
            conns: HashMap::new(),
            // Token 0 belongs to the waker.
            next_token: 1,
            loops: HashMap::new(),
            running: HashSet::new(),
            waits: WaitIndex::default(),
            ctrl_tx,
            ctrl_rx,
            next_loop: 1,
            halted: false,
        })
    }

    /// Register a loop; it starts on the next hub turn.
    ///
    /// # Arguments
    /// * `lp` - Loop specification (callable, label, keep-alive flag)
    ///
    /// # Returns
    /// * The id assigned to the new loop
    pub fn add_loop(&mut self, lp: Loop) -> LoopId {
        self.register_loop(lp, None, None)
    }

    /// Bind a listening service. Every accepted connection gets its own
    /// loop running `handler` with the connection already on its stack,
    /// so the handler's I/O primitives target the peer directly.
    ///
    /// # Arguments
    /// * `addr` - Address to bind; port 0 picks a free port
    /// * `handler` - Callable run in a fresh loop per accepted connection
    ///
    /// # Returns
    /// * The bound local address
    pub fn add_service(
        &mut self,
        addr: SocketAddr,
        handler: impl Fn(&mut LoopScope) -> crate::Result<()> + Send + Sync + 'static,
    ) -> crate::Result<SocketAddr> {
        let mut listener = bind_listener(addr)?;
        let local = listener.local_addr()?;

        // Register the listener for accept readiness
        let token = self.alloc_token();
        Source::register(
            &mut listener,
            self.hub.registry(),
            Token(token),
            Interest::READABLE,
        )?;
        self.conns.insert(
            token,
            Slot::Listener(ServiceSlot {
                listener,
                handler: Arc::new(handler),
                label: format!("service:{local}"),
            }),
        );
        debug!("service listening on {local}");
        Ok(local)
    }

    /// Drive the engine until halted or until nothing can ever wake again.
    /// This call blocks; it is the scheduler thread.
    ///
    /// # Behavior
    /// * Loops registered before and during the run all get their turns
    /// * `halt` from any loop stops the run at the end of the turn
    /// * Returns cleanly once no loop, connection, timer or job remains
    pub fn run(&mut self) -> crate::Result<()> {
        self.halted = false;
        let mut events = Events::with_capacity(1024);
        while !self.halted && !self.idle() {
            self.turn(&mut events)?;
        }
        Ok(())
    }

    /// True when no loop, connection, service, timer, ready entry or
    /// in-flight thread job remains: nothing can ever produce a wake.
    fn idle(&self) -> bool {
        self.loops.is_empty() && self.conns.is_empty() && self.hub.idle()
    }

    /// One scheduler turn: poll, dispatch readiness edges, expire timers,
    /// then drain the wakes that were ready when the drain started. Wakes
    /// scheduled during the drain run on the next turn, which is what makes
    /// a zero-length sleep yield exactly one turn.
    ///
    /// # Arguments
    /// * `events` - Reused event buffer for the poll
    fn turn(&mut self, events: &mut Events) -> crate::Result<()> {
        // Don't block when wakes are already queued; otherwise sleep until
        // the next timer, capped at the idle cadence
        let timeout = if self.hub.has_ready() {
            Duration::ZERO
        } else {
            self.hub
                .next_deadline()
                .map(|d| d.min(POLL_CADENCE))
                .unwrap_or(POLL_CADENCE)
        };
        self.hub.poll(events, Some(timeout))?;

        // Readiness edges: connections, connects in flight, listeners
        for ev in events.iter() {
            let token = ev.token();
            if token == WAKER {
                // Worker completions are drained below
                continue;
            }
            let readable = ev.is_readable() || ev.is_read_closed();
            let writable = ev.is_writable() || ev.is_write_closed();
            self.dispatch(token.0, readable, writable, ev.is_error());
        }

        // Completed thread() jobs become wakes for their loops
        for (lp, seq, outcome) in self.hub.drain_thread_results() {
            self.hub.schedule(WakeEntry {
                lp,
                seq,
                value: outcome.map(WakeValue::Thread),
            });
        }

        // Expired timers: sleeps resume, stale connects are torn down
        for action in self.hub.due_timers() {
            match action {
                TimerAction::Wake { lp, seq, value } => self.hub.schedule(WakeEntry {
                    lp,
                    seq,
                    value: Ok(value),
                }),
                TimerAction::ConnectTimeout { token } => self.connect_timeout(token),
            }
        }

        // Wake the loops that were ready when the drain started; anything
        // scheduled while they run waits for the next turn
        let batch = self.hub.ready_len();
        for _ in 0..batch {
            let Some(entry) = self.hub.pop_ready() else {
                break;
            };
            self.wake(entry);
            if self.halted {
                break;
            }
        }
        Ok(())
    }

    /// Hand out the next poll token. Never reused.
    fn alloc_token(&mut self) -> usize {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    /// Create the reactor-side record for a loop and queue its start wake.
    ///
    /// # Arguments
    /// * `lp` - Loop specification
    /// * `parent` - Parent loop when forked as a child
    /// * `seed` - Connection pre-pushed on the stack (service accepts)
    fn register_loop(&mut self, lp: Loop, parent: Option<LoopId>, seed: Option<usize>) -> LoopId {
        let id = LoopId(self.next_loop);
        self.next_loop += 1;

        // Private resume channel; the receiver moves to the thread at spawn
        let (resume_tx, resume_rx) = unbounded();

        // Not started yet; the stack may be pre-seeded by a service accept
        let state = LoopState {
            label: lp.label.clone(),
            base_label: lp.label,
            callable: lp.callable,
            keep_alive: lp.keep_alive,
            running: false,
            started: false,
            seq: 0,
            resume: Some(resume_tx),
            resume_rx: Some(resume_rx),
            wakeup_timer: None,
            stack: seed.into_iter().collect(),
            tagged_wait: false,
            parent,
            children: HashSet::new(),
        };
        if let Some(p) = parent {
            if let Some(ps) = self.loops.get_mut(&p) {
                ps.children.insert(id);
            }
        }
        self.loops.insert(id, state);

        // Immediate wake so the new loop starts on the next turn
        self.hub.schedule(WakeEntry {
            lp: id,
            seq: 0,
            value: Ok(WakeValue::Ready),
        });
        trace!("loop {id} registered");
        id
    }

    // ---- readiness dispatch -------------------------------------------

    /// Route one poll event to whatever owns the token: a listener accepts,
    /// a connect in flight advances, an established connection handles its
    /// readable/writable/error edges.
    ///
    /// # Arguments
    /// * `key` - Poll token the event arrived on
    /// * `readable` / `writable` / `errored` - Decoded readiness flags
    fn dispatch(&mut self, key: usize, readable: bool, writable: bool, errored: bool) {
        enum Kind {
            Listener,
            Connecting,
            Handshaking,
            Conn,
        }
        let kind = match self.conns.get(&key) {
            None => return,
            Some(Slot::Listener(_)) => Kind::Listener,
            Some(Slot::Connecting(_)) => Kind::Connecting,
            Some(Slot::Handshaking(_)) => Kind::Handshaking,
            Some(Slot::Conn(_)) => Kind::Conn,
        };
        match kind {
            Kind::Listener => self.accept_burst(key),
            Kind::Connecting => self.connect_edge(key, readable, writable, errored),
            Kind::Handshaking => self.handshake_edge(key),
            Kind::Conn => {
                let Some(Slot::Conn(conn)) = self.conns.get_mut(&key) else {
                    return;
                };
                let registry = self.hub.registry();

                // Handlers never resume loops themselves; they hand back
                // wake directives delivered once the borrows are released
                let mut wakes = Vec::new();
                if errored {
                    wakes.extend(conn.handle_error(registry));
                }
                if readable {
                    wakes.extend(conn.handle_read(registry));
                }
                if writable {
                    wakes.extend(conn.handle_write(registry));
                }
                if conn.is_closed() {
                    // Drops the transport, which closes the socket.
                    self.conns.remove(&key);
                }
                for (waiter, reply) in wakes {
                    self.deliver(waiter, reply);
                }
            }
        }
    }

    /// Queue the wake an edge handler produced. The waiter carries the
    /// sequence it was armed with, so a stale delivery is dropped later.
    fn deliver(&mut self, waiter: Waiter, reply: Reply) {
        self.hub.schedule(WakeEntry {
            lp: waiter.lp,
            seq: waiter.seq,
            value: reply,
        });
    }

    /// Accept until the listener would block, creating a connection and a
    /// handler loop for each peer.
    fn accept_burst(&mut self, key: usize) {
        loop {
            // Take what we need out of the slot before touching the table
            let accepted = match self.conns.get_mut(&key) {
                Some(Slot::Listener(svc)) => match svc.listener.accept() {
                    Ok((stream, peer)) => Ok((stream, peer, svc.handler.clone(), svc.label.clone())),
                    Err(e) => Err(e),
                },
                _ => return,
            };
            match accepted {
                Ok((mut stream, peer, handler, label)) => {
                    // Lower latency for chatty line protocols
                    stream.set_nodelay(true).ok();
                    let token = self.alloc_token();
                    if let Err(e) = Source::register(
                        &mut stream,
                        self.hub.registry(),
                        Token(token),
                        Interest::READABLE,
                    ) {
                        error!("register failed for {peer}: {e}");
                        continue;
                    }
                    let conn = Connection::new(Box::new(stream), peer, Token(token));
                    self.conns.insert(token, Slot::Conn(conn));

                    // The handler loop starts with the connection already
                    // on its stack
                    let lp = Loop {
                        callable: handler,
                        label: format!("{label} peer={peer}"),
                        keep_alive: false,
                    };
                    self.register_loop(lp, None, Some(token));
                }
                // Nothing left to accept right now
                Err(ref e) if would_block(e) => break,
                Err(e) => {
                    error!("accept error: {e}");
                    break;
                }
            }
        }
    }

    /// Advance an in-flight connect on a readiness edge: failure on error
    /// or premature data, completion on writable, otherwise keep waiting.
    fn connect_edge(&mut self, key: usize, readable: bool, writable: bool, errored: bool) {
        let mut c = match self.conns.remove(&key) {
            Some(Slot::Connecting(c)) => c,
            Some(other) => {
                self.conns.insert(key, other);
                return;
            }
            None => return,
        };
        if errored || (readable && !writable) {
            // Data or an error before the connect completed: failure.
            if let Some(timer) = c.timer.take() {
                timer.cancel();
            }
            let _ = Source::deregister(&mut c.stream, self.hub.registry());

            // The suspended connect resumes with a connect error
            self.hub.schedule(WakeEntry {
                lp: c.lp,
                seq: c.seq,
                value: Err(Error::Connect("connection refused".to_string())),
            });
            return;
        }
        if !writable {
            // Spurious edge; keep waiting for the connect to resolve
            self.conns.insert(key, Slot::Connecting(c));
            return;
        }

        // Connect completed; verify before trusting the writable edge
        if let Some(timer) = c.timer.take() {
            timer.cancel();
        }
        // A writable edge alone is not proof with epoll; check the socket
        // error slot and the peer address before trusting it
        let verify = c
            .stream
            .take_error()
            .and_then(|soft| match soft {
                Some(e) => Err(e),
                None => c.stream.peer_addr().map(|_| ()),
            });
        if let Err(e) = verify {
            let _ = Source::deregister(&mut c.stream, self.hub.registry());
            self.hub.schedule(WakeEntry {
                lp: c.lp,
                seq: c.seq,
                value: Err(Error::Connect(e.to_string())),
            });
            return;
        }
        // Plain TCP installs directly; a supplied handshake runs first
        match c.handshake.take() {
            None => self.install_connection(key, Box::new(c.stream), c.addr, c.lp, c.seq),
            Some(driver) => self.drive_handshake(key, driver, c.stream, c.addr, c.lp, c.seq),
        }
    }

    /// Hand the next readiness edge to the handshake provider.
    fn handshake_edge(&mut self, key: usize) {
        let hs = match self.conns.remove(&key) {
            Some(Slot::Handshaking(hs)) => hs,
            Some(other) => {
                self.conns.insert(key, other);
                return;
            }
            None => return,
        };
        self.drive_handshake(key, hs.driver, hs.stream, hs.addr, hs.lp, hs.seq);
    }

    /// Run one handshake step and act on the outcome: re-arm the socket
    /// while pending, install the connection when done, wake the loop with
    /// a connect error on failure.
    fn drive_handshake(
        &mut self,
        key: usize,
        mut driver: Box<dyn Handshake>,
        stream: TcpStream,
        addr: SocketAddr,
        lp: LoopId,
        seq: u64,
    ) {
        match driver.drive(stream) {
            // Not done yet: re-arm with whatever the provider wants next
            HandshakeStep::Pending {
                mut stream,
                interest,
            } => {
                if let Err(e) =
                    Source::reregister(&mut stream, self.hub.registry(), Token(key), interest)
                {
                    self.hub.schedule(WakeEntry {
                        lp,
                        seq,
                        value: Err(Error::Connect(e.to_string())),
                    });
                    return;
                }
                self.conns.insert(
                    key,
                    Slot::Handshaking(Handshaking {
                        driver,
                        stream,
                        addr,
                        lp,
                        seq,
                    }),
                );
            }
            // The transport now carries the session
            HandshakeStep::Done(transport) => {
                self.install_connection(key, transport, addr, lp, seq)
            }
            // The provider consumed and closed the socket
            HandshakeStep::Failed { error } => self.hub.schedule(WakeEntry {
                lp,
                seq,
                value: Err(Error::Connect(error.to_string())),
            }),
        }
    }

    /// Turn a completed connect into an established connection and wake
    /// the suspended loop with its token.
    fn install_connection(
        &mut self,
        key: usize,
        mut transport: Box<dyn Transport>,
        addr: SocketAddr,
        lp: LoopId,
        seq: u64,
    ) {
        // Back to read-only interest; writable is enabled on demand
        if let Err(e) = transport.reregister(self.hub.registry(), Token(key), Interest::READABLE) {
            self.hub.schedule(WakeEntry {
                lp,
                seq,
                value: Err(Error::Connect(e.to_string())),
            });
            return;
        }
        let conn = Connection::new(transport, addr, Token(key));
        self.conns.insert(key, Slot::Conn(conn));
        debug!("connection {key} established to {addr}");

        // The suspended connect resumes with the connection's token
        self.hub.schedule(WakeEntry {
            lp,
            seq,
            value: Ok(WakeValue::Conn(key)),
        });
    }

    /// The connect timeout expired: close the socket, deregister, and wake
    /// the loop with a timeout error.
    fn connect_timeout(&mut self, token: usize) {
        // Only still-connecting sockets time out; a token that has since
        // established or failed is left alone.
        if !matches!(self.conns.get(&token), Some(Slot::Connecting(_))) {
            return;
        }
        let Some(Slot::Connecting(mut c)) = self.conns.remove(&token) else {
            return;
        };
        let _ = Source::deregister(&mut c.stream, self.hub.registry());
        self.hub.schedule(WakeEntry {
            lp: c.lp,
            seq: c.seq,
            value: Err(Error::ConnectTimeout),
        });
        // Dropping the stream closes the socket, exactly once.
    }

    // ---- waking -------------------------------------------------------

    /// Resume a loop with a value or an error. Before user code observes
    /// anything, every other armed source is cancelled: the wakeup timer,
    /// the buffer term and waiter on the top-of-stack connection, the wait
    /// index registrations. Stale wakes (sequence mismatch) are dropped.
    ///
    /// The first wake of a loop spawns its thread instead of sending a
    /// resume value; either way, this call does not return until the loop
    /// suspends again or finishes.
    fn wake(&mut self, entry: WakeEntry) {
        let (start, top) = {
            let Some(state) = self.loops.get_mut(&entry.lp) else {
                return;
            };
            if state.seq != entry.seq {
                // Another armed source won the race; this edge is silenced
                trace!("dropping stale wake for loop {}", entry.lp);
                return;
            }
            // Bump the sequence so every other armed source goes stale
            state.seq += 1;
            if let Some(timer) = state.wakeup_timer.take() {
                timer.cancel();
            }
            state.tagged_wait = false;
            (!state.started, state.stack.last().copied())
        };

        // Disarm the input term and waiter on the target connection
        if let Some(top) = top {
            if let Some(Slot::Conn(conn)) = self.conns.get_mut(&top) {
                conn.buffer.clear_term();
                conn.waiter = None;
            }
        }
        self.waits.clear(entry.lp);

        if start {
            // First wake: spawn the thread; the callable runs immediately
            let (resume_rx, callable, label) = {
                let state = self.loops.get_mut(&entry.lp).expect("loop state");
                state.started = true;
                state.running = true;
                (
                    state.resume_rx.take().expect("resume receiver"),
                    state.callable.clone(),
                    state.label.clone(),
                )
            };
            self.running.insert(entry.lp);
            let scope = LoopScope::new(entry.lp, self.ctrl_tx.clone(), resume_rx);
            let spawned = std::thread::Builder::new()
                .name(format!("weft-loop-{}", entry.lp))
                .spawn(move || run_loop(scope, callable));
            match spawned {
                Ok(_) => debug!("loop {} <{label}> started", entry.lp),
                Err(e) => {
                    // Treat an unspawnable loop like one that crashed
                    error!("failed to spawn thread for loop <{label}>: {e}");
                    self.finish_loop(entry.lp, Err(Error::Io(e)));
                    return;
                }
            }
        } else {
            // Resume the suspended primitive with the delivered value
            let state = self.loops.get(&entry.lp).expect("loop state");
            let delivered = match &state.resume {
                Some(tx) => tx.send(entry.value).is_ok(),
                None => false,
            };
            if !delivered {
                // The loop thread is gone; nothing will talk to us.
                return;
            }
        }
        self.service_active();
    }

    /// Service the active loop's requests until it suspends or finishes.
    /// While this runs, every other loop thread is blocked on its resume
    /// channel, so the active loop is the only possible sender.
    fn service_active(&mut self) {
        loop {
            // Blocks until the active loop speaks; every other loop thread
            // is parked on its resume channel
            let msg = match self.ctrl_rx.recv() {
                Ok(msg) => msg,
                Err(_) => return,
            };
            match msg {
                // The callable returned (or crashed); run the exit path
                ControlMsg::Done { id, outcome } => {
                    self.finish_loop(id, outcome);
                    return;
                }
                // Answer immediately or leave the loop suspended
                ControlMsg::Request { id, req } => {
                    let suspended = self.handle_request(id, req);
                    if suspended {
                        return;
                    }
                }
            }
        }
    }

    // ---- request handling ---------------------------------------------

    /// Handle one request from the active loop. Returns true when the loop
    /// suspended (the reply will come from a future wake), false when it
    /// was answered immediately.
    fn handle_request(&mut self, id: LoopId, req: Request) -> bool {
        match req {
            // Install a term, suspend unless already satisfied
            Request::Input { source, term } => self.req_input(id, source, term),

            // Arm several sources at once; first edge wins
            Request::First {
                sleep,
                waits,
                input,
            } => self.req_first(id, sleep, waits, input),

            // Enqueue outbound bytes; answered immediately
            Request::Send { data, priority } => {
                let reply = self.req_send(id, data, priority);
                self.reply(id, reply);
                false
            }

            // Timer or next-turn reschedule
            Request::Sleep(duration) => {
                self.arm_sleep(id, duration, WakeValue::Ready);
                true
            }

            // Register in the wait index and suspend
            Request::Wait(event) => {
                self.arm_wait(id, &event, false);
                true
            }

            // Deliver to current waiters; never suspends
            Request::Fire { event, value } => {
                self.do_fire(&event, value);
                self.reply(id, Ok(WakeValue::Ready));
                false
            }

            // Off-load to the worker pool and suspend until it finishes
            Request::Thread(job) => {
                let seq = self.seq_of(id);
                self.hub.run_in_thread(id, seq, job);
                true
            }
            // Start a non-blocking connect and suspend until it resolves
            Request::Connect {
                stream,
                addr,
                timeout,
                handshake,
            } => {
                self.req_connect(id, stream, addr, timeout, handshake);
                true
            }

            // Register a new loop; it starts on the next turn
            Request::Fork { lp, child } => {
                let parent = child.then_some(id);
                let forked = self.register_loop(lp, parent, None);
                self.reply(id, Ok(WakeValue::Forked(forked)));
                false
            }

            // Rename the loop; shows up in subsequent logs
            Request::Label(label) => {
                if let Some(state) = self.loops.get_mut(&id) {
                    state.label = label;
                }
                self.reply(id, Ok(WakeValue::Ready));
                false
            }

            // Connection stack discipline for client wrappers
            Request::PushConn(token) => {
                if let Some(state) = self.loops.get_mut(&id) {
                    state.stack.push(token);
                }
                self.reply(id, Ok(WakeValue::Ready));
                false
            }
            Request::PopConn => {
                // Popping an empty stack is a programmer error; the scope
                // turns the reply into a panic
                let popped = self
                    .loops
                    .get_mut(&id)
                    .and_then(|state| state.stack.pop())
                    .is_some();
                let reply = if popped {
                    Ok(WakeValue::Ready)
                } else {
                    Err(Error::NoConnection)
                };
                self.reply(id, reply);
                false
            }
            // Flush-then-close on a client's connection
            Request::ConnClose(token) => {
                self.close_conn(token);
                self.reply(id, Ok(WakeValue::Ready));
                false
            }

            // Liveness query; a vacant token counts as closed
            Request::ConnClosed(token) => {
                let closed = !matches!(
                    self.conns.get(&token),
                    Some(Slot::Conn(conn)) if !conn.is_closed()
                );
                self.reply(id, Ok(WakeValue::Flag(closed)));
                false
            }

            // Remote address of the top-of-stack connection
            Request::PeerAddr => {
                let reply = self
                    .top_conn_token(id)
                    .and_then(|token| match self.conns.get(&token) {
                        Some(Slot::Conn(conn)) => Ok(WakeValue::Addr(conn.addr())),
                        _ => Err(Error::ConnectionClosed(None)),
                    });
                self.reply(id, reply);
                false
            }
            // Stop the application at the end of the current turn
            Request::Halt => {
                self.halted = true;
                self.reply(id, Ok(WakeValue::Ready));
                false
            }
        }
    }

    /// Answer the active loop immediately, without a wake.
    fn reply(&mut self, id: LoopId, reply: Reply) {
        if let Some(state) = self.loops.get(&id) {
            if let Some(tx) = &state.resume {
                let _ = tx.send(reply);
            }
        }
    }

    /// Current wake sequence of a loop, captured when arming a source.
    fn seq_of(&self, id: LoopId) -> u64 {
        self.loops.get(&id).map(|s| s.seq).unwrap_or(0)
    }

    /// Token of the loop's top-of-stack connection. An empty stack is a
    /// programmer error the scope turns into a panic.
    fn top_conn_token(&self, id: LoopId) -> crate::Result<usize> {
        self.loops
            .get(&id)
            .and_then(|state| state.stack.last().copied())
            .ok_or(Error::NoConnection)
    }

    /// Install a term on the top-of-stack connection. Returns synchronously
    /// when the buffer already satisfies it (the term is cleared here, since
    /// no wake will run the clear-pending step); otherwise arms the waiter.
    ///
    /// # Arguments
    /// * `id` - The requesting loop
    /// * `source` - How to tag the chunk on delivery
    /// * `term` - Delimiter or byte count to match
    ///
    /// # Returns
    /// * True when the loop suspended, false when answered immediately
    fn req_input(&mut self, id: LoopId, source: InputSource, term: Term) -> bool {
        let seq = self.seq_of(id);
        let top = match self.top_conn_token(id) {
            Ok(top) => top,
            Err(e) => {
                self.reply(id, Err(e));
                return false;
            }
        };
        let conn = match self.conns.get_mut(&top) {
            Some(Slot::Conn(conn)) if !conn.is_closed() => conn,
            _ => {
                self.reply(id, Err(Error::ConnectionClosed(None)));
                return false;
            }
        };
        conn.buffer.set_term(term);
        if let Some(chunk) = conn.buffer.check() {
            // Already buffered: answer without suspending
            conn.buffer.clear_term();
            let value = source.deliver(chunk);
            self.reply(id, Ok(value));
            return false;
        }

        // Suspend until the read edge satisfies the term
        conn.waiter = Some(Waiter {
            lp: id,
            seq,
            source,
        });
        true
    }

    /// Arm up to one input source plus an optional sleep plus any number of
    /// waits. An already-satisfied input short-circuits before the other
    /// sources are armed.
    ///
    /// # Arguments
    /// * `sleep` - Optional timer source; zero means next turn
    /// * `waits` - Event names to register, each a tagged wait
    /// * `input` - At most one input form, pre-validated by the builder
    fn req_first(
        &mut self,
        id: LoopId,
        sleep: Option<Duration>,
        waits: Vec<String>,
        input: Option<(InputSource, Term)>,
    ) -> bool {
        if let Some((source, term)) = input {
            let seq = self.seq_of(id);
            let top = match self.top_conn_token(id) {
                Ok(top) => top,
                Err(e) => {
                    self.reply(id, Err(e));
                    return false;
                }
            };
            let conn = match self.conns.get_mut(&top) {
                Some(Slot::Conn(conn)) if !conn.is_closed() => conn,
                _ => {
                    self.reply(id, Err(Error::ConnectionClosed(None)));
                    return false;
                }
            };
            conn.buffer.set_term(term);
            if let Some(chunk) = conn.buffer.check() {
                // Satisfied input short-circuits; sleep and waits are
                // never armed
                conn.buffer.clear_term();
                let value = source.deliver(chunk);
                self.reply(id, Ok(value));
                return false;
            }
            conn.waiter = Some(Waiter {
                lp: id,
                seq,
                source,
            });
        }
        if let Some(duration) = sleep {
            self.arm_sleep(id, duration, WakeValue::First(FirstOf::Sleep));
        }
        for event in &waits {
            self.arm_wait(id, event, true);
        }
        true
    }

    /// Queue outbound bytes on the top-of-stack connection and make sure
    /// the write edge will run.
    fn req_send(&mut self, id: LoopId, data: bytes::Bytes, priority: u8) -> Reply {
        let top = self.top_conn_token(id)?;
        let conn = match self.conns.get_mut(&top) {
            Some(Slot::Conn(conn)) if !conn.is_closed() => conn,
            _ => return Err(Error::ConnectionClosed(None)),
        };
        conn.pipeline.add(data, priority);
        conn.set_writable(self.hub.registry(), true);
        Ok(WakeValue::Ready)
    }

    /// Arm the loop's single wakeup timer, or an immediate reschedule for
    /// a zero duration.
    fn arm_sleep(&mut self, id: LoopId, duration: Duration, value: WakeValue) {
        let seq = self.seq_of(id);
        if duration.is_zero() {
            // Yield exactly one turn
            self.hub.schedule(WakeEntry {
                lp: id,
                seq,
                value: Ok(value),
            });
        } else {
            let handle = self
                .hub
                .call_later(duration, TimerAction::Wake { lp: id, seq, value });
            if let Some(state) = self.loops.get_mut(&id) {
                state.wakeup_timer = Some(handle);
            }
        }
    }

    /// Register interest in a named event, remembering whether the resume
    /// value should carry a `first` tag.
    fn arm_wait(&mut self, id: LoopId, event: &str, tagged: bool) {
        self.waits.wait(id, event);
        if let Some(state) = self.loops.get_mut(&id) {
            state.tagged_wait = tagged;
        }
    }

    /// Deliver a fired value to exactly the loops registered right now.
    /// Each waiter gets a clone of the same shared value.
    fn do_fire(&mut self, event: &str, value: FireValue) {
        for lp in self.waits.fire(event) {
            let Some(state) = self.loops.get(&lp) else {
                continue;
            };
            let delivered = if state.tagged_wait {
                WakeValue::First(FirstOf::Wait(event.to_string(), value.clone()))
            } else {
                WakeValue::Fired(value.clone())
            };
            self.hub.schedule(WakeEntry {
                lp,
                seq: state.seq,
                value: Ok(delivered),
            });
        }
    }

    /// Register an in-flight connect with the poller and arm its optional
    /// timeout timer.
    fn req_connect(
        &mut self,
        id: LoopId,
        mut stream: TcpStream,
        addr: SocketAddr,
        timeout: Option<Duration>,
        handshake: Option<Box<dyn Handshake>>,
    ) {
        let seq = self.seq_of(id);
        let token = self.alloc_token();

        // Writable fires when the connect resolves; readable or error
        // before that means failure
        if let Err(e) = Source::register(
            &mut stream,
            self.hub.registry(),
            Token(token),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.hub.schedule(WakeEntry {
                lp: id,
                seq,
                value: Err(Error::Connect(e.to_string())),
            });
            return;
        }
        // Arm the optional timeout; it is cancelled on any other outcome
        let timer = timeout.map(|t| {
            self.hub
                .call_later(t, TimerAction::ConnectTimeout { token })
        });
        self.conns.insert(
            token,
            Slot::Connecting(Connecting {
                stream,
                addr,
                lp: id,
                seq,
                timer,
                handshake,
            }),
        );
    }

    /// Graceful local close: queued data flushes, then the write edge tears
    /// the connection down. A vacant or non-established token is a no-op.
    fn close_conn(&mut self, token: usize) {
        if let Some(Slot::Conn(conn)) = self.conns.get_mut(&token) {
            conn.close(self.hub.registry());
        }
    }

    // ---- loop lifecycle -----------------------------------------------

    /// A loop's thread finished. Close its remaining stacked connection,
    /// notify running children, detach from the parent, and either forget
    /// the loop or schedule its keep-alive restart.
    ///
    /// # Arguments
    /// * `id` - The loop that ended
    /// * `outcome` - What its callable returned; panics arrive as errors
    fn finish_loop(&mut self, id: LoopId, outcome: crate::Result<()>) {
        let Some(state) = self.loops.get_mut(&id) else {
            return;
        };
        state.running = false;
        self.running.remove(&id);

        // Terminate is a clean exit; anything else gets the error log
        match &outcome {
            Ok(()) | Err(Error::Terminate) => trace!("loop {id} <{}> finished", state.label),
            Err(e) => error!("unhandled failure in loop <{}>: {e}", state.label),
        }

        // A client wrapper that unwound mid-call can leave its connection
        // pushed; close exactly that one
        let leftover: Vec<usize> = state.stack.drain(..).collect();
        debug_assert!(
            leftover.len() <= 1,
            "loop {id} ended with {} stacked connections",
            leftover.len()
        );
        let children: Vec<LoopId> = state.children.drain().collect();
        let parent = state.parent.take();
        for token in leftover {
            self.close_conn(token);
        }
        // Running children observe the death at their next resume
        for child in children {
            if let Some(cs) = self.loops.get_mut(&child) {
                cs.parent = None;
                if cs.running {
                    let seq = cs.seq;
                    self.hub.schedule(WakeEntry {
                        lp: child,
                        seq,
                        value: Err(Error::ParentDied),
                    });
                }
            }
        }
        // Detach from the parent's child set, if it is still around
        if let Some(p) = parent {
            if let Some(ps) = self.loops.get_mut(&p) {
                ps.children.remove(&id);
            }
        }

        let state = self.loops.get_mut(&id).expect("loop state");
        if state.keep_alive {
            warn!(
                "{} for <{}>; scheduling wake in {:?}",
                Error::KeepAlive,
                state.label,
                RESTART_DELAY
            );
            // Reset to the registered state: original label, fresh resume
            // channel, same callable
            state.label = state.base_label.clone();
            state.started = false;
            state.seq += 1;
            let (resume_tx, resume_rx) = unbounded();
            state.resume = Some(resume_tx);
            state.resume_rx = Some(resume_rx);
            state.wakeup_timer = None;
            state.tagged_wait = false;
            let seq = state.seq;
            self.hub.call_later(
                RESTART_DELAY,
                TimerAction::Wake {
                    lp: id,
                    seq,
                    value: WakeValue::Ready,
                },
            );
        } else {
            self.loops.remove(&id);
        }
    }
}

/// Bind a non-blocking, reuse-address listener and hand it to mio.
///
/// # Arguments
/// * `addr` - Socket address to bind to
///
/// # Returns
/// * Bound listener ready for registration with the poller
fn bind_listener(addr: SocketAddr) -> crate::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    // Reuse-address so restarts don't trip over TIME_WAIT
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into()))
}
