/*!
 * Event Hub
 *
 * The reactor's services: the mio poll handle, a cancellable timer heap,
 * the ready queue of pending loop wakes, and a worker pool for off-thread
 * jobs. Workers hand results back over a channel and nudge the poller with
 * a waker, so completions are picked up on the next turn.
 */

use crate::error::Error;
use crate::loops::{panic_message, LoopId, ThreadJob, WakeValue};
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use log::trace;
use mio::{Events, Poll, Registry, Token, Waker};
use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token reserved for the cross-thread waker.
pub(crate) const WAKER: Token = Token(0);

/// What to do when a timer expires. Explicit actions instead of closures so
/// the reactor stays the only thing that touches its own state.
pub(crate) enum TimerAction {
    /// Resume a loop, provided its wake sequence still matches.
    Wake {
        lp: LoopId,
        seq: u64,
        value: WakeValue,
    },
    /// Give up on an in-progress connect.
    ConnectTimeout { token: usize },
}

/// A pending loop resumption. `seq` must match the loop's current wake
/// sequence for the entry to deliver; stale entries are dropped silently.
pub(crate) struct WakeEntry {
    /// Loop to resume.
    pub lp: LoopId,
    /// Wake sequence captured when the source was armed.
    pub seq: u64,
    /// Value or error to deliver into the suspended primitive.
    pub value: Result<WakeValue, Error>,
}

/// Cancellable handle returned by `call_later`. The flag flips once the
/// timer fires or is cancelled.
pub(crate) struct TimerHandle {
    /// Shared with the heap entry; true means fired or cancelled.
    done: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.done.store(true, AtomicOrdering::Relaxed);
    }

    #[allow(dead_code)]
    pub fn pending(&self) -> bool {
        !self.done.load(AtomicOrdering::Relaxed)
    }
}

/// One armed timer in the heap.
struct TimerEntry {
    /// Absolute deadline.
    at: Instant,
    /// Tie-breaker so the heap ordering is total.
    id: u64,
    /// Shared fired-or-cancelled flag; dead entries are skipped lazily.
    done: Arc<AtomicBool>,
    /// What to do at expiry.
    action: TimerAction,
}

impl TimerEntry {
    fn dead(&self) -> bool {
        self.done.load(AtomicOrdering::Relaxed)
    }
}

// Min-heap on (deadline, id); the id breaks ties so ordering is total.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl Eq for TimerEntry {}

type ThreadResult = (LoopId, u64, Result<Box<dyn Any + Send>, Error>);

pub(crate) struct Hub {
    /// The mio poll handle every socket registers with.
    poll: Poll,
    /// Armed timers, earliest deadline first.
    timers: BinaryHeap<TimerEntry>,
    /// Next timer id, monotonically increasing.
    next_timer: u64,
    /// Wakes queued for the next scheduler turn.
    ready: VecDeque<WakeEntry>,
    /// Sending half of the worker pool's job channel.
    jobs: Sender<(LoopId, u64, ThreadJob)>,
    /// Completions coming back from the workers.
    results: Receiver<ThreadResult>,
    /// Jobs handed to the pool and not yet drained back.
    in_flight: usize,
}

impl Hub {
    /// Create the poll handle, the waker, and the worker pool.
    ///
    /// # Returns
    /// * A hub with workers already running and waiting for jobs
    pub fn new() -> io::Result<Hub> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (jobs_tx, jobs_rx) = unbounded::<(LoopId, u64, ThreadJob)>();
        let (results_tx, results_rx) = unbounded();

        // Worker pool for thread() off-loads, sized to the machine.
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        for i in 0..workers {
            let jobs = jobs_rx.clone();
            let results = results_tx.clone();
            let waker = Arc::clone(&waker);
            std::thread::Builder::new()
                .name(format!("weft-worker-{i}"))
                .spawn(move || {
                    // Run jobs until the hub is dropped; a panicking job
                    // resumes its loop with an error instead of dying here
                    while let Ok((lp, seq, job)) = jobs.recv() {
                        let out = catch_unwind(AssertUnwindSafe(job))
                            .unwrap_or_else(|p| Err(Error::Panicked(panic_message(&*p))));
                        // Nudge the poller so the completion is seen now,
                        // not at the next cadence tick
                        if results.send((lp, seq, out)).is_ok() {
                            let _ = waker.wake();
                        }
                    }
                })?;
        }

        Ok(Hub {
            poll,
            timers: BinaryHeap::new(),
            next_timer: 0,
            ready: VecDeque::new(),
            jobs: jobs_tx,
            results: results_rx,
            in_flight: 0,
        })
    }

    /// Registration handle for sockets.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Block for readiness events up to the timeout. A signal interrupting
    /// the poll is not an error, just an empty batch.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            other => other,
        }
    }

    /// Arm a one-shot timer.
    ///
    /// # Arguments
    /// * `delay` - How long from now the timer fires
    /// * `action` - What the reactor does at expiry
    ///
    /// # Returns
    /// * A handle whose `cancel` turns the entry into a no-op
    pub fn call_later(&mut self, delay: Duration, action: TimerAction) -> TimerHandle {
        let done = Arc::new(AtomicBool::new(false));
        self.timers.push(TimerEntry {
            at: Instant::now() + delay,
            id: self.next_timer,
            done: Arc::clone(&done),
            action,
        });
        self.next_timer += 1;
        TimerHandle { done }
    }

    /// Queue a wake for the next turn.
    pub fn schedule(&mut self, entry: WakeEntry) {
        self.ready.push_back(entry);
    }

    /// True when wakes are queued, so the poll should not block.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Number of wakes queued right now; the turn drains exactly this many
    /// so late arrivals wait for the next turn.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn pop_ready(&mut self) -> Option<WakeEntry> {
        self.ready.pop_front()
    }

    /// Time until the next live timer, if any. Cancelled entries found at
    /// the head of the heap are discarded along the way.
    pub fn next_deadline(&mut self) -> Option<Duration> {
        loop {
            let head = self.timers.peek()?;
            if head.dead() {
                self.timers.pop();
                continue;
            }
            return Some(head.at.saturating_duration_since(Instant::now()));
        }
    }

    /// Pop every live timer that has expired.
    ///
    /// # Returns
    /// * The actions to run, in deadline order
    pub fn due_timers(&mut self) -> Vec<TimerAction> {
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(head) = self.timers.peek() {
            if head.dead() {
                // Cancelled; drop it without running anything
                self.timers.pop();
                continue;
            }
            if head.at > now {
                break;
            }
            let entry = self.timers.pop().expect("peeked timer");
            // Mark fired so the handle's pending() goes false
            entry.done.store(true, AtomicOrdering::Relaxed);
            due.push(entry.action);
        }
        due
    }

    /// Hand a job to the worker pool. The owning loop stays suspended until
    /// the result comes back through `drain_thread_results`.
    ///
    /// # Arguments
    /// * `lp` / `seq` - The suspended loop and its captured wake sequence
    /// * `job` - The boxed work to run off-thread
    pub fn run_in_thread(&mut self, lp: LoopId, seq: u64, job: ThreadJob) {
        self.in_flight += 1;
        if self.jobs.send((lp, seq, job)).is_err() {
            trace!("worker pool gone; dropping job for loop {lp}");
            self.in_flight -= 1;
        }
    }

    /// Collect every completed job without blocking. Called each turn; the
    /// waker guarantees a poll wakes up promptly when results arrive.
    pub fn drain_thread_results(&mut self) -> Vec<ThreadResult> {
        let mut out = Vec::new();
        loop {
            match self.results.try_recv() {
                Ok(result) => {
                    self.in_flight -= 1;
                    out.push(result);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// True when nothing in the hub can ever produce another wake.
    pub fn idle(&self) -> bool {
        self.in_flight == 0 && self.ready.is_empty() && self.timers.iter().all(TimerEntry::dead)
    }
}
