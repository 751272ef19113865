//! Per-instance execution context.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use parking_lot::Condvar;
use parking_lot::Mutex;

/// Lifecycle of a live instance.
///
/// ```text
/// Uninitialized -> Created -> Active <-> Recovering
///                               |
///                          Terminating -> Terminated
/// ```
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum InstanceState {
    Uninitialized,
    Created,
    Active,
    Recovering,
    Terminating,
    Terminated,
}

struct Phase {
    state: InstanceState,
    in_flight: usize,
}

/// Execution context of one live instance.
///
/// Holds the lifecycle state, the count of in-flight invocations, and the
/// ticket counters used to run ordered invocations in issue order.
///
/// # Ordering
///
/// A ticket is drawn on the caller's thread when the call is issued, before
/// any hand-off to a worker. Executions then wait until `serving` reaches
/// their ticket, so issue order and execution order coincide even when
/// workers are scheduled out of order.
pub struct InstanceCtx {
    phase: Mutex<Phase>,
    phase_changed: Condvar,
    next_ticket: AtomicU64,
    serving: Mutex<u64>,
    turn_changed: Condvar,
}

impl InstanceCtx {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase {
                state: InstanceState::Uninitialized,
                in_flight: 0,
            }),
            phase_changed: Condvar::new(),
            next_ticket: AtomicU64::new(0),
            serving: Mutex::new(0),
            turn_changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> InstanceState {
        self.phase.lock().state
    }

    pub fn in_flight(&self) -> usize {
        self.phase.lock().in_flight
    }

    fn set(&self, state: InstanceState) {
        self.phase.lock().state = state;
        self.phase_changed.notify_all();
    }

    pub(crate) fn mark_created(&self) {
        self.set(InstanceState::Created);
    }

    pub(crate) fn activate(&self) {
        self.set(InstanceState::Active);
    }

    /// Admits one invocation.
    ///
    /// Blocks while the instance is recovering. Returns the blocking state if
    /// the instance is not accepting calls.
    pub(crate) fn enter(&self) -> Result<InvokeGuard<'_>, InstanceState> {
        let mut phase = self.phase.lock();
        while phase.state == InstanceState::Recovering {
            self.phase_changed.wait(&mut phase);
        }
        match phase.state {
            InstanceState::Active => {
                phase.in_flight += 1;
                Ok(InvokeGuard { ctx: self })
            }
            other => Err(other),
        }
    }

    fn leave(&self) {
        let mut phase = self.phase.lock();
        phase.in_flight -= 1;
        if phase.in_flight == 0 {
            self.phase_changed.notify_all();
        }
    }

    fn wait_idle(&self, phase: &mut parking_lot::MutexGuard<'_, Phase>) {
        while phase.in_flight > 0 {
            self.phase_changed.wait(phase);
        }
    }

    /// Moves an active instance to `Recovering` once in-flight calls drain.
    ///
    /// Returns `false` if the instance was not active.
    pub(crate) fn begin_recover(&self) -> bool {
        let mut phase = self.phase.lock();
        if phase.state != InstanceState::Active {
            return false;
        }
        phase.state = InstanceState::Recovering;
        self.wait_idle(&mut phase);
        true
    }

    pub(crate) fn end_recover(&self) {
        let mut phase = self.phase.lock();
        if phase.state == InstanceState::Recovering {
            phase.state = InstanceState::Active;
        }
        drop(phase);
        self.phase_changed.notify_all();
    }

    /// Claims the instance for termination.
    ///
    /// Returns `false` if another caller already did.
    pub(crate) fn begin_terminate(&self) -> bool {
        let mut phase = self.phase.lock();
        match phase.state {
            InstanceState::Terminating | InstanceState::Terminated => false,
            _ => {
                phase.state = InstanceState::Terminating;
                drop(phase);
                self.phase_changed.notify_all();
                true
            }
        }
    }

    /// Waits for in-flight calls to drain.
    pub(crate) fn drain(&self) {
        let mut phase = self.phase.lock();
        self.wait_idle(&mut phase);
    }

    pub(crate) fn finish_terminate(&self) {
        self.set(InstanceState::Terminated);
    }

    /// Draws the next issue-order ticket.
    pub(crate) fn next_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst)
    }

    /// Blocks until `ticket` is being served.
    ///
    /// The returned guard passes the turn to the next ticket when dropped,
    /// whether the call succeeded or not.
    pub(crate) fn wait_turn(&self, ticket: u64) -> TurnGuard<'_> {
        let mut serving = self.serving.lock();
        while *serving != ticket {
            self.turn_changed.wait(&mut serving);
        }
        TurnGuard { ctx: self }
    }

    fn advance_turn(&self) {
        *self.serving.lock() += 1;
        self.turn_changed.notify_all();
    }
}

impl Default for InstanceCtx {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct InvokeGuard<'a> {
    ctx: &'a InstanceCtx,
}

impl Drop for InvokeGuard<'_> {
    fn drop(&mut self) {
        self.ctx.leave();
    }
}

pub(crate) struct TurnGuard<'a> {
    ctx: &'a InstanceCtx,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.ctx.advance_turn();
    }
}
