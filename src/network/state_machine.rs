//! Connection State Machine
//!
//! Every connection is driven by a small table-driven state machine. The
//! reactor hands the machine an initial [`Transition`] (`Wakeup`, or
//! `Terminate` after a timeout) and [`StateMachine::accept`] keeps applying the
//! transition table, running the returned [`Action`] and feeding its result
//! back in, until an action answers [`Transition::None`].
//!
//! ## Transition Table
//!
//! ```text
//!            NeedRead          NeedReadTimeout      NeedWrite          NeedResult          Proceed            Terminate         Wakeup
//! Read     (Read,WaitRead)   (Read,WaitReadTO)    (Read,WaitWrite)        -            (Process,Process)  (Closing,TryClose) (Read,TryRead)
//! Process  (Read,TryRead)    (Read,WaitReadTO)          -          (Process,WaitResult) (Write,TryWrite)   (Closing,TryClose) (Process,GetResult)
//! Write    (Write,WaitRead)        -             (Write,WaitWrite)        -            (Process,Process)  (Closing,TryClose) (Write,TryWrite)
//! Closing  (Write,WaitRead)        -             (Write,WaitWrite)        -                  -            (Closing,TryClose) (Closing,TryClose)
//! ```
//!
//! `NeedWrite` while reading and `NeedRead` while writing only happen when the
//! transport renegotiates (a TLS handshake blocked in the other direction).
//! `Write` + `Proceed` goes back to `Process` so a pipelined request that is
//! already buffered is decoded without another trip through the reactor.

use crate::network::error::NetworkError;
use std::fmt;
use tracing::{debug, error, trace};

/// The state a connection is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnState {
    /// Waiting for, or reading, client bytes.
    #[default]
    Read,
    /// Decoding requests and waiting for command results.
    Process,
    /// Flushing responses.
    Write,
    /// Tearing down. A closed handle stays here until it is reset for reuse.
    Closing,
}

impl ConnState {
    /// All states, in table order.
    pub const ALL: [ConnState; 4] = [
        ConnState::Read,
        ConnState::Process,
        ConnState::Write,
        ConnState::Closing,
    ];
}

/// The event alphabet of the machine. Actions also return one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// Halt dispatch and give control back to the reactor.
    None,
    NeedRead,
    NeedReadTimeout,
    NeedWrite,
    NeedResult,
    Proceed,
    Terminate,
    Wakeup,
}

impl Transition {
    /// Every transition that can be fed into the table (everything but `None`).
    pub const INPUTS: [Transition; 7] = [
        Transition::NeedRead,
        Transition::NeedReadTimeout,
        Transition::NeedWrite,
        Transition::NeedResult,
        Transition::Proceed,
        Transition::Terminate,
        Transition::Wakeup,
    ];
}

/// The work a connection performs after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Arm persistent read interest.
    WaitForRead,
    /// Arm persistent write interest.
    WaitForWrite,
    /// Arm persistent read interest plus the idle timeout.
    WaitForReadTimeout,
    /// Stop listening to the socket; the command executor wakes us up.
    WaitForResult,
    TryRead,
    TryWrite,
    Process,
    GetResult,
    TryClose,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The outcome of a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionResult {
    pub next: ConnState,
    pub action: Action,
}

impl TransitionResult {
    const fn new(next: ConnState, action: Action) -> Self {
        Self { next, action }
    }
}

/// Executes actions on behalf of the state machine.
///
/// Implemented by the connection handle; tests plug in scripted versions.
pub trait Actions {
    fn perform(&mut self, action: Action) -> Result<Transition, NetworkError>;
}

/// Per-connection state machine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateMachine {
    current_state: ConnState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_state(&self) -> ConnState {
        self.current_state
    }

    /// The transition table. Pure: it depends only on its arguments.
    ///
    /// Returns `None` for pairs the table does not define.
    pub fn delta(state: ConnState, transition: Transition) -> Option<TransitionResult> {
        use Action as A;
        use ConnState as S;

        let result = match (state, transition) {
            (S::Read, Transition::NeedRead) => TransitionResult::new(S::Read, A::WaitForRead),
            (S::Read, Transition::NeedReadTimeout) => {
                TransitionResult::new(S::Read, A::WaitForReadTimeout)
            }
            (S::Read, Transition::NeedWrite) => TransitionResult::new(S::Read, A::WaitForWrite),
            (S::Read, Transition::Proceed) => TransitionResult::new(S::Process, A::Process),
            (S::Read, Transition::Terminate) => TransitionResult::new(S::Closing, A::TryClose),
            (S::Read, Transition::Wakeup) => TransitionResult::new(S::Read, A::TryRead),

            (S::Process, Transition::NeedRead) => TransitionResult::new(S::Read, A::TryRead),
            (S::Process, Transition::NeedReadTimeout) => {
                TransitionResult::new(S::Read, A::WaitForReadTimeout)
            }
            (S::Process, Transition::NeedResult) => {
                TransitionResult::new(S::Process, A::WaitForResult)
            }
            (S::Process, Transition::Proceed) => TransitionResult::new(S::Write, A::TryWrite),
            (S::Process, Transition::Terminate) => TransitionResult::new(S::Closing, A::TryClose),
            (S::Process, Transition::Wakeup) => TransitionResult::new(S::Process, A::GetResult),

            (S::Write, Transition::NeedRead) => TransitionResult::new(S::Write, A::WaitForRead),
            (S::Write, Transition::NeedWrite) => TransitionResult::new(S::Write, A::WaitForWrite),
            (S::Write, Transition::Proceed) => TransitionResult::new(S::Process, A::Process),
            (S::Write, Transition::Terminate) => TransitionResult::new(S::Closing, A::TryClose),
            (S::Write, Transition::Wakeup) => TransitionResult::new(S::Write, A::TryWrite),

            // A closing transport that blocks (TLS shutdown) waits in Write.
            (S::Closing, Transition::NeedRead) => TransitionResult::new(S::Write, A::WaitForRead),
            (S::Closing, Transition::NeedWrite) => TransitionResult::new(S::Write, A::WaitForWrite),
            (S::Closing, Transition::Terminate) => TransitionResult::new(S::Closing, A::TryClose),
            (S::Closing, Transition::Wakeup) => TransitionResult::new(S::Closing, A::TryClose),

            _ => return None,
        };
        Some(result)
    }

    /// Runs the machine from `transition` until an action returns
    /// [`Transition::None`].
    ///
    /// Action errors are logged and replaced by `Terminate`, so a faulty
    /// connection always converges towards `Closing`. A failing `TryClose`
    /// halts the run instead of being retried.
    ///
    /// # Panics
    ///
    /// Panics on a `(state, transition)` pair the table does not define.
    pub fn accept<A: Actions + ?Sized>(&mut self, transition: Transition, actions: &mut A) {
        let mut next = transition;

        while next != Transition::None {
            let Some(result) = Self::delta(self.current_state, next) else {
                error!(state = ?self.current_state, transition = ?next, "Undefined transition");
                panic!(
                    "undefined transition {:?} in state {:?}",
                    next, self.current_state
                );
            };

            trace!(
                from = ?self.current_state,
                transition = ?next,
                to = ?result.next,
                action = %result.action,
                "Connection transition"
            );
            self.current_state = result.next;

            next = match actions.perform(result.action) {
                Ok(t) => t,
                // Retrying a failed close would fail again.
                Err(e) if result.action == Action::TryClose => {
                    debug!(error = %e, "Close failed");
                    Transition::None
                }
                Err(e) if e.is_disconnect() => {
                    debug!(action = %result.action, error = %e, "Peer went away");
                    Transition::Terminate
                }
                Err(e) => {
                    error!(action = %result.action, error = %e, "Connection action failed");
                    Transition::Terminate
                }
            };
        }
    }
}
