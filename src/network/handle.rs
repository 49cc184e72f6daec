//! Connection Handle
//!
//! A [`ConnectionHandle`] drives one client socket. It owns the transport
//! ([`IoWrapper`]), the wire protocol ([`ProtocolInterpreter`]), a
//! [`StateMachine`] and two reactor slots:
//!
//! - the *network event*, re-armed by every wait action with the readiness
//!   (and timeout) the connection currently needs;
//! - the *workpool event*, a manual slot fired only by the completion
//!   callback of an asynchronous command.
//!
//! ```text
//!    reactor ──on_event(flags)──> handle_event
//!                                   │ TIMEOUT ⇒ Terminate, else Wakeup
//!                                   ▼
//!                          StateMachine::accept ──perform(action)──> ActionDriver
//!                                   ▲                                   │
//!                                   └──────────── Transition ───────────┘
//! ```
//!
//! Everything here runs on the owning reactor thread. The only piece that
//! leaves it is the [`CompletionCallback`] stored in the context.

use crate::commands::TrafficCop;
use crate::metrics::NetworkMetricsStore;
use crate::network::context::{CompletionCallback, ConnectionContext};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::interpreter::ProtocolInterpreter;
use crate::network::io_wrapper::{IoWrapper, NetworkIoWrapper};
use crate::network::reactor::{
    ConnectionId, EventFlags, EventHandler, EventId, Reactor,
};
use crate::network::state_machine::{Action, Actions, ConnState, StateMachine, Transition};
use crate::network::stats::ConnectionStats;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, error, trace};

/// One client connection and its protocol state machine.
pub struct ConnectionHandle<Io: IoWrapper = NetworkIoWrapper> {
    state_machine: StateMachine,
    core: HandleCore<Io>,
}

/// Everything the actions touch. Kept apart from the state machine so
/// `accept` can borrow both at once.
struct HandleCore<Io: IoWrapper> {
    io_wrapper: Io,
    interpreter: Box<dyn ProtocolInterpreter>,
    traffic_cop: Arc<TrafficCop>,
    context: ConnectionContext,
    network_event: Option<EventId>,
    workpool_event: Option<EventId>,
    read_timeout: Option<Duration>,
    metrics: Option<Arc<NetworkMetricsStore>>,
    stats: Option<Arc<ConnectionStats>>,
    /// A sampled read is waiting for its commands to be decoded
    read_sample_pending: bool,
    torn_down: bool,
    closed: bool,
}

impl<Io: IoWrapper> ConnectionHandle<Io> {
    pub fn new(
        connection_id: ConnectionId,
        io_wrapper: Io,
        interpreter: Box<dyn ProtocolInterpreter>,
        traffic_cop: Arc<TrafficCop>,
    ) -> Self {
        Self {
            state_machine: StateMachine::new(),
            core: HandleCore {
                io_wrapper,
                interpreter,
                traffic_cop,
                context: ConnectionContext::new(connection_id),
                network_event: None,
                workpool_event: None,
                read_timeout: None,
                metrics: None,
                stats: None,
                read_sample_pending: false,
                torn_down: false,
                closed: false,
            },
        }
    }

    /// Idle timeout armed by `WaitForReadTimeout`. `None` waits forever.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.core.read_timeout = timeout;
        self
    }

    /// Sampling hook for raw socket I/O.
    pub fn with_metrics(mut self, metrics: Arc<NetworkMetricsStore>) -> Self {
        self.core.metrics = Some(metrics);
        self
    }

    pub fn with_stats(mut self, stats: Arc<ConnectionStats>) -> Self {
        self.core.stats = Some(stats);
        self
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.core.context.connection_id()
    }

    pub fn state(&self) -> ConnState {
        self.state_machine.current_state()
    }

    /// True once the transport is closed and both reactor slots are gone.
    pub fn is_closed(&self) -> bool {
        self.core.closed
    }

    pub fn network_event(&self) -> Option<EventId> {
        self.core.network_event
    }

    pub fn workpool_event(&self) -> Option<EventId> {
        self.core.workpool_event
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.core.context
    }

    pub fn io_wrapper(&self) -> &Io {
        &self.core.io_wrapper
    }

    pub fn protocol(&self) -> &'static str {
        self.core.interpreter.name()
    }

    /// Registers the workpool and network slots and installs the completion
    /// callback. The network slot starts out waiting for the first request.
    pub fn register_to_receive_events(&mut self, reactor: &mut dyn Reactor) -> NetworkResult<()> {
        let owner = self.connection_id();
        let workpool_event = reactor.register_manual_event(owner)?;

        let fd = self.core.io_wrapper.socket_fd();
        let network_event = match reactor.register_event(owner, fd, EventFlags::READ | EventFlags::PERSIST) {
            Ok(event) => event,
            Err(e) => {
                let _ = reactor.unregister_event(workpool_event);
                return Err(e.into());
            }
        };
        self.core.workpool_event = Some(workpool_event);
        self.core.network_event = Some(network_event);

        if let Some(timeout) = self.core.read_timeout {
            reactor.update_event(
                network_event,
                fd,
                EventFlags::READ | EventFlags::PERSIST | EventFlags::TIMEOUT,
                Some(timeout),
            )?;
        }

        self.core
            .context
            .set_callback(CompletionCallback::new(reactor.activator(), workpool_event));
        trace!(conn = %owner, ?network_event, ?workpool_event, "Registered connection events");
        Ok(())
    }

    /// Reactor entry point: a timeout terminates, anything else wakes the
    /// state machine up.
    pub fn handle_event(&mut self, flags: EventFlags, reactor: &mut dyn Reactor) {
        let span = debug_span!("conn", id = %self.connection_id());
        let _enter = span.enter();

        let transition = if flags.contains(EventFlags::TIMEOUT) {
            debug!("Idle timeout");
            Transition::Terminate
        } else {
            Transition::Wakeup
        };
        self.accept(transition, reactor);
    }

    /// Drives the connection to `Closing`, e.g. on server shutdown.
    pub fn terminate(&mut self, reactor: &mut dyn Reactor) {
        let span = debug_span!("conn", id = %self.connection_id());
        let _enter = span.enter();
        self.accept(Transition::Terminate, reactor);
    }

    fn accept(&mut self, transition: Transition, reactor: &mut dyn Reactor) {
        let mut driver = ActionDriver {
            core: &mut self.core,
            reactor,
        };
        self.state_machine.accept(transition, &mut driver);
    }

    /// Prepares a closed handle for a new connection. The result behaves like
    /// a freshly constructed handle except for its identity.
    ///
    /// # Panics
    ///
    /// If the handle still holds reactor registrations.
    pub fn reset_for_reuse(
        &mut self,
        connection_id: ConnectionId,
        socket: Io::Socket,
        interpreter: Box<dyn ProtocolInterpreter>,
    ) {
        if self.core.network_event.is_some() || self.core.workpool_event.is_some() {
            error!(
                conn = %self.connection_id(),
                state = ?self.state(),
                "Reusing a handle with live reactor events"
            );
            panic!(
                "connection {} reset while its reactor events are registered",
                self.connection_id()
            );
        }

        self.state_machine = StateMachine::new();
        self.core.io_wrapper.restart(socket);
        self.core.interpreter = interpreter;
        self.core.context.reset(connection_id);
        self.core.read_sample_pending = false;
        self.core.torn_down = false;
        self.core.closed = false;
    }

    /// Drops the transport of a closed handle before it is pooled.
    pub fn release_transport(&mut self) {
        self.core.io_wrapper.release();
    }
}

impl<Io: IoWrapper> EventHandler for ConnectionHandle<Io> {
    fn on_event(&mut self, flags: EventFlags, reactor: &mut dyn Reactor) {
        self.handle_event(flags, reactor);
    }
}

/// Performs the actions the state machine selects.
struct ActionDriver<'a, Io: IoWrapper> {
    core: &'a mut HandleCore<Io>,
    reactor: &'a mut dyn Reactor,
}

impl<Io: IoWrapper> Actions for ActionDriver<'_, Io> {
    fn perform(&mut self, action: Action) -> Result<Transition, NetworkError> {
        match action {
            Action::WaitForRead => self.wait(EventFlags::READ | EventFlags::PERSIST, None),
            Action::WaitForWrite => self.wait(EventFlags::WRITE | EventFlags::PERSIST, None),
            Action::WaitForReadTimeout => match self.core.read_timeout {
                Some(timeout) => self.wait(
                    EventFlags::READ | EventFlags::PERSIST | EventFlags::TIMEOUT,
                    Some(timeout),
                ),
                None => self.wait(EventFlags::READ | EventFlags::PERSIST, None),
            },
            Action::WaitForResult => self.wait_for_result(),
            Action::TryRead => self.try_read(),
            Action::TryWrite => self.try_write(),
            Action::Process => self.process(),
            Action::GetResult => self.get_result(),
            Action::TryClose => self.try_close(),
        }
    }
}

impl<Io: IoWrapper> ActionDriver<'_, Io> {
    fn network_event(&self) -> NetworkResult<EventId> {
        self.core
            .network_event
            .ok_or_else(|| NetworkError::Reactor("network event not registered".to_string()))
    }

    fn wait(&mut self, flags: EventFlags, timeout: Option<Duration>) -> NetworkResult<Transition> {
        let event = self.network_event()?;
        let fd = self.core.io_wrapper.socket_fd();
        self.reactor.update_event(event, fd, flags, timeout)?;
        Ok(Transition::None)
    }

    /// Stops socket delivery until the executor wakes us through the
    /// workpool event.
    fn wait_for_result(&mut self) -> NetworkResult<Transition> {
        let event = self.network_event()?;
        self.reactor.del_event(event)?;
        Ok(Transition::None)
    }

    fn sampling(&self) -> Option<&Arc<NetworkMetricsStore>> {
        self.core.metrics.as_ref().filter(|m| m.is_enabled())
    }

    /// Emits the read record once every command of the sampled read has been
    /// decoded, then starts counting the next inbound unit.
    fn finish_read_sample(&mut self) {
        if !self.core.read_sample_pending {
            return;
        }
        if let Some(metrics) = self.sampling() {
            let features = self.core.context.read_features;
            if features.is_attributable() {
                metrics.record(features);
            }
        }
        self.core.context.read_features.rearm();
        self.core.read_sample_pending = false;
    }

    fn try_read(&mut self) -> NetworkResult<Transition> {
        self.finish_read_sample();
        self.core.context.read_features.rearm();

        let started = self.sampling().map(|_| Instant::now());
        let before = self.core.io_wrapper.read_buffer().len();
        let result = self.core.io_wrapper.fill_read_buffer();
        let received = self.core.io_wrapper.read_buffer().len().saturating_sub(before);

        if let Some(started) = started {
            let features = &mut self.core.context.read_features;
            features.bytes += received as u64;
            features.elapsed_us += started.elapsed().as_micros() as u64;
            self.core.read_sample_pending = received > 0;
        }
        if let Some(stats) = &self.core.stats {
            stats.bytes_read(received);
        }
        result
    }

    fn try_write(&mut self) -> NetworkResult<Transition> {
        if self.core.io_wrapper.read_buffer().is_empty() {
            self.finish_read_sample();
        }
        if !self.core.io_wrapper.should_flush() {
            return Ok(Transition::Proceed);
        }

        let started = self.sampling().map(|_| Instant::now());
        let before = self.core.io_wrapper.write_queue().len();
        let result = self.core.io_wrapper.flush_all_writes();
        let sent = before.saturating_sub(self.core.io_wrapper.write_queue().len());

        if let Some(started) = started {
            let features = &mut self.core.context.write_features;
            features.bytes += sent as u64;
            features.elapsed_us += started.elapsed().as_micros() as u64;
        }
        if matches!(result, Ok(Transition::Proceed)) {
            if let Some(metrics) = self.sampling() {
                let features = self.core.context.write_features;
                if features.is_attributable() {
                    metrics.record(features);
                }
            }
            self.core.context.write_features.rearm();
        }
        if let Some(stats) = &self.core.stats {
            stats.bytes_written(sent);
        }
        result
    }

    fn process(&mut self) -> NetworkResult<Transition> {
        let core = &mut *self.core;
        let (read_buffer, write_queue) = core.io_wrapper.buffers_mut();
        core.interpreter
            .process(read_buffer, write_queue, &core.traffic_cop, &mut core.context)
    }

    fn get_result(&mut self) -> NetworkResult<Transition> {
        let event = self.network_event()?;
        self.reactor.add_event(event)?;

        let (_, write_queue) = self.core.io_wrapper.buffers_mut();
        self.core.interpreter.get_result(write_queue);
        Ok(Transition::Proceed)
    }

    fn try_close(&mut self) -> NetworkResult<Transition> {
        if self.core.closed {
            trace!("Already closed");
            return Ok(Transition::None);
        }

        if !self.core.torn_down {
            self.core.torn_down = true;
            let core = &mut *self.core;
            let (read_buffer, write_queue) = core.io_wrapper.buffers_mut();
            core.interpreter
                .teardown(read_buffer, write_queue, &core.traffic_cop, &mut core.context);
        }

        match self.core.io_wrapper.close() {
            Ok(Transition::Proceed) => {}
            Ok(blocked) => {
                trace!(transition = ?blocked, "Close would block");
                return Ok(blocked);
            }
            // Nothing left to retry; the transport is gone either way.
            Err(e) => debug!(error = %e, "Close failed, releasing connection"),
        }

        for event in [self.core.network_event.take(), self.core.workpool_event.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.reactor.unregister_event(event) {
                debug!(?event, error = %e, "Failed to unregister event");
            }
        }
        self.core.closed = true;
        debug!(
            commands = self.core.context.commands_processed(),
            "Connection closed"
        );
        Ok(Transition::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandHandler;
    use crate::metrics::NetworkOperatingUnit;
    use crate::network::testing::{
        Journal, MockReactor, ReactorCall, ScriptedInterpreter, ScriptedIo, Step,
    };
    use crate::protocol::ParseError;
    use crate::storage::StorageEngine;

    fn traffic_cop() -> Arc<TrafficCop> {
        let handler = CommandHandler::new(Arc::new(StorageEngine::new()));
        Arc::new(TrafficCop::new(Arc::new(handler)))
    }

    fn handle(
        id: u64,
        reads: Vec<Step>,
        steps: Vec<Step>,
        journal: &Journal,
    ) -> ConnectionHandle<ScriptedIo> {
        ConnectionHandle::new(
            ConnectionId::from_raw(id),
            ScriptedIo::new(reads, journal.clone()),
            Box::new(ScriptedInterpreter::new(steps, journal.clone())),
            traffic_cop(),
        )
    }

    fn registered(
        id: u64,
        reads: Vec<Step>,
        steps: Vec<Step>,
        journal: &Journal,
        reactor: &mut MockReactor,
    ) -> ConnectionHandle<ScriptedIo> {
        let mut handle = handle(id, reads, steps, journal);
        handle.register_to_receive_events(reactor).unwrap();
        handle
    }

    #[test]
    fn test_registers_both_events() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let handle = registered(1, vec![], vec![], &journal, &mut reactor);

        let network = handle.network_event().unwrap();
        let workpool = handle.workpool_event().unwrap();
        assert_ne!(network, workpool);
        assert_eq!(reactor.live_events(), 2);
        assert_eq!(handle.context().callback().map(|c| c.event()), Some(workpool));
        assert_eq!(handle.state(), ConnState::Read);
    }

    #[test]
    fn test_pipelined_requests_skip_the_reactor() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let mut handle = registered(
            1,
            vec![Step::Data(b"GET a\nGET b\n".to_vec())],
            vec![
                Step::Data(b"$1\r\n1\r\n".to_vec()),
                Step::Data(b"$1\r\n2\r\n".to_vec()),
            ],
            &journal,
            &mut reactor,
        );

        handle.handle_event(EventFlags::READ, &mut reactor);

        // The second request is decoded right after the first flush.
        assert_eq!(
            journal.entries(),
            vec!["read", "process", "flush", "process", "flush", "process", "read"]
        );
        assert_eq!(handle.io_wrapper().written(), b"$1\r\n1\r\n$1\r\n2\r\n");
        assert_eq!(handle.state(), ConnState::Read);
        assert_eq!(
            reactor.calls().last(),
            Some(&ReactorCall::Update {
                event: handle.network_event().unwrap(),
                flags: EventFlags::READ | EventFlags::PERSIST,
                timeout: None,
            })
        );
    }

    #[test]
    fn test_async_result_round_trip() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let mut handle = registered(
            1,
            vec![Step::Data(b"KEYS *\n".to_vec())],
            vec![Step::Return(Transition::NeedResult)],
            &journal,
            &mut reactor,
        );
        let network = handle.network_event().unwrap();
        let workpool = handle.workpool_event().unwrap();

        handle.handle_event(EventFlags::READ, &mut reactor);
        assert_eq!(handle.state(), ConnState::Process);
        assert_eq!(reactor.calls().last(), Some(&ReactorCall::Del(network)));

        // The executor finishes on another thread.
        let callback = handle.context().callback().cloned().unwrap();
        std::thread::spawn(move || callback.invoke()).join().unwrap();
        assert_eq!(reactor.activations(), vec![(workpool, EventFlags::WRITE)]);

        handle.handle_event(EventFlags::SIGNAL | EventFlags::WRITE, &mut reactor);
        assert!(reactor.calls().contains(&ReactorCall::Add(network)));
        assert_eq!(handle.io_wrapper().written(), b"*0\r\n");
        assert_eq!(
            journal.entries(),
            vec!["read", "process", "get_result", "flush", "process", "read"]
        );
        assert_eq!(handle.state(), ConnState::Read);
    }

    #[test]
    fn test_full_socket_waits_for_write() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let mut handle = registered(
            1,
            vec![Step::Data(b"PING\n".to_vec())],
            vec![Step::Data(b"+PONG\r\n".to_vec())],
            &journal,
            &mut reactor,
        );
        handle.core.io_wrapper.script_flushes(vec![Transition::NeedWrite]);
        let network = handle.network_event().unwrap();

        handle.handle_event(EventFlags::READ, &mut reactor);
        assert_eq!(handle.state(), ConnState::Write);
        assert!(handle.io_wrapper().written().is_empty());
        assert_eq!(
            reactor.calls().last(),
            Some(&ReactorCall::Update {
                event: network,
                flags: EventFlags::WRITE | EventFlags::PERSIST,
                timeout: None,
            })
        );

        handle.handle_event(EventFlags::WRITE, &mut reactor);
        assert_eq!(handle.io_wrapper().written(), b"+PONG\r\n");
        assert_eq!(handle.state(), ConnState::Read);
    }

    #[test]
    fn test_idle_timeout_closes() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let mut handle = registered(
            1,
            vec![Step::Return(Transition::NeedReadTimeout)],
            vec![],
            &journal,
            &mut reactor,
        )
        .with_read_timeout(Some(Duration::from_secs(5)));
        let network = handle.network_event().unwrap();

        handle.handle_event(EventFlags::READ, &mut reactor);
        assert_eq!(
            reactor.calls().last(),
            Some(&ReactorCall::Update {
                event: network,
                flags: EventFlags::READ | EventFlags::PERSIST | EventFlags::TIMEOUT,
                timeout: Some(Duration::from_secs(5)),
            })
        );

        handle.handle_event(EventFlags::TIMEOUT, &mut reactor);
        assert_eq!(handle.state(), ConnState::Closing);
        assert!(handle.is_closed());
        assert_eq!(handle.network_event(), None);
        assert_eq!(handle.workpool_event(), None);
        assert_eq!(reactor.live_events(), 0);
        assert_eq!(journal.entries(), vec!["read", "teardown", "close"]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let mut handle = registered(1, vec![], vec![], &journal, &mut reactor);

        handle.terminate(&mut reactor);
        let calls = reactor.calls().len();

        // A stray delivery after deregistration, then another terminate.
        handle.handle_event(EventFlags::WRITE, &mut reactor);
        handle.terminate(&mut reactor);

        assert_eq!(reactor.calls().len(), calls);
        assert_eq!(journal.entries(), vec!["teardown", "close"]);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_blocked_close_retries() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let mut handle = registered(1, vec![], vec![], &journal, &mut reactor);
        handle.core.io_wrapper.script_closes(vec![Transition::NeedWrite]);

        handle.terminate(&mut reactor);
        assert!(!handle.is_closed());
        assert_eq!(handle.state(), ConnState::Write);
        assert_eq!(reactor.live_events(), 2);

        handle.terminate(&mut reactor);
        assert!(handle.is_closed());
        assert_eq!(reactor.live_events(), 0);
        // Teardown runs once however often closing is attempted.
        assert_eq!(journal.entries(), vec!["teardown", "close", "close"]);
    }

    #[test]
    fn test_failed_close_still_releases() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let mut handle = registered(1, vec![], vec![], &journal, &mut reactor);
        handle
            .core
            .io_wrapper
            .script_close_failure(NetworkError::PeerClosed);

        handle.terminate(&mut reactor);
        assert!(handle.is_closed());
        assert_eq!(handle.state(), ConnState::Closing);
        assert_eq!(reactor.live_events(), 0);

        // Later deliveries find nothing to do.
        handle.handle_event(EventFlags::READ, &mut reactor);
        handle.terminate(&mut reactor);
        assert_eq!(journal.entries(), vec!["teardown", "close"]);
    }

    #[test]
    fn test_fault_is_contained_to_one_connection() {
        let mut reactor = MockReactor::new();
        let faulty_journal = Journal::default();
        let healthy_journal = Journal::default();

        let mut faulty = registered(
            1,
            vec![Step::Data(b"*-3\n".to_vec())],
            vec![Step::Fail(NetworkError::Protocol(ParseError::InvalidArrayLength(-3)))],
            &faulty_journal,
            &mut reactor,
        );
        let mut healthy = registered(
            2,
            vec![Step::Data(b"PING\n".to_vec())],
            vec![Step::Data(b"+PONG\r\n".to_vec())],
            &healthy_journal,
            &mut reactor,
        );

        faulty.handle_event(EventFlags::READ, &mut reactor);
        healthy.handle_event(EventFlags::READ, &mut reactor);

        assert!(faulty.is_closed());
        assert_eq!(faulty.state(), ConnState::Closing);
        assert_eq!(reactor.live_events_of(ConnectionId::from_raw(1)), 0);

        assert!(!healthy.is_closed());
        assert_eq!(reactor.live_events_of(ConnectionId::from_raw(2)), 2);
        assert_eq!(healthy.io_wrapper().written(), b"+PONG\r\n");
    }

    #[test]
    fn test_io_error_terminates() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let mut handle = registered(
            1,
            vec![Step::Fail(NetworkError::PeerClosed)],
            vec![],
            &journal,
            &mut reactor,
        );

        handle.handle_event(EventFlags::READ, &mut reactor);
        assert!(handle.is_closed());
        assert_eq!(reactor.live_events(), 0);
    }

    /// Runs the same stimulus and reports what the handle did.
    fn run_scenario(
        handle: &mut ConnectionHandle<ScriptedIo>,
        reactor: &mut MockReactor,
    ) -> Vec<ConnState> {
        let mut states = Vec::new();
        handle.handle_event(EventFlags::READ, reactor);
        states.push(handle.state());
        handle.handle_event(EventFlags::READ, reactor);
        states.push(handle.state());
        handle.handle_event(EventFlags::TIMEOUT, reactor);
        states.push(handle.state());
        states
    }

    fn scenario_reads() -> Vec<Step> {
        vec![
            Step::Data(b"PING\n".to_vec()),
            Step::Return(Transition::NeedRead),
            Step::Data(b"KEYS *\n".to_vec()),
        ]
    }

    fn scenario_steps() -> Vec<Step> {
        vec![
            Step::Data(b"+PONG\r\n".to_vec()),
            Step::Return(Transition::NeedRead),
            Step::Return(Transition::NeedResult),
        ]
    }

    #[test]
    fn test_reuse_matches_fresh_handle() {
        let fresh_journal = Journal::default();
        let mut fresh_reactor = MockReactor::new();
        let mut fresh = registered(
            1,
            scenario_reads(),
            scenario_steps(),
            &fresh_journal,
            &mut fresh_reactor,
        );
        let fresh_states = run_scenario(&mut fresh, &mut fresh_reactor);

        // Close a handle that was used for something else, then recycle it.
        let reused_journal = Journal::default();
        let mut reused_reactor = MockReactor::new();
        let mut reused = registered(
            7,
            vec![Step::Data(b"GET x\n".to_vec())],
            vec![Step::Return(Transition::NeedResult)],
            &Journal::default(),
            &mut reused_reactor,
        );
        reused.handle_event(EventFlags::READ, &mut reused_reactor);
        reused.terminate(&mut reused_reactor);
        assert!(reused.is_closed());

        let mut reused_reactor = MockReactor::new();
        reused.reset_for_reuse(
            ConnectionId::from_raw(8),
            ScriptedIo::new(scenario_reads(), reused_journal.clone()),
            Box::new(ScriptedInterpreter::new(scenario_steps(), reused_journal.clone())),
        );
        assert_eq!(reused.state(), ConnState::Read);
        assert!(!reused.is_closed());
        assert_eq!(reused.connection_id(), ConnectionId::from_raw(8));
        assert_eq!(reused.context().commands_processed(), 0);
        assert!(reused.io_wrapper().written().is_empty());

        reused.register_to_receive_events(&mut reused_reactor).unwrap();
        let reused_states = run_scenario(&mut reused, &mut reused_reactor);

        assert_eq!(reused_states, fresh_states);
        assert_eq!(reused_journal.entries(), fresh_journal.entries());
        assert_eq!(reused_reactor.calls(), fresh_reactor.calls());
        assert_eq!(
            reused.io_wrapper().written(),
            fresh.io_wrapper().written()
        );
    }

    #[test]
    #[should_panic(expected = "reactor events are registered")]
    fn test_reuse_with_live_events_panics() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let mut handle = registered(1, vec![], vec![], &journal, &mut reactor);

        handle.reset_for_reuse(
            ConnectionId::from_raw(2),
            ScriptedIo::new(vec![], journal.clone()),
            Box::new(ScriptedInterpreter::new(vec![], journal.clone())),
        );
    }

    #[test]
    fn test_sampling_emits_single_command_records() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let metrics = Arc::new(NetworkMetricsStore::new(true));
        let mut handle = registered(
            1,
            vec![Step::Data(b"PING\n".to_vec())],
            vec![Step::Data(b"+PONG\r\n".to_vec())],
            &journal,
            &mut reactor,
        )
        .with_metrics(metrics.clone());

        handle.handle_event(EventFlags::READ, &mut reactor);

        let records = metrics.drain();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operating_unit, NetworkOperatingUnit::Read);
        assert_eq!(records[0].bytes, 5);
        assert_eq!(records[0].num_queries, 1);
        assert_eq!(records[1].operating_unit, NetworkOperatingUnit::Write);
        assert_eq!(records[1].bytes, 7);
        assert_eq!(records[1].num_queries, 1);
    }

    #[test]
    fn test_sampling_skips_batches_and_disabled_store() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let metrics = Arc::new(NetworkMetricsStore::new(true));
        let mut handle = registered(
            1,
            vec![Step::Data(b"PING\nPING\n".to_vec())],
            vec![
                Step::Data(b"+PONG\r\n".to_vec()),
                Step::Data(b"+PONG\r\n".to_vec()),
            ],
            &journal,
            &mut reactor,
        )
        .with_metrics(metrics.clone());

        handle.handle_event(EventFlags::READ, &mut reactor);
        let records = metrics.drain();
        // Two writes of one reply each; the read carried two commands.
        assert!(records
            .iter()
            .all(|r| r.operating_unit == NetworkOperatingUnit::Write));
        assert_eq!(records.len(), 2);

        metrics.set_enabled(false);
        let mut handle = registered(
            2,
            vec![Step::Data(b"PING\n".to_vec())],
            vec![Step::Data(b"+PONG\r\n".to_vec())],
            &journal,
            &mut reactor,
        )
        .with_metrics(metrics.clone());
        handle.handle_event(EventFlags::READ, &mut reactor);
        assert!(metrics.is_empty());
    }

    #[test]
    fn test_stats_count_bytes() {
        let journal = Journal::default();
        let mut reactor = MockReactor::new();
        let stats = Arc::new(ConnectionStats::new());
        let mut handle = registered(
            1,
            vec![Step::Data(b"PING\n".to_vec())],
            vec![Step::Data(b"+PONG\r\n".to_vec())],
            &journal,
            &mut reactor,
        )
        .with_stats(stats.clone());

        handle.handle_event(EventFlags::READ, &mut reactor);
        assert_eq!(stats.bytes_read.load(std::sync::atomic::Ordering::Relaxed), 5);
        assert_eq!(stats.bytes_written.load(std::sync::atomic::Ordering::Relaxed), 7);
    }
}
