//! Test doubles for driving a [`ConnectionHandle`](super::ConnectionHandle)
//! without sockets or a poller.

use crate::commands::{CommandKind, TrafficCop};
use crate::network::buffer::{ReadBuffer, WriteQueue};
use crate::network::context::ConnectionContext;
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::interpreter::ProtocolInterpreter;
use crate::network::io_wrapper::IoWrapper;
use crate::network::reactor::{ConnectionId, EventActivator, EventFlags, EventId, Reactor};
use crate::network::state_machine::Transition;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered log of the I/O and protocol calls a handle made.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<&'static str>>>);

impl Journal {
    pub fn record(&self, entry: &'static str) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }
}

/// One scripted outcome.
///
/// For [`ScriptedIo`] reads, `Data` arrives from the peer. For
/// [`ScriptedInterpreter`], `Data` is the encoded reply to the next line.
#[derive(Debug)]
pub enum Step {
    Data(Vec<u8>),
    Return(Transition),
    Fail(NetworkError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReactorCall {
    Register { fd: RawFd, flags: EventFlags },
    RegisterManual,
    Update {
        event: EventId,
        flags: EventFlags,
        timeout: Option<Duration>,
    },
    Add(EventId),
    Del(EventId),
    Unregister(EventId),
}

#[derive(Debug, Default)]
struct RecordingActivator {
    fired: Mutex<Vec<(EventId, EventFlags)>>,
}

impl EventActivator for RecordingActivator {
    fn activate(&self, event: EventId, flags: EventFlags) {
        self.fired.lock().unwrap().push((event, flags));
    }
}

/// A [`Reactor`] that only records what it is asked to do.
#[derive(Debug)]
pub struct MockReactor {
    next_event: usize,
    calls: Vec<ReactorCall>,
    live: HashMap<EventId, ConnectionId>,
    activator: Arc<RecordingActivator>,
}

impl MockReactor {
    pub fn new() -> Self {
        Self {
            next_event: 1,
            calls: Vec::new(),
            live: HashMap::new(),
            activator: Arc::new(RecordingActivator::default()),
        }
    }

    pub fn calls(&self) -> &[ReactorCall] {
        &self.calls
    }

    pub fn live_events(&self) -> usize {
        self.live.len()
    }

    pub fn live_events_of(&self, owner: ConnectionId) -> usize {
        self.live.values().filter(|&&o| o == owner).count()
    }

    /// Activations requested through the activator, from any thread.
    pub fn activations(&self) -> Vec<(EventId, EventFlags)> {
        self.activator.fired.lock().unwrap().clone()
    }

    fn allocate(&mut self, owner: ConnectionId) -> EventId {
        let event = EventId(self.next_event);
        self.next_event += 1;
        self.live.insert(event, owner);
        event
    }
}

impl Reactor for MockReactor {
    fn register_event(
        &mut self,
        owner: ConnectionId,
        fd: RawFd,
        flags: EventFlags,
    ) -> io::Result<EventId> {
        self.calls.push(ReactorCall::Register { fd, flags });
        Ok(self.allocate(owner))
    }

    fn update_event(
        &mut self,
        event: EventId,
        _fd: RawFd,
        flags: EventFlags,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        self.calls.push(ReactorCall::Update {
            event,
            flags,
            timeout,
        });
        Ok(())
    }

    fn add_event(&mut self, event: EventId) -> io::Result<()> {
        self.calls.push(ReactorCall::Add(event));
        Ok(())
    }

    fn del_event(&mut self, event: EventId) -> io::Result<()> {
        self.calls.push(ReactorCall::Del(event));
        Ok(())
    }

    fn unregister_event(&mut self, event: EventId) -> io::Result<()> {
        self.calls.push(ReactorCall::Unregister(event));
        self.live.remove(&event);
        Ok(())
    }

    fn register_manual_event(&mut self, owner: ConnectionId) -> io::Result<EventId> {
        self.calls.push(ReactorCall::RegisterManual);
        Ok(self.allocate(owner))
    }

    fn activator(&self) -> Arc<dyn EventActivator> {
        self.activator.clone()
    }
}

/// An [`IoWrapper`] whose reads and closes follow a script. Flushes always
/// succeed unless scripted otherwise and land in [`ScriptedIo::written`].
#[derive(Debug)]
pub struct ScriptedIo {
    reads: VecDeque<Step>,
    flushes: VecDeque<Transition>,
    closes: VecDeque<Transition>,
    close_failure: Option<NetworkError>,
    read_buffer: ReadBuffer,
    write_queue: WriteQueue,
    written: Vec<u8>,
    journal: Journal,
}

impl ScriptedIo {
    pub fn new(reads: Vec<Step>, journal: Journal) -> Self {
        Self {
            reads: reads.into(),
            flushes: VecDeque::new(),
            closes: VecDeque::new(),
            close_failure: None,
            read_buffer: ReadBuffer::new(4096),
            write_queue: WriteQueue::new(4096),
            written: Vec::new(),
            journal,
        }
    }

    pub fn script_flushes(&mut self, flushes: Vec<Transition>) {
        self.flushes = flushes.into();
    }

    pub fn script_closes(&mut self, closes: Vec<Transition>) {
        self.closes = closes.into();
    }

    /// Makes the next close fail instead of following the close script.
    pub fn script_close_failure(&mut self, error: NetworkError) {
        self.close_failure = Some(error);
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl IoWrapper for ScriptedIo {
    type Socket = ScriptedIo;

    fn socket_fd(&self) -> RawFd {
        42
    }

    fn fill_read_buffer(&mut self) -> NetworkResult<Transition> {
        self.journal.record("read");
        match self.reads.pop_front() {
            Some(Step::Data(bytes)) => {
                self.read_buffer.extend_from_slice(&bytes);
                Ok(Transition::Proceed)
            }
            Some(Step::Return(transition)) => Ok(transition),
            Some(Step::Fail(e)) => Err(e),
            None => Ok(Transition::NeedRead),
        }
    }

    fn flush_all_writes(&mut self) -> NetworkResult<Transition> {
        self.journal.record("flush");
        match self.flushes.pop_front().unwrap_or(Transition::Proceed) {
            Transition::Proceed => {
                self.write_queue.write_to(&mut self.written)?;
                self.write_queue.flushed();
                Ok(Transition::Proceed)
            }
            blocked => Ok(blocked),
        }
    }

    fn should_flush(&self) -> bool {
        self.write_queue.should_flush()
    }

    fn close(&mut self) -> NetworkResult<Transition> {
        self.journal.record("close");
        if let Some(e) = self.close_failure.take() {
            return Err(e);
        }
        Ok(self.closes.pop_front().unwrap_or(Transition::Proceed))
    }

    fn restart(&mut self, socket: ScriptedIo) {
        *self = socket;
    }

    fn release(&mut self) {
        self.reads.clear();
        self.read_buffer.clear();
        self.write_queue.clear();
    }

    fn read_buffer(&self) -> &ReadBuffer {
        &self.read_buffer
    }

    fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    fn buffers_mut(&mut self) -> (&mut ReadBuffer, &mut WriteQueue) {
        (&mut self.read_buffer, &mut self.write_queue)
    }
}

/// A line-oriented [`ProtocolInterpreter`] following a script.
///
/// Each scripted step consumes one buffered line. `Data` queues the reply
/// with a flush request; `Return(NeedResult)` leaves a result pending that
/// `get_result` answers with an empty array.
#[derive(Debug)]
pub struct ScriptedInterpreter {
    steps: VecDeque<Step>,
    pending: bool,
    journal: Journal,
}

impl ScriptedInterpreter {
    pub fn new(steps: Vec<Step>, journal: Journal) -> Self {
        Self {
            steps: steps.into(),
            pending: false,
            journal,
        }
    }

    fn consume_line(read_buffer: &mut ReadBuffer) {
        if let Some(end) = read_buffer.as_bytes().iter().position(|&b| b == b'\n') {
            read_buffer.consume(end + 1);
        }
    }
}

impl ProtocolInterpreter for ScriptedInterpreter {
    fn process(
        &mut self,
        read_buffer: &mut ReadBuffer,
        write_queue: &mut WriteQueue,
        _traffic_cop: &TrafficCop,
        context: &mut ConnectionContext,
    ) -> NetworkResult<Transition> {
        self.journal.record("process");
        if self.pending {
            return Ok(Transition::NeedResult);
        }

        let Some(step) = self.steps.pop_front() else {
            return Ok(Transition::NeedRead);
        };
        Self::consume_line(read_buffer);
        match step {
            Step::Data(reply) => {
                context.read_features.count(CommandKind::Admin);
                context.write_features.count(CommandKind::Admin);
                context.command_processed();
                write_queue.push(&reply);
                write_queue.force_flush();
                Ok(Transition::Proceed)
            }
            Step::Return(Transition::NeedResult) => {
                self.pending = true;
                Ok(Transition::NeedResult)
            }
            Step::Return(transition) => Ok(transition),
            Step::Fail(e) => Err(e),
        }
    }

    fn get_result(&mut self, write_queue: &mut WriteQueue) {
        self.journal.record("get_result");
        if self.pending {
            self.pending = false;
            write_queue.push(b"*0\r\n");
            write_queue.force_flush();
        }
    }

    fn teardown(
        &mut self,
        _read_buffer: &mut ReadBuffer,
        _write_queue: &mut WriteQueue,
        _traffic_cop: &TrafficCop,
        _context: &mut ConnectionContext,
    ) {
        self.journal.record("teardown");
        self.pending = false;
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
