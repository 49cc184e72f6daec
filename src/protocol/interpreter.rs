//! RESP Interpreter
//!
//! Decodes one RESP frame per [`ProtocolInterpreter::process`] call, hands it
//! to the [`TrafficCop`] and encodes the reply into the write queue.
//!
//! Replies are batched: while more pipelined input is already buffered, a reply
//! is queued without requesting a flush, so a burst of requests is answered
//! with a single write. The flush is requested once the read buffer runs dry.

use crate::commands::{command_name, CommandKind, Execution, TrafficCop};
use crate::network::{
    ConnectionContext, NetworkError, NetworkResult, ProtocolInterpreter, ReadBuffer, Transition,
    WriteQueue,
};
use crate::protocol::{RespParser, RespValue};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, trace, warn};

/// [`ProtocolInterpreter`] for RESP2 clients.
#[derive(Debug, Default)]
pub struct RespInterpreter {
    parser: RespParser,
    /// Reply of the command running on the worker pool
    pending: Option<oneshot::Receiver<RespValue>>,
    quit_requested: bool,
    /// First protocol fault, reported to the client at teardown
    fault: Option<String>,
}

impl RespInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `parser` instead of the default limits.
    pub fn with_parser(parser: RespParser) -> Self {
        Self {
            parser,
            ..Self::default()
        }
    }

    /// True while an asynchronous command has not been collected.
    pub fn has_pending_result(&self) -> bool {
        self.pending.is_some()
    }

    fn encode(reply: &RespValue, write_queue: &mut WriteQueue) {
        reply.encode_into(write_queue.buffer_mut());
    }
}

impl ProtocolInterpreter for RespInterpreter {
    fn process(
        &mut self,
        read_buffer: &mut ReadBuffer,
        write_queue: &mut WriteQueue,
        traffic_cop: &TrafficCop,
        context: &mut ConnectionContext,
    ) -> NetworkResult<Transition> {
        if self.pending.is_some() {
            return Ok(Transition::NeedResult);
        }
        if self.quit_requested {
            if write_queue.is_empty() {
                return Ok(Transition::Terminate);
            }
            write_queue.force_flush();
            return Ok(Transition::Proceed);
        }

        let frame = match self.parser.parse(read_buffer.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                self.fault = Some(e.to_string());
                read_buffer.clear();
                return Err(NetworkError::Protocol(e));
            }
        };

        let Some((request, consumed)) = frame else {
            if !write_queue.is_empty() {
                write_queue.force_flush();
                return Ok(Transition::Proceed);
            }
            return Ok(Transition::NeedRead);
        };
        read_buffer.consume(consumed);

        let name = command_name(&request).unwrap_or_default();
        let kind = CommandKind::of(&name);
        context.read_features.count(kind);
        context.write_features.count(kind);
        context.command_processed();
        trace!(command = %name, bytes = consumed, "Decoded request");

        if name == "QUIT" {
            Self::encode(&RespValue::ok(), write_queue);
            write_queue.force_flush();
            self.quit_requested = true;
            return Ok(Transition::Proceed);
        }

        match traffic_cop.execute(&name, request, context.callback()) {
            Execution::Complete(reply) => {
                Self::encode(&reply, write_queue);
                if read_buffer.is_empty() {
                    write_queue.force_flush();
                }
                Ok(Transition::Proceed)
            }
            Execution::Pending(rx) => {
                self.pending = Some(rx);
                Ok(Transition::NeedResult)
            }
        }
    }

    fn get_result(&mut self, write_queue: &mut WriteQueue) {
        let Some(rx) = self.pending.as_mut() else {
            return;
        };
        let reply = match rx.try_recv() {
            Ok(reply) => reply,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Closed) => {
                debug!("Worker dropped the reply");
                RespValue::error("ERR command aborted")
            }
        };
        self.pending = None;
        Self::encode(&reply, write_queue);
        write_queue.force_flush();
    }

    fn teardown(
        &mut self,
        read_buffer: &mut ReadBuffer,
        write_queue: &mut WriteQueue,
        _traffic_cop: &TrafficCop,
        _context: &mut ConnectionContext,
    ) {
        self.pending = None;
        read_buffer.clear();
        if let Some(fault) = self.fault.take() {
            Self::encode(
                &RespValue::error(format!("ERR Protocol error: {fault}")),
                write_queue,
            );
            write_queue.force_flush();
        }
    }

    fn name(&self) -> &'static str {
        "resp"
    }
}
