//! The wire-protocol seam.
//!
//! A [`ProtocolInterpreter`] turns buffered bytes into commands for the
//! [`TrafficCop`] and encodes the results. The connection handle only sees
//! the [`Transition`] it answers with.

use crate::commands::TrafficCop;
use crate::network::buffer::{ReadBuffer, WriteQueue};
use crate::network::context::ConnectionContext;
use crate::network::error::NetworkResult;
use crate::network::state_machine::Transition;

/// Decodes requests and encodes responses for one wire protocol.
pub trait ProtocolInterpreter: Send {
    /// Decodes and dispatches the next buffered request.
    ///
    /// Answers `NeedRead` when the request is incomplete, `NeedResult` when
    /// the executor completes asynchronously and `Proceed` once a response
    /// is queued. Malformed input is an error.
    fn process(
        &mut self,
        read_buffer: &mut ReadBuffer,
        write_queue: &mut WriteQueue,
        traffic_cop: &TrafficCop,
        context: &mut ConnectionContext,
    ) -> NetworkResult<Transition>;

    /// Encodes the result of the asynchronous command that just completed.
    fn get_result(&mut self, write_queue: &mut WriteQueue);

    /// Releases protocol state, possibly queueing a termination notice.
    fn teardown(
        &mut self,
        read_buffer: &mut ReadBuffer,
        write_queue: &mut WriteQueue,
        traffic_cop: &TrafficCop,
        context: &mut ConnectionContext,
    );

    /// Short protocol name for logs.
    fn name(&self) -> &'static str;
}
