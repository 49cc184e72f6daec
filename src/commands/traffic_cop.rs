//! Command Executor
//!
//! The [`TrafficCop`] decides where a decoded command runs. Cheap commands run
//! inline on the reactor thread. Commands that scan or clear the whole
//! keyspace, or deliberately block (`DEBUG SLEEP`), go to tokio's blocking
//! pool so one slow client cannot stall every other connection on its reactor.
//!
//! An asynchronous command completes in two steps: the worker sends the reply
//! on a oneshot channel, then invokes the connection's [`CompletionCallback`].
//! The callback only activates the connection's manual event; the reactor
//! thread picks the reply up from the channel.

use crate::commands::CommandHandler;
use crate::network::CompletionCallback;
use crate::protocol::RespValue;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Commands handed to the blocking pool.
const ASYNC_COMMANDS: &[&str] = &["KEYS", "FLUSHDB", "FLUSHALL", "DEBUG"];

/// How a command completed.
#[derive(Debug)]
pub enum Execution {
    /// The reply is ready.
    Complete(RespValue),
    /// The reply arrives on this channel; the callback fires once it was sent.
    Pending(oneshot::Receiver<RespValue>),
}

/// Routes commands to inline or asynchronous execution.
#[derive(Debug, Clone)]
pub struct TrafficCop {
    handler: Arc<CommandHandler>,
    runtime: Option<Handle>,
}

impl TrafficCop {
    /// An executor that runs every command inline.
    pub fn new(handler: Arc<CommandHandler>) -> Self {
        Self {
            handler,
            runtime: None,
        }
    }

    /// An executor that offloads slow commands onto `runtime`'s blocking pool.
    pub fn with_runtime(handler: Arc<CommandHandler>, runtime: Handle) -> Self {
        Self {
            handler,
            runtime: Some(runtime),
        }
    }

    pub fn handler(&self) -> &Arc<CommandHandler> {
        &self.handler
    }

    pub fn is_async(&self) -> bool {
        self.runtime.is_some()
    }

    /// True for commands that run asynchronously when possible.
    pub fn runs_async(name: &str) -> bool {
        ASYNC_COMMANDS.contains(&name)
    }

    /// Executes `request`. Without a completion callback (a connection not
    /// registered with a reactor) everything runs inline.
    pub fn execute(
        &self,
        name: &str,
        request: RespValue,
        callback: Option<&CompletionCallback>,
    ) -> Execution {
        let (Some(runtime), Some(callback)) = (&self.runtime, callback) else {
            return Execution::Complete(self.handler.execute(request));
        };
        if !Self::runs_async(name) {
            return Execution::Complete(self.handler.execute(request));
        }

        let (tx, rx) = oneshot::channel();
        let handler = Arc::clone(&self.handler);
        let callback = callback.clone();
        trace!(command = name, event = ?callback.event(), "Dispatching to worker pool");

        runtime.spawn_blocking(move || {
            let reply = handler.execute(request);
            if tx.send(reply).is_err() {
                debug!("Connection closed before its command completed");
            }
            callback.invoke();
        });
        Execution::Pending(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{EventActivator, EventFlags, EventId};
    use crate::storage::StorageEngine;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Wakeups(Mutex<Vec<(EventId, EventFlags)>>);

    impl EventActivator for Wakeups {
        fn activate(&self, event: EventId, flags: EventFlags) {
            self.0.lock().unwrap().push((event, flags));
        }
    }

    fn request(args: &[&str]) -> RespValue {
        RespValue::array(
            args.iter()
                .map(|s| RespValue::bulk_string(Bytes::from(s.to_string())))
                .collect(),
        )
    }

    fn handler() -> Arc<CommandHandler> {
        Arc::new(CommandHandler::new(Arc::new(StorageEngine::new())))
    }

    #[test]
    fn test_without_runtime_everything_is_inline() {
        let cop = TrafficCop::new(handler());
        let callback = CompletionCallback::new(Arc::new(Wakeups::default()), EventId(1));

        match cop.execute("KEYS", request(&["KEYS", "*"]), Some(&callback)) {
            Execution::Complete(reply) => assert_eq!(reply, RespValue::array(vec![])),
            Execution::Pending(_) => panic!("expected inline completion"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cheap_commands_stay_inline() {
        let cop = TrafficCop::with_runtime(handler(), Handle::current());
        let callback = CompletionCallback::new(Arc::new(Wakeups::default()), EventId(1));

        let execution = cop.execute("PING", request(&["PING"]), Some(&callback));
        assert!(matches!(execution, Execution::Complete(RespValue::SimpleString(_))));

        // No callback: nobody could be woken, so run inline.
        let execution = cop.execute("KEYS", request(&["KEYS", "*"]), None);
        assert!(matches!(execution, Execution::Complete(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_slow_command_completes_through_callback() {
        let wakeups = Arc::new(Wakeups::default());
        let cop = TrafficCop::with_runtime(handler(), Handle::current());
        let callback = CompletionCallback::new(wakeups.clone(), EventId(9));

        let rx = match cop.execute("DEBUG", request(&["DEBUG", "SLEEP", "0.02"]), Some(&callback)) {
            Execution::Pending(rx) => rx,
            Execution::Complete(_) => panic!("expected asynchronous completion"),
        };

        let reply = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, RespValue::ok());

        // The callback fires right after the send.
        for _ in 0..100 {
            if !wakeups.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            *wakeups.0.lock().unwrap(),
            vec![(EventId(9), EventFlags::WRITE)]
        );
    }

    #[test]
    fn test_dispatch_from_thread_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let cop = TrafficCop::with_runtime(handler(), runtime.handle().clone());
        let callback = CompletionCallback::new(Arc::new(Wakeups::default()), EventId(3));
        cop.handler().execute(request(&["SET", "a", "1"]));

        let rx = match cop.execute("KEYS", request(&["KEYS", "*"]), Some(&callback)) {
            Execution::Pending(rx) => rx,
            Execution::Complete(_) => panic!("expected asynchronous completion"),
        };
        let reply = tokio_test::block_on(rx).unwrap();
        assert_eq!(
            reply,
            RespValue::array(vec![RespValue::bulk_string(Bytes::from("a"))])
        );
    }
}
