//! # Socket Tasks
//!
//! One unit of per-connection protocol work, pluggable into the engine.
//! For request/answer transports the engine sets `request` from the most
//! recently decoded frame, invokes the task, and sends `answer` back on
//! the same connection. A listening engine clones the registered task per
//! accepted connection so concurrent connections share no mutable state.
//!
//! With `endless = true` and an interval, a task becomes a periodic
//! heartbeat driven by the engine until `stop()`.

use crate::core::Value;
use crate::error::Result;

/// Mutable slots the engine exchanges with a task per invocation
#[derive(Debug, Default)]
pub struct TaskContext {
    /// Most recently received, decoded frame (set by the engine)
    pub request: Option<Value>,

    /// Task output, marshalled and written back by the engine
    pub answer: Option<Value>,

    /// Opaque construction parameters, copied into every per-connection
    /// clone
    pub params: Vec<Value>,
}

impl TaskContext {
    pub fn new(params: Vec<Value>) -> Self {
        Self {
            request: None,
            answer: None,
            params,
        }
    }
}

/// Per-connection protocol logic. `run` executes once per invocation
/// cycle; `clone_task` copies immutable construction state into a fresh
/// instance for a newly accepted connection.
pub trait SocketTask: Send {
    fn run(&mut self, ctx: &mut TaskContext) -> Result<()>;

    fn clone_task(&self) -> Box<dyn SocketTask>;
}

/// Task registration: the task plus its scheduling shape
pub struct TaskSpec {
    pub task: Box<dyn SocketTask>,
    /// Keep running until the engine stops
    pub endless: bool,
    /// Sleep between cycles for periodic tasks
    pub interval_ms: u64,
}

impl TaskSpec {
    /// A task invoked once per received request (answer transports)
    pub fn per_request(task: Box<dyn SocketTask>) -> Self {
        Self {
            task,
            endless: false,
            interval_ms: 0,
        }
    }

    /// A periodic task (heartbeat / keep-alive)
    pub fn periodic(task: Box<dyn SocketTask>, interval_ms: u64) -> Self {
        Self {
            task,
            endless: true,
            interval_ms,
        }
    }
}

/// Answers every request with the request itself. Useful as a liveness
/// probe and in tests.
#[derive(Debug, Clone, Default)]
pub struct EchoTask;

impl SocketTask for EchoTask {
    fn run(&mut self, ctx: &mut TaskContext) -> Result<()> {
        ctx.answer = ctx.request.take();
        Ok(())
    }

    fn clone_task(&self) -> Box<dyn SocketTask> {
        Box::new(self.clone())
    }
}
