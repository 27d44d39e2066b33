//! Execution backend contract
//!
//! A backend knows how to launch one job asynchronously and how to answer
//! a non-blocking "is it done yet". The engine never blocks on a job: the
//! DAG loop calls `get_state` once per poll tick for every RUNNING node.
//!
//! The reference implementation supervises plain OS processes
//! ([`local::LocalBackend`]); a cluster backend would submit to its queue in
//! `run` and interrogate the queue in its handle's `poll`.

pub mod local;

pub use local::LocalBackend;

use crate::descr::RunState;
use crate::error::Result;
use crate::node::Node;

/// A launched job, stored on its node until it reaches a terminal state
pub trait JobHandle {
    /// Non-blocking status check: `(RUNNING, None)` while live, otherwise
    /// `(SUCCESS, Some(0))` or `(FAIL, Some(code))`.
    fn poll(&mut self) -> Result<(RunState, Option<i32>)>;
}

/// Launch and poll jobs
pub trait Backend {
    /// Start the node's final command in its job directory. The returned
    /// handle is stored on the node.
    fn run(&self, node: &Node) -> Result<Box<dyn JobHandle>>;

    /// Poll the handle stored on `node`. A node without a handle reports
    /// FAIL: it claimed to be running but nothing was ever launched.
    fn get_state(&self, node: &mut Node) -> Result<(RunState, Option<i32>)> {
        match node.job.as_mut() {
            Some(job) => job.poll(),
            None => Ok((RunState::Fail, None)),
        }
    }
}
