// Work-queue protocol: a baton per submitted operation, a scheduler that
// runs the operation off the host thread, and a per-connection completion
// loop that marshals the trailer back onto the host context.

mod baton;
mod dispatcher;
mod runner;

pub(crate) use baton::{Baton, Completion, Target};
pub(crate) use dispatcher::run_completion_loop;
pub(crate) use runner::{schedule_blocking, submit};
