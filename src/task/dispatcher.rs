use tokio::sync::mpsc::UnboundedReceiver;

use crate::connection::ConnectionCore;

use super::baton::{Completion, Target};

/// Unlock, decrement, drain. Runs for every baton, success or failure.
pub(crate) fn run_trailer(target: &Target) {
    match target {
        Target::Resource(resource) => resource.end_operation(),
        Target::Connection(conn) => {
            conn.finish_operation();
            ConnectionCore::process(conn);
        }
    }
}

/// Per-connection completion loop.
///
/// The single place where completed batons re-enter the host context:
/// each one gets its mandatory trailer (unlock the resource, decrement
/// the pending counter, run the drains) before its result is delivered,
/// so callers and deferred terminal actions observe a consistent order.
/// The loop ends when the owning connection and all of its resources are
/// gone.
pub(crate) async fn run_completion_loop(mut receiver: UnboundedReceiver<Completion>) {
    while let Some(completion) = receiver.recv().await {
        match completion {
            Completion::Task { target, deliver } => {
                run_trailer(&target);
                deliver();
            }
            Completion::CloseDone { conn, outcome } => conn.finish_close(outcome),
        }
    }
}
