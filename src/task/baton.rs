use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::connection::ConnectionCore;
use crate::error::DispatchError;
use crate::resource::ResourceCore;

/// What the completion trailer operates on: a lockable resource, or the
/// connection itself for handle-level work (exec, prepare, backup init).
#[derive(Clone)]
pub(crate) enum Target {
    Connection(Arc<ConnectionCore>),
    Resource(Arc<ResourceCore>),
}

impl Target {
    pub(crate) fn connection(&self) -> &Arc<ConnectionCore> {
        match self {
            Target::Connection(conn) => conn,
            Target::Resource(resource) => resource.connection(),
        }
    }
}

pub(crate) type Deliver = Box<dyn FnOnce() + Send>;

/// Message from a worker context to the completion loop.
pub(crate) enum Completion {
    /// An operation finished executing; run the trailer, then deliver.
    Task { target: Target, deliver: Deliver },
    /// The deferred native close finished.
    CloseDone {
        conn: Arc<ConnectionCore>,
        outcome: Result<(), DispatchError>,
    },
}

/// One queued operation's through-line: the trailer target, the
/// completion channel back to the host context, and the caller's result
/// slot.
///
/// A baton is built on the submitting task and consumed exactly once by
/// [`Baton::finish`] on whichever worker context ran the operation.
pub(crate) struct Baton<T> {
    target: Target,
    completions: UnboundedSender<Completion>,
    respond_to: oneshot::Sender<Result<T, DispatchError>>,
}

impl<T: Send + 'static> Baton<T> {
    pub(crate) fn new(
        target: Target,
        respond_to: oneshot::Sender<Result<T, DispatchError>>,
    ) -> Self {
        let completions = target.connection().completions();
        Self {
            target,
            completions,
            respond_to,
        }
    }

    /// Store the outcome and enqueue the completion. Delivery to the
    /// caller happens on the host context, after the trailer, so a
    /// caller that observes its result always observes the unlocked
    /// resource too.
    pub(crate) fn finish(self, outcome: Result<T, DispatchError>) {
        let Baton {
            target,
            completions,
            respond_to,
        } = self;
        let deliver: Deliver = Box::new(move || {
            let _ = respond_to.send(outcome);
        });
        let _ = completions.send(Completion::Task { target, deliver });
    }
}
