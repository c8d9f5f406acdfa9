//! Pluggable completion handler run by every pool worker.

use crate::packet::Completion;

/// What the worker loop does after the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    Continue,
    Exit,
}

/// Handles one completion on a pool worker thread.
///
/// Handlers may block; a blocked handler keeps its worker busy and,
/// unless it opts out with `releases_slot`, its concurrency slot held.
/// A panic is caught at the worker loop boundary.
pub trait CompletionHandler<P>: Send + Sync {
    fn handle(&self, completion: Completion<P>) -> HandlerAction;

    /// When true the worker leaves the queue's concurrency gate before
    /// calling `handle`, so another waiter may dequeue while this one
    /// runs. The slot is taken again on the next `wait()`.
    fn releases_slot(&self) -> bool {
        false
    }
}

impl<P, F> CompletionHandler<P> for F
where
    F: Fn(Completion<P>) -> HandlerAction + Send + Sync,
{
    #[inline]
    fn handle(&self, completion: Completion<P>) -> HandlerAction {
        self(completion)
    }
}
