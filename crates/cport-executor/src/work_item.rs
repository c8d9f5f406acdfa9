//! `WorkItem`: a unit of work submitted to `AdaptiveWorkerService`.

use std::fmt;

/// A boxed callable run at most once on an execution thread.
pub struct WorkItem {
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl WorkItem {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// A callable with one argument captured alongside it.
    pub fn with_arg<F, A>(f: F, arg: A) -> Self
    where
        F: FnOnce(A) + Send + 'static,
        A: Send + 'static,
    {
        Self::new(move || f(arg))
    }

    #[inline]
    pub fn run(self) {
        (self.f)()
    }
}

impl<F> From<F> for WorkItem
where
    F: FnOnce() + Send + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkItem")
    }
}
