//! Growth decision for the execution pool.
//!
//! Evaluated by the dispatcher only after an item was not accepted
//! within the threshold. Growth only: the pool never shrinks on its
//! own.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingDecision {
    /// Threads the backlog calls for, capped at `max`.
    pub needed: usize,
    /// Pool size to grow to, or `None` if no growth is warranted.
    pub grow_to: Option<usize>,
}

impl ScalingDecision {
    /// `needed = min(in_work + queued, max)`; if `current < needed`,
    /// grow to `min(needed + increment, max)`.
    pub fn evaluate(
        current: usize,
        in_work: usize,
        queued: usize,
        max: usize,
        increment: usize,
    ) -> Self {
        let needed = in_work.saturating_add(queued).min(max);
        let grow_to = if current < needed {
            Some(needed.saturating_add(increment).min(max))
        } else {
            None
        };
        Self { needed, grow_to }
    }
}
