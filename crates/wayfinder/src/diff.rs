//! Param diffing: the five-way decision behind every lifecycle action.

/// Lifecycle action implied by comparing a controller's previous params with
/// the params derived from the new route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Absent → absent, or present → structurally equal.
    Unchanged,
    /// Absent → present.
    Start,
    /// Present → absent.
    Stop,
    /// Present → structurally different. Stop with the old params, then start
    /// with the new ones.
    Restart,
}

impl Transition {
    /// Takes part in the stop phase of a reconciliation batch.
    pub fn stops(self) -> bool {
        matches!(self, Transition::Stop | Transition::Restart)
    }

    /// Takes part in the start phase of a reconciliation batch.
    pub fn starts(self) -> bool {
        matches!(self, Transition::Start | Transition::Restart)
    }
}

/// Decide the transition from `previous` to `next` params.
pub fn diff<P>(previous: Option<&P>, next: Option<&P>) -> Transition
where
    P: PartialEq + ?Sized,
{
    match (previous, next) {
        (None, None) => Transition::Unchanged,
        (None, Some(_)) => Transition::Start,
        (Some(_), None) => Transition::Stop,
        (Some(prev), Some(next)) if prev == next => Transition::Unchanged,
        (Some(_), Some(_)) => Transition::Restart,
    }
}
