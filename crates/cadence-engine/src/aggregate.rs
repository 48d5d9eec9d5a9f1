use cadence_core::{end, StepRef, Transition};

/// Combines N > 1 live steps into one step. `Batch::combine` and
/// `Parallel::combine` are the two aggregators.
pub type Aggregator = fn(Vec<StepRef>) -> StepRef;

/// Collapse a set of transitions into one.
///
/// Terminal transitions are discarded. No survivors collapse to `End`, a
/// single survivor is returned as-is, and anything more re-enters `combine`.
/// The result is `Pending` only when every survivor is still pending.
pub fn aggregate(
    combine: Aggregator,
    transitions: impl IntoIterator<Item = Transition>,
) -> Transition {
    let mut live: Vec<Transition> = transitions.into_iter().filter(|t| !t.is_end()).collect();

    if live.len() <= 1 {
        return live.pop().unwrap_or(Transition::End);
    }

    let all_pending = live.iter().all(Transition::is_pending);
    let steps = live.into_iter().filter_map(Transition::into_step).collect();
    let combined = combine(steps);
    if all_pending {
        Transition::Pending(combined)
    } else {
        Transition::Next(combined)
    }
}

pub fn aggregate_steps(
    combine: Aggregator,
    steps: impl IntoIterator<Item = StepRef>,
) -> Transition {
    aggregate(combine, steps.into_iter().map(Transition::from))
}

/// Turn an aggregated transition back into a step handle for callers that
/// compose with step values.
pub(crate) fn into_step(t: Transition) -> StepRef {
    t.into_step().unwrap_or_else(end)
}
