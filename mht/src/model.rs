//! Traits connecting the tracker to the host application.
//!
//! The tracker is generic over the target behavior ([`Model`]), the
//! measurement payload ([`Report`]) and the receiver of committed track
//! events ([`EventSink`]). It never looks inside a state estimate or a
//! report payload; everything it needs is exposed through these traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// External identity of a tracked target. Ids are assigned monotonically
/// when a track tree is born and persist for the lifetime of the tree.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A measurement payload, opaque to the tracker.
pub trait Report {
    /// Log-likelihood that this measurement is spurious.
    fn false_alarm_log_likelihood(&self) -> f64;
}

/// An estimated target state produced by a [`Model`].
pub trait StateEstimate {
    /// Log-likelihood that this state truly follows the state it was
    /// generated from (or truly begins a track, for states generated
    /// without a parent).
    fn log_likelihood(&self) -> f64;
}

/// A target behavior model.
///
/// In every scan the tracker asks the model for new state estimates via the
/// loop
///
/// ```text
/// let n = model.begin_new_states(parent, report);
/// for i in 0..n {
///     if let Some(state) = model.new_state(i, parent, report) { /* ... */ }
/// }
/// model.end_new_states();
/// ```
///
/// A `parent` of `None` asks for states that begin a new track from
/// `report`; a `report` of `None` asks for states that coast through a scan
/// in which the target was not detected. Returning `None` from
/// [`Model::new_state`] silently drops that hypothesis. The bracketing
/// calls let the model cache intermediate work.
///
/// All likelihoods are natural logarithms; `f64::NEG_INFINITY` means
/// "impossible".
pub trait Model<R: Report> {
    /// The state estimate type owned by the hypotheses this model grows.
    type State: StateEstimate;

    /// Announces a round of state generation and returns the number of
    /// estimates that will be asked for.
    fn begin_new_states(&mut self, parent: Option<&Self::State>, report: Option<&R>) -> usize;

    /// Returns the `index`-th state estimate of the current round, or
    /// `None` to drop it.
    fn new_state(
        &mut self,
        index: usize,
        parent: Option<&Self::State>,
        report: Option<&R>,
    ) -> Option<Self::State>;

    /// Closes a round of state generation.
    fn end_new_states(&mut self) {}

    /// Log-likelihood that a target in `state` disappears.
    fn end_log_likelihood(&self, state: &Self::State) -> f64;

    /// Log-likelihood that a target in `state` persists; the complement of
    /// [`Model::end_log_likelihood`].
    fn continue_log_likelihood(&self, state: &Self::State) -> f64;

    /// Log-likelihood that a persisting target in `state` goes undetected
    /// for one scan.
    fn skip_log_likelihood(&self, state: &Self::State) -> f64;

    /// Log-likelihood that a persisting target in `state` is detected; the
    /// complement of [`Model::skip_log_likelihood`].
    fn detect_log_likelihood(&self, state: &Self::State) -> f64;
}

/// Receiver of committed track decisions.
///
/// The tracker calls these methods while it verifies nodes during
/// [`Tracker::scan`](super::tracker::Tracker::scan) and
/// [`Tracker::clear`](super::tracker::Tracker::clear). The time argument is
/// the scan the decision refers to, which trails the current scan by up to
/// `max_depth - 1` scans. Every decision for a track is delivered exactly
/// once and in time order. The default implementations do nothing.
#[allow(unused_variables)]
pub trait EventSink<S, R> {
    /// A new track was confirmed, starting from `report`.
    fn start_track(&mut self, track: TrackId, time: i32, state: &S, report: &R) {}

    /// An existing track was observed again.
    fn continue_track(&mut self, track: TrackId, time: i32, state: &S, report: &R) {}

    /// An existing track persisted without being detected.
    fn skip_track(&mut self, track: TrackId, time: i32, state: &S) {}

    /// A track ended.
    fn end_track(&mut self, track: TrackId, time: i32) {}

    /// A report turned out to be spurious.
    fn false_alarm(&mut self, time: i32, report: &R) {}
}
