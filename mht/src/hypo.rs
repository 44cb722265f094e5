//! Track-hypothesis nodes.
//!
//! A [`Hypo`] is one node of a track tree: one possible fate of one target
//! at one scan. Its log-likelihood is the sum of the per-scan transition
//! likelihoods along the path from the tree root, so siblings can be
//! compared directly and a group hypothesis can score itself by adding the
//! values of its leaves.

use super::model::{StateEstimate, TrackId};
use bitflags::bitflags;

/// The kind of event a hypothesis node postulates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HypoKind {
    /// Origin of a track tree; carries no likelihood of its own.
    Root,
    /// Placeholder that carries its parent's likelihood through a scan
    /// without committing to anything.
    Dummy,
    /// The report that spawned this tree was spurious.
    FalseAlarm,
    /// First observation of a new target.
    Start,
    /// The target persisted and was observed again.
    Continue,
    /// The target persisted but was not detected this scan.
    Skip,
    /// The target departed.
    End,
}

bitflags! {
    /// Per-node flags.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct HypoFlags: u8 {
        /// The tree is of no further use once this node is confirmed.
        const ENDS_TRACK = 1;
        /// Confirming this node must be announced to the host.
        const MUST_VERIFY = 1 << 1;
        /// Transient mark used while collapsing duplicate group hypotheses.
        const MARKED = 1 << 2;
    }
}

/// One node of a track tree.
pub struct Hypo<S> {
    kind: HypoKind,
    flags: HypoFlags,
    log_likelihood: f64,
    track: TrackId,
    time_stamp: i32,
    state: Option<S>,
}

impl<S> Hypo<S> {
    fn new(kind: HypoKind, flags: HypoFlags, log_likelihood: f64, state: Option<S>) -> Self {
        Self {
            kind,
            flags,
            log_likelihood,
            track: TrackId(0),
            time_stamp: 0,
            state,
        }
    }

    /// Root of a new track tree.
    #[must_use]
    pub fn root() -> Self {
        Self::new(HypoKind::Root, HypoFlags::empty(), 0.0, None)
    }

    /// Placeholder child carrying `parent_log_likelihood` forward.
    #[must_use]
    pub fn dummy(parent_log_likelihood: f64) -> Self {
        Self::new(
            HypoKind::Dummy,
            HypoFlags::ENDS_TRACK,
            parent_log_likelihood,
            None,
        )
    }

    /// The spawning report was a false alarm.
    #[must_use]
    pub fn false_alarm(report_log_likelihood: f64) -> Self {
        Self::new(
            HypoKind::FalseAlarm,
            HypoFlags::ENDS_TRACK | HypoFlags::MUST_VERIFY,
            report_log_likelihood,
            None,
        )
    }

    /// The target ended after the parent state.
    #[must_use]
    pub fn end(parent_log_likelihood: f64, skip_log_likelihood: f64, end_log_likelihood: f64) -> Self {
        Self::new(
            HypoKind::End,
            HypoFlags::ENDS_TRACK | HypoFlags::MUST_VERIFY,
            parent_log_likelihood + skip_log_likelihood + end_log_likelihood,
            None,
        )
    }

    /// Returns the kind of this node.
    #[must_use]
    pub const fn kind(&self) -> HypoKind {
        self.kind
    }

    /// Returns `true` if the tree is done once this node is confirmed.
    #[must_use]
    pub fn ends_track(&self) -> bool {
        self.flags.contains(HypoFlags::ENDS_TRACK)
    }

    /// Returns `true` if confirming this node must be announced.
    #[must_use]
    pub fn must_verify(&self) -> bool {
        self.flags.contains(HypoFlags::MUST_VERIFY)
    }

    /// Log-likelihood of the path from the tree root to this node.
    #[must_use]
    pub const fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Id of the track tree this node belongs to.
    #[must_use]
    pub const fn track(&self) -> TrackId {
        self.track
    }

    /// Scan index at which this node was born.
    #[must_use]
    pub const fn time_stamp(&self) -> i32 {
        self.time_stamp
    }

    /// The state estimate owned by this node, if its kind carries one.
    #[must_use]
    pub const fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    pub(crate) fn set_stamps(&mut self, track: TrackId, time_stamp: i32) {
        self.track = track;
        self.time_stamp = time_stamp;
    }

    pub(crate) fn mark(&mut self) {
        self.flags.insert(HypoFlags::MARKED);
    }

    pub(crate) fn unmark(&mut self) {
        self.flags.remove(HypoFlags::MARKED);
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.flags.contains(HypoFlags::MARKED)
    }
}

impl<S: StateEstimate> Hypo<S> {
    /// First observation of a new target described by `state`.
    #[must_use]
    pub fn start(state: S) -> Self {
        let log_likelihood = state.log_likelihood();
        Self::new(
            HypoKind::Start,
            HypoFlags::MUST_VERIFY,
            log_likelihood,
            Some(state),
        )
    }

    /// The target persisted and was detected as `state`.
    #[must_use]
    pub fn continuation(
        parent_log_likelihood: f64,
        continue_log_likelihood: f64,
        detect_log_likelihood: f64,
        state: S,
    ) -> Self {
        let log_likelihood = parent_log_likelihood
            + continue_log_likelihood
            + detect_log_likelihood
            + state.log_likelihood();
        Self::new(
            HypoKind::Continue,
            HypoFlags::MUST_VERIFY,
            log_likelihood,
            Some(state),
        )
    }

    /// The target persisted as `state` but went undetected.
    #[must_use]
    pub fn skip(
        parent_log_likelihood: f64,
        continue_log_likelihood: f64,
        skip_log_likelihood: f64,
        state: S,
    ) -> Self {
        let log_likelihood = parent_log_likelihood
            + continue_log_likelihood
            + skip_log_likelihood
            + state.log_likelihood();
        Self::new(
            HypoKind::Skip,
            HypoFlags::MUST_VERIFY,
            log_likelihood,
            Some(state),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    struct Fixed(f64);

    impl StateEstimate for Fixed {
        fn log_likelihood(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn likelihood_arithmetic_is_additive() {
        let root = Hypo::<Fixed>::root();
        assert_eq!(root.log_likelihood(), 0.0);

        let start = Hypo::start(Fixed(-1.0));
        assert_approx_eq!(f64, start.log_likelihood(), -1.0, ulps = 2);

        let cont = Hypo::continuation(-1.0, -0.1, -0.2, Fixed(-0.5));
        assert_approx_eq!(f64, cont.log_likelihood(), -1.8, ulps = 2);

        let skip = Hypo::skip(-1.8, -0.1, -2.3, Fixed(-0.5));
        assert_approx_eq!(f64, skip.log_likelihood(), -4.7, ulps = 2);

        let end = Hypo::<Fixed>::end(-4.7, -2.3, -0.7);
        assert_approx_eq!(f64, end.log_likelihood(), -7.7, ulps = 2);

        let dummy = Hypo::<Fixed>::dummy(-7.7);
        assert_approx_eq!(f64, dummy.log_likelihood(), -7.7, ulps = 2);
    }

    #[test]
    fn terminal_kinds_end_the_track() {
        assert!(Hypo::<Fixed>::dummy(0.0).ends_track());
        assert!(Hypo::<Fixed>::false_alarm(-10.0).ends_track());
        assert!(Hypo::<Fixed>::end(0.0, 0.0, 0.0).ends_track());
        assert!(!Hypo::<Fixed>::root().ends_track());
        assert!(!Hypo::start(Fixed(0.0)).ends_track());
        assert!(!Hypo::continuation(0.0, 0.0, 0.0, Fixed(0.0)).ends_track());
        assert!(!Hypo::skip(0.0, 0.0, 0.0, Fixed(0.0)).ends_track());
    }

    #[test]
    fn only_committal_kinds_verify() {
        assert!(!Hypo::<Fixed>::root().must_verify());
        assert!(!Hypo::<Fixed>::dummy(0.0).must_verify());
        assert!(Hypo::<Fixed>::false_alarm(0.0).must_verify());
        assert!(Hypo::start(Fixed(0.0)).must_verify());
        assert!(Hypo::continuation(0.0, 0.0, 0.0, Fixed(0.0)).must_verify());
        assert!(Hypo::skip(0.0, 0.0, 0.0, Fixed(0.0)).must_verify());
        assert!(Hypo::<Fixed>::end(0.0, 0.0, 0.0).must_verify());
    }

    #[test]
    fn marks_are_transient() {
        let mut hypo = Hypo::start(Fixed(0.0));
        assert!(!hypo.is_marked());
        hypo.mark();
        assert!(hypo.is_marked());
        hypo.unmark();
        assert!(!hypo.is_marked());
        assert!(hypo.must_verify());
    }
}
