//! The multiple-hypothesis tracker.
//!
//! [`Tracker`] maintains a forest of track trees over a stream of report
//! batches. Each call to [`Tracker::scan`] grows every surviving leaf by the
//! new reports, regroups the trees into clusters, regenerates each cluster's
//! group hypotheses in likelihood order, prunes, and commits the decisions
//! that have become unambiguous. Commitments trail the data by up to
//! `max_depth - 1` scans.

use super::cluster::{Cluster, GhId, GroupHypo};
use super::error::{Error, Result};
use super::hypo::{Hypo, HypoKind};
use super::links::Relation;
use super::model::{EventSink, Model, Report, TrackId};
use super::murty::RankedAssignments;
use super::pqueue::LargestFirst;
use super::report::{ReportEntry, ReportId};
use super::tree::{Forest, NodeId};
use super::arena::Arena;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::mem;

/// Pruning parameters of a [`Tracker`].
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct TrackerParams {
    /// Depth at which a track tree is pruned down to a single choice from
    /// the root (N-scanback pruning). Must be positive.
    pub max_depth: usize,
    /// Minimum ratio between the likelihood of the worst group hypothesis
    /// kept and that of the best (ratio pruning). Must lie in `(0, 1]`.
    pub min_ghypo_ratio: f64,
    /// Maximum number of group hypotheses kept per cluster (k-best
    /// pruning). Must be positive.
    pub max_ghypos: usize,
}

/// Aggregate size counters of a [`Tracker`], as reported once per scan
/// through [`log`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TrackerStats {
    /// Number of live track trees.
    pub trees: usize,
    /// Number of live track hypotheses across all trees.
    pub hypos: usize,
    /// Number of clusters.
    pub clusters: usize,
    /// Number of group hypotheses across all clusters.
    pub group_hypos: usize,
    /// Largest group-hypothesis count of any single cluster.
    pub most_group_hypos: usize,
}

pub(crate) struct TrackTree {
    pub(crate) id: TrackId,
    pub(crate) root: NodeId,
    /// Cluster label; rederived every scan.
    pub(crate) cluster: i32,
}

/// A multiple-hypothesis tracker over model `M` and report payload `R`.
pub struct Tracker<M, R>
where
    M: Model<R>,
    R: Report,
{
    pub(crate) model: M,
    pub(crate) max_depth: usize,
    pub(crate) log_min_ghypo_ratio: f64,
    pub(crate) max_ghypos: usize,
    pub(crate) current_time: i32,
    next_track_id: u64,
    pub(crate) forest: Forest<Hypo<M::State>>,
    pub(crate) trees: Vec<TrackTree>,
    /// Index of the first tree that has not been given a cluster yet.
    pub(crate) next_new_tree: usize,
    pub(crate) clusters: Vec<Cluster>,
    pub(crate) ghypos: Arena<GroupHypo>,
    pub(crate) gh_hypos: Relation<GhId, NodeId>,
    pub(crate) reports: Arena<ReportEntry<R>>,
    pub(crate) report_hypos: Relation<ReportId, NodeId>,
    pub(crate) old_reports: Vec<ReportId>,
    pub(crate) new_reports: Vec<ReportId>,
    queued_batches: VecDeque<Vec<R>>,
    active_leaves: Vec<NodeId>,
    pub(crate) apqueue: RankedAssignments<GhId, NodeId>,
    pub(crate) merge_queue: LargestFirst<(usize, usize)>,
}

impl<M, R> Tracker<M, R>
where
    M: Model<R>,
    R: Report,
{
    /// Constructs a tracker around `model` with the given pruning
    /// parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if any parameter is outside its documented range.
    pub fn new(model: M, params: TrackerParams) -> Result<Self> {
        if params.max_depth == 0 {
            return Err(Error::General("max_depth must be positive".to_owned()));
        }
        if !(params.min_ghypo_ratio > 0.0 && params.min_ghypo_ratio <= 1.0) {
            return Err(Error::General(
                "min_ghypo_ratio must lie in (0, 1]".to_owned(),
            ));
        }
        if params.max_ghypos == 0 {
            return Err(Error::General("max_ghypos must be positive".to_owned()));
        }

        Ok(Self {
            model,
            max_depth: params.max_depth,
            log_min_ghypo_ratio: params.min_ghypo_ratio.ln(),
            max_ghypos: params.max_ghypos,
            current_time: 0,
            next_track_id: 0,
            forest: Forest::new(),
            trees: Vec::new(),
            next_new_tree: 0,
            clusters: Vec::new(),
            ghypos: Arena::new(),
            gh_hypos: Relation::new(),
            reports: Arena::new(),
            report_hypos: Relation::new(),
            old_reports: Vec::new(),
            new_reports: Vec::new(),
            queued_batches: VecDeque::new(),
            active_leaves: Vec::new(),
            apqueue: RankedAssignments::new(),
            merge_queue: LargestFirst::new(),
        })
    }

    /// Enqueues one scan's worth of report payloads. Batches are consumed
    /// in order, one per call to [`Tracker::scan`]; an empty batch is a
    /// valid scan in which nothing was detected.
    pub fn add_reports(&mut self, batch: Vec<R>) {
        self.queued_batches.push_back(batch);
    }

    /// Returns `true` if any track tree is still alive.
    #[must_use]
    pub fn is_in_use(&self) -> bool {
        !self.trees.is_empty()
    }

    /// Returns the number of scans processed so far.
    #[must_use]
    pub const fn current_time(&self) -> i32 {
        self.current_time
    }

    /// Returns a reference to the model.
    pub const fn model(&self) -> &M {
        &self.model
    }

    /// Returns the current size counters.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            trees: self.trees.len(),
            hypos: self.forest.len(),
            clusters: self.clusters.len(),
            group_hypos: self.ghypos.len(),
            most_group_hypos: self
                .clusters
                .iter()
                .map(|cluster| cluster.ghypos.len())
                .max()
                .unwrap_or(0),
        }
    }

    /// Processes the next queued report batch. Returns `true` if track
    /// trees remain active afterwards and `false` if the tracker is idle
    /// (no batch was queued, or nothing is being tracked).
    pub fn scan(&mut self, sink: &mut impl EventSink<M::State, R>) -> bool {
        let Some(batch) = self.queued_batches.pop_front() else {
            return false;
        };
        for payload in batch {
            let report = ReportId(self.reports.insert(ReportEntry::new(payload)));
            self.new_reports.push(report);
        }

        self.measure_and_validate();
        self.current_time += 1;

        self.active_leaves.clear();
        self.import_new_reports();

        if self.trees.is_empty() {
            return false;
        }

        self.make_new_clusters();
        self.find_cluster_labels();
        self.split_clusters();
        self.merge_clusters();

        self.prune_and_hypothesize();
        self.remove_unused_hypos();
        self.verify_tree_roots(sink);

        self.remove_unused_trees();
        self.remove_unused_reports();
        self.remove_unused_clusters();

        self.update_active_leaves();

        let stats = self.stats();
        log::debug!(
            "scan {}: {} trees, {} hypotheses, {} clusters, {} group hypotheses",
            self.current_time,
            stats.trees,
            stats.hypos,
            stats.clusters,
            stats.group_hypos
        );

        self.is_in_use()
    }

    /// Drains the tracker: prunes every cluster's best hypothesis at
    /// progressively shallower depths, verifying after each pass, until
    /// every tree has been forced to commit. Use when the input stream
    /// ends.
    pub fn clear(&mut self, sink: &mut impl EventSink<M::State, R>) {
        for depth in (0..=self.max_depth).rev() {
            for index in 0..self.clusters.len() {
                self.clear_cluster(index, depth);
            }
            self.verify_tree_roots(sink);
            self.remove_unused_trees();
            self.remove_unused_reports();
            self.remove_unused_clusters();
        }

        self.verify_last_tree_roots(sink);
        self.remove_unused_reports();
        self.remove_unused_clusters();
        self.active_leaves.clear();
    }

    /// Grows children under every active leaf, then starts a new track
    /// tree for each new report.
    fn measure_and_validate(&mut self) {
        let leaves = self.active_leaves.clone();
        let new_reports = self.new_reports.clone();

        for &leaf in &leaves {
            self.make_default_children(leaf);
            for &report in &new_reports {
                self.make_report_children(leaf, report);
            }
        }

        for &report in &new_reports {
            let root = self.install_tree();
            self.make_default_children(root);
            self.make_report_children(root, report);
        }
    }

    /// Grows the children of `leaf` that do not depend on any report.
    fn make_default_children(&mut self, leaf: NodeId) {
        match self.forest.get(leaf).kind() {
            HypoKind::Root | HypoKind::Dummy | HypoKind::FalseAlarm | HypoKind::End => {
                let log_likelihood = self.forest.get(leaf).log_likelihood();
                self.install_child(leaf, Hypo::dummy(log_likelihood), None);
            }
            HypoKind::Start | HypoKind::Continue | HypoKind::Skip => {
                let (parent_ll, end_ll, continue_ll, skip_ll) = {
                    let node = self.forest.get(leaf);
                    let state = node.state().unwrap_or_else(|| unreachable!());
                    (
                        node.log_likelihood(),
                        self.model.end_log_likelihood(state),
                        self.model.continue_log_likelihood(state),
                        self.model.skip_log_likelihood(state),
                    )
                };

                if end_ll != f64::NEG_INFINITY {
                    self.install_child(leaf, Hypo::end(parent_ll, skip_ll, end_ll), None);
                }

                if continue_ll != f64::NEG_INFINITY {
                    let count = self
                        .model
                        .begin_new_states(self.forest.get(leaf).state(), None);
                    for index in 0..count {
                        let state =
                            self.model
                                .new_state(index, self.forest.get(leaf).state(), None);
                        if let Some(state) = state {
                            self.install_child(
                                leaf,
                                Hypo::skip(parent_ll, continue_ll, skip_ll, state),
                                None,
                            );
                        }
                    }
                    self.model.end_new_states();
                }
            }
        }
    }

    /// Grows the children of `leaf` that explain `report`.
    fn make_report_children(&mut self, leaf: NodeId, report: ReportId) {
        match self.forest.get(leaf).kind() {
            HypoKind::Root => {
                let falarm_ll = self
                    .reports
                    .get(report.0)
                    .payload()
                    .false_alarm_log_likelihood();
                self.install_child(leaf, Hypo::false_alarm(falarm_ll), Some(report));

                let count = self
                    .model
                    .begin_new_states(None, Some(self.reports.get(report.0).payload()));
                for index in 0..count {
                    let state = self.model.new_state(
                        index,
                        None,
                        Some(self.reports.get(report.0).payload()),
                    );
                    if let Some(state) = state {
                        self.install_child(leaf, Hypo::start(state), Some(report));
                    }
                }
                self.model.end_new_states();
            }
            HypoKind::Dummy | HypoKind::FalseAlarm | HypoKind::End => {}
            HypoKind::Start | HypoKind::Continue | HypoKind::Skip => {
                let (parent_ll, continue_ll, detect_ll) = {
                    let node = self.forest.get(leaf);
                    let state = node.state().unwrap_or_else(|| unreachable!());
                    (
                        node.log_likelihood(),
                        self.model.continue_log_likelihood(state),
                        self.model.detect_log_likelihood(state),
                    )
                };

                let count = self.model.begin_new_states(
                    self.forest.get(leaf).state(),
                    Some(self.reports.get(report.0).payload()),
                );
                for index in 0..count {
                    let state = self.model.new_state(
                        index,
                        self.forest.get(leaf).state(),
                        Some(self.reports.get(report.0).payload()),
                    );
                    if let Some(state) = state {
                        self.install_child(
                            leaf,
                            Hypo::continuation(parent_ll, continue_ll, detect_ll, state),
                            Some(report),
                        );
                    }
                }
                self.model.end_new_states();
            }
        }
    }

    /// Installs `hypo` as the last child of `parent`, stamping it and
    /// linking it to `report` if one is given.
    fn install_child(
        &mut self,
        parent: NodeId,
        mut hypo: Hypo<M::State>,
        report: Option<ReportId>,
    ) -> NodeId {
        let (track, time_stamp) = {
            let node = self.forest.get(parent);
            (node.track(), node.time_stamp() + 1)
        };
        hypo.set_stamps(track, time_stamp);
        let id = self.forest.install_child(parent, hypo);
        if let Some(report) = report {
            self.report_hypos.insert(report, id);
        }
        id
    }

    /// Starts a new track tree. The root is stamped one scan back so that
    /// the leaves grown for the current batch carry the current time.
    fn install_tree(&mut self) -> NodeId {
        let id = TrackId(self.next_track_id);
        self.next_track_id += 1;

        let mut root = Hypo::root();
        root.set_stamps(id, self.current_time - 1);
        let node = self.forest.insert_root(root);
        self.trees.push(TrackTree {
            id,
            root: node,
            cluster: 0,
        });
        node
    }

    /// Assigns row numbers to the new reports in insertion order and moves
    /// them to the old-report list.
    fn import_new_reports(&mut self) {
        for (index, &report) in self.new_reports.iter().enumerate() {
            self.reports.get_mut(report.0).row =
                i32::try_from(index).unwrap_or_else(|_| unreachable!());
        }
        let mut imported = mem::take(&mut self.new_reports);
        self.old_reports.append(&mut imported);
    }

    /// Position of the tree with the given id. Trees are born with
    /// ascending ids and never reordered, so the list is searchable.
    pub(crate) fn tree_index(&self, id: TrackId) -> usize {
        self.trees
            .binary_search_by_key(&id, |tree| tree.id)
            .unwrap_or_else(|_| panic!("track {id} is not alive"))
    }

    /// The report referenced by `node`, if any.
    pub(crate) fn report_of(&self, node: NodeId) -> Option<ReportId> {
        self.report_hypos.lefts_of(node).first().copied()
    }

    /// Removes the subtree under `id` together with all links into it.
    pub(crate) fn remove_subtree(&mut self, id: NodeId) {
        for (node, _) in self.forest.remove_subtree(id) {
            self.report_hypos.drop_right(node);
            self.gh_hypos.drop_right(node);
        }
    }

    /// Removes every hypothesis that no longer takes part in any group
    /// hypothesis: leaves without links, then any ancestors that lost all
    /// their children.
    fn remove_unused_hypos(&mut self) {
        for index in 0..self.trees.len() {
            let order: Vec<NodeId> = self.forest.postorder(self.trees[index].root).collect();
            for node in order {
                if !self.forest.contains(node) {
                    continue;
                }
                let in_use = !self.forest.is_leaf(node)
                    || !self.gh_hypos.lefts_of(node).is_empty();
                if !in_use {
                    self.remove_subtree(node);
                }
            }
        }
    }

    /// Commits and removes every root that pruning has left with exactly
    /// one child; the lone child becomes the new root. A terminal root is
    /// verified in place.
    fn verify_tree_roots(&mut self, sink: &mut impl EventSink<M::State, R>) {
        for index in 0..self.trees.len() {
            let mut root = self.trees[index].root;

            loop {
                let (collapses, must_verify) = {
                    let node = self.forest.get(root);
                    (
                        self.forest.children(root).len() == 1 && !node.ends_track(),
                        node.must_verify(),
                    )
                };
                if !collapses {
                    break;
                }

                if must_verify {
                    self.emit(root, sink);
                }
                let (new_root, _) = self.forest.remove_root(root);
                self.report_hypos.drop_right(root);
                self.gh_hypos.drop_right(root);
                self.trees[index].root = new_root;
                root = new_root;
            }

            let (ends_track, must_verify) = {
                let node = self.forest.get(root);
                (node.ends_track(), node.must_verify())
            };
            if ends_track && must_verify {
                self.emit(root, sink);
            }
        }
    }

    /// Force-verifies whatever roots remain and drops their trees; the
    /// last step of [`Tracker::clear`].
    fn verify_last_tree_roots(&mut self, sink: &mut impl EventSink<M::State, R>) {
        let trees = mem::take(&mut self.trees);
        for tree in &trees {
            if self.forest.get(tree.root).must_verify() {
                self.emit(tree.root, sink);
            }
            self.remove_subtree(tree.root);
        }
        self.next_new_tree = 0;
    }

    /// Delivers the committed decision of `node` to the host.
    fn emit(&self, node: NodeId, sink: &mut impl EventSink<M::State, R>) {
        let hypo = self.forest.get(node);
        let track = hypo.track();
        let time = hypo.time_stamp();

        match hypo.kind() {
            HypoKind::Start => {
                // UNWRAP: start nodes always carry a state and a report
                let state = hypo.state().unwrap_or_else(|| unreachable!());
                let report = self.report_of(node).unwrap_or_else(|| unreachable!());
                sink.start_track(track, time, state, self.reports.get(report.0).payload());
            }
            HypoKind::Continue => {
                let state = hypo.state().unwrap_or_else(|| unreachable!());
                let report = self.report_of(node).unwrap_or_else(|| unreachable!());
                sink.continue_track(track, time, state, self.reports.get(report.0).payload());
            }
            HypoKind::Skip => {
                let state = hypo.state().unwrap_or_else(|| unreachable!());
                sink.skip_track(track, time, state);
            }
            HypoKind::End => sink.end_track(track, time),
            HypoKind::FalseAlarm => {
                let report = self.report_of(node).unwrap_or_else(|| unreachable!());
                sink.false_alarm(time, self.reports.get(report.0).payload());
            }
            HypoKind::Root | HypoKind::Dummy => unreachable!("kind never verifies"),
        }
    }

    /// Drops trees that are finished: the root ends the track, or no path
    /// will ever require verification again.
    fn remove_unused_trees(&mut self) {
        let mut index = 0;
        while index < self.trees.len() {
            if self.tree_in_use(index) {
                index += 1;
            } else {
                let tree = self.trees.remove(index);
                self.remove_subtree(tree.root);
            }
        }
        self.next_new_tree = self.trees.len();
    }

    fn tree_in_use(&self, index: usize) -> bool {
        let root = self.trees[index].root;
        if self.forest.get(root).ends_track() {
            return false;
        }
        self.forest.preorder(root).any(|node| {
            let hypo = self.forest.get(node);
            hypo.must_verify() || (self.forest.is_leaf(node) && !hypo.ends_track())
        })
    }

    /// Frees reports that no hypothesis references anymore.
    fn remove_unused_reports(&mut self) {
        let mut index = 0;
        while index < self.old_reports.len() {
            let report = self.old_reports[index];
            if self.report_hypos.rights_of(report).is_empty() {
                self.old_reports.remove(index);
                self.reports.remove(report.0);
            } else {
                index += 1;
            }
        }
    }

    /// Rebuilds the list of leaves to be grown in the next scan.
    fn update_active_leaves(&mut self) {
        self.active_leaves.clear();
        for index in 0..self.trees.len() {
            let root = self.trees[index].root;
            let mut leaves: Vec<NodeId> = self
                .forest
                .preorder(root)
                .filter(|&node| self.forest.is_leaf(node))
                .collect();
            self.active_leaves.append(&mut leaves);
        }
    }
}
