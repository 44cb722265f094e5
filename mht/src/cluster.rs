//! Clusters and group hypotheses.
//!
//! A cluster is a maximal set of track trees whose leaves transitively
//! share reports; trees in different clusters are independent and are
//! pruned separately. A group hypothesis picks one leaf from each tree of
//! its cluster such that no two picks share a report, and scores itself
//! with the sum of their log-likelihoods.
//!
//! Cluster labels are a per-scan workspace: every scan the reports
//! propagate fresh labels through the trees that reference them
//! (transitive closure), clusters split where their trees drifted apart
//! and merge where the labels collide, and then every cluster rebuilds its
//! group hypotheses from the ranked solutions of the assignment problems
//! its previous hypotheses define.

use super::assign::UNASSIGNED;
use super::model::{Model, Report};
use super::murty::ProblemArc;
use super::tracker::Tracker;
use super::tree::NodeId;
use itertools::Itertools;
use rustc_hash::FxHashSet;

/// Identifier of a group hypothesis.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GhId(pub(crate) usize);

/// A consistent interpretation of one cluster: one leaf per tree, scored by
/// the sum of the leaves' log-likelihoods. The hypotheses themselves are
/// referenced through the tracker's link relation.
pub struct GroupHypo {
    pub(crate) log_likelihood: f64,
    /// Number of linked hypotheses when this hypothesis' assignment problem
    /// was built. Pruning removes links, so a live count below this
    /// snapshot means the hypothesis has been invalidated.
    pub(crate) snapshot: usize,
}

/// A cluster: its group hypotheses in descending likelihood order. The
/// member trees are implicit, since every group hypothesis selects one
/// leaf from each of them.
pub struct Cluster {
    pub(crate) ghypos: Vec<GhId>,
}

impl<M, R> Tracker<M, R>
where
    M: Model<R>,
    R: Report,
{
    pub(crate) fn new_ghypo(&mut self) -> GhId {
        GhId(self.ghypos.insert(GroupHypo {
            log_likelihood: 0.0,
            snapshot: 0,
        }))
    }

    pub(crate) fn free_ghypo(&mut self, gh: GhId) {
        self.gh_hypos.drop_left(gh);
        self.ghypos.remove(gh.0);
    }

    fn add_hypo_to_ghypo(&mut self, gh: GhId, node: NodeId) {
        let log_likelihood = self.forest.get(node).log_likelihood();
        self.ghypos.get_mut(gh.0).log_likelihood += log_likelihood;
        self.gh_hypos.insert(gh, node);
    }

    fn recompute_ghypo_log_likelihood(&mut self, gh: GhId) {
        let log_likelihood: f64 = self
            .gh_hypos
            .rights_of(gh)
            .iter()
            .map(|&node| self.forest.get(node).log_likelihood())
            .sum();
        self.ghypos.get_mut(gh.0).log_likelihood = log_likelihood;
    }

    /// Cluster label of the tree that owns `node`.
    fn hypo_cluster_label(&self, node: NodeId) -> i32 {
        let track = self.forest.get(node).track();
        self.trees[self.tree_index(track)].cluster
    }

    /// Label identifying the cluster at `index`, or `None` if it has no
    /// hypotheses left.
    fn cluster_label(&self, index: usize) -> Option<i32> {
        let &gh = self.clusters[index].ghypos.first()?;
        let &node = self.gh_hypos.rights_of(gh).first()?;
        Some(self.hypo_cluster_label(node))
    }

    /// Puts every tree born since the last scan into a cluster of its own,
    /// with a single group hypothesis selecting the tree's root.
    pub(crate) fn make_new_clusters(&mut self) {
        for index in self.next_new_tree..self.trees.len() {
            let root = self.trees[index].root;
            let gh = self.new_ghypo();
            self.add_hypo_to_ghypo(gh, root);
            self.clusters.push(Cluster { ghypos: vec![gh] });
        }
        self.next_new_tree = self.trees.len();
    }

    /// Rederives the cluster labels: every report propagates a fresh label
    /// to all trees referencing it, and transitively through those trees'
    /// other reports. Trees referencing no report get labels of their own.
    pub(crate) fn find_cluster_labels(&mut self) {
        debug_assert!(self.new_reports.is_empty());

        for tree in &mut self.trees {
            tree.cluster = -1;
        }

        let mut next = 1;
        for position in 0..self.old_reports.len() {
            self.relabel_from(position, next);
            next += 1;
        }

        for tree in &mut self.trees {
            if tree.cluster == -1 {
                tree.cluster = next;
                next += 1;
            }
        }
    }

    /// Gives `label` to the report at `position` and to every tree that
    /// references it. A tree that already carried a different label pulls
    /// all earlier reports with that label over to the new one, which
    /// closes the labels transitively. Only earlier reports are rescanned;
    /// later ones still carry stale labels from the previous scan.
    fn relabel_from(&mut self, position: usize, label: i32) {
        let report = self.old_reports[position];
        self.reports.get_mut(report.0).cluster = label;

        for node in self.report_hypos.rights_of(report).to_vec() {
            let track = self.forest.get(node).track();
            let index = self.tree_index(track);
            let previous = self.trees[index].cluster;

            if previous != label {
                self.trees[index].cluster = label;
                if previous != -1 {
                    for earlier in (0..position).rev() {
                        if self.reports.get(self.old_reports[earlier].0).cluster == previous {
                            self.relabel_from(earlier, label);
                        }
                    }
                }
            }
        }
    }

    /// Splits every cluster whose trees no longer share reports. A new
    /// cluster is inserted immediately after the one it came from, so the
    /// sweep revisits it and splits further if needed.
    pub(crate) fn split_clusters(&mut self) {
        let mut index = 0;
        while index < self.clusters.len() {
            if let Some(cluster) = self.split_cluster(index) {
                self.clusters.insert(index + 1, cluster);
            }
            index += 1;
        }
    }

    fn split_cluster(&mut self, index: usize) -> Option<Cluster> {
        let ghs = self.clusters[index].ghypos.clone();
        let &first = ghs.first()?;
        if !self.ghypo_must_split(first) {
            return None;
        }

        let keep = self.hypo_cluster_label(*self.gh_hypos.rights_of(first).first()?);
        let mut extracted = Vec::with_capacity(ghs.len());
        for &gh in &ghs {
            extracted.push(self.split_ghypo(gh, keep));
        }

        // splitting can leave hypotheses that only differed in the trees
        // that moved away, on either side
        let mut kept = std::mem::take(&mut self.clusters[index].ghypos);
        self.remove_repeated_ghypos(&mut kept);
        self.clusters[index].ghypos = kept;
        self.remove_repeated_ghypos(&mut extracted);

        log::trace!("cluster {index} split");
        Some(Cluster { ghypos: extracted })
    }

    /// A group hypothesis must split when it postulates hypotheses whose
    /// trees carry different cluster labels.
    fn ghypo_must_split(&self, gh: GhId) -> bool {
        let hypos = self.gh_hypos.rights_of(gh);
        let Some(&first) = hypos.first() else {
            return false;
        };
        let label = self.hypo_cluster_label(first);
        hypos
            .iter()
            .any(|&node| self.hypo_cluster_label(node) != label)
    }

    /// Moves every hypothesis whose tree is not labelled `keep` into a new
    /// group hypothesis and returns it.
    fn split_ghypo(&mut self, gh: GhId, keep: i32) -> GhId {
        let extracted = self.new_ghypo();
        for node in self.gh_hypos.rights_of(gh).to_vec() {
            if self.hypo_cluster_label(node) != keep {
                self.gh_hypos.remove(gh, node);
                let log_likelihood = self.forest.get(node).log_likelihood();
                self.ghypos.get_mut(gh.0).log_likelihood -= log_likelihood;
                self.add_hypo_to_ghypo(extracted, node);
            }
        }
        extracted
    }

    /// Collapses group hypotheses that select exactly the same set of
    /// hypotheses, keeping the first of each family.
    fn remove_repeated_ghypos(&mut self, list: &mut Vec<GhId>) {
        let mut index = 0;
        while index < list.len() {
            let anchor = list[index];
            for node in self.gh_hypos.rights_of(anchor).to_vec() {
                self.forest.get_mut(node).mark();
            }

            let mut other = index + 1;
            while other < list.len() {
                let candidate = list[other];
                let repeated = self
                    .gh_hypos
                    .rights_of(candidate)
                    .iter()
                    .all(|&node| self.forest.get(node).is_marked());
                if repeated {
                    list.remove(other);
                    self.free_ghypo(candidate);
                } else {
                    other += 1;
                }
            }

            for node in self.gh_hypos.rights_of(anchor).to_vec() {
                self.forest.get_mut(node).unmark();
            }
            index += 1;
        }
    }

    /// Merges every pair of clusters whose trees now share a label.
    pub(crate) fn merge_clusters(&mut self) {
        let mut index = 0;
        while index < self.clusters.len() {
            if let Some(label) = self.cluster_label(index) {
                let mut other = index + 1;
                while other < self.clusters.len() {
                    if self.cluster_label(other) == Some(label) {
                        let source = self.clusters.remove(other);
                        self.merge_cluster(index, source);
                    } else {
                        other += 1;
                    }
                }
            }
            index += 1;
        }
    }

    /// Merges `source` into the cluster at `index`. When the source has a
    /// single group hypothesis its picks are folded into every hypothesis
    /// of the target in place. Otherwise the merged hypotheses are
    /// generated best-first from the two likelihood-sorted lists, walking
    /// the Cartesian frontier with a priority queue until the ratio or
    /// k-best bound trips.
    fn merge_cluster(&mut self, index: usize, source: Cluster) {
        let source_ghs = source.ghypos;

        if source_ghs.len() == 1 {
            let donor = source_ghs[0];
            for gh in self.clusters[index].ghypos.clone() {
                for node in self.gh_hypos.rights_of(donor).to_vec() {
                    self.add_hypo_to_ghypo(gh, node);
                }
            }
            self.free_ghypo(donor);
            return;
        }

        for &gh in &self.clusters[index].ghypos.clone() {
            self.recompute_ghypo_log_likelihood(gh);
        }
        for &gh in &source_ghs {
            self.recompute_ghypo_log_likelihood(gh);
        }

        let sorted_desc = |tracker: &Self, ghs: &[GhId]| -> Vec<(GhId, f64)> {
            ghs.iter()
                .map(|&gh| (gh, tracker.ghypos.get(gh.0).log_likelihood))
                .sorted_by(|a, b| b.1.total_cmp(&a.1))
                .collect()
        };
        let left = sorted_desc(self, &self.clusters[index].ghypos);
        let right = sorted_desc(self, &source_ghs);

        self.merge_queue.clear();
        let mut used: FxHashSet<(usize, usize)> = FxHashSet::default();
        let mut pair = (0, 0);
        let best = left[0].1 + right[0].1;
        let mut pair_log_likelihood = best;
        let mut merged = Vec::new();

        while merged.len() < self.max_ghypos
            && pair_log_likelihood - best >= self.log_min_ghypo_ratio
        {
            let gh = self.new_ghypo();
            for node in self.gh_hypos.rights_of(left[pair.0].0).to_vec() {
                self.add_hypo_to_ghypo(gh, node);
            }
            for node in self.gh_hypos.rights_of(right[pair.1].0).to_vec() {
                self.add_hypo_to_ghypo(gh, node);
            }
            merged.push(gh);

            if pair.0 + 1 < left.len() && used.insert((pair.0 + 1, pair.1)) {
                self.merge_queue
                    .put(left[pair.0 + 1].1 + right[pair.1].1, (pair.0 + 1, pair.1));
            }
            if pair.1 + 1 < right.len() && used.insert((pair.0, pair.1 + 1)) {
                self.merge_queue
                    .put(left[pair.0].1 + right[pair.1 + 1].1, (pair.0, pair.1 + 1));
            }

            match self.merge_queue.pop() {
                Some((log_likelihood, next)) => {
                    pair = next;
                    pair_log_likelihood = log_likelihood;
                }
                None => break,
            }
        }

        log::trace!(
            "merged clusters: {} x {} hypotheses -> {}",
            left.len(),
            right.len(),
            merged.len()
        );

        for (gh, _) in left {
            self.free_ghypo(gh);
        }
        for (gh, _) in right {
            self.free_ghypo(gh);
        }
        self.clusters[index].ghypos = merged;
    }

    /// Regenerates the group hypotheses of every cluster.
    pub(crate) fn prune_and_hypothesize(&mut self) {
        for index in 0..self.clusters.len() {
            self.regenerate_cluster(index);
        }
    }

    /// Rebuilds the group hypotheses of the cluster at `index` from the
    /// ranked solutions of the assignment problems its current hypotheses
    /// define. The first solution fixes the new leading hypothesis and
    /// drives N-scanback pruning; problems invalidated by that pruning are
    /// withdrawn before further solutions are taken.
    fn regenerate_cluster(&mut self, index: usize) {
        self.apqueue.clear();

        let old_ghs = self.clusters[index].ghypos.clone();
        for &gh in &old_ghs {
            self.make_problem(gh);
        }

        let Some(best_cost) = self.apqueue.peek_cost() else {
            self.apqueue.clear();
            return;
        };
        let (_, _, solution) = self.apqueue.pop().unwrap_or_else(|| unreachable!());
        let best = self.ghypo_from_solution(&solution);
        let mut regenerated = vec![best];

        self.n_scanback_prune(best, self.max_depth);

        for &gh in &old_ghs {
            if self.ghypos.get(gh.0).snapshot > self.gh_hypos.rights_of(gh).len() {
                self.apqueue.remove_problem(&gh);
            }
        }

        while regenerated.len() < self.max_ghypos {
            let Some(next_cost) = self.apqueue.peek_cost() else {
                break;
            };
            if best_cost - next_cost < self.log_min_ghypo_ratio {
                break;
            }
            let (_, _, solution) = self.apqueue.pop().unwrap_or_else(|| unreachable!());
            regenerated.push(self.ghypo_from_solution(&solution));
        }

        for gh in old_ghs {
            self.free_ghypo(gh);
        }
        self.clusters[index].ghypos = regenerated;
        self.apqueue.clear();
    }

    /// Encodes a group hypothesis as an assignment problem and feeds it to
    /// the ranked queue: rows are report row numbers (or [`UNASSIGNED`] for
    /// report-free children), columns number the hypothesis' trees in link
    /// order, and each leaf child contributes one arc costed at its negated
    /// log-likelihood.
    fn make_problem(&mut self, gh: GhId) {
        let hypos = self.gh_hypos.rights_of(gh).to_vec();
        self.ghypos.get_mut(gh.0).snapshot = hypos.len();

        let mut arcs = Vec::new();
        for (column, &hypo) in hypos.iter().enumerate() {
            debug_assert!(
                !self.forest.is_leaf(hypo),
                "hypothesis was not grown before regeneration"
            );
            let col = i32::try_from(column).unwrap_or_else(|_| unreachable!());
            for &child in self.forest.children(hypo) {
                let row = self
                    .report_of(child)
                    .map_or(UNASSIGNED, |report| self.reports.get(report.0).row);
                arcs.push(ProblemArc {
                    row,
                    col,
                    cost: -self.forest.get(child).log_likelihood(),
                    tag: child,
                });
            }
        }

        self.apqueue.add_problem(gh, arcs);
    }

    /// Builds a group hypothesis out of a popped solution; the arcs' tags
    /// are the chosen leaves.
    fn ghypo_from_solution(&mut self, solution: &[ProblemArc<NodeId>]) -> GhId {
        let gh = self.new_ghypo();
        for arc in solution {
            self.add_hypo_to_ghypo(gh, arc.tag);
        }
        let live = self.gh_hypos.rights_of(gh).len();
        self.ghypos.get_mut(gh.0).snapshot = live;
        gh
    }

    /// N-scanback pruning: for every leaf the group hypothesis selects,
    /// once the leaf sits `max_depth` or more scans below its root, every
    /// sibling subtree of the leaf's first-generation ancestor is removed.
    /// The affected roots are left with exactly one child.
    pub(crate) fn n_scanback_prune(&mut self, gh: GhId, max_depth: usize) {
        for hypo in self.gh_hypos.rights_of(gh).to_vec() {
            if !self.forest.contains(hypo) {
                continue;
            }
            let Some(mut parent) = self.forest.parent(hypo) else {
                continue;
            };

            let mut saved = hypo;
            let mut depth = 1;
            while let Some(grandparent) = self.forest.parent(parent) {
                saved = parent;
                parent = grandparent;
                depth += 1;
            }
            if depth < max_depth {
                continue;
            }

            for sibling in self.forest.children(parent).to_vec() {
                if sibling != saved {
                    self.remove_subtree(sibling);
                }
            }
        }
    }

    /// One pass of [`Tracker::clear`] over the cluster at `index`: refresh
    /// the snapshots, prune the leading hypothesis at `depth`, and drop
    /// whatever the pruning invalidated.
    pub(crate) fn clear_cluster(&mut self, index: usize, depth: usize) {
        let ghs = self.clusters[index].ghypos.clone();
        let Some(&best) = ghs.first() else {
            return;
        };

        for &gh in &ghs {
            let live = self.gh_hypos.rights_of(gh).len();
            self.ghypos.get_mut(gh.0).snapshot = live;
        }

        self.n_scanback_prune(best, depth);

        let mut kept = Vec::with_capacity(ghs.len());
        for gh in ghs {
            if self.ghypos.get(gh.0).snapshot > self.gh_hypos.rights_of(gh).len() {
                self.free_ghypo(gh);
            } else {
                kept.push(gh);
            }
        }
        self.clusters[index].ghypos = kept;
    }

    /// Checks the structural invariants of every cluster, panicking on a
    /// violation. A diagnostic tool: the checks are linear in the size of
    /// the hypothesis forest and not meant for production scans.
    ///
    /// # Panics
    ///
    /// Panics if a cluster exceeds the k-best bound, a group hypothesis
    /// selects two hypotheses from one tree or paths sharing a report, the
    /// likelihood ratio bound is violated, or a report is alive without a
    /// referencing hypothesis.
    pub fn check_invariants(&self) {
        for cluster in &self.clusters {
            assert!(
                cluster.ghypos.len() <= self.max_ghypos,
                "cluster exceeds max_ghypos"
            );
            let Some(&first) = cluster.ghypos.first() else {
                continue;
            };
            let expected = self.gh_hypos.rights_of(first).len();

            for &gh in &cluster.ghypos {
                let hypos = self.gh_hypos.rights_of(gh);
                assert_eq!(
                    hypos.len(),
                    expected,
                    "cluster with different numbers of hypotheses"
                );

                let mut tracks: Vec<_> = hypos
                    .iter()
                    .map(|&node| self.forest.get(node).track())
                    .collect();
                tracks.sort_unstable();
                let distinct = tracks.len();
                tracks.dedup();
                assert_eq!(
                    tracks.len(),
                    distinct,
                    "group hypothesis selects one tree twice"
                );

                let mut reports = Vec::new();
                for &node in hypos {
                    let mut walk = Some(node);
                    while let Some(current) = walk {
                        if let Some(report) = self.report_of(current) {
                            reports.push(report);
                        }
                        walk = self.forest.parent(current);
                    }
                }
                reports.sort_unstable();
                let distinct = reports.len();
                reports.dedup();
                assert_eq!(
                    reports.len(),
                    distinct,
                    "group hypothesis uses one report twice"
                );
            }

            let best = cluster
                .ghypos
                .iter()
                .map(|&gh| self.ghypos.get(gh.0).log_likelihood)
                .fold(f64::NEG_INFINITY, f64::max);
            for &gh in &cluster.ghypos {
                let log_likelihood = self.ghypos.get(gh.0).log_likelihood;
                assert!(
                    log_likelihood - best >= self.log_min_ghypo_ratio - 1e-9,
                    "group hypothesis survived below the ratio bound"
                );
            }
        }

        for &report in &self.old_reports {
            assert!(
                !self.report_hypos.rights_of(report).is_empty(),
                "report alive without a referencing hypothesis"
            );
        }
    }

    /// Drops clusters that have no surviving group hypothesis.
    pub(crate) fn remove_unused_clusters(&mut self) {
        let mut index = 0;
        while index < self.clusters.len() {
            let in_use = self.clusters[index]
                .ghypos
                .first()
                .is_some_and(|&gh| !self.gh_hypos.rights_of(gh).is_empty());
            if in_use {
                index += 1;
            } else {
                let cluster = self.clusters.remove(index);
                for gh in cluster.ghypos {
                    self.free_ghypo(gh);
                }
            }
        }
    }
}
