//! Ranked enumeration of assignment solutions.
//!
//! [`RankedAssignments`] accepts any number of assignment problems, each
//! identified by an opaque handle, and yields solutions across all of them
//! in non-decreasing cost order. The ranking uses Murty's partitioning
//! method: the queue keeps a list of problem/solution pairs, pops the pair
//! with the cheapest solution, and replaces it with restricted child
//! problems whose solution sets together are exactly the popped problem's
//! solutions minus the one just returned.
//!
//! Solutions are computed lazily: a pair carries a lower bound on its cost
//! (inherited from its parent) and is only solved by the Hungarian method
//! when it reaches the front of the queue.

use super::assign::{Arc, Solver};

// a pair may be found to cost more than estimated, never less
const COST_REGRESSION_TOLERANCE: f64 = 1e-3;

// stand-in for the UNASSIGNED endpoints, which are not real vertices and
// must not take part in the "does it still appear?" test
const IGNORE: i32 = i32::MAX;

/// An arc of an assignment problem, tagged with an opaque payload that
/// identifies it in returned solutions. Tags must be unique within one
/// problem.
#[derive(Clone, Copy, Debug)]
pub struct ProblemArc<T> {
    /// Row node, or [`crate::assign::UNASSIGNED`].
    pub row: i32,
    /// Column node, or [`crate::assign::UNASSIGNED`].
    pub col: i32,
    /// Cost of using this assignment.
    pub cost: f64,
    /// Caller payload identifying this arc.
    pub tag: T,
}

struct Pair<P, T> {
    problem: P,
    /// Cost of the arcs forced into every descendant solution.
    base_cost: f64,
    /// Cost to report when this pair is popped. A lower bound until the
    /// pair has been solved.
    cost: f64,
    /// Arcs forced into every solution of this pair.
    base: Vec<ProblemArc<T>>,
    /// Residual arcs the pair may still choose from.
    arcs: Vec<ProblemArc<T>>,
    /// Full best solution (base prefix included) once solved.
    solution: Option<Vec<ProblemArc<T>>>,
}

/// Virtual priority queue over the solutions of any number of assignment
/// problems. See the module documentation.
pub struct RankedAssignments<P, T> {
    pairs: Vec<Pair<P, T>>,
    solver: Solver,
}

impl<P: Copy + PartialEq, T: Copy + PartialEq> RankedAssignments<P, T> {
    /// Constructs a new, empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pairs: Vec::new(),
            solver: Solver::new(),
        }
    }

    /// Adds a problem under the given handle. All of its solutions become
    /// candidates for enumeration. The arcs need not be sorted.
    pub fn add_problem(&mut self, problem: P, mut arcs: Vec<ProblemArc<T>>) {
        arcs.sort_unstable_by(|a, b| {
            (a.row, a.col)
                .cmp(&(b.row, b.col))
                .then_with(|| a.cost.total_cmp(&b.cost))
        });
        self.pairs.push(Pair {
            problem,
            base_cost: 0.0,
            cost: f64::NEG_INFINITY,
            base: Vec::new(),
            arcs,
            solution: None,
        });
    }

    /// Removes every remaining solution of the problem with the given
    /// handle.
    pub fn remove_problem(&mut self, problem: &P) {
        self.pairs.retain(|pair| pair.problem != *problem);
    }

    /// Removes all problems.
    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    /// Returns the cost of the solution the next [`Self::pop`] will return,
    /// or `None` if the queue holds no further (finite-cost) solution.
    pub fn peek_cost(&mut self) -> Option<f64> {
        self.find_best().map(|index| self.pairs[index].cost)
    }

    /// Removes and returns the cheapest remaining solution as
    /// `(problem handle, cost, solution arcs)`, or `None` if the queue
    /// holds no further (finite-cost) solution.
    pub fn pop(&mut self) -> Option<(P, f64, Vec<ProblemArc<T>>)> {
        let best = self.find_best()?;
        let mut pair = self.pairs.remove(best);
        let solution = pair
            .solution
            .take()
            .unwrap_or_else(|| unreachable!("best pair is always solved"));
        let problem = pair.problem;
        let cost = pair.cost;

        self.partition(
            problem,
            pair.base_cost,
            cost,
            pair.base.len(),
            &solution,
            pair.arcs,
        );

        Some((problem, cost, solution))
    }

    /// Finds the pair with the cheapest current cost, solving it if it is
    /// not solved yet. Unsolvable pairs are dropped; pairs whose solved
    /// cost exceeds their estimate are re-ranked and the scan repeats.
    #[allow(clippy::float_cmp)]
    fn find_best(&mut self) -> Option<usize> {
        loop {
            if self.pairs.is_empty() {
                return None;
            }

            let mut best = 0;
            for index in 1..self.pairs.len() {
                let candidate = &self.pairs[index];
                let leader = &self.pairs[best];
                if candidate.cost < leader.cost {
                    best = index;
                } else if candidate.cost == leader.cost {
                    // prefer solved pairs, then pairs with fewer arcs
                    match (candidate.solution.is_some(), leader.solution.is_some()) {
                        (true, false) => best = index,
                        (true, true) | (false, false) => {
                            if candidate.arcs.len() < leader.arcs.len() {
                                best = index;
                            }
                        }
                        (false, true) => {}
                    }
                }
            }

            if self.pairs[best].solution.is_some() {
                if self.pairs[best].cost == f64::INFINITY {
                    return None;
                }
                return Some(best);
            }

            let estimate = self.pairs[best].cost;
            let raw: Vec<Arc> = self.pairs[best]
                .arcs
                .iter()
                .map(|arc| Arc::new(arc.row, arc.col, arc.cost))
                .collect();

            match self.solver.solve(&raw) {
                None => {
                    self.pairs.remove(best);
                }
                Some(solved) => {
                    let pair = &mut self.pairs[best];
                    let cost = pair.base_cost + solved.cost;
                    assert!(
                        cost - estimate >= -COST_REGRESSION_TOLERANCE,
                        "estimated cost ({estimate}) higher than actual ({cost})"
                    );

                    let mut full = pair.base.clone();
                    full.extend(solved.chosen.iter().map(|&index| pair.arcs[index]));
                    pair.cost = cost;
                    pair.solution = Some(full);

                    if cost <= estimate {
                        return Some(best);
                    }
                    // the estimate was too low; another pair may now be best
                }
            }
        }
    }

    /// Splits a popped problem into child problems. For each solution arc
    /// beyond the base prefix: a child is formed with that arc removed
    /// (provided its row and column can still bind elsewhere), then the arc
    /// is forced into the base for the remaining children.
    fn partition(
        &mut self,
        problem: P,
        mut base_cost: f64,
        cost: f64,
        base_len: usize,
        solution: &[ProblemArc<T>],
        mut arcs: Vec<ProblemArc<T>>,
    ) {
        for forced in base_len..solution.len() {
            let doomed_tag = solution[forced].tag;
            let index = arcs
                .iter()
                .position(|arc| arc.tag == doomed_tag)
                .unwrap_or_else(|| panic!("solution arc is missing from its problem"));
            let doomed = arcs.remove(index);

            let doomed_row = if doomed.row < 0 { IGNORE } else { doomed.row };
            let doomed_col = if doomed.col < 0 { IGNORE } else { doomed.col };

            let mut row_remains = doomed_row == IGNORE;
            let mut col_remains = doomed_col == IGNORE;
            for arc in &arcs {
                if arc.row == doomed_row {
                    row_remains = true;
                    if col_remains {
                        break;
                    }
                }
                if arc.col == doomed_col {
                    col_remains = true;
                    if row_remains {
                        break;
                    }
                }
            }

            if row_remains && col_remains {
                self.pairs.push(Pair {
                    problem,
                    base_cost,
                    // any solution of the child costs at least as much as
                    // the parent's
                    cost,
                    base: solution[..forced].to_vec(),
                    arcs: arcs.clone(),
                    solution: None,
                });
            }

            if (row_remains && doomed_row != IGNORE) || (col_remains && doomed_col != IGNORE) {
                arcs.retain(|arc| arc.row != doomed_row && arc.col != doomed_col);
            }

            base_cost += doomed.cost;
        }
    }
}

impl<P: Copy + PartialEq, T: Copy + PartialEq> Default for RankedAssignments<P, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assign;
    use float_cmp::assert_approx_eq;
    use rand::Rng;
    use rand_pcg::Pcg64;

    const UNASSIGNED_COL: i32 = assign::UNASSIGNED;

    fn arc(row: i32, col: i32, cost: f64, tag: i32) -> ProblemArc<i32> {
        ProblemArc {
            row,
            col,
            cost,
            tag,
        }
    }

    /// Enumerates every complete matching of `arcs` (each named row and
    /// column covered exactly once) and returns their costs. Duplicate
    /// arcs between the same row and column count as distinct matchings.
    fn all_solution_costs(arcs: &[ProblemArc<i32>]) -> Vec<f64> {
        // once every row has chosen an arc, each still-uncovered column
        // must take one of its own unassignment arcs
        fn cover_columns(
            arcs: &[ProblemArc<i32>],
            cols: &[i32],
            col_index: usize,
            used: &[i32],
            cost: f64,
            out: &mut Vec<f64>,
        ) {
            let Some(&col) = cols.get(col_index) else {
                out.push(cost);
                return;
            };
            if used.contains(&col) {
                cover_columns(arcs, cols, col_index + 1, used, cost, out);
                return;
            }
            for arc in arcs.iter().filter(|arc| arc.row < 0 && arc.col == col) {
                cover_columns(arcs, cols, col_index + 1, used, cost + arc.cost, out);
            }
        }

        fn recurse(
            arcs: &[ProblemArc<i32>],
            rows: &[i32],
            cols: &[i32],
            row_index: usize,
            used: &mut Vec<i32>,
            cost: f64,
            out: &mut Vec<f64>,
        ) {
            if row_index == rows.len() {
                cover_columns(arcs, cols, 0, used, cost, out);
                return;
            }

            let row = rows[row_index];
            for arc in arcs.iter().filter(|arc| arc.row == row) {
                if arc.col >= 0 {
                    if used.contains(&arc.col) {
                        continue;
                    }
                    used.push(arc.col);
                    recurse(arcs, rows, cols, row_index + 1, used, cost + arc.cost, out);
                    used.pop();
                } else {
                    recurse(arcs, rows, cols, row_index + 1, used, cost + arc.cost, out);
                }
            }
        }

        let mut rows: Vec<i32> = arcs.iter().map(|arc| arc.row).filter(|&r| r >= 0).collect();
        rows.sort_unstable();
        rows.dedup();
        let mut cols: Vec<i32> = arcs.iter().map(|arc| arc.col).filter(|&c| c >= 0).collect();
        cols.sort_unstable();
        cols.dedup();

        let mut out = Vec::new();
        recurse(arcs, &rows, &cols, 0, &mut Vec::new(), 0.0, &mut out);
        out.sort_by(f64::total_cmp);
        out
    }

    fn drain(queue: &mut RankedAssignments<u32, i32>) -> Vec<(u32, f64, Vec<i32>)> {
        let mut popped = Vec::new();
        while let Some((problem, cost, solution)) = queue.pop() {
            let mut tags: Vec<i32> = solution.iter().map(|arc| arc.tag).collect();
            tags.sort_unstable();
            popped.push((problem, cost, tags));
        }
        popped
    }

    #[test]
    fn enumerates_all_solutions_in_cost_order() {
        let arcs = vec![
            arc(0, 0, 1.0, 0),
            arc(0, 1, 2.0, 1),
            arc(1, 0, 3.0, 2),
            arc(1, 1, 1.5, 3),
        ];
        let expected = all_solution_costs(&arcs);

        let mut queue = RankedAssignments::new();
        queue.add_problem(0_u32, arcs);
        let popped = drain(&mut queue);

        assert_eq!(popped.len(), expected.len());
        for (got, want) in popped.iter().zip(&expected) {
            assert_approx_eq!(f64, got.1, *want, epsilon = 1e-9);
        }
        // solutions must be pairwise distinct
        for (i, a) in popped.iter().enumerate() {
            for b in &popped[i + 1..] {
                assert_ne!(a.2, b.2);
            }
        }
    }

    #[test]
    fn duplicate_arcs_yield_separate_solutions() {
        let arcs = vec![arc(0, 0, 1.0, 0), arc(0, 0, 4.0, 1)];
        let mut queue = RankedAssignments::new();
        queue.add_problem(0_u32, arcs);

        let popped = drain(&mut queue);
        assert_eq!(popped.len(), 2);
        assert_approx_eq!(f64, popped[0].1, 1.0, ulps = 2);
        assert_eq!(popped[0].2, [0]);
        assert_approx_eq!(f64, popped[1].1, 4.0, ulps = 2);
        assert_eq!(popped[1].2, [1]);
    }

    #[test]
    fn interleaves_multiple_problems_by_cost() {
        let mut queue = RankedAssignments::new();
        queue.add_problem(1_u32, vec![arc(0, 0, 5.0, 0), arc(0, UNASSIGNED_COL, 8.0, 1)]);
        queue.add_problem(2_u32, vec![arc(0, 0, 3.0, 0), arc(0, UNASSIGNED_COL, 4.0, 1)]);

        let popped = drain(&mut queue);
        let order: Vec<u32> = popped.iter().map(|entry| entry.0).collect();
        assert_eq!(order, [2, 2, 1, 1]);

        let costs: Vec<f64> = popped.iter().map(|entry| entry.1).collect();
        assert!(costs.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn remove_problem_discards_its_solutions() {
        let mut queue = RankedAssignments::new();
        queue.add_problem(1_u32, vec![arc(0, 0, 1.0, 0), arc(0, 0, 2.0, 1)]);
        queue.add_problem(2_u32, vec![arc(0, 0, 1.5, 0)]);

        assert_approx_eq!(f64, queue.peek_cost().unwrap(), 1.0, ulps = 2);
        queue.remove_problem(&1);

        let popped = drain(&mut queue);
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].0, 2);
    }

    #[test]
    fn peek_matches_next_pop() {
        let mut queue = RankedAssignments::new();
        queue.add_problem(
            7_u32,
            vec![arc(0, 0, 2.0, 0), arc(1, 1, 3.0, 1), arc(1, 0, 9.0, 2)],
        );

        while let Some(cost) = queue.peek_cost() {
            let (_, popped_cost, _) = queue.pop().unwrap();
            assert_approx_eq!(f64, cost, popped_cost, ulps = 2);
        }
        assert!(queue.pop().is_none());
    }

    #[test]
    fn matches_brute_force_on_random_problems() {
        let mut rng = Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7);

        for _ in 0..100 {
            let num_rows = rng.gen_range(1..=7);
            let num_cols = rng.gen_range(1..=7);
            let mut arcs = Vec::new();
            let mut tag = 0;

            for row in 0..num_rows {
                for col in 0..num_cols {
                    if rng.gen_bool(0.4) {
                        arcs.push(arc(row, col, f64::from(rng.gen_range(0..32)) * 0.5, tag));
                        tag += 1;
                    }
                }
                if rng.gen_bool(0.5) {
                    arcs.push(arc(
                        row,
                        UNASSIGNED_COL,
                        f64::from(rng.gen_range(0..32)) * 0.5,
                        tag,
                    ));
                    tag += 1;
                }
            }
            for col in 0..num_cols {
                if rng.gen_bool(0.4) {
                    arcs.push(arc(
                        UNASSIGNED_COL,
                        col,
                        f64::from(rng.gen_range(0..32)) * 0.5,
                        tag,
                    ));
                    tag += 1;
                }
            }

            let expected = all_solution_costs(&arcs);
            let mut queue = RankedAssignments::new();
            queue.add_problem(0_u32, arcs);
            let popped = drain(&mut queue);

            assert_eq!(popped.len(), expected.len());
            for (got, want) in popped.iter().zip(&expected) {
                assert_approx_eq!(f64, got.1, *want, epsilon = 1e-9);
            }
        }
    }
}
