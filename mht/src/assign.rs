//! Minimum-cost bipartite assignment with optional unassignments.
//!
//! A problem is a sparse list of [`Arc`]s between two disjoint node sets
//! ("rows" and "columns"), both named by non-negative integers. An arc with
//! [`UNASSIGNED`] in place of its column states the cost of leaving that row
//! unmatched, and symmetrically for columns. [`Solver::solve`] finds the
//! cheapest set of arcs in which every row and every column that appears in
//! some arc is covered exactly once, or reports that no such set exists.
//!
//! Internally the problem is made square by mirroring it: every real row
//! gets an anti-row, every real column an anti-column (see [`anti`]), and
//! the mirrored graph is solved with the Hungarian method.

use std::collections::VecDeque;

/// Row or column value marking the "may remain unassigned" side of an arc.
pub const UNASSIGNED: i32 = -1;

const NONE: i32 = i32::MAX;

/// A possible assignment of one row to one column at a cost.
///
/// Several arcs between the same row and column are permitted; a single
/// solve uses only the cheapest, but the more expensive ones matter when
/// solutions are enumerated in cost order.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Arc {
    /// Row node, or [`UNASSIGNED`].
    pub row: i32,
    /// Column node, or [`UNASSIGNED`].
    pub col: i32,
    /// Cost of using this assignment.
    pub cost: f64,
}

impl Arc {
    /// Constructs a new `Arc`.
    #[must_use]
    pub const fn new(row: i32, col: i32, cost: f64) -> Self {
        Self { row, col, cost }
    }
}

/// Sorts `arcs` into the order required by [`Solver::solve`]: by row, then
/// column, then cost.
pub fn sort(arcs: &mut [Arc]) {
    arcs.sort_unstable_by(|a, b| {
        (a.row, a.col)
            .cmp(&(b.row, b.col))
            .then_with(|| a.cost.total_cmp(&b.cost))
    });
}

/// Returns the mirror node of a row or column. The mapping is an involution:
/// `anti(anti(x)) == x`.
#[must_use]
pub const fn anti(row_or_col: i32) -> i32 {
    -row_or_col - 1
}

/// A minimum-cost solution found by [`Solver::solve`].
#[derive(Clone, Debug)]
pub struct Solution {
    /// Total cost of the chosen arcs.
    pub cost: f64,
    /// Indices into the input slice of the arcs that form the matching,
    /// including any "remain unassigned" arcs that were used.
    pub chosen: Vec<usize>,
}

#[derive(Clone, Copy)]
struct Mirrored {
    row: i32,
    col: i32,
    cost: f64,
    // index of the input arc this one stands for; `None` for the zero-cost
    // duals added by the mirror construction
    src: Option<usize>,
}

/// Hungarian-method solver. The struct only exists to hold reusable scratch
/// buffers; it carries no problem state between calls.
pub struct Solver {
    arcs: Vec<Mirrored>,
    num_rows: usize,
    num_cols: usize,
    poss_mates: Vec<Vec<i32>>,
    mate_for_row: Vec<i32>,
    mate_for_col: Vec<i32>,
    min_cost_in_row: Vec<f64>,
    min_cost_in_col: Vec<f64>,
    row_to_search: VecDeque<i32>,
    row_predecessor: Vec<i32>,
    row_is_essential: Vec<bool>,
    col_is_essential: Vec<bool>,
    assignments_made: usize,
    assignments_needed: usize,
}

impl Solver {
    /// Constructs a new `Solver`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            arcs: Vec::new(),
            num_rows: 0,
            num_cols: 0,
            poss_mates: Vec::new(),
            mate_for_row: Vec::new(),
            mate_for_col: Vec::new(),
            min_cost_in_row: Vec::new(),
            min_cost_in_col: Vec::new(),
            row_to_search: VecDeque::new(),
            row_predecessor: Vec::new(),
            row_is_essential: Vec::new(),
            col_is_essential: Vec::new(),
            assignments_made: 0,
            assignments_needed: 0,
        }
    }

    /// Solves the assignment problem given by `arcs`, which must be sorted
    /// with [`sort`]. Returns `None` if no complete matching exists. An
    /// empty problem has cost 0 and an empty selection.
    pub fn solve(&mut self, arcs: &[Arc]) -> Option<Solution> {
        if arcs.is_empty() {
            return Some(Solution {
                cost: 0.0,
                chosen: Vec::new(),
            });
        }

        debug_assert!(
            arcs.windows(2).all(|pair| {
                let left = (pair[0].row, pair[0].col);
                let right = (pair[1].row, pair[1].col);
                left < right || (left == right && pair[0].cost <= pair[1].cost)
            }),
            "arcs must be sorted by (row, col, cost)"
        );
        debug_assert!(
            arcs.iter()
                .all(|arc| arc.row >= UNASSIGNED && arc.col >= UNASSIGNED
                    && (arc.row >= 0 || arc.col >= 0)),
            "arc endpoints must be node numbers or UNASSIGNED"
        );

        self.setup(arcs);
        self.jump_start();
        self.run()?;
        Some(self.store_solution(arcs))
    }

    // internal row index: real rows are 0.., anti-columns are negative
    fn ridx(&self, row: i32) -> usize {
        usize::try_from(row + i32::try_from(self.num_cols).unwrap_or_else(|_| unreachable!()))
            .unwrap_or_else(|_| unreachable!())
    }

    fn cidx(&self, col: i32) -> usize {
        usize::try_from(col + i32::try_from(self.num_rows).unwrap_or_else(|_| unreachable!()))
            .unwrap_or_else(|_| unreachable!())
    }

    /// Mirrors the problem and resets the scratch buffers. All but the
    /// cheapest of duplicate (row, col) arcs are skipped, which relies on
    /// the sort order.
    fn setup(&mut self, arcs: &[Arc]) {
        let num_rows = arcs.iter().map(|arc| arc.row + 1).max().unwrap_or(0);
        let num_cols = arcs.iter().map(|arc| arc.col + 1).max().unwrap_or(0);
        self.num_rows = usize::try_from(num_rows).unwrap_or_else(|_| unreachable!());
        self.num_cols = usize::try_from(num_cols).unwrap_or_else(|_| unreachable!());

        self.arcs.clear();
        for (index, arc) in arcs.iter().enumerate() {
            if index > 0 && arcs[index - 1].row == arc.row && arcs[index - 1].col == arc.col {
                continue;
            }

            if arc.row < 0 {
                self.arcs.push(Mirrored {
                    row: anti(arc.col),
                    col: arc.col,
                    cost: arc.cost,
                    src: Some(index),
                });
            } else if arc.col < 0 {
                self.arcs.push(Mirrored {
                    row: arc.row,
                    col: anti(arc.row),
                    cost: arc.cost,
                    src: Some(index),
                });
            } else {
                self.arcs.push(Mirrored {
                    row: arc.row,
                    col: arc.col,
                    cost: arc.cost,
                    src: Some(index),
                });
                // if the row binds to the column, the mirror images must be
                // able to bind to each other for free
                self.arcs.push(Mirrored {
                    row: anti(arc.col),
                    col: anti(arc.row),
                    cost: 0.0,
                    src: None,
                });
            }
        }

        let size = self.num_rows + self.num_cols;
        self.poss_mates.resize_with(size, Vec::new);
        for mates in &mut self.poss_mates {
            mates.clear();
        }
        self.mate_for_row.clear();
        self.mate_for_row.resize(size, NONE);
        self.mate_for_col.clear();
        self.mate_for_col.resize(size, NONE);
        self.row_predecessor.clear();
        self.row_predecessor.resize(size, NONE);
        self.row_is_essential.clear();
        self.row_is_essential.resize(size, false);
        self.col_is_essential.clear();
        self.col_is_essential.resize(size, false);
        self.min_cost_in_row.clear();
        self.min_cost_in_row.resize(self.num_rows, f64::INFINITY);
        self.min_cost_in_col.clear();
        self.min_cost_in_col.resize(self.num_cols, f64::INFINITY);
        self.row_to_search.clear();

        self.assignments_made = 0;
        self.assignments_needed = 0;
        let mut counted = vec![false; size];
        for arc in &self.arcs {
            let index = usize::try_from(
                arc.row + i32::try_from(self.num_cols).unwrap_or_else(|_| unreachable!()),
            )
            .unwrap_or_else(|_| unreachable!());
            if !counted[index] {
                counted[index] = true;
                self.assignments_needed += 1;
            }
        }
    }

    /// Row-reduces, column-reduces, builds the initial zero-cost subgraph
    /// and greedily matches within it.
    #[allow(clippy::float_cmp)]
    fn jump_start(&mut self) {
        for arc in &self.arcs {
            if arc.row >= 0 {
                let row = usize::try_from(arc.row).unwrap_or_else(|_| unreachable!());
                if arc.cost < self.min_cost_in_row[row] {
                    self.min_cost_in_row[row] = arc.cost;
                }
            }
        }

        for arc in &mut self.arcs {
            if arc.row >= 0 {
                arc.cost -= self.min_cost_in_row
                    [usize::try_from(arc.row).unwrap_or_else(|_| unreachable!())];
            }
            if arc.col >= 0 {
                let col = usize::try_from(arc.col).unwrap_or_else(|_| unreachable!());
                if arc.cost < self.min_cost_in_col[col] {
                    self.min_cost_in_col[col] = arc.cost;
                }
            }
        }

        for index in 0..self.arcs.len() {
            let mut arc = self.arcs[index];
            if arc.col >= 0 {
                arc.cost -= self.min_cost_in_col
                    [usize::try_from(arc.col).unwrap_or_else(|_| unreachable!())];
                self.arcs[index].cost = arc.cost;
            }

            if arc.cost == 0.0 {
                let ridx = self.ridx(arc.row);
                let cidx = self.cidx(arc.col);
                self.poss_mates[ridx].push(arc.col);

                if self.mate_for_row[ridx] == NONE && self.mate_for_col[cidx] == NONE {
                    self.mate_for_row[ridx] = arc.col;
                    self.mate_for_col[cidx] = arc.row;
                    self.assignments_made += 1;
                }
            }
        }
    }

    /// Main Hungarian loop: augment within the current zero-cost subgraph,
    /// and when that stalls, shift costs by the minimum non-essential delta
    /// to expose new zeros. Returns `None` when no delta exists, which means
    /// the problem has no complete matching.
    #[allow(clippy::float_cmp)]
    fn run(&mut self) -> Option<()> {
        #[cfg(debug_assertions)]
        let mut stalled = 0_u32;

        while self.assignments_made < self.assignments_needed {
            if self.augment() {
                #[cfg(debug_assertions)]
                {
                    stalled = 0;
                }
                continue;
            }

            #[cfg(debug_assertions)]
            {
                stalled += 1;
                assert!(stalled < 10_000, "assignment solver is not progressing");
            }

            for index in 0..self.mate_for_row.len() {
                let mate = self.mate_for_row[index];
                let essential = mate != NONE && !self.col_is_essential[self.cidx(mate)];
                self.row_is_essential[index] = essential;
            }

            let mut delta = f64::INFINITY;
            for arc in &self.arcs {
                if !self.row_is_essential[self.ridx(arc.row)]
                    && !self.col_is_essential[self.cidx(arc.col)]
                    && arc.cost < delta
                {
                    delta = arc.cost;
                }
            }

            if delta == f64::INFINITY {
                return None;
            }

            for mates in &mut self.poss_mates {
                mates.clear();
            }
            for index in 0..self.arcs.len() {
                let arc = self.arcs[index];
                let ridx = self.ridx(arc.row);
                let cidx = self.cidx(arc.col);

                if self.row_is_essential[ridx] {
                    if self.col_is_essential[cidx] {
                        self.arcs[index].cost += delta;
                    }
                } else if !self.col_is_essential[cidx] {
                    self.arcs[index].cost -= delta;
                }

                if self.arcs[index].cost == 0.0 {
                    self.poss_mates[ridx].push(arc.col);
                }
            }
        }

        Some(())
    }

    /// Breadth-first search for an alternating path that gains one more
    /// assignment. Marks the columns it crosses as essential.
    fn augment(&mut self) -> bool {
        self.col_is_essential.fill(false);
        self.row_to_search.clear();
        self.row_predecessor.fill(NONE);

        let cols = i32::try_from(self.num_cols).unwrap_or_else(|_| unreachable!());
        for index in 0..self.mate_for_row.len() {
            if self.mate_for_row[index] == NONE {
                self.row_to_search
                    .push_back(i32::try_from(index).unwrap_or_else(|_| unreachable!()) - cols);
            }
        }

        while let Some(row) = self.row_to_search.pop_front() {
            let ridx = self.ridx(row);
            for mate_index in 0..self.poss_mates[ridx].len() {
                let col = self.poss_mates[ridx][mate_index];
                let cidx = self.cidx(col);
                let mate_for_col = self.mate_for_col[cidx];

                if mate_for_col == NONE {
                    // found an augmenting path: flip assignments back along
                    // the predecessor chain
                    let mut row = row;
                    let mut col = col;
                    loop {
                        let ridx = self.ridx(row);
                        let cidx = self.cidx(col);
                        let old_mate = self.mate_for_row[ridx];
                        self.mate_for_row[ridx] = col;
                        self.mate_for_col[cidx] = row;

                        let predecessor = self.row_predecessor[ridx];
                        if predecessor == NONE {
                            break;
                        }
                        row = predecessor;
                        col = old_mate;
                    }

                    self.assignments_made += 1;
                    return true;
                }

                let mate_ridx = self.ridx(mate_for_col);
                if self.row_predecessor[mate_ridx] == NONE {
                    self.row_predecessor[mate_ridx] = row;
                    self.row_to_search.push_back(mate_for_col);
                    self.col_is_essential[cidx] = true;
                }
            }
        }

        false
    }

    /// Collects the chosen input arcs. Costs are taken from the input arcs,
    /// not from the reduced copies.
    fn store_solution(&self, arcs: &[Arc]) -> Solution {
        let mut cost = 0.0;
        let mut chosen = Vec::with_capacity(self.assignments_made);

        for arc in &self.arcs {
            if let Some(src) = arc.src {
                if self.mate_for_col[self.cidx(arc.col)] == arc.row {
                    chosen.push(src);
                    cost += arcs[src].cost;
                }
            }
        }

        Solution { cost, chosen }
    }
}

impl Default for Solver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use rand::Rng;
    use rand_pcg::Pcg64;

    fn solve(arcs: &mut Vec<Arc>) -> Option<Solution> {
        sort(arcs);
        Solver::new().solve(arcs)
    }

    /// Reference solver: assigns each named row to one of its arcs in
    /// turn, covers the leftover columns with their cheapest unassignment
    /// arcs, and keeps the cheapest complete matching.
    fn brute_force(arcs: &[Arc]) -> Option<f64> {
        fn recurse(
            arcs: &[Arc],
            rows: &[i32],
            cols: &[i32],
            row_index: usize,
            used: &mut Vec<i32>,
            cost: f64,
            best: &mut Option<f64>,
        ) {
            if row_index == rows.len() {
                let mut total = cost;
                for &col in cols {
                    if used.contains(&col) {
                        continue;
                    }
                    let cheapest = arcs
                        .iter()
                        .filter(|arc| arc.row < 0 && arc.col == col)
                        .map(|arc| arc.cost)
                        .fold(f64::INFINITY, f64::min);
                    if !cheapest.is_finite() {
                        // the column cannot be covered with these choices
                        return;
                    }
                    total += cheapest;
                }
                if best.is_none_or(|value| total < value) {
                    *best = Some(total);
                }
                return;
            }

            let row = rows[row_index];
            for arc in arcs.iter().filter(|arc| arc.row == row) {
                if arc.col >= 0 {
                    if used.contains(&arc.col) {
                        continue;
                    }
                    used.push(arc.col);
                    recurse(arcs, rows, cols, row_index + 1, used, cost + arc.cost, best);
                    used.pop();
                } else {
                    recurse(arcs, rows, cols, row_index + 1, used, cost + arc.cost, best);
                }
            }
        }

        let mut rows: Vec<i32> = arcs.iter().map(|arc| arc.row).filter(|&r| r >= 0).collect();
        rows.sort_unstable();
        rows.dedup();
        let mut cols: Vec<i32> = arcs.iter().map(|arc| arc.col).filter(|&c| c >= 0).collect();
        cols.sort_unstable();
        cols.dedup();

        let mut best = None;
        recurse(arcs, &rows, &cols, 0, &mut Vec::new(), 0.0, &mut best);
        best
    }

    #[test]
    fn anti_is_an_involution() {
        for x in [-5, -1, 0, 1, 7, 1000] {
            assert_eq!(anti(anti(x)), x);
        }
        assert_eq!(anti(0), -1);
        assert_eq!(anti(3), -4);
    }

    #[test]
    fn empty_problem_has_zero_cost() {
        let solution = Solver::new().solve(&[]).unwrap();
        assert_eq!(solution.cost, 0.0);
        assert!(solution.chosen.is_empty());
    }

    #[test]
    fn three_rows_with_optional_unassignment() {
        // row 0 binds to col 0 cheaply, row 1 to col 2, and row 2 takes its
        // cheap unassignment arc
        let mut arcs = vec![
            Arc::new(0, 0, 10.0),
            Arc::new(0, 0, 1.0),
            Arc::new(1, 0, 100.0),
            Arc::new(1, 2, 1.0),
            Arc::new(2, 2, 10.0),
            Arc::new(2, UNASSIGNED, 10.0),
            Arc::new(2, UNASSIGNED, 1.0),
        ];
        let solution = solve(&mut arcs).unwrap();

        assert_approx_eq!(f64, solution.cost, 3.0, ulps = 2);
        let mut chosen: Vec<(i32, i32, f64)> = solution
            .chosen
            .iter()
            .map(|&index| (arcs[index].row, arcs[index].col, arcs[index].cost))
            .collect();
        chosen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(
            chosen,
            [(0, 0, 1.0), (1, 2, 1.0), (2, UNASSIGNED, 1.0)]
        );
    }

    #[test]
    fn duplicate_arcs_use_the_cheapest() {
        let mut arcs = vec![
            Arc::new(0, 0, 7.0),
            Arc::new(0, 0, 3.0),
            Arc::new(0, 0, 5.0),
        ];
        let solution = solve(&mut arcs).unwrap();
        assert_approx_eq!(f64, solution.cost, 3.0, ulps = 2);
        assert_eq!(solution.chosen.len(), 1);
        assert_eq!(arcs[solution.chosen[0]].cost, 3.0);
    }

    #[test]
    fn unsolvable_when_two_rows_need_one_column() {
        let mut arcs = vec![Arc::new(0, 0, 1.0), Arc::new(1, 0, 1.0)];
        assert!(solve(&mut arcs).is_none());
    }

    #[test]
    fn unassignment_arcs_make_it_solvable() {
        let mut arcs = vec![
            Arc::new(0, 0, 1.0),
            Arc::new(1, 0, 2.0),
            Arc::new(0, UNASSIGNED, 5.0),
            Arc::new(1, UNASSIGNED, 0.5),
        ];
        let solution = solve(&mut arcs).unwrap();
        assert_approx_eq!(f64, solution.cost, 1.5, ulps = 2);
    }

    #[test]
    fn column_unassignment_is_symmetric() {
        let mut arcs = vec![
            Arc::new(0, 0, 4.0),
            Arc::new(0, 1, 1.0),
            Arc::new(UNASSIGNED, 0, 2.0),
            Arc::new(UNASSIGNED, 1, 9.0),
        ];
        let solution = solve(&mut arcs).unwrap();
        assert_approx_eq!(f64, solution.cost, 3.0, ulps = 2);
    }

    #[test]
    fn square_matrix_classic() {
        // cost matrix [[4, 1, 3], [2, 0, 5], [3, 2, 2]], optimum = 5
        let mut arcs = Vec::new();
        let costs = [[4.0, 1.0, 3.0], [2.0, 0.0, 5.0], [3.0, 2.0, 2.0]];
        for (row, row_costs) in costs.iter().enumerate() {
            for (col, &cost) in row_costs.iter().enumerate() {
                arcs.push(Arc::new(
                    i32::try_from(row).unwrap(),
                    i32::try_from(col).unwrap(),
                    cost,
                ));
            }
        }
        let solution = solve(&mut arcs).unwrap();
        assert_approx_eq!(f64, solution.cost, 5.0, ulps = 2);
    }

    #[test]
    fn matches_brute_force_on_random_problems() {
        let mut rng = Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7);

        for _ in 0..300 {
            let num_rows = rng.gen_range(1..=7);
            let num_cols = rng.gen_range(1..=7);
            let mut arcs = Vec::new();

            for row in 0..num_rows {
                for col in 0..num_cols {
                    if rng.gen_bool(0.5) {
                        let cost = f64::from(rng.gen_range(0..40)) * 0.25;
                        arcs.push(Arc::new(row, col, cost));
                    }
                }
                if rng.gen_bool(0.5) {
                    let cost = f64::from(rng.gen_range(0..40)) * 0.25;
                    arcs.push(Arc::new(row, UNASSIGNED, cost));
                }
            }
            for col in 0..num_cols {
                if rng.gen_bool(0.5) {
                    let cost = f64::from(rng.gen_range(0..40)) * 0.25;
                    arcs.push(Arc::new(UNASSIGNED, col, cost));
                }
            }

            sort(&mut arcs);
            let expected = brute_force(&arcs);
            let actual = Solver::new().solve(&arcs);

            match (expected, actual) {
                (None, None) => {}
                (Some(cost), Some(solution)) => {
                    assert_approx_eq!(f64, solution.cost, cost, epsilon = 1e-9);
                }
                (expected, actual) => {
                    panic!("solver disagreement: expected {expected:?}, got {actual:?}");
                }
            }
        }
    }

    #[test]
    fn scratch_buffers_survive_reuse() {
        let mut solver = Solver::new();

        let mut first = vec![Arc::new(0, 0, 2.0), Arc::new(1, 1, 3.0)];
        sort(&mut first);
        assert_approx_eq!(f64, solver.solve(&first).unwrap().cost, 5.0, ulps = 2);

        let mut second = vec![
            Arc::new(0, 1, 1.0),
            Arc::new(1, 0, 1.0),
            Arc::new(0, 0, 4.0),
            Arc::new(1, 1, 4.0),
        ];
        sort(&mut second);
        assert_approx_eq!(f64, solver.solve(&second).unwrap().cost, 2.0, ulps = 2);
    }
}
