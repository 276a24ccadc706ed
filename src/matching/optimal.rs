//! Minimum-cost bipartite assignment (Hungarian method with potentials).

/// Assigns each row of `cost` to a distinct column minimising the total cost.
///
/// Returns, per row, the chosen column. When there are more rows than
/// columns, some rows are left unassigned (`None`). All costs must be finite.
pub fn min_cost_assignment(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let rows = cost.len();
    let cols = cost.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return vec![None; rows];
    }

    if rows <= cols {
        return solve(cost, rows, cols).into_iter().map(Some).collect();
    }

    let transposed: Vec<Vec<f64>> = (0..cols)
        .map(|c| (0..rows).map(|r| cost[r][c]).collect())
        .collect();
    let mut by_row = vec![None; rows];
    for (col, row) in solve(&transposed, cols, rows).into_iter().enumerate() {
        by_row[row] = Some(col);
    }
    by_row
}

/// Requires `n <= m`. Indices inside are 1-based with 0 as the virtual column.
fn solve(cost: &[Vec<f64>], n: usize, m: usize) -> Vec<usize> {
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; m + 1];
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        owner[0] = i;
        let mut j0 = 0;
        let mut min_v = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if reduced < min_v[j] {
                    min_v[j] = reduced;
                    way[j] = j0;
                }
                if min_v[j] < delta {
                    delta = min_v[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_v[j] -= delta;
                }
            }
            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }

        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![0; n];
    for j in 1..=m {
        if owner[j] != 0 {
            assignment[owner[j] - 1] = j - 1;
        }
    }
    assignment
}
