//! Benjamini–Hochberg false discovery rate control.

/// BH-adjusted q-values, aligned to the input order.
///
/// Sort p ascending, assign `q(i) = p(i) * m / rank(i)`, then enforce
/// monotonicity with a running minimum from the largest rank down, clamping
/// at 1.0. Each correction scope (full set, pre-registered subset) calls this
/// independently on its own p-values.
pub fn bh_qvalues(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }

    // Stable order: ties broken by original position for determinism.
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]).then(a.cmp(&b)));

    let mut q_sorted = vec![0.0; m];
    for (rank0, &idx) in order.iter().enumerate() {
        q_sorted[rank0] = p_values[idx] * m as f64 / (rank0 + 1) as f64;
    }

    // Running minimum from the largest rank down.
    let mut running = f64::INFINITY;
    for rank0 in (0..m).rev() {
        running = running.min(q_sorted[rank0]);
        q_sorted[rank0] = running.min(1.0);
    }

    let mut q = vec![0.0; m];
    for (rank0, &idx) in order.iter().enumerate() {
        q[idx] = q_sorted[rank0];
    }
    q
}
