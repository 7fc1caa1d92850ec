//! Integer-exact proportional allocation (largest remainder method)

/// Split `total` across cells proportionally to `weights`.
///
/// The result has one entry per weight and sums to `total` exactly. Floors
/// are computed in integer arithmetic; the shortfall goes one unit at a time
/// to the cells with the largest remainders, ties resolved by cell order.
/// All-zero weights fall back to [`allocate_uniform`]. An empty `weights`
/// yields an empty allocation.
pub fn allocate_proportional(total: u32, weights: &[u64]) -> Vec<u32> {
    let n = weights.len();
    if n == 0 {
        return Vec::new();
    }

    let weight_sum: u128 = weights.iter().map(|&w| w as u128).sum();
    if weight_sum == 0 {
        return allocate_uniform(total, n);
    }

    let total_wide = total as u128;
    let mut allocation = Vec::with_capacity(n);
    let mut remainders = Vec::with_capacity(n);
    for &weight in weights {
        let product = weight as u128 * total_wide;
        // floor <= total, so the narrowing is lossless
        allocation.push((product / weight_sum) as u32);
        remainders.push(product % weight_sum);
    }

    let assigned: u128 = allocation.iter().map(|&a| a as u128).sum();
    let mut order: Vec<usize> = (0..n).collect();

    if assigned <= total_wide {
        order.sort_by(|&a, &b| remainders[b].cmp(&remainders[a]).then(a.cmp(&b)));
        let shortfall = (total_wide - assigned) as usize;
        for i in 0..shortfall {
            allocation[order[i % n]] += 1;
        }
    } else {
        // Cannot happen with floor division
        order.sort_by(|&a, &b| remainders[a].cmp(&remainders[b]).then(a.cmp(&b)));
        let mut surplus = assigned - total_wide;
        let mut i = 0;
        while surplus > 0 && i < n * (total as usize + 1) {
            let cell = order[i % n];
            if allocation[cell] > 0 {
                allocation[cell] -= 1;
                surplus -= 1;
            }
            i += 1;
        }
    }

    debug_assert_eq!(
        allocation.iter().map(|&a| a as u64).sum::<u64>(),
        total as u64,
        "allocation does not reconcile to the total"
    );
    allocation
}

/// `total / n` to every cell plus one extra unit to the first `total % n` cells.
pub fn allocate_uniform(total: u32, n: usize) -> Vec<u32> {
    if n == 0 {
        return Vec::new();
    }
    let n32 = n as u64;
    let base = (total as u64 / n32) as u32;
    let extra = (total as u64 % n32) as usize;
    (0..n).map(|i| if i < extra { base + 1 } else { base }).collect()
}
