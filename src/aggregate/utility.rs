/// Percentage of `part` in `total`. Returns 0.0 when `total` is zero.
pub fn pct(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}

/// Nearest-rank percentile over `(value, count)` pairs sorted by value.
/// Returns `None` for empty input.
pub fn percentile_of_counts<'a>(
    counts: impl IntoIterator<Item = (&'a i64, &'a u64)>,
    total: u64,
    p: f64,
) -> Option<i64> {
    if total == 0 {
        return None;
    }
    let rank = ((p / 100.0) * total as f64).ceil().max(1.0) as u64;

    let mut seen = 0u64;
    for (&value, &count) in counts {
        seen += count;
        if seen >= rank {
            return Some(value);
        }
    }
    None
}
