use super::Segment;

/// Splits `[0, total)` into `parts` contiguous segments.
///
/// Every segment gets `total / parts` elements and the first `total % parts`
/// segments get one extra.
///
/// # Arguments
/// * `total` - The length of the partitioned buffer.
/// * `parts` - The amount of segments.
///
/// # Returns
/// The segments in ascending offset order, empty if `parts` is zero.
pub fn even_segments(total: usize, parts: usize) -> Vec<Segment> {
    if parts == 0 {
        return Vec::new();
    }

    let base = total / parts;
    let extra = total % parts;
    let mut offset = 0;

    (0..parts)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let segment = Segment::new(offset, len);
            offset += len;
            segment
        })
        .collect()
}
