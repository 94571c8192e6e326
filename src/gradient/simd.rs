//! Vectorized kernels over gradient buffers.
//!
//! Every kernel walks the input in 8-wide `f32` lanes and finishes the tail with
//! scalar operations.

use std::sync::atomic::Ordering;

use atomic_float::AtomicF32;
use wide::f32x8;

/// The width of a SIMD lane group.
pub const LANES: usize = 8;

/// Accumulates `src` into `dest`, element by element.
///
/// # Arguments
/// * `dest` - The accumulator.
/// * `src` - The values to add.
///
/// # Panics
/// If both slices don't have the same length.
pub fn accumulate(dest: &mut [f32], src: &[f32]) {
    assert_eq!(dest.len(), src.len(), "accumulate: length mismatch");

    let mut dest_chunks = dest.chunks_exact_mut(LANES);
    let mut src_chunks = src.chunks_exact(LANES);

    for (d, s) in (&mut dest_chunks).zip(&mut src_chunks) {
        let sum = f32x8::from(&d[..]) + f32x8::from(s);
        let lanes: [f32; LANES] = sum.into();
        d.copy_from_slice(&lanes);
    }

    dest_chunks
        .into_remainder()
        .iter_mut()
        .zip(src_chunks.remainder())
        .for_each(|(d, s)| *d += s);
}

/// Multiplies every element of `values` by `factor`.
pub fn scale(values: &mut [f32], factor: f32) {
    let factor_vec = f32x8::splat(factor);
    let mut chunks = values.chunks_exact_mut(LANES);

    for chunk in &mut chunks {
        let scaled = f32x8::from(&chunk[..]) * factor_vec;
        let lanes: [f32; LANES] = scaled.into();
        chunk.copy_from_slice(&lanes);
    }

    chunks
        .into_remainder()
        .iter_mut()
        .for_each(|v| *v *= factor);
}

/// Resets every element of `values` to zero.
pub fn zero(values: &mut [f32]) {
    values.fill(0.);
}

/// Computes the sum of the squared elements of `values`.
pub fn sum_of_squares(values: &[f32]) -> f32 {
    let mut acc = f32x8::ZERO;
    let mut chunks = values.chunks_exact(LANES);

    for chunk in &mut chunks {
        let v = f32x8::from(chunk);
        acc += v * v;
    }

    let lanes: [f32; LANES] = acc.into();
    let head: f32 = lanes.iter().sum();
    head + chunks.remainder().iter().map(|v| v * v).sum::<f32>()
}

/// Computes the L2 norm of `values`.
pub fn l2_norm(values: &[f32]) -> f32 {
    sum_of_squares(values).sqrt()
}

/// Returns whether every element of `values` is finite.
pub fn all_finite(values: &[f32]) -> bool {
    values.iter().all(|v| v.is_finite())
}

/// Adds `value` to a shared cell with a single atomic read-modify-write.
///
/// Used for the elements of a write that fall past the writer's own segment.
#[inline]
pub fn atomic_add(cell: &AtomicF32, value: f32) {
    cell.fetch_add(value, Ordering::Relaxed);
}
