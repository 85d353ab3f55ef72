//! Dense vector helpers used by the similarity engine and the stores.

use tracing::warn;

/// Dot product accumulated in `f64`. Extra trailing values on the longer side are ignored.
pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum()
}

/// Euclidean norm.
pub fn l2_norm(vector: &[f32]) -> f64 {
    dot(vector, vector).sqrt()
}

/// Scales `vector` to unit length in place. Returns `false` (leaving it
/// untouched) when the norm is zero or not finite.
pub fn l2_normalize(vector: &mut [f32]) -> bool {
    let norm = l2_norm(vector);
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for value in vector.iter_mut() {
        *value = (f64::from(*value) / norm) as f32;
    }
    true
}

/// Cosine similarity, or `None` for empty, mismatched, or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let denominator = l2_norm(a) * l2_norm(b);
    if denominator == 0.0 {
        return None;
    }
    Some(dot(a, b) / denominator)
}

/// Cosine distance (`1 - similarity`), matching pgvector's `<=>`. Undefined
/// pairs are treated as orthogonal.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b).unwrap_or(0.0)
}

/// Element-wise mean of `vectors`, re-normalized to unit length.
///
/// Returns a zero vector of `dimensions` when there is nothing to average, and
/// leaves the mean as-is when it sums to exactly zero. Vectors of the wrong
/// length are skipped.
pub fn mean_embedding<'a, I>(vectors: I, dimensions: usize) -> Vec<f32>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut sum = vec![0f64; dimensions];
    let mut count = 0usize;
    for vector in vectors {
        if vector.len() != dimensions {
            warn!(expected = dimensions, actual = vector.len(), "skipping vector with wrong length");
            continue;
        }
        for (total, value) in sum.iter_mut().zip(vector) {
            *total += f64::from(*value);
        }
        count += 1;
    }

    if count == 0 {
        return vec![0.0; dimensions];
    }
    let mut mean: Vec<f32> = sum.into_iter().map(|total| (total / count as f64) as f32).collect();
    l2_normalize(&mut mean);
    mean
}
