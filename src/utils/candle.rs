// src/utils/candle.rs

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Tensor};
use log::warn;
use ndarray::Array2;
use once_cell::sync::Lazy;

static CANDLE_DEVICE: Lazy<Device> = Lazy::new(|| {
    // Device::new_metal(0) only succeeds when candle-core was built with metal support.
    match Device::new_metal(0) {
        Ok(metal_device) if metal_device.is_metal() => {
            log::info!("Successfully initialized Candle Metal device (GPU).");
            metal_device
        }
        Ok(_) => {
            log::warn!("Device::new_metal(0) succeeded but device.is_metal() is false. Using CPU.");
            Device::Cpu
        }
        Err(err) => {
            log::debug!(
                "Candle Metal device unavailable: {:?}. Falling back to CPU device.",
                err
            );
            Device::Cpu
        }
    }
});

/// Smallest norm used when normalizing rows; zero vectors end up with
/// similarity 0 against everything.
const MIN_NORM: f32 = 1e-12;

/// Cosine similarity between two vectors. Zero-norm or mismatched inputs give 0.
pub fn cosine_similarity(v1: &[f32], v2: &[f32]) -> f64 {
    if v1.len() != v2.len() || v1.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut mag1 = 0.0f64;
    let mut mag2 = 0.0f64;
    for (a, b) in v1.iter().zip(v2.iter()) {
        let (a, b) = (*a as f64, *b as f64);
        dot += a * b;
        mag1 += a * a;
        mag2 += b * b;
    }
    if mag1 == 0.0 || mag2 == 0.0 {
        return 0.0;
    }
    let similarity = dot / (mag1.sqrt() * mag2.sqrt());
    if similarity.is_finite() {
        similarity.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

/// Cosine similarity of every row of `left` against every row of `right`
/// (`left.len() x right.len()`). All rows must share one dimension; callers
/// coerce malformed vectors before getting here.
///
/// The matrix is computed on the candle device; if tensor construction or the
/// matmul fails, the pairwise scalar path is used instead so the result is
/// always available.
pub fn cosine_similarity_matrix(left: &[Vec<f32>], right: &[Vec<f32>]) -> Array2<f64> {
    if left.is_empty() || right.is_empty() {
        return Array2::zeros((left.len(), right.len()));
    }
    match cosine_similarity_matrix_candle(left, right) {
        Ok(matrix) => matrix,
        Err(e) => {
            warn!(
                "Candle cosine matrix ({}x{}) failed: {:#}. Using scalar fallback.",
                left.len(),
                right.len(),
                e
            );
            cosine_similarity_matrix_scalar(left, right)
        }
    }
}

fn cosine_similarity_matrix_scalar(left: &[Vec<f32>], right: &[Vec<f32>]) -> Array2<f64> {
    Array2::from_shape_fn((left.len(), right.len()), |(i, j)| {
        cosine_similarity(&left[i], &right[j])
    })
}

fn normalized_rows(rows: &[Vec<f32>], dim: usize) -> AnyhowResult<Tensor> {
    let mut flat = Vec::with_capacity(rows.len() * dim);
    for row in rows {
        if row.len() != dim {
            return Err(anyhow::anyhow!(
                "Input vector lengths differ: {} vs {}",
                row.len(),
                dim
            ));
        }
        flat.extend_from_slice(row);
    }
    let tensor = Tensor::from_vec(flat, (rows.len(), dim), &CANDLE_DEVICE)
        .with_context(|| format!("Failed to create tensor of shape ({}, {})", rows.len(), dim))?;
    let norms = tensor
        .sqr()
        .and_then(|t| t.sum_keepdim(1))
        .and_then(|t| t.sqrt())
        .and_then(|t| t.maximum(MIN_NORM))
        .context("Computing row norms failed")?;
    tensor
        .broadcast_div(&norms)
        .context("Normalizing rows failed")
}

fn cosine_similarity_matrix_candle(
    left: &[Vec<f32>],
    right: &[Vec<f32>],
) -> AnyhowResult<Array2<f64>> {
    let dim = left[0].len();
    if dim == 0 {
        return Err(anyhow::anyhow!("Input vectors must not be empty"));
    }
    let l = normalized_rows(left, dim)?;
    let r = normalized_rows(right, dim)?;
    let product = l
        .matmul(&r.t().context("Transposing right operand failed")?)
        .context("Tensor matmul for cosine matrix failed")?;
    let values = product
        .to_vec2::<f32>() // brings data back to the CPU if the device is a GPU
        .context("Converting cosine matrix to host vectors failed")?;

    let mut matrix = Array2::zeros((left.len(), right.len()));
    for (i, row) in values.into_iter().enumerate() {
        for (j, sim) in row.into_iter().enumerate() {
            let sim = sim as f64;
            matrix[[i, j]] = if sim.is_finite() { sim.clamp(-1.0, 1.0) } else { 0.0 };
        }
    }
    Ok(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_basic_cases() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-12);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-12);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-12);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_matrix_matches_scalar_path() {
        let left = vec![vec![1.0, 2.0, 3.0], vec![0.0, 0.0, 0.0], vec![-1.0, 0.5, 2.0]];
        let right = vec![vec![3.0, 2.0, 1.0], vec![1.0, 2.0, 3.0]];
        let matrix = cosine_similarity_matrix(&left, &right);
        let scalar = cosine_similarity_matrix_scalar(&left, &right);
        assert_eq!(matrix.dim(), (3, 2));
        for i in 0..3 {
            for j in 0..2 {
                assert!((matrix[[i, j]] - scalar[[i, j]]).abs() < 1e-5);
            }
        }
        // Zero row is similar to nothing.
        assert!(matrix[[1, 0]].abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_dimensions_fall_back() {
        let left = vec![vec![1.0, 0.0], vec![1.0]];
        let right = vec![vec![1.0, 0.0]];
        let matrix = cosine_similarity_matrix(&left, &right);
        assert!((matrix[[0, 0]] - 1.0).abs() < 1e-9);
        assert_eq!(matrix[[1, 0]], 0.0);
    }

    #[test]
    fn test_empty_inputs() {
        let matrix = cosine_similarity_matrix(&[], &[vec![1.0]]);
        assert_eq!(matrix.dim(), (0, 1));
    }
}
