//! Neural network layers for the classification head
//!
//! Implements the building blocks the group-query decoder is assembled from:
//! - Layer normalization (post-residual placement in the decoder)
//! - Linear projection
//! - Cross-attention (queries over a fixed feature memory)
//! - Activation functions: softmax, sigmoid, ReLU
//!
//! ## Example
//!
//! ```rust,ignore
//! use clasificar::layers::LayerNorm;
//!
//! let layer_norm = LayerNorm::new(768, 1e-5)?;
//! let normalized = layer_norm.forward(&input)?;
//! ```

use crate::{
    error::{ClasificarError, Result},
    tensor::Tensor,
};

mod attention;
pub use attention::{Attention, CrossAttention};

/// Apply softmax activation function
///
/// Softmax: `y[i] = exp(x[i]) / sum(exp(x[j]))` for all j
///
/// Applies softmax normalization along the last dimension. Uses numerically
/// stable implementation with max subtraction to prevent overflow.
///
/// Used by the attention mechanism and by multi-class prediction selection.
///
/// # Arguments
///
/// * `input` - Input tensor
///
/// # Returns
///
/// Tensor with softmax applied along last dimension (values sum to 1.0)
///
/// # Errors
///
/// Returns error if input is empty
///
/// # Examples
///
/// ```rust,ignore
/// let input = Tensor::from_vec(vec![3], vec![1.0, 2.0, 3.0])?;
/// let output = softmax(&input)?;
/// // output sums to 1.0
/// ```
pub fn softmax(input: &Tensor<f32>) -> Result<Tensor<f32>> {
    let data = input.data();
    let shape = input.shape();

    if data.is_empty() {
        return Err(ClasificarError::InvalidShape {
            reason: "Cannot apply softmax to empty tensor".to_string(),
        });
    }

    let last_dim = shape[shape.len() - 1];
    let num_rows = data.len() / last_dim;
    let mut output = Vec::with_capacity(data.len());

    // Apply softmax to each row independently
    for row_idx in 0..num_rows {
        let start = row_idx * last_dim;
        let end = start + last_dim;
        let row = &data[start..end];

        // Find max for numerical stability
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        // Compute exp(x - max) for each element
        let exp_vals: Vec<f32> = row.iter().map(|&x| (x - max_val).exp()).collect();

        // Sum of exponentials
        let sum_exp: f32 = exp_vals.iter().sum();

        // Normalize to get probabilities
        for &exp_val in &exp_vals {
            output.push(exp_val / sum_exp);
        }
    }

    Tensor::from_vec(shape.to_vec(), output)
}

/// Apply ReLU activation function element-wise
///
/// ReLU: `y = max(0, x)`
///
/// Used after the feature projection and inside the decoder's feed-forward
/// sub-block.
///
/// # Errors
///
/// Returns error if input is empty
pub fn relu(input: &Tensor<f32>) -> Result<Tensor<f32>> {
    let data = input.data();
    if data.is_empty() {
        return Err(ClasificarError::InvalidShape {
            reason: "Cannot apply ReLU to empty tensor".to_string(),
        });
    }

    let output: Vec<f32> = data.iter().map(|&x| x.max(0.0)).collect();
    Tensor::from_vec(input.shape().to_vec(), output)
}

/// Sigmoid activation for a single value
///
/// Sigmoid: `y = 1 / (1 + exp(-x))`
///
/// Monotonic and bounded in (0, 1) for finite inputs. Used by multi-label
/// prediction selection.
#[must_use]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Layer normalization
///
/// Normalizes activations across the feature dimension using:
/// ```text
/// y = (x - mean(x)) / sqrt(variance(x) + eps) * gamma + beta
/// ```
///
/// # References
///
/// Layer Normalization: <https://arxiv.org/abs/1607.06450>
#[derive(Debug, Clone)]
pub struct LayerNorm {
    /// Normalized shape (feature dimension)
    normalized_shape: usize,
    /// Epsilon for numerical stability
    eps: f32,
    /// Scale parameter (gamma)
    weight: Vec<f32>,
    /// Shift parameter (beta)
    bias: Vec<f32>,
}

impl LayerNorm {
    /// Create a new layer normalization layer
    ///
    /// # Arguments
    ///
    /// * `normalized_shape` - Size of the feature dimension to normalize
    /// * `eps` - Small constant for numerical stability (default: `1e-5`)
    ///
    /// # Errors
    ///
    /// Returns error if `normalized_shape` is zero
    pub fn new(normalized_shape: usize, eps: f32) -> Result<Self> {
        if normalized_shape == 0 {
            return Err(ClasificarError::InvalidShape {
                reason: "normalized_shape must be > 0".to_string(),
            });
        }

        // Identity transform until weights are loaded
        let weight = vec![1.0; normalized_shape];
        let bias = vec![0.0; normalized_shape];

        Ok(Self {
            normalized_shape,
            eps,
            weight,
            bias,
        })
    }

    /// Forward pass through layer normalization
    ///
    /// # Arguments
    ///
    /// * `input` - Input tensor with shape `[..., normalized_shape]`
    ///
    /// # Returns
    ///
    /// Normalized tensor with same shape as input
    ///
    /// # Errors
    ///
    /// Returns error if the last dimension doesn't match `normalized_shape`
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let shape = input.shape();
        let last_dim = shape[shape.len() - 1];
        if last_dim != self.normalized_shape {
            return Err(ClasificarError::InvalidShape {
                reason: format!(
                    "Last dimension {} doesn't match normalized_shape {}",
                    last_dim, self.normalized_shape
                ),
            });
        }

        let data = input.data();
        let num_rows = data.len() / self.normalized_shape;

        let mut output = Vec::with_capacity(data.len());

        for row_idx in 0..num_rows {
            let start = row_idx * self.normalized_shape;
            let end = start + self.normalized_shape;
            let row = &data[start..end];

            #[allow(clippy::cast_precision_loss)]
            let mean: f32 = row.iter().sum::<f32>() / self.normalized_shape as f32;

            #[allow(clippy::cast_precision_loss)]
            let variance: f32 = row
                .iter()
                .map(|&x| {
                    let diff = x - mean;
                    diff * diff
                })
                .sum::<f32>()
                / self.normalized_shape as f32;

            for (i, &x) in row.iter().enumerate() {
                let normalized = (x - mean) / (variance + self.eps).sqrt();
                output.push(normalized * self.weight[i] + self.bias[i]);
            }
        }

        debug_assert!(
            output.iter().all(|&x| x.is_finite()),
            "LayerNorm produced NaN or Inf values - check input distribution"
        );

        Tensor::from_vec(shape.to_vec(), output)
    }

    /// Get the normalized shape
    #[must_use]
    pub fn normalized_shape(&self) -> usize {
        self.normalized_shape
    }

    /// Get epsilon value
    #[must_use]
    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// Get scale parameter (gamma)
    #[must_use]
    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    /// Get shift parameter (beta)
    #[must_use]
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// Get mutable scale parameter (for loading from weights)
    pub fn weight_mut(&mut self) -> &mut [f32] {
        &mut self.weight
    }

    /// Get mutable shift parameter (for loading from weights)
    pub fn bias_mut(&mut self) -> &mut [f32] {
        &mut self.bias
    }
}

/// Linear transformation layer
///
/// Applies linear transformation: `y = x * W + b`
/// where W is a weight matrix and b a bias vector.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Input features
    in_features: usize,
    /// Output features
    out_features: usize,
    /// Weight matrix `[in_features, out_features]`
    weight: Vec<f32>,
    /// Bias vector `[out_features]`
    bias: Vec<f32>,
}

impl Linear {
    /// Create a new linear layer
    ///
    /// # Arguments
    ///
    /// * `in_features` - Number of input features
    /// * `out_features` - Number of output features
    ///
    /// # Errors
    ///
    /// Returns error if either dimension is zero
    pub fn new(in_features: usize, out_features: usize) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(ClasificarError::InvalidShape {
                reason: "in_features and out_features must be > 0".to_string(),
            });
        }

        // Weights come from the loaded model
        let weight = vec![0.0; in_features * out_features];
        let bias = vec![0.0; out_features];

        Ok(Self {
            in_features,
            out_features,
            weight,
            bias,
        })
    }

    /// Forward pass through linear layer
    ///
    /// # Arguments
    ///
    /// * `input` - Input tensor with shape `[..., in_features]`
    ///
    /// # Returns
    ///
    /// Output tensor with shape `[..., out_features]`
    ///
    /// # Errors
    ///
    /// Returns error if the input last dimension doesn't match `in_features`
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let shape = input.shape();
        let last_dim = shape[shape.len() - 1];
        if last_dim != self.in_features {
            return Err(ClasificarError::InvalidShape {
                reason: format!(
                    "Last dimension {} doesn't match in_features {}",
                    last_dim, self.in_features
                ),
            });
        }

        let data = input.data();
        let num_rows = data.len() / self.in_features;

        let mut output = Vec::with_capacity(num_rows * self.out_features);

        // For each input row, compute: output = input * weight + bias
        for row_idx in 0..num_rows {
            let input_start = row_idx * self.in_features;
            let input_row = &data[input_start..input_start + self.in_features];

            for j in 0..self.out_features {
                let mut sum = self.bias[j];
                for (i, &input_val) in input_row.iter().enumerate() {
                    sum += input_val * self.weight[i * self.out_features + j];
                }
                output.push(sum);
            }
        }

        let mut output_shape = shape[..shape.len() - 1].to_vec();
        output_shape.push(self.out_features);

        Tensor::from_vec(output_shape, output)
    }

    /// Get input features
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Get output features
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Get weight matrix
    #[must_use]
    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    /// Get bias vector
    #[must_use]
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// Get mutable weight matrix (for loading from weights)
    pub fn weight_mut(&mut self) -> &mut [f32] {
        &mut self.weight
    }

    /// Get mutable bias vector (for loading from weights)
    pub fn bias_mut(&mut self) -> &mut [f32] {
        &mut self.bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_sums_to_one() {
        let input = Tensor::from_vec(vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let output = softmax(&input).unwrap();
        let sum: f32 = output.data().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(output.data().iter().all(|&x| (0.0..=1.0).contains(&x)));
    }

    #[test]
    fn test_softmax_rows_independent() {
        let input = Tensor::from_vec(vec![2, 2], vec![0.0, 0.0, 10.0, 0.0]).unwrap();
        let output = softmax(&input).unwrap();
        let data = output.data();
        assert!((data[0] - 0.5).abs() < 1e-5);
        assert!((data[1] - 0.5).abs() < 1e-5);
        assert!(data[2] > 0.99);
    }

    #[test]
    fn test_softmax_large_logits_stable() {
        // Would overflow without max subtraction
        let input = Tensor::from_vec(vec![3], vec![1000.0, 1001.0, 1002.0]).unwrap();
        let output = softmax(&input).unwrap();
        assert!(output.data().iter().all(|&x| x.is_finite()));
        let sum: f32 = output.data().iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_relu() {
        let input = Tensor::from_vec(vec![4], vec![-1.0, 0.0, 0.5, 2.0]).unwrap();
        let output = relu(&input).unwrap();
        assert_eq!(output.data(), &[0.0, 0.0, 0.5, 2.0]);
    }

    #[test]
    fn test_sigmoid_bounds_and_midpoint() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid(100.0) <= 1.0);
        assert!(sigmoid(-100.0) >= 0.0);
        assert!(sigmoid(3.0) > sigmoid(2.0));
    }

    #[test]
    fn test_layer_norm_zero_mean_unit_variance() {
        let norm = LayerNorm::new(4, 1e-5).unwrap();
        let input = Tensor::from_vec(vec![4], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let output = norm.forward(&input).unwrap();
        let mean: f32 = output.data().iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn test_layer_norm_scale_invariant() {
        // LayerNorm(2x) == LayerNorm(x)
        let norm = LayerNorm::new(3, 1e-5).unwrap();
        let a = Tensor::from_vec(vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_vec(vec![3], vec![2.0, 4.0, 6.0]).unwrap();
        let out_a = norm.forward(&a).unwrap();
        let out_b = norm.forward(&b).unwrap();
        for (x, y) in out_a.data().iter().zip(out_b.data().iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_layer_norm_wrong_dim_error() {
        let norm = LayerNorm::new(4, 1e-5).unwrap();
        let input = Tensor::from_vec(vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        assert!(norm.forward(&input).is_err());
    }

    #[test]
    fn test_linear_identity_bias() {
        let mut linear = Linear::new(2, 3).unwrap();
        linear.bias_mut().copy_from_slice(&[1.0, 2.0, 3.0]);
        let input = Tensor::from_vec(vec![2], vec![0.0, 0.0]).unwrap();
        let output = linear.forward(&input).unwrap();
        assert_eq!(output.data(), &[1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_linear_matmul() {
        let mut linear = Linear::new(2, 2).unwrap();
        // W = [[1, 2], [3, 4]] in [in, out] layout
        linear.weight_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let input = Tensor::from_vec(vec![2], vec![1.0, 1.0]).unwrap();
        let output = linear.forward(&input).unwrap();
        assert_eq!(output.data(), &[4.0, 6.0]);
    }

    #[test]
    fn test_linear_batched_rows() {
        let linear = Linear::new(3, 2).unwrap();
        let input = Tensor::from_vec(vec![4, 3], vec![0.5; 12]).unwrap();
        let output = linear.forward(&input).unwrap();
        assert_eq!(output.shape(), &[4, 2]);
    }

    #[test]
    fn test_linear_width_mismatch_error() {
        let linear = Linear::new(3, 2).unwrap();
        let input = Tensor::from_vec(vec![4], vec![0.0; 4]).unwrap();
        assert!(linear.forward(&input).is_err());
    }
}
