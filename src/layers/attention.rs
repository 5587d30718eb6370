//! Attention mechanisms for the group-query decoder
//!
//! Contains:
//! - Attention: scaled dot-product attention over a query/memory pair
//! - CrossAttention: multi-head cross-attention with Q/K/V/out projections
//!
//! The decoder's queries attend over the projected spatial features with no
//! masking; queries never attend to each other.

use crate::{
    error::{ClasificarError, Result},
    tensor::Tensor,
};

use super::{softmax, Linear};

/// Scaled dot-product attention
///
/// Computes attention as:
/// ```text
/// Attention(Q, K, V) = softmax(Q @ K.T / sqrt(d_k)) @ V
/// ```
///
/// Query and key/value sequence lengths may differ; in the decoder the query
/// side is the group slots and the key/value side is the spatial feature
/// memory.
///
/// # References
///
/// "Attention is All You Need" - Vaswani et al., 2017
#[derive(Debug, Clone)]
pub struct Attention {
    /// Head dimension (`d_k` = `embed_dim` / `num_heads`)
    head_dim: usize,
    /// Scale factor: 1 / `sqrt(head_dim)`
    scale: f32,
}

impl Attention {
    /// Create a new attention layer
    ///
    /// # Arguments
    ///
    /// * `head_dim` - Dimension of each attention head
    ///
    /// # Errors
    ///
    /// Returns error if `head_dim` is zero
    pub fn new(head_dim: usize) -> Result<Self> {
        if head_dim == 0 {
            return Err(ClasificarError::InvalidShape {
                reason: "head_dim must be > 0".to_string(),
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let scale = 1.0 / (head_dim as f32).sqrt();

        Ok(Self { head_dim, scale })
    }

    /// Compute scaled dot-product attention
    ///
    /// # Arguments
    ///
    /// * `query` - Query tensor `[q_len, head_dim]`
    /// * `key` - Key tensor `[kv_len, head_dim]`
    /// * `value` - Value tensor `[kv_len, head_dim]`
    ///
    /// # Returns
    ///
    /// Output tensor `[q_len, head_dim]`
    ///
    /// # Errors
    ///
    /// Returns error if shapes don't match
    pub fn forward(
        &self,
        query: &Tensor<f32>,
        key: &Tensor<f32>,
        value: &Tensor<f32>,
    ) -> Result<Tensor<f32>> {
        let q_shape = query.shape();
        let k_shape = key.shape();
        let v_shape = value.shape();

        let q_last = q_shape[q_shape.len() - 1];
        let k_last = k_shape[k_shape.len() - 1];
        let v_last = v_shape[v_shape.len() - 1];

        if q_last != self.head_dim || k_last != self.head_dim || v_last != self.head_dim {
            return Err(ClasificarError::InvalidShape {
                reason: format!(
                    "Expected head_dim={}, got Q={}, K={}, V={}",
                    self.head_dim, q_last, k_last, v_last
                ),
            });
        }

        let q_len = if q_shape.len() > 1 { q_shape[0] } else { 1 };
        let k_len = if k_shape.len() > 1 { k_shape[0] } else { 1 };
        let v_len = if v_shape.len() > 1 { v_shape[0] } else { 1 };

        if k_len != v_len {
            return Err(ClasificarError::InvalidShape {
                reason: format!("Key seq_len {k_len} != Value seq_len {v_len}"),
            });
        }

        let q_data = query.data();
        let k_data = key.data();
        let v_data = value.data();

        // Compute attention scores: Q @ K.T
        // scores[i][j] = sum(Q[i][k] * K[j][k]) for all k
        let mut scores = Vec::with_capacity(q_len * k_len);
        for i in 0..q_len {
            for j in 0..k_len {
                let mut dot = 0.0;
                for k in 0..self.head_dim {
                    dot += q_data[i * self.head_dim + k] * k_data[j * self.head_dim + k];
                }
                scores.push(dot * self.scale);
            }
        }

        // Apply softmax to each row of scores
        let scores_tensor = Tensor::from_vec(vec![q_len, k_len], scores)?;
        let attn_weights = softmax(&scores_tensor)?;
        let attn_data = attn_weights.data();

        // Compute output: attn_weights @ V
        // output[i][k] = sum(attn_weights[i][j] * V[j][k]) for all j
        let mut output = Vec::with_capacity(q_len * self.head_dim);
        for i in 0..q_len {
            for k in 0..self.head_dim {
                let mut sum = 0.0;
                for j in 0..k_len {
                    sum += attn_data[i * k_len + j] * v_data[j * self.head_dim + k];
                }
                output.push(sum);
            }
        }

        debug_assert!(
            output.iter().all(|&x| x.is_finite()),
            "Attention produced NaN or Inf values - check input scaling"
        );

        Tensor::from_vec(vec![q_len, self.head_dim], output)
    }

    /// Get head dimension
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Get scale factor
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }
}

/// Multi-head cross-attention
///
/// Projects queries, keys and values, runs scaled dot-product attention per
/// head, concatenates the head outputs and applies an output projection.
/// Keys and values come from the feature memory, queries from the group
/// slots; all heads share the full memory (no masking, no windowing).
#[derive(Debug, Clone)]
pub struct CrossAttention {
    /// Number of attention heads
    num_heads: usize,
    /// Dimension per attention head
    head_dim: usize,
    /// Total embedding dimension (`num_heads * head_dim`)
    embed_dim: usize,
    /// Query projection: `embed_dim -> embed_dim`
    q_proj: Linear,
    /// Key projection: `embed_dim -> embed_dim`
    k_proj: Linear,
    /// Value projection: `embed_dim -> embed_dim`
    v_proj: Linear,
    /// Output projection: `embed_dim -> embed_dim`
    out_proj: Linear,
    /// Per-head attention mechanism
    attention: Attention,
}

impl CrossAttention {
    /// Create a new cross-attention layer
    ///
    /// # Arguments
    ///
    /// * `embed_dim` - Total embedding dimension (must be divisible by `num_heads`)
    /// * `num_heads` - Number of attention heads
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `embed_dim` is zero or not divisible by `num_heads`
    /// - `num_heads` is zero
    pub fn new(embed_dim: usize, num_heads: usize) -> Result<Self> {
        if embed_dim == 0 {
            return Err(ClasificarError::InvalidShape {
                reason: "embed_dim must be > 0".to_string(),
            });
        }
        if num_heads == 0 {
            return Err(ClasificarError::InvalidShape {
                reason: "num_heads must be > 0".to_string(),
            });
        }
        if embed_dim % num_heads != 0 {
            return Err(ClasificarError::InvalidShape {
                reason: format!("embed_dim {embed_dim} must be divisible by num_heads {num_heads}"),
            });
        }

        let head_dim = embed_dim / num_heads;

        let q_proj = Linear::new(embed_dim, embed_dim)?;
        let k_proj = Linear::new(embed_dim, embed_dim)?;
        let v_proj = Linear::new(embed_dim, embed_dim)?;
        let out_proj = Linear::new(embed_dim, embed_dim)?;
        let attention = Attention::new(head_dim)?;

        Ok(Self {
            num_heads,
            head_dim,
            embed_dim,
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            attention,
        })
    }

    /// Forward pass through cross-attention
    ///
    /// # Arguments
    ///
    /// * `queries` - Query tensor `[q_len, embed_dim]` (group slots)
    /// * `memory` - Memory tensor `[mem_len, embed_dim]` (projected features)
    ///
    /// # Returns
    ///
    /// Output tensor `[q_len, embed_dim]`
    ///
    /// # Errors
    ///
    /// Returns error if either input is not 2D with width `embed_dim`
    pub fn forward(&self, queries: &Tensor<f32>, memory: &Tensor<f32>) -> Result<Tensor<f32>> {
        let q_shape = queries.shape();
        let m_shape = memory.shape();

        if q_shape.len() != 2 || m_shape.len() != 2 {
            return Err(ClasificarError::InvalidShape {
                reason: format!(
                    "Expected 2D queries and memory, got {q_shape:?} and {m_shape:?}"
                ),
            });
        }
        if q_shape[1] != self.embed_dim || m_shape[1] != self.embed_dim {
            return Err(ClasificarError::InvalidShape {
                reason: format!(
                    "Expected embed_dim={}, got queries={}, memory={}",
                    self.embed_dim, q_shape[1], m_shape[1]
                ),
            });
        }

        let q_len = q_shape[0];
        let mem_len = m_shape[0];

        // Project Q from queries, K/V from the feature memory
        let q = self.q_proj.forward(queries)?; // [q_len, embed_dim]
        let k = self.k_proj.forward(memory)?; // [mem_len, embed_dim]
        let v = self.v_proj.forward(memory)?; // [mem_len, embed_dim]

        let q_data = q.data();
        let k_data = k.data();
        let v_data = v.data();

        // Process each head over the same memory
        let mut head_outputs = Vec::with_capacity(self.num_heads);

        for head_idx in 0..self.num_heads {
            let head_start = head_idx * self.head_dim;

            let mut q_head_data = Vec::with_capacity(q_len * self.head_dim);
            for row in 0..q_len {
                let offset = row * self.embed_dim + head_start;
                q_head_data.extend_from_slice(&q_data[offset..offset + self.head_dim]);
            }
            let q_head = Tensor::from_vec(vec![q_len, self.head_dim], q_head_data)?;

            let mut k_head_data = Vec::with_capacity(mem_len * self.head_dim);
            let mut v_head_data = Vec::with_capacity(mem_len * self.head_dim);
            for row in 0..mem_len {
                let offset = row * self.embed_dim + head_start;
                k_head_data.extend_from_slice(&k_data[offset..offset + self.head_dim]);
                v_head_data.extend_from_slice(&v_data[offset..offset + self.head_dim]);
            }
            let k_head = Tensor::from_vec(vec![mem_len, self.head_dim], k_head_data)?;
            let v_head = Tensor::from_vec(vec![mem_len, self.head_dim], v_head_data)?;

            head_outputs.push(self.attention.forward(&q_head, &k_head, &v_head)?);
        }

        // Concatenate head outputs: [q_len, embed_dim]
        let mut concat_data = Vec::with_capacity(q_len * self.embed_dim);
        for row in 0..q_len {
            for head_output in &head_outputs {
                let head_data = head_output.data();
                let offset = row * self.head_dim;
                concat_data.extend_from_slice(&head_data[offset..offset + self.head_dim]);
            }
        }
        let concat = Tensor::from_vec(vec![q_len, self.embed_dim], concat_data)?;

        self.out_proj.forward(&concat)
    }

    /// Get number of attention heads
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    /// Get head dimension
    #[must_use]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Get embedding dimension
    #[must_use]
    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// Get query projection
    #[must_use]
    pub fn q_proj(&self) -> &Linear {
        &self.q_proj
    }

    /// Get key projection
    #[must_use]
    pub fn k_proj(&self) -> &Linear {
        &self.k_proj
    }

    /// Get value projection
    #[must_use]
    pub fn v_proj(&self) -> &Linear {
        &self.v_proj
    }

    /// Get output projection
    #[must_use]
    pub fn out_proj(&self) -> &Linear {
        &self.out_proj
    }

    /// Get mutable query projection (for loading from weights)
    pub fn q_proj_mut(&mut self) -> &mut Linear {
        &mut self.q_proj
    }

    /// Get mutable key projection (for loading from weights)
    pub fn k_proj_mut(&mut self) -> &mut Linear {
        &mut self.k_proj
    }

    /// Get mutable value projection (for loading from weights)
    pub fn v_proj_mut(&mut self) -> &mut Linear {
        &mut self.v_proj
    }

    /// Get mutable output projection (for loading from weights)
    pub fn out_proj_mut(&mut self) -> &mut Linear {
        &mut self.out_proj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attention_rows_sum_preserved() {
        // With uniform attention weights the output is the mean of V rows
        let attn = Attention::new(2).unwrap();
        let q = Tensor::from_vec(vec![1, 2], vec![0.0, 0.0]).unwrap();
        let k = Tensor::from_vec(vec![2, 2], vec![0.0, 0.0, 0.0, 0.0]).unwrap();
        let v = Tensor::from_vec(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = attn.forward(&q, &k, &v).unwrap();
        assert_eq!(out.shape(), &[1, 2]);
        assert!((out.data()[0] - 2.0).abs() < 1e-5);
        assert!((out.data()[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_attention_asymmetric_lengths() {
        let attn = Attention::new(4).unwrap();
        let q = Tensor::from_vec(vec![3, 4], vec![0.1; 12]).unwrap();
        let k = Tensor::from_vec(vec![7, 4], vec![0.2; 28]).unwrap();
        let v = Tensor::from_vec(vec![7, 4], vec![0.3; 28]).unwrap();
        let out = attn.forward(&q, &k, &v).unwrap();
        assert_eq!(out.shape(), &[3, 4]);
    }

    #[test]
    fn test_attention_kv_length_mismatch_error() {
        let attn = Attention::new(2).unwrap();
        let q = Tensor::from_vec(vec![1, 2], vec![0.0; 2]).unwrap();
        let k = Tensor::from_vec(vec![2, 2], vec![0.0; 4]).unwrap();
        let v = Tensor::from_vec(vec![3, 2], vec![0.0; 6]).unwrap();
        assert!(attn.forward(&q, &k, &v).is_err());
    }

    #[test]
    fn test_attention_head_dim_mismatch_error() {
        let attn = Attention::new(4).unwrap();
        let q = Tensor::from_vec(vec![1, 2], vec![0.0; 2]).unwrap();
        let k = Tensor::from_vec(vec![1, 2], vec![0.0; 2]).unwrap();
        let v = Tensor::from_vec(vec![1, 2], vec![0.0; 2]).unwrap();
        assert!(attn.forward(&q, &k, &v).is_err());
    }

    #[test]
    fn test_cross_attention_shapes() {
        let attn = CrossAttention::new(8, 2).unwrap();
        let queries = Tensor::from_vec(vec![5, 8], vec![0.1; 40]).unwrap();
        let memory = Tensor::from_vec(vec![49, 8], vec![0.2; 392]).unwrap();
        let out = attn.forward(&queries, &memory).unwrap();
        assert_eq!(out.shape(), &[5, 8]);
    }

    #[test]
    fn test_cross_attention_indivisible_heads_error() {
        assert!(CrossAttention::new(10, 3).is_err());
    }

    #[test]
    fn test_cross_attention_zero_heads_error() {
        assert!(CrossAttention::new(8, 0).is_err());
    }

    #[test]
    fn test_cross_attention_wrong_memory_width_error() {
        let attn = CrossAttention::new(8, 2).unwrap();
        let queries = Tensor::from_vec(vec![5, 8], vec![0.1; 40]).unwrap();
        let memory = Tensor::from_vec(vec![49, 4], vec![0.2; 196]).unwrap();
        assert!(attn.forward(&queries, &memory).is_err());
    }
}
