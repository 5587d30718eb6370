//! Group-query attention classification head
//!
//! Maps a backbone feature map to per-class logits through a small set of
//! learned query embeddings:
//!
//! ```text
//! feature map -> FeatureProjector -> DecoderLayer(QueryBank, memory)
//!             -> group embeddings -> GroupExpander -> logits
//! ```
//!
//! The head keeps `G` query slots (at most 100 by default), far fewer than
//! `num_classes`; each group embedding is expanded into `duplicate_factor`
//! raw class scores, flattened group-major and truncated to the vocabulary
//! size. This is what lets a small decoder produce thousands of class scores
//! without a per-class dense layer.

use serde::{Deserialize, Serialize};

use crate::{
    error::{ClasificarError, Result},
    layers::{relu, CrossAttention, LayerNorm, Linear},
    tensor::Tensor,
};

/// Default group count cap when `num_of_groups` is left at auto
pub const DEFAULT_GROUP_CAP: usize = 100;

/// Default decoder embedding width
pub const DEFAULT_DECODER_EMBEDDING: usize = 768;

fn default_num_of_groups() -> i64 {
    -1
}

fn default_decoder_embedding() -> i64 {
    -1
}

fn default_num_heads() -> usize {
    8
}

fn default_dim_feedforward() -> usize {
    2048
}

fn default_num_layers_decoder() -> usize {
    1
}

fn default_dropout() -> f32 {
    0.1
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

/// Configuration for the classification head
///
/// Sentinel values follow the reference semantics: `num_of_groups = -1`
/// means "auto, capped at 100 groups"; `decoder_embedding = -1` means
/// "use 768". `dropout` is carried for completeness but is a no-op at
/// inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Number of output classes (required, > 0)
    pub num_classes: usize,
    /// Backbone feature width (channel count of the incoming feature map)
    pub initial_num_features: usize,
    /// Number of query groups; -1 selects the default cap of 100
    #[serde(default = "default_num_of_groups")]
    pub num_of_groups: i64,
    /// Decoder embedding width; -1 selects 768
    #[serde(default = "default_decoder_embedding")]
    pub decoder_embedding: i64,
    /// Number of attention heads in the cross-attention sub-block
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Hidden width of the position-wise feed-forward sub-block
    #[serde(default = "default_dim_feedforward")]
    pub dim_feedforward: usize,
    /// Number of stacked decoder layers
    #[serde(default = "default_num_layers_decoder")]
    pub num_layers_decoder: usize,
    /// Dropout probability (ignored at inference)
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    /// Layer normalization epsilon
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

impl DecoderConfig {
    /// Create a configuration with default hyperparameters
    ///
    /// # Arguments
    ///
    /// * `num_classes` - Size of the label vocabulary
    /// * `initial_num_features` - Backbone feature width
    #[must_use]
    pub fn new(num_classes: usize, initial_num_features: usize) -> Self {
        Self {
            num_classes,
            initial_num_features,
            num_of_groups: default_num_of_groups(),
            decoder_embedding: default_decoder_embedding(),
            num_heads: default_num_heads(),
            dim_feedforward: default_dim_feedforward(),
            num_layers_decoder: default_num_layers_decoder(),
            dropout: default_dropout(),
            layer_norm_eps: default_layer_norm_eps(),
        }
    }

    /// Parse a configuration from JSON
    ///
    /// Omitted fields take their defaults; the result is validated before
    /// it is returned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` on malformed JSON or out-of-range
    /// fields
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ClasificarError::InvalidConfiguration {
                reason: format!("Invalid JSON configuration: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolved group count: `min(num_of_groups, num_classes)` when the
    /// field is positive, else `min(100, num_classes)`
    #[must_use]
    pub fn num_groups(&self) -> usize {
        #[allow(clippy::cast_sign_loss)]
        let requested = if self.num_of_groups > 0 {
            self.num_of_groups as usize
        } else {
            DEFAULT_GROUP_CAP
        };
        requested.min(self.num_classes)
    }

    /// Resolved embedding width (768 when the sentinel -1 is set)
    #[must_use]
    pub fn embedding_dim(&self) -> usize {
        #[allow(clippy::cast_sign_loss)]
        if self.decoder_embedding > 0 {
            self.decoder_embedding as usize
        } else {
            DEFAULT_DECODER_EMBEDDING
        }
    }

    /// Raw class slots per group: `ceil(num_classes / num_groups)`
    ///
    /// Guarantees `num_groups() * duplicate_factor() >= num_classes`.
    #[must_use]
    pub fn duplicate_factor(&self) -> usize {
        self.num_classes.div_ceil(self.num_groups().max(1))
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` if any field is out of range or the
    /// embedding width is not divisible by the head count. Fatal at
    /// model-load time; never coerced silently.
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(ClasificarError::InvalidConfiguration {
                reason: "num_classes must be > 0".to_string(),
            });
        }
        if self.initial_num_features == 0 {
            return Err(ClasificarError::InvalidConfiguration {
                reason: "initial_num_features must be > 0".to_string(),
            });
        }
        if self.num_heads == 0 {
            return Err(ClasificarError::InvalidConfiguration {
                reason: "num_heads must be > 0".to_string(),
            });
        }
        if self.embedding_dim() % self.num_heads != 0 {
            return Err(ClasificarError::InvalidConfiguration {
                reason: format!(
                    "decoder_embedding {} must be divisible by num_heads {}",
                    self.embedding_dim(),
                    self.num_heads
                ),
            });
        }
        if self.dim_feedforward == 0 {
            return Err(ClasificarError::InvalidConfiguration {
                reason: "dim_feedforward must be > 0".to_string(),
            });
        }
        if self.num_layers_decoder == 0 {
            return Err(ClasificarError::InvalidConfiguration {
                reason: "num_layers_decoder must be > 0".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ClasificarError::InvalidConfiguration {
                reason: format!("dropout {} must be in [0, 1)", self.dropout),
            });
        }
        Ok(())
    }
}

/// Linear projection of per-location features to the decoder width
///
/// Applies `Linear(initial_num_features -> decoder_embedding)` followed by
/// ReLU. Pure function over its input; a width mismatch against the learned
/// projection is rejected when the call is made, and weight-shape problems
/// are rejected earlier, at load time.
#[derive(Debug, Clone)]
pub struct FeatureProjector {
    /// The learned projection
    linear: Linear,
}

impl FeatureProjector {
    /// Create a new projector with zero-initialized weights
    ///
    /// # Errors
    ///
    /// Returns error if either width is zero
    pub fn new(initial_num_features: usize, embedding_dim: usize) -> Result<Self> {
        Ok(Self {
            linear: Linear::new(initial_num_features, embedding_dim)?,
        })
    }

    /// Project a feature tensor `[..., initial_num_features]` to
    /// `[..., decoder_embedding]` and rectify
    ///
    /// # Errors
    ///
    /// Returns error if the input width doesn't match the projection
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let projected = self.linear.forward(input)?;
        relu(&projected)
    }

    /// Get the underlying projection
    #[must_use]
    pub fn linear(&self) -> &Linear {
        &self.linear
    }

    /// Get the underlying projection mutably (for loading from weights)
    pub fn linear_mut(&mut self) -> &mut Linear {
        &mut self.linear
    }
}

/// Learned, frozen-at-inference query embeddings
///
/// One query vector per group. Loaded once with the model weights and
/// exposed read-only afterwards; the loader is the only writer.
#[derive(Debug, Clone)]
pub struct QueryBank {
    /// Number of query slots (groups)
    num_groups: usize,
    /// Width of each query vector
    embedding_dim: usize,
    /// Query values `[num_groups * embedding_dim]`
    weight: Vec<f32>,
}

impl QueryBank {
    /// Create a new query bank with zero-initialized queries
    ///
    /// # Errors
    ///
    /// Returns error if either dimension is zero
    pub fn new(num_groups: usize, embedding_dim: usize) -> Result<Self> {
        if num_groups == 0 || embedding_dim == 0 {
            return Err(ClasificarError::InvalidShape {
                reason: "num_groups and embedding_dim must be > 0".to_string(),
            });
        }
        Ok(Self {
            num_groups,
            embedding_dim,
            weight: vec![0.0; num_groups * embedding_dim],
        })
    }

    /// Materialize the queries as a `[num_groups, embedding_dim]` tensor
    ///
    /// # Errors
    ///
    /// Never fails for a constructed bank; kept fallible for uniformity
    pub fn as_tensor(&self) -> Result<Tensor<f32>> {
        Tensor::from_vec(
            vec![self.num_groups, self.embedding_dim],
            self.weight.clone(),
        )
    }

    /// Get number of query slots
    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    /// Get query width
    #[must_use]
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Get query values
    #[must_use]
    pub fn weight(&self) -> &[f32] {
        &self.weight
    }

    /// Get mutable query values (for loading from weights)
    pub fn weight_mut(&mut self) -> &mut [f32] {
        &mut self.weight
    }
}

/// Single transformer-style decoder layer (post-residual norm)
///
/// Sub-stage ordering, which trained weights are keyed to:
///
/// ```text
/// tgt = norm1(queries)
/// tgt = norm2(tgt + cross_attention(tgt, memory))
/// tgt = norm3(tgt + fc2(relu(fc1(tgt))))
/// ```
///
/// Residual-then-norm at every sub-stage, not norm-then-residual. Dropout
/// sites in the reference are identity at inference and are not modeled.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    /// Norm over the incoming queries
    norm1: LayerNorm,
    /// Norm after the attention residual
    norm2: LayerNorm,
    /// Norm after the feed-forward residual
    norm3: LayerNorm,
    /// Cross-attention over the feature memory
    attn: CrossAttention,
    /// Feed-forward expansion `embed_dim -> dim_feedforward`
    fc1: Linear,
    /// Feed-forward projection `dim_feedforward -> embed_dim`
    fc2: Linear,
}

impl DecoderLayer {
    /// Create a new decoder layer with zero-initialized weights
    ///
    /// # Errors
    ///
    /// Returns error if any dimension is zero or `embed_dim` is not
    /// divisible by `num_heads`
    pub fn new(
        embed_dim: usize,
        num_heads: usize,
        dim_feedforward: usize,
        layer_norm_eps: f32,
    ) -> Result<Self> {
        Ok(Self {
            norm1: LayerNorm::new(embed_dim, layer_norm_eps)?,
            norm2: LayerNorm::new(embed_dim, layer_norm_eps)?,
            norm3: LayerNorm::new(embed_dim, layer_norm_eps)?,
            attn: CrossAttention::new(embed_dim, num_heads)?,
            fc1: Linear::new(embed_dim, dim_feedforward)?,
            fc2: Linear::new(dim_feedforward, embed_dim)?,
        })
    }

    /// Forward pass: queries attend over the feature memory
    ///
    /// # Arguments
    ///
    /// * `queries` - `[num_groups, embed_dim]` query (or previous layer) embeddings
    /// * `memory` - `[tokens, embed_dim]` projected spatial features
    ///
    /// # Returns
    ///
    /// Updated group embeddings `[num_groups, embed_dim]`
    ///
    /// # Errors
    ///
    /// Returns error on any internal shape mismatch
    pub fn forward(&self, queries: &Tensor<f32>, memory: &Tensor<f32>) -> Result<Tensor<f32>> {
        let tgt = self.norm1.forward(queries)?;

        let attn_out = self.attn.forward(&tgt, memory)?;
        let tgt = self.norm2.forward(&residual_add(&tgt, &attn_out)?)?;

        let ff = self.fc2.forward(&relu(&self.fc1.forward(&tgt)?)?)?;
        self.norm3.forward(&residual_add(&tgt, &ff)?)
    }

    /// Get first norm
    #[must_use]
    pub fn norm1(&self) -> &LayerNorm {
        &self.norm1
    }

    /// Get second norm
    #[must_use]
    pub fn norm2(&self) -> &LayerNorm {
        &self.norm2
    }

    /// Get third norm
    #[must_use]
    pub fn norm3(&self) -> &LayerNorm {
        &self.norm3
    }

    /// Get cross-attention sub-block
    #[must_use]
    pub fn attn(&self) -> &CrossAttention {
        &self.attn
    }

    /// Get feed-forward expansion
    #[must_use]
    pub fn fc1(&self) -> &Linear {
        &self.fc1
    }

    /// Get feed-forward projection
    #[must_use]
    pub fn fc2(&self) -> &Linear {
        &self.fc2
    }

    /// Mutable accessors used by the weight loader
    pub fn norm1_mut(&mut self) -> &mut LayerNorm {
        &mut self.norm1
    }

    /// Get second norm mutably (for loading from weights)
    pub fn norm2_mut(&mut self) -> &mut LayerNorm {
        &mut self.norm2
    }

    /// Get third norm mutably (for loading from weights)
    pub fn norm3_mut(&mut self) -> &mut LayerNorm {
        &mut self.norm3
    }

    /// Get cross-attention mutably (for loading from weights)
    pub fn attn_mut(&mut self) -> &mut CrossAttention {
        &mut self.attn
    }

    /// Get feed-forward expansion mutably (for loading from weights)
    pub fn fc1_mut(&mut self) -> &mut Linear {
        &mut self.fc1
    }

    /// Get feed-forward projection mutably (for loading from weights)
    pub fn fc2_mut(&mut self) -> &mut Linear {
        &mut self.fc2
    }
}

/// Elementwise residual addition of two same-shape tensors
fn residual_add(a: &Tensor<f32>, b: &Tensor<f32>) -> Result<Tensor<f32>> {
    if a.shape() != b.shape() {
        return Err(ClasificarError::InvalidShape {
            reason: format!(
                "Residual shapes differ: {:?} vs {:?}",
                a.shape(),
                b.shape()
            ),
        });
    }
    let data: Vec<f32> = a
        .data()
        .iter()
        .zip(b.data().iter())
        .map(|(&x, &y)| x + y)
        .collect();
    Tensor::from_vec(a.shape().to_vec(), data)
}

/// Grouped class-expansion weights, resolved once at load time
///
/// `PerGroup` carries one `[embedding_dim, duplicate_factor]` slice per
/// group; `Shared` broadcasts a single slice to all groups.
#[derive(Debug, Clone)]
pub enum GroupWeights {
    /// Distinct weight slice per group: `[num_groups, embedding_dim, duplicate_factor]`
    PerGroup(Tensor<f32>),
    /// One slice shared by all groups: `[embedding_dim, duplicate_factor]`
    Shared(Tensor<f32>),
}

impl GroupWeights {
    /// Whether this is the shared (2D) variant
    #[must_use]
    pub fn is_shared(&self) -> bool {
        matches!(self, GroupWeights::Shared(_))
    }
}

/// Group fully-connected expansion ("group FC")
///
/// Expands each group embedding into `duplicate_factor` raw class scores,
/// flattens the per-group outputs in group-major order, truncates to
/// `num_classes` and adds a learned per-class bias. The flatten order is
/// part of the trained-weight contract and must not change.
#[derive(Debug, Clone)]
pub struct GroupExpander {
    /// Number of groups
    num_groups: usize,
    /// Group embedding width
    embedding_dim: usize,
    /// Raw class slots per group
    duplicate_factor: usize,
    /// Final vocabulary size (`<= num_groups * duplicate_factor`)
    num_classes: usize,
    /// Expansion weights
    weights: GroupWeights,
    /// Per-class bias `[num_classes]`
    bias: Vec<f32>,
}

impl GroupExpander {
    /// Create a new expander with zero-initialized per-group weights
    ///
    /// # Arguments
    ///
    /// * `num_groups` - Number of group embeddings
    /// * `embedding_dim` - Width of each group embedding
    /// * `num_classes` - Vocabulary size
    /// * `shared` - Use one weight slice broadcast to all groups
    ///
    /// # Errors
    ///
    /// Returns error if any dimension is zero
    pub fn new(
        num_groups: usize,
        embedding_dim: usize,
        num_classes: usize,
        shared: bool,
    ) -> Result<Self> {
        if num_groups == 0 || embedding_dim == 0 || num_classes == 0 {
            return Err(ClasificarError::InvalidShape {
                reason: "num_groups, embedding_dim and num_classes must be > 0".to_string(),
            });
        }

        let duplicate_factor = num_classes.div_ceil(num_groups);
        let weights = if shared {
            GroupWeights::Shared(Tensor::zeros(vec![embedding_dim, duplicate_factor])?)
        } else {
            GroupWeights::PerGroup(Tensor::zeros(vec![
                num_groups,
                embedding_dim,
                duplicate_factor,
            ])?)
        };

        Ok(Self {
            num_groups,
            embedding_dim,
            duplicate_factor,
            num_classes,
            weights,
            bias: vec![0.0; num_classes],
        })
    }

    /// Replace the expansion weights, validating the shape
    ///
    /// # Errors
    ///
    /// Returns error if the tensor shape matches neither the per-group nor
    /// the shared layout
    pub fn set_weights(&mut self, weights: GroupWeights) -> Result<()> {
        let expected_per_group = [self.num_groups, self.embedding_dim, self.duplicate_factor];
        let expected_shared = [self.embedding_dim, self.duplicate_factor];
        match &weights {
            GroupWeights::PerGroup(t) if t.shape() == expected_per_group => {}
            GroupWeights::Shared(t) if t.shape() == expected_shared => {}
            GroupWeights::PerGroup(t) | GroupWeights::Shared(t) => {
                return Err(ClasificarError::DataShapeMismatch {
                    data_size: t.size(),
                    shape: t.shape().to_vec(),
                    expected: expected_per_group.iter().product(),
                });
            }
        }
        self.weights = weights;
        Ok(())
    }

    /// Expand group embeddings into class logits
    ///
    /// # Arguments
    ///
    /// * `group_embeddings` - `[num_groups, embedding_dim]` decoder output
    ///
    /// # Returns
    ///
    /// Logits `[num_classes]`
    ///
    /// # Errors
    ///
    /// Returns error if the input shape doesn't match the expander
    pub fn forward(&self, group_embeddings: &Tensor<f32>) -> Result<Tensor<f32>> {
        let shape = group_embeddings.shape();
        if shape != [self.num_groups, self.embedding_dim] {
            return Err(ClasificarError::InvalidShape {
                reason: format!(
                    "Expected group embeddings [{}, {}], got {:?}",
                    self.num_groups, self.embedding_dim, shape
                ),
            });
        }

        let h = group_embeddings.data();
        let d = self.embedding_dim;
        let dup = self.duplicate_factor;

        // out_extrap[g][j] = sum_d h[g][d] * w[g][d][j], group-major
        let mut expanded = vec![0.0_f32; self.num_groups * dup];
        for g in 0..self.num_groups {
            let w_slice = match &self.weights {
                GroupWeights::PerGroup(t) => &t.data()[g * d * dup..(g + 1) * d * dup],
                GroupWeights::Shared(t) => t.data(),
            };
            let h_row = &h[g * d..(g + 1) * d];
            let out_row = &mut expanded[g * dup..(g + 1) * dup];
            for (i, &h_val) in h_row.iter().enumerate() {
                let w_row = &w_slice[i * dup..(i + 1) * dup];
                for (j, &w_val) in w_row.iter().enumerate() {
                    out_row[j] += h_val * w_val;
                }
            }
        }

        // Truncate padding slots beyond the vocabulary, then add bias
        expanded.truncate(self.num_classes);
        for (logit, &b) in expanded.iter_mut().zip(self.bias.iter()) {
            *logit += b;
        }

        Tensor::from_vec(vec![self.num_classes], expanded)
    }

    /// Get number of groups
    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    /// Get group embedding width
    #[must_use]
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Get raw class slots per group
    #[must_use]
    pub fn duplicate_factor(&self) -> usize {
        self.duplicate_factor
    }

    /// Get vocabulary size
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Get expansion weights
    #[must_use]
    pub fn weights(&self) -> &GroupWeights {
        &self.weights
    }

    /// Get per-class bias
    #[must_use]
    pub fn bias(&self) -> &[f32] {
        &self.bias
    }

    /// Get mutable per-class bias (for loading from weights)
    pub fn bias_mut(&mut self) -> &mut [f32] {
        &mut self.bias
    }
}

/// The full classification head
///
/// Owns the projector, query bank, decoder stack and group expansion.
/// All weights are immutable after load; `forward` is a pure function of
/// its input, so concurrent calls on a shared `&MlDecoder` are safe.
#[derive(Debug, Clone)]
pub struct MlDecoder {
    /// Configuration (validated at construction)
    config: DecoderConfig,
    /// Feature projection to the decoder width
    projector: FeatureProjector,
    /// Learned frozen queries, one per group
    queries: QueryBank,
    /// Stacked decoder layers sharing the same feature memory
    layers: Vec<DecoderLayer>,
    /// Group fully-connected expansion into class logits
    group_fc: GroupExpander,
}

impl MlDecoder {
    /// Create a new head with zero-initialized weights
    ///
    /// Weights are expected to come from [`MlDecoder::from_bytes`] or be
    /// written through the mutable accessors before the head is used.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for an invalid config
    pub fn new(config: DecoderConfig) -> Result<Self> {
        Self::with_shared_weights(config, false)
    }

    /// Create a new head selecting the shared (2D) group-weight variant
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for an invalid config
    pub fn with_shared_weights(config: DecoderConfig, shared: bool) -> Result<Self> {
        config.validate()?;

        let num_groups = config.num_groups();
        let embed_dim = config.embedding_dim();

        let projector = FeatureProjector::new(config.initial_num_features, embed_dim)?;
        let queries = QueryBank::new(num_groups, embed_dim)?;

        let mut layers = Vec::with_capacity(config.num_layers_decoder);
        for _ in 0..config.num_layers_decoder {
            layers.push(DecoderLayer::new(
                embed_dim,
                config.num_heads,
                config.dim_feedforward,
                config.layer_norm_eps,
            )?);
        }

        let group_fc = GroupExpander::new(num_groups, embed_dim, config.num_classes, shared)?;

        Ok(Self {
            config,
            projector,
            queries,
            layers,
            group_fc,
        })
    }

    /// Forward pass: feature map to logits
    ///
    /// # Arguments
    ///
    /// * `features` - Either a spatial map `[batch, channels, height, width]`
    ///   (flattened internally to tokens) or pre-tokenized
    ///   `[batch, tokens, channels]`
    ///
    /// # Returns
    ///
    /// Logits tensor `[batch, num_classes]`
    ///
    /// # Errors
    ///
    /// Fails the call (never the loaded weights) if:
    /// - The tensor rank is not 3 or 4
    /// - The channel width doesn't match `initial_num_features`
    /// - The feature map contains non-finite values
    pub fn forward(&self, features: &Tensor<f32>) -> Result<Tensor<f32>> {
        let tokenized = self.tokenize(features)?;
        let shape = tokenized.shape();
        let (batch, tokens, channels) = (shape[0], shape[1], shape[2]);
        let data = tokenized.data();

        let tgt_init = self.queries.as_tensor()?;
        let mut logits = Vec::with_capacity(batch * self.config.num_classes);

        // Per-sample loop keeps batch entries fully independent
        for b in 0..batch {
            let sample = &data[b * tokens * channels..(b + 1) * tokens * channels];
            let sample_tensor = Tensor::from_vec(vec![tokens, channels], sample.to_vec())?;

            let memory = self.projector.forward(&sample_tensor)?;

            let mut tgt = tgt_init.clone();
            for layer in &self.layers {
                tgt = layer.forward(&tgt, &memory)?;
            }

            let sample_logits = self.group_fc.forward(&tgt)?;
            logits.extend_from_slice(sample_logits.data());
        }

        Tensor::from_vec(vec![batch, self.config.num_classes], logits)
    }

    /// Normalize the input to `[batch, tokens, channels]`
    fn tokenize(&self, features: &Tensor<f32>) -> Result<Tensor<f32>> {
        if features.data().iter().any(|x| !x.is_finite()) {
            return Err(ClasificarError::InferenceError {
                reason: "Feature map contains non-finite values".to_string(),
            });
        }

        let shape = features.shape();
        match shape.len() {
            3 => {
                if shape[2] != self.config.initial_num_features {
                    return Err(ClasificarError::InferenceError {
                        reason: format!(
                            "Feature width {} doesn't match initial_num_features {}",
                            shape[2], self.config.initial_num_features
                        ),
                    });
                }
                Ok(features.clone())
            }
            4 => {
                let (batch, channels, height, width) = (shape[0], shape[1], shape[2], shape[3]);
                if channels != self.config.initial_num_features {
                    return Err(ClasificarError::InferenceError {
                        reason: format!(
                            "Feature map has {} channels, expected {}",
                            channels, self.config.initial_num_features
                        ),
                    });
                }
                let tokens = height * width;
                let data = features.data();
                let mut tokenized = Vec::with_capacity(batch * tokens * channels);
                // [b, c, y, x] -> [b, y*W + x, c]
                for b in 0..batch {
                    for t in 0..tokens {
                        for c in 0..channels {
                            tokenized.push(data[(b * channels + c) * tokens + t]);
                        }
                    }
                }
                Tensor::from_vec(vec![batch, tokens, channels], tokenized)
            }
            rank => Err(ClasificarError::InferenceError {
                reason: format!("Feature map must be rank 3 or 4, got rank {rank}"),
            }),
        }
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Get the feature projector
    #[must_use]
    pub fn projector(&self) -> &FeatureProjector {
        &self.projector
    }

    /// Get the query bank
    #[must_use]
    pub fn queries(&self) -> &QueryBank {
        &self.queries
    }

    /// Get the decoder layers
    #[must_use]
    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    /// Get the group expander
    #[must_use]
    pub fn group_fc(&self) -> &GroupExpander {
        &self.group_fc
    }

    /// Get the feature projector mutably (for loading from weights)
    pub fn projector_mut(&mut self) -> &mut FeatureProjector {
        &mut self.projector
    }

    /// Get the query bank mutably (for loading from weights)
    pub fn queries_mut(&mut self) -> &mut QueryBank {
        &mut self.queries
    }

    /// Get the decoder layers mutably (for loading from weights)
    pub fn layers_mut(&mut self) -> &mut [DecoderLayer] {
        &mut self.layers
    }

    /// Get the group expander mutably (for loading from weights)
    pub fn group_fc_mut(&mut self) -> &mut GroupExpander {
        &mut self.group_fc
    }
}
