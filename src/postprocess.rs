//! Deterministic post-processing of raw logits into label predictions
//!
//! Turns one sample's logits into calibrated, ranked predictions:
//! multi-class top-1/top-k via softmax, or multi-label thresholding via
//! sigmoid. Whether activation is applied at all is decided per call by
//! [`needs_activation`] and threaded through as a plain value — there is no
//! cross-call state of any kind.

use serde::{Deserialize, Serialize};

use crate::{
    error::{ClasificarError, Result},
    layers::sigmoid,
    tensor::Tensor,
};

/// Absolute tolerance for the "already a probability distribution" check
pub const ACTIVATION_SUM_TOLERANCE: f32 = 0.01;

/// Default positive threshold for multi-label selection
pub const DEFAULT_POS_THRESHOLD: f32 = 0.5;

/// Immutable label identity supplied by the caller
///
/// The selector only indexes the caller's ordered label list positionally;
/// list order must match the class index order the weights were trained
/// with. The crate never mutates labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Human-readable class name
    pub name: String,
    /// Task domain the label belongs to
    pub domain: String,
    /// Marks an explicit "empty/background" label
    pub is_empty: bool,
}

impl Label {
    /// Create a regular label
    #[must_use]
    pub fn new(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            is_empty: false,
        }
    }

    /// Create an empty/background label
    #[must_use]
    pub fn empty(name: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            is_empty: true,
        }
    }
}

/// One selected label with its probability
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Class index into the label list
    pub index: usize,
    /// The label at that index
    pub label: Label,
    /// Calibrated probability (post-activation when activation was applied)
    pub probability: f32,
}

/// Decide whether raw outputs still need activation
///
/// Returns `false` when the values already sum to 1.0 within an absolute
/// tolerance of 0.01 — i.e. the vector is treated as pre-activated
/// probabilities and softmax/sigmoid is skipped. The same head serves both
/// raw-logit and pre-activated export paths, so this is evaluated
/// independently per sample on every call.
///
/// A sum far from 1.0 is never an error; it only selects the activation
/// branch.
#[must_use]
pub fn needs_activation(outputs: &[f32]) -> bool {
    let sum: f32 = outputs.iter().sum();
    (sum - 1.0).abs() > ACTIVATION_SUM_TOLERANCE
}

/// Softmax over a single logits slice (max-subtraction stabilized)
#[must_use]
pub fn softmax_probs(logits: &[f32]) -> Vec<f32> {
    let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = logits.iter().map(|&x| (x - max_val).exp()).collect();
    let sum_exp: f32 = exp_vals.iter().sum();
    exp_vals.iter().map(|&e| e / sum_exp).collect()
}

/// Select the `k` highest-scoring classes, descending by score
///
/// Applies softmax first when `activate` is set. Equal scores are broken
/// deterministically in favor of the lowest class index.
///
/// # Returns
///
/// Up to `k` `(class index, score)` pairs
#[must_use]
pub fn top_k_scores(outputs: &[f32], k: usize, activate: bool) -> Vec<(usize, f32)> {
    let probs = if activate {
        softmax_probs(outputs)
    } else {
        outputs.to_vec()
    };

    let mut indexed: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    indexed.truncate(k);
    indexed
}

/// Select every class whose score strictly exceeds `pos_thr`
///
/// Applies sigmoid elementwise first when `activate` is set. Results are in
/// ascending class-index order; classes at exactly the threshold are
/// excluded; an empty result is a normal outcome.
///
/// # Returns
///
/// `(class index, score)` pairs in ascending index order
#[must_use]
pub fn multilabel_scores(outputs: &[f32], pos_thr: f32, activate: bool) -> Vec<(usize, f32)> {
    outputs
        .iter()
        .enumerate()
        .map(|(i, &x)| (i, if activate { sigmoid(x) } else { x }))
        .filter(|&(_, score)| score > pos_thr)
        .collect()
}

/// Turns logits into ranked or thresholded label predictions
///
/// Multi-class mode returns the `topk` best labels (one by default);
/// multi-label mode returns every label clearing the positive threshold.
/// The activation decision is made fresh on every call, so a selector can
/// be shared freely across threads.
#[derive(Debug, Clone)]
pub struct PredictionSelector {
    /// Ordered label list; position is the class index
    labels: Vec<Label>,
    /// Multi-label (sigmoid/threshold) vs multi-class (softmax/top-k)
    multilabel: bool,
    /// Positive threshold for multi-label selection
    pos_thr: f32,
    /// Number of predictions in multi-class mode
    topk: usize,
}

impl PredictionSelector {
    /// Create a multi-class selector returning the single best label
    ///
    /// # Errors
    ///
    /// Returns error if the label list is empty
    pub fn multiclass(labels: Vec<Label>) -> Result<Self> {
        Self::multiclass_topk(labels, 1)
    }

    /// Create a multi-class selector returning the `k` best labels
    ///
    /// # Errors
    ///
    /// Returns error if the label list is empty or `k` is zero
    pub fn multiclass_topk(labels: Vec<Label>, k: usize) -> Result<Self> {
        if labels.is_empty() {
            return Err(ClasificarError::InvalidConfiguration {
                reason: "Label list cannot be empty".to_string(),
            });
        }
        if k == 0 {
            return Err(ClasificarError::InvalidConfiguration {
                reason: "topk must be > 0".to_string(),
            });
        }
        Ok(Self {
            labels,
            multilabel: false,
            pos_thr: DEFAULT_POS_THRESHOLD,
            topk: k,
        })
    }

    /// Create a multi-label selector with the given positive threshold
    ///
    /// # Errors
    ///
    /// Returns error if the label list is empty or the threshold is not a
    /// finite probability
    pub fn multilabel(labels: Vec<Label>, pos_thr: f32) -> Result<Self> {
        if labels.is_empty() {
            return Err(ClasificarError::InvalidConfiguration {
                reason: "Label list cannot be empty".to_string(),
            });
        }
        if !pos_thr.is_finite() || !(0.0..=1.0).contains(&pos_thr) {
            return Err(ClasificarError::InvalidConfiguration {
                reason: format!("pos_thr {pos_thr} must be in [0, 1]"),
            });
        }
        Ok(Self {
            labels,
            multilabel: true,
            pos_thr,
            topk: 1,
        })
    }

    /// Select predictions for one sample
    ///
    /// # Arguments
    ///
    /// * `outputs` - Raw logits or pre-activated probabilities of length
    ///   `num_classes`
    ///
    /// # Returns
    ///
    /// Multi-class: exactly `topk` predictions ordered by descending score.
    /// Multi-label: 0..num_classes predictions in ascending index order.
    ///
    /// # Errors
    ///
    /// Returns error if the output length doesn't match the label list
    pub fn select(&self, outputs: &[f32]) -> Result<Vec<Prediction>> {
        if outputs.len() != self.labels.len() {
            return Err(ClasificarError::InvalidShape {
                reason: format!(
                    "Got {} outputs for {} labels",
                    outputs.len(),
                    self.labels.len()
                ),
            });
        }

        let activate = needs_activation(outputs);

        let selected = if self.multilabel {
            multilabel_scores(outputs, self.pos_thr, activate)
        } else {
            top_k_scores(outputs, self.topk, activate)
        };

        Ok(selected
            .into_iter()
            .map(|(index, probability)| Prediction {
                index,
                label: self.labels[index].clone(),
                probability,
            })
            .collect())
    }

    /// Select predictions for every sample in a `[batch, num_classes]` tensor
    ///
    /// # Errors
    ///
    /// Returns error if the tensor is not 2D with width `num_classes`
    pub fn select_batch(&self, logits: &Tensor<f32>) -> Result<Vec<Vec<Prediction>>> {
        let shape = logits.shape();
        if shape.len() != 2 {
            return Err(ClasificarError::InvalidShape {
                reason: format!("Expected 2D logits [batch, num_classes], got {shape:?}"),
            });
        }

        let num_classes = shape[1];
        let data = logits.data();

        let mut results = Vec::with_capacity(shape[0]);
        for row in data.chunks_exact(num_classes) {
            results.push(self.select(row)?);
        }
        Ok(results)
    }

    /// Get the ordered label list
    #[must_use]
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Whether this selector runs in multi-label mode
    #[must_use]
    pub fn is_multilabel(&self) -> bool {
        self.multilabel
    }

    /// Get the positive threshold
    #[must_use]
    pub fn pos_thr(&self) -> f32 {
        self.pos_thr
    }

    /// Get the multi-class prediction count
    #[must_use]
    pub fn topk(&self) -> usize {
        self.topk
    }
}
