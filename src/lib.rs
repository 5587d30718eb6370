//! # Clasificar
//!
//! Pure Rust inference for group-query image classification heads.
//!
//! Clasificar (Spanish: "to classify") turns backbone feature maps into
//! class predictions with a transformer-style decoder head: a small bank
//! of learned queries cross-attends into the flattened feature map, and a
//! group fully-connected expansion maps each attended query to its slice
//! of the class logit vector. Deterministic post-processing converts
//! logits into multiclass or multilabel predictions.
//!
//! ## Features
//!
//! - **Group-query decoding**: thousands of classes served by ~100 queries
//! - **Deterministic post-processing**: activation auto-detection, top-k
//!   selection with stable tie-breaking, multilabel thresholding
//! - **CLSF weights**: self-describing binary container with mmap loading
//! - **Memory Safe**: no unsafe code outside the mmap wrapper
//!
//! ## Example
//!
//! ```rust
//! use clasificar::{Label, PredictionSelector};
//!
//! let labels = vec![
//!     Label::new("cat", "animals"),
//!     Label::new("dog", "animals"),
//!     Label::new("car", "vehicles"),
//! ];
//!
//! // Raw logits: softmax is applied automatically
//! let selector = PredictionSelector::multiclass(labels).unwrap();
//! let predictions = selector.select(&[2.0, 0.5, -1.0]).unwrap();
//!
//! assert_eq!(predictions.len(), 1);
//! assert_eq!(predictions[0].label.name, "cat");
//! assert!(predictions[0].probability > 0.0 && predictions[0].probability < 1.0);
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)] // usize -> f32 precision loss is acceptable
#![allow(clippy::cast_possible_truncation)] // u64 -> usize on 64-bit targets
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::missing_panics_doc)] // Allow missing Panics doc sections
#![allow(clippy::float_cmp)] // Allow float comparisons in tests

/// Group-query decoder head (projector, query bank, decoder layers, group FC)
pub mod decoder;
/// Error types for clasificar operations
pub mod error;
/// Neural network building blocks (softmax, LayerNorm, Linear, attention)
pub mod layers;
/// Logit post-processing: activation decision and prediction selection
pub mod postprocess;
/// Tensor type and shape handling
pub mod tensor;
/// CLSF weight container: reader, mmap loader and writer
pub mod weights;

pub use decoder::{DecoderConfig, GroupWeights, MlDecoder};
pub use error::{ClasificarError, Result};
pub use postprocess::{Label, Prediction, PredictionSelector};
pub use tensor::Tensor;
pub use weights::{MappedWeightsFile, WeightsFile, WeightsWriter};

/// Version of the clasificar crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
