//! End-to-end pipeline: feature map -> decoder head -> predictions
//!
//! Runs a production-shaped configuration (1000 classes, 100 groups,
//! 7x7x512 backbone output) through forward, weight round-trip, and both
//! selection modes.

use clasificar::decoder::{DecoderConfig, GroupWeights, MlDecoder};
use clasificar::layers::{LayerNorm, Linear};
use clasificar::postprocess::{Label, PredictionSelector};
use clasificar::tensor::Tensor;

fn fill(slice: &mut [f32], seed: &mut u64) {
    for v in slice.iter_mut() {
        *seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let bits = (*seed >> 33) as u32;
        *v = (bits as f32 / u32::MAX as f32 - 0.5) * 0.1;
    }
}

fn fill_norm(norm: &mut LayerNorm, seed: &mut u64) {
    fill(norm.weight_mut(), seed);
    for w in norm.weight_mut() {
        *w += 1.0;
    }
    fill(norm.bias_mut(), seed);
}

fn fill_linear(linear: &mut Linear, seed: &mut u64) {
    fill(linear.weight_mut(), seed);
    fill(linear.bias_mut(), seed);
}

fn randomize(decoder: &mut MlDecoder, mut seed: u64) {
    let config = decoder.config().clone();
    let g = config.num_groups();
    let d = config.embedding_dim();
    let dup = config.duplicate_factor();

    fill_linear(decoder.projector_mut().linear_mut(), &mut seed);
    fill(decoder.queries_mut().weight_mut(), &mut seed);
    for layer in decoder.layers_mut() {
        fill_norm(layer.norm1_mut(), &mut seed);
        fill_norm(layer.norm2_mut(), &mut seed);
        fill_norm(layer.norm3_mut(), &mut seed);
        fill_linear(layer.attn_mut().q_proj_mut(), &mut seed);
        fill_linear(layer.attn_mut().k_proj_mut(), &mut seed);
        fill_linear(layer.attn_mut().v_proj_mut(), &mut seed);
        fill_linear(layer.attn_mut().out_proj_mut(), &mut seed);
        fill_linear(layer.fc1_mut(), &mut seed);
        fill_linear(layer.fc2_mut(), &mut seed);
    }
    let mut values = vec![0.0; g * d * dup];
    fill(&mut values, &mut seed);
    decoder
        .group_fc_mut()
        .set_weights(GroupWeights::PerGroup(
            Tensor::from_vec(vec![g, d, dup], values).unwrap(),
        ))
        .unwrap();
    fill(decoder.group_fc_mut().bias_mut(), &mut seed);
}

/// Production-shaped config, narrowed embedding to keep the test quick
fn imagenet_scale_config() -> DecoderConfig {
    DecoderConfig {
        num_classes: 1000,
        initial_num_features: 512,
        num_of_groups: 100,
        decoder_embedding: 128,
        num_heads: 8,
        dim_feedforward: 256,
        num_layers_decoder: 1,
        dropout: 0.1,
        layer_norm_eps: 1e-5,
    }
}

fn labels(n: usize) -> Vec<Label> {
    (0..n).map(|i| Label::new(format!("class_{i}"), "imagenet")).collect()
}

#[test]
fn test_imagenet_scale_multiclass_pipeline() {
    let mut decoder = MlDecoder::new(imagenet_scale_config()).unwrap();
    randomize(&mut decoder, 101);

    // Batch of 2 backbone outputs, 512 channels over a 7x7 grid
    let mut data = vec![0.0; 2 * 512 * 7 * 7];
    let mut seed = 0xACE_u64;
    fill(&mut data, &mut seed);
    let features = Tensor::from_vec(vec![2, 512, 7, 7], data).unwrap();

    let logits = decoder.forward(&features).unwrap();
    assert_eq!(logits.shape(), &[2, 1000]);
    assert!(logits.data().iter().all(|x| x.is_finite()));

    let selector = PredictionSelector::multiclass(labels(1000)).unwrap();
    let batch = selector.select_batch(&logits).unwrap();
    assert_eq!(batch.len(), 2);
    for predictions in &batch {
        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert!(p.index < 1000);
        assert!(p.probability > 0.0 && p.probability <= 1.0);
        assert_eq!(p.label.name, format!("class_{}", p.index));
    }
}

#[test]
fn test_imagenet_scale_weight_roundtrip() {
    let mut decoder = MlDecoder::new(imagenet_scale_config()).unwrap();
    randomize(&mut decoder, 103);

    let mut data = vec![0.0; 512 * 7 * 7];
    let mut seed = 0xDEAD_u64;
    fill(&mut data, &mut seed);
    let features = Tensor::from_vec(vec![1, 512, 7, 7], data).unwrap();

    let before = decoder.forward(&features).unwrap();
    let loaded = MlDecoder::from_bytes(&decoder.to_bytes().unwrap()).unwrap();
    let after = loaded.forward(&features).unwrap();
    assert_eq!(before.data(), after.data());
}

#[test]
fn test_multilabel_pipeline() {
    let config = DecoderConfig {
        num_classes: 5,
        initial_num_features: 32,
        num_of_groups: 5,
        decoder_embedding: 16,
        num_heads: 4,
        dim_feedforward: 32,
        num_layers_decoder: 1,
        dropout: 0.0,
        layer_norm_eps: 1e-5,
    };
    let mut decoder = MlDecoder::new(config).unwrap();
    randomize(&mut decoder, 107);

    let mut data = vec![0.0; 32 * 4 * 4];
    let mut seed = 0xF00D_u64;
    fill(&mut data, &mut seed);
    let features = Tensor::from_vec(vec![1, 32, 4, 4], data).unwrap();

    let logits = decoder.forward(&features).unwrap();
    assert_eq!(logits.shape(), &[1, 5]);

    let selector = PredictionSelector::multilabel(labels(5), 0.5).unwrap();
    let predictions = selector.select(logits.data()).unwrap();

    // Any subset (including none) is valid; hits must be ordered and confident
    for window in predictions.windows(2) {
        assert!(window[0].index < window[1].index);
    }
    for p in &predictions {
        assert!(p.probability > 0.5);
    }
}
