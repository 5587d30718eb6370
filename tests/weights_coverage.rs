//! Integration coverage for the CLSF weight container
//!
//! Round-trips a fully populated head through `to_bytes`/`from_bytes` and
//! through a file on disk, and checks the fail-fast behavior on malformed
//! blobs.

use std::io::Write as _;

use clasificar::decoder::{DecoderConfig, GroupWeights, MlDecoder};
use clasificar::layers::{LayerNorm, Linear};
use clasificar::tensor::Tensor;
use clasificar::weights::{WeightsFile, CLSF_MAGIC};
use clasificar::ClasificarError;

// ============================================================================
// HELPERS
// ============================================================================

fn fill(slice: &mut [f32], seed: &mut u64) {
    for v in slice.iter_mut() {
        *seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let bits = (*seed >> 33) as u32;
        *v = (bits as f32 / u32::MAX as f32 - 0.5) * 0.2;
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
    let shared = decoder.group_fc().weights().is_shared();

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

    let weights = if shared {
        let mut values = vec![0.0; d * dup];
        fill(&mut values, &mut seed);
        GroupWeights::Shared(Tensor::from_vec(vec![d, dup], values).unwrap())
    } else {
        let mut values = vec![0.0; g * d * dup];
        fill(&mut values, &mut seed);
        GroupWeights::PerGroup(Tensor::from_vec(vec![g, d, dup], values).unwrap())
    };
    decoder.group_fc_mut().set_weights(weights).unwrap();
    fill(decoder.group_fc_mut().bias_mut(), &mut seed);
}

fn small_config() -> DecoderConfig {
    DecoderConfig {
        num_classes: 13,
        initial_num_features: 10,
        num_of_groups: 4,
        decoder_embedding: 16,
        num_heads: 2,
        dim_feedforward: 24,
        num_layers_decoder: 2,
        dropout: 0.0,
        layer_norm_eps: 1e-5,
    }
}

fn probe_input() -> Tensor<f32> {
    let mut data = vec![0.0; 10 * 2 * 3];
    let mut seed = 0xBEEF_u64;
    fill(&mut data, &mut seed);
    Tensor::from_vec(vec![1, 10, 2, 3], data).unwrap()
}

// ============================================================================
// ROUND-TRIPS
// ============================================================================

#[test]
fn test_roundtrip_preserves_forward_bit_exactly() {
    let mut decoder = MlDecoder::new(small_config()).unwrap();
    randomize(&mut decoder, 41);

    let input = probe_input();
    let before = decoder.forward(&input).unwrap();

    let bytes = decoder.to_bytes().unwrap();
    let loaded = MlDecoder::from_bytes(&bytes).unwrap();
    let after = loaded.forward(&input).unwrap();

    assert_eq!(before.data(), after.data());
}

#[test]
fn test_roundtrip_shared_group_weights() {
    let mut decoder = MlDecoder::with_shared_weights(small_config(), true).unwrap();
    randomize(&mut decoder, 43);

    let bytes = decoder.to_bytes().unwrap();
    let loaded = MlDecoder::from_bytes(&bytes).unwrap();
    assert!(loaded.group_fc().weights().is_shared());

    let input = probe_input();
    assert_eq!(
        decoder.forward(&input).unwrap().data(),
        loaded.forward(&input).unwrap().data()
    );
}

#[test]
fn test_roundtrip_config_resolution() {
    let mut decoder = MlDecoder::new(small_config()).unwrap();
    randomize(&mut decoder, 47);

    let loaded = MlDecoder::from_bytes(&decoder.to_bytes().unwrap()).unwrap();
    let config = loaded.config();
    assert_eq!(config.num_classes, 13);
    assert_eq!(config.num_groups(), 4);
    assert_eq!(config.embedding_dim(), 16);
    assert_eq!(config.num_layers_decoder, 2);
    assert_eq!(config.initial_num_features, 10);
}

#[test]
fn test_from_path_via_tempfile() {
    let mut decoder = MlDecoder::new(small_config()).unwrap();
    randomize(&mut decoder, 53);
    let bytes = decoder.to_bytes().unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&bytes).unwrap();
    file.flush().unwrap();

    let loaded = MlDecoder::from_path(file.path()).unwrap();
    let input = probe_input();
    assert_eq!(
        decoder.forward(&input).unwrap().data(),
        loaded.forward(&input).unwrap().data()
    );
}

// ============================================================================
// MALFORMED BLOBS
// ============================================================================

#[test]
fn test_bad_magic_fails_fast() {
    let mut decoder = MlDecoder::new(small_config()).unwrap();
    randomize(&mut decoder, 59);
    let mut bytes = decoder.to_bytes().unwrap();
    bytes[0] ^= 0xFF;

    assert!(matches!(
        MlDecoder::from_bytes(&bytes).unwrap_err(),
        ClasificarError::FormatError { .. }
    ));
}

#[test]
fn test_truncated_blob_fails_fast() {
    let mut decoder = MlDecoder::new(small_config()).unwrap();
    randomize(&mut decoder, 61);
    let bytes = decoder.to_bytes().unwrap();

    assert!(MlDecoder::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    assert!(MlDecoder::from_bytes(&bytes[..10]).is_err());
}

#[test]
fn test_unsupported_version_rejected() {
    let mut decoder = MlDecoder::new(small_config()).unwrap();
    randomize(&mut decoder, 67);
    let mut bytes = decoder.to_bytes().unwrap();
    // Version lives right after the magic
    bytes[4..8].copy_from_slice(&99u32.to_le_bytes());

    assert!(matches!(
        MlDecoder::from_bytes(&bytes).unwrap_err(),
        ClasificarError::FormatError { .. }
    ));
}

#[test]
fn test_blob_is_a_valid_container() {
    let mut decoder = MlDecoder::new(small_config()).unwrap();
    randomize(&mut decoder, 71);
    let bytes = decoder.to_bytes().unwrap();

    let file = WeightsFile::from_bytes(&bytes).unwrap();
    assert_eq!(file.require_u64("num_classes").unwrap(), 13);
    assert_eq!(file.require_u64("num_groups").unwrap(), 4);
    assert!(file.tensor("queries.weight").is_some());
    assert!(file.tensor("group_fc.bias").is_some());

    // Magic constant is stable ("CLSF" little-endian)
    assert_eq!(&bytes[0..4], &CLSF_MAGIC.to_le_bytes());
}

#[test]
fn test_from_path_missing_file() {
    assert!(matches!(
        MlDecoder::from_path("/nonexistent/clasificar.clsf").unwrap_err(),
        ClasificarError::IoError(_)
    ));
}
