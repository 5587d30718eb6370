//! CLSF weight container
//!
//! Pure Rust reader/writer for the head's binary weight format. The blob
//! carries everything a conforming implementation needs to rebuild the
//! head: projector weights, query bank values, per-layer attention /
//! feed-forward / normalization parameters, and the group-expansion weight
//! tensor and bias.
//!
//! ## Format Overview
//!
//! ```text
//! CLSF := HEADER METADATA[] TENSOR_INFO[] padding TENSOR_DATA
//!
//! HEADER := {
//!   magic: u32 = 0x46534C43 ("CLSF")
//!   version: u32
//!   tensor_count: u64
//!   metadata_count: u64
//! }
//! ```
//!
//! All integers are little-endian; tensor data is 32-byte aligned. Every
//! shape is validated against the header configuration at load time —
//! mismatches fail fast, nothing is coerced.

use std::{collections::HashMap, fs::File, path::Path};

use half::f16;
use memmap2::Mmap;

use crate::{
    decoder::{DecoderConfig, GroupWeights, MlDecoder},
    error::{ClasificarError, Result},
    tensor::Tensor,
};

/// CLSF magic number: "CLSF" in little-endian
pub const CLSF_MAGIC: u32 = 0x4653_4C43;

/// Current format version
pub const CLSF_VERSION: u32 = 1;

/// Alignment of the tensor data section
pub const CLSF_ALIGNMENT: usize = 32;

/// Tensor element type: f32
pub const CLSF_TYPE_F32: u32 = 0;

/// Tensor element type: f16 (widened to f32 at load)
pub const CLSF_TYPE_F16: u32 = 1;

/// Metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    /// Unsigned 64-bit integer
    UInt64(u64),
    /// 32-bit floating point
    Float32(f32),
    /// Boolean
    Bool(bool),
    /// UTF-8 string
    String(String),
}

/// Tensor record
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    /// Tensor name
    pub name: String,
    /// Dimensions (shape)
    pub dims: Vec<u64>,
    /// Element type (`CLSF_TYPE_F32` or `CLSF_TYPE_F16`)
    pub dtype: u32,
    /// Byte offset relative to the start of the data section
    pub offset: u64,
}

impl TensorInfo {
    /// Number of elements
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.dims.iter().product::<u64>() as usize
    }

    /// Size of the raw payload in bytes
    #[must_use]
    pub fn byte_size(&self) -> usize {
        let elem = if self.dtype == CLSF_TYPE_F16 { 2 } else { 4 };
        self.element_count() * elem
    }
}

/// Cursor over a byte slice with bounds-checked little-endian reads
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| {
            ClasificarError::FormatError {
                reason: "Offset overflow while reading".to_string(),
            }
        })?;
        if end > self.data.len() {
            return Err(ClasificarError::FormatError {
                reason: format!(
                    "Truncated file: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.data.len()
                ),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_f32(&mut self) -> Result<f32> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ClasificarError::FormatError {
            reason: "String is not valid UTF-8".to_string(),
        })
    }
}

fn align_offset(offset: usize) -> usize {
    offset.div_ceil(CLSF_ALIGNMENT) * CLSF_ALIGNMENT
}

/// Parsed CLSF file
///
/// Holds header, metadata and tensor records; tensor payloads are read on
/// demand from the caller-supplied file data so the same parse works over
/// an owned buffer or an mmap.
#[derive(Debug, Clone)]
pub struct WeightsFile {
    /// Format version
    pub version: u32,
    /// Metadata key-value pairs
    metadata: HashMap<String, MetaValue>,
    /// Tensor records by name
    tensors: HashMap<String, TensorInfo>,
    /// Absolute offset of the data section
    data_start: usize,
}

impl WeightsFile {
    /// Parse a CLSF blob's header, metadata and tensor table
    ///
    /// # Errors
    ///
    /// Returns `FormatError` on bad magic, unsupported version, truncation
    /// or malformed records
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);

        let magic = reader.read_u32()?;
        if magic != CLSF_MAGIC {
            return Err(ClasificarError::FormatError {
                reason: format!("Invalid magic 0x{magic:08X}, expected 0x{CLSF_MAGIC:08X}"),
            });
        }

        let version = reader.read_u32()?;
        if version != CLSF_VERSION {
            return Err(ClasificarError::FormatError {
                reason: format!("Unsupported version {version}, expected {CLSF_VERSION}"),
            });
        }

        let tensor_count = reader.read_u64()?;
        let metadata_count = reader.read_u64()?;

        let mut metadata = HashMap::new();
        for _ in 0..metadata_count {
            let key = reader.read_string()?;
            let type_tag = reader.read_u32()?;
            let value = match type_tag {
                0 => MetaValue::UInt64(reader.read_u64()?),
                1 => MetaValue::Float32(reader.read_f32()?),
                2 => MetaValue::Bool(reader.take(1)?[0] != 0),
                3 => MetaValue::String(reader.read_string()?),
                other => {
                    return Err(ClasificarError::FormatError {
                        reason: format!("Unknown metadata type tag {other} for key '{key}'"),
                    })
                }
            };
            metadata.insert(key, value);
        }

        let mut tensors = HashMap::new();
        for _ in 0..tensor_count {
            let name = reader.read_string()?;
            let n_dims = reader.read_u32()?;
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(reader.read_u64()?);
            }
            let dtype = reader.read_u32()?;
            if dtype != CLSF_TYPE_F32 && dtype != CLSF_TYPE_F16 {
                return Err(ClasificarError::FormatError {
                    reason: format!("Unknown tensor dtype {dtype} for '{name}'"),
                });
            }
            let offset = reader.read_u64()?;
            tensors.insert(
                name.clone(),
                TensorInfo {
                    name,
                    dims,
                    dtype,
                    offset,
                },
            );
        }

        let data_start = align_offset(reader.pos);

        // Validate every payload fits in the file
        for info in tensors.values() {
            let end = data_start + info.offset as usize + info.byte_size();
            if end > data.len() {
                return Err(ClasificarError::FormatError {
                    reason: format!(
                        "Tensor '{}' payload extends past end of file ({} > {})",
                        info.name,
                        end,
                        data.len()
                    ),
                });
            }
        }

        Ok(Self {
            version,
            metadata,
            tensors,
            data_start,
        })
    }

    /// Get a metadata value
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    /// Get a required u64 metadata value
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the key is missing or has another type
    pub fn require_u64(&self, key: &str) -> Result<u64> {
        match self.metadata.get(key) {
            Some(MetaValue::UInt64(v)) => Ok(*v),
            _ => Err(ClasificarError::FormatError {
                reason: format!("Missing or mistyped metadata key '{key}'"),
            }),
        }
    }

    /// Get a required f32 metadata value
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the key is missing or has another type
    pub fn require_f32(&self, key: &str) -> Result<f32> {
        match self.metadata.get(key) {
            Some(MetaValue::Float32(v)) => Ok(*v),
            _ => Err(ClasificarError::FormatError {
                reason: format!("Missing or mistyped metadata key '{key}'"),
            }),
        }
    }

    /// Get a required bool metadata value
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the key is missing or has another type
    pub fn require_bool(&self, key: &str) -> Result<bool> {
        match self.metadata.get(key) {
            Some(MetaValue::Bool(v)) => Ok(*v),
            _ => Err(ClasificarError::FormatError {
                reason: format!("Missing or mistyped metadata key '{key}'"),
            }),
        }
    }

    /// Get a tensor record by name
    #[must_use]
    pub fn tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    /// Number of tensors in the file
    #[must_use]
    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    /// Read a tensor's payload as f32 values
    ///
    /// F16 payloads are widened to f32. `file_data` must be the same buffer
    /// the file was parsed from.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` if the tensor is missing or out of bounds
    pub fn get_tensor_f32(&self, name: &str, file_data: &[u8]) -> Result<Vec<f32>> {
        let info = self.tensors.get(name).ok_or_else(|| {
            ClasificarError::FormatError {
                reason: format!("Tensor '{name}' not found"),
            }
        })?;

        let start = self.data_start + info.offset as usize;
        let end = start + info.byte_size();
        if end > file_data.len() {
            return Err(ClasificarError::FormatError {
                reason: format!("Tensor '{name}' payload out of bounds"),
            });
        }
        let bytes = &file_data[start..end];

        let values = match info.dtype {
            CLSF_TYPE_F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            _ => bytes
                .chunks_exact(2)
                .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                .collect(),
        };

        Ok(values)
    }

    /// Read a named tensor, insisting on an exact shape
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` if the stored dims differ from
    /// `expected_dims`
    pub fn get_tensor_checked(
        &self,
        name: &str,
        expected_dims: &[usize],
        file_data: &[u8],
    ) -> Result<Vec<f32>> {
        let info = self.tensors.get(name).ok_or_else(|| {
            ClasificarError::FormatError {
                reason: format!("Tensor '{name}' not found"),
            }
        })?;

        let stored: Vec<usize> = info.dims.iter().map(|&d| d as usize).collect();
        if stored != expected_dims {
            return Err(ClasificarError::DataShapeMismatch {
                data_size: info.element_count(),
                shape: stored,
                expected: expected_dims.iter().product(),
            });
        }

        self.get_tensor_f32(name, file_data)
    }
}

/// Memory-mapped CLSF file
///
/// Zero-copy access for large weight files; the map stays read-only for
/// the lifetime of the value.
pub struct MappedWeightsFile {
    mmap: Mmap,
}

impl MappedWeightsFile {
    /// Map a CLSF file from disk
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be opened or mapped
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: The mapping is read-only and the file handle outlives it
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }

    /// Get the mapped bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }
}

/// CLSF writer
///
/// Collects metadata and f32 tensors, then serializes them in the layout
/// [`WeightsFile::from_bytes`] reads back.
#[derive(Debug, Default)]
pub struct WeightsWriter {
    metadata: Vec<(String, MetaValue)>,
    tensors: Vec<(String, Vec<u64>, Vec<f32>)>,
}

impl WeightsWriter {
    /// Create an empty writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metadata entry
    pub fn add_meta(&mut self, key: impl Into<String>, value: MetaValue) {
        self.metadata.push((key.into(), value));
    }

    /// Add an f32 tensor
    ///
    /// # Errors
    ///
    /// Returns `DataShapeMismatch` if the data length doesn't match the dims
    pub fn add_tensor(
        &mut self,
        name: impl Into<String>,
        dims: Vec<u64>,
        data: Vec<f32>,
    ) -> Result<()> {
        let expected = dims.iter().product::<u64>() as usize;
        if data.len() != expected {
            return Err(ClasificarError::DataShapeMismatch {
                data_size: data.len(),
                shape: dims.iter().map(|&d| d as usize).collect(),
                expected,
            });
        }
        self.tensors.push((name.into(), dims, data));
        Ok(())
    }

    /// Serialize to a CLSF blob
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        let mut out = Vec::new();

        out.extend_from_slice(&CLSF_MAGIC.to_le_bytes());
        out.extend_from_slice(&CLSF_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        out.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());

        for (key, value) in &self.metadata {
            write_string(&mut out, key);
            match value {
                MetaValue::UInt64(v) => {
                    out.extend_from_slice(&0u32.to_le_bytes());
                    out.extend_from_slice(&v.to_le_bytes());
                }
                MetaValue::Float32(v) => {
                    out.extend_from_slice(&1u32.to_le_bytes());
                    out.extend_from_slice(&v.to_le_bytes());
                }
                MetaValue::Bool(v) => {
                    out.extend_from_slice(&2u32.to_le_bytes());
                    out.push(u8::from(*v));
                }
                MetaValue::String(v) => {
                    out.extend_from_slice(&3u32.to_le_bytes());
                    write_string(&mut out, v);
                }
            }
        }

        // Assign aligned offsets within the data section
        let mut offsets = Vec::with_capacity(self.tensors.len());
        let mut cursor = 0usize;
        for (_, _, data) in &self.tensors {
            cursor = align_offset(cursor);
            offsets.push(cursor as u64);
            cursor += data.len() * 4;
        }

        for ((name, dims, _), offset) in self.tensors.iter().zip(&offsets) {
            write_string(&mut out, name);
            out.extend_from_slice(&(dims.len() as u32).to_le_bytes());
            for dim in dims {
                out.extend_from_slice(&dim.to_le_bytes());
            }
            out.extend_from_slice(&CLSF_TYPE_F32.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
        }

        // Pad to the aligned data section, then each tensor to its offset
        let data_start = align_offset(out.len());
        out.resize(data_start, 0);

        for ((_, _, data), offset) in self.tensors.iter().zip(&offsets) {
            out.resize(data_start + *offset as usize, 0);
            for value in data {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }

        out
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

// Metadata keys carried by every conforming file
const META_NUM_CLASSES: &str = "num_classes";
const META_NUM_GROUPS: &str = "num_groups";
const META_DECODER_EMBEDDING: &str = "decoder_embedding";
const META_NUM_HEADS: &str = "num_heads";
const META_DIM_FEEDFORWARD: &str = "dim_feedforward";
const META_NUM_LAYERS: &str = "num_layers_decoder";
const META_INITIAL_FEATURES: &str = "initial_num_features";
const META_DROPOUT: &str = "dropout";
const META_NORM_EPS: &str = "layer_norm_eps";
const META_SHARED_GROUP_WEIGHTS: &str = "shared_group_weights";

impl MlDecoder {
    /// Serialize the head into a CLSF blob
    ///
    /// # Errors
    ///
    /// Returns error only on internal inconsistency
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let config = self.config();
        let g = config.num_groups() as u64;
        let d = config.embedding_dim() as u64;
        let ff = config.dim_feedforward as u64;
        let dup = config.duplicate_factor() as u64;

        let mut writer = WeightsWriter::new();
        writer.add_meta(
            META_NUM_CLASSES,
            MetaValue::UInt64(config.num_classes as u64),
        );
        writer.add_meta(META_NUM_GROUPS, MetaValue::UInt64(g));
        writer.add_meta(META_DECODER_EMBEDDING, MetaValue::UInt64(d));
        writer.add_meta(
            META_NUM_HEADS,
            MetaValue::UInt64(config.num_heads as u64),
        );
        writer.add_meta(META_DIM_FEEDFORWARD, MetaValue::UInt64(ff));
        writer.add_meta(
            META_NUM_LAYERS,
            MetaValue::UInt64(config.num_layers_decoder as u64),
        );
        writer.add_meta(
            META_INITIAL_FEATURES,
            MetaValue::UInt64(config.initial_num_features as u64),
        );
        writer.add_meta(META_DROPOUT, MetaValue::Float32(config.dropout));
        writer.add_meta(META_NORM_EPS, MetaValue::Float32(config.layer_norm_eps));
        writer.add_meta(
            META_SHARED_GROUP_WEIGHTS,
            MetaValue::Bool(self.group_fc().weights().is_shared()),
        );

        let proj = self.projector().linear();
        writer.add_tensor(
            "projector.weight",
            vec![config.initial_num_features as u64, d],
            proj.weight().to_vec(),
        )?;
        writer.add_tensor("projector.bias", vec![d], proj.bias().to_vec())?;

        writer.add_tensor(
            "queries.weight",
            vec![g, d],
            self.queries().weight().to_vec(),
        )?;

        for (i, layer) in self.layers().iter().enumerate() {
            for (tag, norm) in [
                ("norm1", layer.norm1()),
                ("norm2", layer.norm2()),
                ("norm3", layer.norm3()),
            ] {
                writer.add_tensor(
                    format!("layers.{i}.{tag}.weight"),
                    vec![d],
                    norm.weight().to_vec(),
                )?;
                writer.add_tensor(
                    format!("layers.{i}.{tag}.bias"),
                    vec![d],
                    norm.bias().to_vec(),
                )?;
            }

            let attn = layer.attn();
            for (tag, proj) in [
                ("q_proj", attn.q_proj()),
                ("k_proj", attn.k_proj()),
                ("v_proj", attn.v_proj()),
                ("out_proj", attn.out_proj()),
            ] {
                writer.add_tensor(
                    format!("layers.{i}.attn.{tag}.weight"),
                    vec![d, d],
                    proj.weight().to_vec(),
                )?;
                writer.add_tensor(
                    format!("layers.{i}.attn.{tag}.bias"),
                    vec![d],
                    proj.bias().to_vec(),
                )?;
            }

            writer.add_tensor(
                format!("layers.{i}.ffn.fc1.weight"),
                vec![d, ff],
                layer.fc1().weight().to_vec(),
            )?;
            writer.add_tensor(
                format!("layers.{i}.ffn.fc1.bias"),
                vec![ff],
                layer.fc1().bias().to_vec(),
            )?;
            writer.add_tensor(
                format!("layers.{i}.ffn.fc2.weight"),
                vec![ff, d],
                layer.fc2().weight().to_vec(),
            )?;
            writer.add_tensor(
                format!("layers.{i}.ffn.fc2.bias"),
                vec![d],
                layer.fc2().bias().to_vec(),
            )?;
        }

        match self.group_fc().weights() {
            GroupWeights::PerGroup(t) => {
                writer.add_tensor("group_fc.weight", vec![g, d, dup], t.data().to_vec())?;
            }
            GroupWeights::Shared(t) => {
                writer.add_tensor("group_fc.weight", vec![d, dup], t.data().to_vec())?;
            }
        }
        writer.add_tensor(
            "group_fc.bias",
            vec![config.num_classes as u64],
            self.group_fc().bias().to_vec(),
        )?;

        Ok(writer.into_bytes())
    }

    /// Load a head from a CLSF blob
    ///
    /// All configuration and tensor shapes are validated before any weight
    /// is written; a failure leaves nothing partially constructed behind.
    ///
    /// # Errors
    ///
    /// Returns `FormatError`/`DataShapeMismatch` on malformed files and
    /// `InvalidConfiguration` on inconsistent header configuration
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let file = WeightsFile::from_bytes(data)?;

        let num_classes = file.require_u64(META_NUM_CLASSES)? as usize;
        let num_groups = file.require_u64(META_NUM_GROUPS)? as usize;
        let embed_dim = file.require_u64(META_DECODER_EMBEDDING)? as usize;
        let num_heads = file.require_u64(META_NUM_HEADS)? as usize;
        let dim_feedforward = file.require_u64(META_DIM_FEEDFORWARD)? as usize;
        let num_layers = file.require_u64(META_NUM_LAYERS)? as usize;
        let initial_features = file.require_u64(META_INITIAL_FEATURES)? as usize;
        let dropout = file.require_f32(META_DROPOUT)?;
        let norm_eps = file.require_f32(META_NORM_EPS)?;
        let shared = file.require_bool(META_SHARED_GROUP_WEIGHTS)?;

        #[allow(clippy::cast_possible_wrap)]
        let config = DecoderConfig {
            num_classes,
            initial_num_features: initial_features,
            num_of_groups: num_groups as i64,
            decoder_embedding: embed_dim as i64,
            num_heads,
            dim_feedforward,
            num_layers_decoder: num_layers,
            dropout,
            layer_norm_eps: norm_eps,
        };
        config.validate()?;

        if config.num_groups() != num_groups {
            return Err(ClasificarError::FormatError {
                reason: format!(
                    "Header num_groups {} inconsistent with num_classes {}",
                    num_groups, num_classes
                ),
            });
        }

        let mut decoder = MlDecoder::with_shared_weights(config, shared)?;

        let g = num_groups;
        let d = embed_dim;
        let ff = dim_feedforward;
        let dup = decoder.config().duplicate_factor();

        let proj_weight =
            file.get_tensor_checked("projector.weight", &[initial_features, d], data)?;
        let proj_bias = file.get_tensor_checked("projector.bias", &[d], data)?;
        decoder
            .projector_mut()
            .linear_mut()
            .weight_mut()
            .copy_from_slice(&proj_weight);
        decoder
            .projector_mut()
            .linear_mut()
            .bias_mut()
            .copy_from_slice(&proj_bias);

        let queries = file.get_tensor_checked("queries.weight", &[g, d], data)?;
        decoder.queries_mut().weight_mut().copy_from_slice(&queries);

        for i in 0..num_layers {
            for tag in ["norm1", "norm2", "norm3"] {
                let weight =
                    file.get_tensor_checked(&format!("layers.{i}.{tag}.weight"), &[d], data)?;
                let bias =
                    file.get_tensor_checked(&format!("layers.{i}.{tag}.bias"), &[d], data)?;
                let norm = match tag {
                    "norm1" => decoder.layers_mut()[i].norm1_mut(),
                    "norm2" => decoder.layers_mut()[i].norm2_mut(),
                    _ => decoder.layers_mut()[i].norm3_mut(),
                };
                norm.weight_mut().copy_from_slice(&weight);
                norm.bias_mut().copy_from_slice(&bias);
            }

            for tag in ["q_proj", "k_proj", "v_proj", "out_proj"] {
                let weight = file.get_tensor_checked(
                    &format!("layers.{i}.attn.{tag}.weight"),
                    &[d, d],
                    data,
                )?;
                let bias = file.get_tensor_checked(
                    &format!("layers.{i}.attn.{tag}.bias"),
                    &[d],
                    data,
                )?;
                let attn = decoder.layers_mut()[i].attn_mut();
                let proj = match tag {
                    "q_proj" => attn.q_proj_mut(),
                    "k_proj" => attn.k_proj_mut(),
                    "v_proj" => attn.v_proj_mut(),
                    _ => attn.out_proj_mut(),
                };
                proj.weight_mut().copy_from_slice(&weight);
                proj.bias_mut().copy_from_slice(&bias);
            }

            let fc1_weight =
                file.get_tensor_checked(&format!("layers.{i}.ffn.fc1.weight"), &[d, ff], data)?;
            let fc1_bias =
                file.get_tensor_checked(&format!("layers.{i}.ffn.fc1.bias"), &[ff], data)?;
            let fc2_weight =
                file.get_tensor_checked(&format!("layers.{i}.ffn.fc2.weight"), &[ff, d], data)?;
            let fc2_bias =
                file.get_tensor_checked(&format!("layers.{i}.ffn.fc2.bias"), &[d], data)?;
            let layer = &mut decoder.layers_mut()[i];
            layer.fc1_mut().weight_mut().copy_from_slice(&fc1_weight);
            layer.fc1_mut().bias_mut().copy_from_slice(&fc1_bias);
            layer.fc2_mut().weight_mut().copy_from_slice(&fc2_weight);
            layer.fc2_mut().bias_mut().copy_from_slice(&fc2_bias);
        }

        let group_weights = if shared {
            let values = file.get_tensor_checked("group_fc.weight", &[d, dup], data)?;
            GroupWeights::Shared(Tensor::from_vec(vec![d, dup], values)?)
        } else {
            let values = file.get_tensor_checked("group_fc.weight", &[g, d, dup], data)?;
            GroupWeights::PerGroup(Tensor::from_vec(vec![g, d, dup], values)?)
        };
        decoder.group_fc_mut().set_weights(group_weights)?;

        let group_bias = file.get_tensor_checked("group_fc.bias", &[num_classes], data)?;
        decoder
            .group_fc_mut()
            .bias_mut()
            .copy_from_slice(&group_bias);

        Ok(decoder)
    }

    /// Load a head from a CLSF file on disk via mmap
    ///
    /// # Errors
    ///
    /// Returns `IoError` on filesystem failures and the same errors as
    /// [`MlDecoder::from_bytes`] on malformed content
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mapped = MappedWeightsFile::from_path(path)?;
        Self::from_bytes(mapped.data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_metadata() {
        let mut writer = WeightsWriter::new();
        writer.add_meta("answer", MetaValue::UInt64(42));
        writer.add_meta("pi", MetaValue::Float32(3.25));
        writer.add_meta("flag", MetaValue::Bool(true));
        writer.add_meta("name", MetaValue::String("head".to_string()));
        let bytes = writer.into_bytes();

        let file = WeightsFile::from_bytes(&bytes).unwrap();
        assert_eq!(file.require_u64("answer").unwrap(), 42);
        assert_eq!(file.require_f32("pi").unwrap(), 3.25);
        assert!(file.require_bool("flag").unwrap());
        assert_eq!(
            file.metadata("name"),
            Some(&MetaValue::String("head".to_string()))
        );
    }

    #[test]
    fn test_writer_reader_tensor_payload() {
        let mut writer = WeightsWriter::new();
        writer
            .add_tensor("t", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        let bytes = writer.into_bytes();

        let file = WeightsFile::from_bytes(&bytes).unwrap();
        assert_eq!(file.tensor_count(), 1);
        let values = file.get_tensor_f32("t", &bytes).unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_tensor_data_aligned() {
        let mut writer = WeightsWriter::new();
        writer.add_tensor("a", vec![1], vec![1.0]).unwrap();
        writer.add_tensor("b", vec![1], vec![2.0]).unwrap();
        let bytes = writer.into_bytes();

        let file = WeightsFile::from_bytes(&bytes).unwrap();
        let b = file.tensor("b").unwrap();
        assert_eq!(b.offset as usize % CLSF_ALIGNMENT, 0);
        assert_eq!(file.get_tensor_f32("b", &bytes).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = WeightsWriter::new().into_bytes();
        bytes[0] = b'X';
        let err = WeightsFile::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ClasificarError::FormatError { .. }));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let mut writer = WeightsWriter::new();
        writer.add_tensor("t", vec![4], vec![0.0; 4]).unwrap();
        let bytes = writer.into_bytes();
        let err = WeightsFile::from_bytes(&bytes[..bytes.len() - 8]).unwrap_err();
        assert!(matches!(err, ClasificarError::FormatError { .. }));
    }

    #[test]
    fn test_writer_rejects_shape_mismatch() {
        let mut writer = WeightsWriter::new();
        assert!(writer.add_tensor("t", vec![2, 2], vec![1.0]).is_err());
    }

    #[test]
    fn test_checked_read_rejects_wrong_dims() {
        let mut writer = WeightsWriter::new();
        writer.add_tensor("t", vec![2, 2], vec![0.0; 4]).unwrap();
        let bytes = writer.into_bytes();
        let file = WeightsFile::from_bytes(&bytes).unwrap();
        let err = file.get_tensor_checked("t", &[4], &bytes).unwrap_err();
        assert!(matches!(err, ClasificarError::DataShapeMismatch { .. }));
    }

    #[test]
    fn test_missing_tensor_error() {
        let bytes = WeightsWriter::new().into_bytes();
        let file = WeightsFile::from_bytes(&bytes).unwrap();
        assert!(file.get_tensor_f32("absent", &bytes).is_err());
    }

    #[test]
    fn test_f16_payload_widened() {
        // Hand-build a file with one f16 tensor
        let mut out = Vec::new();
        out.extend_from_slice(&CLSF_MAGIC.to_le_bytes());
        out.extend_from_slice(&CLSF_VERSION.to_le_bytes());
        out.extend_from_slice(&1u64.to_le_bytes()); // tensor count
        out.extend_from_slice(&0u64.to_le_bytes()); // metadata count
        write_string(&mut out, "t");
        out.extend_from_slice(&1u32.to_le_bytes()); // n_dims
        out.extend_from_slice(&2u64.to_le_bytes()); // dims[0]
        out.extend_from_slice(&CLSF_TYPE_F16.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // offset
        let data_start = align_offset(out.len());
        out.resize(data_start, 0);
        out.extend_from_slice(&f16::from_f32(1.5).to_le_bytes());
        out.extend_from_slice(&f16::from_f32(-2.0).to_le_bytes());

        let file = WeightsFile::from_bytes(&out).unwrap();
        let values = file.get_tensor_f32("t", &out).unwrap();
        assert_eq!(values, vec![1.5, -2.0]);
    }
}
