//! Single-file artifact container.
//!
//! ```text
//! [8 bytes: magic b"GENLMPK\0"]
//! [4 bytes: format version (u32 LE)]
//! [8 bytes: header_size (u64 LE)]
//! [header_size bytes: JSON header]
//! [remaining bytes: little-endian f32 tensor data]
//! ```
//!
//! The file is memory-mapped on open; the header is parsed and every tensor
//! entry is bounds-checked against the data section before anything is read.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};

use genlm_tokenizer::Vocabulary;

use crate::config::ArchitectureConfig;
use crate::{ModelError, ModelResult};

pub const MAGIC: &[u8; 8] = b"GENLMPK\0";
pub const FORMAT_VERSION: u32 = 1;

/// Bytes before the JSON header: magic + version + header size.
const PREAMBLE_LEN: usize = 8 + 4 + 8;

/// What an artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Model,
    VisionEncoder,
    VisionAdapter,
    Lora,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Model => write!(f, "model"),
            ArtifactKind::VisionEncoder => write!(f, "vision_encoder"),
            ArtifactKind::VisionAdapter => write!(f, "vision_adapter"),
            ArtifactKind::Lora => write!(f, "lora"),
        }
    }
}

fn shape_numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |n, &dim| n.checked_mul(dim))
}

/// Metadata for a single tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Data type string. Only "F32" is stored today.
    pub dtype: String,

    /// Tensor shape.
    pub shape: Vec<usize>,

    /// Byte offset range `[start, end)` within the data section.
    pub data_offsets: [usize; 2],
}

impl TensorInfo {
    /// Number of elements implied by the shape. `None` if it overflows.
    pub fn numel(&self) -> Option<usize> {
        shape_numel(&self.shape)
    }

    /// Total byte size of the tensor data.
    pub fn byte_size(&self) -> usize {
        self.data_offsets[1].saturating_sub(self.data_offsets[0])
    }

    fn validate(&self, name: &str, data_len: usize) -> ModelResult<()> {
        if self.dtype != "F32" {
            return Err(ModelError::UnsupportedDtype {
                name: name.to_string(),
                dtype: self.dtype.clone(),
            });
        }

        let [start, end] = self.data_offsets;
        if start > end || end > data_len {
            return Err(ModelError::Truncated(format!(
                "tensor '{name}' spans [{start}..{end}] but the data section is {data_len} bytes"
            )));
        }

        let expected = self
            .numel()
            .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
            .ok_or_else(|| {
                ModelError::Header(format!("tensor '{name}' shape {:?} is too large", self.shape))
            })?;
        if self.byte_size() != expected {
            return Err(ModelError::Header(format!(
                "tensor '{name}' holds {} bytes, shape {:?} needs {expected}",
                self.byte_size(),
                self.shape
            )));
        }

        Ok(())
    }
}

/// Parsed JSON header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub kind: ArtifactKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<ArchitectureConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vocabulary: Option<Vocabulary>,

    #[serde(default)]
    pub stop_sequences: Vec<String>,

    pub tensors: BTreeMap<String, TensorInfo>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A memory-mapped file handle.
///
/// The mapped region remains valid for the lifetime of this struct.
#[derive(Debug)]
struct MappedFile {
    mmap: Mmap,
}

impl MappedFile {
    fn open(path: &Path) -> ModelResult<Self> {
        let io_err = |source| ModelError::Io {
            path: path.display().to_string(),
            source,
        };

        let file = File::open(path).map_err(io_err)?;
        let size = file.metadata().map_err(io_err)?.len() as usize;
        if size < PREAMBLE_LEN {
            return Err(ModelError::Truncated(format!(
                "{} is {size} bytes, shorter than the {PREAMBLE_LEN}-byte preamble",
                path.display()
            )));
        }

        // Safety: artifacts are treated as read-only and are not modified while mapped.
        let mmap = unsafe { Mmap::map(&file).map_err(io_err)? };
        Ok(Self { mmap })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }
}

/// An opened artifact: validated header plus mapped tensor data.
#[derive(Debug)]
pub struct ArtifactFile {
    header: ArtifactHeader,
    mapped: MappedFile,
    data_offset: usize,
}

impl ArtifactFile {
    /// Open, map and validate an artifact.
    pub fn open(path: &Path) -> ModelResult<Self> {
        let mapped = MappedFile::open(path)?;
        let bytes = mapped.as_bytes();

        if &bytes[..8] != MAGIC {
            return Err(ModelError::BadMagic);
        }

        let mut cursor = &bytes[8..PREAMBLE_LEN];
        let truncated = |e: std::io::Error| ModelError::Truncated(e.to_string());
        let version = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        if version != FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion {
                found: version,
                expected: FORMAT_VERSION,
            });
        }

        let header_size = cursor.read_u64::<LittleEndian>().map_err(truncated)? as usize;
        let data_offset = PREAMBLE_LEN
            .checked_add(header_size)
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                ModelError::Truncated(format!(
                    "header size {header_size} exceeds file size {}",
                    bytes.len()
                ))
            })?;

        let header_str = std::str::from_utf8(&bytes[PREAMBLE_LEN..data_offset])
            .map_err(|e| ModelError::Header(format!("invalid UTF-8 in header: {e}")))?;
        let header: ArtifactHeader = serde_json::from_str(header_str)?;

        let data_len = bytes.len() - data_offset;
        for (name, info) in &header.tensors {
            info.validate(name, data_len)?;
        }

        Ok(Self {
            header,
            mapped,
            data_offset,
        })
    }

    /// Open an artifact and require a specific kind.
    pub fn open_kind(path: &Path, expected: ArtifactKind) -> ModelResult<Self> {
        let file = Self::open(path)?;
        if file.header.kind != expected {
            return Err(ModelError::WrongKind {
                expected,
                found: file.header.kind,
            });
        }
        Ok(file)
    }

    pub fn header(&self) -> &ArtifactHeader {
        &self.header
    }

    pub fn kind(&self) -> ArtifactKind {
        self.header.kind
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.header.tensors.contains_key(name)
    }

    /// Metadata for a named tensor.
    pub fn tensor_info(&self, name: &str) -> ModelResult<&TensorInfo> {
        self.header
            .tensors
            .get(name)
            .ok_or_else(|| ModelError::MissingTensor(name.to_string()))
    }

    /// Check that a tensor exists with exactly `shape`.
    pub fn expect_shape(&self, name: &str, shape: &[usize]) -> ModelResult<()> {
        let info = self.tensor_info(name)?;
        if info.shape != shape {
            return Err(ModelError::TensorShape {
                name: name.to_string(),
                expected: shape.to_vec(),
                got: info.shape.clone(),
            });
        }
        Ok(())
    }

    /// Get the raw bytes for a named tensor.
    pub fn tensor_data(&self, name: &str) -> ModelResult<&[u8]> {
        let info = self.tensor_info(name)?;
        let start = self.data_offset + info.data_offsets[0];
        let end = self.data_offset + info.data_offsets[1];
        Ok(&self.mapped.as_bytes()[start..end])
    }

    /// Decode a tensor into an owned `Vec<f32>`.
    pub fn tensor_f32(&self, name: &str) -> ModelResult<Vec<f32>> {
        let info = self.tensor_info(name)?;
        let numel = info
            .numel()
            .ok_or_else(|| ModelError::Header(format!("tensor '{name}' shape is too large")))?;
        let mut out = vec![0.0f32; numel];
        let mut data = self.tensor_data(name)?;
        data.read_f32_into::<LittleEndian>(&mut out)
            .map_err(|e| ModelError::Truncated(format!("tensor '{name}': {e}")))?;
        Ok(out)
    }

    /// Decode a tensor after checking its shape.
    pub fn tensor_with_shape(&self, name: &str, shape: &[usize]) -> ModelResult<Vec<f32>> {
        self.expect_shape(name, shape)?;
        self.tensor_f32(name)
    }
}

/// Builds an artifact in memory and writes it out.
pub struct ArtifactWriter {
    header: ArtifactHeader,
    data: Vec<u8>,
}

impl ArtifactWriter {
    pub fn new(kind: ArtifactKind) -> Self {
        Self {
            header: ArtifactHeader {
                kind,
                architecture: None,
                vocabulary: None,
                stop_sequences: Vec::new(),
                tensors: BTreeMap::new(),
                metadata: BTreeMap::new(),
            },
            data: Vec::new(),
        }
    }

    pub fn architecture(mut self, config: ArchitectureConfig) -> Self {
        self.header.architecture = Some(config);
        self
    }

    pub fn vocabulary(mut self, vocab: Vocabulary) -> Self {
        self.header.vocabulary = Some(vocab);
        self
    }

    pub fn stop_sequences(mut self, stops: Vec<String>) -> Self {
        self.header.stop_sequences = stops;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.metadata.insert(key.into(), value.into());
        self
    }

    /// Append a tensor. `data.len()` must match the shape.
    pub fn tensor(
        mut self,
        name: impl Into<String>,
        shape: &[usize],
        data: &[f32],
    ) -> ModelResult<Self> {
        let name = name.into();
        if shape_numel(shape) != Some(data.len()) {
            return Err(ModelError::TensorShape {
                name,
                expected: shape.to_vec(),
                got: vec![data.len()],
            });
        }

        let start = self.data.len();
        for &value in data {
            self.data
                .write_f32::<LittleEndian>(value)
                .map_err(|e| ModelError::Header(e.to_string()))?;
        }
        self.header.tensors.insert(
            name,
            TensorInfo {
                dtype: "F32".to_string(),
                shape: shape.to_vec(),
                data_offsets: [start, self.data.len()],
            },
        );
        Ok(self)
    }

    /// Serialise to the container layout.
    pub fn to_bytes(&self) -> ModelResult<Vec<u8>> {
        let header = serde_json::to_vec(&self.header)?;
        let mut out = Vec::with_capacity(PREAMBLE_LEN + header.len() + self.data.len());
        let io = |e: std::io::Error| ModelError::Header(e.to_string());

        out.extend_from_slice(MAGIC);
        out.write_u32::<LittleEndian>(FORMAT_VERSION).map_err(io)?;
        out.write_u64::<LittleEndian>(header.len() as u64).map_err(io)?;
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn write(&self, path: &Path) -> ModelResult<()> {
        let bytes = self.to_bytes()?;
        let io_err = |source| ModelError::Io {
            path: path.display().to_string(),
            source,
        };
        let mut file = File::create(path).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)
    }
}
