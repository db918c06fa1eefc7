//! GGUF Model File Format Parser
//!
//! # Overview
//!
//! Parser (and directory writer) for the GGUF file format used across the
//! quantized-model ecosystem. GGUF packs a small header, a key/value
//! metadata directory, a tensor-info directory, and an aligned tensor-data
//! region into one little-endian file.
//!
//! # File Structure
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │  Header                          │  24 bytes
//! ├──────────────────────────────────┤
//! │  Metadata (Key-Value Pairs)      │  Variable
//! ├──────────────────────────────────┤
//! │  Tensor Info                     │  Variable
//! ├──────────────────────────────────┤
//! │  Padding (32-byte alignment)     │  0-31 bytes
//! ├──────────────────────────────────┤
//! │  Tensor Data                     │  Variable
//! └──────────────────────────────────┘
//! ```
//!
//! ## Header Format
//!
//! ```text
//! Offset  Size  Type    Field
//! ───────────────────────────────
//! 0       4     u32     magic (0x46554747 = "GGUF")
//! 4       4     u32     version (2 or 3)
//! 8       8     u64     tensor_count
//! 16      8     u64     metadata_count
//! ```
//!
//! ## Metadata Format
//!
//! Each entry is `key: string`, `value_type: u32`, then the value. Strings
//! are a u64 length followed by that many bytes, not NUL-terminated.
//! Value types 0-12: u8, i8, u16, i16, u32, i32, f32, bool, string,
//! array, u64, i64, f64. An array value is `elem_type: u32`, `len: u64`,
//! then `len` elements of that type, recursively.
//!
//! Only a handful of keys are interpreted by the assembler; every other
//! key must be *skipped correctly*, which the recursive value reader
//! guarantees — including arrays of strings and nested arrays.
//!
//! ## Tensor Info Format
//!
//! `name: string`, `n_dims: u32`, `shape: u64[n_dims]`, `dtype: u32`,
//! `offset: u64` (relative to the data region, which starts at
//! `align_up(end_of_tensor_info, 32)`).
//!
//! # Safety Considerations
//!
//! All reads are bounds-checked and report [`LlmError::Truncated`] with the
//! failing offset. No bytes are interpreted before validation of the magic
//! and version.

use std::collections::HashMap;

use crate::errors::{LlmError, LlmResult};
use crate::tensor::{DType, MAX_DIMS};

/// GGUF magic number: "GGUF" as little-endian u32
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// Supported format versions
pub const GGUF_VERSIONS: [u32; 2] = [2, 3];

/// Tensor data alignment (bytes)
pub const GGUF_ALIGNMENT: usize = 32;

/// Metadata value
#[derive(Debug, Clone, PartialEq)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Array(u32, Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    /// Wire type id
    pub fn type_id(&self) -> u32 {
        match self {
            GgufValue::U8(_) => 0,
            GgufValue::I8(_) => 1,
            GgufValue::U16(_) => 2,
            GgufValue::I16(_) => 3,
            GgufValue::U32(_) => 4,
            GgufValue::I32(_) => 5,
            GgufValue::F32(_) => 6,
            GgufValue::Bool(_) => 7,
            GgufValue::String(_) => 8,
            GgufValue::Array(_, _) => 9,
            GgufValue::U64(_) => 10,
            GgufValue::I64(_) => 11,
            GgufValue::F64(_) => 12,
        }
    }

    /// Widening integer read; model files mix u32 and u64 for counts
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            GgufValue::U8(v) => Some(*v as usize),
            GgufValue::I8(v) if *v >= 0 => Some(*v as usize),
            GgufValue::U16(v) => Some(*v as usize),
            GgufValue::I16(v) if *v >= 0 => Some(*v as usize),
            GgufValue::U32(v) => Some(*v as usize),
            GgufValue::I32(v) if *v >= 0 => Some(*v as usize),
            GgufValue::U64(v) => Some(*v as usize),
            GgufValue::I64(v) if *v >= 0 => Some(*v as usize),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            GgufValue::F32(v) => Some(*v),
            GgufValue::F64(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GgufValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[GgufValue]> {
        match self {
            GgufValue::Array(_, items) => Some(items),
            _ => None,
        }
    }
}

/// Parsed file header
#[derive(Debug, Clone, Copy)]
pub struct GgufHeader {
    pub magic: u32,
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_count: u64,
}

/// One tensor-info directory record
#[derive(Debug, Clone)]
pub struct GgufTensorInfo {
    pub name: String,
    pub n_dims: u32,
    /// Extents, padded with 1s to four dims
    pub ne: [usize; MAX_DIMS],
    /// Raw dtype id; unknown ids are kept so unused tensors can be ignored
    pub dtype_id: u32,
    /// Byte offset from the start of the tensor-data region
    pub offset: u64,
}

impl GgufTensorInfo {
    pub fn dtype(&self) -> LlmResult<DType> {
        DType::from_gguf(self.dtype_id)
    }

    pub fn nelements(&self) -> usize {
        self.ne.iter().product()
    }

    /// Dense byte size; errors on dtypes the core does not size
    pub fn byte_size(&self) -> LlmResult<usize> {
        let dtype = self.dtype()?;
        Ok(dtype.row_bytes(self.ne[0]) * self.ne[1] * self.ne[2] * self.ne[3])
    }
}

/// Parsed GGUF file: directories plus a borrowed view on the data region
#[derive(Debug)]
pub struct GgufFile {
    pub header: GgufHeader,
    /// Metadata in file order (order matters for byte-exact round trips)
    pub metadata: Vec<(String, GgufValue)>,
    pub tensors: Vec<GgufTensorInfo>,
    /// Absolute offset of the tensor-data region
    pub data_region_start: usize,
    key_index: HashMap<String, usize>,
    tensor_index: HashMap<String, usize>,
}

impl GgufFile {
    /// Parse the directories of a GGUF file
    pub fn parse(data: &[u8]) -> LlmResult<Self> {
        let mut r = Reader::new(data);

        let header = parse_header(&mut r)?;

        let mut metadata = Vec::with_capacity(header.metadata_count as usize);
        let mut key_index = HashMap::new();
        for _ in 0..header.metadata_count {
            let key = r.read_string()?;
            let value = read_value(&mut r)?;
            key_index.insert(key.clone(), metadata.len());
            metadata.push((key, value));
        }

        let mut tensors = Vec::with_capacity(header.tensor_count as usize);
        let mut tensor_index = HashMap::new();
        for _ in 0..header.tensor_count {
            let info = read_tensor_info(&mut r)?;
            tensor_index.insert(info.name.clone(), tensors.len());
            tensors.push(info);
        }

        let data_region_start = align_up(r.offset, GGUF_ALIGNMENT);
        if data_region_start > data.len() {
            return Err(LlmError::Truncated {
                offset: r.offset,
                needed: data_region_start - r.offset,
                available: data.len() - r.offset,
            });
        }

        Ok(GgufFile {
            header,
            metadata,
            tensors,
            data_region_start,
            key_index,
            tensor_index,
        })
    }

    /// Metadata lookup; `None` means the key is absent
    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.key_index.get(key).map(|&i| &self.metadata[i].1)
    }

    /// Integer metadata required by the assembler
    pub fn get_usize(&self, key: &str) -> LlmResult<usize> {
        self.get(key)
            .and_then(|v| v.as_usize())
            .ok_or_else(|| LlmError::MetadataMissing {
                key: key.to_string(),
            })
    }

    pub fn get_f32(&self, key: &str) -> LlmResult<f32> {
        self.get(key)
            .and_then(|v| v.as_f32())
            .ok_or_else(|| LlmError::MetadataMissing {
                key: key.to_string(),
            })
    }

    pub fn get_str(&self, key: &str) -> LlmResult<&str> {
        self.get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| LlmError::MetadataMissing {
                key: key.to_string(),
            })
    }

    /// Tensor-info lookup by exact name
    pub fn find_tensor(&self, name: &str) -> Option<&GgufTensorInfo> {
        self.tensor_index.get(name).map(|&i| &self.tensors[i])
    }

    /// Byte range of a tensor's data within the whole file buffer
    pub fn tensor_data_range(&self, info: &GgufTensorInfo, file_len: usize) -> LlmResult<(usize, usize)> {
        let size = info.byte_size()?;
        let start = self.data_region_start + info.offset as usize;
        let end = start.checked_add(size).ok_or(LlmError::Truncated {
            offset: start,
            needed: size,
            available: 0,
        })?;
        if end > file_len {
            return Err(LlmError::Truncated {
                offset: start,
                needed: size,
                available: file_len.saturating_sub(start),
            });
        }
        Ok((start, end))
    }

    /// Re-serialize header + metadata + tensor-info, padded to the data
    /// region start
    ///
    /// For a well-formed file this equals `file[0..data_region_start]`
    /// byte for byte.
    pub fn serialize_directory(&self) -> Vec<u8> {
        let mut w = Vec::new();
        w.extend_from_slice(&self.header.magic.to_le_bytes());
        w.extend_from_slice(&self.header.version.to_le_bytes());
        w.extend_from_slice(&self.header.tensor_count.to_le_bytes());
        w.extend_from_slice(&self.header.metadata_count.to_le_bytes());

        for (key, value) in &self.metadata {
            write_string(&mut w, key);
            w.extend_from_slice(&value.type_id().to_le_bytes());
            write_value(&mut w, value);
        }

        for info in &self.tensors {
            write_string(&mut w, &info.name);
            w.extend_from_slice(&info.n_dims.to_le_bytes());
            for d in 0..info.n_dims as usize {
                w.extend_from_slice(&(info.ne[d] as u64).to_le_bytes());
            }
            w.extend_from_slice(&info.dtype_id.to_le_bytes());
            w.extend_from_slice(&info.offset.to_le_bytes());
        }

        w.resize(align_up(w.len(), GGUF_ALIGNMENT), 0);
        w
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// Bounds-checked little-endian cursor
struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> LlmResult<&'a [u8]> {
        if self.offset + n > self.data.len() {
            return Err(LlmError::Truncated {
                offset: self.offset,
                needed: n,
                available: self.data.len() - self.offset,
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> LlmResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> LlmResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> LlmResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> LlmResult<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_string(&mut self) -> LlmResult<String> {
        let len = self.read_u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| LlmError::bad_format("invalid UTF-8 in string"))
    }
}

fn parse_header(r: &mut Reader) -> LlmResult<GgufHeader> {
    let magic = r.read_u32()?;
    if magic != GGUF_MAGIC {
        return Err(LlmError::bad_format(format!(
            "bad magic 0x{:08x}, expected 0x{:08x}",
            magic, GGUF_MAGIC
        )));
    }
    let version = r.read_u32()?;
    if !GGUF_VERSIONS.contains(&version) {
        return Err(LlmError::bad_format(format!(
            "unsupported gguf version {}",
            version
        )));
    }
    let tensor_count = r.read_u64()?;
    let metadata_count = r.read_u64()?;
    Ok(GgufHeader {
        magic,
        version,
        tensor_count,
        metadata_count,
    })
}

/// Read a typed metadata value, recursing into arrays
fn read_value_of_type(r: &mut Reader, type_id: u32) -> LlmResult<GgufValue> {
    Ok(match type_id {
        0 => GgufValue::U8(r.read_u8()?),
        1 => GgufValue::I8(r.read_u8()? as i8),
        2 => GgufValue::U16(r.read_u16()?),
        3 => GgufValue::I16(r.read_u16()? as i16),
        4 => GgufValue::U32(r.read_u32()?),
        5 => GgufValue::I32(r.read_u32()? as i32),
        6 => GgufValue::F32(f32::from_bits(r.read_u32()?)),
        7 => GgufValue::Bool(r.read_u8()? != 0),
        8 => GgufValue::String(r.read_string()?),
        9 => {
            let elem_type = r.read_u32()?;
            let len = r.read_u64()? as usize;
            let mut items = Vec::with_capacity(len.min(1 << 20));
            for _ in 0..len {
                items.push(read_value_of_type(r, elem_type)?);
            }
            GgufValue::Array(elem_type, items)
        }
        10 => GgufValue::U64(r.read_u64()?),
        11 => GgufValue::I64(r.read_u64()? as i64),
        12 => GgufValue::F64(f64::from_bits(r.read_u64()?)),
        other => {
            return Err(LlmError::unsupported(format!(
                "gguf metadata value type {}",
                other
            )))
        }
    })
}

fn read_value(r: &mut Reader) -> LlmResult<GgufValue> {
    let type_id = r.read_u32()?;
    read_value_of_type(r, type_id)
}

fn read_tensor_info(r: &mut Reader) -> LlmResult<GgufTensorInfo> {
    let name = r.read_string()?;
    let n_dims = r.read_u32()?;
    if n_dims as usize > MAX_DIMS {
        return Err(LlmError::bad_format(format!(
            "tensor '{}' has {} dims, max {}",
            name, n_dims, MAX_DIMS
        )));
    }
    let mut ne = [1usize; MAX_DIMS];
    for d in 0..n_dims as usize {
        ne[d] = r.read_u64()? as usize;
    }
    let dtype_id = r.read_u32()?;
    let offset = r.read_u64()?;
    Ok(GgufTensorInfo {
        name,
        n_dims,
        ne,
        dtype_id,
        offset,
    })
}

fn write_string(w: &mut Vec<u8>, s: &str) {
    w.extend_from_slice(&(s.len() as u64).to_le_bytes());
    w.extend_from_slice(s.as_bytes());
}

fn write_value(w: &mut Vec<u8>, value: &GgufValue) {
    match value {
        GgufValue::U8(v) => w.push(*v),
        GgufValue::I8(v) => w.push(*v as u8),
        GgufValue::U16(v) => w.extend_from_slice(&v.to_le_bytes()),
        GgufValue::I16(v) => w.extend_from_slice(&v.to_le_bytes()),
        GgufValue::U32(v) => w.extend_from_slice(&v.to_le_bytes()),
        GgufValue::I32(v) => w.extend_from_slice(&v.to_le_bytes()),
        GgufValue::F32(v) => w.extend_from_slice(&v.to_le_bytes()),
        GgufValue::Bool(v) => w.push(*v as u8),
        GgufValue::String(s) => write_string(w, s),
        GgufValue::Array(elem_type, items) => {
            w.extend_from_slice(&elem_type.to_le_bytes());
            w.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                write_value(w, item);
            }
        }
        GgufValue::U64(v) => w.extend_from_slice(&v.to_le_bytes()),
        GgufValue::I64(v) => w.extend_from_slice(&v.to_le_bytes()),
        GgufValue::F64(v) => w.extend_from_slice(&v.to_le_bytes()),
    }
}

/// Builder for complete GGUF files
///
/// Used by the test suite to construct synthetic models, and usable for
/// re-exporting. Tensor data is placed at successive 32-byte-aligned
/// offsets in declaration order.
#[derive(Default)]
pub struct GgufWriter {
    metadata: Vec<(String, GgufValue)>,
    tensors: Vec<(String, Vec<usize>, DType, Vec<u8>)>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &str, value: GgufValue) -> &mut Self {
        self.metadata.push((key.to_string(), value));
        self
    }

    /// Add a tensor with raw encoded bytes
    pub fn add_tensor(&mut self, name: &str, ne: &[usize], dtype: DType, data: Vec<u8>) -> &mut Self {
        self.tensors.push((name.to_string(), ne.to_vec(), dtype, data));
        self
    }

    /// Add an f32 tensor from values
    pub fn add_f32_tensor(&mut self, name: &str, ne: &[usize], values: &[f32]) -> &mut Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        self.add_tensor(name, ne, DType::F32, data)
    }

    /// Serialize the complete file
    pub fn build(&self) -> Vec<u8> {
        let mut w = Vec::new();
        w.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        w.extend_from_slice(&3u32.to_le_bytes());
        w.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        w.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());

        for (key, value) in &self.metadata {
            write_string(&mut w, key);
            w.extend_from_slice(&value.type_id().to_le_bytes());
            write_value(&mut w, value);
        }

        // Lay out tensor data offsets first, then emit the directory
        let mut offsets = Vec::with_capacity(self.tensors.len());
        let mut cursor = 0usize;
        for (_, _, _, data) in &self.tensors {
            cursor = align_up(cursor, GGUF_ALIGNMENT);
            offsets.push(cursor);
            cursor += data.len();
        }

        for ((name, ne, dtype, _), offset) in self.tensors.iter().zip(&offsets) {
            write_string(&mut w, name);
            w.extend_from_slice(&(ne.len() as u32).to_le_bytes());
            for d in ne {
                w.extend_from_slice(&(*d as u64).to_le_bytes());
            }
            w.extend_from_slice(&dtype.gguf_id().to_le_bytes());
            w.extend_from_slice(&(*offset as u64).to_le_bytes());
        }

        w.resize(align_up(w.len(), GGUF_ALIGNMENT), 0);
        let data_start = w.len();
        for ((_, _, _, data), offset) in self.tensors.iter().zip(&offsets) {
            w.resize(data_start + offset, 0);
            w.extend_from_slice(data);
        }
        w
    }
}
