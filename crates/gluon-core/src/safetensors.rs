// =============================================================================
// Safetensors — Name → array persistence
// =============================================================================
//
// Parameter files use the safetensors layout:
//
//   ┌──────────────┬──────────────────────┬───────────────────────┐
//   │ 8 bytes      │ N bytes              │ raw data bytes        │
//   │ header size  │ JSON header (UTF-8)  │ (contiguous, LE)      │
//   │ (u64 LE)     │                      │                       │
//   └──────────────┴──────────────────────┴───────────────────────┘
//
// JSON header example:
//   {
//     "__metadata__": { "format": "gluon" },
//     "dense0_weight": {
//       "dtype": "F32",
//       "shape": [64, 128],
//       "data_offsets": [0, 32768]
//     }
//   }
//
// Element bytes are copied straight out of the array storage, so a
// save/load round-trip is bit-identical for every dtype. Tensors are
// written back to back in the order given; reading sorts entries by their
// data offset, which recovers that order even though JSON objects do not
// keep it.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ndarray::{NDArray, Storage};
use crate::shape::Shape;

const MAX_HEADER_BYTES: usize = 100_000_000;

// ─────────────────────────────────────────────────────────────────────────────
// DType ↔ safetensors string
// ─────────────────────────────────────────────────────────────────────────────

fn dtype_to_st(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "F16",
        DType::F32 => "F32",
        DType::F64 => "F64",
        DType::I8 => "I8",
        DType::I32 => "I32",
        DType::I64 => "I64",
        DType::U8 => "U8",
    }
}

fn st_to_dtype(s: &str) -> Result<DType> {
    match s {
        "F16" => Ok(DType::F16),
        "F32" => Ok(DType::F32),
        "F64" => Ok(DType::F64),
        "I8" => Ok(DType::I8),
        "I32" => Ok(DType::I32),
        "I64" => Ok(DType::I64),
        "U8" | "BOOL" => Ok(DType::U8),
        _ => Err(Error::Persistence(format!("unsupported safetensors dtype: {s}"))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Header
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct TensorEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

fn parse_header(json_str: &str) -> Result<Vec<(String, TensorEntry)>> {
    let value: serde_json::Value = serde_json::from_str(json_str)?;
    let obj = value
        .as_object()
        .ok_or_else(|| Error::Persistence("safetensors header is not a JSON object".into()))?;

    let mut entries = Vec::with_capacity(obj.len());
    for (key, val) in obj {
        if key == "__metadata__" {
            continue;
        }
        let entry: TensorEntry = serde_json::from_value(val.clone()).map_err(|e| {
            Error::Persistence(format!("malformed safetensors entry '{key}': {e}"))
        })?;
        if entry.data_offsets[0] > entry.data_offsets[1] {
            return Err(Error::Persistence(format!(
                "safetensors entry '{key}' has inverted data_offsets"
            )));
        }
        entries.push((key.clone(), entry));
    }
    entries.sort_by_key(|(_, e)| e.data_offsets[0]);
    Ok(entries)
}

// ─────────────────────────────────────────────────────────────────────────────
// Write / read
// ─────────────────────────────────────────────────────────────────────────────

/// Write named arrays in safetensors format to a writer.
pub fn write_safetensors(writer: &mut impl Write, tensors: &[(String, NDArray)]) -> Result<()> {
    let mut all_data: Vec<u8> = Vec::new();
    let mut header = serde_json::Map::new();

    let mut metadata = serde_json::Map::new();
    metadata.insert("format".into(), serde_json::Value::String("gluon".into()));
    header.insert("__metadata__".into(), serde_json::Value::Object(metadata));

    for (name, tensor) in tensors {
        if header.contains_key(name) {
            return Err(Error::Persistence(format!(
                "duplicate array name '{name}' in save"
            )));
        }
        let bytes = tensor.storage().to_le_bytes();
        let start = all_data.len();
        all_data.extend_from_slice(&bytes);
        let entry = TensorEntry {
            dtype: dtype_to_st(tensor.dtype()).to_string(),
            shape: tensor.dims().to_vec(),
            data_offsets: [start, all_data.len()],
        };
        header.insert(name.clone(), serde_json::to_value(entry)?);
    }

    let header_bytes = serde_json::to_vec(&serde_json::Value::Object(header))?;
    writer.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
    writer.write_all(&header_bytes)?;
    writer.write_all(&all_data)?;
    Ok(())
}

/// Read named arrays from safetensors format, placing them on `context`.
pub fn read_safetensors(reader: &mut impl Read, context: Context) -> Result<Vec<(String, NDArray)>> {
    let mut size_buf = [0u8; 8];
    reader.read_exact(&mut size_buf)?;
    let header_size = u64::from_le_bytes(size_buf) as usize;
    if header_size > MAX_HEADER_BYTES {
        return Err(Error::Persistence(format!(
            "safetensors header size {header_size} bytes is unreasonably large"
        )));
    }

    let mut header_bytes = vec![0u8; header_size];
    reader.read_exact(&mut header_bytes)?;
    let header_str = std::str::from_utf8(&header_bytes)
        .map_err(|e| Error::Persistence(format!("invalid UTF-8 in safetensors header: {e}")))?;
    let entries = parse_header(header_str)?;

    let mut tensors = Vec::with_capacity(entries.len());
    let mut dtypes = Vec::with_capacity(entries.len());
    for (name, entry) in &entries {
        let dtype = st_to_dtype(&entry.dtype)?;
        let expected = entry
            .shape
            .iter()
            .try_fold(dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| {
                Error::Persistence(format!("'{name}': shape {:?} overflows the addressable size", entry.shape))
            })?;
        let [start, end] = entry.data_offsets;
        if end - start != expected {
            return Err(Error::Persistence(format!(
                "'{name}': expected {expected} bytes for shape {} of {dtype}, found {}",
                Shape::new(entry.shape.clone()),
                end - start
            )));
        }
        dtypes.push(dtype);
    }

    let max_offset = entries.iter().map(|(_, e)| e.data_offsets[1]).max().unwrap_or(0);
    let mut all_data = Vec::new();
    reader.take(max_offset as u64).read_to_end(&mut all_data)?;
    if all_data.len() < max_offset {
        return Err(Error::Persistence(format!(
            "safetensors payload holds {} bytes but the header describes {max_offset}",
            all_data.len()
        )));
    }

    for ((name, entry), dtype) in entries.into_iter().zip(dtypes) {
        let [start, end] = entry.data_offsets;
        let storage = Storage::from_le_bytes(dtype, &all_data[start..end])?;
        tensors.push((name, NDArray::from_storage(storage, Shape::new(entry.shape), context)?));
    }
    Ok(tensors)
}

// ─────────────────────────────────────────────────────────────────────────────
// High-level file API
// ─────────────────────────────────────────────────────────────────────────────

/// Save named arrays to a file.
pub fn save(path: impl AsRef<Path>, tensors: &[(String, NDArray)]) -> Result<()> {
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    write_safetensors(&mut writer, tensors)?;
    writer.flush()?;
    Ok(())
}

/// Load named arrays from a file, in the order they were saved.
pub fn load(path: impl AsRef<Path>, context: Context) -> Result<Vec<(String, NDArray)>> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    read_safetensors(&mut reader, context)
}

/// Load named arrays from a file into a map.
pub fn load_map(path: impl AsRef<Path>, context: Context) -> Result<HashMap<String, NDArray>> {
    Ok(load(path, context)?.into_iter().collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory API
// ─────────────────────────────────────────────────────────────────────────────

pub fn to_bytes(tensors: &[(String, NDArray)]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_safetensors(&mut buf, tensors)?;
    Ok(buf)
}

pub fn from_bytes(data: &[u8], context: Context) -> Result<Vec<(String, NDArray)>> {
    let mut cursor = std::io::Cursor::new(data);
    read_safetensors(&mut cursor, context)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> Context {
        Context::cpu(0)
    }

    #[test]
    fn test_order_is_preserved() {
        let names = ["zeta", "alpha", "mid"];
        let tensors: Vec<(String, NDArray)> = names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                let t = NDArray::full(2, i as f64, DType::F32, cpu()).unwrap();
                (n.to_string(), t)
            })
            .collect();
        let loaded = from_bytes(&to_bytes(&tensors).unwrap(), cpu()).unwrap();
        let loaded_names: Vec<&str> = loaded.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(loaded_names, names);
    }

    #[test]
    fn test_bit_identical_f32() {
        let vals = [0.1, -2.5e-8, 3.4e38, 1.0 / 3.0, 0.0, -7.25];
        let t = NDArray::from_f64_slice(&vals, (2, 3), DType::F32, cpu()).unwrap();
        let loaded = from_bytes(&to_bytes(&[("w".to_string(), t.clone())]).unwrap(), cpu()).unwrap();
        assert_eq!(loaded[0].1.dims(), &[2, 3]);
        assert_eq!(loaded[0].1.storage(), t.storage());
    }

    #[test]
    fn test_i64_beyond_f64_precision() {
        let big = NDArray::from_vec(vec![i64::MAX, i64::MIN + 1], 2, cpu()).unwrap();
        let loaded = from_bytes(&to_bytes(&[("ids".to_string(), big.clone())]).unwrap(), cpu()).unwrap();
        assert_eq!(loaded[0].1.storage(), big.storage());
    }

    #[test]
    fn test_file_roundtrip_on_requested_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.safetensors");
        let t = NDArray::from_f64_slice(&[1.0, 2.0, 3.0], 3, DType::F64, cpu()).unwrap();
        save(&path, &[("b".to_string(), t)]).unwrap();
        let map = load_map(&path, Context::gpu(0)).unwrap();
        assert_eq!(map["b"].context(), Context::gpu(0));
        assert_eq!(map["b"].to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let t = NDArray::zeros(1, DType::F32, cpu()).unwrap();
        let r = to_bytes(&[("x".to_string(), t.clone()), ("x".to_string(), t)]);
        assert!(matches!(r, Err(Error::Persistence(_))));
    }

    #[test]
    fn test_truncated_data_is_error() {
        let t = NDArray::zeros(4, DType::F32, cpu()).unwrap();
        let mut bytes = to_bytes(&[("x".to_string(), t)]).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(from_bytes(&bytes, cpu()).is_err());
    }

    fn with_header(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn test_overflowing_shape_is_error() {
        let header = r#"{"a":{"dtype":"F32","shape":[18446744073709551615,4],"data_offsets":[0,0]}}"#;
        let r = from_bytes(&with_header(header, &[]), cpu());
        assert!(matches!(r, Err(Error::Persistence(ref m)) if m.contains("overflows")));
    }

    #[test]
    fn test_offsets_past_payload_are_error() {
        // 2^40 f32 elements claimed, 8 bytes present.
        let header = r#"{"a":{"dtype":"F32","shape":[274877906944],"data_offsets":[0,1099511627776]}}"#;
        let r = from_bytes(&with_header(header, &[0u8; 8]), cpu());
        assert!(matches!(r, Err(Error::Persistence(ref m)) if m.contains("payload holds 8 bytes")));
    }
}
