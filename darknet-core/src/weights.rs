//! Weight blob loading and sequential consumption.
//!
//! Darknet stores every parameter as one flat run of little-endian `f32`s after a
//! short header. Layers read their arrays in cfg order through a [`WeightCursor`],
//! which only moves forward and must end exactly at the end of the buffer.

use std::{fs, path::Path};

use anyhow::{Context, Result, anyhow};
use log::{debug, warn};

use crate::error::BuildError;

/// Header size for yolov2 (but not yolov2-tiny) weight files: major, minor, revision, seen(i32).
const SHORT_HEADER_BYTES: usize = 16;
/// Header size for every other model: seen is stored as a 64-bit count.
const LONG_HEADER_BYTES: usize = 20;

/// Immutable flat list of network parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightBuffer {
    values: Vec<f32>,
}

impl WeightBuffer {
    pub fn from_values(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn cursor(&self) -> WeightCursor<'_> {
        WeightCursor {
            buffer: self,
            position: 0,
        }
    }
}

/// Forward-only reader over a [`WeightBuffer`].
#[derive(Debug)]
pub struct WeightCursor<'a> {
    buffer: &'a WeightBuffer,
    position: usize,
}

impl<'a> WeightCursor<'a> {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    /// Borrow the next `count` floats on behalf of cfg block `block`.
    pub fn take(&mut self, count: usize, block: usize) -> Result<&'a [f32], BuildError> {
        let values = self.buffer.as_slice();
        let end = self
            .position
            .checked_add(count)
            .filter(|&end| end <= values.len())
            .ok_or(BuildError::WeightsExhausted {
                block,
                requested: count,
                position: self.position,
                total: values.len(),
            })?;
        let slice = &values[self.position..end];
        self.position = end;
        Ok(slice)
    }

    /// Like [`take`](Self::take), copying into an owned vector.
    pub fn take_vec(&mut self, count: usize, block: usize) -> Result<Vec<f32>, BuildError> {
        self.take(count, block).map(<[f32]>::to_vec)
    }

    /// Confirm every float was consumed.
    pub fn finish(&self) -> Result<(), BuildError> {
        let total = self.buffer.len();
        if self.position != total {
            return Err(BuildError::UnusedWeights {
                consumed: self.position,
                total,
                unused: total - self.position,
            });
        }
        Ok(())
    }
}

/// Number of header bytes preceding the payload for `model_name`.
pub fn header_bytes(model_name: &str) -> usize {
    if model_name.contains("yolov2") && !model_name.contains("yolov2-tiny") {
        SHORT_HEADER_BYTES
    } else {
        LONG_HEADER_BYTES
    }
}

/// Load a binary `.weights` file, or a `.wts` text dump when the extension says so.
pub fn load_weights<P: AsRef<Path>>(path: P, model_name: &str) -> Result<WeightBuffer> {
    let path = path.as_ref();
    let is_wts = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wts"));
    let buffer = if is_wts {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read weights file {}", path.display()))?;
        parse_wts(&text).with_context(|| format!("failed to parse {}", path.display()))?
    } else {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read weights file {}", path.display()))?;
        decode_weights(&bytes, model_name)
            .with_context(|| format!("failed to decode {}", path.display()))?
    };
    debug!(
        "Loaded {} weights for '{}' from {}",
        buffer.len(),
        model_name,
        path.display()
    );
    if buffer.is_empty() {
        warn!("Weights file {} carries no parameters", path.display());
    }
    Ok(buffer)
}

/// Skip the header for `model_name` and decode the remaining little-endian floats.
pub fn decode_weights(bytes: &[u8], model_name: &str) -> Result<WeightBuffer> {
    let header = header_bytes(model_name);
    anyhow::ensure!(
        bytes.len() >= header,
        "weights file is {} bytes, shorter than its {}-byte header",
        bytes.len(),
        header
    );
    let payload = &bytes[header..];
    if !payload.len().is_multiple_of(4) {
        return Err(BuildError::WeightsLength {
            bytes: payload.len(),
        }
        .into());
    }
    let values = payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(WeightBuffer::from_values(values))
}

/// Parse the `.wts` text format: a tensor count, then `name count hex...` per line.
pub fn parse_wts(text: &str) -> Result<WeightBuffer> {
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
    let header = lines.next().ok_or_else(|| anyhow!("empty .wts file"))?;
    let tensors: usize = header
        .parse()
        .with_context(|| format!("invalid tensor count '{header}'"))?;

    let mut values = Vec::new();
    for tensor in 0..tensors {
        let line = lines
            .next()
            .ok_or_else(|| anyhow!("expected {tensors} tensors, found {tensor}"))?;
        let mut fields = line.split_whitespace();
        let name = fields.next().unwrap_or_default();
        let count: usize = fields
            .next()
            .ok_or_else(|| anyhow!("tensor '{name}' has no element count"))?
            .parse()
            .with_context(|| format!("invalid element count for tensor '{name}'"))?;
        let start = values.len();
        for word in fields {
            let bits = u32::from_str_radix(word, 16)
                .with_context(|| format!("invalid hex value '{word}' in tensor '{name}'"))?;
            values.push(f32::from_bits(bits));
        }
        anyhow::ensure!(
            values.len() - start == count,
            "tensor '{}' declares {} values but holds {}",
            name,
            count,
            values.len() - start
        );
    }
    Ok(WeightBuffer::from_values(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn weights_bytes(header: usize, values: &[f32]) -> Vec<u8> {
        let mut bytes = vec![0u8; header];
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn header_depends_on_model_name() {
        assert_eq!(header_bytes("yolov2"), 16);
        assert_eq!(header_bytes("yolov2-voc"), 16);
        assert_eq!(header_bytes("yolov2-tiny"), 20);
        assert_eq!(header_bytes("yolov4"), 20);
    }

    #[test]
    fn decodes_little_endian_payload() {
        let bytes = weights_bytes(20, &[1.5, -2.0, 0.25]);
        let buffer = decode_weights(&bytes, "yolov3").expect("decode");
        assert_eq!(buffer.as_slice(), &[1.5, -2.0, 0.25]);

        let bytes = weights_bytes(16, &[3.0]);
        let buffer = decode_weights(&bytes, "yolov2").expect("decode");
        assert_eq!(buffer.as_slice(), &[3.0]);
    }

    #[test]
    fn rejects_short_and_ragged_files() {
        assert!(decode_weights(&[0u8; 10], "yolov4").is_err());

        let mut bytes = weights_bytes(20, &[1.0]);
        bytes.push(7);
        let err = decode_weights(&bytes, "yolov4").unwrap_err();
        assert_eq!(
            err.downcast_ref::<BuildError>(),
            Some(&BuildError::WeightsLength { bytes: 5 })
        );
    }

    #[test]
    fn cursor_advances_and_checks_bounds() {
        let buffer = WeightBuffer::from_values(vec![1.0, 2.0, 3.0]);
        let mut cursor = buffer.cursor();
        assert_eq!(cursor.take(2, 1).expect("take"), &[1.0, 2.0]);
        assert_eq!(cursor.remaining(), 1);
        assert!(matches!(
            cursor.finish(),
            Err(BuildError::UnusedWeights { unused: 1, .. })
        ));
        assert!(matches!(
            cursor.take(2, 4),
            Err(BuildError::WeightsExhausted {
                block: 4,
                requested: 2,
                position: 2,
                total: 3,
            })
        ));
        assert_eq!(cursor.take_vec(1, 4).expect("take"), vec![3.0]);
        assert!(cursor.finish().is_ok());
    }

    #[test]
    fn loads_binary_and_wts_files() {
        let mut binary = NamedTempFile::new().expect("tempfile");
        binary
            .write_all(&weights_bytes(20, &[0.5, 0.75]))
            .expect("write");
        let buffer = load_weights(binary.path(), "yolov4-tiny").expect("load");
        assert_eq!(buffer.len(), 2);

        let mut wts = tempfile::Builder::new()
            .suffix(".wts")
            .tempfile()
            .expect("tempfile");
        let one = format!("{:08x}", 1.0f32.to_bits());
        let half = format!("{:08x}", 0.5f32.to_bits());
        writeln!(wts, "2\nconv.weight 2 {one} {half}\nconv.bias 1 {one}").expect("write");
        let buffer = load_weights(wts.path(), "yolov4").expect("load");
        assert_eq!(buffer.as_slice(), &[1.0, 0.5, 1.0]);
    }

    #[test]
    fn wts_count_mismatch_is_an_error() {
        assert!(parse_wts("1\nbias 2 3f800000\n").is_err());
        assert!(parse_wts("2\nbias 1 3f800000\n").is_err());
    }
}
