//! Darknet `.cfg` text parser.
//!
//! The format is a sequence of `[type]` headers each followed by `key=value`
//! lines. Parsing only splits the text into [`ConfigBlock`]s; typing and
//! validation of the values happens in [`crate::config`].

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use log::debug;

use crate::error::BuildError;

/// One `[type]` section of a cfg file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlock {
    pub block_type: String,
    /// 1-based line of the `[type]` header.
    pub line: usize,
    pub entries: BTreeMap<String, String>,
}

impl ConfigBlock {
    pub fn new(block_type: impl Into<String>, line: usize) -> Self {
        Self {
            block_type: block_type.into(),
            line,
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

/// Read and parse a cfg file from disk.
pub fn parse_cfg<P: AsRef<Path>>(path: P) -> Result<Vec<ConfigBlock>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read cfg file {}", path.display()))?;
    let blocks =
        parse_cfg_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    debug!("Parsed {} blocks from {}", blocks.len(), path.display());
    Ok(blocks)
}

/// Parse cfg text into blocks, preserving file order.
///
/// When a key repeats inside a block, the first value is kept.
pub fn parse_cfg_str(text: &str) -> Result<Vec<ConfigBlock>> {
    let mut blocks = Vec::new();
    let mut current: Option<ConfigBlock> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() || line.starts_with([' ', '#', ';']) {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let Some(end) = rest.find(']') else {
                return Err(parse_error(line_no, "unterminated block header"));
            };
            let block_type = rest[..end].trim();
            if block_type.is_empty() {
                return Err(parse_error(line_no, "empty block header"));
            }
            if let Some(done) = current.take() {
                blocks.push(done);
            }
            current = Some(ConfigBlock::new(block_type, line_no));
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(parse_error(line_no, format!("expected key=value, found '{line}'")));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(parse_error(line_no, "empty key"));
        }
        let Some(block) = current.as_mut() else {
            return Err(parse_error(line_no, "assignment before the first block"));
        };
        block
            .entries
            .entry(key.to_string())
            .or_insert_with(|| value.trim().to_string());
    }

    if let Some(done) = current {
        blocks.push(done);
    }
    Ok(blocks)
}

fn parse_error(line: usize, message: impl Into<String>) -> anyhow::Error {
    BuildError::Parse {
        line,
        message: message.into(),
    }
    .into()
}
