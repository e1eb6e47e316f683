//! Canonical serialization and hashing shared by transactions and blocks.
//!
//! The canonical form is JSON with sorted keys, `", "` between items,
//! `": "` between a key and its value, and every character outside
//! printable ASCII escaped as `\uXXXX`. Peers written in other languages
//! produce the same bytes with their stock JSON encoder in sorted-key mode,
//! which keeps header hashes identical across implementations.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// JSON formatter producing the canonical layout.
#[derive(Debug, Default, Clone, Copy)]
struct CanonicalFormatter;

impl Formatter for CanonicalFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        // Fragments never contain quotes, backslashes or control characters;
        // serde_json routes those through `write_char_escape`.
        let mut start = 0;
        for (pos, ch) in fragment.char_indices() {
            if (' '..='~').contains(&ch) {
                continue;
            }
            writer.write_all(fragment[start..pos].as_bytes())?;
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = pos + ch.len_utf8();
        }
        writer.write_all(fragment[start..].as_bytes())
    }
}

/// Serializes a JSON value into its canonical byte form.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter);
    // Writing a `Value` into a Vec cannot fail: keys are always strings and
    // the writer never returns an I/O error.
    if value.serialize(&mut serializer).is_err() {
        buf.clear();
    }
    buf
}

/// Canonical serialization as a string.
pub fn canonical_string(value: &Value) -> String {
    String::from_utf8_lossy(&canonical_bytes(value)).into_owned()
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hash of the canonical serialization of `value`.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(&canonical_bytes(value))
}

/// Computes the Merkle root over a list of leaf hashes.
///
/// Levels with an odd number of entries duplicate their last entry. Pairs
/// are combined by hashing the concatenation of their hex strings. An empty
/// list has no root.
pub fn merkle_root(mut level: Vec<String>) -> Option<String> {
    if level.is_empty() {
        return None;
    }

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            if let Some(last) = level.last().cloned() {
                level.push(last);
            }
        }

        level = level
            .chunks(2)
            .map(|pair| {
                let combined = format!("{}{}", pair[0], pair[1]);
                sha256_hex(combined.as_bytes())
            })
            .collect();
    }

    level.pop()
}
