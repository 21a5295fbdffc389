//! Dialog identity and its record-route token encoding
//!
//! A linked dialog is identified by the pair `(bucket, seq)`: the registry
//! bucket that owns it and the per-bucket sequence number assigned at link
//! time. Sequence `0` is reserved and means "not linked yet".
//!
//! The identity travels through the network as a record-route parameter
//! value. Both integers are written in *reverse* hexadecimal (least
//! significant nibble first) and joined with [`TOKEN_SEPARATOR`]:
//!
//! ```text
//! DialogId { bucket: 0x1a3, seq: 0x20 }  <->  "3a1.02"
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{DialogError, DialogResult};

/// Separator between the bucket and sequence parts of a route token
pub const TOKEN_SEPARATOR: char = '.';

/// Hex digits needed for one `u32`
const HEX_DIGITS_PER_U32: usize = 2 * std::mem::size_of::<u32>();

/// Longest valid route token
pub const MAX_TOKEN_LEN: usize = 2 * HEX_DIGITS_PER_U32 + 1;

/// Stable identity of a linked dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DialogId {
    /// Registry bucket index
    pub bucket: u32,
    /// Per-bucket sequence number, never 0 once linked
    pub seq: u32,
}

impl DialogId {
    /// Create an identity from its parts
    pub fn new(bucket: u32, seq: u32) -> Self {
        Self { bucket, seq }
    }

    /// Identity of a record that has not been linked yet
    pub fn unset(bucket: u32) -> Self {
        Self { bucket, seq: 0 }
    }

    /// Whether the identity refers to a linked record
    pub fn is_set(&self) -> bool {
        self.seq != 0
    }

    /// Encode as a record-route token
    pub fn to_token(&self) -> String {
        let mut token = String::with_capacity(MAX_TOKEN_LEN);
        push_reverse_hex(&mut token, self.bucket);
        token.push(TOKEN_SEPARATOR);
        push_reverse_hex(&mut token, self.seq);
        token
    }

    /// Decode a record-route token
    pub fn from_token(token: &str) -> DialogResult<Self> {
        if token.is_empty() {
            return Err(DialogError::invalid_token(token, "empty token"));
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(DialogError::invalid_token(token, "token too long"));
        }

        let (bucket, seq) = token
            .split_once(TOKEN_SEPARATOR)
            .ok_or_else(|| DialogError::invalid_token(token, "missing separator"))?;

        let bucket = parse_reverse_hex(token, bucket)?;
        let seq = parse_reverse_hex(token, seq)?;
        Ok(Self { bucket, seq })
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.bucket, self.seq)
    }
}

fn push_reverse_hex(out: &mut String, mut value: u32) {
    if value == 0 {
        out.push('0');
        return;
    }
    while value != 0 {
        let nibble = value & 0xf;
        // nibble is always < 16
        out.push(char::from_digit(nibble, 16).unwrap_or('0'));
        value >>= 4;
    }
}

fn parse_reverse_hex(token: &str, part: &str) -> DialogResult<u32> {
    if part.is_empty() {
        return Err(DialogError::invalid_token(token, "empty component"));
    }
    if part.len() > HEX_DIGITS_PER_U32 {
        return Err(DialogError::invalid_token(token, "component exceeds 32 bits"));
    }

    let mut value: u32 = 0;
    for (position, ch) in part.chars().enumerate() {
        let digit = ch
            .to_digit(16)
            .ok_or_else(|| DialogError::invalid_token(token, format!("non-hex character '{}'", ch)))?;
        value |= digit << (4 * position);
    }
    Ok(value)
}
