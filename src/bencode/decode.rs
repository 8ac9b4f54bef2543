use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

// Remote input; cap nesting so a hostile packet cannot blow the stack.
const MAX_DEPTH: usize = 64;

/// Decodes a single bencode value spanning the whole input.
///
/// Trailing bytes after the value are an error: KRPC messages are exactly
/// one dictionary per UDP packet.
///
/// # Errors
///
/// Returns [`BencodeError`] on truncated input, malformed integers or
/// length prefixes, non-string dictionary keys, nesting deeper than 64
/// levels, or trailing data.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cur = Cursor { data, pos: 0 };
    let value = cur.value(0)?;
    if cur.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Truncated)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.byte_string().map(Value::Bytes),
            c => Err(BencodeError::UnexpectedByte(c)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.data[start..self.pos];
        self.pos += 1;

        // i-0e and leading zeros are invalid per BEP-3.
        let (sign, magnitude) = match digits.split_first() {
            Some((b'-', rest)) => (true, rest),
            _ => (false, digits),
        };
        if magnitude.is_empty() || (magnitude[0] == b'0' && (sign || magnitude.len() > 1)) {
            return Err(BencodeError::BadInteger);
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::Int)
            .ok_or(BencodeError::BadInteger)
    }

    fn byte_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::BadLength)?;
        self.pos += 1;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::Truncated)?;
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::BadDictKey);
            }
            let key = self.byte_string()?;
            let value = self.value(depth + 1)?;
            entries.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(entries))
    }
}
