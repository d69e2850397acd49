//! Name/value pair encoding for `FCGI_PARAMS`.
//!
//! Each length is one byte when it is below 128, otherwise four bytes
//! big-endian with the high bit set. Pairs are concatenated without a
//! delimiter.

use bytes::{BufMut, Bytes, BytesMut};

use crate::fastcgi::error::{CodecError, EncodingError};
use crate::fastcgi::record::RecordType;

const MAX_PAIR_LEN: usize = 0x7fff_ffff;

/// Ordered parameter mapping sent to the application.
///
/// Insertion order is preserved; inserting an existing name replaces the
/// value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pairs: Vec<(String, Bytes)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let name = name.into();
        let value = value.into();
        match self.pairs.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.pairs.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Value as UTF-8, if present and valid.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Bytes> {
        let index = self.pairs.iter().position(|(n, _)| n == name)?;
        Some(self.pairs.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Append the encoded pairs to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodingError> {
        for (name, value) in &self.pairs {
            for len in [name.len(), value.len()] {
                if len > MAX_PAIR_LEN {
                    return Err(EncodingError::NameValueTooLong {
                        name: name.clone(),
                        len,
                    });
                }
            }
            put_length(dst, name.len());
            put_length(dst, value.len());
            dst.extend_from_slice(name.as_bytes());
            dst.extend_from_slice(value);
        }
        Ok(())
    }

    /// Parse a complete (already de-framed) params stream.
    pub fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        let total = data.len();
        let mut params = Params::new();
        while !data.is_empty() {
            let offset = (total - data.len()) as u64;
            let truncated = || CodecError::MalformedBody {
                record_type: RecordType::Params,
                reason: "truncated name/value pair",
                offset,
            };

            let name_len = take_length(&mut data).ok_or_else(truncated)?;
            let value_len = take_length(&mut data).ok_or_else(truncated)?;
            if data.len() < name_len + value_len {
                return Err(truncated());
            }
            let (name, rest) = data.split_at(name_len);
            let (value, rest) = rest.split_at(value_len);
            params.insert(
                String::from_utf8_lossy(name).into_owned(),
                Bytes::copy_from_slice(value),
            );
            data = rest;
        }
        Ok(params)
    }
}

impl<N, V> FromIterator<(N, V)> for Params
where
    N: Into<String>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

fn put_length(dst: &mut BytesMut, len: usize) {
    if len < 0x80 {
        dst.put_u8(len as u8);
    } else {
        dst.put_u32(len as u32 | 0x8000_0000);
    }
}

fn take_length(data: &mut &[u8]) -> Option<usize> {
    let first = *data.first()?;
    if first & 0x80 == 0 {
        *data = &data[1..];
        return Some(first as usize);
    }
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
    *data = &data[4..];
    Some(len as usize)
}
