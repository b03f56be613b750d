use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeadersError {
    #[error("unexpected end of header block")]
    UnexpectedEnd,

    #[error("header name is not valid UTF-8")]
    InvalidName,

    #[error("header value is not valid UTF-8")]
    InvalidValue,

    #[error("header name or value does not fit a 16-bit length prefix")]
    TooLong,
}

/// An ordered multimap of case-insensitive names to UTF-8 values.
///
/// Carried inside a HEADERS frame as repeated
/// `[name_len:u16 BE][name][value_len:u16 BE][value]`. Names are lowercased
/// on insert; pseudo-headers start with `:` and are reserved for the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a name/value pair, preserving any existing values for the name.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.entries
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    /// Replace every value for the name with a single value.
    pub fn insert(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref().to_ascii_lowercase();
        self.entries.retain(|(n, _)| *n != name);
        self.entries.push((name, value.into()));
    }

    /// The first value for the name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for the name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge another set of headers into this one, appending values.
    pub fn extend(&mut self, other: &Headers) {
        for (name, value) in other.iter() {
            self.append(name, value);
        }
    }

    /// Encode the block, failing before anything is written when a name or
    /// value cannot fit its 16-bit length prefix.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), HeadersError> {
        for (name, value) in &self.entries {
            if name.len() > u16::MAX as usize || value.len() > u16::MAX as usize {
                return Err(HeadersError::TooLong);
            }
        }
        for (name, value) in &self.entries {
            buf.put_u16(name.len() as u16);
            buf.put_slice(name.as_bytes());
            buf.put_u16(value.len() as u16);
            buf.put_slice(value.as_bytes());
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, HeadersError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a complete header block; the whole buffer must be consumed.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, HeadersError> {
        let mut headers = Headers::new();
        while buf.has_remaining() {
            let name = read_string(buf).map_err(|err| match err {
                HeadersError::InvalidValue => HeadersError::InvalidName,
                other => other,
            })?;
            let value = read_string(buf)?;
            // Names were lowercased by the sender, but don't trust the wire.
            headers.append(name, value);
        }
        Ok(headers)
    }
}

fn read_string<B: Buf>(buf: &mut B) -> Result<String, HeadersError> {
    if buf.remaining() < 2 {
        return Err(HeadersError::UnexpectedEnd);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(HeadersError::UnexpectedEnd);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| HeadersError::InvalidValue)
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_order() {
        let mut headers = Headers::new();
        headers.append(":method", "Echo/Say");
        headers.append(":deadline-ms", "1000");
        headers.append("x-trace", "abc");
        headers.append("x-trace", "def");

        let mut wire = headers.to_bytes().unwrap();
        let decoded = Headers::decode(&mut wire).unwrap();
        assert_eq!(decoded, headers);
        assert_eq!(
            decoded.get_all("x-trace").collect::<Vec<_>>(),
            vec!["abc", "def"]
        );
    }

    #[test]
    fn names_are_case_insensitive() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "application/zrpc+zpb");
        assert_eq!(headers.get("content-type"), Some("application/zrpc+zpb"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("application/zrpc+zpb"));
    }

    #[test]
    fn insert_replaces_all_values() {
        let mut headers = Headers::new();
        headers.append("x-k", "1");
        headers.append("x-k", "2");
        headers.insert("x-k", "3");
        assert_eq!(headers.get_all("x-k").collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn encode_rejects_oversize_value() {
        let mut headers = Headers::new();
        headers.append("x-ok", "fine");
        headers.append("x-big", "v".repeat(u16::MAX as usize + 1));

        let mut buf = BytesMut::new();
        assert_eq!(headers.encode(&mut buf).unwrap_err(), HeadersError::TooLong);
        // Validation happens before any write.
        assert!(buf.is_empty());
        assert_eq!(headers.to_bytes().unwrap_err(), HeadersError::TooLong);

        // The largest representable value still encodes.
        let mut headers = Headers::new();
        headers.append("x-max", "v".repeat(u16::MAX as usize));
        let mut wire = headers.to_bytes().unwrap();
        assert_eq!(Headers::decode(&mut wire).unwrap(), headers);
    }

    #[test]
    fn decode_rejects_truncation() {
        let mut headers = Headers::new();
        headers.append(":method", "Svc/Op");
        let wire = headers.to_bytes().unwrap();

        for cut in 1..wire.len() {
            let mut partial = wire.slice(..cut);
            assert_eq!(
                Headers::decode(&mut partial).unwrap_err(),
                HeadersError::UnexpectedEnd,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn decode_rejects_bad_utf8() {
        let mut wire = BytesMut::new();
        wire.put_u16(2);
        wire.put_slice(&[0xFF, 0xFE]);
        wire.put_u16(0);
        assert_eq!(
            Headers::decode(&mut wire).unwrap_err(),
            HeadersError::InvalidName
        );
    }

    #[test]
    fn empty_block_decodes_empty() {
        let mut wire = Bytes::new();
        assert!(Headers::decode(&mut wire).unwrap().is_empty());
    }
}
