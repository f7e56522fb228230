//! Hex token stream codec.
//!
//! A stream is a sequence of tokens joined by `TOKEN_DELIMITER`. Each token
//! is the lowercase hex encoding of a binary record built with
//! `TokenWriter`. Because the hex alphabet never contains the delimiter,
//! splitting is unambiguous; the tokenizer still validates every character
//! so that corruption is reported at the token where it occurs.

use crate::error::FormatError;

/// Separator between tokens
pub const TOKEN_DELIMITER: char = '|';

/// The only characters allowed inside a token
pub const HEX_ALPHABET: &str = "0123456789abcdef";

/// Split and hex-decode a token stream.
pub fn decode_stream(stream: &str) -> Result<Vec<Vec<u8>>, FormatError> {
    if stream.is_empty() {
        return Err(FormatError::Corrupt("empty stream".to_string()));
    }

    let mut tokens = Vec::new();
    let mut start = 0;
    let bytes = stream.as_bytes();

    for (pos, &b) in bytes.iter().enumerate() {
        if b == TOKEN_DELIMITER as u8 {
            tokens.push(decode_token(&stream[start..pos], tokens.len())?);
            start = pos + 1;
        } else if !matches!(b, b'0'..=b'9' | b'a'..=b'f') {
            return Err(FormatError::MalformedToken {
                index: tokens.len(),
                reason: format!("byte 0x{:02x} at offset {} is not lowercase hex", b, pos),
            });
        }
    }
    tokens.push(decode_token(&stream[start..], tokens.len())?);

    Ok(tokens)
}

fn decode_token(token: &str, index: usize) -> Result<Vec<u8>, FormatError> {
    if token.is_empty() {
        return Err(FormatError::MalformedToken {
            index,
            reason: "empty token".to_string(),
        });
    }
    if token.len() % 2 != 0 {
        return Err(FormatError::MalformedToken {
            index,
            reason: format!("odd hex length {}", token.len()),
        });
    }
    hex::decode(token).map_err(|e| FormatError::MalformedToken {
        index,
        reason: e.to_string(),
    })
}

/// Hex-encode tokens and join them into a stream.
pub fn encode_stream<T: AsRef<[u8]>>(tokens: &[T]) -> String {
    let mut out = String::new();
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.push(TOKEN_DELIMITER);
        }
        out.push_str(&hex::encode(token));
    }
    out
}

/// Builds one binary record. Integers are big-endian, strings carry a u16
/// length prefix.
#[derive(Debug, Default)]
pub struct TokenWriter {
    buf: Vec<u8>,
}

impl TokenWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn put_bool(&mut self, v: bool) -> &mut Self {
        self.put_u8(u8::from(v))
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Strings longer than u16::MAX bytes cannot be represented.
    pub fn put_str(&mut self, v: &str) -> Result<&mut Self, FormatError> {
        let len = u16::try_from(v.len()).map_err(|_| {
            FormatError::Corrupt(format!("string of {} bytes exceeds field limit", v.len()))
        })?;
        self.put_u16(len);
        self.buf.extend_from_slice(v.as_bytes());
        Ok(self)
    }

    pub fn put_opt_str(&mut self, v: Option<&str>) -> Result<&mut Self, FormatError> {
        match v {
            Some(s) => {
                self.put_bool(true);
                self.put_str(s)
            }
            None => Ok(self.put_bool(false)),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads one binary record produced by `TokenWriter`. Every short read is
/// reported against the token index.
pub struct TokenReader<'a> {
    buf: &'a [u8],
    pos: usize,
    index: usize,
}

impl<'a> TokenReader<'a> {
    pub fn new(buf: &'a [u8], index: usize) -> Self {
        Self { buf, pos: 0, index }
    }

    fn malformed(&self, reason: impl Into<String>) -> FormatError {
        FormatError::MalformedToken {
            index: self.index,
            reason: reason.into(),
        }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], FormatError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        match end {
            Some(end) => {
                let buf: &'a [u8] = self.buf;
                let slice = &buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(self.malformed(format!(
                "truncated reading {} at offset {}",
                what, self.pos
            ))),
        }
    }

    pub fn u8(&mut self, what: &str) -> Result<u8, FormatError> {
        Ok(self.take(1, what)?[0])
    }

    pub fn u16(&mut self, what: &str) -> Result<u16, FormatError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self, what: &str) -> Result<u32, FormatError> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn bool(&mut self, what: &str) -> Result<bool, FormatError> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(self.malformed(format!("{} is not a boolean: {}", what, other))),
        }
    }

    pub fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8], FormatError> {
        self.take(n, what)
    }

    pub fn string(&mut self, what: &str) -> Result<String, FormatError> {
        let len = self.u16(what)? as usize;
        let raw = self.take(len, what)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| self.malformed(format!("{} is not valid UTF-8", what)))
    }

    pub fn opt_string(&mut self, what: &str) -> Result<Option<String>, FormatError> {
        if self.bool(what)? {
            self.string(what).map(Some)
        } else {
            Ok(None)
        }
    }

    /// The record must be consumed exactly.
    pub fn finish(self) -> Result<(), FormatError> {
        if self.pos != self.buf.len() {
            return Err(self.malformed(format!(
                "{} trailing byte(s)",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_split() {
        let tokens = decode_stream("00ff|0a|").unwrap_err();
        assert!(matches!(tokens, FormatError::MalformedToken { index: 2, .. }));

        let tokens = decode_stream("00ff|0a").unwrap();
        assert_eq!(tokens, vec![vec![0x00, 0xff], vec![0x0a]]);
    }

    #[test]
    fn test_rejects_foreign_characters() {
        // uppercase is outside the alphabet
        let err = decode_stream("00FF").unwrap_err();
        assert!(matches!(err, FormatError::MalformedToken { index: 0, .. }));

        let err = decode_stream("00|0g").unwrap_err();
        assert!(matches!(err, FormatError::MalformedToken { index: 1, .. }));

        let err = decode_stream("00,01").unwrap_err();
        assert!(matches!(err, FormatError::MalformedToken { index: 0, .. }));
    }

    #[test]
    fn test_rejects_empty_and_odd() {
        assert!(matches!(decode_stream(""), Err(FormatError::Corrupt(_))));
        assert!(matches!(
            decode_stream("|00"),
            Err(FormatError::MalformedToken { index: 0, .. })
        ));
        assert!(matches!(
            decode_stream("00||00"),
            Err(FormatError::MalformedToken { index: 1, .. })
        ));
        assert!(matches!(
            decode_stream("000"),
            Err(FormatError::MalformedToken { index: 0, .. })
        ));
    }

    #[test]
    fn test_record_fields() {
        let mut w = TokenWriter::new();
        w.put_u16(3).put_u32(0xdead_beef).put_bool(true);
        w.put_str("node-1").unwrap();
        w.put_opt_str(None).unwrap();
        let buf = w.finish();

        let mut r = TokenReader::new(&buf, 0);
        assert_eq!(r.u16("version").unwrap(), 3);
        assert_eq!(r.u32("id").unwrap(), 0xdead_beef);
        assert!(r.bool("flag").unwrap());
        assert_eq!(r.string("name").unwrap(), "node-1");
        assert_eq!(r.opt_string("sw").unwrap(), None);
        r.finish().unwrap();
    }

    #[test]
    fn test_truncation_and_trailing_bytes() {
        let mut r = TokenReader::new(&[0, 5, b'a'], 4);
        let err = r.string("name").unwrap_err();
        assert!(matches!(err, FormatError::MalformedToken { index: 4, .. }));

        let mut r = TokenReader::new(&[1, 9], 2);
        r.u8("type").unwrap();
        assert!(matches!(r.finish(), Err(FormatError::MalformedToken { index: 2, .. })));
    }

    #[test]
    fn test_bad_boolean() {
        let mut r = TokenReader::new(&[2], 0);
        assert!(r.bool("removed").is_err());
    }
}
