//! Subject distinguished name of an X.509 certificate, in RFC 2253 form.
//!
//! Only the path to the subject is walked:
//!
//! ```text
//! Certificate    ::= SEQUENCE { tbsCertificate, ... }
//! TBSCertificate ::= SEQUENCE { [0] version OPTIONAL, serialNumber,
//!                               signature, issuer, validity, subject, ... }
//! Name           ::= SEQUENCE OF SET OF SEQUENCE { type OID, value ANY }
//! ```
//!
//! Output lists the last RDN first, joins RDNs with `,` and the attributes
//! of a multi-valued RDN with `+`. Well-known attribute types use their
//! short names; anything else is written as a dotted OID with a `#`-hex
//! encoded value.

use std::fmt::Write;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot read certificate subject: {0}")]
pub struct DnError(String);

impl DnError {
    pub fn new(reason: impl Into<String>) -> Self {
        DnError(reason.into())
    }
}

const TAG_INTEGER: u8 = 0x02;
const TAG_OID: u8 = 0x06;
const TAG_UTF8_STRING: u8 = 0x0c;
const TAG_PRINTABLE_STRING: u8 = 0x13;
const TAG_TELETEX_STRING: u8 = 0x14;
const TAG_IA5_STRING: u8 = 0x16;
const TAG_UNIVERSAL_STRING: u8 = 0x1c;
const TAG_BMP_STRING: u8 = 0x1e;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_EXPLICIT_VERSION: u8 = 0xa0;

const SHORT_NAMES: [(&str, &str); 9] = [
    ("2.5.4.3", "CN"),
    ("2.5.4.7", "L"),
    ("2.5.4.8", "ST"),
    ("2.5.4.10", "O"),
    ("2.5.4.11", "OU"),
    ("2.5.4.6", "C"),
    ("2.5.4.9", "STREET"),
    ("0.9.2342.19200300.100.1.25", "DC"),
    ("0.9.2342.19200300.100.1.1", "UID"),
];

/// One TLV element
struct Element<'a> {
    tag: u8,
    content: &'a [u8],
    raw: &'a [u8],
}

struct DerReader<'a> {
    buf: &'a [u8],
}

impl<'a> DerReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn peek_tag(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    fn next(&mut self) -> Result<Element<'a>, DnError> {
        let buf = self.buf;
        let (&tag, rest) = buf
            .split_first()
            .ok_or_else(|| DnError::new("unexpected end of data"))?;
        if tag & 0x1f == 0x1f {
            return Err(DnError::new("multi-byte tags are not supported"));
        }
        let (&first, rest) = rest
            .split_first()
            .ok_or_else(|| DnError::new("missing length"))?;

        let (len, rest) = if first < 0x80 {
            (first as usize, rest)
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 || count > 4 || rest.len() < count {
                return Err(DnError::new("unsupported length encoding"));
            }
            let len = rest[..count]
                .iter()
                .fold(0usize, |acc, b| (acc << 8) | *b as usize);
            (len, &rest[count..])
        };

        if rest.len() < len {
            return Err(DnError::new(format!(
                "element of {} bytes overruns its container",
                len
            )));
        }
        let header_len = buf.len() - rest.len();
        let element = Element {
            tag,
            content: &rest[..len],
            raw: &buf[..header_len + len],
        };
        self.buf = &rest[len..];
        Ok(element)
    }

    fn expect(&mut self, tag: u8, what: &str) -> Result<&'a [u8], DnError> {
        let element = self.next()?;
        if element.tag != tag {
            return Err(DnError::new(format!(
                "expected {} (tag 0x{:02x}), found tag 0x{:02x}",
                what, tag, element.tag
            )));
        }
        Ok(element.content)
    }
}

/// RFC 2253 rendering of the certificate's subject
pub fn subject_dn(cert_der: &[u8]) -> Result<String, DnError> {
    let mut outer = DerReader::new(cert_der);
    let mut cert = DerReader::new(outer.expect(TAG_SEQUENCE, "certificate")?);
    let mut tbs = DerReader::new(cert.expect(TAG_SEQUENCE, "tbsCertificate")?);

    if tbs.peek_tag() == Some(TAG_EXPLICIT_VERSION) {
        tbs.next()?;
    }
    tbs.expect(TAG_INTEGER, "serial number")?;
    tbs.expect(TAG_SEQUENCE, "signature algorithm")?;
    tbs.expect(TAG_SEQUENCE, "issuer")?;
    tbs.expect(TAG_SEQUENCE, "validity")?;
    let subject = tbs.expect(TAG_SEQUENCE, "subject")?;

    format_name(subject)
}

/// Render the content of a DER `Name` sequence.
pub fn format_name(name: &[u8]) -> Result<String, DnError> {
    let mut rdns = Vec::new();
    let mut reader = DerReader::new(name);
    while !reader.is_empty() {
        let set = reader.expect(TAG_SET, "relative distinguished name")?;
        let mut attrs = Vec::new();
        let mut set_reader = DerReader::new(set);
        while !set_reader.is_empty() {
            let ava = set_reader.expect(TAG_SEQUENCE, "attribute")?;
            attrs.push(format_attribute(ava)?);
        }
        if attrs.is_empty() {
            return Err(DnError::new("empty relative distinguished name"));
        }
        rdns.push(attrs.join("+"));
    }
    rdns.reverse();
    Ok(rdns.join(","))
}

fn format_attribute(ava: &[u8]) -> Result<String, DnError> {
    let mut reader = DerReader::new(ava);
    let oid = decode_oid(reader.expect(TAG_OID, "attribute type")?)?;
    let value = reader.next()?;
    if !reader.is_empty() {
        return Err(DnError::new("trailing data in attribute"));
    }

    let short = SHORT_NAMES
        .iter()
        .find(|(dotted, _)| *dotted == oid)
        .map(|(_, short)| *short);

    if let Some(short) = short {
        if let Some(text) = decode_string(value.tag, value.content) {
            return Ok(format!("{}={}", short, escape_value(&text?)));
        }
        return Ok(format!("{}=#{}", short, hex::encode(value.raw)));
    }
    Ok(format!("{}=#{}", oid, hex::encode(value.raw)))
}

fn decode_oid(content: &[u8]) -> Result<String, DnError> {
    if content.is_empty() {
        return Err(DnError::new("empty object identifier"));
    }

    let mut subids = Vec::new();
    let mut value: u64 = 0;
    for &b in content {
        value = value
            .checked_mul(128)
            .ok_or_else(|| DnError::new("object identifier arc overflows"))?
            | u64::from(b & 0x7f);
        if b & 0x80 == 0 {
            subids.push(value);
            value = 0;
        }
    }
    if content.last().is_some_and(|b| b & 0x80 != 0) {
        return Err(DnError::new("truncated object identifier"));
    }

    // the first subidentifier packs two arcs; arc 2 takes any second value
    let first = subids[0];
    let (top, second) = match first {
        0..=39 => (0, first),
        40..=79 => (1, first - 40),
        _ => (2, first - 80),
    };
    let mut out = format!("{}.{}", top, second);
    for arc in &subids[1..] {
        let _ = write!(out, ".{}", arc);
    }
    Ok(out)
}

/// `None` when the tag is not a string type, `Some(Err)` when it is but the
/// bytes do not decode.
fn decode_string(tag: u8, content: &[u8]) -> Option<Result<String, DnError>> {
    let invalid = |kind: &str| DnError::new(format!("invalid {} value", kind));
    let decoded = match tag {
        TAG_UTF8_STRING | TAG_PRINTABLE_STRING | TAG_IA5_STRING => {
            String::from_utf8(content.to_vec()).map_err(|_| invalid("string"))
        }
        // treated as Latin-1
        TAG_TELETEX_STRING => Ok(content.iter().map(|&b| char::from(b)).collect()),
        TAG_BMP_STRING => {
            if content.len() % 2 != 0 {
                Err(invalid("BMPString"))
            } else {
                let units: Vec<u16> = content
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16(&units).map_err(|_| invalid("BMPString"))
            }
        }
        TAG_UNIVERSAL_STRING => {
            if content.len() % 4 != 0 {
                Err(invalid("UniversalString"))
            } else {
                content
                    .chunks_exact(4)
                    .map(|c| {
                        char::from_u32(u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                            .ok_or_else(|| invalid("UniversalString"))
                    })
                    .collect()
            }
        }
        _ => return None,
    };
    Some(decoded)
}

/// Escape an attribute value per RFC 2253 section 2.4.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let last = value.chars().count().saturating_sub(1);
    for (i, c) in value.chars().enumerate() {
        let needs_escape = matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';')
            || (i == 0 && (c == ' ' || c == '#'))
            || (i == last && c == ' ');
        if needs_escape {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
