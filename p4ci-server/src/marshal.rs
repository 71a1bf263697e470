//! Marshalled dictionary codec used by `p4 -G`.
//!
//! With `-G` the command-line client writes every result as a marshalled
//! dictionary of string keys to string or integer values, back to back on
//! stdout, and reads spec forms in the same encoding on stdin.
//!
//! Wire layout of one record:
//!
//! ```text
//! '{'  ( key value )*  '0'
//! key    = 's' <u32 LE length> <bytes>
//! value  = 's' <u32 LE length> <bytes> | 'i' <i32 LE>
//! ```

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

const DICT: u8 = b'{';
const NULL: u8 = b'0';
const STRING: u8 = b's';
const INTERNED: u8 = b't';
const UNICODE: u8 = b'u';
const INT: u8 = b'i';
const NONE: u8 = b'N';
const TRUE: u8 = b'T';
const FALSE: u8 = b'F';
const FLAG_REF: u8 = 0x80;

/// Upper bound on one string, guards against garbage lengths.
const MAX_STRING: usize = 1 << 30;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One result dictionary. Integer values are kept in decimal form so every
/// field reads the same way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    fields: BTreeMap<String, Vec<u8>>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Field as text, lossily decoded.
    pub fn get(&self, key: &str) -> Option<String> {
        self.fields
            .get(key)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn code(&self) -> Option<String> {
        self.get("code")
    }

    fn severity(&self) -> u64 {
        self.get_u64("severity").unwrap_or(0)
    }

    /// A failure (`E_FAILED` or worse).
    pub fn is_error(&self) -> bool {
        self.code().as_deref() == Some("error") && self.severity() >= 3
    }

    /// An informational or warning message such as "file(s) up-to-date.".
    pub fn is_warning(&self) -> bool {
        self.code().as_deref() == Some("error") && self.severity() < 3
    }

    /// Message text of an error, warning or info record.
    pub fn message(&self) -> String {
        self.get("data").unwrap_or_default().trim().to_owned()
    }

    /// `Prefix0`, `Prefix1`, ... in index order, stopping at the first gap.
    pub fn indexed(&self, prefix: &str) -> Vec<String> {
        (0..)
            .map(|i| self.get(&format!("{prefix}{i}")))
            .take_while(Option::is_some)
            .flatten()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_i32(r: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_string(r: &mut impl Read) -> io::Result<Vec<u8>> {
    let len = read_i32(r)?;
    let len = usize::try_from(len).map_err(|_| invalid(format!("negative length {len}")))?;
    if len > MAX_STRING {
        return Err(invalid(format!("string length {len} too large")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_value(r: &mut impl Read, tag: u8) -> io::Result<Vec<u8>> {
    match tag & !FLAG_REF {
        STRING | INTERNED | UNICODE => read_string(r),
        INT => Ok(read_i32(r)?.to_string().into_bytes()),
        NONE => Ok(Vec::new()),
        TRUE => Ok(b"1".to_vec()),
        FALSE => Ok(b"0".to_vec()),
        other => Err(invalid(format!("unsupported marshal type 0x{other:02x}"))),
    }
}

/// Read the next record, `Ok(None)` at a clean end of stream.
pub fn read_record(r: &mut impl Read) -> io::Result<Option<Record>> {
    let mut first = [0u8; 1];
    if r.read(&mut first)? == 0 {
        return Ok(None);
    }
    if first[0] & !FLAG_REF != DICT {
        return Err(invalid(format!(
            "expected dictionary, found 0x{:02x}",
            first[0]
        )));
    }

    let mut record = Record::new();
    loop {
        let tag = read_u8(r)?;
        if tag == NULL {
            return Ok(Some(record));
        }
        let key = read_value(r, tag)?;
        let value_tag = read_u8(r)?;
        let value = read_value(r, value_tag)?;
        record.insert(String::from_utf8_lossy(&key).into_owned(), value);
    }
}

/// Read every record until end of stream.
pub fn read_all(r: &mut impl Read) -> io::Result<Vec<Record>> {
    let mut records = Vec::new();
    while let Some(record) = read_record(r)? {
        records.push(record);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn write_string(w: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    let len = i32::try_from(bytes.len()).map_err(|_| invalid("string too long to marshal"))?;
    w.write_all(&[STRING])?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(bytes)
}

/// Write one record as a marshalled dictionary of strings.
pub fn write_record(w: &mut impl Write, record: &Record) -> io::Result<()> {
    w.write_all(&[DICT])?;
    for (key, value) in &record.fields {
        write_string(w, key.as_bytes())?;
        write_string(w, value)?;
    }
    w.write_all(&[NULL])
}
