//! Parsing of the `manuf` reference format and of queried addresses.
//!
//! ```text
//! # comment
//! 00:00:0C	Cisco	Cisco Systems, Inc
//! 00:1B:C5:00:00:00/36	Converging	Converging Systems Inc.
//! AC-DE-48 Private
//! ```
//!
//! A prefix token is hex digits (optionally separated by `:`, `-` or `.`)
//! with an optional `/BITS` suffix. Without a suffix every digit counts.

/// Width of the hardware address space in bits.
pub const ADDRESS_BITS: u8 = 48;

const MAX_DIGITS: usize = (ADDRESS_BITS / 4) as usize;

/// Why a reference line was skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LineError {
    #[error("missing organization name")]
    MissingName,
    #[error("invalid prefix {0:?}")]
    InvalidPrefix(String),
}

/// The significant high-order bits of an entry, right-aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub bits: u8,
    pub value: u64,
}

/// One data line of the reference file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    pub token: &'a str,
    pub prefix: Prefix,
    pub short_name: &'a str,
    pub annotation: &'a str,
}

/// Parse one line. Blank and comment lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Record<'_>>, LineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (token, short_name, annotation) = split_fields(line);
    let short_name = short_name
        .filter(|name| !name.is_empty())
        .ok_or(LineError::MissingName)?;
    let prefix = parse_prefix(token)?;

    Ok(Some(Record {
        token,
        prefix,
        short_name,
        annotation,
    }))
}

/// Tab-separated if the line has any tab, whitespace-separated otherwise.
/// The annotation is everything after the second field.
fn split_fields(line: &str) -> (&str, Option<&str>, &str) {
    if line.contains('\t') {
        let mut fields = line.splitn(3, '\t');
        let token = fields.next().unwrap_or_default().trim();
        let name = fields.next().map(str::trim);
        let annotation = fields.next().map(str::trim).unwrap_or_default();
        (token, name, annotation)
    } else {
        let (token, rest) = split_word(line);
        let (name, rest) = split_word(rest);
        (token, Some(name), rest.trim())
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(end) => (&s[..end], &s[end..]),
        None => (s, ""),
    }
}

fn strip_separators(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect()
}

/// Parse `HEX[/BITS]` into the prefix it claims.
///
/// Extra low-order digit bits beyond `BITS` are shifted away; if the digits
/// carry fewer bits than `BITS` they are treated as the high bits and padded
/// with zeros.
pub fn parse_prefix(token: &str) -> Result<Prefix, LineError> {
    let invalid = || LineError::InvalidPrefix(token.to_string());

    let (hex, bits) = match token.split_once('/') {
        Some((hex, bits)) => (hex, Some(bits.parse::<u8>().map_err(|_| invalid())?)),
        None => (token, None),
    };

    let digits = strip_separators(hex);
    if digits.is_empty()
        || digits.len() > MAX_DIGITS
        || !digits.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(invalid());
    }

    let width = (digits.len() * 4) as u8;
    let bits = bits.unwrap_or(width);
    if bits == 0 || bits > ADDRESS_BITS {
        return Err(invalid());
    }

    let raw = u64::from_str_radix(&digits, 16).map_err(|_| invalid())?;
    let value = if width >= bits {
        raw >> (width - bits)
    } else {
        raw << (bits - width)
    };

    Ok(Prefix { bits, value })
}

/// A queried hardware address, left-aligned in the 48-bit space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    value: u64,
    /// How many leading bits the caller actually supplied.
    width: u8,
}

impl Address {
    /// Accepts 12, 10, 8 or 6 hex digits (any case) once `:`, `-`, `.` and
    /// whitespace are removed. Anything else is `None`.
    pub fn parse(input: &str) -> Option<Self> {
        let digits: String = input
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.') && !c.is_whitespace())
            .collect();
        if !matches!(digits.len(), 6 | 8 | 10 | 12)
            || !digits.chars().all(|c| c.is_ascii_hexdigit())
        {
            return None;
        }

        let width = (digits.len() * 4) as u8;
        let raw = u64::from_str_radix(&digits, 16).ok()?;
        Some(Self {
            value: raw << (ADDRESS_BITS - width),
            width,
        })
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    /// The top `bits` bits, right-aligned for comparison with a [`Prefix`].
    pub fn top_bits(&self, bits: u8) -> u64 {
        self.value >> (ADDRESS_BITS - bits)
    }
}
