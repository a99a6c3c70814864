use core::fmt;

use super::net::error::Error;

/// Number of hex digits shown by [`HexDisplayExt::short`].
const SHORT_DIGITS: usize = 5;

pub struct HexSlice<'a> {
    bytes: &'a [u8],
    short: bool,
}

impl<'a> HexSlice<'a> {
    fn new<T>(data: &'a T, short: bool) -> HexSlice<'a>
    where
        T: ?Sized + AsRef<[u8]> + 'a,
    {
        HexSlice {
            bytes: data.as_ref(),
            short,
        }
    }
}

impl fmt::Display for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.short {
            // each byte is two digits, so this always covers SHORT_DIGITS
            let bytes = &self.bytes[..self.bytes.len().min(SHORT_DIGITS / 2 + 1)];
            let digits = bytes
                .iter()
                .map(|byte| format!("{:02x}", byte))
                .collect::<String>();
            write!(f, "{}...", &digits[..digits.len().min(SHORT_DIGITS)])
        } else {
            for byte in self.bytes {
                write!(f, "{:02x}", byte)?;
            }
            Ok(())
        }
    }
}

impl fmt::Debug for HexSlice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub trait HexDisplayExt {
    /// Full lowercase hex.
    fn hex(&self) -> HexSlice<'_>;
    /// Abbreviated hex for log lines, e.g. `3fa0c...`.
    fn short(&self) -> HexSlice<'_>;
}

impl<T> HexDisplayExt for T
where
    T: ?Sized + AsRef<[u8]>,
{
    fn hex(&self) -> HexSlice<'_> {
        HexSlice::new(self, false)
    }

    fn short(&self) -> HexSlice<'_> {
        HexSlice::new(self, true)
    }
}

/// Parses a 64 digit hex string into a 32 byte key.
pub fn parse_key(s: &str) -> Result<[u8; 32], Error> {
    let s = s.trim();
    if s.len() != 64 || !s.is_ascii() {
        return Err(Error::InvalidInput(format!(
            "expected 64 hex digits, got {:?}",
            s
        )));
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| {
            Error::InvalidInput(format!("invalid hex digit in {:?}", s))
        })?;
    }
    Ok(key)
}
