//! Logging helpers with sensitive data redaction.
//!
//! Key material, user identifiers and post contents must never reach log
//! output. These wrappers make the safe form the convenient one at
//! `tracing` call sites.

use std::fmt;

/// Redact a byte slice, showing only its length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a hex identifier, showing only first and last 4 characters.
pub struct RedactedHex<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "[REDACTED HEX]")
        }
    }
}

impl<'a> fmt::Debug for RedactedHex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_bytes() {
        let bytes = RedactedBytes(&[1, 2, 3, 4]);
        assert_eq!(format!("{}", bytes), "[4 bytes]");
    }

    #[test]
    fn test_redacted_hex() {
        let long = RedactedHex("a1b2c3d4e5f6a7b8");
        let shown = format!("{}", long);
        assert!(shown.starts_with("a1b2"));
        assert!(shown.ends_with("a7b8"));
        assert!(shown.contains("..."));

        let short = RedactedHex("a1b2");
        assert_eq!(format!("{}", short), "[REDACTED HEX]");
    }
}
