//! NASM-compatible numeric constant parser.
//!
//! Recognized forms, in order of precedence:
//!
//! | Form | Base |
//! |---|---|
//! | `0x…`, `0h…`, `…h`, `$0…` | 16 |
//! | `0b…`, `0y…`, `…b`, `…y` | 2 |
//! | `0o…`, `0q…`, `…q`, `…o` | 8 |
//! | `0d…`, `…d`, plain digits | 10 |
//!
//! Underscores are allowed anywhere inside the digits. Leading zeros do not
//! make a constant octal. The trailing-`h` and `$` hexadecimal forms require
//! a leading `0` when the first digit is `a`-`f`.

use crate::error::CoreError;

fn digits(text: &str, original: &str, radix: u32) -> Result<i64, CoreError> {
    if text.is_empty() {
        return Err(CoreError::InvalidNumber {
            text: original.to_owned(),
        });
    }
    // Parse through u64 so full-width constants like 0xFFFFFFFFFFFFFFFF wrap
    // to their two's-complement value instead of overflowing.
    u64::from_str_radix(text, radix)
        .map(|v| v as i64)
        .map_err(|_| CoreError::InvalidNumber {
            text: original.to_owned(),
        })
}

fn starts_with_prefix(text: &str, marker: char) -> bool {
    let mut chars = text.chars();
    text.len() > 2
        && chars.next() == Some('0')
        && chars
            .next()
            .map(|c| c.eq_ignore_ascii_case(&marker))
            .unwrap_or(false)
}

fn ends_with(text: &str, marker: char) -> bool {
    text.chars()
        .last()
        .map(|c| c.eq_ignore_ascii_case(&marker))
        .unwrap_or(false)
}

/// Parses an unsigned numeric constant (no sign prefix).
pub fn parse_unsigned(original: &str) -> Result<i64, CoreError> {
    let text: String = original.trim().chars().filter(|c| *c != '_').collect();
    let text = text.as_str();

    if text.is_empty() {
        return Err(CoreError::InvalidNumber {
            text: original.to_owned(),
        });
    }

    // Hexadecimal.
    if text.starts_with("0x") || text.starts_with("0X") {
        return digits(&text[2..], original, 16);
    }
    if starts_with_prefix(text, 'h') {
        return digits(&text[2..], original, 16);
    }
    if ends_with(text, 'h') {
        let hex = &text[..text.len() - 1];
        if let Some(first) = hex.chars().next() {
            if first.is_ascii_alphabetic() {
                // NASM requires the leading 0 so the constant cannot be
                // mistaken for an identifier.
                return Err(CoreError::InvalidNumber {
                    text: original.to_owned(),
                });
            }
        }
        return digits(hex, original, 16);
    }
    if let Some(hex) = text.strip_prefix('$') {
        match hex.chars().next() {
            Some(first) if !first.is_ascii_digit() => {
                return Err(CoreError::InvalidNumber {
                    text: original.to_owned(),
                })
            }
            None => {
                return Err(CoreError::InvalidNumber {
                    text: original.to_owned(),
                })
            }
            _ => return digits(hex, original, 16),
        }
    }

    // Binary.
    if text.starts_with("0b") || text.starts_with("0B") {
        return digits(&text[2..], original, 2);
    }
    if starts_with_prefix(text, 'y') {
        return digits(&text[2..], original, 2);
    }
    if ends_with(text, 'b') {
        return digits(&text[..text.len() - 1], original, 2);
    }
    if ends_with(text, 'y') {
        return digits(&text[..text.len() - 1], original, 2);
    }

    // Octal.
    if text.starts_with("0o") || text.starts_with("0O") {
        return digits(&text[2..], original, 8);
    }
    if starts_with_prefix(text, 'q') {
        return digits(&text[2..], original, 8);
    }
    if ends_with(text, 'q') {
        return digits(&text[..text.len() - 1], original, 8);
    }
    if ends_with(text, 'o') {
        return digits(&text[..text.len() - 1], original, 8);
    }

    // Explicit decimal.
    if starts_with_prefix(text, 'd') {
        return digits(&text[2..], original, 10);
    }
    if ends_with(text, 'd') {
        return digits(&text[..text.len() - 1], original, 10);
    }

    // Plain decimal; leading zeros are not octal.
    digits(text, original, 10)
}

/// Parses a numeric constant with an optional single `+`/`-` sign prefix.
pub fn parse_numeric(text: &str) -> Result<i64, CoreError> {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix('-') {
        parse_unsigned(rest).map(i64::wrapping_neg)
    } else if let Some(rest) = trimmed.strip_prefix('+') {
        parse_unsigned(rest)
    } else {
        parse_unsigned(trimmed)
    }
}

#[cfg(test)]
mod test {
    use super::parse_numeric;

    fn ok(text: &str) -> i64 {
        parse_numeric(text).unwrap()
    }

    #[test]
    fn decimal_forms() {
        assert_eq!(ok("200"), 200);
        assert_eq!(ok("0200"), 200);
        assert_eq!(ok("0200d"), 200);
        assert_eq!(ok("0d200"), 200);
        assert_eq!(ok("-42"), -42);
        assert_eq!(ok("+100"), 100);
        assert_eq!(ok("1_000_000"), 1_000_000);
    }

    #[test]
    fn hexadecimal_forms() {
        assert_eq!(ok("0xc8"), 0xc8);
        assert_eq!(ok("0XC8"), 0xc8);
        assert_eq!(ok("0hc8"), 0xc8);
        assert_eq!(ok("0c8h"), 0xc8);
        assert_eq!(ok("$0c8"), 0xc8);
        assert_eq!(ok("0abh"), 0xab);
        assert_eq!(ok("0FFh"), 0xff);
    }

    #[test]
    fn octal_forms() {
        assert_eq!(ok("310q"), 0o310);
        assert_eq!(ok("310o"), 0o310);
        assert_eq!(ok("0o310"), 0o310);
        assert_eq!(ok("0q310"), 0o310);
        assert_eq!(ok("0O777"), 0o777);
    }

    #[test]
    fn binary_forms() {
        assert_eq!(ok("11001000b"), 0b11001000);
        assert_eq!(ok("1100_1000b"), 0b11001000);
        assert_eq!(ok("1100_1000y"), 0b11001000);
        assert_eq!(ok("0b1100_1000"), 0b11001000);
        assert_eq!(ok("0y1100_1000"), 0b11001000);
        assert_eq!(ok("0B11110000"), 0b11110000);
    }

    #[test]
    fn rejects_malformed_literals() {
        assert!(parse_numeric("").is_err());
        assert!(parse_numeric("0xg1").is_err());
        // Suffix hex starting with a-f needs the leading zero.
        assert!(parse_numeric("abh").is_err());
        assert!(parse_numeric("$c8").is_err());
        assert!(parse_numeric("12ab").is_err());
        assert!(parse_numeric("$").is_err());
    }

    #[test]
    fn leading_zero_is_not_octal() {
        assert_eq!(ok("0777"), 777);
    }

    #[test]
    fn round_trips_representative_values() {
        for &n in &[0i64, 1, 2, 127, 128, 255, 4096, i32::MAX as i64, -1, -128, i32::MIN as i64] {
            assert_eq!(ok(&format!("{}", n)), n);
            let magnitude = (n as i128).unsigned_abs() as u64;
            let sign = if n < 0 { "-" } else { "" };
            assert_eq!(ok(&format!("{}0x{:x}", sign, magnitude)), n);
            assert_eq!(ok(&format!("{}{:o}q", sign, magnitude)), n);
            assert_eq!(ok(&format!("{}{:b}b", sign, magnitude)), n);
            assert_eq!(ok(&format!("{}0d{}", sign, magnitude)), n);
        }
    }
}
