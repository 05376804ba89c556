//! Operand tokenization, normalization and classification.
//!
//! Operand text arrives in many equivalent spellings (`d4`, `D[4]`,
//! `[d[4]]`, `%d4`). Everything is normalized once, here, into the
//! [`Operand`] union; the variant selector and the encoder match on that
//! union and never re-inspect strings.

use crate::error::CoreError;
use crate::numeric;
use std::fmt;

/// TriCore register classes: data, address, extended (64-bit pair) and
/// pointer registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RegClass {
    D,
    A,
    E,
    P,
}

impl RegClass {
    pub fn from_letter(c: char) -> Option<RegClass> {
        match c.to_ascii_lowercase() {
            'd' => Some(RegClass::D),
            'a' => Some(RegClass::A),
            'e' => Some(RegClass::E),
            'p' => Some(RegClass::P),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            RegClass::D => 'd',
            RegClass::A => 'a',
            RegClass::E => 'e',
            RegClass::P => 'p',
        }
    }
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.letter().to_ascii_uppercase())
    }
}

/// The coarse operand classification used for variant matching.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandKind {
    Reg(RegClass),
    Imm,
}

/// One parsed operand.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    /// A plain or memory-indirect register; indirection is a property of
    /// the instruction variant, so `[a2]` and `a2` normalize identically.
    Reg(RegClass, u8),
    /// Post-increment addressing, `[a2+]`.
    PostInc(RegClass, u8),
    /// A numeric literal (`#` immediate prefixes are stripped).
    Imm(i64),
    /// A named label or external symbol.
    Symbol(String),
    /// A numeric local label reference, `3f` (forward) or `3b` (backward).
    Local { name: String, forward: bool },
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::Reg(class, _) | Operand::PostInc(class, _) => OperandKind::Reg(*class),
            _ => OperandKind::Imm,
        }
    }

    pub fn register(&self) -> Option<(RegClass, u8)> {
        match self {
            Operand::Reg(class, num) | Operand::PostInc(class, num) => Some((*class, *num)),
            _ => None,
        }
    }

    pub fn is_register(&self) -> bool {
        self.register().is_some()
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::Reg(class, num) => write!(f, "{}{}", class.letter(), num),
            Operand::PostInc(class, num) => write!(f, "[{}{}+]", class.letter(), num),
            Operand::Imm(value) => write!(f, "{}", value),
            Operand::Symbol(name) => write!(f, "{}", name),
            Operand::Local { name, forward } => {
                write!(f, "{}{}", name, if *forward { 'f' } else { 'b' })
            }
        }
    }
}

/// Splits a comma-separated operand list. Commas inside brackets or quotes
/// belong to the operand they appear in.
pub fn split_operand_list(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut buf = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for c in text.chars() {
        match quote {
            Some(q) => {
                buf.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    buf.push(c);
                }
                '[' => {
                    depth += 1;
                    buf.push(c);
                }
                ']' => {
                    depth = depth.saturating_sub(1);
                    buf.push(c);
                }
                ',' if depth == 0 => {
                    if !buf.trim().is_empty() {
                        parts.push(buf.trim().to_owned());
                    }
                    buf.clear();
                }
                _ => buf.push(c),
            },
        }
    }
    if !buf.trim().is_empty() {
        parts.push(buf.trim().to_owned());
    }
    parts
}

fn is_register_token(text: &str) -> Option<(RegClass, u8)> {
    let mut chars = text.chars();
    let class = chars.next().and_then(RegClass::from_letter)?;
    let rest = chars.as_str();
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok().map(|num| (class, num))
}

/// Strips matched outer brackets repeatedly and canonicalizes the
/// `X[n]` register spelling to `Xn`. A leading `%` (GCC register prefix)
/// is dropped.
fn canonicalize(token: &str) -> String {
    let mut text = token.trim();
    while text.starts_with('[') && text.ends_with(']') && text.len() >= 2 {
        text = text[1..text.len() - 1].trim();
    }
    let text = text.strip_prefix('%').unwrap_or(text);

    // X[n] -> Xn
    let mut chars = text.chars();
    if let Some(first) = chars.next() {
        if RegClass::from_letter(first).is_some() {
            let rest = chars.as_str();
            if rest.starts_with('[') && rest.ends_with(']') {
                let inner = &rest[1..rest.len() - 1];
                if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                    return format!("{}{}", first, inner);
                }
            }
        }
    }
    text.to_owned()
}

/// Detects the post-increment form `[reg+]` (with optional `%`), returning
/// the canonical register if it matches.
fn post_increment(token: &str) -> Option<(RegClass, u8)> {
    let inner = token.strip_prefix('[')?.strip_suffix(']')?.trim();
    let inner = inner.strip_suffix('+')?;
    let inner = inner.strip_prefix('%').unwrap_or(inner);
    is_register_token(inner)
}

/// Normalizes one raw operand token into one or more canonical tokens.
///
/// - `[reg]offset` splits into the register and the offset.
/// - `[reg]@los(0xHHHHHHHH)` rewrites to the register and the low 16 bits
///   of the constant (external toolchain syntax).
/// - `[reg+]` is preserved as a post-increment token.
/// - Everything else has its outer brackets stripped and registers
///   canonicalized.
pub fn normalize_token(token: &str) -> Vec<String> {
    let token = token.trim();

    if let Some((class, num)) = post_increment(token) {
        return vec![format!("[{}{}+]", class.letter(), num)];
    }

    if let Some(open) = token.strip_prefix('[') {
        if let Some(close) = open.find(']') {
            let reg_part = &open[..close];
            let rest = open[close + 1..].trim();

            // [reg]@los(0x....) -> reg, low 16 bits
            if let Some(arg) = rest
                .strip_prefix("@los(")
                .and_then(|r| r.strip_suffix(')'))
            {
                if let Ok(value) = numeric::parse_numeric(arg) {
                    let mut out = normalize_token(reg_part);
                    out.push(format!("0x{:04X}", (value as u64) & 0xFFFF));
                    return out;
                }
            }

            // [reg]offset -> reg, offset
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                let mut out = normalize_token(reg_part);
                out.push(rest.to_owned());
                return out;
            }
        }
    }

    vec![canonicalize(token)]
}

/// Parses a single normalized token into an [`Operand`].
pub fn parse_operand(token: &str) -> Result<Operand, CoreError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(CoreError::InvalidOperand {
            text: token.to_owned(),
        });
    }

    if let Some((class, num)) = post_increment(token) {
        return Ok(Operand::PostInc(class, num));
    }

    if let Some((class, num)) = is_register_token(token) {
        return Ok(Operand::Reg(class, num));
    }

    let literal = token.strip_prefix('#').unwrap_or(token);
    if let Ok(value) = numeric::parse_numeric(literal) {
        return Ok(Operand::Imm(value));
    }

    // Numeric local label references: 3f / 3b.
    if token.len() >= 2 {
        let (digits, dir) = token.split_at(token.len() - 1);
        if digits.chars().all(|c| c.is_ascii_digit()) && (dir == "f" || dir == "b") {
            return Ok(Operand::Local {
                name: digits.to_owned(),
                forward: dir == "f",
            });
        }
    }

    let mut chars = token.chars();
    let first = chars.next().unwrap();
    if (first.is_ascii_alphabetic() || first == '_' || first == '.')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
    {
        return Ok(Operand::Symbol(token.to_owned()));
    }

    Err(CoreError::InvalidOperand {
        text: token.to_owned(),
    })
}

/// Normalizes and parses a list of raw operand tokens. Compound tokens may
/// expand into two operands, so the output can be longer than the input.
pub fn parse_list<S: AsRef<str>>(tokens: &[S]) -> Result<Vec<Operand>, CoreError> {
    let mut operands = Vec::with_capacity(tokens.len());
    for token in tokens {
        for normalized in normalize_token(token.as_ref()) {
            operands.push(parse_operand(&normalized)?);
        }
    }
    Ok(operands)
}

/// Splits and parses a full operand list string.
pub fn parse_operand_str(text: &str) -> Result<Vec<Operand>, CoreError> {
    parse_list(&split_operand_list(text))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_normalization_is_idempotent() {
        for form in &["d4", "D4", "d[4]", "D[4]", "[d4]", "[D4]", "[d[4]]", "[D[4]]", "%d4"] {
            let ops = parse_list(&[*form]).unwrap();
            assert_eq!(ops, vec![Operand::Reg(RegClass::D, 4)], "form {}", form);
        }
    }

    #[test]
    fn splits_on_commas_outside_brackets() {
        let parts = split_operand_list("[A[15]], 4, D0");
        assert_eq!(parts, vec!["[A[15]]", "4", "D0"]);
    }

    #[test]
    fn quoted_commas_stay_inside_the_operand() {
        let parts = split_operand_list("\"Hello, World!\", 0");
        assert_eq!(parts, vec!["\"Hello, World!\"", "0"]);
    }

    #[test]
    fn compound_offset_splits_into_two_operands() {
        let ops = parse_operand_str("[a15]14").unwrap();
        assert_eq!(
            ops,
            vec![Operand::Reg(RegClass::A, 15), Operand::Imm(14)]
        );
    }

    #[test]
    fn post_increment_is_preserved() {
        let ops = parse_operand_str("[a2+], d1").unwrap();
        assert_eq!(
            ops,
            vec![Operand::PostInc(RegClass::A, 2), Operand::Reg(RegClass::D, 1)]
        );
        let gcc = parse_operand_str("[%a2+]").unwrap();
        assert_eq!(gcc, vec![Operand::PostInc(RegClass::A, 2)]);
    }

    #[test]
    fn los_rewrites_to_low_halfword() {
        let ops = parse_operand_str("[a12]@los(0x80001234)").unwrap();
        assert_eq!(
            ops,
            vec![Operand::Reg(RegClass::A, 12), Operand::Imm(0x1234)]
        );
    }

    #[test]
    fn immediates_and_symbols() {
        assert_eq!(parse_operand("#5").unwrap(), Operand::Imm(5));
        assert_eq!(parse_operand("0x10").unwrap(), Operand::Imm(16));
        assert_eq!(
            parse_operand("loop_start").unwrap(),
            Operand::Symbol("loop_start".to_owned())
        );
        assert_eq!(
            parse_operand(".L3").unwrap(),
            Operand::Symbol(".L3".to_owned())
        );
    }

    #[test]
    fn local_references() {
        assert_eq!(
            parse_operand("3f").unwrap(),
            Operand::Local {
                name: "3".to_owned(),
                forward: true
            }
        );
        assert_eq!(
            parse_operand("2b").unwrap(),
            Operand::Local {
                name: "2".to_owned(),
                forward: false
            }
        );
        // Valid binary literals win over the local-label rule.
        assert_eq!(parse_operand("10b").unwrap(), Operand::Imm(0b10));
    }

    #[test]
    fn names_starting_with_register_letters_are_symbols() {
        assert_eq!(
            parse_operand("data_start").unwrap(),
            Operand::Symbol("data_start".to_owned())
        );
        assert_eq!(
            parse_operand("after").unwrap(),
            Operand::Symbol("after".to_owned())
        );
    }
}
