//! NASM-style data directives: `DB`-family definitions, `RES*`
//! reservations, `INCBIN`, `EQU` and `TIMES`.
//!
//! The handler is used twice: the assembler sizes and encodes directives
//! during its passes, and the linker re-synthesizes their bytes at emit
//! time once every label and constant is final.

use std::collections::HashMap;
use std::fs::File;
use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::{error, fmt, io};
use tricore::operand::split_operand_list;
use tricore::{numeric, LabelMap};
use util::Endianness;

const DATA_SIZES: [(&str, usize); 8] = [
    ("DB", 1),
    ("DW", 2),
    ("DD", 4),
    ("DQ", 8),
    ("DT", 10),
    ("DO", 16),
    ("DY", 32),
    ("DZ", 64),
];

const RESERVE_SIZES: [(&str, usize); 8] = [
    ("RESB", 1),
    ("RESW", 2),
    ("RESD", 4),
    ("RESQ", 8),
    ("REST", 10),
    ("RESO", 16),
    ("RESY", 32),
    ("RESZ", 64),
];

pub fn data_size(mnemonic: &str) -> Option<usize> {
    let upper = mnemonic.to_uppercase();
    DATA_SIZES
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, size)| *size)
}

pub fn reserve_size(mnemonic: &str) -> Option<usize> {
    let upper = mnemonic.to_uppercase();
    RESERVE_SIZES
        .iter()
        .find(|(name, _)| *name == upper)
        .map(|(_, size)| *size)
}

/// True for every mnemonic this module handles (`EQU` included, although
/// the line parser usually recognizes it as its own statement).
pub fn is_data_directive(mnemonic: &str) -> bool {
    let upper = mnemonic.to_uppercase();
    data_size(&upper).is_some()
        || reserve_size(&upper).is_some()
        || upper == "INCBIN"
        || upper == "EQU"
        || upper == "TIMES"
}

#[derive(Debug)]
pub enum DirectiveError {
    /// A value does not fit the directive's element width.
    ValueOverflow {
        directive: String,
        value: i64,
        width: usize,
    },
    /// Floats only encode at widths 4 and 8.
    FloatWidth { directive: String, width: usize },
    FileNotFound(PathBuf),
    Io(io::Error, PathBuf),
    /// Negative or non-integer repeat/reserve count.
    InvalidCount(String),
    InvalidValue(String),
    InvalidEqu(String),
}

impl fmt::Display for DirectiveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DirectiveError::ValueOverflow {
                directive,
                value,
                width,
            } => write!(
                f,
                "Value {} too large for {} (element width {} byte(s))",
                value, directive, width
            ),
            DirectiveError::FloatWidth { directive, width } => write!(
                f,
                "Floating-point values need a 4- or 8-byte element, not {} ({} bytes)",
                directive, width
            ),
            DirectiveError::FileNotFound(path) => {
                write!(f, "INCBIN file not found: \"{}\"", path.display())
            }
            DirectiveError::Io(err, path) => {
                write!(f, "Reading \"{}\" failed: {}", path.display(), err)
            }
            DirectiveError::InvalidCount(text) => {
                write!(f, "Count must be a non-negative integer: '{}'", text)
            }
            DirectiveError::InvalidValue(text) => write!(f, "Invalid data value: '{}'", text),
            DirectiveError::InvalidEqu(text) => write!(f, "Invalid EQU directive: '{}'", text),
        }
    }
}

impl error::Error for DirectiveError {}

/// A parsed data value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

/// Data directive processor. Owns the `EQU` constant table; labels are
/// supplied per call because they evolve while the handler lives.
#[derive(Debug)]
pub struct DataDirectives {
    endianness: Endianness,
    pub constants: HashMap<String, i32>,
    base_dir: Option<PathBuf>,
}

impl DataDirectives {
    pub fn new(endianness: Endianness) -> DataDirectives {
        DataDirectives {
            endianness,
            constants: HashMap::new(),
            base_dir: None,
        }
    }

    /// Base directory for relative `INCBIN` paths (the source file's
    /// directory).
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> DataDirectives {
        self.base_dir = Some(base_dir.into());
        self
    }

    pub fn add_constants<'a, I: IntoIterator<Item = (&'a str, i32)>>(&mut self, constants: I) {
        for (name, value) in constants {
            self.constants.insert(name.to_owned(), value);
        }
    }

    fn parse_float(text: &str) -> Option<f64> {
        let lower = text.to_ascii_lowercase();
        if text.contains('.') || (lower.contains('e') && !lower.contains('h')) {
            text.parse().ok()
        } else {
            None
        }
    }

    /// Parses one value: string, character, float, constant, label or
    /// numeric literal. Identifiers that resolve to nothing yet become 0
    /// so the first pass can size data that references later labels.
    pub fn parse_value(&self, text: &str, labels: &LabelMap) -> Result<Value, DirectiveError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DirectiveError::InvalidValue(text.to_owned()));
        }

        if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
            return Ok(Value::Bytes(text[1..text.len() - 1].as_bytes().to_vec()));
        }
        if text.len() >= 2 && text.starts_with('\'') && text.ends_with('\'') {
            let inner = &text[1..text.len() - 1];
            let mut chars = inner.chars();
            return match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(i64::from(u32::from(c)))),
                _ => Ok(Value::Bytes(inner.as_bytes().to_vec())),
            };
        }

        if let Some(value) = Self::parse_float(text) {
            return Ok(Value::Float(value));
        }

        if let Some(value) = self.constants.get(text) {
            return Ok(Value::Int(i64::from(*value)));
        }
        if let Some(address) = labels.get(text) {
            return Ok(Value::Int(i64::from(*address)));
        }

        if let Ok(value) = numeric::parse_numeric(text) {
            return Ok(Value::Int(value));
        }

        // An identifier that is not yet defined; it will resolve during
        // the linker's emit pass.
        let mut chars = text.chars();
        let first = chars.next().unwrap();
        if (first.is_ascii_alphabetic() || first == '_' || first == '.')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Ok(Value::Int(0));
        }

        Err(DirectiveError::InvalidValue(text.to_owned()))
    }

    /// Parses a comma-separated value list (quote-aware).
    pub fn parse_data_list(
        &self,
        rest: &str,
        labels: &LabelMap,
    ) -> Result<Vec<Value>, DirectiveError> {
        split_operand_list(rest)
            .iter()
            .map(|token| self.parse_value(token, labels))
            .collect()
    }

    /// Encodes a `DB`-family directive's values at its element width.
    pub fn encode(&self, directive: &str, values: &[Value]) -> Result<Vec<u8>, DirectiveError> {
        let width = data_size(directive)
            .ok_or_else(|| DirectiveError::InvalidValue(directive.to_owned()))?;
        let mut bytes = Vec::new();
        for value in values {
            match value {
                // Strings emit their bytes verbatim at any element width.
                Value::Bytes(data) => bytes.extend_from_slice(data),
                Value::Float(value) => match width {
                    4 => {
                        let mut buf = [0u8; 4];
                        self.endianness.write_u32(&mut buf, (*value as f32).to_bits());
                        bytes.extend_from_slice(&buf);
                    }
                    8 => {
                        let mut buf = [0u8; 8];
                        self.endianness.write_u64(&mut buf, value.to_bits());
                        bytes.extend_from_slice(&buf);
                    }
                    _ => {
                        return Err(DirectiveError::FloatWidth {
                            directive: directive.to_uppercase(),
                            width,
                        })
                    }
                },
                Value::Int(value) => {
                    if width < 8 {
                        let bits = width as u32 * 8;
                        let min = -(1i64 << (bits - 1));
                        let max = (1i64 << bits) - 1;
                        if *value < min || *value > max {
                            return Err(DirectiveError::ValueOverflow {
                                directive: directive.to_uppercase(),
                                value: *value,
                                width,
                            });
                        }
                    }
                    bytes.extend_from_slice(&self.endianness.int_bytes(*value, width));
                }
            }
        }
        Ok(bytes)
    }

    fn count_value(&self, text: &str, labels: &LabelMap) -> Result<usize, DirectiveError> {
        match self.parse_value(text, labels)? {
            Value::Int(count) if count >= 0 => Ok(count as usize),
            _ => Err(DirectiveError::InvalidCount(text.trim().to_owned())),
        }
    }

    /// Splits `TIMES` operands into the repeat count and the repeated
    /// directive text.
    fn times_parts<'a>(
        &self,
        rest: &'a str,
        labels: &LabelMap,
    ) -> Result<(usize, &'a str), DirectiveError> {
        let rest = rest.trim();
        let (count_text, repeated) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| DirectiveError::InvalidValue(rest.to_owned()))?;
        let count = self.count_value(count_text, labels)?;
        Ok((count, repeated.trim()))
    }

    fn incbin_args(
        &self,
        rest: &str,
        labels: &LabelMap,
    ) -> Result<(PathBuf, u64, Option<u64>), DirectiveError> {
        let parts = split_operand_list(rest);
        let name = parts
            .first()
            .ok_or_else(|| DirectiveError::InvalidValue(rest.to_owned()))?;
        let name = name.trim_matches(|c| c == '"' || c == '\'');
        let mut path = PathBuf::from(name);
        if let Some(base) = &self.base_dir {
            if path.is_relative() {
                path = base.join(path);
            }
        }
        let start = match parts.get(1) {
            Some(text) => self.count_value(text, labels)? as u64,
            None => 0,
        };
        let length = match parts.get(2) {
            Some(text) => Some(self.count_value(text, labels)? as u64),
            None => None,
        };
        Ok((path, start, length))
    }

    fn incbin_size(&self, rest: &str, labels: &LabelMap) -> Result<usize, DirectiveError> {
        let (path, start, length) = self.incbin_args(rest, labels)?;
        let metadata = file_metadata(&path)?;
        let available = metadata.saturating_sub(start);
        Ok(length.map(|l| l.min(available)).unwrap_or(available) as usize)
    }

    fn incbin_bytes(&self, rest: &str, labels: &LabelMap) -> Result<Vec<u8>, DirectiveError> {
        let (path, start, length) = self.incbin_args(rest, labels)?;
        let mut file = open_existing(&path)?;
        file.seek(SeekFrom::Start(start))
            .map_err(|err| DirectiveError::Io(err, path.clone()))?;
        let mut data = Vec::new();
        match length {
            Some(length) => {
                let mut limited = file.take(length);
                limited
                    .read_to_end(&mut data)
                    .map_err(|err| DirectiveError::Io(err, path.clone()))?;
            }
            None => {
                file.read_to_end(&mut data)
                    .map_err(|err| DirectiveError::Io(err, path.clone()))?;
            }
        }
        Ok(data)
    }

    /// Defines an `EQU` constant; the value may reference earlier
    /// constants and labels.
    pub fn define_constant(
        &mut self,
        name: &str,
        value_text: &str,
        labels: &LabelMap,
    ) -> Result<i32, DirectiveError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DirectiveError::InvalidEqu(value_text.to_owned()));
        }
        match self.parse_value(value_text, labels)? {
            Value::Int(value) => {
                let value = value as i32;
                self.constants.insert(name.to_owned(), value);
                Ok(value)
            }
            _ => Err(DirectiveError::InvalidEqu(format!(
                "{} EQU {}",
                name, value_text
            ))),
        }
    }

    /// Size in bytes the directive will occupy, without emitting data.
    pub fn size_of(
        &self,
        mnemonic: &str,
        rest: &str,
        labels: &LabelMap,
    ) -> Result<usize, DirectiveError> {
        let upper = mnemonic.to_uppercase();

        if upper == "TIMES" {
            let (count, repeated) = self.times_parts(rest, labels)?;
            let (inner, inner_rest) = split_mnemonic(repeated);
            return Ok(count * self.size_of(inner, inner_rest, labels)?);
        }
        if let Some(width) = reserve_size(&upper) {
            return Ok(self.count_value(rest, labels)? * width);
        }
        if let Some(width) = data_size(&upper) {
            let values = self.parse_data_list(rest, labels)?;
            return Ok(values
                .iter()
                .map(|value| match value {
                    Value::Bytes(data) => data.len(),
                    _ => width,
                })
                .sum());
        }
        if upper == "INCBIN" {
            return self.incbin_size(rest, labels);
        }
        if upper == "EQU" {
            return Ok(0);
        }
        Err(DirectiveError::InvalidValue(mnemonic.to_owned()))
    }

    /// Produces the directive's bytes. Reservations yield zero bytes of
    /// the reserved length.
    pub fn emit(
        &self,
        mnemonic: &str,
        rest: &str,
        labels: &LabelMap,
    ) -> Result<Vec<u8>, DirectiveError> {
        let upper = mnemonic.to_uppercase();

        if upper == "TIMES" {
            let (count, repeated) = self.times_parts(rest, labels)?;
            let (inner, inner_rest) = split_mnemonic(repeated);
            let unit = self.emit(inner, inner_rest, labels)?;
            let mut bytes = Vec::with_capacity(unit.len() * count);
            for _ in 0..count {
                bytes.extend_from_slice(&unit);
            }
            return Ok(bytes);
        }
        if let Some(width) = reserve_size(&upper) {
            return Ok(vec![0u8; self.count_value(rest, labels)? * width]);
        }
        if data_size(&upper).is_some() {
            let values = self.parse_data_list(rest, labels)?;
            return self.encode(&upper, &values);
        }
        if upper == "INCBIN" {
            return self.incbin_bytes(rest, labels);
        }
        if upper == "EQU" {
            return Ok(Vec::new());
        }
        Err(DirectiveError::InvalidValue(mnemonic.to_owned()))
    }
}

fn split_mnemonic(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((mnemonic, rest)) => (mnemonic, rest.trim()),
        None => (text, ""),
    }
}

fn file_metadata(path: &Path) -> Result<u64, DirectiveError> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(metadata.len()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(DirectiveError::FileNotFound(path.to_owned()))
        }
        Err(err) => Err(DirectiveError::Io(err, path.to_owned())),
    }
}

fn open_existing(path: &Path) -> Result<File, DirectiveError> {
    match File::open(path) {
        Ok(file) => Ok(file),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(DirectiveError::FileNotFound(path.to_owned()))
        }
        Err(err) => Err(DirectiveError::Io(err, path.to_owned())),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use matches::assert_matches;

    fn handler() -> DataDirectives {
        DataDirectives::new(Endianness::Little)
    }

    fn no_labels() -> LabelMap {
        LabelMap::new()
    }

    #[test]
    fn db_mixes_integers_characters_and_strings() {
        let h = handler();
        let labels = no_labels();
        let bytes = h.emit("DB", "1, 'A', \"Hi\", 0xFF", &labels).unwrap();
        assert_eq!(bytes, vec![1, b'A', b'H', b'i', 0xFF]);
        assert_eq!(h.size_of("DB", "1, 'A', \"Hi\", 0xFF", &labels).unwrap(), 5);
    }

    #[test]
    fn dw_uses_element_width_and_endianness() {
        let labels = no_labels();
        let little = handler().emit("DW", "0x1234", &labels).unwrap();
        assert_eq!(little, vec![0x34, 0x12]);
        let big = DataDirectives::new(Endianness::Big)
            .emit("DW", "0x1234", &labels)
            .unwrap();
        assert_eq!(big, vec![0x12, 0x34]);
    }

    #[test]
    fn negative_values_are_twos_complement() {
        let labels = no_labels();
        let bytes = handler().emit("DW", "-1234", &labels).unwrap();
        assert_eq!(bytes, vec![0x2E, 0xFB]);
    }

    #[test]
    fn value_overflow_is_reported() {
        let labels = no_labels();
        assert_matches!(
            handler().emit("DB", "256", &labels),
            Err(DirectiveError::ValueOverflow { width: 1, .. })
        );
        // -128 still fits a byte on the signed side.
        assert_eq!(handler().emit("DB", "-128", &labels).unwrap(), vec![0x80]);
    }

    #[test]
    fn floats_encode_only_at_widths_4_and_8() {
        let labels = no_labels();
        let h = handler();
        let bytes = h.emit("DD", "1.5", &labels).unwrap();
        assert_eq!(bytes, 1.5f32.to_bits().to_le_bytes().to_vec());
        let bytes = h.emit("DQ", "1.5e-10", &labels).unwrap();
        assert_eq!(bytes, 1.5e-10f64.to_bits().to_le_bytes().to_vec());
        assert_matches!(
            h.emit("DW", "3.14", &labels),
            Err(DirectiveError::FloatWidth { width: 2, .. })
        );
    }

    #[test]
    fn wide_elements_sign_extend() {
        let labels = no_labels();
        let bytes = handler().emit("DT", "-2", &labels).unwrap();
        assert_eq!(bytes.len(), 10);
        assert_eq!(bytes[0], 0xFE);
        assert!(bytes[1..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn reservations_emit_zeroes() {
        let labels = no_labels();
        let h = handler();
        assert_eq!(h.size_of("RESW", "3", &labels).unwrap(), 6);
        assert_eq!(h.emit("RESB", "4", &labels).unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn times_multiplies_the_inner_directive() {
        let labels = no_labels();
        let h = handler();
        assert_eq!(h.size_of("TIMES", "4 DB 0xAA", &labels).unwrap(), 4);
        assert_eq!(
            h.emit("TIMES", "3 DW 0x0102", &labels).unwrap(),
            vec![0x02, 0x01, 0x02, 0x01, 0x02, 0x01]
        );
    }

    #[test]
    fn negative_times_count_is_invalid() {
        let labels = no_labels();
        assert_matches!(
            handler().size_of("TIMES", "-1 DB 0", &labels),
            Err(DirectiveError::InvalidCount(_))
        );
    }

    #[test]
    fn equ_constants_chain() {
        let labels = no_labels();
        let mut h = handler();
        h.define_constant("BASE", "0x100", &labels).unwrap();
        assert_eq!(h.define_constant("TOP", "BASE", &labels).unwrap(), 0x100);
        let bytes = h.emit("DW", "TOP", &labels).unwrap();
        assert_eq!(bytes, vec![0x00, 0x01]);
    }

    #[test]
    fn labels_resolve_in_data_values() {
        let mut labels = no_labels();
        labels.insert("buffer".to_owned(), 0x8000_0010);
        let bytes = handler().emit("DD", "buffer", &labels).unwrap();
        assert_eq!(bytes, vec![0x10, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn unknown_identifiers_size_as_zero_placeholders() {
        let labels = no_labels();
        // Referencing a label defined later must not fail the sizing pass.
        assert_eq!(handler().size_of("DD", "later", &labels).unwrap(), 4);
    }

    #[test]
    fn incbin_missing_file_is_file_not_found() {
        let labels = no_labels();
        assert_matches!(
            handler().size_of("INCBIN", "\"no_such_file.bin\"", &labels),
            Err(DirectiveError::FileNotFound(_))
        );
    }

    #[test]
    fn incbin_reads_slices() {
        use std::io::Write;
        let dir = std::env::temp_dir();
        let path = dir.join("tasm_incbin_test.bin");
        let mut file = File::create(&path).unwrap();
        file.write_all(&[1, 2, 3, 4, 5, 6]).unwrap();
        drop(file);

        let labels = no_labels();
        let h = DataDirectives::new(Endianness::Little).with_base_dir(&dir);
        let rest = "\"tasm_incbin_test.bin\", 2, 3";
        assert_eq!(h.size_of("INCBIN", rest, &labels).unwrap(), 3);
        assert_eq!(h.emit("INCBIN", rest, &labels).unwrap(), vec![3, 4, 5]);

        std::fs::remove_file(&path).ok();
    }
}
