//! Instruction table loading and pre-compilation.
//!
//! The table is an external file (JSON or CSV) with one row per instruction
//! variant. Rows are grouped by uppercase mnemonic and each syntax pattern
//! is digested once, at load time, into a [`RowSpec`] so that variant
//! lookup never re-parses syntax strings.

use crate::operand::RegClass;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::{error, fmt};
use tracing::{debug, info, warn};

/// Mnemonics whose `off` slots take word offsets even without an explicit
/// `/4` modifier in the syntax.
const WORD_ALIGNED_MNEMONICS: [&str; 4] = ["LD.W", "ST.W", "LD.A", "LEA"];

/// Scaling applied to an immediate slot before range checking and encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scale {
    None,
    Half,
    Word,
}

impl Scale {
    pub fn apply(self, value: i64) -> i64 {
        match self {
            Scale::None => value,
            Scale::Half => value / 2,
            Scale::Word => value / 4,
        }
    }
}

/// One source operand slot of a syntax pattern.
#[derive(Clone, Debug, PartialEq)]
pub enum SlotSpec {
    /// A register slot; `num` is set when the syntax names a fixed
    /// register (`D[15]`) rather than a placeholder (`D[a]`).
    Reg { class: RegClass, num: Option<u8> },
    /// An immediate/offset/displacement slot.
    Imm {
        scale: Scale,
        /// Width taken from the slot name (`off10` -> 10) when present.
        named_width: Option<u32>,
    },
}

/// Describes a source operand whose bits are scattered over several
/// destination bit-fields. `windows` are `(hi, lo)` source-bit ranges in
/// the order they appear in the syntax's brace block.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitSpec {
    pub slot: usize,
    pub windows: Vec<(u32, u32)>,
}

impl SplitSpec {
    pub fn total_width(&self) -> u32 {
        self.windows.iter().map(|(hi, lo)| hi - lo + 1).sum()
    }
}

/// The pre-compiled shape of one table row's syntax.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowSpec {
    pub slots: Vec<SlotSpec>,
    pub split: Option<SplitSpec>,
}

impl Default for Scale {
    fn default() -> Scale {
        Scale::None
    }
}

/// One instruction variant as loaded from the external table.
#[derive(Clone, Debug, PartialEq)]
pub struct InstructionDef {
    pub opcode: u32,
    /// Instruction width in bits, 16 or 32.
    pub opcode_size: u32,
    pub mnemonic: String,
    pub long_name: String,
    pub syntax: String,
    /// Number of destination bit-field slots (a split operand occupies
    /// several of them).
    pub operand_count: usize,
    /// `(position, length)` of each destination slot in the instruction
    /// word. Length 0 marks an implicit slot (fixed register).
    pub operands: [(u32, u32); 5],
    pub spec: RowSpec,
}

impl InstructionDef {
    pub fn size_bytes(&self) -> u32 {
        self.opcode_size / 8
    }

    /// Destination slots consumed by source slot `slot`.
    fn dest_consumed(&self, slot: usize) -> usize {
        match &self.spec.split {
            Some(split) if split.slot == slot => split.windows.len(),
            _ => 1,
        }
    }

    /// Index of the first destination slot for source slot `slot`.
    pub fn dest_index(&self, slot: usize) -> usize {
        (0..slot).map(|s| self.dest_consumed(s)).sum()
    }

    /// Effective bit width of source slot `slot` for range checking:
    /// the summed split windows, the width named in the slot
    /// (`off10` -> 10), or the destination field length.
    pub fn slot_width(&self, slot: usize) -> u32 {
        if let Some(split) = &self.spec.split {
            if split.slot == slot {
                return split.total_width();
            }
        }
        if let Some(SlotSpec::Imm {
            named_width: Some(width),
            ..
        }) = self.spec.slots.get(slot)
        {
            return *width;
        }
        let dest = self.dest_index(slot);
        self.operands.get(dest).map(|(_, len)| *len).unwrap_or(0)
    }

    /// True when the syntax references the implicit stack/global pointer
    /// shortcuts `A[10]` or `A[15]`.
    pub fn uses_implicit_register(&self) -> bool {
        self.spec.slots.iter().any(|slot| {
            matches!(
                slot,
                SlotSpec::Reg {
                    class: RegClass::A,
                    num: Some(10),
                } | SlotSpec::Reg {
                    class: RegClass::A,
                    num: Some(15),
                }
            )
        })
    }
}

/// Raw table row; field names follow the external formats (lowercase for
/// JSON, capitalized aliases for CSV headers).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawRow {
    #[serde(alias = "OpCode", default)]
    pub opcode: String,
    #[serde(alias = "OpCodeSize", default)]
    pub opcode_size: Option<u32>,
    #[serde(alias = "Instruction", default)]
    pub instruction: String,
    #[serde(alias = "LongName", default)]
    pub long_name: String,
    #[serde(alias = "Syntax", default)]
    pub syntax: String,
    #[serde(alias = "Reference", default)]
    pub reference: String,
    #[serde(alias = "OperandCount", default)]
    pub operand_count: Option<u32>,
    #[serde(default)]
    pub op1_pos: Option<u32>,
    #[serde(default)]
    pub op1_len: Option<u32>,
    #[serde(default)]
    pub op2_pos: Option<u32>,
    #[serde(default)]
    pub op2_len: Option<u32>,
    #[serde(default)]
    pub op3_pos: Option<u32>,
    #[serde(default)]
    pub op3_len: Option<u32>,
    #[serde(default)]
    pub op4_pos: Option<u32>,
    #[serde(default)]
    pub op4_len: Option<u32>,
    #[serde(default)]
    pub op5_pos: Option<u32>,
    #[serde(default)]
    pub op5_len: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawTable {
    #[serde(default)]
    instructions: Vec<RawRow>,
}

#[derive(Debug)]
pub enum TableError {
    Io(io::Error, PathBuf),
    UnsupportedFormat(PathBuf),
    Json(serde_json::Error),
    Csv(csv::Error),
    Empty,
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TableError::Io(err, path) => {
                write!(f, "Cannot read instruction table \"{}\": {}", path.display(), err)
            }
            TableError::UnsupportedFormat(path) => write!(
                f,
                "Unsupported instruction table format: \"{}\" (expected .json or .csv)",
                path.display()
            ),
            TableError::Json(err) => write!(f, "Malformed JSON instruction table: {}", err),
            TableError::Csv(err) => write!(f, "Malformed CSV instruction table: {}", err),
            TableError::Empty => write!(f, "Instruction table contains no usable rows"),
        }
    }
}

impl error::Error for TableError {}

impl From<serde_json::Error> for TableError {
    fn from(err: serde_json::Error) -> TableError {
        TableError::Json(err)
    }
}

impl From<csv::Error> for TableError {
    fn from(err: csv::Error) -> TableError {
        TableError::Csv(err)
    }
}

/// Lookup filters configured by the front-end.
#[derive(Clone, Copy, Debug, Default)]
pub struct LookupOptions {
    /// Only consider 32-bit variants.
    pub force_32bit: bool,
    /// Drop variants whose syntax uses the implicit `A[10]`/`A[15]`
    /// shortcuts.
    pub no_implicit: bool,
}

/// The loaded instruction table, grouped by uppercase mnemonic.
#[derive(Debug, Default)]
pub struct InstructionSet {
    by_mnemonic: HashMap<String, Vec<InstructionDef>>,
    count: usize,
}

impl InstructionSet {
    pub fn load(path: &Path) -> Result<InstructionSet, TableError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let text = fs::read_to_string(path)
            .map_err(|err| TableError::Io(err, path.to_owned()))?;
        let set = match extension.as_str() {
            "json" => InstructionSet::from_json_str(&text)?,
            "csv" => InstructionSet::from_csv_str(&text)?,
            _ => return Err(TableError::UnsupportedFormat(path.to_owned())),
        };
        info!(
            instructions = set.len(),
            mnemonics = set.mnemonic_count(),
            table = %path.display(),
            "instruction table loaded"
        );
        Ok(set)
    }

    pub fn from_json_str(text: &str) -> Result<InstructionSet, TableError> {
        let raw: RawTable = serde_json::from_str(text)?;
        InstructionSet::from_rows(raw.instructions)
    }

    pub fn from_csv_str(text: &str) -> Result<InstructionSet, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            let row: RawRow = row?;
            rows.push(row);
        }
        InstructionSet::from_rows(rows)
    }

    /// Builds the grouped table, dropping malformed rows with a warning.
    pub fn from_rows(rows: Vec<RawRow>) -> Result<InstructionSet, TableError> {
        let mut set = InstructionSet::default();
        for row in rows {
            match compile_row(&row) {
                Ok(def) => {
                    set.count += 1;
                    set.by_mnemonic
                        .entry(def.mnemonic.clone())
                        .or_insert_with(Vec::new)
                        .push(def);
                }
                Err(reason) => {
                    warn!(
                        mnemonic = %row.instruction,
                        opcode = %row.opcode,
                        %reason,
                        "skipping invalid instruction row"
                    );
                }
            }
        }
        if set.count == 0 {
            return Err(TableError::Empty);
        }
        Ok(set)
    }

    pub fn variants(&self, mnemonic: &str) -> &[InstructionDef] {
        self.by_mnemonic
            .get(&mnemonic.to_uppercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mnemonic_count(&self) -> usize {
        self.by_mnemonic.len()
    }
}

fn parse_opcode(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn compile_row(row: &RawRow) -> Result<InstructionDef, String> {
    let mnemonic = row.instruction.trim().to_uppercase();
    if mnemonic.is_empty() {
        return Err("empty mnemonic".to_owned());
    }
    let opcode = parse_opcode(&row.opcode)
        .ok_or_else(|| format!("invalid opcode '{}'", row.opcode))?;
    let opcode_size = row.opcode_size.unwrap_or(32);
    if opcode_size != 16 && opcode_size != 32 {
        return Err(format!("invalid opcode size {}", opcode_size));
    }

    let operands = [
        (row.op1_pos.unwrap_or(0), row.op1_len.unwrap_or(0)),
        (row.op2_pos.unwrap_or(0), row.op2_len.unwrap_or(0)),
        (row.op3_pos.unwrap_or(0), row.op3_len.unwrap_or(0)),
        (row.op4_pos.unwrap_or(0), row.op4_len.unwrap_or(0)),
        (row.op5_pos.unwrap_or(0), row.op5_len.unwrap_or(0)),
    ];
    for &(pos, len) in &operands {
        if len > opcode_size || pos + len > opcode_size {
            return Err(format!(
                "operand field [{}; {}] exceeds the {}-bit instruction word",
                pos, len, opcode_size
            ));
        }
    }

    let spec = compile_syntax(&mnemonic, &row.syntax);
    debug!(%mnemonic, syntax = %row.syntax, slots = spec.slots.len(), "compiled table row");

    Ok(InstructionDef {
        opcode,
        opcode_size,
        mnemonic,
        long_name: row.long_name.trim().to_owned(),
        syntax: row.syntax.trim().to_owned(),
        operand_count: row.operand_count.unwrap_or(0) as usize,
        operands,
        spec,
    })
}

/// Digests a syntax pattern into source slots and an optional split spec.
fn compile_syntax(mnemonic: &str, syntax: &str) -> RowSpec {
    let operands_str = match syntax.trim().split_once(char::is_whitespace) {
        Some((_, rest)) => rest.trim(),
        None => return RowSpec::default(),
    };

    // A brace block attaches split windows to the operand it follows.
    let mut split = None;
    if let Some(start) = operands_str.find('{') {
        let end = operands_str[start..]
            .find('}')
            .map(|i| start + i)
            .unwrap_or(operands_str.len());
        let windows = parse_windows(&operands_str[start..end]);
        if !windows.is_empty() {
            let slot = operands_str[..start].matches(',').count();
            split = Some(SplitSpec { slot, windows });
        }
    }

    // Strip every brace block, then split the remaining fragments.
    let mut cleaned = String::with_capacity(operands_str.len());
    let mut in_brace = false;
    for c in operands_str.chars() {
        match c {
            '{' => in_brace = true,
            '}' => in_brace = false,
            _ if !in_brace => cleaned.push(c),
            _ => {}
        }
    }

    let slots = cleaned
        .split(',')
        .map(str::trim)
        .filter(|frag| !frag.is_empty())
        .map(|frag| classify_fragment(mnemonic, frag))
        .collect();

    RowSpec { slots, split }
}

fn parse_windows(text: &str) -> Vec<(u32, u32)> {
    let mut windows = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            if let Some(close) = text[i..].find(']') {
                let inner = &text[i + 1..i + close];
                if let Some((hi, lo)) = inner.split_once(':') {
                    if let (Ok(hi), Ok(lo)) = (hi.trim().parse(), lo.trim().parse()) {
                        if hi >= lo {
                            windows.push((hi, lo));
                        }
                    }
                }
                i += close + 1;
                continue;
            }
        }
        i += 1;
    }
    windows
}

fn classify_fragment(mnemonic: &str, fragment: &str) -> SlotSpec {
    let mut text = fragment.trim();
    while text.starts_with('[') && text.ends_with(']') && text.len() >= 2 {
        text = text[1..text.len() - 1].trim();
    }
    // Post-increment marker in syntax, e.g. `[A[b]+]`.
    text = text.strip_suffix('+').unwrap_or(text).trim_end();

    // Register pattern: a class letter directly followed by a bracketed
    // register designator. Slot names like `disp24` stay immediates even
    // though they start with a class letter, because the bracket is
    // mandatory.
    let upper = text.to_ascii_uppercase();
    let mut chars = upper.chars();
    if let (Some(first), rest) = (chars.next(), chars.as_str()) {
        if let Some(class) = RegClass::from_letter(first) {
            if let Some(inner) = rest
                .strip_prefix('[')
                .and_then(|r| r.find(']').map(|close| &r[..close]))
            {
                let num = if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
                    inner.parse().ok()
                } else {
                    None
                };
                return SlotSpec::Reg { class, num };
            }
        }
    }

    let lower = text.to_ascii_lowercase();
    let scale = if lower.contains("/4") {
        Scale::Word
    } else if lower.contains("/2") {
        Scale::Half
    } else if lower.starts_with("off") && WORD_ALIGNED_MNEMONICS.contains(&mnemonic) {
        Scale::Word
    } else {
        Scale::None
    };

    SlotSpec::Imm {
        scale,
        named_width: named_width(&lower),
    }
}

/// Width named by the slot itself: `off10` -> 10, `disp24` -> 24.
fn named_width(lower: &str) -> Option<u32> {
    for keyword in &["off", "imm", "disp", "const", "rel"] {
        if let Some(idx) = lower.find(keyword) {
            let digits: String = lower[idx + keyword.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if !digits.is_empty() {
                return digits.parse().ok();
            }
        }
    }
    None
}
