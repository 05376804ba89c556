//! Instruction encoding: packing resolved operand values into the bit
//! fields of the selected table row.

use crate::error::CoreError;
use crate::operand::Operand;
use crate::select::select_variant;
use crate::table::{InstructionDef, InstructionSet, LookupOptions, SlotSpec};
use crate::{LabelMap, ParsedInstruction};
use tracing::debug;

/// Pessimistic byte displacement assumed for names the current label map
/// cannot resolve. Large enough that selection picks the widest variant;
/// the linker re-encodes once the real address is known.
pub const FORWARD_PLACEHOLDER: i64 = 254;

/// Addressing context for one encode: the instruction's own address and
/// the label map visible at this point of the pipeline.
#[derive(Clone, Copy, Debug, Default)]
pub struct EncodeContext<'a> {
    pub address: Option<u32>,
    pub labels: Option<&'a LabelMap>,
}

impl<'a> EncodeContext<'a> {
    pub fn at(address: u32, labels: &'a LabelMap) -> EncodeContext<'a> {
        EncodeContext {
            address: Some(address),
            labels: Some(labels),
        }
    }
}

/// A successfully encoded instruction word.
#[derive(Clone, Debug)]
pub struct Encoded<'a> {
    /// The instruction word; 16-bit encodings occupy the low half.
    pub word: u32,
    pub def: &'a InstructionDef,
    /// Names that had to be replaced by the placeholder displacement.
    pub unresolved: Vec<String>,
}

impl<'a> Encoded<'a> {
    pub fn size_bytes(&self) -> u32 {
        self.def.size_bytes()
    }
}

pub(crate) enum Resolved {
    Value(i64),
    Unresolved { backward: bool },
}

/// Finds the nearest numeric local label (`3f`/`3b`) relative to `address`.
fn resolve_local(labels: &LabelMap, name: &str, forward: bool, address: u32) -> Option<u32> {
    let candidates = labels
        .iter()
        .filter(|(label, _)| label.as_str() == name)
        .map(|(_, addr)| *addr);
    if forward {
        candidates.filter(|addr| *addr > address).min()
    } else {
        candidates.filter(|addr| *addr < address).max()
    }
}

/// Resolves one operand to an integer: register index, literal value, or
/// PC-relative byte displacement for labels.
pub(crate) fn resolve_operand(
    op: &Operand,
    address: Option<u32>,
    labels: Option<&LabelMap>,
) -> Resolved {
    match op {
        Operand::Reg(_, num) | Operand::PostInc(_, num) => Resolved::Value(i64::from(*num)),
        Operand::Imm(value) => Resolved::Value(*value),
        Operand::Symbol(name) => match labels.and_then(|map| map.get(name)) {
            Some(target) => match address {
                Some(current) => Resolved::Value(i64::from(*target) - i64::from(current)),
                None => Resolved::Value(i64::from(*target)),
            },
            None => Resolved::Unresolved { backward: false },
        },
        Operand::Local { name, forward } => match (labels, address) {
            (Some(map), Some(current)) => match resolve_local(map, name, *forward, current) {
                Some(target) => Resolved::Value(i64::from(target) - i64::from(current)),
                None => Resolved::Unresolved { backward: !*forward },
            },
            _ => Resolved::Unresolved { backward: !*forward },
        },
    }
}

fn mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// A value fits a field if it is representable in `width` bits as either a
/// signed (two's-complement) or an unsigned quantity.
pub(crate) fn fits_width(value: i64, width: u32) -> bool {
    if width >= 64 {
        return true;
    }
    let value = i128::from(value);
    let signed_min = -(1i128 << (width - 1));
    let signed_max = (1i128 << (width - 1)) - 1;
    let unsigned_max = (1i128 << width) - 1;
    (signed_min <= value && value <= signed_max) || (0 <= value && value <= unsigned_max)
}

/// Selects a variant for `instr` and packs its operands.
pub fn encode_instruction<'a>(
    set: &'a InstructionSet,
    opts: &LookupOptions,
    instr: &ParsedInstruction,
    ctx: &EncodeContext,
) -> Result<Encoded<'a>, CoreError> {
    let def = select_variant(set, opts, instr, ctx)?;
    encode_with(def, instr, ctx)
}

/// Packs `instr`'s operands into an already-selected row.
pub fn encode_with<'a>(
    def: &'a InstructionDef,
    instr: &ParsedInstruction,
    ctx: &EncodeContext,
) -> Result<Encoded<'a>, CoreError> {
    let mut word = u64::from(def.opcode);
    let mut unresolved = Vec::new();
    let mut dest = 0usize;

    for (i, op) in instr.operands.iter().enumerate() {
        let mut value = match resolve_operand(op, ctx.address, ctx.labels) {
            Resolved::Value(value) => value,
            Resolved::Unresolved { backward } => {
                if let Operand::Symbol(name) = op {
                    unresolved.push(name.clone());
                }
                if backward {
                    -FORWARD_PLACEHOLDER
                } else {
                    FORWARD_PLACEHOLDER
                }
            }
        };

        if let Some(SlotSpec::Imm { scale, .. }) = def.spec.slots.get(i) {
            if !op.is_register() {
                value = scale.apply(value);
            }
        }

        let split = def
            .spec
            .split
            .as_ref()
            .filter(|split| split.slot == i);

        if let Some(split) = split {
            // One source operand scattered over several destination
            // fields: range-check against the summed window width, then
            // write each (hi, lo) window into the next destination slot.
            let total = split.total_width();
            if !fits_width(value, total) {
                return Err(out_of_range(def, instr, op, value, total));
            }
            let bits = (value as u64) & mask(total);
            for &(hi, lo) in &split.windows {
                let (pos, len) = dest_field(def, dest);
                dest += 1;
                let window = (bits >> lo) & mask(hi - lo + 1);
                if len > 0 {
                    word |= (window & mask(len)) << pos;
                }
            }
        } else {
            let (pos, len) = dest_field(def, dest);
            dest += 1;
            if len > 0 {
                if !fits_width(value, len) {
                    return Err(out_of_range(def, instr, op, value, len));
                }
                word |= ((value as u64) & mask(len)) << pos;
            }
        }
    }

    let word = word as u32;
    debug!(
        mnemonic = %instr.mnemonic,
        word = format_args!("{:#x}", word),
        size_bits = def.opcode_size,
        "instruction encoded"
    );
    Ok(Encoded {
        word,
        def,
        unresolved,
    })
}

fn dest_field(def: &InstructionDef, dest: usize) -> (u32, u32) {
    def.operands.get(dest).copied().unwrap_or((0, 0))
}

fn out_of_range(
    def: &InstructionDef,
    instr: &ParsedInstruction,
    op: &Operand,
    value: i64,
    width: u32,
) -> CoreError {
    CoreError::OperandOutOfRange {
        mnemonic: instr.mnemonic.clone(),
        syntax: def.syntax.clone(),
        operand: op.to_string(),
        value,
        width,
    }
}
