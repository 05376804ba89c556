//! Variant selection: picking the right instruction table row for a parsed
//! instruction.
//!
//! Several rows usually exist per mnemonic, differing in register classes,
//! fixed registers, immediate widths and encoding size. Selection filters
//! by arity, configuration, operand types and value ranges, then prefers
//! the most specific row and the smallest encoding that fits. Forward
//! references flip the size preference so later passes never have to grow
//! an instruction.

use crate::encode::{fits_width, resolve_operand, EncodeContext, Resolved};
use crate::error::CoreError;
use crate::operand::{Operand, OperandKind};
use crate::table::{InstructionDef, InstructionSet, LookupOptions, SlotSpec};
use crate::ParsedInstruction;
use std::cmp::Reverse;
use tracing::debug;

fn type_compatible(def: &InstructionDef, operands: &[Operand]) -> bool {
    def.spec
        .slots
        .iter()
        .zip(operands)
        .all(|(slot, op)| match (slot, op.kind()) {
            (SlotSpec::Reg { class, num }, OperandKind::Reg(c)) => {
                c == *class
                    && match (num, op.register()) {
                        (Some(want), Some((_, n))) => *want == n,
                        _ => true,
                    }
            }
            (SlotSpec::Reg { .. }, OperandKind::Imm) => false,
            (SlotSpec::Imm { .. }, OperandKind::Reg(_)) => false,
            (SlotSpec::Imm { .. }, OperandKind::Imm) => true,
        })
}

/// Counts generic register slots filled by a concrete register. Rows with
/// fixed-register slots score lower and win ties, so `MOV D[15], const8`
/// beats `MOV D[a], const8` when the operand really is `D15`.
fn specificity_penalty(def: &InstructionDef, operands: &[Operand]) -> usize {
    def.spec
        .slots
        .iter()
        .zip(operands)
        .filter(|(slot, op)| {
            matches!(slot, SlotSpec::Reg { num: None, .. }) && op.is_register()
        })
        .count()
}

/// Selects the table row for `instr`, or reports why none matches.
pub fn select_variant<'a>(
    set: &'a InstructionSet,
    opts: &LookupOptions,
    instr: &ParsedInstruction,
    ctx: &EncodeContext,
) -> Result<&'a InstructionDef, CoreError> {
    let variants = set.variants(&instr.mnemonic);
    if variants.is_empty() {
        return Err(CoreError::UnknownInstruction {
            mnemonic: instr.mnemonic.clone(),
            operand_count: instr.operands.len(),
        });
    }

    // Step 1: arity. The source slot count of the syntax must match the
    // parsed operand count (split operands count once here).
    let arity: Vec<&InstructionDef> = variants
        .iter()
        .filter(|def| def.spec.slots.len() == instr.operands.len())
        .collect();

    // Step 2: configuration filters.
    let configured: Vec<&InstructionDef> = arity
        .iter()
        .copied()
        .filter(|def| !opts.force_32bit || def.opcode_size >= 32)
        .filter(|def| !opts.no_implicit || !def.uses_implicit_register())
        .collect();

    // Step 3: operand type compatibility, including fixed registers.
    let typed: Vec<&InstructionDef> = configured
        .iter()
        .copied()
        .filter(|def| type_compatible(def, &instr.operands))
        .collect();

    if typed.is_empty() {
        return Err(CoreError::NoVariantMatches {
            mnemonic: instr.mnemonic.clone(),
            operand_count: instr.operands.len(),
            tried: arity.iter().map(|def| def.syntax.clone()).collect(),
        });
    }

    // Step 5 prep: resolve every non-register operand once. Unresolvable
    // names mark a forward reference and are exempt from range checks.
    let mut forward_ref = false;
    let values: Vec<Option<i64>> = instr
        .operands
        .iter()
        .map(|op| {
            if op.is_register() {
                return None;
            }
            match resolve_operand(op, ctx.address, ctx.labels) {
                Resolved::Value(value) => Some(value),
                Resolved::Unresolved { .. } => {
                    forward_ref = true;
                    None
                }
            }
        })
        .collect();

    let fits = |def: &InstructionDef| {
        values.iter().enumerate().all(|(i, value)| {
            let value = match value {
                Some(v) => *v,
                None => return true,
            };
            let scaled = match def.spec.slots.get(i) {
                Some(SlotSpec::Imm { scale, .. }) => scale.apply(value),
                _ => value,
            };
            let width = def.slot_width(i);
            width == 0 || fits_width(scaled, width)
        })
    };

    let survivors: Vec<&InstructionDef> = typed.iter().copied().filter(|d| fits(d)).collect();

    // Step 5: among rows that fit, prefer exact fixed-register matches,
    // then the smallest encoding; a forward reference prefers the largest
    // so addresses can only shrink in later passes.
    let chosen = if survivors.is_empty() {
        // Step 6: nothing fits. Hand back the widest type-compatible row
        // and let the encoder produce a precise overflow diagnostic.
        typed.iter().copied().max_by_key(|def| def.opcode_size)
    } else if forward_ref {
        survivors
            .iter()
            .copied()
            .min_by_key(|def| (specificity_penalty(def, &instr.operands), Reverse(def.opcode_size)))
    } else {
        survivors
            .iter()
            .copied()
            .min_by_key(|def| (specificity_penalty(def, &instr.operands), def.opcode_size))
    };

    let def = match chosen {
        Some(def) => def,
        // `typed` is non-empty, so a candidate always exists.
        None => typed[0],
    };
    debug!(
        mnemonic = %instr.mnemonic,
        syntax = %def.syntax,
        size_bits = def.opcode_size,
        forward_ref,
        "variant selected"
    );
    Ok(def)
}
