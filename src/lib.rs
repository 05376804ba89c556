//! ISA core of the TriCore assembler toolchain.
//!
//! Everything that depends only on the instruction set lives here: the
//! external instruction table ([`table`]), NASM numeric constants
//! ([`numeric`]), operand normalization and classification ([`operand`]),
//! variant selection ([`select`]) and instruction encoding ([`encode`]).
//!
//! The assembler (`tasm`) and linker (`tlink`) crates drive these pieces;
//! the table itself is loaded once and shared immutably for the lifetime
//! of a build.

pub mod encode;
pub mod error;
pub mod numeric;
pub mod operand;
pub mod select;
pub mod table;

pub use encode::{
    encode_instruction, encode_with, EncodeContext, Encoded, FORWARD_PLACEHOLDER,
};
pub use error::CoreError;
pub use numeric::parse_numeric;
pub use operand::{Operand, OperandKind, RegClass};
pub use select::select_variant;
pub use table::{InstructionDef, InstructionSet, LookupOptions, TableError};

use std::collections::HashMap;

/// Label name to address. Numeric names are GCC-style local labels.
pub type LabelMap = HashMap<String, u32>;

/// A parsed instruction before any address is assigned.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedInstruction {
    /// Uppercased mnemonic.
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    pub line: u32,
    /// The source line the instruction came from, for diagnostics and
    /// link-time re-encoding.
    pub source: String,
}

impl ParsedInstruction {
    /// Builds an instruction from raw operand tokens. Compound tokens
    /// (`[a15]14`) may normalize into two operands.
    pub fn new<S: AsRef<str>>(
        mnemonic: &str,
        operand_tokens: &[S],
        line: u32,
        source: &str,
    ) -> Result<ParsedInstruction, CoreError> {
        Ok(ParsedInstruction {
            mnemonic: mnemonic.trim().to_uppercase(),
            operands: operand::parse_list(operand_tokens)?,
            line,
            source: source.to_owned(),
        })
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }
}

#[cfg(test)]
mod test;
