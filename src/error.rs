use std::{error, fmt};

/// Errors produced by the ISA core: operand parsing, variant selection and
/// instruction encoding.
#[derive(Clone, Debug, PartialEq)]
pub enum CoreError {
    /// A literal that matches none of the recognized numeric forms.
    InvalidNumber { text: String },
    /// An operand token that is neither register, literal, nor symbol.
    InvalidOperand { text: String },
    /// The mnemonic has no row in the instruction table.
    UnknownInstruction {
        mnemonic: String,
        operand_count: usize,
    },
    /// Rows exist for the mnemonic but none is compatible with the parsed
    /// operands. Carries the syntax of every row that was tried.
    NoVariantMatches {
        mnemonic: String,
        operand_count: usize,
        tried: Vec<String>,
    },
    /// An operand value does not fit the bit-field of the selected row.
    OperandOutOfRange {
        mnemonic: String,
        syntax: String,
        operand: String,
        value: i64,
        width: u32,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CoreError::InvalidNumber { text } => {
                write!(f, "Invalid numeric constant: '{}'", text)
            }
            CoreError::InvalidOperand { text } => {
                write!(f, "Cannot parse operand: '{}'", text)
            }
            CoreError::UnknownInstruction {
                mnemonic,
                operand_count,
            } => write!(
                f,
                "Unknown instruction '{}' with {} operand(s)",
                mnemonic, operand_count
            ),
            CoreError::NoVariantMatches {
                mnemonic,
                operand_count,
                tried,
            } => {
                write!(
                    f,
                    "No variant of '{}' accepts {} operand(s).",
                    mnemonic, operand_count
                )?;
                if !tried.is_empty() {
                    write!(f, " Tried:")?;
                    for syntax in tried {
                        write!(f, "\n    - {}", syntax)?;
                    }
                }
                Ok(())
            }
            CoreError::OperandOutOfRange {
                mnemonic,
                syntax,
                operand,
                value,
                width,
            } => write!(
                f,
                "Operand '{}' of '{}' has value {} which does not fit a {}-bit field (syntax: {})",
                operand, mnemonic, value, width, syntax
            ),
        }
    }
}

impl error::Error for CoreError {}
