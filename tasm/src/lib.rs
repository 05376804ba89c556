//! Two-pass assembler for the TriCore instruction set.
//!
//! The first pass collects labels and `EQU` constants while sizing every
//! line (variant selection for instructions, the directive size
//! calculator for data). The second pass re-runs selection with the
//! complete label table and encodes. The result is a [`tobjfile`] object
//! plus a [`SourceListing`] covering every source line.
//!
//! Instruction sizes may still change at link time: a forward reference
//! is sized pessimistically here and the linker's convergence loop
//! shrinks it once real addresses are known.

pub mod directives;
pub mod error;
pub mod listing;
pub mod parser;


use directives::{DataDirectives, DirectiveError};
pub use error::AsmError;
pub use listing::SourceListing;
use parser::Stmt;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tobjfile::{ConstRecord, InstrRecord, LabelRecord, ObjectFile, SymbolRecord};
use tracing::{debug, info};
use tricore::encode::{encode_instruction, EncodeContext};
use tricore::select::select_variant;
use tricore::{CoreError, InstructionSet, LabelMap, LookupOptions, ParsedInstruction};
use util::diag::{Diagnostic, Diagnostics, Level};
use util::Endianness;

/// Default origin for TriCore program memory.
pub const DEFAULT_ORIGIN: u32 = 0x8000_0000;

#[derive(Clone, Debug)]
pub struct AsmOptions {
    pub endianness: Endianness,
    pub force_32bit: bool,
    pub no_implicit: bool,
    pub origin: u32,
    /// Base directory for relative `INCBIN` paths.
    pub base_dir: Option<PathBuf>,
}

impl Default for AsmOptions {
    fn default() -> AsmOptions {
        AsmOptions {
            endianness: Endianness::Little,
            force_32bit: false,
            no_implicit: false,
            origin: DEFAULT_ORIGIN,
            base_dir: None,
        }
    }
}

impl AsmOptions {
    pub fn lookup(&self) -> LookupOptions {
        LookupOptions {
            force_32bit: self.force_32bit,
            no_implicit: self.no_implicit,
        }
    }
}

/// Result of a successful assembly. Warnings stay in `diagnostics`.
#[derive(Debug)]
pub struct AsmOutput {
    pub object: ObjectFile,
    pub listing: SourceListing,
    pub diagnostics: Diagnostics,
}

pub struct Assembler<'a> {
    set: &'a InstructionSet,
    opts: AsmOptions,
}

/// Diagnostic code for a core error, mirroring the error taxonomy.
pub fn core_error_code(err: &CoreError) -> &'static str {
    match err {
        CoreError::InvalidNumber { .. } => "INVALID_NUMBER",
        CoreError::InvalidOperand { .. } => "INVALID_OPERAND",
        CoreError::UnknownInstruction { .. } => "UNKNOWN_INSTRUCTION",
        CoreError::NoVariantMatches { .. } => "NO_VARIANT_MATCHES",
        CoreError::OperandOutOfRange { .. } => "OPERAND_OUT_OF_RANGE",
    }
}

/// Diagnostic code for a data directive error.
pub fn directive_error_code(err: &DirectiveError) -> &'static str {
    match err {
        DirectiveError::ValueOverflow { .. } => "VALUE_OVERFLOW",
        DirectiveError::FloatWidth { .. } => "VALUE_OVERFLOW",
        DirectiveError::FileNotFound(_) => "FILE_NOT_FOUND",
        DirectiveError::Io(..) => "FILE_READ_ERROR",
        DirectiveError::InvalidCount(_) => "INVALID_COUNT",
        DirectiveError::InvalidValue(_) => "DATA_DIRECTIVE_ERROR",
        DirectiveError::InvalidEqu(_) => "INVALID_EQU",
    }
}

fn valid_label_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    if name.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    (first.is_ascii_alphabetic() || first == '_' || first == '.')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// State threaded through both passes.
struct PassState {
    labels: LabelMap,
    label_lines: HashMap<String, u32>,
    handler: DataDirectives,
}

impl<'a> Assembler<'a> {
    pub fn new(set: &'a InstructionSet, opts: AsmOptions) -> Assembler<'a> {
        Assembler { set, opts }
    }

    /// Assembles one source text. `source_name` tags diagnostics and the
    /// object file.
    pub fn assemble_source(
        &self,
        source: &str,
        source_name: &str,
    ) -> Result<AsmOutput, AsmError> {
        let mut diagnostics = Diagnostics::new();
        let mut listing = SourceListing::default();

        let mut handler = DataDirectives::new(self.opts.endianness);
        if let Some(base_dir) = &self.opts.base_dir {
            handler = handler.with_base_dir(base_dir);
        }
        let mut state = PassState {
            labels: LabelMap::new(),
            label_lines: HashMap::new(),
            handler,
        };

        self.first_pass(source, source_name, &mut state, &mut listing, &mut diagnostics);
        let object = if diagnostics.has_errors() {
            ObjectFile::new(source_name)
        } else {
            self.second_pass(source, source_name, &state, &mut listing, &mut diagnostics)
        };

        if diagnostics.has_errors() {
            return Err(AsmError::Failed(diagnostics));
        }
        info!(
            source = source_name,
            instructions = object.instructions.len(),
            labels = object.labels.len(),
            code_size = object.code_size(),
            "assembly completed"
        );
        Ok(AsmOutput {
            object,
            listing,
            diagnostics,
        })
    }

    /// Assembles `input` into `output`, writing the preliminary listing
    /// next to `listing_path` when requested.
    pub fn assemble_file(
        &self,
        input: &Path,
        output: &Path,
        listing_path: Option<&Path>,
    ) -> Result<AsmOutput, AsmError> {
        let source = fs::read_to_string(input)
            .map_err(|err| AsmError::Io(err, input.to_owned()))?;

        let mut assembler = Assembler {
            set: self.set,
            opts: self.opts.clone(),
        };
        if assembler.opts.base_dir.is_none() {
            assembler.opts.base_dir = input.parent().map(Path::to_owned);
        }

        let result = assembler.assemble_source(&source, &input.to_string_lossy())?;

        tobjfile::write_file(output, &result.object)?;
        if let Some(listing_path) = listing_path {
            let mut writer = fs::File::create(listing_path)
                .map_err(|err| AsmError::Io(err, listing_path.to_owned()))?;
            result
                .listing
                .write_ls1(&mut writer)
                .and_then(|_| writer.flush())
                .map_err(|err| AsmError::Io(err, listing_path.to_owned()))?;
        }
        Ok(result)
    }

    fn report(
        diagnostics: &mut Diagnostics,
        level: Level,
        message: String,
        source_name: &str,
        line: u32,
        code: &'static str,
    ) {
        diagnostics.push(
            Diagnostic::new(level, message)
                .with_location(source_name, line)
                .with_code(code),
        );
    }

    fn parse_org(arg: &str) -> Option<u32> {
        let value = tricore::parse_numeric(arg).ok()?;
        if (0..=i64::from(u32::MAX)).contains(&value) {
            Some(value as u32)
        } else {
            None
        }
    }

    /// Pass 1: label collection and line sizing.
    fn first_pass(
        &self,
        source: &str,
        source_name: &str,
        state: &mut PassState,
        listing: &mut SourceListing,
        diagnostics: &mut Diagnostics,
    ) {
        let mut address = self.opts.origin;
        let mut label_count = 0usize;

        for (index, raw) in source.lines().enumerate() {
            let line_no = index as u32 + 1;
            let text = raw.trim();

            let parsed = match parser::parse_line(raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    Self::report(
                        diagnostics,
                        Level::Error,
                        format!("Cannot parse line: {}", err),
                        source_name,
                        line_no,
                        "PARSE_ERROR",
                    );
                    listing.push(line_no, None, text);
                    continue;
                }
            };

            if let Some(name) = parsed.label {
                if !valid_label_name(name) {
                    Self::report(
                        diagnostics,
                        Level::Error,
                        format!("Invalid label name: '{}'", name),
                        source_name,
                        line_no,
                        "INVALID_LABEL_NAME",
                    );
                } else if let Some(previous) = state.label_lines.get(name) {
                    Self::report(
                        diagnostics,
                        Level::Error,
                        format!(
                            "Label '{}' already defined at line {}",
                            name, previous
                        ),
                        source_name,
                        line_no,
                        "DUPLICATE_LABEL",
                    );
                } else {
                    state.labels.insert(name.to_owned(), address);
                    state.label_lines.insert(name.to_owned(), line_no);
                    label_count += 1;
                    debug!(label = name, address = format_args!("{:#010x}", address), "label defined");
                }
            }

            match &parsed.stmt {
                Stmt::Empty => {
                    let shown = parsed.label.map(|_| address);
                    listing.push(line_no, shown, text);
                }
                Stmt::Org { arg } => {
                    listing.push(line_no, Some(address), text);
                    match Self::parse_org(arg) {
                        Some(origin) => address = origin,
                        None => Self::report(
                            diagnostics,
                            Level::Error,
                            format!("Invalid .ORG address: '{}'", arg),
                            source_name,
                            line_no,
                            "INVALID_ORG",
                        ),
                    }
                }
                Stmt::Equ { name, value } => {
                    listing.push(line_no, None, text);
                    if let Err(err) = state.handler.define_constant(name, value, &state.labels) {
                        Self::report(
                            diagnostics,
                            Level::Error,
                            err.to_string(),
                            source_name,
                            line_no,
                            "INVALID_EQU",
                        );
                    }
                }
                Stmt::Operation {
                    mnemonic,
                    operands,
                    rest,
                } => {
                    listing.push(line_no, Some(address), text);
                    let size = if mnemonic.eq_ignore_ascii_case(".org") {
                        // `.ORG` without a usable argument parses as a
                        // plain operation.
                        Self::report(
                            diagnostics,
                            Level::Error,
                            format!("Invalid .ORG directive: '{}'", text),
                            source_name,
                            line_no,
                            "INVALID_ORG",
                        );
                        0
                    } else if directives::is_data_directive(mnemonic) {
                        match state.handler.size_of(mnemonic, rest, &state.labels) {
                            Ok(size) => size as u32,
                            Err(err) => {
                                Self::report(
                                    diagnostics,
                                    Level::Error,
                                    err.to_string(),
                                    source_name,
                                    line_no,
                                    directive_error_code(&err),
                                );
                                0
                            }
                        }
                    } else {
                        self.instruction_size(
                            mnemonic, operands, raw, line_no, address, state, source_name,
                            diagnostics,
                        )
                    };
                    address = address.wrapping_add(size);
                }
            }
        }
        debug!(labels = label_count, "first pass completed");
    }

    #[allow(clippy::too_many_arguments)]
    fn instruction_size(
        &self,
        mnemonic: &str,
        operands: &[String],
        raw: &str,
        line_no: u32,
        address: u32,
        state: &PassState,
        source_name: &str,
        diagnostics: &mut Diagnostics,
    ) -> u32 {
        let instr = match ParsedInstruction::new(mnemonic, operands, line_no, raw) {
            Ok(instr) => instr,
            Err(err) => {
                Self::report(
                    diagnostics,
                    Level::Error,
                    err.to_string(),
                    source_name,
                    line_no,
                    core_error_code(&err),
                );
                return 0;
            }
        };
        match select_variant(
            self.set,
            &self.opts.lookup(),
            &instr,
            &EncodeContext::at(address, &state.labels),
        ) {
            Ok(def) => def.size_bytes(),
            Err(err) => {
                Self::report(
                    diagnostics,
                    Level::Error,
                    err.to_string(),
                    source_name,
                    line_no,
                    core_error_code(&err),
                );
                0
            }
        }
    }

    /// Pass 2: encoding and object construction.
    fn second_pass(
        &self,
        source: &str,
        source_name: &str,
        state: &PassState,
        listing: &mut SourceListing,
        diagnostics: &mut Diagnostics,
    ) -> ObjectFile {
        let mut object = ObjectFile::new(source_name);
        let mut address = self.opts.origin;

        for (index, raw) in source.lines().enumerate() {
            let line_no = index as u32 + 1;
            let parsed = match parser::parse_line(raw) {
                Ok(parsed) => parsed,
                // Pass 1 already reported the parse error.
                Err(_) => continue,
            };

            match &parsed.stmt {
                Stmt::Empty | Stmt::Equ { .. } => {}
                Stmt::Org { arg } => {
                    if let Some(origin) = Self::parse_org(arg) {
                        address = origin;
                    }
                }
                Stmt::Operation {
                    mnemonic,
                    operands,
                    rest,
                } => {
                    let statement_text = format!("{} {}", mnemonic, rest).trim().to_owned();
                    if directives::is_data_directive(mnemonic) {
                        match self.emit_directive(mnemonic, rest, state) {
                            Ok((size, preview)) => {
                                if size > 0 {
                                    object.instructions.push(InstrRecord {
                                        address,
                                        opcode: preview_word(&preview),
                                        size: size.min(255) as u8,
                                        line: line_no,
                                        text: statement_text,
                                    });
                                    listing.set_encoding(line_no, address, preview);
                                    address = address.wrapping_add(size as u32);
                                }
                            }
                            Err(err) => {
                                Self::report(
                                    diagnostics,
                                    Level::Error,
                                    err.to_string(),
                                    source_name,
                                    line_no,
                                    directive_error_code(&err),
                                );
                            }
                        }
                    } else {
                        let instr =
                            match ParsedInstruction::new(mnemonic, operands, line_no, raw) {
                                Ok(instr) => instr,
                                Err(_) => continue,
                            };
                        match encode_instruction(
                            self.set,
                            &self.opts.lookup(),
                            &instr,
                            &EncodeContext::at(address, &state.labels),
                        ) {
                            Ok(encoded) => {
                                let size = encoded.size_bytes();
                                for name in &encoded.unresolved {
                                    object.symbols.push(SymbolRecord {
                                        name: name.clone(),
                                        address: 0,
                                        line: line_no,
                                    });
                                }
                                let bytes = word_bytes(
                                    self.opts.endianness,
                                    encoded.word,
                                    size,
                                );
                                object.instructions.push(InstrRecord {
                                    address,
                                    opcode: encoded.word,
                                    size: size as u8,
                                    line: line_no,
                                    text: statement_text,
                                });
                                listing.set_encoding(line_no, address, bytes);
                                address = address.wrapping_add(size);
                            }
                            Err(err) => {
                                Self::report(
                                    diagnostics,
                                    Level::Error,
                                    err.to_string(),
                                    source_name,
                                    line_no,
                                    core_error_code(&err),
                                );
                            }
                        }
                    }
                }
            }
        }

        for (name, addr) in &state.labels {
            object.labels.push(LabelRecord {
                name: name.clone(),
                address: *addr,
                line: state.label_lines.get(name).copied().unwrap_or(0),
            });
        }
        for (name, value) in &state.handler.constants {
            object.constants.push(ConstRecord {
                name: name.clone(),
                value: *value,
            });
        }
        object
    }

    /// Encodes one data directive, returning its size and preview bytes.
    /// Reservations are sized without materializing their zeroes.
    fn emit_directive(
        &self,
        mnemonic: &str,
        rest: &str,
        state: &PassState,
    ) -> Result<(usize, Vec<u8>), DirectiveError> {
        if directives::reserve_size(mnemonic).is_some() {
            let size = state.handler.size_of(mnemonic, rest, &state.labels)?;
            return Ok((size, Vec::new()));
        }
        let bytes = state.handler.emit(mnemonic, rest, &state.labels)?;
        Ok((bytes.len(), bytes))
    }
}

/// First four little-endian bytes of a data preview, for the object
/// record's `opcode` field.
fn preview_word(bytes: &[u8]) -> u32 {
    let mut word = 0u32;
    for (i, byte) in bytes.iter().take(4).enumerate() {
        word |= u32::from(*byte) << (i * 8);
    }
    word
}

/// Serializes an instruction word at its encoded size.
pub fn word_bytes(endianness: Endianness, word: u32, size: u32) -> Vec<u8> {
    match size {
        2 => endianness.u16_bytes(word as u16).to_vec(),
        _ => endianness.u32_bytes(word).to_vec(),
    }
}
