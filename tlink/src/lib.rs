//! Multi-pass linker for `TOBJ` objects.
//!
//! Linking runs in five phases: load, global symbol resolution, the
//! size-and-address convergence loop, a final re-encoding, and output
//! emission. The convergence loop exists because on TriCore the chosen
//! encoding (16 vs 32 bits) depends on a displacement, the displacement
//! depends on addresses, and addresses depend on chosen encodings; the
//! loop re-encodes until the layout reaches a fixed point or the pass cap
//! is hit.

pub mod image;
pub mod output;

#[cfg(test)]
mod test;

use image::MemoryImage;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{error, fmt};
use tasm::directives::{self, DataDirectives};
use tasm::parser::{self, Stmt};
use tobjfile::{ConstRecord, LabelRecord, ObjectFile, SymbolRecord};
use tracing::{debug, info, warn};
use tricore::encode::{encode_instruction, EncodeContext};
use tricore::{InstructionSet, LabelMap, LookupOptions, ParsedInstruction};
use util::diag::{Diagnostic, Diagnostics, Level};
use util::Endianness;

/// Cap on convergence passes; overrunning it is a warning, not an error.
pub const K_MAX: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputFormat {
    Bin,
    Hex,
    Txt,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParseFormatError(pub String);

impl fmt::Display for ParseFormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Unknown output format '{}' (expected bin, hex or txt)",
            self.0
        )
    }
}

impl error::Error for ParseFormatError {}

impl FromStr for OutputFormat {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<OutputFormat, ParseFormatError> {
        match s.to_ascii_lowercase().as_str() {
            "bin" => Ok(OutputFormat::Bin),
            "hex" => Ok(OutputFormat::Hex),
            "txt" => Ok(OutputFormat::Txt),
            _ => Err(ParseFormatError(s.to_owned())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LinkOptions {
    pub base_address: u32,
    pub format: OutputFormat,
    pub endianness: Endianness,
    pub force_32bit: bool,
    pub no_implicit: bool,
}

impl Default for LinkOptions {
    fn default() -> LinkOptions {
        LinkOptions {
            base_address: 0x8000_0000,
            format: OutputFormat::Bin,
            endianness: Endianness::Little,
            force_32bit: false,
            no_implicit: false,
        }
    }
}

/// An instruction or directive record being linked. Unlike the on-disk
/// record, `size` is not clamped to one byte, so long data directives lay
/// out correctly.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkRecord {
    pub address: u32,
    pub opcode: u32,
    pub size: u32,
    pub line: u32,
    pub text: String,
}

#[derive(Clone, Debug)]
pub struct LinkObject {
    pub path: String,
    pub records: Vec<LinkRecord>,
    pub labels: Vec<LabelRecord>,
    pub symbols: Vec<SymbolRecord>,
    pub constants: Vec<ConstRecord>,
}

impl LinkObject {
    fn from_object(object: ObjectFile) -> LinkObject {
        LinkObject {
            path: object.source_path,
            records: object
                .instructions
                .into_iter()
                .map(|instr| LinkRecord {
                    address: instr.address,
                    opcode: instr.opcode,
                    size: u32::from(instr.size),
                    line: instr.line,
                    text: instr.text,
                })
                .collect(),
            labels: object.labels,
            symbols: object.symbols,
            constants: object.constants,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LinkedSymbol {
    pub name: String,
    pub address: u32,
    pub defined_in: String,
    pub references: Vec<(String, u32)>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LinkStats {
    pub min_address: u32,
    pub max_address: u32,
    pub record_count: usize,
}

#[derive(Debug)]
pub struct LinkOutput {
    pub image: MemoryImage,
    /// Global symbols, sorted by name.
    pub symbols: Vec<LinkedSymbol>,
    pub objects: Vec<LinkObject>,
    pub stats: LinkStats,
    pub diagnostics: Diagnostics,
}

#[derive(Debug)]
pub enum LinkError {
    Io(io::Error, PathBuf),
    Object(tobjfile::ObjError, PathBuf),
    Failed(Diagnostics),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LinkError::Io(err, path) => write!(f, "File \"{}\": {}", path.display(), err),
            LinkError::Object(err, path) => {
                write!(f, "Object \"{}\": {}", path.display(), err)
            }
            LinkError::Failed(diagnostics) => {
                write!(
                    f,
                    "Linking failed with {} error(s)",
                    diagnostics.error_count()
                )?;
                for diagnostic in diagnostics.iter() {
                    write!(f, "\n{}", diagnostic)?;
                }
                Ok(())
            }
        }
    }
}

impl error::Error for LinkError {}

/// What a record's source text turned out to be.
enum RecordKind<'t> {
    Instruction {
        mnemonic: &'t str,
        operands: Vec<String>,
    },
    Data {
        mnemonic: &'t str,
        rest: &'t str,
    },
    Other,
}

fn classify(text: &str) -> RecordKind {
    match parser::parse_line(text) {
        Ok(line) => match line.stmt {
            Stmt::Operation {
                mnemonic,
                operands,
                rest,
            } => {
                if directives::is_data_directive(mnemonic) {
                    RecordKind::Data { mnemonic, rest }
                } else {
                    RecordKind::Instruction { mnemonic, operands }
                }
            }
            _ => RecordKind::Other,
        },
        Err(_) => RecordKind::Other,
    }
}

fn global_labels(objects: &[LinkObject]) -> LabelMap {
    let mut map = LabelMap::new();
    for object in objects {
        for label in &object.labels {
            map.insert(label.name.clone(), label.address);
        }
    }
    map
}

/// Places objects sequentially from the base address, preserving each
/// object's internal gaps.
fn relocate(objects: &mut [LinkObject], base: u32) {
    let mut next = base;
    for object in objects.iter_mut() {
        let first = match object.records.first() {
            Some(record) => record.address,
            None => continue,
        };
        let delta = next.wrapping_sub(first);
        for record in &mut object.records {
            record.address = record.address.wrapping_add(delta);
        }
        for label in &mut object.labels {
            label.address = label.address.wrapping_add(delta);
        }
        if let Some(last) = object.records.last() {
            next = last.address.wrapping_add(last.size);
        }
        debug!(object = %object.path, delta, "object relocated");
    }
}

/// Moves every label to the first record at or after its definition
/// line. Labels behind the last record land at the end of the object.
fn reattach_labels(object: &mut LinkObject) {
    let records = &object.records;
    let end = records.last().map(|r| r.address.wrapping_add(r.size));
    for label in &mut object.labels {
        match records.iter().find(|record| record.line >= label.line) {
            Some(record) => label.address = record.address,
            None => {
                if let Some(end) = end {
                    label.address = end;
                }
            }
        }
    }
}

pub struct Linker<'a> {
    set: &'a InstructionSet,
    opts: LinkOptions,
}

impl<'a> Linker<'a> {
    pub fn new(set: &'a InstructionSet, opts: LinkOptions) -> Linker<'a> {
        Linker { set, opts }
    }

    fn lookup(&self) -> LookupOptions {
        LookupOptions {
            force_32bit: self.opts.force_32bit,
            no_implicit: self.opts.no_implicit,
        }
    }

    fn handler_for(&self, constants: &[(String, i32)], source_path: &str) -> DataDirectives {
        let mut handler = DataDirectives::new(self.opts.endianness);
        if let Some(parent) = Path::new(source_path).parent() {
            handler = handler.with_base_dir(parent);
        }
        handler.add_constants(constants.iter().map(|(name, value)| (name.as_str(), *value)));
        handler
    }

    /// Links already-loaded objects into a memory image.
    pub fn link_objects(&self, objects: Vec<ObjectFile>) -> Result<LinkOutput, LinkError> {
        let mut diagnostics = Diagnostics::new();
        let mut objects: Vec<LinkObject> =
            objects.into_iter().map(LinkObject::from_object).collect();
        info!(objects = objects.len(), base = format_args!("{:#010x}", self.opts.base_address), "linking");

        let constants: Vec<(String, i32)> = objects
            .iter()
            .flat_map(|object| {
                object
                    .constants
                    .iter()
                    .map(|c| (c.name.clone(), c.value))
            })
            .collect();

        // Phase A: true data sizes (the on-disk size byte saturates at
        // 255), then relocation.
        self.restore_data_sizes(&mut objects, &constants);
        relocate(&mut objects, self.opts.base_address);

        // Phase B: global symbol resolution.
        let mut symbols = self.resolve_symbols(&objects, &mut diagnostics);
        if diagnostics.has_errors() {
            return Err(LinkError::Failed(diagnostics));
        }

        // Phase C: size-and-address convergence.
        self.converge(&mut objects, &constants, &mut diagnostics);

        // Phase D: final re-encoding with the stable label map.
        let global = global_labels(&objects);
        self.reencode_all(&mut objects, &global);

        for symbol in &mut symbols {
            if let Some(address) = global.get(&symbol.name) {
                symbol.address = *address;
            }
        }

        // Phase E: emission into the memory image.
        let (image, stats) = self.emit(&objects, &global, &constants, &mut diagnostics);
        if diagnostics.has_errors() {
            return Err(LinkError::Failed(diagnostics));
        }
        info!(
            records = stats.record_count,
            bytes = image.len(),
            "linking completed"
        );
        Ok(LinkOutput {
            image,
            symbols,
            objects,
            stats,
            diagnostics,
        })
    }

    /// Loads, links and writes every output file.
    pub fn link_files(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        ls1: Option<&Path>,
    ) -> Result<LinkOutput, LinkError> {
        let mut objects = Vec::with_capacity(inputs.len());
        for path in inputs {
            let object =
                tobjfile::read_file(path).map_err(|err| LinkError::Object(err, path.clone()))?;
            objects.push(object);
        }
        let result = self.link_objects(objects)?;
        self.write_outputs(&result, output, ls1)?;
        Ok(result)
    }

    fn restore_data_sizes(&self, objects: &mut [LinkObject], constants: &[(String, i32)]) {
        let global = global_labels(objects);
        for object in objects.iter_mut() {
            let handler = self.handler_for(constants, &object.path);
            for record in object.records.iter_mut() {
                let text = record.text.clone();
                if let RecordKind::Data { mnemonic, rest } = classify(&text) {
                    if let Ok(size) = handler.size_of(mnemonic, rest, &global) {
                        record.size = size as u32;
                    }
                }
            }
        }
    }

    fn resolve_symbols(
        &self,
        objects: &[LinkObject],
        diagnostics: &mut Diagnostics,
    ) -> Vec<LinkedSymbol> {
        let mut definitions: BTreeMap<String, LinkedSymbol> = BTreeMap::new();

        for object in objects {
            for label in &object.labels {
                if let Some(existing) = definitions.get(&label.name) {
                    diagnostics.push(
                        Diagnostic::new(
                            Level::Error,
                            format!(
                                "Symbol '{}' multiply defined (previous definition in {})",
                                label.name, existing.defined_in
                            ),
                        )
                        .with_location(object.path.clone(), label.line)
                        .with_code("MULTIPLY_DEFINED"),
                    );
                } else {
                    definitions.insert(
                        label.name.clone(),
                        LinkedSymbol {
                            name: label.name.clone(),
                            address: label.address,
                            defined_in: object.path.clone(),
                            references: Vec::new(),
                        },
                    );
                }
            }
        }

        for object in objects {
            for symbol in &object.symbols {
                match definitions.get_mut(&symbol.name) {
                    Some(definition) => definition
                        .references
                        .push((object.path.clone(), symbol.line)),
                    None => diagnostics.push(
                        Diagnostic::new(
                            Level::Error,
                            format!("Unresolved external symbol: '{}'", symbol.name),
                        )
                        .with_location(object.path.clone(), symbol.line)
                        .with_code("UNRESOLVED_SYMBOL"),
                    ),
                }
            }
        }

        definitions.into_iter().map(|(_, symbol)| symbol).collect()
    }

    fn converge(
        &self,
        objects: &mut [LinkObject],
        constants: &[(String, i32)],
        diagnostics: &mut Diagnostics,
    ) {
        let mut converged = false;

        for iteration in 1..=K_MAX {
            let global = global_labels(objects);
            let mut sizes_changed = false;

            for object in objects.iter_mut() {
                let handler = self.handler_for(constants, &object.path);
                let previous: Vec<(u32, u32)> = object
                    .records
                    .iter()
                    .map(|record| (record.address, record.size))
                    .collect();

                for record in object.records.iter_mut() {
                    let text = record.text.clone();
                    match classify(&text) {
                        RecordKind::Instruction { mnemonic, operands } => {
                            let instr = match ParsedInstruction::new(
                                mnemonic,
                                &operands,
                                record.line,
                                &text,
                            ) {
                                Ok(instr) => instr,
                                Err(_) => continue,
                            };
                            match encode_instruction(
                                self.set,
                                &self.lookup(),
                                &instr,
                                &EncodeContext::at(record.address, &global),
                            ) {
                                Ok(encoded) => {
                                    let size = encoded.size_bytes();
                                    if size != record.size {
                                        debug!(
                                            text = %text.trim(),
                                            old = record.size,
                                            new = size,
                                            "instruction size changed"
                                        );
                                        sizes_changed = true;
                                    }
                                    record.opcode = encoded.word;
                                    record.size = size;
                                }
                                Err(err) => {
                                    debug!(%err, text = %text.trim(), "keeping previous encoding");
                                }
                            }
                        }
                        RecordKind::Data { mnemonic, rest } => {
                            if let Ok(size) = handler.size_of(mnemonic, rest, &global) {
                                let size = size as u32;
                                if size != record.size {
                                    sizes_changed = true;
                                    record.size = size;
                                }
                            }
                        }
                        RecordKind::Other => {}
                    }
                }

                // Sequential layout; a discontinuity in the previous
                // layout is a deliberate gap and keeps its length.
                for i in 1..object.records.len() {
                    let (prev_old_addr, prev_old_size) = previous[i - 1];
                    let (old_addr, _) = previous[i];
                    let gap = old_addr.saturating_sub(prev_old_addr.wrapping_add(prev_old_size));
                    let prev_end = object.records[i - 1]
                        .address
                        .wrapping_add(object.records[i - 1].size);
                    object.records[i].address = prev_end.wrapping_add(gap);
                }

                reattach_labels(object);
            }

            // The first pass works with the assembler's addresses, which
            // may be stale; require one clean pass on top of it.
            if !sizes_changed && iteration >= 2 {
                info!(iteration, "instruction sizes stabilized");
                converged = true;
                break;
            }
        }

        if !converged {
            warn!(passes = K_MAX, "size optimization did not converge");
            diagnostics.push(
                Diagnostic::new(
                    Level::Warning,
                    format!(
                        "Instruction sizes did not stabilize within {} passes; continuing with the current encoding",
                        K_MAX
                    ),
                )
                .with_code("CONVERGENCE_FAILED"),
            );
        }
    }

    fn reencode_all(&self, objects: &mut [LinkObject], global: &LabelMap) {
        for object in objects.iter_mut() {
            for record in object.records.iter_mut() {
                let text = record.text.clone();
                if let RecordKind::Instruction { mnemonic, operands } = classify(&text) {
                    let instr =
                        match ParsedInstruction::new(mnemonic, &operands, record.line, &text) {
                            Ok(instr) => instr,
                            Err(_) => continue,
                        };
                    if let Ok(encoded) = encode_instruction(
                        self.set,
                        &self.lookup(),
                        &instr,
                        &EncodeContext::at(record.address, global),
                    ) {
                        record.opcode = encoded.word;
                        record.size = encoded.size_bytes();
                    }
                }
            }
        }
    }

    fn emit(
        &self,
        objects: &[LinkObject],
        global: &LabelMap,
        constants: &[(String, i32)],
        diagnostics: &mut Diagnostics,
    ) -> (MemoryImage, LinkStats) {
        let mut image = MemoryImage::new();
        let mut flattened: Vec<(&LinkRecord, &LinkObject)> = objects
            .iter()
            .flat_map(|object| object.records.iter().map(move |record| (record, object)))
            .collect();
        flattened.sort_by_key(|(record, _)| record.address);

        let mut record_count = 0usize;
        for (record, object) in &flattened {
            let bytes = match classify(&record.text) {
                RecordKind::Instruction { .. } => {
                    tasm::word_bytes(self.opts.endianness, record.opcode, record.size)
                }
                RecordKind::Data { mnemonic, rest } => {
                    let handler = self.handler_for(constants, &object.path);
                    match handler.emit(mnemonic, rest, global) {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            diagnostics.push(
                                Diagnostic::new(Level::Error, err.to_string())
                                    .with_location(object.path.clone(), record.line)
                                    .with_code(tasm::directive_error_code(&err)),
                            );
                            continue;
                        }
                    }
                }
                RecordKind::Other => continue,
            };
            record_count += 1;
            if let Err(image::Conflict(address)) = image.write_bytes(record.address, &bytes) {
                diagnostics.push(
                    Diagnostic::new(
                        Level::Abort,
                        format!(
                            "Address conflict at {:#010x}: '{}' overlaps previously emitted bytes",
                            address,
                            record.text.trim()
                        ),
                    )
                    .with_location(object.path.clone(), record.line)
                    .with_code("ADDRESS_CONFLICT"),
                );
                // Emission cannot continue with an inconsistent image.
                break;
            }
        }

        let stats = LinkStats {
            min_address: image.min_address().unwrap_or(0),
            max_address: image.max_address().unwrap_or(0),
            record_count,
        };
        (image, stats)
    }

    fn write_outputs(
        &self,
        result: &LinkOutput,
        output: &Path,
        ls1: Option<&Path>,
    ) -> Result<(), LinkError> {
        let io_err = |err: io::Error, path: &Path| LinkError::Io(err, path.to_owned());

        match self.opts.format {
            OutputFormat::Bin => {
                fs::write(output, result.image.to_binary()).map_err(|e| io_err(e, output))?;
            }
            OutputFormat::Hex => {
                let mut writer = io::BufWriter::new(
                    fs::File::create(output).map_err(|e| io_err(e, output))?,
                );
                output::write_intel_hex(&result.image, &mut writer)
                    .map_err(|e| io_err(e, output))?;
            }
            OutputFormat::Txt => {
                let mut writer = io::BufWriter::new(
                    fs::File::create(output).map_err(|e| io_err(e, output))?,
                );
                output::write_plain_text(&result.objects, &mut writer)
                    .map_err(|e| io_err(e, output))?;
            }
        }

        let map_path = output.with_extension("map");
        let mut writer =
            io::BufWriter::new(fs::File::create(&map_path).map_err(|e| io_err(e, &map_path))?);
        output::write_map(result, &mut writer).map_err(|e| io_err(e, &map_path))?;

        if let Some(ls1_path) = ls1 {
            let ls1_text =
                fs::read_to_string(ls1_path).map_err(|e| io_err(e, ls1_path))?;
            let lst_path = output.with_extension("lst");
            let rewritten =
                output::rewrite_listing(&ls1_text, result, self.opts.endianness);
            fs::write(&lst_path, rewritten).map_err(|e| io_err(e, &lst_path))?;
        }
        Ok(())
    }
}
