//! The `TOBJ` relocatable object file format.
//!
//! All integers are little-endian regardless of the configured output
//! endianness. Layout:
//!
//! ```text
//! "TOBJ" | version u16 | path len u16 | path
//! instr count u32 | { address u32 | opcode u32 | size u8 | line u32
//!                    | text len u16 | text }*
//! label count u32 | { name len u16 | name | address u32 | line u32 }*
//! symbol count u32 | { name len u16 | name | address u32 | line u32 }*
//! const count u32 | { name len u16 | name | value i32 }*
//! ```
//!
//! Labels and constants are serialized in lexicographic name order and
//! instructions in source order, so identical inputs produce identical
//! object files.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::{error, fmt, io};

pub const MAGIC: &[u8; 4] = b"TOBJ";
pub const VERSION: u16 = 0x0001;

/// One assembled instruction or data directive.
///
/// `opcode` holds at most the low four bytes of the encoding; wider data
/// (long `DB` lists, `INCBIN`) is re-synthesized by the linker from
/// `text`, so `size` may exceed four.
#[derive(Clone, Debug, PartialEq)]
pub struct InstrRecord {
    pub address: u32,
    pub opcode: u32,
    pub size: u8,
    pub line: u32,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LabelRecord {
    pub name: String,
    pub address: u32,
    pub line: u32,
}

/// A name referenced before definition; the linker resolves it.
#[derive(Clone, Debug, PartialEq)]
pub struct SymbolRecord {
    pub name: String,
    pub address: u32,
    pub line: u32,
}

/// An `EQU` constant. Kept apart from labels so it is never mistaken for
/// a code address.
#[derive(Clone, Debug, PartialEq)]
pub struct ConstRecord {
    pub name: String,
    pub value: i32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObjectFile {
    pub source_path: String,
    pub instructions: Vec<InstrRecord>,
    pub labels: Vec<LabelRecord>,
    pub symbols: Vec<SymbolRecord>,
    pub constants: Vec<ConstRecord>,
}

impl ObjectFile {
    pub fn new(source_path: impl Into<String>) -> ObjectFile {
        ObjectFile {
            source_path: source_path.into(),
            ..ObjectFile::default()
        }
    }

    pub fn label(&self, name: &str) -> Option<&LabelRecord> {
        self.labels.iter().find(|label| label.name == name)
    }

    pub fn code_size(&self) -> u32 {
        self.instructions.iter().map(|i| u32::from(i.size)).sum()
    }
}

#[derive(Debug)]
pub enum ObjError {
    Io(io::Error),
    BadMagic([u8; 4]),
    UnsupportedVersion(u16),
    InvalidString,
}

impl fmt::Display for ObjError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjError::Io(err) => write!(f, "Object file I/O failed: {}", err),
            ObjError::BadMagic(magic) => {
                write!(f, "Not a TOBJ object file (magic {:02X?})", magic)
            }
            ObjError::UnsupportedVersion(version) => {
                write!(f, "Unsupported object file version {:#06X}", version)
            }
            ObjError::InvalidString => write!(f, "Object file contains invalid UTF-8"),
        }
    }
}

impl error::Error for ObjError {}

impl From<io::Error> for ObjError {
    fn from(err: io::Error) -> ObjError {
        ObjError::Io(err)
    }
}

fn read_string<R: Read>(reader: &mut R) -> Result<String, ObjError> {
    let len = reader.read_u16::<LittleEndian>()?;
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| ObjError::InvalidString)
}

fn write_string<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    writer.write_u16::<LittleEndian>(text.len() as u16)?;
    writer.write_all(text.as_bytes())
}

pub fn read<R: Read>(reader: &mut R) -> Result<ObjectFile, ObjError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(ObjError::BadMagic(magic));
    }
    let version = reader.read_u16::<LittleEndian>()?;
    if version != VERSION {
        return Err(ObjError::UnsupportedVersion(version));
    }

    let source_path = read_string(reader)?;

    let instr_count = reader.read_u32::<LittleEndian>()?;
    let mut instructions = Vec::with_capacity(instr_count as usize);
    for _ in 0..instr_count {
        let address = reader.read_u32::<LittleEndian>()?;
        let opcode = reader.read_u32::<LittleEndian>()?;
        let size = reader.read_u8()?;
        let line = reader.read_u32::<LittleEndian>()?;
        let text = read_string(reader)?;
        instructions.push(InstrRecord {
            address,
            opcode,
            size,
            line,
            text,
        });
    }

    let label_count = reader.read_u32::<LittleEndian>()?;
    let mut labels = Vec::with_capacity(label_count as usize);
    for _ in 0..label_count {
        let name = read_string(reader)?;
        let address = reader.read_u32::<LittleEndian>()?;
        let line = reader.read_u32::<LittleEndian>()?;
        labels.push(LabelRecord {
            name,
            address,
            line,
        });
    }

    let symbol_count = reader.read_u32::<LittleEndian>()?;
    let mut symbols = Vec::with_capacity(symbol_count as usize);
    for _ in 0..symbol_count {
        let name = read_string(reader)?;
        let address = reader.read_u32::<LittleEndian>()?;
        let line = reader.read_u32::<LittleEndian>()?;
        symbols.push(SymbolRecord {
            name,
            address,
            line,
        });
    }

    let const_count = reader.read_u32::<LittleEndian>()?;
    let mut constants = Vec::with_capacity(const_count as usize);
    for _ in 0..const_count {
        let name = read_string(reader)?;
        let value = reader.read_i32::<LittleEndian>()?;
        constants.push(ConstRecord { name, value });
    }

    Ok(ObjectFile {
        source_path,
        instructions,
        labels,
        symbols,
        constants,
    })
}

pub fn write<W: Write>(writer: &mut W, object: &ObjectFile) -> Result<(), ObjError> {
    writer.write_all(MAGIC)?;
    writer.write_u16::<LittleEndian>(VERSION)?;
    write_string(writer, &object.source_path)?;

    writer.write_u32::<LittleEndian>(object.instructions.len() as u32)?;
    for instr in &object.instructions {
        writer.write_u32::<LittleEndian>(instr.address)?;
        writer.write_u32::<LittleEndian>(instr.opcode)?;
        writer.write_u8(instr.size)?;
        writer.write_u32::<LittleEndian>(instr.line)?;
        write_string(writer, &instr.text)?;
    }

    let mut labels: Vec<&LabelRecord> = object.labels.iter().collect();
    labels.sort_by(|a, b| a.name.cmp(&b.name));
    writer.write_u32::<LittleEndian>(labels.len() as u32)?;
    for label in labels {
        write_string(writer, &label.name)?;
        writer.write_u32::<LittleEndian>(label.address)?;
        writer.write_u32::<LittleEndian>(label.line)?;
    }

    writer.write_u32::<LittleEndian>(object.symbols.len() as u32)?;
    for symbol in &object.symbols {
        write_string(writer, &symbol.name)?;
        writer.write_u32::<LittleEndian>(symbol.address)?;
        writer.write_u32::<LittleEndian>(symbol.line)?;
    }

    let mut constants: Vec<&ConstRecord> = object.constants.iter().collect();
    constants.sort_by(|a, b| a.name.cmp(&b.name));
    writer.write_u32::<LittleEndian>(constants.len() as u32)?;
    for constant in constants {
        write_string(writer, &constant.name)?;
        writer.write_i32::<LittleEndian>(constant.value)?;
    }

    Ok(())
}

pub trait ReadTobjExt: Read + Sized {
    fn read_tobj(&mut self) -> Result<ObjectFile, ObjError> {
        read(self)
    }
}

impl<R: Read + Sized> ReadTobjExt for R {}

pub trait WriteTobjExt: Write + Sized {
    fn write_tobj(&mut self, object: &ObjectFile) -> Result<(), ObjError> {
        write(self, object)
    }
}

impl<W: Write + Sized> WriteTobjExt for W {}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<ObjectFile, ObjError> {
    BufReader::new(File::open(path)?).read_tobj()
}

pub fn write_file<P: AsRef<Path>>(path: P, object: &ObjectFile) -> Result<(), ObjError> {
    BufWriter::new(File::create(path)?).write_tobj(object)
}
