//! Output format writers: Intel HEX, plain text, map file and the final
//! listing rewrite.

use crate::image::MemoryImage;
use crate::{LinkObject, LinkOutput, LinkRecord};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;
use tasm::listing::{self, LINE_COLUMN, SOURCE_COLUMN};
use util::Endianness;

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

fn sorted_records(objects: &[LinkObject]) -> Vec<(&LinkRecord, &LinkObject)> {
    let mut flattened: Vec<(&LinkRecord, &LinkObject)> = objects
        .iter()
        .flat_map(|object| object.records.iter().map(move |record| (record, object)))
        .collect();
    flattened.sort_by_key(|(record, _)| record.address);
    flattened
}

fn data_record_checksum(count: u8, address: u16, kind: u8, data: &[u8]) -> u8 {
    let mut sum = u32::from(count)
        + u32::from(address >> 8)
        + u32::from(address & 0xFF)
        + u32::from(kind);
    for byte in data {
        sum += u32::from(*byte);
    }
    (sum as u8).wrapping_neg()
}

fn write_hex_record<W: Write>(
    writer: &mut W,
    address: u16,
    kind: u8,
    data: &[u8],
) -> io::Result<()> {
    let count = data.len() as u8;
    write!(writer, ":{:02X}{:04X}{:02X}", count, address, kind)?;
    for byte in data {
        write!(writer, "{:02X}", byte)?;
    }
    writeln!(
        writer,
        "{:02X}",
        data_record_checksum(count, address, kind, data)
    )
}

/// Intel HEX: Extended Linear Address records whenever the high 16
/// address bits change, data records of at most 16 bytes, and the
/// `:00000001FF` terminator.
pub fn write_intel_hex<W: Write>(image: &MemoryImage, writer: &mut W) -> io::Result<()> {
    let mut current_ela: Option<u16> = None;
    let mut start = 0u32;
    let mut pending: Vec<u8> = Vec::with_capacity(16);

    for (address, byte) in image.iter() {
        let ela = (address >> 16) as u16;
        if current_ela != Some(ela) {
            if !pending.is_empty() {
                write_hex_record(writer, start as u16, 0x00, &pending)?;
                pending.clear();
            }
            write_hex_record(writer, 0x0000, 0x04, &ela.to_be_bytes())?;
            current_ela = Some(ela);
        }

        if pending.is_empty() {
            start = address;
        } else if address != start + pending.len() as u32 {
            write_hex_record(writer, start as u16, 0x00, &pending)?;
            pending.clear();
            start = address;
        }
        pending.push(byte);
        if pending.len() == 16 {
            write_hex_record(writer, start as u16, 0x00, &pending)?;
            pending.clear();
        }
    }
    if !pending.is_empty() {
        write_hex_record(writer, start as u16, 0x00, &pending)?;
    }
    writeln!(writer, ":00000001FF")
}

/// One line per record: 8-digit address, two spaces, the opcode at the
/// record's byte width.
pub fn write_plain_text<W: Write>(objects: &[LinkObject], writer: &mut W) -> io::Result<()> {
    for (record, _) in sorted_records(objects) {
        if record.size == 0 {
            continue;
        }
        let digits = (record.size as usize) * 2;
        writeln!(
            writer,
            "{:08X}  {:0digits$X}",
            record.address,
            record.opcode,
            digits = digits
        )?;
    }
    Ok(())
}

/// The map file: memory layout, the global symbol table sorted by name,
/// and summary statistics.
pub fn write_map<W: Write>(result: &LinkOutput, writer: &mut W) -> io::Result<()> {
    writeln!(writer, "Linker Map File")?;
    writeln!(writer, "===============")?;
    writeln!(writer)?;
    writeln!(writer, "Memory Layout:")?;
    writeln!(writer, "--------------")?;
    for (record, object) in sorted_records(&result.objects) {
        if record.size == 0 {
            continue;
        }
        let digits = (record.size.min(4) as usize) * 2;
        writeln!(
            writer,
            "{:#010X}: {:0digits$X}  ; {} ({})",
            record.address,
            record.opcode,
            record.text.trim(),
            file_name(&object.path),
            digits = digits
        )?;
    }

    writeln!(writer)?;
    writeln!(writer, "Global Symbol Table:")?;
    writeln!(writer, "--------------------")?;
    for symbol in &result.symbols {
        writeln!(
            writer,
            "{:<20} {:#010X}  {}",
            symbol.name,
            symbol.address,
            file_name(&symbol.defined_in)
        )?;
        for (path, line) in &symbol.references {
            writeln!(
                writer,
                "{:20}        referenced in {}:{}",
                "",
                file_name(path),
                line
            )?;
        }
    }

    writeln!(writer)?;
    writeln!(writer, "Statistics:")?;
    writeln!(writer, "----------")?;
    writeln!(writer, "Object files processed: {}", result.objects.len())?;
    writeln!(writer, "Records linked: {}", result.stats.record_count)?;
    writeln!(writer, "Symbols resolved: {}", result.symbols.len())?;
    writeln!(writer, "Image bytes: {}", result.image.len())?;
    Ok(())
}

fn code_column(endianness: Endianness, opcode: u32, size: u32) -> String {
    match size {
        2 => listing::format_code(&endianness.u16_bytes(opcode as u16)),
        4 => listing::format_code(&endianness.u32_bytes(opcode)),
        _ => {
            let le = opcode.to_le_bytes();
            let shown = (size.min(4)) as usize;
            let mut code = listing::format_code(&le[..shown]);
            if size > 4 {
                code.push('+');
            }
            code
        }
    }
}

/// Rewrites the preliminary `.ls1` listing with final addresses and
/// opcodes, then appends the symbol table sorted by address.
pub fn rewrite_listing(ls1: &str, result: &LinkOutput, endianness: Endianness) -> String {
    // Line number -> final (address, opcode, size). Line numbers are per
    // source file; with several objects the first definition wins, which
    // matches the single-listing workflow (one .ls1 per link).
    let mut by_line: HashMap<u32, (u32, u32, u32)> = HashMap::new();
    for object in &result.objects {
        for record in &object.records {
            by_line
                .entry(record.line)
                .or_insert((record.address, record.opcode, record.size));
        }
    }

    let mut out = String::new();
    for line in ls1.lines() {
        let rewritten = line
            .get(LINE_COLUMN..LINE_COLUMN + 5)
            .and_then(|column| column.trim().parse::<u32>().ok())
            .and_then(|line_no| by_line.get(&line_no).map(|entry| (line_no, *entry)))
            .map(|(line_no, (address, opcode, size))| {
                let source = line.get(SOURCE_COLUMN..).unwrap_or("");
                format!(
                    "{:08X} {:<12} {:>5}    {}",
                    address,
                    code_column(endianness, opcode, size),
                    line_no,
                    source
                )
            });
        match rewritten {
            Some(row) => out.push_str(row.trim_end()),
            None => out.push_str(line),
        }
        out.push('\n');
    }

    out.push('\n');
    out.push_str("ADDR     LABEL\n");
    let mut by_address: Vec<_> = result.symbols.iter().collect();
    by_address.sort_by_key(|symbol| symbol.address);
    for symbol in by_address {
        out.push_str(&format!("{:08X} {}\n", symbol.address, symbol.name));
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_checksum_matches_the_worked_example() {
        // :020000048000 7A -> 02 + 00 + 00 + 04 + 80 + 00 = 0x86; -0x86 = 0x7A
        assert_eq!(
            data_record_checksum(0x02, 0x0000, 0x04, &[0x80, 0x00]),
            0x7A
        );
    }

    #[test]
    fn extended_linear_address_precedes_high_memory() {
        let mut image = MemoryImage::new();
        image
            .write_bytes(0x8000_0000, &[0x0B, 0x00, 0xC0, 0x01])
            .unwrap();
        let mut out = Vec::new();
        write_intel_hex(&image, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], ":0200000480007A");
        assert_eq!(lines[1], ":040000000B00C00130");
        assert_eq!(lines[2], ":00000001FF");
    }

    #[test]
    fn data_records_break_at_sixteen_bytes() {
        let mut image = MemoryImage::new();
        let data: Vec<u8> = (0u8..20).collect();
        image.write_bytes(0x0000_1000, &data).unwrap();
        let mut out = Vec::new();
        write_intel_hex(&image, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        // ELA 0x0000, then a 16-byte record and a 4-byte record.
        assert!(lines[1].starts_with(":10100000"));
        assert!(lines[2].starts_with(":04101000"));
        assert_eq!(lines[3], ":00000001FF");
    }

    #[test]
    fn every_record_checksums_to_zero_mod_256() {
        let mut image = MemoryImage::new();
        image.write_bytes(0x8000_0000, &[1, 2, 3]).unwrap();
        image.write_bytes(0x8001_0000, &[4]).unwrap();
        let mut out = Vec::new();
        write_intel_hex(&image, &mut out).unwrap();
        for line in String::from_utf8(out).unwrap().lines() {
            let bytes: Vec<u8> = (1..line.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&line[i..i + 2], 16).unwrap())
                .collect();
            let sum: u32 = bytes.iter().map(|b| u32::from(*b)).sum();
            assert_eq!(sum % 256, 0, "record {}", line);
        }
    }
}
