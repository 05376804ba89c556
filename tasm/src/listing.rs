//! The source listing: every source line with its tentative address and
//! encoding. Written as the preliminary `.ls1` file; the linker rewrites
//! it with final addresses into the `.lst` listing.

use std::io::{self, Write};

pub const LISTING_HEADER: &str = "ADDR     CODE          LINE     SOURCE CODE";

/// Column where the line number field starts in a listing row
/// (8-char address, space, 12-char code, space).
pub const LINE_COLUMN: usize = 22;
/// Column where the source text starts.
pub const SOURCE_COLUMN: usize = 31;

#[derive(Clone, Debug, PartialEq)]
pub struct ListingEntry {
    pub line: u32,
    pub address: Option<u32>,
    pub bytes: Option<Vec<u8>>,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceListing {
    pub entries: Vec<ListingEntry>,
}

/// Formats the code column: up to four bytes, `+` marking truncation of
/// longer data.
pub fn format_code(bytes: &[u8]) -> String {
    let shown = bytes.len().min(4);
    let mut code = bytes[..shown]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");
    if bytes.len() > 4 {
        code.push('+');
    }
    code
}

/// Formats one listing row. Blank address/code columns keep their width
/// so the line-number column stays fixed.
pub fn format_row(address: Option<u32>, bytes: Option<&[u8]>, line: u32, text: &str) -> String {
    let addr = match address {
        Some(addr) => format!("{:08X}", addr),
        None => " ".repeat(8),
    };
    let code = bytes.map(format_code).unwrap_or_default();
    format!("{} {:<12} {:>5}    {}", addr, code, line, text)
}

impl SourceListing {
    pub fn push(&mut self, line: u32, address: Option<u32>, text: &str) {
        self.entries.push(ListingEntry {
            line,
            address,
            bytes: None,
            text: text.to_owned(),
        });
    }

    /// Attaches the encoding produced by the second pass to a line.
    pub fn set_encoding(&mut self, line: u32, address: u32, bytes: Vec<u8>) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.line == line) {
            entry.address = Some(address);
            entry.bytes = Some(bytes);
        }
    }

    /// Writes the preliminary listing (`.ls1`).
    pub fn write_ls1<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(writer, "{}", LISTING_HEADER)?;
        for entry in &self.entries {
            writeln!(
                writer,
                "{}",
                format_row(
                    entry.address,
                    entry.bytes.as_deref(),
                    entry.line,
                    &entry.text
                )
                .trim_end()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rows_keep_the_line_column_fixed() {
        let with_addr = format_row(Some(0x8000_0000), Some(&[0x82, 0x14][..]), 3, "MOV D4, #1");
        let without = format_row(None, None, 4, "; comment");
        assert_eq!(&with_addr[LINE_COLUMN..LINE_COLUMN + 5], "    3");
        assert_eq!(&without[LINE_COLUMN..LINE_COLUMN + 5], "    4");
        assert_eq!(&with_addr[SOURCE_COLUMN..], "MOV D4, #1");
    }

    #[test]
    fn long_data_is_truncated_with_a_marker() {
        assert_eq!(format_code(&[1, 2, 3, 4, 5]), "01 02 03 04+");
        assert_eq!(format_code(&[0xAB]), "AB");
    }

    #[test]
    fn ls1_contains_every_source_line() {
        let mut listing = SourceListing::default();
        listing.push(1, None, "; header");
        listing.push(2, Some(0x8000_0000), "MOV D4, #1");
        listing.set_encoding(2, 0x8000_0000, vec![0x82, 0x14]);

        let mut out = Vec::new();
        listing.write_ls1(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], LISTING_HEADER);
        assert!(lines[1].ends_with("; header"));
        assert!(lines[2].starts_with("80000000 82 14"));
    }
}
