#[macro_use]
extern crate clap;

use clap::Arg;
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tlink::{LinkError, LinkOptions, Linker, OutputFormat};
use tricore::{InstructionSet, TableError};
use util::Endianness;

#[derive(Debug)]
enum Error {
    Table(TableError),
    Link(LinkError),
    BadArgument(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Table(err) => write!(f, "{}", err),
            Error::Link(err) => write!(f, "{}", err),
            Error::BadArgument(message) => write!(f, "{}", message),
        }
    }
}

fn main() {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("OBJECTS")
                .help("Sets the object files to link, in placement order")
                .required(true)
                .multiple(true)
                .index(1),
        )
        .arg(
            Arg::with_name("table")
                .short("t")
                .long("table")
                .takes_value(true)
                .value_name("TABLE")
                .required(true)
                .help("Sets the instruction table file (.json or .csv)"),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .takes_value(true)
                .value_name("OUTPUT")
                .required(true)
                .help("Sets the output file to write to"),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .takes_value(true)
                .value_name("FORMAT")
                .default_value("bin")
                .help("Output format: bin, hex or txt"),
        )
        .arg(
            Arg::with_name("base")
                .short("b")
                .long("base")
                .takes_value(true)
                .value_name("ADDRESS")
                .default_value("0x80000000")
                .help("Base address objects are relocated to"),
        )
        .arg(
            Arg::with_name("listing")
                .short("l")
                .long("listing")
                .takes_value(true)
                .value_name("LS1")
                .help("Preliminary listing to rewrite into the final .lst"),
        )
        .arg(
            Arg::with_name("force_32bit")
                .long("force-32bit")
                .help("Only uses 32-bit instruction variants when re-encoding"),
        )
        .arg(
            Arg::with_name("no_implicit")
                .long("no-implicit")
                .help("Disables implicit A[10]/A[15] instruction variants"),
        )
        .arg(
            Arg::with_name("endianness")
                .short("e")
                .long("endianness")
                .takes_value(true)
                .value_name("ORDER")
                .default_value("little")
                .help("Byte order of the memory image: little or big"),
        )
        .get_matches();

    let objects: Vec<PathBuf> = matches
        .values_of("OBJECTS")
        .unwrap()
        .map(PathBuf::from)
        .collect();
    let result = run(
        &objects,
        Path::new(matches.value_of("table").unwrap()),
        Path::new(matches.value_of("output").unwrap()),
        matches.value_of("format").unwrap(),
        matches.value_of("base").unwrap(),
        matches.value_of("listing").map(Path::new),
        matches.value_of("endianness").unwrap(),
        matches.is_present("force_32bit"),
        matches.is_present("no_implicit"),
    );

    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    objects: &[PathBuf],
    table: &Path,
    output: &Path,
    format: &str,
    base: &str,
    listing: Option<&Path>,
    endianness: &str,
    force_32bit: bool,
    no_implicit: bool,
) -> Result<(), Error> {
    let set = InstructionSet::load(table).map_err(Error::Table)?;

    let opts = LinkOptions {
        base_address: tricore::parse_numeric(base)
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::BadArgument(format!("Invalid base address: '{}'", base)))?,
        format: OutputFormat::from_str(format)
            .map_err(|err| Error::BadArgument(err.to_string()))?,
        endianness: Endianness::from_str(endianness)
            .map_err(|err| Error::BadArgument(err.to_string()))?,
        force_32bit,
        no_implicit,
    };

    let result = Linker::new(&set, opts)
        .link_files(objects, output, listing)
        .map_err(Error::Link)?;

    for diagnostic in result.diagnostics.iter() {
        eprintln!("{}", diagnostic);
    }
    println!(
        "Linked {} record(s), memory range {:#010X}..{:#010X} -> {}",
        result.stats.record_count,
        result.stats.min_address,
        result.stats.max_address,
        output.display()
    );
    Ok(())
}
