#[macro_use]
extern crate clap;

use clap::Arg;
use std::convert::TryFrom;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tasm::{Assembler, AsmError, AsmOptions};
use tricore::{InstructionSet, TableError};
use util::Endianness;

#[derive(Debug)]
enum Error {
    Table(TableError),
    Asm(AsmError),
    BadArgument(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Table(err) => write!(f, "{}", err),
            Error::Asm(err) => write!(f, "{}", err),
            Error::BadArgument(message) => write!(f, "{}", message),
        }
    }
}

fn main() {
    let matches = app_from_crate!()
        .arg(
            Arg::with_name("INPUT")
                .help("Sets the assembly source file to use")
                .required(true)
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
                .help("Sets the object file to write to"),
        )
        .arg(
            Arg::with_name("listing")
                .short("l")
                .long("listing")
                .help("Writes the preliminary listing (.ls1) next to the output"),
        )
        .arg(
            Arg::with_name("org")
                .long("org")
                .takes_value(true)
                .value_name("ADDRESS")
                .help("Sets the initial origin (default 0x80000000)"),
        )
        .arg(
            Arg::with_name("force_32bit")
                .long("force-32bit")
                .help("Only uses 32-bit instruction variants"),
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
                .help("Byte order for data values: little or big"),
        )
        .get_matches();

    let input = matches.value_of("INPUT").unwrap();
    let table = matches.value_of("table").unwrap();
    let output = matches.value_of("output");
    let listing = matches.is_present("listing");
    let org = matches.value_of("org");
    let endianness = matches.value_of("endianness").unwrap();

    let result = run(
        Path::new(input),
        Path::new(table),
        output.map(Path::new),
        listing,
        org,
        endianness,
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
    input: &Path,
    table: &Path,
    output: Option<&Path>,
    listing: bool,
    org: Option<&str>,
    endianness: &str,
    force_32bit: bool,
    no_implicit: bool,
) -> Result<(), Error> {
    let set = InstructionSet::load(table).map_err(Error::Table)?;

    let mut opts = AsmOptions {
        endianness: Endianness::from_str(endianness)
            .map_err(|err| Error::BadArgument(err.to_string()))?,
        force_32bit,
        no_implicit,
        ..AsmOptions::default()
    };
    if let Some(org) = org {
        opts.origin = tricore::parse_numeric(org)
            .ok()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| Error::BadArgument(format!("Invalid origin: '{}'", org)))?;
    }

    let output_path: PathBuf = output
        .map(Path::to_owned)
        .unwrap_or_else(|| input.with_extension("obj"));
    let listing_path = listing.then(|| output_path.with_extension("ls1"));

    let result = Assembler::new(&set, opts)
        .assemble_file(input, &output_path, listing_path.as_deref())
        .map_err(Error::Asm)?;

    for diagnostic in result.diagnostics.iter() {
        eprintln!("{}", diagnostic);
    }
    println!(
        "Assembled {} instruction(s), {} byte(s) of code -> {}",
        result.object.instructions.len(),
        result.object.code_size(),
        output_path.display()
    );
    Ok(())
}
