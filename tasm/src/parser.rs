//! Line parser for assembler source, built on the [pest] grammar in
//! `asm.pest`.
//!
//! Each source line parses independently into a [`Line`]: an optional
//! label definition plus one statement. Operand tokens are raw text; the
//! core's operand module normalizes them.
//!
//! [pest]: https://docs.rs/pest/

use pest::Parser;
use pest_derive::Parser;

#[derive(Parser)]
#[grammar = "asm.pest"]
pub struct AsmParser;

pub type ParseError = pest::error::Error<Rule>;

#[derive(Clone, Debug, PartialEq)]
pub struct Line<'i> {
    pub label: Option<&'i str>,
    pub stmt: Stmt<'i>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt<'i> {
    /// Blank line, comment, or label-only line.
    Empty,
    /// `.ORG <address>`
    Org { arg: &'i str },
    /// `<name> EQU <value>`
    Equ { name: &'i str, value: &'i str },
    /// An instruction or data directive.
    Operation {
        mnemonic: &'i str,
        operands: Vec<String>,
        /// The raw operand region, for directives that re-parse it
        /// themselves (`TIMES`, `INCBIN`).
        rest: &'i str,
    },
}

impl<'i> Stmt<'i> {
    pub fn is_empty(&self) -> bool {
        matches!(self, Stmt::Empty)
    }
}

/// Start index of a trailing GCC annotation (`#name` with an alphabetic
/// name is metadata, `#5` is an immediate).
fn annotation_start(text: &str) -> Option<usize> {
    let idx = text.rfind('#')?;
    let tail = &text[idx + 1..];
    let mut chars = tail.chars();
    let first = chars.next()?;
    let is_annotation = (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    let at_boundary = idx == 0
        || text[..idx]
            .chars()
            .last()
            .map(|c| c.is_whitespace() || c == ',')
            .unwrap_or(true);
    if is_annotation && at_boundary {
        Some(idx)
    } else {
        None
    }
}

/// Strips a trailing GCC annotation (`ret #function`) from the operand
/// list.
fn strip_trailing_annotation(operands: &mut Vec<String>) {
    let stripped = operands
        .last()
        .and_then(|last| annotation_start(last).map(|idx| last[..idx].trim().to_owned()));
    match stripped {
        Some(text) if text.is_empty() => {
            operands.pop();
        }
        Some(text) => {
            if let Some(last) = operands.last_mut() {
                *last = text;
            }
        }
        None => {}
    }
}

/// Parses one source line.
pub fn parse_line(input: &str) -> Result<Line, Box<ParseError>> {
    let mut pairs = AsmParser::parse(Rule::line, input).map_err(Box::new)?;
    let line_pair = pairs.next().expect("line rule always produces a pair");

    let mut label = None;
    let mut stmt = Stmt::Empty;

    for pair in line_pair.into_inner() {
        match pair.as_rule() {
            Rule::line_marker | Rule::EOI => {}
            Rule::label_def => {
                label = Some(pair.into_inner().next().unwrap().as_str());
            }
            Rule::equ => {
                let mut name = "";
                let mut value = "";
                for inner in pair.into_inner() {
                    match inner.as_rule() {
                        Rule::equ_name => name = inner.as_str(),
                        Rule::operand => value = inner.as_str().trim(),
                        Rule::equ_kw => {}
                        other => unreachable!("unexpected rule {:?} in equ", other),
                    }
                }
                stmt = Stmt::Equ { name, value };
            }
            Rule::org => {
                let arg = pair
                    .into_inner()
                    .find(|p| p.as_rule() == Rule::operand)
                    .unwrap()
                    .as_str()
                    .trim();
                stmt = Stmt::Org { arg };
            }
            Rule::operation => {
                let operation_text = pair.as_str();
                let mut inner = pair.into_inner();
                let mnemonic = inner.next().unwrap().as_str();
                let rest = operation_text[mnemonic.len()..].trim();
                let mut operands: Vec<String> = inner
                    .map(|p| p.as_str().trim().to_owned())
                    .filter(|s| !s.is_empty())
                    .collect();
                strip_trailing_annotation(&mut operands);
                stmt = Stmt::Operation {
                    mnemonic,
                    operands,
                    rest,
                };
            }
            _ => unreachable!("unexpected rule {:?}", pair.as_rule()),
        }
    }

    Ok(Line { label, stmt })
}

#[cfg(test)]
mod test {
    use super::*;
    use matches::assert_matches;

    fn operation(input: &str) -> (String, Vec<String>) {
        match parse_line(input).unwrap().stmt {
            Stmt::Operation {
                mnemonic, operands, ..
            } => (mnemonic.to_owned(), operands),
            other => panic!("expected operation, got {:?}", other),
        }
    }

    #[test]
    fn blank_and_comment_lines_are_empty() {
        assert_eq!(parse_line("").unwrap().stmt, Stmt::Empty);
        assert_eq!(parse_line("   ").unwrap().stmt, Stmt::Empty);
        assert_eq!(parse_line("; just a comment").unwrap().stmt, Stmt::Empty);
        assert_eq!(parse_line("# 670 \"file.c\" 1").unwrap().stmt, Stmt::Empty);
    }

    #[test]
    fn label_with_and_without_statement() {
        let line = parse_line("loop:").unwrap();
        assert_eq!(line.label, Some("loop"));
        assert!(line.stmt.is_empty());

        let line = parse_line("loop: MOV d4, 1").unwrap();
        assert_eq!(line.label, Some("loop"));
        assert_matches!(line.stmt, Stmt::Operation { .. });
    }

    #[test]
    fn numeric_local_labels_parse() {
        let line = parse_line("1: JNZ d4, 1b ; spin").unwrap();
        assert_eq!(line.label, Some("1"));
    }

    #[test]
    fn operands_split_on_top_level_commas() {
        let (mnemonic, operands) = operation("ST.W [A12], 40, D15");
        assert_eq!(mnemonic, "ST.W");
        assert_eq!(operands, vec!["[A12]", "40", "D15"]);
    }

    #[test]
    fn bracketed_commas_stay_together() {
        let (_, operands) = operation("LD.W d1, [a2, 4]");
        assert_eq!(operands, vec!["d1", "[a2, 4]"]);
    }

    #[test]
    fn quoted_strings_keep_commas_and_semicolons() {
        let (_, operands) = operation("DB \"Hi, there; ok\", 0");
        assert_eq!(operands, vec!["\"Hi, there; ok\"", "0"]);
    }

    #[test]
    fn comment_after_operands_is_dropped() {
        let (_, operands) = operation("MOV d4, 1 ; init counter");
        assert_eq!(operands, vec!["d4", "1"]);
    }

    #[test]
    fn org_and_equ_statements() {
        assert_eq!(
            parse_line(".ORG 0x80000000").unwrap().stmt,
            Stmt::Org { arg: "0x80000000" }
        );
        assert_eq!(
            parse_line("STACK_SIZE EQU 0x100").unwrap().stmt,
            Stmt::Equ {
                name: "STACK_SIZE",
                value: "0x100"
            }
        );
    }

    #[test]
    fn equ_is_case_insensitive_but_bounded() {
        assert_matches!(parse_line("size equ 16").unwrap().stmt, Stmt::Equ { .. });
        // EQUAL is a mnemonic, not an EQU statement.
        assert_matches!(
            parse_line("x EQUAL y").unwrap().stmt,
            Stmt::Operation { .. }
        );
    }

    #[test]
    fn trailing_gcc_annotation_is_stripped() {
        let (_, operands) = operation("ret #outbound_Assembly");
        assert!(operands.is_empty());

        let (_, operands) = operation("add d2, d1 #frame_setup");
        assert_eq!(operands, vec!["d2", "d1"]);

        // A numeric immediate is not an annotation.
        let (_, operands) = operation("mov d2, #5");
        assert_eq!(operands, vec!["d2", "#5"]);
    }

    #[test]
    fn times_rest_is_preserved_verbatim() {
        match parse_line("TIMES 4 DB 0xAA, 0xBB").unwrap().stmt {
            Stmt::Operation { mnemonic, rest, .. } => {
                assert_eq!(mnemonic, "TIMES");
                assert_eq!(rest, "4 DB 0xAA, 0xBB");
            }
            other => panic!("expected operation, got {:?}", other),
        }
    }
}
