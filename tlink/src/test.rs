//! Linker integration tests: objects are produced with the real
//! assembler, then linked in memory.

use crate::{LinkError, LinkOptions, Linker};
use tasm::{Assembler, AsmOptions};
use tobjfile::ObjectFile;
use tricore::InstructionSet;
use util::Endianness;

const TEST_TABLE_JSON: &str = r#"{
    "instructions": [
        { "opcode": "0x82", "opcode_size": 16, "instruction": "MOV",
          "syntax": "MOV D[a], const4", "operand_count": 2,
          "op1_pos": 8, "op1_len": 4, "op2_pos": 12, "op2_len": 4 },
        { "opcode": "0x3B", "opcode_size": 32, "instruction": "MOV",
          "syntax": "MOV D[c], const16", "operand_count": 2,
          "op1_pos": 28, "op1_len": 4, "op2_pos": 12, "op2_len": 16 },
        { "opcode": "0x3C", "opcode_size": 16, "instruction": "J",
          "syntax": "J disp8/2", "operand_count": 1,
          "op1_pos": 8, "op1_len": 8 },
        { "opcode": "0x1D", "opcode_size": 32, "instruction": "J",
          "syntax": "J disp24/2 {[15:0],[23:16]}", "operand_count": 2,
          "op1_pos": 16, "op1_len": 16, "op2_pos": 8, "op2_len": 8 }
    ]
}"#;

fn table() -> InstructionSet {
    InstructionSet::from_json_str(TEST_TABLE_JSON).unwrap()
}

fn assemble(set: &InstructionSet, name: &str, source: &str) -> ObjectFile {
    Assembler::new(set, AsmOptions::default())
        .assemble_source(source, name)
        .unwrap()
        .object
}

fn link(set: &InstructionSet, objects: Vec<ObjectFile>) -> crate::LinkOutput {
    Linker::new(set, LinkOptions::default())
        .link_objects(objects)
        .unwrap()
}

#[test]
fn forward_jump_shrinks_and_labels_follow() {
    let set = table();
    let object = assemble(
        &set,
        "a.asm",
        "    J finish\n    MOV D4, #1\nfinish:\n    MOV D4, #2\n",
    );
    let result = link(&set, vec![object]);

    // After convergence the jump is short and `finish` tracks the moved
    // instruction.
    let finish = result
        .symbols
        .iter()
        .find(|s| s.name == "finish")
        .unwrap();
    assert_eq!(finish.address, 0x8000_0004);
    assert_eq!(
        result.image.to_binary(),
        vec![0x3C, 0x02, 0x82, 0x14, 0x82, 0x24]
    );
}

#[test]
fn two_objects_resolve_each_other() {
    let set = table();
    let a = assemble(&set, "a.asm", "foo:\n    MOV D4, #1\n    J bar\n");
    let b = assemble(&set, "b.asm", "bar:\n    MOV D4, #2\n    J foo\n");
    let result = link(&set, vec![a, b]);

    let foo = result.symbols.iter().find(|s| s.name == "foo").unwrap();
    let bar = result.symbols.iter().find(|s| s.name == "bar").unwrap();
    assert_eq!(foo.address, 0x8000_0000);
    assert_eq!(foo.defined_in, "a.asm");
    assert_eq!(bar.defined_in, "b.asm");
    assert_eq!(bar.references, vec![("a.asm".to_owned(), 3)]);

    // The cross jumps were reserved wide by each assembler and shrink to
    // the short form here; objects keep their placement, so the two bytes
    // object A no longer needs stay as a zero gap.
    assert_eq!(bar.address, 0x8000_0006);
    assert_eq!(
        result.image.to_binary(),
        vec![0x82, 0x14, 0x3C, 0x02, 0x00, 0x00, 0x82, 0x24, 0x3C, 0xFC]
    );
}

#[test]
fn org_gaps_survive_linking() {
    let set = table();
    let object = assemble(
        &set,
        "a.asm",
        "    MOV D4, #1\n.ORG 0x80000010\n    MOV D4, #2\n",
    );
    let result = link(&set, vec![object]);

    let binary = result.image.to_binary();
    assert_eq!(binary.len(), 0x12);
    assert_eq!(&binary[..2], &[0x82, 0x14]);
    assert!(binary[2..0x10].iter().all(|b| *b == 0));
    assert_eq!(&binary[0x10..], &[0x82, 0x24]);
}

#[test]
fn big_endian_image_swaps_instruction_bytes() {
    let set = table();
    let object = {
        let opts = AsmOptions {
            endianness: Endianness::Big,
            ..AsmOptions::default()
        };
        Assembler::new(&set, opts)
            .assemble_source("MOV D4, #1\n", "a.asm")
            .unwrap()
            .object
    };
    let opts = LinkOptions {
        endianness: Endianness::Big,
        ..LinkOptions::default()
    };
    let result = Linker::new(&set, opts).link_objects(vec![object]).unwrap();
    assert_eq!(result.image.to_binary(), vec![0x14, 0x82]);
}

#[test]
fn relinking_is_deterministic() {
    let set = table();
    let source = "start:\n    MOV D4, #1\n    J start\n";
    let first = link(&set, vec![assemble(&set, "a.asm", source)]);
    let second = link(&set, vec![assemble(&set, "a.asm", source)]);
    assert_eq!(first.image.to_binary(), second.image.to_binary());
    assert_eq!(first.symbols, second.symbols);
}

#[test]
fn multiply_defined_symbols_fail_the_link() {
    let set = table();
    let a = assemble(&set, "a.asm", "common:\n    MOV D4, #1\n");
    let b = assemble(&set, "b.asm", "common:\n    MOV D4, #2\n");
    match Linker::new(&set, LinkOptions::default()).link_objects(vec![a, b]) {
        Err(LinkError::Failed(diagnostics)) => {
            assert!(diagnostics
                .iter()
                .any(|d| d.code == Some("MULTIPLY_DEFINED")));
        }
        other => panic!("expected failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn unresolved_symbols_are_collected_before_failing() {
    let set = table();
    let object = assemble(&set, "a.asm", "    J nowhere\n    J elsewhere\n");
    match Linker::new(&set, LinkOptions::default()).link_objects(vec![object]) {
        Err(LinkError::Failed(diagnostics)) => {
            let unresolved: Vec<_> = diagnostics
                .iter()
                .filter(|d| d.code == Some("UNRESOLVED_SYMBOL"))
                .collect();
            assert_eq!(unresolved.len(), 2);
        }
        other => panic!("expected failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn data_directives_resynthesize_at_emit_time() {
    let set = table();
    let object = assemble(
        &set,
        "a.asm",
        "SIZE EQU 3\nblob:\n    DB 1, 2, \"hi\"\n    RESB SIZE\nend_mark:\n    MOV D4, #1\n",
    );
    let result = link(&set, vec![object]);
    let binary = result.image.to_binary();
    // DB bytes, three reserved zero bytes, then the instruction.
    assert_eq!(
        binary,
        vec![1, 2, b'h', b'i', 0, 0, 0, 0x82, 0x14]
    );
    let end_mark = result
        .symbols
        .iter()
        .find(|s| s.name == "end_mark")
        .unwrap();
    assert_eq!(end_mark.address, 0x8000_0007);
}

#[test]
fn hex_output_for_a_high_base_address() {
    let set = table();
    let object = assemble(&set, "a.asm", "MOV D4, 0x1234\n");
    let result = link(&set, vec![object]);

    let mut out = Vec::new();
    crate::output::write_intel_hex(&result.image, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], ":0200000480007A");
    assert!(lines[1].starts_with(":04000000"));
    assert_eq!(lines.last().copied(), Some(":00000001FF"));
}
