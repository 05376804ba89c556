//! Cross-module tests: variant selection and encoding against a
//! representative slice of the TriCore instruction table.

use crate::encode::{encode_instruction, EncodeContext};
use crate::select::select_variant;
use crate::table::{InstructionSet, LookupOptions};
use crate::{CoreError, LabelMap, ParsedInstruction};

pub fn sample_table() -> InstructionSet {
    InstructionSet::from_json_str(SAMPLE_TABLE_JSON).unwrap()
}

pub const SAMPLE_TABLE_JSON: &str = r#"{
    "instructions": [
        { "opcode": "0x82", "opcode_size": 16, "instruction": "MOV",
          "syntax": "MOV D[a], const4", "operand_count": 2,
          "op1_pos": 8, "op1_len": 4, "op2_pos": 12, "op2_len": 4 },
        { "opcode": "0x02", "opcode_size": 16, "instruction": "MOV",
          "syntax": "MOV D[a], D[b]", "operand_count": 2,
          "op1_pos": 8, "op1_len": 4, "op2_pos": 12, "op2_len": 4 },
        { "opcode": "0xDA", "opcode_size": 16, "instruction": "MOV",
          "syntax": "MOV D[15], const8", "operand_count": 2,
          "op1_pos": 0, "op1_len": 0, "op2_pos": 8, "op2_len": 8 },
        { "opcode": "0x3B", "opcode_size": 32, "instruction": "MOV",
          "syntax": "MOV D[c], const16", "operand_count": 2,
          "op1_pos": 28, "op1_len": 4, "op2_pos": 12, "op2_len": 16 },
        { "opcode": "0xEE", "opcode_size": 16, "instruction": "JNZ",
          "syntax": "JNZ D[15], disp8/2", "operand_count": 2,
          "op1_pos": 0, "op1_len": 0, "op2_pos": 8, "op2_len": 8 },
        { "opcode": "0xF6", "opcode_size": 16, "instruction": "JNZ",
          "syntax": "JNZ D[b], disp4/2", "operand_count": 2,
          "op1_pos": 12, "op1_len": 4, "op2_pos": 8, "op2_len": 4 },
        { "opcode": "0x6C", "opcode_size": 16, "instruction": "ST.W",
          "syntax": "ST.W [A[b]], off4, D[15]", "operand_count": 3,
          "op1_pos": 12, "op1_len": 4, "op2_pos": 8, "op2_len": 4,
          "op3_pos": 0, "op3_len": 0 },
        { "opcode": "0x05000089", "opcode_size": 32, "instruction": "ST.W",
          "syntax": "ST.W [A[b]], off10 {[9:6][5:0]}, D[a]", "operand_count": 4,
          "op1_pos": 12, "op1_len": 4, "op2_pos": 28, "op2_len": 4,
          "op3_pos": 16, "op3_len": 6, "op4_pos": 8, "op4_len": 4 },
        { "opcode": "0x3C", "opcode_size": 16, "instruction": "J",
          "syntax": "J disp8/2", "operand_count": 1,
          "op1_pos": 8, "op1_len": 8 },
        { "opcode": "0x1D", "opcode_size": 32, "instruction": "J",
          "syntax": "J disp24/2 {[15:0],[23:16]}", "operand_count": 2,
          "op1_pos": 16, "op1_len": 16, "op2_pos": 8, "op2_len": 8 },
        { "opcode": "0xFC", "opcode_size": 16, "instruction": "LOOP",
          "syntax": "LOOP A[b], disp4/2", "operand_count": 2,
          "op1_pos": 12, "op1_len": 4, "op2_pos": 8, "op2_len": 4 },
        { "opcode": "0xFD", "opcode_size": 32, "instruction": "LOOP",
          "syntax": "LOOP A[b], disp15/2", "operand_count": 2,
          "op1_pos": 12, "op1_len": 4, "op2_pos": 16, "op2_len": 15 },
        { "opcode": "0xD9", "opcode_size": 32, "instruction": "LEA",
          "syntax": "LEA A[a], A[b], off16 {[9:6][15:10][5:0]}", "operand_count": 5,
          "op1_pos": 8, "op1_len": 4, "op2_pos": 12, "op2_len": 4,
          "op3_pos": 28, "op3_len": 4, "op4_pos": 22, "op4_len": 6,
          "op5_pos": 16, "op5_len": 6 }
    ]
}"#;

fn parse(mnemonic: &str, operands: &str) -> ParsedInstruction {
    let tokens = crate::operand::split_operand_list(operands);
    ParsedInstruction::new(mnemonic, &tokens, 1, &format!("{} {}", mnemonic, operands)).unwrap()
}

fn encode_plain(mnemonic: &str, operands: &str) -> (u32, u32) {
    let set = sample_table();
    let instr = parse(mnemonic, operands);
    let encoded =
        encode_instruction(&set, &LookupOptions::default(), &instr, &EncodeContext::default())
            .unwrap();
    (encoded.word, encoded.size_bytes())
}

fn encode_at(
    mnemonic: &str,
    operands: &str,
    address: u32,
    labels: &LabelMap,
) -> (u32, u32) {
    let set = sample_table();
    let instr = parse(mnemonic, operands);
    let encoded = encode_instruction(
        &set,
        &LookupOptions::default(),
        &instr,
        &EncodeContext::at(address, labels),
    )
    .unwrap();
    (encoded.word, encoded.size_bytes())
}

#[test]
fn mov_const4_versus_register_register() {
    assert_eq!(encode_plain("MOV", "D4, #1"), (0x1482, 2));
    assert_eq!(encode_plain("MOV", "D4, D1"), (0x1402, 2));
}

#[test]
fn fixed_register_variant_wins_for_d15() {
    let set = sample_table();
    let opts = LookupOptions::default();
    let ctx = EncodeContext::default();

    let specific = select_variant(&set, &opts, &parse("MOV", "D15, #5"), &ctx).unwrap();
    assert_eq!(specific.syntax, "MOV D[15], const8");

    let generic = select_variant(&set, &opts, &parse("MOV", "D4, #5"), &ctx).unwrap();
    assert_eq!(generic.syntax, "MOV D[a], const4");
}

#[test]
fn jnz_selects_by_register_specificity() {
    let mut labels = LabelMap::new();
    labels.insert("loop".to_owned(), 0x8000_0006);

    let (word, size) = encode_at("JNZ", "D15, loop", 0x8000_0000, &labels);
    assert_eq!(size, 2);
    assert_eq!(word & 0xFF, 0xEE);
    assert_eq!((word >> 8) & 0xFF, 3); // 6 bytes / 2

    let (word, size) = encode_at("JNZ", "D4, loop", 0x8000_0000, &labels);
    assert_eq!(size, 2);
    assert_eq!(word & 0xFF, 0xF6);
    assert_eq!((word >> 12) & 0xF, 4);
    assert_eq!((word >> 8) & 0xF, 3);
}

#[test]
fn scaled_offset_selects_size() {
    // 40 / 4 = 10 fits the 4-bit slot of the 16-bit form.
    assert_eq!(encode_plain("ST.W", "[A12], 40, D15"), (0xCA6C, 2));

    // 176 / 4 = 44 does not fit 4 bits; the 32-bit split form is used.
    let (word, size) = encode_plain("ST.W", "[A12], 176, D15");
    assert_eq!(size, 4);
    // Base opcode plus A12, split 44 = 0b101100 ([9:6] = 0, [5:0] = 44),
    // and D15 in the last slot.
    let expected = 0x05000089u32 | (12 << 12) | (0 << 28) | (44 << 16) | (15 << 8);
    assert_eq!(word, expected);
}

#[test]
fn split_disp24_fills_windows_in_brace_order() {
    let mut labels = LabelMap::new();
    let pc = 0x8000_0000u32;
    let disp = 2 * 0x12_3456u32;
    labels.insert("far_target".to_owned(), pc + disp);

    let (word, size) = encode_at("J", "far_target", pc, &labels);
    assert_eq!(size, 4);
    assert_eq!(word, 0x1D | (0x3456 << 16) | (0x12 << 8));
}

#[test]
fn forward_reference_prefers_the_largest_variant() {
    let labels = LabelMap::new();
    // `somewhere` is unknown: the placeholder displacement forces the
    // 32-bit J so later passes can only shrink it.
    let (_, size) = encode_at("J", "somewhere", 0x8000_0000, &labels);
    assert_eq!(size, 4);

    // A nearby known target uses the 16-bit form.
    let mut labels = LabelMap::new();
    labels.insert("near".to_owned(), 0x8000_0010);
    let (word, size) = encode_at("J", "near", 0x8000_0000, &labels);
    assert_eq!(size, 2);
    assert_eq!(word, 0x3C | (8 << 8));
}

#[test]
fn negative_displacement_encodes_twos_complement() {
    let mut labels = LabelMap::new();
    labels.insert("back".to_owned(), 0x8000_0000);
    let (word, size) = encode_at("J", "back", 0x8000_0010, &labels);
    assert_eq!(size, 2);
    // -16 bytes / 2 = -8, masked to 8 bits.
    assert_eq!((word >> 8) & 0xFF, 0xF8);
}

#[test]
fn loop_with_unknown_label_reserves_the_wide_form() {
    let labels = LabelMap::new();
    let (_, size) = encode_at("LOOP", "A2, not_yet_defined", 0x8000_0000, &labels);
    assert_eq!(size, 4);
}

#[test]
fn lea_three_window_split() {
    // The byte offset scales by 4 (word-aligned mnemonic); the scaled
    // value 0x1234 is spread over windows [9:6], [15:10], [5:0].
    let (word, size) = encode_plain("LEA", "A4, A5, 0x48D0");
    assert_eq!(size, 4);
    let off = 0x1234u32;
    let expected = 0xD9
        | (4 << 8)
        | (5 << 12)
        | (((off >> 6) & 0xF) << 28)
        | (((off >> 10) & 0x3F) << 22)
        | ((off & 0x3F) << 16);
    assert_eq!(word, expected);
}

#[test]
fn split_round_trip_reconstructs_the_value() {
    let set = sample_table();
    let def = set
        .variants("LEA")
        .iter()
        .find(|d| d.spec.split.is_some())
        .unwrap();
    let split = def.spec.split.as_ref().unwrap();

    for &value in &[0u32, 1, 0x3F, 0x40, 0x1234, 0xFFFF] {
        // Word-scaled slot: feed value * 4 so the encoded quantity is the
        // value itself.
        let instr = parse("LEA", &format!("A4, A5, {}", value * 4));
        let encoded = crate::encode::encode_with(def, &instr, &EncodeContext::default()).unwrap();
        // Decode: pull each destination field back out and reassemble the
        // source value from its windows.
        let mut reconstructed = 0u32;
        let mut dest = def.dest_index(split.slot);
        for &(hi, lo) in &split.windows {
            let (pos, _) = def.operands[dest];
            let width = hi - lo + 1;
            let field = (encoded.word >> pos) & ((1 << width) - 1);
            reconstructed |= field << lo;
            dest += 1;
        }
        assert_eq!(reconstructed, value, "value {:#x}", value);
    }
}

#[test]
fn force_32bit_filters_short_forms() {
    let set = sample_table();
    let opts = LookupOptions {
        force_32bit: true,
        no_implicit: false,
    };
    let def = select_variant(&set, &opts, &parse("MOV", "D4, #1"), &EncodeContext::default())
        .unwrap();
    assert_eq!(def.opcode_size, 32);
}

#[test]
fn out_of_range_reports_slot_width_and_value() {
    let set = sample_table();
    // const16 is the widest MOV immediate; 0x1FFFF cannot fit anywhere.
    let err = encode_instruction(
        &set,
        &LookupOptions::default(),
        &parse("MOV", "D4, 0x1FFFF"),
        &EncodeContext::default(),
    )
    .unwrap_err();
    match err {
        CoreError::OperandOutOfRange { value, width, .. } => {
            assert_eq!(value, 0x1FFFF);
            assert_eq!(width, 16);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn unknown_mnemonic_is_reported() {
    let set = sample_table();
    let err = select_variant(
        &set,
        &LookupOptions::default(),
        &parse("FROB", "D1"),
        &EncodeContext::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::UnknownInstruction { .. }));
}

#[test]
fn arity_mismatch_lists_tried_variants() {
    let set = sample_table();
    let err = select_variant(
        &set,
        &LookupOptions::default(),
        &parse("MOV", "D1, D2, D3"),
        &EncodeContext::default(),
    )
    .unwrap_err();
    match err {
        CoreError::NoVariantMatches { tried, .. } => assert!(tried.is_empty()),
        other => panic!("unexpected error: {:?}", other),
    }
}
