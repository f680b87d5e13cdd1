use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};

pub const BITNESS: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub text: String,
    /// Destination of a near call/jmp/jcc
    pub branch_target: Option<u64>,
}

fn near_branch_target(instruction: &Instruction) -> Option<u64> {
    use iced_x86::OpKind::*;
    matches!(instruction.op0_kind(), NearBranch16 | NearBranch32 | NearBranch64)
        .then(|| instruction.near_branch_target())
}

/// Decode `data` as 32-bit code loaded at `address`
pub fn disassemble(data: &[u8], address: u64) -> Vec<Line> {
    let mut decoder = Decoder::with_ip(BITNESS, data, address, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    formatter.options_mut().set_first_operand_char_index(8);

    let mut text = String::new();
    decoder
        .iter()
        .map(|instruction| {
            text.clear();
            formatter.format(&instruction, &mut text);
            let start = (instruction.ip() - address) as usize;
            Line {
                address: instruction.ip(),
                bytes: data[start..start + instruction.len()].to_vec(),
                text: text.clone(),
                branch_target: near_branch_target(&instruction),
            }
        })
        .collect()
}

/// Target of the branch at the start of `data`, if it begins with one
pub fn branch_target(data: &[u8], address: u64) -> Option<u64> {
    let mut decoder = Decoder::with_ip(BITNESS, data, address, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return None;
    }
    near_branch_target(&instruction)
}

/// Plain text listing, one instruction per line
pub fn listing(lines: &[Line]) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    for line in lines {
        let bytes = line
            .bytes
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(out, "{:08x}:  {bytes:<24} {}", line.address, line.text);
    }
    out
}
