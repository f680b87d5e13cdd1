use std::ops::Range;

use colored::{ColoredString, Colorize};
use iced_x86::{
    Decoder, DecoderOptions, Formatter, FormatterOutput, FormatterTextKind, IntelFormatter,
};
use resopatch::disassemble::BITNESS;

#[derive(Default)]
struct Output {
    pub buffer: String,
}

impl FormatterOutput for Output {
    fn write(&mut self, text: &str, kind: FormatterTextKind) {
        #[allow(clippy::unnecessary_to_owned)]
        self.buffer.push_str(&get_color(text, kind).to_string());
    }
}

/// Coloured listing of `data` loaded at `address`. Bytes inside `slots` (relative to the
/// start of `data`) are highlighted and branch targets are annotated with `label`.
pub(crate) fn disassemble_bytes<F>(
    title: &str,
    address: u32,
    data: &[u8],
    slots: &[Range<usize>],
    label: F,
) -> String
where
    F: Fn(u32) -> Option<String>,
{
    let mut output = Output::default();

    output.buffer.push_str(&format!(
        "{:08x} - {:08x} = {}\n\n",
        address,
        address as usize + data.len(),
        title.bright_yellow(),
    ));

    let mut formatter = IntelFormatter::new();
    formatter.options_mut().set_first_operand_char_index(8);
    for instruction in Decoder::with_ip(BITNESS, data, address as u64, DecoderOptions::NONE) {
        output
            .buffer
            .push_str(&format!("{:08x}:  ", instruction.ip()));

        let index = (instruction.ip() - address as u64) as usize;
        for (i, b) in data[index..index + instruction.len()].iter().enumerate() {
            let s = format!("{b:02x}");
            let colored = if slots.iter().any(|slot| slot.contains(&(index + i))) {
                s.bright_white()
            } else {
                s.bright_black()
            };
            #[allow(clippy::unnecessary_to_owned)]
            output.buffer.push_str(&colored.to_string());
            output.buffer.push(' ');
        }

        for _ in 0..8usize.saturating_sub(instruction.len()) {
            output.buffer.push_str("   ");
        }

        formatter.format(&instruction, &mut output);

        if let Some(target) =
            resopatch::disassemble::branch_target(&data[index..], instruction.ip())
        {
            if let Some(name) = label(target as u32) {
                #[allow(clippy::unnecessary_to_owned)]
                output
                    .buffer
                    .push_str(&format!(" ; {}", name.bright_yellow()));
            }
        }
        output.buffer.push('\n');
    }
    output.buffer
}

fn get_color(s: &str, kind: FormatterTextKind) -> ColoredString {
    match kind {
        FormatterTextKind::Directive | FormatterTextKind::Keyword => s.bright_yellow(),
        FormatterTextKind::Prefix | FormatterTextKind::Mnemonic => s.bright_red(),
        FormatterTextKind::Register => s.bright_blue(),
        FormatterTextKind::Number => s.bright_cyan(),
        _ => s.white(),
    }
}
