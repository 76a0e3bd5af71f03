//! Minimal SPIR-V word-stream patching for analysis passes.
//!
//! No semantic recompilation: the module is walked instruction by
//! instruction and individual operand words are rewritten in place, so a
//! patched module differs from the original only in the targeted words.

use crate::error::ReplayError;

/// SPIR-V magic number in native word order.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Words before the first instruction: magic, version, generator, bound,
/// schema.
const HEADER_WORDS: usize = 5;

const OP_CONSTANT: u16 = 43;
const OP_DECORATE: u16 = 71;
const DECORATION_DESCRIPTOR_SET: u32 = 34;

/// Reinterpret a raw byte stream as SPIR-V words, validating length and
/// magic. Byte-swapped modules are rejected rather than converted.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>, ReplayError> {
    if bytes.len() % 4 != 0 {
        return Err(ReplayError::InvalidSpirv(format!(
            "byte length {} is not word aligned",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words.len() < HEADER_WORDS {
        return Err(ReplayError::InvalidSpirv(format!(
            "{} words is shorter than the module header",
            words.len()
        )));
    }
    if words[0] != SPIRV_MAGIC {
        return Err(ReplayError::InvalidSpirv(format!(
            "bad magic {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// Iterate instruction boundaries: yields (opcode, operand word range).
fn instructions(words: &[u32]) -> impl Iterator<Item = (u16, std::ops::Range<usize>)> + '_ {
    let mut offset = HEADER_WORDS;
    std::iter::from_fn(move || {
        if offset >= words.len() {
            return None;
        }
        let first = words[offset];
        let opcode = (first & 0xFFFF) as u16;
        let word_count = (first >> 16) as usize;
        if word_count == 0 || offset + word_count > words.len() {
            // Malformed tail; stop rather than walk out of bounds
            return None;
        }
        let operands = offset + 1..offset + word_count;
        offset += word_count;
        Some((opcode, operands))
    })
}

/// Verify the instruction stream is walkable end to end.
pub fn validate(words: &[u32]) -> Result<(), ReplayError> {
    let mut offset = HEADER_WORDS;
    for (_, range) in instructions(words) {
        offset = range.end;
    }
    if offset != words.len() {
        return Err(ReplayError::InvalidSpirv(format!(
            "instruction stream ends at word {offset} of {}",
            words.len()
        )));
    }
    Ok(())
}

/// Rewrite every 32-bit `OpConstant` whose value is `old` to `new`.
/// Returns the number of constants patched.
///
/// OpConstant layout: result-type, result-id, value words. Only
/// single-word values are considered; wider constants are left alone.
pub fn patch_constant_u32(words: &mut [u32], old: u32, new: u32) -> usize {
    let targets: Vec<usize> = instructions(words)
        .filter(|(opcode, range)| {
            *opcode == OP_CONSTANT && range.len() == 3 && words[range.start + 2] == old
        })
        .map(|(_, range)| range.start + 2)
        .collect();
    for index in &targets {
        words[*index] = new;
    }
    targets.len()
}

/// Rewrite every `OpDecorate ... DescriptorSet old` to `new`. Returns the
/// number of decorations patched. Used to relocate analysis resources
/// into a set index the captured application never touches.
///
/// OpDecorate layout: target-id, decoration, decoration operands.
pub fn patch_descriptor_set(words: &mut [u32], old: u32, new: u32) -> usize {
    let targets: Vec<usize> = instructions(words)
        .filter(|(opcode, range)| {
            *opcode == OP_DECORATE
                && range.len() == 3
                && words[range.start + 1] == DECORATION_DESCRIPTOR_SET
                && words[range.start + 2] == old
        })
        .map(|(_, range)| range.start + 2)
        .collect();
    for index in &targets {
        words[*index] = new;
    }
    targets.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(instruction_words: &[u32]) -> Vec<u32> {
        let mut words = vec![SPIRV_MAGIC, 0x0001_0600, 0, 100, 0];
        words.extend_from_slice(instruction_words);
        words
    }

    fn op(opcode: u16, operands: &[u32]) -> Vec<u32> {
        let mut words = vec![((operands.len() as u32 + 1) << 16) | opcode as u32];
        words.extend_from_slice(operands);
        words
    }

    #[test]
    fn bytes_round_trip_and_magic_gate() {
        let words = module(&[]);
        let bytes = words_to_bytes(&words);
        assert_eq!(words_from_bytes(&bytes).unwrap(), words);

        let mut bad = bytes.clone();
        bad[3] = 0xFF;
        assert!(matches!(
            words_from_bytes(&bad),
            Err(ReplayError::InvalidSpirv(_))
        ));
        assert!(matches!(
            words_from_bytes(&bytes[..5]),
            Err(ReplayError::InvalidSpirv(_))
        ));
    }

    #[test]
    fn constant_patch_targets_exact_value() {
        // %c1 = OpConstant %u32 7, %c2 = OpConstant %u32 9
        let mut words = module(
            &[op(OP_CONSTANT, &[1, 2, 7]), op(OP_CONSTANT, &[1, 3, 9])].concat(),
        );
        assert_eq!(patch_constant_u32(&mut words, 7, 42), 1);
        assert_eq!(words[HEADER_WORDS + 3], 42);
        // The other constant is untouched
        assert_eq!(words[HEADER_WORDS + 7], 9);
        validate(&words).unwrap();
    }

    #[test]
    fn descriptor_set_patch_ignores_other_decorations() {
        const DECORATION_BINDING: u32 = 33;
        let mut words = module(
            &[
                op(OP_DECORATE, &[5, DECORATION_DESCRIPTOR_SET, 0]),
                op(OP_DECORATE, &[5, DECORATION_BINDING, 0]),
            ]
            .concat(),
        );
        assert_eq!(patch_descriptor_set(&mut words, 0, 7), 1);
        assert_eq!(words[HEADER_WORDS + 3], 7);
        // Binding decoration with the same operand value untouched
        assert_eq!(words[HEADER_WORDS + 7], 0);
    }

    #[test]
    fn truncated_instruction_fails_validation() {
        // Claims 4 words but only 2 remain
        let words = module(&[(4 << 16) | OP_CONSTANT as u32, 1]);
        assert!(matches!(validate(&words), Err(ReplayError::InvalidSpirv(_))));
    }
}
