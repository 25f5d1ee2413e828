use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, OpKind};

use crate::{DecodeError, DecodedInstruction, Operand, OperandKind};

/// Longest possible x86 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Decode the single instruction at the start of `data`.
pub fn decode(
    bitness: u32,
    data: &[u8],
    address: usize,
) -> Result<DecodedInstruction, DecodeError> {
    let data = &data[..data.len().min(MAX_INSTRUCTION_LEN)];
    let instruction =
        Decoder::with_ip(bitness, data, address as u64, DecoderOptions::NONE).decode();
    if instruction.is_invalid() {
        return Err(DecodeError::Invalid(address));
    }
    Ok(DecodedInstruction {
        address,
        length: instruction.len(),
        operands: (0..instruction.op_count())
            .map(|i| operand(&instruction, i))
            .collect(),
    })
}

fn operand(instruction: &Instruction, i: u32) -> Operand {
    let kind = instruction.op_kind(i);
    match kind {
        OpKind::Register => Operand {
            kind: OperandKind::Register,
            value: instruction.op_register(i) as u64,
        },
        OpKind::Immediate8
        | OpKind::Immediate8_2nd
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => {
            let value = instruction.immediate(i);
            // sign extended immediates take the width of the operand they feed
            let value = match kind {
                OpKind::Immediate8to16 => value & 0xffff,
                OpKind::Immediate8to32 => value & 0xffff_ffff,
                _ => value,
            };
            Operand {
                kind: OperandKind::Immediate,
                value,
            }
        }
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => Operand {
            kind: OperandKind::Branch,
            value: instruction.near_branch_target(),
        },
        OpKind::FarBranch16 => Operand {
            kind: OperandKind::Branch,
            value: instruction.far_branch16() as u64,
        },
        OpKind::FarBranch32 => Operand {
            kind: OperandKind::Branch,
            value: instruction.far_branch32() as u64,
        },
        _ => Operand {
            kind: OperandKind::Memory,
            value: instruction.memory_displacement64(),
        },
    }
}

/// Start of the last instruction beginning before `address` when decoding linearly from
/// `start`, the first byte of `data`.
pub fn previous_head(bitness: u32, data: &[u8], start: usize, address: usize) -> Option<usize> {
    let mut decoder = Decoder::with_ip(bitness, data, start as u64, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut previous = None;
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.ip() >= address as u64 {
            break;
        }
        previous = Some(instruction.ip() as usize);
    }
    previous
}

/// Whether the function occupying all of `data` is a single jump to somewhere else.
pub fn is_thunk(bitness: u32, data: &[u8], address: usize) -> bool {
    let instruction =
        Decoder::with_ip(bitness, data, address as u64, DecoderOptions::NONE).decode();
    !instruction.is_invalid()
        && instruction.len() == data.len()
        && matches!(
            instruction.flow_control(),
            FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
        )
}
