//! Decoded instruction stream

use super::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use super::opcode::Opcode;

/// A single decoded instruction with its operands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instruction {
    /// Any opcode without operands
    Op(Opcode),
    /// `CONST_I32`
    ConstI32(i32),
    /// `CONST_F64`
    ConstF64(f64),
    /// `CONST_STR` with a string pool index
    ConstStr(u32),
    /// `LOAD_LOCAL`
    LoadLocal(u16),
    /// `STORE_LOCAL`
    StoreLocal(u16),
    /// `LOAD_STATIC`
    LoadStatic {
        /// Class index
        class: u32,
        /// Field index within the class
        field: u16,
    },
    /// `STORE_STATIC`
    StoreStatic {
        /// Class index
        class: u32,
        /// Field index within the class
        field: u16,
    },
    /// A jump opcode with its relative offset
    Jump(Opcode, i32),
    /// `CALL`
    Call(u32),
    /// `CALL_NATIVE`
    CallNative {
        /// Native import index
        native: u16,
        /// Number of arguments popped
        argc: u8,
    },
    /// A scheduling or I/O intrinsic that names a callback function
    Intrinsic(Opcode, u32),
}

impl Instruction {
    /// The opcode this instruction encodes to
    pub fn opcode(&self) -> Opcode {
        match *self {
            Self::Op(op) | Self::Jump(op, _) | Self::Intrinsic(op, _) => op,
            Self::ConstI32(_) => Opcode::ConstI32,
            Self::ConstF64(_) => Opcode::ConstF64,
            Self::ConstStr(_) => Opcode::ConstStr,
            Self::LoadLocal(_) => Opcode::LoadLocal,
            Self::StoreLocal(_) => Opcode::StoreLocal,
            Self::LoadStatic { .. } => Opcode::LoadStatic,
            Self::StoreStatic { .. } => Opcode::StoreStatic,
            Self::Call(_) => Opcode::Call,
            Self::CallNative { .. } => Opcode::CallNative,
        }
    }

    /// Decode one instruction at the reader's position
    pub fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        let byte = reader.read_u8()?;
        let op = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, offset))?;
        let instr = match op {
            Opcode::ConstI32 => Self::ConstI32(reader.read_i32()?),
            Opcode::ConstF64 => Self::ConstF64(reader.read_f64()?),
            Opcode::ConstStr => Self::ConstStr(reader.read_u32()?),
            Opcode::LoadLocal => Self::LoadLocal(reader.read_u16()?),
            Opcode::StoreLocal => Self::StoreLocal(reader.read_u16()?),
            Opcode::LoadStatic => Self::LoadStatic {
                class: reader.read_u32()?,
                field: reader.read_u16()?,
            },
            Opcode::StoreStatic => Self::StoreStatic {
                class: reader.read_u32()?,
                field: reader.read_u16()?,
            },
            Opcode::Jmp | Opcode::JmpIfFalse | Opcode::JmpIfTrue => {
                Self::Jump(op, reader.read_i32()?)
            }
            Opcode::Call => Self::Call(reader.read_u32()?),
            Opcode::CallNative => Self::CallNative {
                native: reader.read_u16()?,
                argc: reader.read_u8()?,
            },
            Opcode::TimerAdd | Opcode::TimerEvery | Opcode::MainLoopAdd | Opcode::AsyncRead => {
                Self::Intrinsic(op, reader.read_u32()?)
            }
            _ => Self::Op(op),
        };
        Ok(instr)
    }

    /// Append the encoded form to a writer
    pub fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_u8(self.opcode().to_u8());
        match *self {
            Self::Op(_) => {}
            Self::ConstI32(v) => writer.emit_i32(v),
            Self::ConstF64(v) => writer.emit_f64(v),
            Self::ConstStr(idx) | Self::Call(idx) | Self::Intrinsic(_, idx) => {
                writer.emit_u32(idx)
            }
            Self::LoadLocal(slot) | Self::StoreLocal(slot) => writer.emit_u16(slot),
            Self::LoadStatic { class, field } | Self::StoreStatic { class, field } => {
                writer.emit_u32(class);
                writer.emit_u16(field);
            }
            Self::Jump(_, rel) => writer.emit_i32(rel),
            Self::CallNative { native, argc } => {
                writer.emit_u16(native);
                writer.emit_u8(argc);
            }
        }
    }
}

/// Decode a whole function body into `(offset, instruction)` pairs
pub fn decode_code(code: &[u8]) -> Result<Vec<(usize, Instruction)>, DecodeError> {
    let mut reader = BytecodeReader::new(code);
    let mut out = Vec::new();
    while reader.has_more() {
        let offset = reader.position();
        out.push((offset, Instruction::decode(&mut reader)?));
    }
    Ok(out)
}
