//! Bytecode opcodes for the Vessel VM

/// Bytecode opcode enumeration
///
/// Every opcode is a single byte, optionally followed by fixed-size operands
/// (see [`Opcode::operand_size`]).
///
/// Opcodes are organized into categories:
/// - 0x00-0x0F: Stack manipulation
/// - 0x10-0x1F: Constants
/// - 0x20-0x2F: Locals and statics
/// - 0x30-0x3F: Arithmetic and conversions
/// - 0x40-0x4F: Comparison, logic and strings
/// - 0x50-0x5F: Control flow
/// - 0x60-0x6F: Calls and exceptions
/// - 0x70-0x7F: Scheduling and I/O intrinsics
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Stack Manipulation (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Pop top value from stack
    Pop = 0x01,
    /// Duplicate top stack value
    Dup = 0x02,

    // ===== Constants (0x10-0x1F) =====
    /// Push null
    ConstNull = 0x10,
    /// Push true
    ConstTrue = 0x11,
    /// Push false
    ConstFalse = 0x12,
    /// Push 32-bit integer (operand: i32)
    ConstI32 = 0x13,
    /// Push 64-bit float (operand: f64)
    ConstF64 = 0x14,
    /// Push string from the module string pool (operand: u32 index)
    ConstStr = 0x15,

    // ===== Locals and Statics (0x20-0x2F) =====
    /// Push local (operand: u16 slot)
    LoadLocal = 0x20,
    /// Pop into local (operand: u16 slot)
    StoreLocal = 0x21,
    /// Push static field (operands: u32 class, u16 field)
    LoadStatic = 0x22,
    /// Pop into static field (operands: u32 class, u16 field)
    StoreStatic = 0x23,

    // ===== Arithmetic (0x30-0x3F) =====
    /// Integer addition (wrapping)
    Iadd = 0x30,
    /// Integer subtraction (wrapping)
    Isub = 0x31,
    /// Integer multiplication (wrapping)
    Imul = 0x32,
    /// Integer division, throws on zero divisor
    Idiv = 0x33,
    /// Integer remainder, throws on zero divisor
    Imod = 0x34,
    /// Integer negation
    Ineg = 0x35,
    /// Float addition
    Fadd = 0x38,
    /// Float subtraction
    Fsub = 0x39,
    /// Float multiplication
    Fmul = 0x3A,
    /// Float division
    Fdiv = 0x3B,
    /// Float negation
    Fneg = 0x3C,
    /// Convert number to float
    ToF64 = 0x3D,
    /// Convert number to integer (truncating, saturating)
    ToI32 = 0x3E,

    // ===== Comparison, Logic, Strings (0x40-0x4F) =====
    /// Equality
    Eq = 0x40,
    /// Inequality
    Ne = 0x41,
    /// Less than
    Lt = 0x42,
    /// Less or equal
    Le = 0x43,
    /// Greater than
    Gt = 0x44,
    /// Greater or equal
    Ge = 0x45,
    /// Boolean not
    Not = 0x46,
    /// Concatenate the display form of two values into a new string
    Concat = 0x48,

    // ===== Control Flow (0x50-0x5F) =====
    /// Unconditional jump (operand: i32 offset relative to the next instruction)
    Jmp = 0x50,
    /// Pop, jump if false or null (operand: i32 offset)
    JmpIfFalse = 0x51,
    /// Pop, jump if true (operand: i32 offset)
    JmpIfTrue = 0x52,

    // ===== Calls (0x60-0x6F) =====
    /// Call function (operand: u32 function index)
    Call = 0x60,
    /// Call host native (operands: u16 native import, u8 arg count)
    CallNative = 0x61,
    /// Return top of stack
    Return = 0x62,
    /// Return null
    ReturnVoid = 0x63,
    /// Pop a value and raise it as an exception
    Throw = 0x64,

    // ===== Scheduling and I/O (0x70-0x7F) =====
    /// Pop delay in seconds, schedule a one-shot callback, push timer id
    /// (operand: u32 callback function)
    TimerAdd = 0x70,
    /// Pop interval in seconds, schedule a repeating callback, push timer id
    /// (operand: u32 callback function)
    TimerEvery = 0x71,
    /// Pop timer id, cancel it, push whether it was pending
    TimerCancel = 0x72,
    /// Register a callback run on every cooperative tick (operand: u32 callback function)
    MainLoopAdd = 0x73,
    /// Pop a path and read the file in the background; the callback receives the
    /// contents, or null on failure (operand: u32 callback function)
    AsyncRead = 0x78,
}

impl Opcode {
    /// Convert a byte to an opcode
    pub fn from_u8(byte: u8) -> Option<Self> {
        use Opcode::*;
        let op = match byte {
            0x00 => Nop,
            0x01 => Pop,
            0x02 => Dup,
            0x10 => ConstNull,
            0x11 => ConstTrue,
            0x12 => ConstFalse,
            0x13 => ConstI32,
            0x14 => ConstF64,
            0x15 => ConstStr,
            0x20 => LoadLocal,
            0x21 => StoreLocal,
            0x22 => LoadStatic,
            0x23 => StoreStatic,
            0x30 => Iadd,
            0x31 => Isub,
            0x32 => Imul,
            0x33 => Idiv,
            0x34 => Imod,
            0x35 => Ineg,
            0x38 => Fadd,
            0x39 => Fsub,
            0x3A => Fmul,
            0x3B => Fdiv,
            0x3C => Fneg,
            0x3D => ToF64,
            0x3E => ToI32,
            0x40 => Eq,
            0x41 => Ne,
            0x42 => Lt,
            0x43 => Le,
            0x44 => Gt,
            0x45 => Ge,
            0x46 => Not,
            0x48 => Concat,
            0x50 => Jmp,
            0x51 => JmpIfFalse,
            0x52 => JmpIfTrue,
            0x60 => Call,
            0x61 => CallNative,
            0x62 => Return,
            0x63 => ReturnVoid,
            0x64 => Throw,
            0x70 => TimerAdd,
            0x71 => TimerEvery,
            0x72 => TimerCancel,
            0x73 => MainLoopAdd,
            0x78 => AsyncRead,
            _ => return None,
        };
        Some(op)
    }

    /// Convert opcode to its byte value
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Size in bytes of the operands following this opcode
    pub fn operand_size(self) -> usize {
        match self {
            Self::ConstI32 | Self::ConstStr => 4,
            Self::ConstF64 => 8,
            Self::LoadLocal | Self::StoreLocal => 2,
            Self::LoadStatic | Self::StoreStatic => 6,
            Self::Jmp | Self::JmpIfFalse | Self::JmpIfTrue => 4,
            Self::Call => 4,
            Self::CallNative => 3,
            Self::TimerAdd | Self::TimerEvery | Self::MainLoopAdd | Self::AsyncRead => 4,
            _ => 0,
        }
    }

    /// Whether control never continues to the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Jmp | Self::Return | Self::ReturnVoid | Self::Throw
        )
    }

    /// Whether the instruction touches the cooperative scheduler
    pub fn is_cooperative(self) -> bool {
        matches!(
            self,
            Self::TimerAdd | Self::TimerEvery | Self::TimerCancel | Self::MainLoopAdd
        )
    }

    /// Get the human-readable name of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::Pop => "POP",
            Self::Dup => "DUP",
            Self::ConstNull => "CONST_NULL",
            Self::ConstTrue => "CONST_TRUE",
            Self::ConstFalse => "CONST_FALSE",
            Self::ConstI32 => "CONST_I32",
            Self::ConstF64 => "CONST_F64",
            Self::ConstStr => "CONST_STR",
            Self::LoadLocal => "LOAD_LOCAL",
            Self::StoreLocal => "STORE_LOCAL",
            Self::LoadStatic => "LOAD_STATIC",
            Self::StoreStatic => "STORE_STATIC",
            Self::Iadd => "IADD",
            Self::Isub => "ISUB",
            Self::Imul => "IMUL",
            Self::Idiv => "IDIV",
            Self::Imod => "IMOD",
            Self::Ineg => "INEG",
            Self::Fadd => "FADD",
            Self::Fsub => "FSUB",
            Self::Fmul => "FMUL",
            Self::Fdiv => "FDIV",
            Self::Fneg => "FNEG",
            Self::ToF64 => "TO_F64",
            Self::ToI32 => "TO_I32",
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::Lt => "LT",
            Self::Le => "LE",
            Self::Gt => "GT",
            Self::Ge => "GE",
            Self::Not => "NOT",
            Self::Concat => "CONCAT",
            Self::Jmp => "JMP",
            Self::JmpIfFalse => "JMP_IF_FALSE",
            Self::JmpIfTrue => "JMP_IF_TRUE",
            Self::Call => "CALL",
            Self::CallNative => "CALL_NATIVE",
            Self::Return => "RETURN",
            Self::ReturnVoid => "RETURN_VOID",
            Self::Throw => "THROW",
            Self::TimerAdd => "TIMER_ADD",
            Self::TimerEvery => "TIMER_EVERY",
            Self::TimerCancel => "TIMER_CANCEL",
            Self::MainLoopAdd => "MAIN_LOOP_ADD",
            Self::AsyncRead => "ASYNC_READ",
        }
    }
}
