//! Bytecode module format
//!
//! Layout of an encoded module:
//! - Header: magic (4 bytes) + version (u32) + flags (u32) + crc32 of payload (u32)
//! - Module name
//! - String pool
//! - Function table
//! - Class table
//! - Native import table (only when [`flags::HAS_NATIVES`] is set)
//! - Entry point function index

use super::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use thiserror::Error;

/// Magic number for Vessel bytecode files: "VSLB"
pub const MAGIC: [u8; 4] = *b"VSLB";

/// Current bytecode version
pub const VERSION: u32 = 1;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 16;

/// Module header flags
pub mod flags {
    /// Module imports host natives
    pub const HAS_NATIVES: u32 = 1 << 0;
    /// Module was produced with debug names retained
    pub const DEBUG_NAMES: u32 = 1 << 1;

    /// Every flag this version understands
    pub const KNOWN: u32 = HAS_NATIVES | DEBUG_NAMES;
}

/// Module encoding/decoding errors
#[derive(Debug, Error)]
pub enum ModuleError {
    /// Decode error
    #[error("Decode error: {0}")]
    DecodeError(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected VSLB, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Header carries flags this version does not understand
    #[error("Unsupported header flags: {0:#x}")]
    UnsupportedFlags(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Expected checksum value
        expected: u32,
        /// Actual checksum value
        actual: u32,
    },

    /// Bytes left over after the payload
    #[error("{0} trailing bytes after module payload")]
    TrailingBytes(usize),
}

/// Initial value of a static field
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Null; the field is dynamically typed
    Null,
    /// Boolean
    Bool(bool),
    /// 32-bit integer
    I32(i32),
    /// 64-bit float
    F64(f64),
    /// String
    Str(String),
}

impl Constant {
    fn encode(&self, writer: &mut BytecodeWriter) {
        match self {
            Constant::Null => writer.emit_u8(0),
            Constant::Bool(b) => {
                writer.emit_u8(1);
                writer.emit_u8(*b as u8);
            }
            Constant::I32(v) => {
                writer.emit_u8(2);
                writer.emit_i32(*v);
            }
            Constant::F64(v) => {
                writer.emit_u8(3);
                writer.emit_f64(*v);
            }
            Constant::Str(s) => {
                writer.emit_u8(4);
                writer.emit_string(s);
            }
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        let constant = match reader.read_u8()? {
            0 => Constant::Null,
            1 => Constant::Bool(reader.read_u8()? != 0),
            2 => Constant::I32(reader.read_i32()?),
            3 => Constant::F64(reader.read_f64()?),
            4 => Constant::Str(reader.read_string()?),
            tag => {
                return Err(DecodeError::InvalidTag {
                    what: "constant",
                    tag,
                    offset,
                })
            }
        };
        Ok(constant)
    }
}

/// Function definition
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    /// Function name, unique within the module
    pub name: String,
    /// Number of parameters (they occupy the first local slots)
    pub param_count: u16,
    /// Total number of local slots, parameters included
    pub local_count: u16,
    /// Encoded instructions
    pub code: Vec<u8>,
}

impl Function {
    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_string(&self.name);
        writer.emit_u16(self.param_count);
        writer.emit_u16(self.local_count);
        writer.emit_u32(self.code.len() as u32);
        writer.emit_bytes(&self.code);
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let name = reader.read_string()?;
        let param_count = reader.read_u16()?;
        let local_count = reader.read_u16()?;
        let len = reader.read_u32()? as usize;
        let code = reader.read_bytes(len)?.to_vec();
        Ok(Self {
            name,
            param_count,
            local_count,
            code,
        })
    }
}

/// Static field declaration
#[derive(Debug, Clone, PartialEq)]
pub struct StaticField {
    /// Field name
    pub name: String,
    /// Initial value; its kind is the declared kind of the field
    pub initial: Constant,
}

/// Static method binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    /// Method name
    pub name: String,
    /// Index of the implementing function
    pub function: u32,
}

/// Class definition
#[derive(Debug, Clone, PartialEq)]
pub struct Class {
    /// Class name, unique within the module
    pub name: String,
    /// Static fields
    pub statics: Vec<StaticField>,
    /// Static methods
    pub methods: Vec<Method>,
}

impl Class {
    fn encode(&self, writer: &mut BytecodeWriter) {
        writer.emit_string(&self.name);
        writer.emit_u16(self.statics.len() as u16);
        for field in &self.statics {
            writer.emit_string(&field.name);
            field.initial.encode(writer);
        }
        writer.emit_u16(self.methods.len() as u16);
        for method in &self.methods {
            writer.emit_string(&method.name);
            writer.emit_u32(method.function);
        }
    }

    fn decode(reader: &mut BytecodeReader<'_>) -> Result<Self, DecodeError> {
        let name = reader.read_string()?;
        let static_count = reader.read_u16()? as usize;
        let mut statics = Vec::with_capacity(static_count);
        for _ in 0..static_count {
            let name = reader.read_string()?;
            let initial = Constant::decode(reader)?;
            statics.push(StaticField { name, initial });
        }
        let method_count = reader.read_u16()? as usize;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            let name = reader.read_string()?;
            let function = reader.read_u32()?;
            methods.push(Method { name, function });
        }
        Ok(Self {
            name,
            statics,
            methods,
        })
    }

    /// Index of a static field by name
    pub fn static_index(&self, name: &str) -> Option<usize> {
        self.statics.iter().position(|f| f.name == name)
    }

    /// Function index of a static method by name
    pub fn method(&self, name: &str) -> Option<u32> {
        self.methods
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.function)
    }
}

/// A complete bytecode module
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Header flags
    pub flags: u32,
    /// Module name
    pub name: String,
    /// String pool referenced by `CONST_STR`
    pub strings: Vec<String>,
    /// Function table
    pub functions: Vec<Function>,
    /// Class table
    pub classes: Vec<Class>,
    /// Names of host natives referenced by `CALL_NATIVE`
    pub natives: Vec<String>,
    /// Index of the entry point function
    pub entry: u32,
}

impl Module {
    /// Create a new empty module
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            flags: 0,
            name: name.into(),
            strings: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            natives: Vec::new(),
            entry: 0,
        }
    }

    /// Look up a function index by name
    pub fn function_index(&self, name: &str) -> Option<u32> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| i as u32)
    }

    /// Look up a class by name
    pub fn class(&self, name: &str) -> Option<&Class> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// The entry point function, if the index is valid
    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.get(self.entry as usize)
    }

    /// Encode the module to its binary form
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = self.flags;
        if self.natives.is_empty() {
            flags &= !flags::HAS_NATIVES;
        } else {
            flags |= flags::HAS_NATIVES;
        }

        let mut writer = BytecodeWriter::new();
        writer.emit_bytes(&MAGIC);
        writer.emit_u32(VERSION);
        writer.emit_u32(flags);
        let crc_offset = writer.offset();
        writer.emit_u32(0); // Patched below

        writer.emit_string(&self.name);

        writer.emit_u32(self.strings.len() as u32);
        for s in &self.strings {
            writer.emit_string(s);
        }

        writer.emit_u32(self.functions.len() as u32);
        for func in &self.functions {
            func.encode(&mut writer);
        }

        writer.emit_u32(self.classes.len() as u32);
        for class in &self.classes {
            class.encode(&mut writer);
        }

        if flags & flags::HAS_NATIVES != 0 {
            writer.emit_u32(self.natives.len() as u32);
            for name in &self.natives {
                writer.emit_string(name);
            }
        }

        writer.emit_u32(self.entry);

        let crc = crc32fast::hash(&writer.buffer()[HEADER_SIZE..]);
        writer.patch_u32(crc_offset, crc);
        writer.into_bytes()
    }

    /// Decode a module from its binary form
    ///
    /// The header is validated before anything else is read, so a file that
    /// is not a Vessel module fails fast with [`ModuleError::InvalidMagic`].
    pub fn decode(data: &[u8]) -> Result<Self, ModuleError> {
        let mut reader = BytecodeReader::new(data);

        let magic_bytes = reader.read_bytes(4)?;
        let mut magic = [0u8; 4];
        magic.copy_from_slice(magic_bytes);
        if magic != MAGIC {
            return Err(ModuleError::InvalidMagic(magic));
        }

        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ModuleError::UnsupportedVersion(version));
        }

        let flags = reader.read_u32()?;
        if flags & !flags::KNOWN != 0 {
            return Err(ModuleError::UnsupportedFlags(flags & !flags::KNOWN));
        }

        let expected = reader.read_u32()?;
        let actual = crc32fast::hash(&data[HEADER_SIZE..]);
        if expected != actual {
            return Err(ModuleError::ChecksumMismatch { expected, actual });
        }

        let name = reader.read_string()?;

        let string_count = reader.read_u32()? as usize;
        let mut strings = Vec::with_capacity(string_count.min(reader.remaining()));
        for _ in 0..string_count {
            strings.push(reader.read_string()?);
        }

        let function_count = reader.read_u32()? as usize;
        let mut functions = Vec::with_capacity(function_count.min(reader.remaining()));
        for _ in 0..function_count {
            functions.push(Function::decode(&mut reader)?);
        }

        let class_count = reader.read_u32()? as usize;
        let mut classes = Vec::with_capacity(class_count.min(reader.remaining()));
        for _ in 0..class_count {
            classes.push(Class::decode(&mut reader)?);
        }

        let mut natives = Vec::new();
        if flags & flags::HAS_NATIVES != 0 {
            let native_count = reader.read_u32()? as usize;
            for _ in 0..native_count {
                natives.push(reader.read_string()?);
            }
        }

        let entry = reader.read_u32()?;

        if reader.has_more() {
            return Err(ModuleError::TrailingBytes(reader.remaining()));
        }

        Ok(Self {
            flags,
            name,
            strings,
            functions,
            classes,
            natives,
            entry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Module {
        let mut module = Module::new("sample");
        module.strings.push("hello".to_string());
        module.functions.push(Function {
            name: "main".to_string(),
            param_count: 0,
            local_count: 1,
            code: vec![0x63],
        });
        module.classes.push(Class {
            name: "Game".to_string(),
            statics: vec![
                StaticField {
                    name: "score".to_string(),
                    initial: Constant::I32(7),
                },
                StaticField {
                    name: "title".to_string(),
                    initial: Constant::Str("demo".to_string()),
                },
            ],
            methods: vec![Method {
                name: "main".to_string(),
                function: 0,
            }],
        });
        module.natives.push("host_log".to_string());
        module
    }

    #[test]
    fn test_encode_decode_preserves_module() {
        let module = sample();
        let decoded = Module::decode(&module.encode()).unwrap();
        assert_eq!(decoded.name, "sample");
        assert_eq!(decoded.flags & flags::HAS_NATIVES, flags::HAS_NATIVES);
        assert_eq!(decoded.functions, module.functions);
        assert_eq!(decoded.classes, module.classes);
        assert_eq!(decoded.natives, module.natives);
        assert_eq!(decoded.class("Game").unwrap().static_index("title"), Some(1));
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = sample().encode();
        bytes[0..4].copy_from_slice(b"HLB\0");
        assert!(matches!(
            Module::decode(&bytes),
            Err(ModuleError::InvalidMagic(m)) if &m == b"HLB\0"
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample().encode();
        bytes[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            Module::decode(&bytes),
            Err(ModuleError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut bytes = sample().encode();
        let flags = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) | 0x100;
        bytes[8..12].copy_from_slice(&flags.to_le_bytes());
        assert!(matches!(
            Module::decode(&bytes),
            Err(ModuleError::UnsupportedFlags(0x100))
        ));
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut bytes = sample().encode();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Module::decode(&bytes),
            Err(ModuleError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            Module::decode(b"VSL"),
            Err(ModuleError::DecodeError(DecodeError::UnexpectedEnd(0)))
        ));
    }

    #[test]
    fn test_natives_flag_cleared_without_imports() {
        let mut module = sample();
        module.natives.clear();
        module.flags = flags::HAS_NATIVES;
        let decoded = Module::decode(&module.encode()).unwrap();
        assert_eq!(decoded.flags & flags::HAS_NATIVES, 0);
        assert!(decoded.natives.is_empty());
    }
}
