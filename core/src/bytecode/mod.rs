//! Compiled artifacts: functions, the bytecode aggregate, and its binary
//! codec.

pub mod encode;
pub mod opcode;

use std::fmt;
use std::rc::Rc;

use ecow::EcoString;
use smallvec::SmallVec;

use crate::source::{FileSet, Pos, NO_POS};
use crate::value::{ObjectPtr, Value};

pub use encode::{DecodeError, EncodeError};
pub use opcode::{Opcode, CALL_FLAG_SPREAD, CALL_FLAG_TAIL, NO_TARGET};

/// Offset-to-position map for one function's instruction stream.
pub type SourceMap = hashbrown::HashMap<u32, Pos>;

/// A bytecode function: the instruction stream plus the metadata the VM
/// needs to build a frame for it.
///
/// The same struct serves as the compile-time template (empty `free`) and
/// as a closure instance (`free` holds the captured cells); `MakeClosure`
/// clones the template with the cells filled in, sharing the instruction
/// stream and source map.
#[derive(Clone)]
pub struct CompiledFunction {
    pub instructions: Rc<[u8]>,
    /// Number of declared parameters (included in `num_locals`).
    pub num_params: usize,
    /// Number of local slots, parameters included.
    pub num_locals: usize,
    /// Whether the last parameter collects remaining arguments.
    pub variadic: bool,
    pub name: Option<EcoString>,
    pub source_map: Rc<SourceMap>,
    /// Captured cells, in capture order. Empty on templates.
    pub free: SmallVec<[ObjectPtr; 4]>,
}

impl CompiledFunction {
    /// Instantiate a closure over this template with captured cells.
    pub fn with_free(&self, free: SmallVec<[ObjectPtr; 4]>) -> CompiledFunction {
        CompiledFunction {
            instructions: self.instructions.clone(),
            num_params: self.num_params,
            num_locals: self.num_locals,
            variadic: self.variadic,
            name: self.name.clone(),
            source_map: self.source_map.clone(),
            free,
        }
    }

    /// The source position of the instruction at `offset`, falling back to
    /// the nearest earlier instruction when the exact offset was not
    /// recorded.
    pub fn source_pos(&self, offset: u32) -> Pos {
        let mut at = offset;
        loop {
            if let Some(pos) = self.source_map.get(&at) {
                return *pos;
            }
            if at == 0 {
                return NO_POS;
            }
            at -= 1;
        }
    }

    /// Content equality, captured cells excluded. The codec round-trip
    /// test compares decoded functions with this.
    pub fn same_code(&self, other: &CompiledFunction) -> bool {
        *self.instructions == *other.instructions
            && self.num_params == other.num_params
            && self.num_locals == other.num_locals
            && self.variadic == other.variadic
            && self.name == other.name
            && *self.source_map == *other.source_map
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "CompiledFunction {{ name: {:?}, params: {}{}, locals: {}, free: {} }}",
            self.name.as_deref().unwrap_or(""),
            self.num_params,
            if self.variadic { "+" } else { "" },
            self.num_locals,
            self.free.len(),
        )?;
        let mut out = String::new();
        opcode::disassemble(&self.instructions, &mut out);
        f.write_str(&out)
    }
}

/// The compilation artifact: the main function, the shared constant pool,
/// the number of importable modules, and the file set for diagnostics.
#[derive(Clone)]
pub struct Bytecode {
    pub main: Rc<CompiledFunction>,
    pub constants: Vec<Value>,
    pub num_modules: usize,
    pub file_set: Rc<FileSet>,
}

impl Bytecode {
    /// Serialize to the stable binary format.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode::encode(self)
    }

    /// Deserialize from the stable binary format.
    pub fn decode(bytes: &[u8]) -> Result<Bytecode, DecodeError> {
        encode::decode(bytes)
    }
}

/// Constant-pool equality: like [`Value::equals`] but compares compiled
/// functions by content so decoded bytecode can be checked against its
/// source artifact.
pub fn constants_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::CompiledFunction(a), Value::CompiledFunction(b)) => a.same_code(b),
        _ => a.equals(b),
    }
}

impl fmt::Debug for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bytecode {{")?;
        writeln!(f, "  modules: {}", self.num_modules)?;
        if self.constants.is_empty() {
            writeln!(f, "  constants: []")?;
        } else {
            writeln!(f, "  constants: [")?;
            for (i, c) in self.constants.iter().enumerate() {
                match c {
                    Value::CompiledFunction(func) => {
                        writeln!(
                            f,
                            "    [{i}] = <compiled-function:{}>",
                            func.name.as_deref().unwrap_or("anonymous")
                        )?;
                    }
                    other => writeln!(f, "    [{i}] = {:?}", other)?,
                }
            }
            writeln!(f, "  ]")?;
        }
        writeln!(f, "  main:")?;
        let mut out = String::new();
        opcode::disassemble(&self.main.instructions, &mut out);
        for line in out.lines() {
            writeln!(f, "    {line}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn sample_fn() -> CompiledFunction {
        let mut instrs = Vec::new();
        opcode::make(&mut instrs, Opcode::Constant, &[0]);
        opcode::make(&mut instrs, Opcode::Return, &[]);
        let mut map = SourceMap::new();
        map.insert(0, 12);
        CompiledFunction {
            instructions: instrs.into(),
            num_params: 1,
            num_locals: 2,
            variadic: false,
            name: Some("f".into()),
            source_map: Rc::new(map),
            free: SmallVec::new(),
        }
    }

    #[test]
    fn test_source_pos_walks_back() {
        let f = sample_fn();
        assert_eq!(f.source_pos(0), 12);
        // Offset 3 (Return) has no entry; nearest earlier wins.
        assert_eq!(f.source_pos(3), 12);
    }

    #[test]
    fn test_with_free_shares_code() {
        let template = sample_fn();
        let cell = ObjectPtr::new(Value::Int(1));
        let closure = template.with_free(smallvec![cell]);
        assert!(closure.same_code(&template));
        assert_eq!(closure.free.len(), 1);
        assert!(Rc::ptr_eq(&template.instructions, &closure.instructions));
    }

    #[test]
    fn test_debug_disassembles() {
        let f = sample_fn();
        let text = format!("{f:?}");
        assert!(text.contains("Constant 0"));
        assert!(text.contains("Return"));
    }
}
