//! The instruction set of the stack VM.
//!
//! Instructions are a byte stream: a 1-byte opcode followed by its
//! operands at fixed widths (see [`Opcode::operand_widths`]). Jump
//! operands are absolute instruction offsets.
//!
//! Stack effect notation below: `[..., a, b] -> [..., r]`.

use core::fmt;

/// Spread-call flag bit on `Call`: the last argument is an array to be
/// spliced into positional arguments.
pub const CALL_FLAG_SPREAD: u8 = 1 << 0;

/// Tail-call flag bit on `Call`: the compiler proved the call result is
/// immediately returned; the VM may reuse the current frame.
pub const CALL_FLAG_TAIL: u8 = 1 << 1;

/// Sentinel operand for `SetupTry`'s catch target when the statement has
/// no catch clause.
pub const NO_TARGET: u32 = u32::MAX;

/// A single opcode. Operand widths are listed per variant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Push a constant. Operand: u16 pool index.
    /// Stack: `[...] -> [..., value]`
    Constant = 0,
    /// Push `undefined`. Stack: `[...] -> [..., undefined]`
    Undefined,
    /// Push `true`.
    True,
    /// Push `false`.
    False,

    /// Load a local slot. Operand: u8 slot.
    /// Dereferences a shared cell when the slot holds one.
    GetLocal,
    /// Store to a local slot, writing through a shared cell if present.
    /// Operand: u8 slot. Stack: `[..., v] -> [...]`
    SetLocal,
    /// Initialize a local slot, replacing any previous cell binding.
    /// Operand: u8 slot. Stack: `[..., v] -> [...]`
    DefineLocal,

    /// Read `globals[name]`. Operand: u16 name-constant index.
    GetGlobal,
    /// Write `globals[name] = v`. Operand: u16 name-constant index.
    /// Stack: `[..., v] -> [...]`
    SetGlobal,

    /// Push a builtin table entry. Operand: u8 builtin id.
    GetBuiltin,

    /// Read a captured cell. Operand: u8 free index.
    GetFree,
    /// Write a captured cell. Operand: u8 free index.
    /// Stack: `[..., v] -> [...]`
    SetFree,
    /// Push the shared cell for a local slot, promoting the slot to a
    /// cell if it is not one yet. Operand: u8 slot.
    GetLocalPtr,
    /// Push a captured cell itself (for re-capture by a nested closure).
    /// Operand: u8 free index.
    GetFreePtr,

    /// Stack: `[..., v] -> [...]`
    Pop,
    /// Stack: `[..., v] -> [..., v, v]`
    Dup,

    /// Apply a binary operator. Operand: u8 token id.
    /// Stack: `[..., a, b] -> [..., a op b]`
    BinaryOp,
    /// Apply a unary operator. Operand: u8 token id.
    /// Stack: `[..., a] -> [..., op a]`
    UnaryOp,

    /// Unconditional jump. Operand: u32 absolute target.
    Jump,
    /// Pop, jump when falsy. Operand: u32 target.
    /// Stack: `[..., c] -> [...]`
    JumpFalsy,
    /// Pop, jump when truthy. Operand: u32 target.
    JumpTruthy,
    /// Short-circuit `&&`: jump keeping the value when falsy, else pop.
    /// Operand: u32 target.
    AndJump,
    /// Short-circuit `||`: jump keeping the value when truthy, else pop.
    /// Operand: u32 target.
    OrJump,

    /// Call a callable. Operands: u8 argc, u8 flags (spread/tail bits).
    /// Stack: `[..., callee, a1..aN] -> [..., result]`
    Call,
    /// Return the top of stack from the current frame.
    Return,
    /// Return `undefined` from the current frame.
    ReturnUndefined,

    /// Collect N values into an array. Operand: u16 count.
    /// Stack: `[..., v1..vN] -> [..., array]`
    MakeArray,
    /// Collect N key/value pairs into a map. Operand: u16 pair count.
    /// Stack: `[..., k1, v1, ..] -> [..., map]`
    MakeMap,
    /// Instantiate a closure. Operands: u16 fn-constant index, u8 free
    /// count. Stack: `[..., cell1..cellN] -> [..., closure]`
    MakeClosure,

    /// Stack: `[..., target, index] -> [..., value]`
    IndexGet,
    /// Stack: `[..., value, target, index] -> [...]`
    IndexSet,
    /// Stack: `[..., target, low, high] -> [..., slice]`
    SliceIndex,

    /// Stack: `[..., iterable] -> [..., iterator]`
    IterInit,
    /// Advance the iterator. Stack: `[..., it] -> [..., more: bool]`
    IterNext,
    /// Stack: `[..., it] -> [..., key]`
    IterKey,
    /// Stack: `[..., it] -> [..., value]`
    IterValue,

    /// Open a try region. Operands: u32 catch target (`NO_TARGET` when
    /// absent), u32 finally target.
    SetupTry,
    /// Raise. Operand: u8 kind — 1 pops the thrown value, 0 re-raises the
    /// pending error at the end of a finally body.
    Throw,
    /// Normal completion of a try or catch body: enter the finally block.
    Finalizer,
    /// Close the innermost try region and resolve its pending action.
    EndTry,
    /// Leave a guarded region via break/continue. Operands: u32 jump
    /// target, u8 number of enclosing try regions to unwind through.
    Defer,

    /// Load a module or its cached value. Operands: u16 constant index,
    /// u16 module index. Stack: `[...] -> [..., value, cached: bool]`
    LoadModule,
    /// Cache the top of stack as a module value (keeps it on the stack).
    /// Operand: u16 module index.
    StoreModule,

    /// No operation.
    NoOp,
}

static_assertions::assert_eq_size!(Opcode, u8);

/// A byte that does not decode to an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid opcode byte: 0x{0:02X}")]
pub struct InvalidOpcode(pub u8);

impl Opcode {
    /// All opcodes in discriminant order; `from_u8` indexes into this.
    const ALL: [Opcode; 44] = [
        Opcode::Constant,
        Opcode::Undefined,
        Opcode::True,
        Opcode::False,
        Opcode::GetLocal,
        Opcode::SetLocal,
        Opcode::DefineLocal,
        Opcode::GetGlobal,
        Opcode::SetGlobal,
        Opcode::GetBuiltin,
        Opcode::GetFree,
        Opcode::SetFree,
        Opcode::GetLocalPtr,
        Opcode::GetFreePtr,
        Opcode::Pop,
        Opcode::Dup,
        Opcode::BinaryOp,
        Opcode::UnaryOp,
        Opcode::Jump,
        Opcode::JumpFalsy,
        Opcode::JumpTruthy,
        Opcode::AndJump,
        Opcode::OrJump,
        Opcode::Call,
        Opcode::Return,
        Opcode::ReturnUndefined,
        Opcode::MakeArray,
        Opcode::MakeMap,
        Opcode::MakeClosure,
        Opcode::IndexGet,
        Opcode::IndexSet,
        Opcode::SliceIndex,
        Opcode::IterInit,
        Opcode::IterNext,
        Opcode::IterKey,
        Opcode::IterValue,
        Opcode::SetupTry,
        Opcode::Throw,
        Opcode::Finalizer,
        Opcode::EndTry,
        Opcode::Defer,
        Opcode::LoadModule,
        Opcode::StoreModule,
        Opcode::NoOp,
    ];

    pub fn from_u8(v: u8) -> Result<Opcode, InvalidOpcode> {
        Opcode::ALL.get(v as usize).copied().ok_or(InvalidOpcode(v))
    }

    /// Operand widths in bytes, in operand order.
    pub fn operand_widths(self) -> &'static [usize] {
        use Opcode::*;
        match self {
            Constant | GetGlobal | SetGlobal | MakeArray | MakeMap | StoreModule => &[2],
            GetLocal | SetLocal | DefineLocal | GetBuiltin | GetFree | SetFree | GetLocalPtr
            | GetFreePtr | BinaryOp | UnaryOp | Throw => &[1],
            Jump | JumpFalsy | JumpTruthy | AndJump | OrJump => &[4],
            Call => &[1, 1],
            MakeClosure => &[2, 1],
            SetupTry => &[4, 4],
            Defer => &[4, 1],
            LoadModule => &[2, 2],
            Undefined | True | False | Pop | Dup | Return | ReturnUndefined | IndexGet
            | IndexSet | SliceIndex | IterInit | IterNext | IterKey | IterValue | Finalizer
            | EndTry | NoOp => &[],
        }
    }

    /// Total encoded size, opcode byte included.
    pub fn instruction_len(self) -> usize {
        1 + self.operand_widths().iter().sum::<usize>()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Append an encoded instruction to `buf`. Operand values must fit their
/// declared widths.
pub fn make(buf: &mut Vec<u8>, op: Opcode, operands: &[u32]) {
    let widths = op.operand_widths();
    debug_assert_eq!(operands.len(), widths.len(), "operand count for {op}");
    buf.push(op as u8);
    for (value, width) in operands.iter().zip(widths) {
        match width {
            1 => {
                debug_assert!(*value <= u8::MAX as u32, "operand overflow for {op}");
                buf.push(*value as u8);
            }
            2 => {
                debug_assert!(*value <= u16::MAX as u32, "operand overflow for {op}");
                buf.extend_from_slice(&(*value as u16).to_le_bytes());
            }
            4 => buf.extend_from_slice(&value.to_le_bytes()),
            _ => unreachable!("unsupported operand width"),
        }
    }
}

#[inline]
pub fn read_u8(instructions: &[u8], offset: usize) -> u32 {
    instructions[offset] as u32
}

#[inline]
pub fn read_u16(instructions: &[u8], offset: usize) -> u32 {
    u16::from_le_bytes([instructions[offset], instructions[offset + 1]]) as u32
}

#[inline]
pub fn read_u32(instructions: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        instructions[offset],
        instructions[offset + 1],
        instructions[offset + 2],
        instructions[offset + 3],
    ])
}

/// Decode the operands of the instruction at `offset` (which must point at
/// the opcode byte). Returns the operands and the offset of the next
/// instruction.
pub fn read_operands(op: Opcode, instructions: &[u8], offset: usize) -> (smallvec::SmallVec<[u32; 2]>, usize) {
    let mut operands = smallvec::SmallVec::new();
    let mut at = offset + 1;
    for width in op.operand_widths() {
        let v = match width {
            1 => read_u8(instructions, at),
            2 => read_u16(instructions, at),
            4 => read_u32(instructions, at),
            _ => unreachable!("unsupported operand width"),
        };
        operands.push(v);
        at += width;
    }
    (operands, at)
}

/// Render an instruction stream in assembly style, one instruction per
/// line, for `Debug` output and the disassembler.
pub fn disassemble(instructions: &[u8], out: &mut String) {
    use fmt::Write;
    let mut offset = 0;
    while offset < instructions.len() {
        let Ok(op) = Opcode::from_u8(instructions[offset]) else {
            let _ = writeln!(out, "{offset:5}  <bad 0x{:02X}>", instructions[offset]);
            offset += 1;
            continue;
        };
        let (operands, next) = read_operands(op, instructions, offset);
        let _ = write!(out, "{offset:5}  {op}");
        for v in &operands {
            let _ = write!(out, " {v}");
        }
        let _ = writeln!(out);
        offset = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_roundtrip() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i, "discriminant gap at {op:?}");
            assert_eq!(Opcode::from_u8(i as u8), Ok(*op));
        }
        assert_eq!(
            Opcode::from_u8(Opcode::ALL.len() as u8),
            Err(InvalidOpcode(Opcode::ALL.len() as u8))
        );
    }

    #[test]
    fn test_make_and_read_operands() {
        let mut buf = Vec::new();
        make(&mut buf, Opcode::Constant, &[65534]);
        make(&mut buf, Opcode::GetLocal, &[255]);
        make(&mut buf, Opcode::Jump, &[70000]);
        make(&mut buf, Opcode::Call, &[2, CALL_FLAG_SPREAD as u32]);
        make(&mut buf, Opcode::Pop, &[]);

        let (ops, next) = read_operands(Opcode::Constant, &buf, 0);
        assert_eq!(ops.as_slice(), &[65534]);
        let (ops, next) = read_operands(Opcode::GetLocal, &buf, next);
        assert_eq!(ops.as_slice(), &[255]);
        let (ops, next) = read_operands(Opcode::Jump, &buf, next);
        assert_eq!(ops.as_slice(), &[70000]);
        let (ops, next) = read_operands(Opcode::Call, &buf, next);
        assert_eq!(ops.as_slice(), &[2, 1]);
        assert_eq!(buf[next], Opcode::Pop as u8);
    }

    #[test]
    fn test_disassemble() {
        let mut buf = Vec::new();
        make(&mut buf, Opcode::Constant, &[1]);
        make(&mut buf, Opcode::BinaryOp, &[crate::token::Token::Add as u32]);
        let mut out = String::new();
        disassemble(&buf, &mut out);
        assert!(out.contains("Constant 1"));
        assert!(out.contains("BinaryOp"));
    }
}
