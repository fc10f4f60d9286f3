use std::fmt;

use fxhash::FxHashMap as HashMap;
use smallvec::SmallVec;
use thiserror::Error;

/// General-purpose register of the 32-bit MIPS register file, in the o32
/// naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Reg {
    Zero = 0,
    At,
    V0,
    V1,
    A0,
    A1,
    A2,
    A3,
    T0,
    T1,
    T2,
    T3,
    T4,
    T5,
    T6,
    T7,
    S0,
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    T8,
    T9,
    K0,
    K1,
    Gp,
    Sp,
    Fp,
    Ra,
}

impl Reg {
    pub const ALL: [Reg; 32] = [
        Reg::Zero,
        Reg::At,
        Reg::V0,
        Reg::V1,
        Reg::A0,
        Reg::A1,
        Reg::A2,
        Reg::A3,
        Reg::T0,
        Reg::T1,
        Reg::T2,
        Reg::T3,
        Reg::T4,
        Reg::T5,
        Reg::T6,
        Reg::T7,
        Reg::S0,
        Reg::S1,
        Reg::S2,
        Reg::S3,
        Reg::S4,
        Reg::S5,
        Reg::S6,
        Reg::S7,
        Reg::T8,
        Reg::T9,
        Reg::K0,
        Reg::K1,
        Reg::Gp,
        Reg::Sp,
        Reg::Fp,
        Reg::Ra,
    ];

    /// Callee-saved registers (plus `fp`); a well-behaved callee restores
    /// them before returning.
    pub const CALLEE_SAVED: [Reg; 9] = [
        Reg::S0,
        Reg::S1,
        Reg::S2,
        Reg::S3,
        Reg::S4,
        Reg::S5,
        Reg::S6,
        Reg::S7,
        Reg::Fp,
    ];

    /// Registers a called function may clobber under the o32 ABI.
    pub const CALLER_SAVED: [Reg; 17] = [
        Reg::At,
        Reg::V0,
        Reg::V1,
        Reg::A0,
        Reg::A1,
        Reg::A2,
        Reg::A3,
        Reg::T0,
        Reg::T1,
        Reg::T2,
        Reg::T3,
        Reg::T4,
        Reg::T5,
        Reg::T6,
        Reg::T7,
        Reg::T8,
        Reg::T9,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 32] = [
            "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", "t0", "t1", "t2", "t3", "t4", "t5",
            "t6", "t7", "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "t8", "t9", "k0", "k1",
            "gp", "sp", "fp", "ra",
        ];
        NAMES[self.index()]
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Add,
    Addu,
    Addi,
    Addiu,
    Sub,
    Subu,
    Mult,
    Multu,
    Div,
    Divu,
    Mflo,
    Mfhi,
    Ins,
    Ext,
    Min,
    Max,
    And,
    Andi,
    Or,
    Ori,
    Xor,
    Xori,
    Nor,
    Sll,
    Sllv,
    Srl,
    Srlv,
    Sra,
    Srav,
    Slt,
    Slti,
    Sltu,
    Sltiu,
    Seb,
    Seh,
    Lb,
    Lbu,
    Lh,
    Lhu,
    Lw,
    Lwl,
    Lwr,
    Sb,
    Sh,
    Sw,
    Swl,
    Swr,
    Beq,
    Beql,
    Bne,
    Bnel,
    Bgez,
    Bgezl,
    Bgtz,
    Bgtzl,
    Blez,
    Blezl,
    Bltz,
    Bltzl,
    J,
    Jal,
    Jr,
    Movz,
    Movn,
    Lui,
    Nop,
    Sync,
    Break,
}

impl Opcode {
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Beq
                | Opcode::Beql
                | Opcode::Bne
                | Opcode::Bnel
                | Opcode::Bgez
                | Opcode::Bgezl
                | Opcode::Bgtz
                | Opcode::Bgtzl
                | Opcode::Blez
                | Opcode::Blezl
                | Opcode::Bltz
                | Opcode::Bltzl
        )
    }

    /// Branch-likely variants annul the delay slot when not taken.
    pub fn is_branch_likely(self) -> bool {
        matches!(
            self,
            Opcode::Beql
                | Opcode::Bnel
                | Opcode::Bgezl
                | Opcode::Bgtzl
                | Opcode::Blezl
                | Opcode::Bltzl
        )
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::J | Opcode::Jal | Opcode::Jr)
    }

    fn is_store(self) -> bool {
        matches!(
            self,
            Opcode::Sb | Opcode::Sh | Opcode::Sw | Opcode::Swl | Opcode::Swr
        )
    }

    /// Opcodes whose destination register is also an input.
    fn reads_destination(self) -> bool {
        matches!(
            self,
            Opcode::Ins | Opcode::Lwl | Opcode::Lwr | Opcode::Movz | Opcode::Movn
        )
    }

    fn has_destination(self) -> bool {
        !(self.is_branch()
            || self.is_jump()
            || self.is_store()
            || matches!(
                self,
                Opcode::Mult
                    | Opcode::Multu
                    | Opcode::Div
                    | Opcode::Divu
                    | Opcode::Nop
                    | Opcode::Sync
                    | Opcode::Break
            ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Reg(Reg),
    Imm(i32),
    Mem { base: Reg, offset: i32 },
}

impl Operand {
    pub fn reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(r) => Some(*r),
            _ => None,
        }
    }

    pub fn imm(&self) -> Option<i32> {
        match self {
            Operand::Imm(v) => Some(*v),
            _ => None,
        }
    }
}

/// A decoded instruction.
///
/// Operand order follows assembler syntax: destination first where one
/// exists, memory operands as `Mem { base, offset }`, branch and jump
/// targets as absolute addresses in an `Imm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub address: u32,
    pub opcode: Opcode,
    pub operands: SmallVec<[Operand; 4]>,
}

impl Instr {
    pub fn new(address: u32, opcode: Opcode, operands: impl IntoIterator<Item = Operand>) -> Self {
        Self {
            address,
            opcode,
            operands: operands.into_iter().collect(),
        }
    }

    pub fn is_branch(&self) -> bool {
        self.opcode.is_branch()
    }

    pub fn is_branch_likely(&self) -> bool {
        self.opcode.is_branch_likely()
    }

    pub fn is_jump(&self) -> bool {
        self.opcode.is_jump()
    }

    pub fn modified_regs(&self) -> SmallVec<[Reg; 2]> {
        let mut out = SmallVec::new();
        if self.opcode.has_destination() {
            if let Some(Operand::Reg(r)) = self.operands.first() {
                out.push(*r);
            }
        }
        out
    }

    pub fn used_regs(&self) -> SmallVec<[Reg; 4]> {
        let mut out = SmallVec::new();
        let skip_first = self.opcode.has_destination() && !self.opcode.reads_destination();
        for (i, op) in self.operands.iter().enumerate() {
            if i == 0 && skip_first {
                continue;
            }
            match op {
                Operand::Reg(r) => out.push(*r),
                Operand::Mem { base, .. } => out.push(*base),
                Operand::Imm(_) => {}
            }
        }
        out
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.opcode)?;
        for (i, op) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            match op {
                Operand::Reg(r) => write!(f, "{}{}", sep, r)?,
                Operand::Imm(v) => write!(f, "{}{:#x}", sep, v)?,
                Operand::Mem { base, offset } => write!(f, "{}{:#x}({})", sep, offset, base)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisasmError {
    #[error("no instruction at {address:#010x}")]
    UnknownInstruction { address: u32 },
}

/// Read-only view of the loaded program image.
pub trait BinLoader: Send + Sync {
    fn read_word(&self, address: u32) -> u32;
}

/// Word-backed loader for tests and in-memory images.
pub struct SliceLoader {
    base: u32,
    words: Vec<u32>,
}

impl SliceLoader {
    pub fn new(base: u32, words: Vec<u32>) -> Self {
        Self { base, words }
    }
}

impl BinLoader for SliceLoader {
    fn read_word(&self, address: u32) -> u32 {
        let index = address.wrapping_sub(self.base) / 4;
        self.words.get(index as usize).copied().unwrap_or(0)
    }
}

pub trait Disassembler: Send + Sync {
    fn disassemble(&self, loader: &dyn BinLoader, address: u32) -> Result<Instr, DisasmError>;
}

/// Map-backed disassembler for embedders that already hold decoded
/// instructions.
#[derive(Debug, Clone, Default)]
pub struct TableDisassembler {
    instrs: HashMap<u32, Instr>,
}

impl TableDisassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, instr: Instr) {
        self.instrs.insert(instr.address, instr);
    }

    pub fn with(mut self, instr: Instr) -> Self {
        self.insert(instr);
        self
    }
}

impl Disassembler for TableDisassembler {
    fn disassemble(&self, _loader: &dyn BinLoader, address: u32) -> Result<Instr, DisasmError> {
        self.instrs
            .get(&address)
            .cloned()
            .ok_or(DisasmError::UnknownInstruction { address })
    }
}

/// Optional symbol information used to route calls through the function
/// library and to annotate traces.
pub trait ModuleInfo: Send + Sync {
    fn function_name_at(&self, address: u32) -> Option<&str>;
}

/// Map-backed [`ModuleInfo`].
#[derive(Debug, Clone, Default)]
pub struct FunctionTable {
    functions: HashMap<u32, String>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: u32, name: impl Into<String>) {
        self.functions.insert(address, name.into());
    }
}

impl ModuleInfo for FunctionTable {
    fn function_name_at(&self, address: u32) -> Option<&str> {
        self.functions.get(&address).map(String::as_str)
    }
}
