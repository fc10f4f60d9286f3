use std::fmt;
use std::ops::Deref;

use hashconsing::{consign, HConsed, HashConsign};

consign! {
    let EXPR = consign(64 * 1024 /* = capacity */) for Expr;
}

/// Placeholder written into clobbered registers so that reads of stale
/// values show up as a recognizable constant in models and traces.
pub const DEAD_VALUE: i32 = 0xDEAD_BEEFu32 as i32;

/// Result of a division or modulo by a constant zero. MIPS does not trap
/// on division by zero; the register contents are unpredictable, so the
/// engine pins them to a recognizable sentinel instead.
pub const DIV_BY_ZERO: i32 = 0x7777_7777;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Min,
    Max,
    Slt,
    Sltu,
    And,
    Or,
    Xor,
    Nor,
    Sll,
    Srl,
    Sra,
    MultLo,
    MultHi,
    MultuLo,
    MultuHi,
    Div,
    Divu,
    Mod,
    Modu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnaryOp {
    /// Zero-extend an 8-bit memory lane to 32 bits.
    ZebMem,
    /// Sign-extend an 8-bit memory lane to 32 bits.
    SebMem,
    /// Zero-extend a 16-bit memory lane to 32 bits.
    ZehMem,
    /// Sign-extend a 16-bit memory lane to 32 bits.
    SehMem,
    /// Sign-extend the low byte of a full-width register value.
    Seb,
    /// Sign-extend the low half-word of a full-width register value.
    Seh,
}

/// Signed comparisons; unsigned ones are built from `Sltu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConditionOp {
    Eq,
    Neq,
    Ge,
    Gt,
    Le,
    Lt,
}

/// A node of the expression IR. Nodes are immutable and hash-consed; use
/// the smart constructors on [`SymExpr`], which fold constants at
/// construction time. The interpreter depends on that folding: a branch
/// condition over concrete operands must come back as `Bool`, never as a
/// `Condition` over two `Const` children.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expr {
    Const(i32),
    Symbolic(String),
    /// Read of one byte from a captured memory array version. `None`
    /// addresses the unconstrained initial RAM array.
    Select {
        address: SymExpr,
        capture: Option<usize>,
    },
    /// Write-log entry produced by the memory model. Not independently
    /// solvable; it only appears inside memory captures.
    Store {
        address: SymExpr,
        value: SymExpr,
    },
    Concat {
        msb: SymExpr,
        lsb: SymExpr,
    },
    /// 8-bit field extract, `high - low + 1 == 8`.
    Extract {
        value: SymExpr,
        high: u32,
        low: u32,
    },
    /// Arbitrary-width extract, zero-extended back to 32 bits.
    ExtractZx {
        value: SymExpr,
        high: u32,
        low: u32,
    },
    Insert {
        dest: SymExpr,
        src: SymExpr,
        pos: u32,
        size: u32,
    },
    Binary(BinaryOp, SymExpr, SymExpr),
    Unary(UnaryOp, SymExpr),
    IfElse {
        cond: SymExpr,
        then: SymExpr,
        or_else: SymExpr,
    },
    Condition(ConditionOp, SymExpr, SymExpr),
    And(SymExpr, SymExpr),
    Or(SymExpr, SymExpr),
    Not(SymExpr),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SymExpr(HConsed<Expr>);

impl Deref for SymExpr {
    type Target = Expr;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Expr> for SymExpr {
    fn from(e: Expr) -> Self {
        Self(EXPR.mk(e))
    }
}

impl From<i32> for SymExpr {
    fn from(v: i32) -> Self {
        SymExpr::constant(v)
    }
}

impl From<bool> for SymExpr {
    fn from(v: bool) -> Self {
        SymExpr::bool(v)
    }
}

impl SymExpr {
    pub fn constant(value: i32) -> SymExpr {
        Expr::Const(value).into()
    }

    pub fn zero() -> SymExpr {
        Self::constant(0)
    }

    pub fn dead_value() -> SymExpr {
        Self::constant(DEAD_VALUE)
    }

    pub fn bool(value: bool) -> SymExpr {
        Expr::Bool(value).into()
    }

    pub fn symbolic(name: impl Into<String>) -> SymExpr {
        Expr::Symbolic(name.into()).into()
    }

    pub fn select(address: SymExpr, capture: Option<usize>) -> SymExpr {
        Expr::Select { address, capture }.into()
    }

    pub fn store(address: SymExpr, value: SymExpr) -> SymExpr {
        Expr::Store { address, value }.into()
    }

    pub fn concat(msb: SymExpr, lsb: SymExpr) -> SymExpr {
        Expr::Concat { msb, lsb }.into()
    }

    /// 8-bit field extract. Passing a range that is not exactly eight bits
    /// wide is a programmer error.
    pub fn extract(value: SymExpr, high: u32, low: u32) -> SymExpr {
        assert!(high >= low && high < 32);
        assert!(high - low + 1 == 8, "extract must produce an 8-bit value");
        match value.as_const() {
            Some(v) => Self::constant(extract_field(v, high, low)),
            None => Expr::Extract { value, high, low }.into(),
        }
    }

    /// Arbitrary-width extract, zero-extended to the full 32 bits.
    pub fn extract_zx(value: SymExpr, high: u32, low: u32) -> SymExpr {
        assert!(high >= low && high < 32);
        match value.as_const() {
            Some(v) => Self::constant(extract_field(v, high, low)),
            None => Expr::ExtractZx { value, high, low }.into(),
        }
    }

    pub fn insert(dest: SymExpr, src: SymExpr, pos: u32, size: u32) -> SymExpr {
        assert!(size >= 1 && pos + size <= 32);
        match (dest.as_const(), src.as_const()) {
            (Some(d), Some(s)) => {
                let (src_mask, dest_mask) = insert_masks(pos, size);
                Self::constant((d & dest_mask) | ((s & src_mask) << pos))
            }
            _ => Expr::Insert {
                dest,
                src,
                pos,
                size,
            }
            .into(),
        }
    }

    pub fn binary(op: BinaryOp, left: SymExpr, right: SymExpr) -> SymExpr {
        // The move pseudo-instruction assembles as `addu rd, rs, zero`;
        // dropping the `+ 0` keeps moved values node-identical.
        if op == BinaryOp::Add && right.as_const() == Some(0) {
            return left;
        }

        match (left.as_const(), right.as_const()) {
            (Some(l), Some(r)) => Self::constant(fold_binary(op, l, r)),
            _ => Expr::Binary(op, left, right).into(),
        }
    }

    pub fn unary(op: UnaryOp, value: SymExpr) -> SymExpr {
        match value.as_const() {
            Some(v) => Self::constant(fold_unary(op, v)),
            None => Expr::Unary(op, value).into(),
        }
    }

    pub fn if_else(cond: SymExpr, then: SymExpr, or_else: SymExpr) -> SymExpr {
        match cond.as_bool() {
            Some(true) => then,
            Some(false) => or_else,
            None => Expr::IfElse {
                cond,
                then,
                or_else,
            }
            .into(),
        }
    }

    pub fn condition(op: ConditionOp, left: SymExpr, right: SymExpr) -> SymExpr {
        match (left.as_const(), right.as_const()) {
            (Some(l), Some(r)) => Self::bool(match op {
                ConditionOp::Eq => l == r,
                ConditionOp::Neq => l != r,
                ConditionOp::Ge => l >= r,
                ConditionOp::Gt => l > r,
                ConditionOp::Le => l <= r,
                ConditionOp::Lt => l < r,
            }),
            _ => Expr::Condition(op, left, right).into(),
        }
    }

    pub fn and(left: SymExpr, right: SymExpr) -> SymExpr {
        match (left.as_bool(), right.as_bool()) {
            (Some(l), Some(r)) => Self::bool(l && r),
            _ => Expr::And(left, right).into(),
        }
    }

    pub fn or(left: SymExpr, right: SymExpr) -> SymExpr {
        match (left.as_bool(), right.as_bool()) {
            (Some(l), Some(r)) => Self::bool(l || r),
            _ => Expr::Or(left, right).into(),
        }
    }

    pub fn not(value: SymExpr) -> SymExpr {
        match value.as_bool() {
            Some(v) => Self::bool(!v),
            None => Expr::Not(value).into(),
        }
    }

    /// Stable identity of the interned node; the key of the solver-side
    /// translation caches.
    pub fn uid(&self) -> u64 {
        self.0.uid()
    }

    pub fn as_const(&self) -> Option<i32> {
        match **self {
            Expr::Const(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match **self {
            Expr::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(
            **self,
            Expr::Condition(..) | Expr::And(..) | Expr::Or(..) | Expr::Not(..) | Expr::Bool(..)
        )
    }
}

fn extract_field(value: i32, high: u32, low: u32) -> i32 {
    let left_shift = 32 - high - 1;
    (((value << left_shift) as u32) >> (low + left_shift)) as i32
}

fn insert_masks(pos: u32, size: u32) -> (i32, i32) {
    let src_mask = (u32::MAX >> ((32 - size) & 31)) as i32;
    let dest_mask = !(src_mask << pos);
    (src_mask, dest_mask)
}

fn fold_binary(op: BinaryOp, l: i32, r: i32) -> i32 {
    match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Sub => l.wrapping_sub(r),
        BinaryOp::Min => l.min(r),
        BinaryOp::Max => l.max(r),
        BinaryOp::Slt => (l < r) as i32,
        BinaryOp::Sltu => ((l as u32) < (r as u32)) as i32,
        BinaryOp::And => l & r,
        BinaryOp::Or => l | r,
        BinaryOp::Xor => l ^ r,
        BinaryOp::Nor => !(l | r),
        // Shift amounts take only the low five bits, as the hardware does.
        BinaryOp::Sll => l.wrapping_shl(r as u32),
        BinaryOp::Srl => ((l as u32).wrapping_shr(r as u32)) as i32,
        BinaryOp::Sra => l.wrapping_shr(r as u32),
        BinaryOp::MultLo => ((l as i64).wrapping_mul(r as i64)) as i32,
        BinaryOp::MultHi => (((l as i64).wrapping_mul(r as i64) as u64) >> 32) as i32,
        BinaryOp::MultuLo => ((l as u32 as u64).wrapping_mul(r as u32 as u64)) as i32,
        BinaryOp::MultuHi => ((l as u32 as u64).wrapping_mul(r as u32 as u64) >> 32) as i32,
        BinaryOp::Div => {
            if r == 0 {
                DIV_BY_ZERO
            } else {
                l.wrapping_div(r)
            }
        }
        BinaryOp::Divu => {
            if r == 0 {
                DIV_BY_ZERO
            } else {
                ((l as u32) / (r as u32)) as i32
            }
        }
        BinaryOp::Mod => {
            if r == 0 {
                DIV_BY_ZERO
            } else {
                l.wrapping_rem(r)
            }
        }
        BinaryOp::Modu => {
            if r == 0 {
                DIV_BY_ZERO
            } else {
                ((l as u32) % (r as u32)) as i32
            }
        }
    }
}

fn fold_unary(op: UnaryOp, v: i32) -> i32 {
    match op {
        // Memory lanes carry already-masked byte/half constants, so the
        // zero-extending variants are the identity on constants.
        UnaryOp::ZebMem => v,
        UnaryOp::ZehMem => v,
        UnaryOp::SebMem | UnaryOp::Seb => (v << 24) >> 24,
        UnaryOp::SehMem | UnaryOp::Seh => (v << 16) >> 16,
    }
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{:#010x}", *v as u32),
            Expr::Symbolic(name) => write!(f, "{}", name),
            Expr::Select { address, capture } => match capture {
                Some(i) => write!(f, "select({}, mem{})", address, i),
                None => write!(f, "select({}, ram)", address),
            },
            Expr::Store { address, value } => write!(f, "store({}, {})", address, value),
            Expr::Concat { msb, lsb } => write!(f, "({} ++ {})", msb, lsb),
            Expr::Extract { value, high, low } => {
                write!(f, "extract({}, {}, {})", value, high, low)
            }
            Expr::ExtractZx { value, high, low } => {
                write!(f, "extract-zx({}, {}, {})", value, high, low)
            }
            Expr::Insert {
                dest,
                src,
                pos,
                size,
            } => write!(f, "insert({}, {}, pos={}, size={})", dest, src, pos, size),
            Expr::Binary(op, l, r) => write!(f, "{:?}({}, {})", op, l, r),
            Expr::Unary(op, v) => write!(f, "{:?}({})", op, v),
            Expr::IfElse {
                cond,
                then,
                or_else,
            } => write!(f, "if {} then {} else {}", cond, then, or_else),
            Expr::Condition(op, l, r) => write!(f, "{:?}({}, {})", op, l, r),
            Expr::And(l, r) => write!(f, "({} && {})", l, r),
            Expr::Or(l, r) => write!(f, "({} || {})", l, r),
            Expr::Not(v) => write!(f, "!{}", v),
            Expr::Bool(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_constructors_fold_constants() {
        let cases = [
            (BinaryOp::Add, 3, 4, 7),
            (BinaryOp::Add, i32::MAX, 1, i32::MIN),
            (BinaryOp::Sub, 3, 4, -1),
            (BinaryOp::Min, -2, 7, -2),
            (BinaryOp::Max, -2, 7, 7),
            (BinaryOp::Slt, -1, 0, 1),
            (BinaryOp::Sltu, -1, 0, 0),
            (BinaryOp::And, 0b1100, 0b1010, 0b1000),
            (BinaryOp::Or, 0b1100, 0b1010, 0b1110),
            (BinaryOp::Xor, 0b1100, 0b1010, 0b0110),
            (BinaryOp::Nor, 0, 0, -1),
            (BinaryOp::Sll, 1, 33, 2),
            (BinaryOp::Srl, -1, 28, 0xf),
            (BinaryOp::Sra, i32::MIN, 31, -1),
            (BinaryOp::MultLo, 0x10000, 0x10000, 0),
            (BinaryOp::MultHi, 0x10000, 0x10000, 1),
            (BinaryOp::MultuLo, -1, 2, -2),
            (BinaryOp::MultuHi, -1, 2, 1),
            (BinaryOp::Div, 7, -2, -3),
            (BinaryOp::Divu, -1, 2, i32::MAX),
            (BinaryOp::Mod, 7, -2, 1),
            (BinaryOp::Modu, -1, 16, 15),
        ];
        for (op, l, r, expected) in cases {
            let e = SymExpr::binary(op, SymExpr::constant(l), SymExpr::constant(r));
            assert_eq!(e.as_const(), Some(expected), "{:?}({}, {})", op, l, r);
        }
    }

    #[test]
    fn division_by_constant_zero_folds_to_sentinel() {
        for op in [BinaryOp::Div, BinaryOp::Divu, BinaryOp::Mod, BinaryOp::Modu] {
            let e = SymExpr::binary(op, SymExpr::constant(1234), SymExpr::zero());
            assert_eq!(e.as_const(), Some(DIV_BY_ZERO));
        }
    }

    #[test]
    fn unary_constructors_fold_constants() {
        let e = SymExpr::unary(UnaryOp::SebMem, SymExpr::constant(0xFF));
        assert_eq!(e.as_const(), Some(-1));
        let e = SymExpr::unary(UnaryOp::SehMem, SymExpr::constant(0x8000));
        assert_eq!(e.as_const(), Some(-0x8000));
        let e = SymExpr::unary(UnaryOp::Seb, SymExpr::constant(0x1FF));
        assert_eq!(e.as_const(), Some(-1));
        let e = SymExpr::unary(UnaryOp::ZebMem, SymExpr::constant(0x7F));
        assert_eq!(e.as_const(), Some(0x7F));
    }

    #[test]
    fn condition_constructors_fold_to_bool() {
        let l = SymExpr::constant(-5);
        let r = SymExpr::constant(3);
        assert_eq!(
            SymExpr::condition(ConditionOp::Lt, l.clone(), r.clone()).as_bool(),
            Some(true)
        );
        assert_eq!(
            SymExpr::condition(ConditionOp::Eq, l.clone(), r.clone()).as_bool(),
            Some(false)
        );
        let c = SymExpr::condition(ConditionOp::Lt, l, r);
        assert_eq!(SymExpr::not(c.clone()).as_bool(), Some(false));
        assert_eq!(
            SymExpr::and(c.clone(), SymExpr::bool(true)).as_bool(),
            Some(true)
        );
        assert_eq!(SymExpr::or(SymExpr::bool(false), c).as_bool(), Some(true));
    }

    #[test]
    fn symbolic_operands_stay_symbolic() {
        let x = SymExpr::symbolic("x");
        let e = SymExpr::binary(BinaryOp::Add, x.clone(), SymExpr::constant(1));
        assert!(e.as_const().is_none());
        let c = SymExpr::condition(ConditionOp::Gt, x, SymExpr::zero());
        assert!(c.as_bool().is_none());
        assert!(c.is_bool());
    }

    #[test]
    fn add_zero_is_move_elimination() {
        let x = SymExpr::symbolic("x");
        let e = SymExpr::binary(BinaryOp::Add, x.clone(), SymExpr::zero());
        assert_eq!(e.uid(), x.uid());
    }

    #[test]
    fn extract_folds_constant_fields() {
        let v = SymExpr::constant(0x1234_5678);
        assert_eq!(SymExpr::extract(v.clone(), 7, 0).as_const(), Some(0x78));
        assert_eq!(SymExpr::extract(v.clone(), 15, 8).as_const(), Some(0x56));
        assert_eq!(SymExpr::extract(v.clone(), 31, 24).as_const(), Some(0x12));
        assert_eq!(SymExpr::extract_zx(v, 19, 4).as_const(), Some(0x4567));
    }

    #[test]
    #[should_panic]
    fn extract_rejects_non_byte_ranges() {
        SymExpr::extract(SymExpr::symbolic("x"), 15, 0);
    }

    #[test]
    fn insert_folds_constant_fields() {
        let e = SymExpr::insert(
            SymExpr::constant(0x0000_00FF),
            SymExpr::constant(0xA),
            8,
            4,
        );
        assert_eq!(e.as_const(), Some(0x0000_0AFF));
        let full = SymExpr::insert(SymExpr::zero(), SymExpr::constant(-1), 0, 32);
        assert_eq!(full.as_const(), Some(-1));
    }

    #[test]
    fn if_else_folds_on_concrete_condition() {
        let t = SymExpr::constant(1);
        let f = SymExpr::constant(2);
        let e = SymExpr::if_else(SymExpr::bool(true), t.clone(), f.clone());
        assert_eq!(e.uid(), t.uid());
        let e = SymExpr::if_else(SymExpr::bool(false), t, f.clone());
        assert_eq!(e.uid(), f.uid());
    }
}
