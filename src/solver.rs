use std::sync::Arc;
use std::time::Duration;

use boolector::option::{BtorOption, ModelGen};
use boolector::{Array, Btor, SolverResult, BV};

use fxhash::FxHashMap as HashMap;
use itertools::Itertools;
use log::trace;

use crate::expr::{BinaryOp, ConditionOp, Expr, SymExpr, UnaryOp, DIV_BY_ZERO};
use crate::memory::StoreOp;

/// Timeout for ordinary branch-feasibility checks.
pub const SOLVER_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout for jump-target resolution and path finalization, where an
/// UNKNOWN costs a whole path rather than one branch direction.
pub const EXTENDED_SOLVER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    Sat,
    Unsat,
    Unknown,
}

/// Incremental Boolector instance owned by a single execution context.
///
/// Translation is cached per hash-consed node uid; since structurally
/// equal expressions intern to the same node, the cache is hit for every
/// repeated subterm. Memory captures are materialized once each as SMT
/// array versions, capture *i* folding its stores over version *i - 1*.
pub struct Solver {
    btor: Arc<Btor>,
    vars: HashMap<String, BV<Arc<Btor>>>,
    node_cache: HashMap<u64, BV<Arc<Btor>>>,
    ram: Array<Arc<Btor>>,
    memory_versions: Vec<Array<Arc<Btor>>>,
}

impl Solver {
    pub fn new() -> Self {
        let btor = Arc::new(Btor::new());
        btor.set_opt(BtorOption::ModelGen(ModelGen::All));
        btor.set_opt(BtorOption::Incremental(true));
        let ram = Array::new(btor.clone(), 32, 8, Some("ram"));
        Self {
            btor,
            vars: HashMap::default(),
            node_cache: HashMap::default(),
            ram,
            memory_versions: Vec::new(),
        }
    }

    /// Assert a boolean expression as a permanent path constraint.
    pub fn assert(&mut self, constraint: &SymExpr, captures: &[Arc<Vec<StoreOp>>]) {
        assert!(constraint.is_bool(), "assertions must be boolean");
        self.sync_memory(captures);
        self.translate(constraint, captures).assert();
    }

    pub fn check(&mut self, timeout: Duration) -> CheckResult {
        self.btor.set_opt(BtorOption::SolverTimeout(Some(timeout)));
        let result = match self.btor.sat() {
            SolverResult::Sat => CheckResult::Sat,
            SolverResult::Unsat => CheckResult::Unsat,
            SolverResult::Unknown => CheckResult::Unknown,
        };
        trace!("solver check: {:?}", result);
        result
    }

    /// Read a satisfying assignment for a 32-bit expression.
    ///
    /// With `complete = false` the result is `None` when the model leaves
    /// any bit unconstrained; retrying with `complete = true` pins the
    /// don't-care bits to zero.
    pub fn eval(
        &mut self,
        expr: &SymExpr,
        captures: &[Arc<Vec<StoreOp>>],
        complete: bool,
    ) -> Option<i32> {
        if let Some(v) = expr.as_const() {
            return Some(v);
        }
        self.sync_memory(captures);

        self.btor.push(1);
        let ast = self.translate(expr, captures);
        let value = if self.check(SOLVER_TIMEOUT) == CheckResult::Sat {
            let solution = ast.get_a_solution();
            if complete {
                solution.disambiguate().as_u64().map(|v| v as u32 as i32)
            } else {
                solution.as_u64().map(|v| v as u32 as i32)
            }
        } else {
            None
        };
        self.btor.pop(1);
        // Translations made under the popped frame are gone.
        self.node_cache.clear();
        value
    }

    /// Assignment of every declared symbolic variable in the current
    /// model. Valid after a SAT [`Solver::check`].
    pub fn variable_assignments(&self) -> Vec<(String, i32)> {
        self.vars
            .iter()
            .filter_map(|(name, bv)| {
                let v = bv.get_a_solution().disambiguate().as_u64()?;
                Some((name.clone(), v as u32 as i32))
            })
            .sorted()
            .collect()
    }

    fn sync_memory(&mut self, captures: &[Arc<Vec<StoreOp>>]) {
        while self.memory_versions.len() < captures.len() {
            let i = self.memory_versions.len();
            let mut version = match i {
                0 => self.ram.clone(),
                _ => self.memory_versions[i - 1].clone(),
            };
            for store in captures[i].iter() {
                let address = self.translate(&store.address, captures);
                let value = self.translate_lane(&store.value, captures);
                version = version.write(&address, &value);
            }
            self.memory_versions.push(version);
        }
    }

    fn memory_version(&self, capture: Option<usize>) -> Array<Arc<Btor>> {
        match capture {
            None => self.ram.clone(),
            Some(i) => self.memory_versions[i].clone(),
        }
    }

    /// Translate a byte-lane expression to exactly eight bits.
    fn translate_lane(
        &mut self,
        expr: &SymExpr,
        captures: &[Arc<Vec<StoreOp>>],
    ) -> BV<Arc<Btor>> {
        let ast = self.translate(expr, captures);
        match ast.get_width() {
            8 => ast,
            w => ast.slice(7.min(w - 1), 0),
        }
    }

    /// Recursive translation. Full-width values are 32 bits, byte lanes
    /// (`Extract`, `Select`) 8, half lanes 16, booleans 1.
    fn translate(&mut self, expr: &SymExpr, captures: &[Arc<Vec<StoreOp>>]) -> BV<Arc<Btor>> {
        if let Some(cached) = self.node_cache.get(&expr.uid()) {
            return cached.clone();
        }

        let ast = match &**expr {
            Expr::Const(v) => BV::from_u32(self.btor.clone(), *v as u32, 32),
            Expr::Bool(b) => BV::from_bool(self.btor.clone(), *b),
            Expr::Symbolic(name) => match self.vars.get(name) {
                Some(bv) => bv.clone(),
                None => {
                    let bv = BV::new(self.btor.clone(), 32, Some(name));
                    self.vars.insert(name.clone(), bv.clone());
                    bv
                }
            },
            Expr::Select { address, capture } => {
                let array = self.memory_version(*capture);
                let address = self.translate(address, captures);
                array.read(&address)
            }
            Expr::Store { .. } => panic!("store nodes are not directly solvable"),
            Expr::Concat { msb, lsb } => {
                let msb = self.translate(msb, captures);
                let lsb = self.translate(lsb, captures);
                msb.concat(&lsb)
            }
            Expr::Extract { value, high, low } => {
                let value = self.translate(value, captures);
                value.slice(*high, *low)
            }
            Expr::ExtractZx { value, high, low } => {
                let width = high - low + 1;
                let value = self.translate(value, captures);
                value.slice(*high, *low).uext(32 - width)
            }
            Expr::Insert {
                dest,
                src,
                pos,
                size,
            } => {
                let dest = self.translate(dest, captures);
                let src = self.translate(src, captures);
                let mut out = src.slice(size - 1, 0);
                if *pos > 0 {
                    out = out.concat(&dest.slice(pos - 1, 0));
                }
                if pos + size < 32 {
                    out = dest.slice(31, pos + size).concat(&out);
                }
                out
            }
            Expr::Binary(op, left, right) => {
                let l = self.translate(left, captures);
                let r = self.translate(right, captures);
                self.translate_binary(*op, l, r)
            }
            Expr::Unary(op, value) => {
                let v = self.translate(value, captures);
                match op {
                    UnaryOp::ZebMem | UnaryOp::ZehMem => v.uext(32 - v.get_width()),
                    UnaryOp::SebMem | UnaryOp::SehMem => v.sext(32 - v.get_width()),
                    UnaryOp::Seb => v.slice(7, 0).sext(24),
                    UnaryOp::Seh => v.slice(15, 0).sext(16),
                }
            }
            Expr::IfElse {
                cond,
                then,
                or_else,
            } => {
                let cond = self.translate(cond, captures);
                let then = self.translate(then, captures);
                let or_else = self.translate(or_else, captures);
                cond.cond_bv(&then, &or_else)
            }
            Expr::Condition(op, left, right) => {
                let l = self.translate(left, captures);
                let r = self.translate(right, captures);
                match op {
                    ConditionOp::Eq => l._eq(&r),
                    ConditionOp::Neq => l._ne(&r),
                    ConditionOp::Ge => l.sgte(&r),
                    ConditionOp::Gt => l.sgt(&r),
                    ConditionOp::Le => l.slte(&r),
                    ConditionOp::Lt => l.slt(&r),
                }
            }
            Expr::And(left, right) => {
                let l = self.translate(left, captures);
                let r = self.translate(right, captures);
                l.and(&r)
            }
            Expr::Or(left, right) => {
                let l = self.translate(left, captures);
                let r = self.translate(right, captures);
                l.or(&r)
            }
            Expr::Not(value) => self.translate(value, captures).not(),
        };

        self.node_cache.insert(expr.uid(), ast.clone());
        ast
    }

    fn translate_binary(
        &mut self,
        op: BinaryOp,
        l: BV<Arc<Btor>>,
        r: BV<Arc<Btor>>,
    ) -> BV<Arc<Btor>> {
        match op {
            BinaryOp::Add => l.add(&r),
            BinaryOp::Sub => l.sub(&r),
            BinaryOp::Min => l.slt(&r).cond_bv(&l, &r),
            BinaryOp::Max => l.sgt(&r).cond_bv(&l, &r),
            BinaryOp::Slt => l.slt(&r).uext(31),
            BinaryOp::Sltu => l.ult(&r).uext(31),
            BinaryOp::And => l.and(&r),
            BinaryOp::Or => l.or(&r),
            BinaryOp::Xor => l.xor(&r),
            BinaryOp::Nor => l.or(&r).not(),
            BinaryOp::Sll => l.sll(&self.shift_amount(r)),
            BinaryOp::Srl => l.srl(&self.shift_amount(r)),
            BinaryOp::Sra => l.sra(&self.shift_amount(r)),
            BinaryOp::MultLo => l.mul(&r),
            BinaryOp::MultHi => l.sext(32).mul(&r.sext(32)).slice(63, 32),
            BinaryOp::MultuLo => l.mul(&r),
            BinaryOp::MultuHi => l.uext(32).mul(&r.uext(32)).slice(63, 32),
            BinaryOp::Div => self.guard_div_by_zero(&r, l.sdiv(&r)),
            BinaryOp::Divu => self.guard_div_by_zero(&r, l.udiv(&r)),
            BinaryOp::Mod => self.guard_div_by_zero(&r, l.srem(&r)),
            BinaryOp::Modu => self.guard_div_by_zero(&r, l.urem(&r)),
        }
    }

    // Hardware shifts consume only the low five bits of the amount.
    fn shift_amount(&self, r: BV<Arc<Btor>>) -> BV<Arc<Btor>> {
        r.and(&BV::from_u32(self.btor.clone(), 0x1F, 32))
    }

    fn guard_div_by_zero(&self, divisor: &BV<Arc<Btor>>, quotient: BV<Arc<Btor>>) -> BV<Arc<Btor>> {
        let zero = BV::zero(self.btor.clone(), 32);
        let sentinel = BV::from_u32(self.btor.clone(), DIV_BY_ZERO as u32, 32);
        divisor._eq(&zero).cond_bv(&sentinel, &quotient)
    }
}

impl Default for Solver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;

    #[test]
    fn constant_conditions_check_without_variables() {
        let mut solver = Solver::new();
        let x = SymExpr::symbolic("x");
        let cond = SymExpr::condition(ConditionOp::Gt, x, SymExpr::constant(10));
        solver.assert(&cond, &[]);
        assert_eq!(solver.check(SOLVER_TIMEOUT), CheckResult::Sat);

        let model = solver.variable_assignments();
        assert_eq!(model.len(), 1);
        assert_eq!(model[0].0, "x");
        assert!(model[0].1 > 10);
    }

    #[test]
    fn contradictory_constraints_are_unsat() {
        let mut solver = Solver::new();
        let x = SymExpr::symbolic("x");
        solver.assert(
            &SymExpr::condition(ConditionOp::Gt, x.clone(), SymExpr::constant(10)),
            &[],
        );
        solver.assert(
            &SymExpr::condition(ConditionOp::Lt, x, SymExpr::constant(-10)),
            &[],
        );
        assert_eq!(solver.check(SOLVER_TIMEOUT), CheckResult::Unsat);
    }

    #[test]
    fn eval_returns_a_model_value() {
        let mut solver = Solver::new();
        let x = SymExpr::symbolic("x");
        let sum = SymExpr::binary(BinaryOp::Add, x.clone(), SymExpr::constant(1));
        solver.assert(
            &SymExpr::condition(ConditionOp::Eq, x, SymExpr::constant(41)),
            &[],
        );
        assert_eq!(solver.check(SOLVER_TIMEOUT), CheckResult::Sat);
        assert_eq!(solver.eval(&sum, &[], true), Some(42));
    }

    #[test]
    fn memory_select_reaches_through_captures() {
        let mut memory = Memory::new();
        memory
            .write_word(SymExpr::constant(0x1000), SymExpr::constant(0x0A0B_0C0D))
            .unwrap();
        let p = SymExpr::symbolic("p");
        let byte = memory.read_byte(p.clone(), true);

        let mut solver = Solver::new();
        solver.assert(
            &SymExpr::condition(ConditionOp::Eq, p, SymExpr::constant(0x1000)),
            memory.captures(),
        );
        solver.assert(
            &SymExpr::condition(ConditionOp::Eq, byte.clone(), SymExpr::constant(0x0D)),
            memory.captures(),
        );
        assert_eq!(solver.check(SOLVER_TIMEOUT), CheckResult::Sat);
        assert_eq!(solver.eval(&byte, memory.captures(), true), Some(0x0D));
    }

    #[test]
    fn signed_division_guard_produces_sentinel() {
        let mut solver = Solver::new();
        let d = SymExpr::symbolic("d");
        let q = SymExpr::binary(BinaryOp::Div, SymExpr::constant(100), d.clone());
        solver.assert(
            &SymExpr::condition(ConditionOp::Eq, d, SymExpr::zero()),
            &[],
        );
        assert_eq!(solver.check(SOLVER_TIMEOUT), CheckResult::Sat);
        assert_eq!(solver.eval(&q, &[], true), Some(DIV_BY_ZERO));
    }
}
