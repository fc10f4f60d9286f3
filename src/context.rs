use std::collections::VecDeque;
use std::time::Duration;

use fxhash::{FxHashMap, FxHashSet};
use log::debug;

use crate::expr::SymExpr;
use crate::machine::Reg;
use crate::memory::Memory;
use crate::solver::{CheckResult, Solver};
use crate::trace::TraceElement;

/// A branch direction committed to by a path: at `address` the path went
/// to `taken_pc` under `condition`.
#[derive(Debug, Clone)]
pub struct PathDecision {
    pub address: u32,
    pub taken_pc: u32,
    pub condition: SymExpr,
}

/// Named per-context counters; function handlers use them to number
/// per-invocation symbolic results so that repeated calls stay
/// distinguishable.
#[derive(Debug, Clone, Default)]
pub struct FunctionStates(FxHashMap<String, u32>);

impl FunctionStates {
    pub fn next(&mut self, name: &str) -> u32 {
        let counter = self.0.entry(name.to_owned()).or_insert(0);
        let value = *counter;
        *counter += 1;
        value
    }

    pub fn snapshot(&self) -> FxHashMap<String, u32> {
        self.0.clone()
    }
}

/// The complete state of one execution path: register file, memory,
/// committed branch decisions and the lazily created solver backing them.
///
/// Contexts fork at symbolic branches; [`Context::fork`] copies everything
/// except the solver, which the forked path rebuilds from its assumptions
/// and decisions on first use.
pub struct Context {
    gprs: [SymExpr; 32],
    lo: SymExpr,
    hi: SymExpr,
    pc: u32,
    pub memory: Memory,
    pub function_states: FunctionStates,
    paths: Vec<PathDecision>,
    assumptions: Vec<SymExpr>,
    solver: Option<Solver>,
    branch_counters: FxHashMap<(u32, u32), u32>,
    specific_branches: VecDeque<bool>,
    replay: bool,
    trace: Option<Vec<TraceElement>>,
    pub(crate) executed_instrs: u32,
    pub(crate) executed_addresses: FxHashSet<u32>,
    pub(crate) break_raised: bool,
    /// Set when the newest path decision has not been solver-checked yet;
    /// the engine checks it before executing any further instruction.
    pub(crate) pending_solve: bool,
}

impl Context {
    /// Fresh context with a zeroed register file.
    pub fn new(entry: u32) -> Self {
        Self {
            gprs: std::array::from_fn(|_| SymExpr::zero()),
            lo: SymExpr::zero(),
            hi: SymExpr::zero(),
            pc: entry,
            memory: Memory::new(),
            function_states: FunctionStates::default(),
            paths: Vec::new(),
            assumptions: Vec::new(),
            solver: None,
            branch_counters: FxHashMap::default(),
            specific_branches: VecDeque::new(),
            replay: false,
            trace: None,
            executed_instrs: 0,
            executed_addresses: FxHashSet::default(),
            break_raised: false,
            pending_solve: false,
        }
    }

    /// Context whose register file is fully symbolic, except that the
    /// callee-saved registers are pinned to the dead-value sentinel; code
    /// under test has to restore those itself before they matter.
    pub fn fully_symbolic(entry: u32) -> Self {
        let mut ctx = Self::new(entry);
        for reg in Reg::ALL.into_iter().skip(1) {
            ctx.set(reg, SymExpr::symbolic(reg.name()));
        }
        for reg in Reg::CALLEE_SAVED {
            ctx.set(reg, SymExpr::dead_value());
        }
        ctx.lo = SymExpr::symbolic("lo");
        ctx.hi = SymExpr::symbolic("hi");
        ctx
    }

    /// Copy for a forked path. The solver is not carried over; it is
    /// recreated on demand from the copied assumptions and decisions.
    pub fn fork(&self) -> Self {
        Self {
            gprs: self.gprs.clone(),
            lo: self.lo.clone(),
            hi: self.hi.clone(),
            pc: self.pc,
            memory: self.memory.clone(),
            function_states: self.function_states.clone(),
            paths: self.paths.clone(),
            assumptions: self.assumptions.clone(),
            solver: None,
            branch_counters: self.branch_counters.clone(),
            specific_branches: self.specific_branches.clone(),
            replay: self.replay,
            trace: self.trace.clone(),
            executed_instrs: self.executed_instrs,
            executed_addresses: self.executed_addresses.clone(),
            break_raised: self.break_raised,
            pending_solve: self.pending_solve,
        }
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    pub fn get(&self, reg: Reg) -> SymExpr {
        self.gprs[reg.index()].clone()
    }

    pub fn set(&mut self, reg: Reg, value: SymExpr) {
        if reg != Reg::Zero {
            self.gprs[reg.index()] = value;
        }
    }

    pub fn lo(&self) -> SymExpr {
        self.lo.clone()
    }

    pub fn hi(&self) -> SymExpr {
        self.hi.clone()
    }

    pub fn set_lo(&mut self, value: SymExpr) {
        self.lo = value;
    }

    pub fn set_hi(&mut self, value: SymExpr) {
        self.hi = value;
    }

    /// Add a global assumption over the symbolic inputs.
    ///
    /// Assumptions must all be in place before the solver first runs;
    /// adding one later is a programmer error.
    pub fn assume(&mut self, constraint: SymExpr) {
        assert!(
            self.solver.is_none(),
            "assumptions must be added before the solver is first used"
        );
        assert!(constraint.is_bool());
        self.assumptions.push(constraint);
    }

    /// Add a constraint mid-execution, e.g. from a function handler
    /// pinning a fresh symbolic result to its allowed values. Unlike
    /// [`Context::assume`] this is valid with a live solver.
    pub fn constrain(&mut self, constraint: SymExpr) {
        assert!(constraint.is_bool());
        if let Some(solver) = self.solver.as_mut() {
            solver.assert(&constraint, self.memory.captures());
        }
        self.assumptions.push(constraint);
    }

    pub fn add_path_decision(&mut self, decision: PathDecision) {
        if let Some(solver) = self.solver.as_mut() {
            solver.assert(&decision.condition, self.memory.captures());
        }
        debug!(
            "[{:#010x}] path decision towards {:#010x}: {}",
            decision.address, decision.taken_pc, decision.condition
        );
        self.paths.push(decision);
        self.pending_solve = true;
    }

    pub fn path_decisions(&self) -> &[PathDecision] {
        &self.paths
    }

    /// Solver over the accumulated assumptions and path decisions,
    /// creating and re-asserting on first use after a fork.
    pub fn solver(&mut self) -> &mut Solver {
        if self.solver.is_none() {
            let mut solver = Solver::new();
            for assumption in &self.assumptions {
                solver.assert(assumption, self.memory.captures());
            }
            for decision in &self.paths {
                solver.assert(&decision.condition, self.memory.captures());
            }
            self.solver = Some(solver);
        }
        self.solver.as_mut().expect("solver was just created")
    }

    pub fn check(&mut self, timeout: Duration) -> CheckResult {
        self.solver();
        let Self { solver, .. } = self;
        solver.as_mut().expect("solver exists").check(timeout)
    }

    pub fn eval(&mut self, expr: &SymExpr, complete: bool) -> Option<i32> {
        self.solver();
        let Self { solver, memory, .. } = self;
        solver
            .as_mut()
            .expect("solver exists")
            .eval(expr, memory.captures(), complete)
    }

    /// Release the solver and its SMT state; the context remains usable,
    /// a later query rebuilds the solver.
    pub fn release_solver(&mut self) {
        self.solver = None;
    }

    pub fn branch_edge(&self, from: u32, to: u32) -> u32 {
        self.branch_counters.get(&(from, to)).copied().unwrap_or(0)
    }

    /// Count a traversal of the branch edge `from -> to` and return the
    /// new count.
    pub fn bump_branch_edge(&mut self, from: u32, to: u32) -> u32 {
        let counter = self.branch_counters.entry((from, to)).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Recorded branch outcomes; when set the engine replays exactly this
    /// path instead of forking.
    pub fn set_specific_branches(&mut self, outcomes: impl IntoIterator<Item = bool>) {
        self.specific_branches = outcomes.into_iter().collect();
        self.replay = true;
    }

    pub(crate) fn is_replay(&self) -> bool {
        self.replay
    }

    pub(crate) fn pop_specific_branch(&mut self) -> Option<bool> {
        self.specific_branches.pop_front()
    }

    pub fn enable_trace(&mut self) {
        if self.trace.is_none() {
            self.trace = Some(Vec::new());
        }
    }

    pub(crate) fn record(&mut self, element: impl FnOnce() -> TraceElement) {
        if let Some(trace) = self.trace.as_mut() {
            trace.push(element());
        }
    }

    pub fn take_trace(&mut self) -> Vec<TraceElement> {
        self.trace.take().unwrap_or_default()
    }

    pub fn executed_addresses(&self) -> &FxHashSet<u32> {
        &self.executed_addresses
    }

    pub fn executed_instrs(&self) -> u32 {
        self.executed_instrs
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("pc", &format_args!("{:#010x}", self.pc))
            .field("paths", &self.paths.len())
            .field("executed_instrs", &self.executed_instrs)
            .field("has_solver", &self.solver.is_some())
            .finish()
    }
}
