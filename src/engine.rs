use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use fxhash::{FxHashMap, FxHashSet};
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::context::{Context, PathDecision};
use crate::expr::{BinaryOp, ConditionOp, SymExpr, UnaryOp};
use crate::hooks::FunctionLibrary;
use crate::machine::{BinLoader, DisasmError, Disassembler, Instr, ModuleInfo, Opcode, Operand, Reg};
use crate::memory::MemoryError;
use crate::solver::{CheckResult, EXTENDED_SOLVER_TIMEOUT, SOLVER_TIMEOUT};
use crate::trace::{FinishedPath, PathSink, TraceElement};

/// Sentinel return address; a `jr ra` landing here means the function
/// under execution returned to its caller.
pub const RETURN_TOKEN: u32 = 0x1224_4896;

/// Stack pointer at function entry.
pub const INITIAL_SP: u32 = 0x09FF_FE90;

/// Concrete addresses in this range are treated as stack slots of the
/// function under execution.
pub const ASSUMED_SP_RANGE: std::ops::RangeInclusive<u32> = (INITIAL_SP - 0x10000)..=INITIAL_SP;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Disasm(#[from] DisasmError),
    #[error("symbolic branch condition at {address:#010x} in concrete mode")]
    SymbolicBranch { address: u32 },
    #[error("replay queue exhausted at branch {address:#010x}")]
    ReplayExhausted { address: u32 },
    #[error("branch at {address:#010x} evaluated to {actual}, recording expected {expected}")]
    ReplayDivergence {
        address: u32,
        actual: bool,
        expected: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// The current context is done on this worker: finished, dropped, or
    /// handed to the queue.
    Yield,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub max_executed_instructions: u32,
    /// Per-context traversal cap of a single branch edge.
    pub branching_limit: u32,
    /// Run-wide traversal cap of a single branch edge.
    pub global_branching_limit: u32,
    pub parallelism: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_executed_instructions: 10_000,
            branching_limit: 256,
            global_branching_limit: i32::MAX as u32 / 2,
            parallelism: 16,
        }
    }
}

#[derive(Debug, Default)]
pub struct EngineStats {
    finished_paths: AtomicUsize,
    dropped_paths: AtomicUsize,
    symbolic_branches: AtomicUsize,
    sat_results: AtomicUsize,
    unsat_results: AtomicUsize,
    unknown_results: AtomicUsize,
    failed_jump_resolutions: AtomicUsize,
    failed_finish_solves: AtomicUsize,
    breaks: AtomicUsize,
    execution_errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStatsSnapshot {
    pub finished_paths: usize,
    pub dropped_paths: usize,
    pub symbolic_branches: usize,
    pub sat_results: usize,
    pub unsat_results: usize,
    pub unknown_results: usize,
    pub failed_jump_resolutions: usize,
    pub failed_finish_solves: usize,
    pub breaks: usize,
    pub execution_errors: usize,
}

impl EngineStats {
    fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            finished_paths: self.finished_paths.load(Ordering::Relaxed),
            dropped_paths: self.dropped_paths.load(Ordering::Relaxed),
            symbolic_branches: self.symbolic_branches.load(Ordering::Relaxed),
            sat_results: self.sat_results.load(Ordering::Relaxed),
            unsat_results: self.unsat_results.load(Ordering::Relaxed),
            unknown_results: self.unknown_results.load(Ordering::Relaxed),
            failed_jump_resolutions: self.failed_jump_resolutions.load(Ordering::Relaxed),
            failed_finish_solves: self.failed_finish_solves.load(Ordering::Relaxed),
            breaks: self.breaks.load(Ordering::Relaxed),
            execution_errors: self.execution_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) -> usize {
        counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Hands forked contexts back to the work queue. `live` counts contexts
/// that are queued or executing; workers shut down once it reaches zero.
struct Scheduler<'s> {
    tx: &'s Sender<Context>,
    live: &'s AtomicUsize,
}

impl Scheduler<'_> {
    fn spawn(&self, ctx: Context) {
        self.live.fetch_add(1, Ordering::SeqCst);
        // Receivers only disconnect after live hits zero.
        let _ = self.tx.send(ctx);
    }
}

/// Decrements `live` when the task ends, panicking included; otherwise a
/// fatal error in one worker would leave the others polling forever and
/// the scope would never unwind.
struct TaskGuard<'s> {
    live: &'s AtomicUsize,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Symbolic execution engine for one loaded MIPS module.
///
/// `execute_symbolic` explores every feasible path of a function by
/// forking at symbolic branches across a pool of worker threads;
/// `execute_concrete` runs a single fully concrete path and returns its
/// trace.
pub struct Engine<'a> {
    loader: &'a dyn BinLoader,
    disassembler: &'a dyn Disassembler,
    module: Option<&'a dyn ModuleInfo>,
    library: FunctionLibrary,
    options: EngineOptions,
    stats: EngineStats,
    global_branch_counters: Mutex<FxHashMap<(u32, u32), u32>>,
    executed_addresses: Mutex<FxHashSet<u32>>,
}

impl<'a> Engine<'a> {
    pub fn new(loader: &'a dyn BinLoader, disassembler: &'a dyn Disassembler) -> Self {
        Self {
            loader,
            disassembler,
            module: None,
            library: FunctionLibrary::new(),
            options: EngineOptions::default(),
            stats: EngineStats::default(),
            global_branch_counters: Mutex::new(FxHashMap::default()),
            executed_addresses: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn with_module(mut self, module: &'a dyn ModuleInfo) -> Self {
        self.module = Some(module);
        self
    }

    pub fn with_library(mut self, library: FunctionLibrary) -> Self {
        self.library = library;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Union of instruction addresses executed by finished paths.
    pub fn executed_addresses(&self) -> FxHashSet<u32> {
        self.executed_addresses.lock().clone()
    }

    /// Explore the function at `ctx.pc()` symbolically, forking at every
    /// feasible branch direction, and deliver each finished path to
    /// `sink`. Returns the union of executed addresses.
    pub fn execute_symbolic(&self, mut ctx: Context, sink: &dyn PathSink) -> FxHashSet<u32> {
        ctx.memory.set_concrete(false);
        self.prepare_entry(&mut ctx);

        let (tx, rx) = unbounded::<Context>();
        let live = AtomicUsize::new(1);
        tx.send(ctx).expect("queue is open");

        std::thread::scope(|scope| {
            for _ in 0..self.options.parallelism.max(1) {
                let rx = rx.clone();
                let tx = &tx;
                let live = &live;
                scope.spawn(move || loop {
                    match rx.recv_timeout(Duration::from_millis(10)) {
                        Ok(ctx) => {
                            let scheduler = Scheduler { tx, live };
                            let _guard = TaskGuard { live };
                            self.run_task(ctx, &scheduler, sink);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if live.load(Ordering::SeqCst) == 0 {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                });
            }
        });

        debug!("finished: {:?}", self.stats.snapshot());
        self.executed_addresses()
    }

    /// Run a single concrete path to completion and return its trace.
    /// Any symbolic control flow is an execution error.
    pub fn execute_concrete(&self, ctx: &mut Context) -> Vec<TraceElement> {
        ctx.memory.set_concrete(true);
        ctx.enable_trace();
        self.prepare_entry(ctx);
        let sink = crate::trace::CollectingSink::new();
        self.execution_loop(ctx, None, &sink);
        // The path hands its trace to the sink when it returns; an aborted
        // path still holds it.
        sink.into_paths()
            .pop()
            .map(|path| path.trace)
            .unwrap_or_else(|| ctx.take_trace())
    }

    fn prepare_entry(&self, ctx: &mut Context) {
        ctx.set(Reg::Sp, SymExpr::constant(INITIAL_SP as i32));
        ctx.set(Reg::Ra, SymExpr::constant(RETURN_TOKEN as i32));
        let pc = ctx.pc();
        ctx.record(|| TraceElement::ExecutionStart { pc });
    }

    fn run_task(&self, mut ctx: Context, scheduler: &Scheduler, sink: &dyn PathSink) {
        if ctx.pending_solve && self.solve_context(&mut ctx) == Flow::Yield {
            return;
        }
        self.execution_loop(&mut ctx, Some(scheduler), sink);
    }

    fn execution_loop(&self, ctx: &mut Context, scheduler: Option<&Scheduler>, sink: &dyn PathSink) {
        loop {
            if ctx.executed_instrs >= self.options.max_executed_instructions {
                warn!(
                    "execution did not terminate within the configured limit, pc={:#010x}",
                    ctx.pc()
                );
                ctx.record(|| TraceElement::DidNotTerminateWithinLimit);
                break;
            }
            if ctx.break_raised {
                // break raised in a delay slot lands here
                self.finish_path(ctx, scheduler.is_none(), sink);
                break;
            }
            if ctx.executed_instrs % 2048 == 0 && ctx.executed_instrs > 0 {
                debug!(
                    "instrs={} pc={:#010x} {:?}",
                    ctx.executed_instrs,
                    ctx.pc(),
                    self.stats.snapshot()
                );
            }

            let pc = ctx.pc();
            ctx.set_pc(pc.wrapping_add(4));
            match self.execute_instruction(ctx, pc, false, scheduler, sink) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Yield) => break,
                Err(e) => {
                    EngineStats::bump(&self.stats.execution_errors);
                    warn!("[{:#010x}] execution error: {}", pc, e);
                    break;
                }
            }
        }
        ctx.release_solver();
    }

    fn execute_instruction(
        &self,
        ctx: &mut Context,
        address: u32,
        in_delay_slot: bool,
        scheduler: Option<&Scheduler>,
        sink: &dyn PathSink,
    ) -> Result<Flow, ExecError> {
        ctx.executed_instrs += 1;
        ctx.executed_addresses.insert(address);
        let instr = self.disassembler.disassemble(self.loader, address)?;
        if in_delay_slot && (instr.is_branch() || instr.is_jump()) {
            panic!("branch or jump in a delay slot at {:#010x}", address);
        }

        match instr.opcode {
            Opcode::Add | Opcode::Addu | Opcode::Addi | Opcode::Addiu => {
                self.alu3(ctx, &instr, BinaryOp::Add);
            }
            Opcode::Sub | Opcode::Subu => {
                self.alu3(ctx, &instr, BinaryOp::Sub);
            }
            Opcode::Mult => {
                let (l, r) = (value(ctx, &instr.operands[0]), value(ctx, &instr.operands[1]));
                ctx.set_lo(SymExpr::binary(BinaryOp::MultLo, l.clone(), r.clone()));
                ctx.set_hi(SymExpr::binary(BinaryOp::MultHi, l, r));
            }
            Opcode::Multu => {
                let (l, r) = (value(ctx, &instr.operands[0]), value(ctx, &instr.operands[1]));
                ctx.set_lo(SymExpr::binary(BinaryOp::MultuLo, l.clone(), r.clone()));
                ctx.set_hi(SymExpr::binary(BinaryOp::MultuHi, l, r));
            }
            Opcode::Div => {
                let (l, r) = (value(ctx, &instr.operands[0]), value(ctx, &instr.operands[1]));
                ctx.set_lo(SymExpr::binary(BinaryOp::Div, l.clone(), r.clone()));
                ctx.set_hi(SymExpr::binary(BinaryOp::Mod, l, r));
            }
            Opcode::Divu => {
                let (l, r) = (value(ctx, &instr.operands[0]), value(ctx, &instr.operands[1]));
                ctx.set_lo(SymExpr::binary(BinaryOp::Divu, l.clone(), r.clone()));
                ctx.set_hi(SymExpr::binary(BinaryOp::Modu, l, r));
            }
            Opcode::Mflo => ctx.set(dest(&instr), ctx.lo()),
            Opcode::Mfhi => ctx.set(dest(&instr), ctx.hi()),
            Opcode::Ins => {
                let rt = dest(&instr);
                let pos = imm(&instr.operands[2]) as u32;
                let size = imm(&instr.operands[3]) as u32;
                let src = value(ctx, &instr.operands[1]);
                ctx.set(rt, SymExpr::insert(ctx.get(rt), src, pos, size));
            }
            Opcode::Ext => {
                let pos = imm(&instr.operands[2]) as u32;
                let size = imm(&instr.operands[3]) as u32;
                let src = value(ctx, &instr.operands[1]);
                ctx.set(dest(&instr), SymExpr::extract_zx(src, pos + size - 1, pos));
            }
            Opcode::Min => self.alu3(ctx, &instr, BinaryOp::Min),
            Opcode::Max => self.alu3(ctx, &instr, BinaryOp::Max),
            Opcode::And | Opcode::Andi => self.alu3(ctx, &instr, BinaryOp::And),
            Opcode::Or | Opcode::Ori => self.alu3(ctx, &instr, BinaryOp::Or),
            Opcode::Xor | Opcode::Xori => self.alu3(ctx, &instr, BinaryOp::Xor),
            Opcode::Nor => self.alu3(ctx, &instr, BinaryOp::Nor),
            Opcode::Sll | Opcode::Sllv => self.alu3(ctx, &instr, BinaryOp::Sll),
            Opcode::Srl | Opcode::Srlv => self.alu3(ctx, &instr, BinaryOp::Srl),
            Opcode::Sra | Opcode::Srav => self.alu3(ctx, &instr, BinaryOp::Sra),
            Opcode::Slt | Opcode::Slti => self.alu3(ctx, &instr, BinaryOp::Slt),
            Opcode::Sltu | Opcode::Sltiu => self.alu3(ctx, &instr, BinaryOp::Sltu),
            Opcode::Seb => {
                let v = value(ctx, &instr.operands[1]);
                ctx.set(dest(&instr), SymExpr::unary(UnaryOp::Seb, v));
            }
            Opcode::Seh => {
                let v = value(ctx, &instr.operands[1]);
                ctx.set(dest(&instr), SymExpr::unary(UnaryOp::Seh, v));
            }

            Opcode::Lb | Opcode::Lbu => {
                let at = effective_address(ctx, &instr);
                let unsigned = instr.opcode == Opcode::Lbu;
                let v = ctx.memory.read_byte(at.clone(), unsigned);
                let traced = v.clone();
                ctx.record(|| TraceElement::MemoryRead {
                    address: at,
                    value: traced,
                    width: 1,
                    unsigned,
                    unaligned: false,
                });
                ctx.set(dest(&instr), v);
            }
            Opcode::Lh | Opcode::Lhu => {
                let at = effective_address(ctx, &instr);
                let unsigned = instr.opcode == Opcode::Lhu;
                let v = ctx.memory.read_half(at.clone(), unsigned)?;
                let traced = v.clone();
                ctx.record(|| TraceElement::MemoryRead {
                    address: at,
                    value: traced,
                    width: 2,
                    unsigned,
                    unaligned: false,
                });
                ctx.set(dest(&instr), v);
            }
            Opcode::Lw => {
                let at = effective_address(ctx, &instr);
                let v = ctx.memory.read_word(at.clone())?;
                let traced = v.clone();
                ctx.record(|| TraceElement::MemoryRead {
                    address: at,
                    value: traced,
                    width: 4,
                    unsigned: false,
                    unaligned: false,
                });
                ctx.set(dest(&instr), v);
            }
            Opcode::Lwl | Opcode::Lwr => {
                self.unaligned_load(ctx, &instr)?;
            }

            Opcode::Sb => {
                let at = effective_address(ctx, &instr);
                let v = value(ctx, &instr.operands[0]);
                let traced = v.clone();
                let traced_at = at.clone();
                ctx.record(|| TraceElement::MemoryWrite {
                    address: traced_at,
                    value: traced,
                    width: 1,
                    unaligned: false,
                });
                ctx.memory.write_byte(at, v);
            }
            Opcode::Sh => {
                let at = effective_address(ctx, &instr);
                let v = value(ctx, &instr.operands[0]);
                let traced = v.clone();
                let traced_at = at.clone();
                ctx.record(|| TraceElement::MemoryWrite {
                    address: traced_at,
                    value: traced,
                    width: 2,
                    unaligned: false,
                });
                ctx.memory.write_half(at, v)?;
            }
            Opcode::Sw => {
                let at = effective_address(ctx, &instr);
                let v = value(ctx, &instr.operands[0]);
                let traced = v.clone();
                let traced_at = at.clone();
                ctx.record(|| TraceElement::MemoryWrite {
                    address: traced_at,
                    value: traced,
                    width: 4,
                    unaligned: false,
                });
                ctx.memory.write_word(at, v)?;
            }
            Opcode::Swl | Opcode::Swr => {
                self.unaligned_store(ctx, &instr)?;
            }

            Opcode::Beq | Opcode::Beql => {
                let cond = SymExpr::condition(
                    ConditionOp::Eq,
                    value(ctx, &instr.operands[0]),
                    value(ctx, &instr.operands[1]),
                );
                return self.handle_branch(ctx, address, &instr, cond, scheduler, sink);
            }
            Opcode::Bne | Opcode::Bnel => {
                let cond = SymExpr::condition(
                    ConditionOp::Neq,
                    value(ctx, &instr.operands[0]),
                    value(ctx, &instr.operands[1]),
                );
                return self.handle_branch(ctx, address, &instr, cond, scheduler, sink);
            }
            Opcode::Bgez | Opcode::Bgezl => {
                let cond = SymExpr::condition(
                    ConditionOp::Ge,
                    value(ctx, &instr.operands[0]),
                    SymExpr::zero(),
                );
                return self.handle_branch(ctx, address, &instr, cond, scheduler, sink);
            }
            Opcode::Bgtz | Opcode::Bgtzl => {
                let cond = SymExpr::condition(
                    ConditionOp::Gt,
                    value(ctx, &instr.operands[0]),
                    SymExpr::zero(),
                );
                return self.handle_branch(ctx, address, &instr, cond, scheduler, sink);
            }
            Opcode::Blez | Opcode::Blezl => {
                let cond = SymExpr::condition(
                    ConditionOp::Le,
                    value(ctx, &instr.operands[0]),
                    SymExpr::zero(),
                );
                return self.handle_branch(ctx, address, &instr, cond, scheduler, sink);
            }
            Opcode::Bltz | Opcode::Bltzl => {
                let cond = SymExpr::condition(
                    ConditionOp::Lt,
                    value(ctx, &instr.operands[0]),
                    SymExpr::zero(),
                );
                return self.handle_branch(ctx, address, &instr, cond, scheduler, sink);
            }

            Opcode::J => {
                self.execute_instruction(ctx, address + 4, true, scheduler, sink)?;
                let target = imm(&instr.operands[0]) as u32;
                self.record_jump_out_of_body(ctx, address, target);
                ctx.set_pc(target);
            }
            Opcode::Jal => {
                return self.handle_jump_and_link(ctx, address, &instr, scheduler, sink);
            }
            Opcode::Jr => {
                return self.handle_jump_register(ctx, address, &instr, scheduler, sink);
            }

            Opcode::Movz => {
                let cond = SymExpr::condition(
                    ConditionOp::Eq,
                    value(ctx, &instr.operands[2]),
                    SymExpr::zero(),
                );
                let rd = dest(&instr);
                let v = SymExpr::if_else(cond, value(ctx, &instr.operands[1]), ctx.get(rd));
                ctx.set(rd, v);
            }
            Opcode::Movn => {
                let cond = SymExpr::condition(
                    ConditionOp::Neq,
                    value(ctx, &instr.operands[2]),
                    SymExpr::zero(),
                );
                let rd = dest(&instr);
                let v = SymExpr::if_else(cond, value(ctx, &instr.operands[1]), ctx.get(rd));
                ctx.set(rd, v);
            }
            Opcode::Lui => {
                let v = imm(&instr.operands[1]).wrapping_shl(16);
                ctx.set(dest(&instr), SymExpr::constant(v));
            }
            Opcode::Nop => {}
            Opcode::Sync => {
                ctx.record(|| TraceElement::Sync { address });
            }
            Opcode::Break => {
                EngineStats::bump(&self.stats.breaks);
                ctx.record(|| TraceElement::Break { address });
                ctx.break_raised = true;
            }
        }

        if instr.modified_regs().contains(&Reg::K1) {
            ctx.record(|| TraceElement::ModifyK1 { address });
        } else if instr.used_regs().contains(&Reg::K1) {
            ctx.record(|| TraceElement::UseK1 { address });
        }

        Ok(Flow::Continue)
    }

    fn alu3(&self, ctx: &mut Context, instr: &Instr, op: BinaryOp) {
        let l = value(ctx, &instr.operands[1]);
        let r = value(ctx, &instr.operands[2]);
        ctx.set(dest(instr), SymExpr::binary(op, l, r));
    }

    /// `lwl`/`lwr` merge part of an unaligned word into the destination
    /// register; the masks and shifts come straight from the hardware
    /// definition.
    fn unaligned_load(&self, ctx: &mut Context, instr: &Instr) -> Result<(), ExecError> {
        let at = effective_address(ctx, instr);
        let shift = SymExpr::binary(BinaryOp::And, at.clone(), SymExpr::constant(0b11));
        let effective = SymExpr::binary(BinaryOp::Sub, at, shift.clone());
        let byte_shift = |v: SymExpr| SymExpr::binary(BinaryOp::Sll, v, SymExpr::constant(3));
        let rt = dest(instr);
        let old = ctx.get(rt);
        let word = ctx.memory.read_word(effective.clone())?;

        let (kept, loaded) = if instr.opcode == Opcode::Lwl {
            let keep_mask = SymExpr::binary(
                BinaryOp::Srl,
                SymExpr::constant(-1),
                byte_shift(SymExpr::binary(
                    BinaryOp::Add,
                    shift.clone(),
                    SymExpr::constant(1),
                )),
            );
            let loaded = SymExpr::binary(
                BinaryOp::Sll,
                word,
                byte_shift(SymExpr::binary(
                    BinaryOp::Sub,
                    SymExpr::constant(3),
                    shift.clone(),
                )),
            );
            (SymExpr::binary(BinaryOp::And, old, keep_mask), loaded)
        } else {
            let keep_mask = SymExpr::binary(
                BinaryOp::Sll,
                SymExpr::constant(-1),
                byte_shift(SymExpr::binary(
                    BinaryOp::Sub,
                    SymExpr::constant(4),
                    shift.clone(),
                )),
            );
            let loaded = SymExpr::binary(BinaryOp::Srl, word, byte_shift(shift.clone()));
            (SymExpr::binary(BinaryOp::And, old, keep_mask), loaded)
        };

        let v = SymExpr::binary(BinaryOp::Or, kept, loaded);
        let traced = v.clone();
        ctx.record(|| TraceElement::MemoryRead {
            address: effective,
            value: traced,
            width: 4,
            unsigned: false,
            unaligned: true,
        });
        ctx.set(rt, v);
        Ok(())
    }

    /// `swl`/`swr` store part of a register into an unaligned word.
    fn unaligned_store(&self, ctx: &mut Context, instr: &Instr) -> Result<(), ExecError> {
        let at = effective_address(ctx, instr);
        let shift = SymExpr::binary(BinaryOp::And, at.clone(), SymExpr::constant(0b11));
        let effective = SymExpr::binary(BinaryOp::Sub, at, shift.clone());
        let byte_shift = |v: SymExpr| SymExpr::binary(BinaryOp::Sll, v, SymExpr::constant(3));
        let rt = value(ctx, &instr.operands[0]);
        let word = ctx.memory.read_word(effective.clone())?;

        let (kept, stored) = if instr.opcode == Opcode::Swl {
            let keep_mask = SymExpr::binary(
                BinaryOp::Sll,
                SymExpr::constant(-1),
                byte_shift(SymExpr::binary(
                    BinaryOp::Add,
                    shift.clone(),
                    SymExpr::constant(1),
                )),
            );
            let stored = SymExpr::binary(
                BinaryOp::Srl,
                rt,
                byte_shift(SymExpr::binary(
                    BinaryOp::Sub,
                    SymExpr::constant(3),
                    shift.clone(),
                )),
            );
            (SymExpr::binary(BinaryOp::And, word, keep_mask), stored)
        } else {
            let keep_mask = SymExpr::binary(
                BinaryOp::Srl,
                SymExpr::constant(-1),
                byte_shift(SymExpr::binary(
                    BinaryOp::Sub,
                    SymExpr::constant(4),
                    shift.clone(),
                )),
            );
            let stored = SymExpr::binary(BinaryOp::Sll, rt, byte_shift(shift.clone()));
            (SymExpr::binary(BinaryOp::And, word, keep_mask), stored)
        };

        let v = SymExpr::binary(BinaryOp::Or, kept, stored);
        let traced = v.clone();
        let traced_at = effective.clone();
        ctx.record(|| TraceElement::MemoryWrite {
            address: traced_at,
            value: traced,
            width: 4,
            unaligned: true,
        });
        ctx.memory.write_word(effective, v)?;
        Ok(())
    }

    fn handle_branch(
        &self,
        ctx: &mut Context,
        address: u32,
        instr: &Instr,
        condition: SymExpr,
        scheduler: Option<&Scheduler>,
        sink: &dyn PathSink,
    ) -> Result<Flow, ExecError> {
        let taken_pc = branch_target(instr);
        let expected = if ctx.is_replay() {
            Some(
                ctx.pop_specific_branch()
                    .ok_or(ExecError::ReplayExhausted { address })?,
            )
        } else {
            None
        };

        if let Some(taken) = condition.as_bool() {
            if let Some(expected) = expected {
                if taken != expected {
                    return Err(ExecError::ReplayDivergence {
                        address,
                        actual: taken,
                        expected,
                    });
                }
            }
            ctx.record(|| TraceElement::Branch {
                address,
                taken,
                symbolic: false,
            });
            if taken {
                self.execute_instruction(ctx, address + 4, true, scheduler, sink)?;
                ctx.set_pc(taken_pc);
            } else {
                if !instr.is_branch_likely() {
                    self.execute_instruction(ctx, address + 4, true, scheduler, sink)?;
                }
                ctx.set_pc(address + 8);
            }
            return Ok(Flow::Continue);
        }

        EngineStats::bump(&self.stats.symbolic_branches);

        if let Some(expected) = expected {
            ctx.record(|| TraceElement::Branch {
                address,
                taken: expected,
                symbolic: true,
            });
            return if expected {
                self.execute_instruction(ctx, address + 4, true, scheduler, sink)?;
                Ok(self.commit_symbolic_branch(ctx, address, condition, taken_pc, scheduler))
            } else {
                if !instr.is_branch_likely() {
                    self.execute_instruction(ctx, address + 4, true, scheduler, sink)?;
                }
                Ok(self.commit_symbolic_branch(
                    ctx,
                    address,
                    SymExpr::not(condition),
                    address + 8,
                    scheduler,
                ))
            };
        }

        let Some(scheduler) = scheduler else {
            return Err(ExecError::SymbolicBranch { address });
        };

        // Taken direction forks onto the queue; the current worker keeps
        // the fall-through direction.
        let mut taken = ctx.fork();
        match self.execute_instruction(&mut taken, address + 4, true, Some(scheduler), sink) {
            Ok(_) => {
                if self.commit_counters(&mut taken, address, taken_pc) {
                    taken.add_path_decision(PathDecision {
                        address,
                        taken_pc,
                        condition: condition.clone(),
                    });
                    taken.set_pc(taken_pc);
                    scheduler.spawn(taken);
                }
            }
            Err(e) => {
                EngineStats::bump(&self.stats.execution_errors);
                warn!("[{:#010x}] execution error in forked delay slot: {}", address + 4, e);
            }
        }

        if !instr.is_branch_likely() {
            self.execute_instruction(ctx, address + 4, true, Some(scheduler), sink)?;
        }
        Ok(self.commit_symbolic_branch(
            ctx,
            address,
            SymExpr::not(condition),
            address + 8,
            Some(scheduler),
        ))
    }

    /// Commit a symbolic branch direction on the current worker: record
    /// the decision, apply the edge counters, then check feasibility.
    fn commit_symbolic_branch(
        &self,
        ctx: &mut Context,
        address: u32,
        condition: SymExpr,
        to: u32,
        _scheduler: Option<&Scheduler>,
    ) -> Flow {
        if !self.commit_counters(ctx, address, to) {
            return Flow::Yield;
        }
        ctx.add_path_decision(PathDecision {
            address,
            taken_pc: to,
            condition,
        });
        ctx.set_pc(to);
        self.solve_context(ctx)
    }

    /// Apply the per-context and run-wide branch edge caps. Returns false
    /// when the edge is saturated and the path must be dropped.
    fn commit_counters(&self, ctx: &mut Context, address: u32, to: u32) -> bool {
        {
            let mut counters = self.global_branch_counters.lock();
            let counter = counters.entry((address, to)).or_insert(0);
            if *counter >= self.options.global_branching_limit {
                if *counter == self.options.global_branching_limit {
                    warn!(
                        "too many repeated branches {:#010x} -> {:#010x}, blocking all paths",
                        address, to
                    );
                    *counter += 1;
                }
                EngineStats::bump(&self.stats.dropped_paths);
                return false;
            }
            *counter += 1;
        }

        let count = ctx.branch_edge(address, to);
        if count >= self.options.branching_limit {
            if count == self.options.branching_limit {
                warn!(
                    "too many repeated context branches {:#010x} -> {:#010x}, blocking context",
                    address, to
                );
                ctx.bump_branch_edge(address, to);
            }
            EngineStats::bump(&self.stats.dropped_paths);
            return false;
        }
        ctx.bump_branch_edge(address, to);
        true
    }

    fn solve_context(&self, ctx: &mut Context) -> Flow {
        match ctx.check(SOLVER_TIMEOUT) {
            CheckResult::Sat => {
                EngineStats::bump(&self.stats.sat_results);
                if let Some(edge) = self.detect_spin_wait(ctx) {
                    warn!(
                        "potential hardware spin wait on {:#010x} -> {:#010x}, blocking path",
                        edge.0, edge.1
                    );
                    self.global_branch_counters
                        .lock()
                        .insert(edge, self.options.global_branching_limit + 1);
                    EngineStats::bump(&self.stats.dropped_paths);
                    return Flow::Yield;
                }
                ctx.memory.reset_branch_access_tracking();
                ctx.pending_solve = false;
                Flow::Continue
            }
            CheckResult::Unsat => {
                EngineStats::bump(&self.stats.unsat_results);
                Flow::Yield
            }
            CheckResult::Unknown => {
                EngineStats::bump(&self.stats.unknown_results);
                Flow::Yield
            }
        }
    }

    /// A path re-deciding the same condition with no memory writes and
    /// exactly one hardware word read since the last branch is busy
    /// polling a hardware register; it will never make progress.
    fn detect_spin_wait(&self, ctx: &Context) -> Option<(u32, u32)> {
        let decisions = ctx.path_decisions();
        let last = decisions.last()?;
        let previous = decisions.len().checked_sub(2).map(|i| &decisions[i])?;
        (last.condition.uid() == previous.condition.uid()
            && ctx.memory.writes_since_last_branch() == 0
            && ctx.memory.hw_word_reads_since_last_branch() == 1)
            .then_some((last.address, last.taken_pc))
    }

    fn handle_jump_and_link(
        &self,
        ctx: &mut Context,
        address: u32,
        instr: &Instr,
        scheduler: Option<&Scheduler>,
        sink: &dyn PathSink,
    ) -> Result<Flow, ExecError> {
        self.execute_instruction(ctx, address + 4, true, scheduler, sink)?;
        ctx.set(Reg::Ra, SymExpr::constant((address + 8) as i32));

        let target = imm(&instr.operands[0]) as u32;
        let name = self
            .module
            .and_then(|m| m.function_name_at(target))
            .map(str::to_owned);
        ctx.record(|| TraceElement::FunctionCall {
            address,
            target,
            name: name.clone(),
        });

        let handler = name.as_deref().and_then(|n| self.library.get(n));
        match handler {
            Some(handler) => {
                if !handler.handle(ctx, address, target) {
                    ctx.set_pc(address + 8);
                    ctx.record(|| TraceElement::FunctionReturn { address });
                }
            }
            None => ctx.set_pc(target),
        }
        Ok(Flow::Continue)
    }

    fn handle_jump_register(
        &self,
        ctx: &mut Context,
        address: u32,
        instr: &Instr,
        scheduler: Option<&Scheduler>,
        sink: &dyn PathSink,
    ) -> Result<Flow, ExecError> {
        self.execute_instruction(ctx, address + 4, true, scheduler, sink)?;
        let reg = instr.operands[0].reg().expect("jr takes a register");
        let target = ctx.get(reg);

        if let Some(pc) = target.as_const() {
            ctx.set_pc(pc as u32);
        } else {
            if ctx.check(EXTENDED_SOLVER_TIMEOUT) != CheckResult::Sat {
                EngineStats::bump(&self.stats.failed_jump_resolutions);
                warn!(
                    "[{:#010x}] solver failed for jump target {}, dropping path",
                    address, target
                );
                return Ok(Flow::Yield);
            }
            let pc = match ctx.eval(&target, false) {
                Some(pc) => pc,
                None => {
                    warn!("[{:#010x}] jump target has unconstrained bits, completing model", address);
                    match ctx.eval(&target, true) {
                        Some(pc) => pc,
                        None => {
                            EngineStats::bump(&self.stats.failed_jump_resolutions);
                            return Ok(Flow::Yield);
                        }
                    }
                }
            };
            ctx.set_pc(pc as u32);
        }

        if reg == Reg::Ra {
            ctx.record(|| TraceElement::FunctionReturn { address });
        } else {
            let target_pc = ctx.pc();
            self.record_jump_out_of_body(ctx, address, target_pc);
        }

        if ctx.pc() == RETURN_TOKEN && reg == Reg::Ra {
            self.finish_path(ctx, scheduler.is_none(), sink);
            return Ok(Flow::Yield);
        }
        Ok(Flow::Continue)
    }

    fn record_jump_out_of_body(&self, ctx: &mut Context, address: u32, target: u32) {
        if let Some(module) = self.module {
            if module.function_name_at(address) != module.function_name_at(target) {
                ctx.record(|| TraceElement::JumpOutOfFunctionBody { address, target });
            }
        }
    }

    fn finish_path(&self, ctx: &mut Context, concrete: bool, sink: &dyn PathSink) {
        if !concrete {
            // The path may have ended without a pending symbolic decision,
            // e.g. through a concrete jump; the model must still be SAT.
            let status = ctx.check(EXTENDED_SOLVER_TIMEOUT);
            if status != CheckResult::Sat {
                EngineStats::bump(&self.stats.failed_finish_solves);
                warn!("solver failed for finished path ({:?}), dropping", status);
                return;
            }
        }

        let path_id = EngineStats::bump(&self.stats.finished_paths);
        self.executed_addresses
            .lock()
            .extend(ctx.executed_addresses.iter().copied());

        let assignments = if concrete {
            Vec::new()
        } else {
            ctx.solver().variable_assignments()
        };
        sink.path_finished(FinishedPath {
            path_id,
            assignments,
            function_states: ctx.function_states.snapshot(),
            trace: ctx.take_trace(),
        });
    }
}

fn dest(instr: &Instr) -> Reg {
    instr.operands[0].reg().expect("destination register")
}

fn imm(operand: &Operand) -> i32 {
    operand.imm().expect("immediate operand")
}

fn value(ctx: &Context, operand: &Operand) -> SymExpr {
    match operand {
        Operand::Reg(r) => ctx.get(*r),
        Operand::Imm(v) => SymExpr::constant(*v),
        Operand::Mem { .. } => panic!("memory operand used as a value"),
    }
}

fn effective_address(ctx: &Context, instr: &Instr) -> SymExpr {
    let (base, offset) = instr
        .operands
        .iter()
        .find_map(|op| match op {
            Operand::Mem { base, offset } => Some((*base, *offset)),
            _ => None,
        })
        .expect("memory operand");
    SymExpr::binary(BinaryOp::Add, ctx.get(base), SymExpr::constant(offset))
}

fn branch_target(instr: &Instr) -> u32 {
    instr
        .operands
        .last()
        .and_then(Operand::imm)
        .expect("branch target") as u32
}
