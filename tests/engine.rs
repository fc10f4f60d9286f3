use mips_symex::{
    CollectingSink, Context, Engine, EngineOptions, FunctionLibrary, FunctionTable, Instr, Opcode,
    Operand, Reg, ResultFunctionHandler, SliceLoader, SymExpr, TableDisassembler, TraceElement,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn reg(r: Reg) -> Operand {
    Operand::Reg(r)
}

fn imm(v: i32) -> Operand {
    Operand::Imm(v)
}

fn program(instrs: Vec<Instr>) -> TableDisassembler {
    let mut dis = TableDisassembler::new();
    for instr in instrs {
        dis.insert(instr);
    }
    dis
}

/// bgtz a0, positive
///     nop
///     addiu v0, a0, -1
///     jr ra
///     nop
/// positive:
///     addiu v0, a0, 1
///     jr ra
///     nop
fn two_path_program() -> TableDisassembler {
    program(vec![
        Instr::new(0x1000, Opcode::Bgtz, [reg(Reg::A0), imm(0x1014)]),
        Instr::new(0x1004, Opcode::Nop, []),
        Instr::new(0x1008, Opcode::Addiu, [reg(Reg::V0), reg(Reg::A0), imm(-1)]),
        Instr::new(0x100c, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x1010, Opcode::Nop, []),
        Instr::new(0x1014, Opcode::Addiu, [reg(Reg::V0), reg(Reg::A0), imm(1)]),
        Instr::new(0x1018, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x101c, Opcode::Nop, []),
    ])
}

fn small_options() -> EngineOptions {
    EngineOptions {
        parallelism: 2,
        ..EngineOptions::default()
    }
}

fn model_value(path: &mips_symex::FinishedPath, name: &str) -> i32 {
    path.assignments
        .iter()
        .find(|(n, _)| n == name)
        .unwrap_or_else(|| panic!("no assignment for {} in {:?}", name, path.assignments))
        .1
}

#[test]
fn symbolic_branch_explores_both_directions() {
    init_logging();
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = two_path_program();
    let engine = Engine::new(&loader, &dis).with_options(small_options());

    let mut ctx = Context::new(0x1000);
    ctx.set(Reg::A0, SymExpr::symbolic("a0"));
    let sink = CollectingSink::new();
    let executed = engine.execute_symbolic(ctx, &sink);

    let paths = sink.into_paths();
    assert_eq!(paths.len(), 2);
    let a0s: Vec<i32> = paths.iter().map(|p| model_value(p, "a0")).collect();
    assert!(a0s.iter().any(|v| *v > 0));
    assert!(a0s.iter().any(|v| *v <= 0));

    assert!(executed.contains(&0x1008));
    assert!(executed.contains(&0x1014));

    let stats = engine.stats();
    assert_eq!(stats.finished_paths, 2);
    assert_eq!(stats.dropped_paths, 0);
    assert_eq!(stats.symbolic_branches, 1);
    assert_eq!(stats.execution_errors, 0);
}

/// A fatal interpreter error (here: a branch sitting in a delay slot)
/// must abort the whole run, not leave the remaining workers polling an
/// empty queue forever.
#[test]
#[should_panic(expected = "a scoped thread panicked")]
fn fatal_worker_error_aborts_the_run() {
    init_logging();
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = program(vec![
        Instr::new(0x1000, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x1004, Opcode::Beq, [reg(Reg::Zero), reg(Reg::Zero), imm(0x1000)]),
    ]);
    let engine = Engine::new(&loader, &dis).with_options(small_options());
    engine.execute_symbolic(Context::new(0x1000), &mips_symex::NullSink);
}

#[test]
fn concrete_branch_does_not_fork() {
    init_logging();
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = two_path_program();
    let engine = Engine::new(&loader, &dis).with_options(small_options());

    let mut ctx = Context::new(0x1000);
    ctx.set(Reg::A0, SymExpr::constant(0));
    let sink = CollectingSink::new();
    let executed = engine.execute_symbolic(ctx, &sink);

    assert_eq!(sink.paths().len(), 1);
    assert!(executed.contains(&0x1008));
    assert!(!executed.contains(&0x1014));
    assert_eq!(engine.stats().finished_paths, 1);
}

#[test]
fn concrete_execution_returns_a_trace() {
    init_logging();
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = two_path_program();
    let engine = Engine::new(&loader, &dis);

    let mut ctx = Context::new(0x1000);
    ctx.set(Reg::A0, SymExpr::constant(5));
    let trace = engine.execute_concrete(&mut ctx);

    assert_eq!(ctx.get(Reg::V0).as_const(), Some(6));
    assert!(matches!(trace.first(), Some(TraceElement::ExecutionStart { pc: 0x1000 })));
    assert!(trace.iter().any(|e| matches!(
        e,
        TraceElement::Branch {
            address: 0x1000,
            taken: true,
            symbolic: false,
        }
    )));
    assert!(trace
        .iter()
        .any(|e| matches!(e, TraceElement::FunctionReturn { address: 0x1018 })));
}

#[test]
fn replaying_recorded_branches_follows_one_path() {
    init_logging();
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = two_path_program();
    let engine = Engine::new(&loader, &dis).with_options(small_options());

    let mut ctx = Context::new(0x1000);
    ctx.set(Reg::A0, SymExpr::symbolic("a0"));
    ctx.set_specific_branches([false]);
    let sink = CollectingSink::new();
    let executed = engine.execute_symbolic(ctx, &sink);

    let paths = sink.into_paths();
    assert_eq!(paths.len(), 1);
    assert!(model_value(&paths[0], "a0") <= 0);
    assert!(executed.contains(&0x1008));
    assert!(!executed.contains(&0x1014));
}

/// loop:
///     addiu t0, t0, 1
///     bne t0, a0, loop
///     nop
///     jr ra
///     nop
#[test]
fn branch_edge_cap_bounds_loop_exploration() {
    init_logging();
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = program(vec![
        Instr::new(0x1000, Opcode::Addiu, [reg(Reg::T0), reg(Reg::T0), imm(1)]),
        Instr::new(0x1004, Opcode::Bne, [reg(Reg::T0), reg(Reg::A0), imm(0x1000)]),
        Instr::new(0x1008, Opcode::Nop, []),
        Instr::new(0x100c, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x1010, Opcode::Nop, []),
    ]);
    let engine = Engine::new(&loader, &dis).with_options(EngineOptions {
        branching_limit: 4,
        parallelism: 2,
        ..EngineOptions::default()
    });

    let mut ctx = Context::new(0x1000);
    ctx.set(Reg::A0, SymExpr::symbolic("a0"));
    let sink = CollectingSink::new();
    engine.execute_symbolic(ctx, &sink);

    let paths = sink.into_paths();
    assert!(!paths.is_empty());
    // Every finished path exited when t0 caught up with a0.
    for path in &paths {
        let a0 = model_value(path, "a0");
        assert!((1..=5).contains(&a0), "a0 = {}", a0);
    }
    assert!(engine.stats().dropped_paths >= 1);
}

/// A busy-wait on a hardware register never terminates on its own: the
/// same condition re-decided with no writes and exactly one hardware
/// word read per iteration gets its branch edge blocked.
#[test]
fn hardware_spin_wait_is_blocked() {
    init_logging();
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = program(vec![
        Instr::new(0x1000, Opcode::Lui, [reg(Reg::T1), imm(0xBC00)]),
        Instr::new(
            0x1004,
            Opcode::Lw,
            [
                reg(Reg::T0),
                Operand::Mem {
                    base: Reg::T1,
                    offset: 0,
                },
            ],
        ),
        Instr::new(0x1008, Opcode::Beq, [reg(Reg::T0), reg(Reg::Zero), imm(0x1004)]),
        Instr::new(0x100c, Opcode::Nop, []),
        Instr::new(0x1010, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x1014, Opcode::Nop, []),
    ]);
    let engine = Engine::new(&loader, &dis).with_options(small_options());

    let sink = CollectingSink::new();
    engine.execute_symbolic(Context::new(0x1000), &sink);

    // Only the immediate fall-through path finishes; the polling loop is
    // dropped by the spin-wait heuristic instead of spinning until the
    // instruction limit.
    assert_eq!(sink.paths().len(), 1);
    let stats = engine.stats();
    assert_eq!(stats.finished_paths, 1);
    assert!(stats.dropped_paths >= 1);
}

/// jal stub
///     nop
///     addiu v0, v0, 1
///     jr ra
///     nop
#[test]
fn function_handler_intercepts_named_call() {
    init_logging();
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = program(vec![
        Instr::new(0x1000, Opcode::Jal, [imm(0x4000)]),
        Instr::new(0x1004, Opcode::Nop, []),
        Instr::new(0x1008, Opcode::Addiu, [reg(Reg::V0), reg(Reg::V0), imm(1)]),
        Instr::new(0x100c, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x1010, Opcode::Nop, []),
    ]);
    let mut functions = FunctionTable::new();
    functions.insert(0x4000, "stub");
    let mut library = FunctionLibrary::new();
    library.register("stub", Box::new(ResultFunctionHandler::constant(42)));
    let engine = Engine::new(&loader, &dis)
        .with_module(&functions)
        .with_library(library);

    let mut ctx = Context::new(0x1000);
    let trace = engine.execute_concrete(&mut ctx);

    assert_eq!(ctx.get(Reg::V0).as_const(), Some(43));
    assert!(trace.iter().any(|e| matches!(
        e,
        TraceElement::FunctionCall {
            address: 0x1000,
            target: 0x4000,
            name: Some(n),
        } if n == "stub"
    )));
    assert!(trace
        .iter()
        .any(|e| matches!(e, TraceElement::FunctionReturn { address: 0x1000 })));
}

/// bgtzl skips its delay slot when the branch is not taken.
#[test]
fn branch_likely_annuls_delay_slot_when_not_taken() {
    init_logging();
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = program(vec![
        Instr::new(0x1000, Opcode::Bgtzl, [reg(Reg::A0), imm(0x1010)]),
        Instr::new(0x1004, Opcode::Addiu, [reg(Reg::T1), reg(Reg::T1), imm(1)]),
        Instr::new(0x1008, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x100c, Opcode::Nop, []),
        Instr::new(0x1010, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x1014, Opcode::Nop, []),
    ]);
    let engine = Engine::new(&loader, &dis);

    let mut ctx = Context::new(0x1000);
    ctx.set(Reg::A0, SymExpr::constant(-1));
    engine.execute_concrete(&mut ctx);
    assert_eq!(ctx.get(Reg::T1).as_const(), Some(0));

    let mut ctx = Context::new(0x1000);
    ctx.set(Reg::A0, SymExpr::constant(1));
    engine.execute_concrete(&mut ctx);
    assert_eq!(ctx.get(Reg::T1).as_const(), Some(1));
}

/// Symbolic stores followed by loads through the solver: the finished
/// model has to satisfy constraints over values read back from memory.
#[test]
fn symbolic_memory_constrains_models() {
    init_logging();
    // sw a0, 0x2000(zero); lw t0, 0x2000(zero); bgtz t0, positive ...
    let loader = SliceLoader::new(0x1000, vec![]);
    let dis = program(vec![
        Instr::new(
            0x1000,
            Opcode::Sw,
            [
                reg(Reg::A0),
                Operand::Mem {
                    base: Reg::Zero,
                    offset: 0x2000,
                },
            ],
        ),
        Instr::new(
            0x1004,
            Opcode::Lw,
            [
                reg(Reg::T0),
                Operand::Mem {
                    base: Reg::Zero,
                    offset: 0x2000,
                },
            ],
        ),
        Instr::new(0x1008, Opcode::Bgtz, [reg(Reg::T0), imm(0x1018)]),
        Instr::new(0x100c, Opcode::Nop, []),
        Instr::new(0x1010, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x1014, Opcode::Nop, []),
        Instr::new(0x1018, Opcode::Jr, [reg(Reg::Ra)]),
        Instr::new(0x101c, Opcode::Nop, []),
    ]);
    let engine = Engine::new(&loader, &dis).with_options(small_options());

    let mut ctx = Context::new(0x1000);
    ctx.set(Reg::A0, SymExpr::symbolic("a0"));
    let sink = CollectingSink::new();
    let executed = engine.execute_symbolic(ctx, &sink);

    let paths = sink.into_paths();
    assert_eq!(paths.len(), 2);
    let a0s: Vec<i32> = paths.iter().map(|p| model_value(p, "a0")).collect();
    assert!(a0s.iter().any(|v| *v > 0));
    assert!(a0s.iter().any(|v| *v <= 0));
    assert!(executed.contains(&0x1010));
    assert!(executed.contains(&0x1018));
}
