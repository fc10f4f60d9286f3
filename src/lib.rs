pub mod context;
pub mod engine;
pub mod expr;
pub mod hooks;
pub mod machine;
pub mod memory;
pub mod solver;
pub mod trace;

pub use self::context::{Context, FunctionStates, PathDecision};
pub use self::engine::{
    Engine, EngineOptions, EngineStatsSnapshot, ExecError, INITIAL_SP, RETURN_TOKEN,
};
pub use self::expr::{BinaryOp, ConditionOp, Expr, SymExpr, UnaryOp, DEAD_VALUE, DIV_BY_ZERO};
pub use self::hooks::{
    DefaultFunctionHandler, FunctionHandler, FunctionLibrary, ProvidedFunctionHandler,
    ReplayFunctionHandler, ResultFunctionHandler, SymbolicFunctionHandler,
};
pub use self::machine::{
    BinLoader, DisasmError, Disassembler, FunctionTable, Instr, ModuleInfo, Opcode, Operand, Reg,
    SliceLoader, TableDisassembler,
};
pub use self::memory::{Memory, MemoryError, StoreOp};
pub use self::solver::{CheckResult, Solver, EXTENDED_SOLVER_TIMEOUT, SOLVER_TIMEOUT};
pub use self::trace::{CollectingSink, FinishedPath, NullSink, PathSink, TraceElement};
