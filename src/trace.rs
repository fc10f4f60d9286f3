use fxhash::FxHashMap;

use crate::expr::SymExpr;

/// One event in a per-path execution trace. Collection is opt-in per
/// context; the engine pushes nothing when tracing is off.
#[derive(Debug, Clone)]
pub enum TraceElement {
    ExecutionStart {
        pc: u32,
    },
    FunctionCall {
        address: u32,
        target: u32,
        name: Option<String>,
    },
    FunctionReturn {
        address: u32,
    },
    MemoryRead {
        address: SymExpr,
        value: SymExpr,
        width: u8,
        unsigned: bool,
        unaligned: bool,
    },
    MemoryWrite {
        address: SymExpr,
        value: SymExpr,
        width: u8,
        unaligned: bool,
    },
    Branch {
        address: u32,
        taken: bool,
        symbolic: bool,
    },
    JumpOutOfFunctionBody {
        address: u32,
        target: u32,
    },
    /// `k1` is reserved for the kernel; user code touching it is worth
    /// flagging.
    ModifyK1 {
        address: u32,
    },
    UseK1 {
        address: u32,
    },
    Sync {
        address: u32,
    },
    Break {
        address: u32,
    },
    DidNotTerminateWithinLimit,
}

/// A completed path: the model that drives execution down it, plus the
/// per-invocation handler counters active when it finished.
#[derive(Debug, Clone)]
pub struct FinishedPath {
    pub path_id: usize,
    /// Satisfying assignment of every named symbolic variable, sorted by
    /// name.
    pub assignments: Vec<(String, i32)>,
    pub function_states: FxHashMap<String, u32>,
    pub trace: Vec<TraceElement>,
}

/// Receiver for finished paths; implementations render or persist the
/// models. Called from worker threads.
pub trait PathSink: Send + Sync {
    fn path_finished(&self, path: FinishedPath);
}

/// Sink that drops everything; the default when only the executed-address
/// set is of interest.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl PathSink for NullSink {
    fn path_finished(&self, _path: FinishedPath) {}
}

/// Sink that collects finished paths into a shared vector.
#[derive(Debug, Default)]
pub struct CollectingSink {
    paths: parking_lot::Mutex<Vec<FinishedPath>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_paths(self) -> Vec<FinishedPath> {
        self.paths.into_inner()
    }

    pub fn paths(&self) -> Vec<FinishedPath> {
        self.paths.lock().clone()
    }
}

impl PathSink for CollectingSink {
    fn path_finished(&self, path: FinishedPath) {
        self.paths.lock().push(path);
    }
}
