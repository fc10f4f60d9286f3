use std::sync::Arc;

use dyn_clone::{clone_trait_object, DynClone};
use fxhash::FxHashMap as HashMap;
use log::warn;

use crate::context::Context;
use crate::expr::{ConditionOp, SymExpr};
use crate::machine::Reg;

/// Models a called function without executing its code.
///
/// `handle` returns `true` when the handler emulated the call completely,
/// including control flow; returning `false` tells the engine to step
/// over the call site (`pc = call_site + 8`).
pub trait FunctionHandler: DynClone + Send + Sync {
    fn handle(&self, ctx: &mut Context, call_site: u32, target: u32) -> bool;
}

clone_trait_object!(FunctionHandler);

/// Name-keyed registry of function handlers consulted on `jal`.
#[derive(Clone, Default)]
pub struct FunctionLibrary {
    handlers: HashMap<String, Box<dyn FunctionHandler>>,
}

impl FunctionLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Box<dyn FunctionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&dyn FunctionHandler> {
        self.handlers.get(name).map(Box::as_ref)
    }
}

fn clobber_caller_saved(ctx: &mut Context) {
    for reg in Reg::CALLER_SAVED {
        ctx.set(reg, SymExpr::dead_value());
    }
    ctx.set_lo(SymExpr::dead_value());
    ctx.set_hi(SymExpr::dead_value());
}

/// Stands in for a function whose effects do not matter: clobbers every
/// caller-saved register (and `lo`/`hi`) with the dead-value sentinel so
/// that accidental uses of its results are visible.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFunctionHandler;

impl FunctionHandler for DefaultFunctionHandler {
    fn handle(&self, ctx: &mut Context, _call_site: u32, _target: u32) -> bool {
        clobber_caller_saved(ctx);
        false
    }
}

/// Clobbers like [`DefaultFunctionHandler`], then writes a provided
/// return value to `v0`.
#[derive(Clone)]
pub struct ResultFunctionHandler {
    provider: Arc<dyn Fn(&mut Context) -> SymExpr + Send + Sync>,
}

impl ResultFunctionHandler {
    pub fn new(provider: impl Fn(&mut Context) -> SymExpr + Send + Sync + 'static) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    pub fn constant(value: i32) -> Self {
        Self::new(move |_| SymExpr::constant(value))
    }
}

impl FunctionHandler for ResultFunctionHandler {
    fn handle(&self, ctx: &mut Context, _call_site: u32, _target: u32) -> bool {
        clobber_caller_saved(ctx);
        let result = (self.provider)(ctx);
        ctx.set(Reg::V0, result);
        false
    }
}

/// Returns a fresh symbolic value from each invocation, optionally
/// constrained to a set of allowed results. After `limit` invocations the
/// handler degrades to a constant fallback to keep the solver state
/// bounded.
#[derive(Debug, Clone)]
pub struct SymbolicFunctionHandler {
    name: String,
    allowed: Vec<i32>,
    limit: u32,
    fallback: i32,
}

impl SymbolicFunctionHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed: Vec::new(),
            limit: u32::MAX,
            fallback: 0,
        }
    }

    pub fn with_allowed_values(mut self, allowed: impl IntoIterator<Item = i32>) -> Self {
        self.allowed = allowed.into_iter().collect();
        self
    }

    pub fn with_limit(mut self, limit: u32, fallback: i32) -> Self {
        self.limit = limit;
        self.fallback = fallback;
        self
    }

    pub(crate) fn result_name(name: &str, invocation: u32) -> String {
        format!("fun:v0:{}:{}", invocation, name)
    }
}

impl FunctionHandler for SymbolicFunctionHandler {
    fn handle(&self, ctx: &mut Context, _call_site: u32, _target: u32) -> bool {
        clobber_caller_saved(ctx);
        let invocation = ctx.function_states.next(&self.name);
        if invocation >= self.limit {
            warn!(
                "{}: invocation limit {} reached, returning {:#x}",
                self.name, self.limit, self.fallback
            );
            ctx.set(Reg::V0, SymExpr::constant(self.fallback));
            return false;
        }

        let result = SymExpr::symbolic(Self::result_name(&self.name, invocation));
        if !self.allowed.is_empty() {
            let constraint = self
                .allowed
                .iter()
                .map(|v| {
                    SymExpr::condition(ConditionOp::Eq, result.clone(), SymExpr::constant(*v))
                })
                .reduce(SymExpr::or)
                .expect("allowed set is non-empty");
            ctx.constrain(constraint);
        }
        ctx.set(Reg::V0, result);
        false
    }
}

/// Replays recorded return values for a function, one per invocation, in
/// order. Used to re-execute a previously discovered path concretely.
/// Exhausting the recording falls back to a constant with a warning.
#[derive(Debug, Clone)]
pub struct ReplayFunctionHandler {
    name: String,
    responses: Vec<i32>,
    fallback: i32,
}

impl ReplayFunctionHandler {
    pub fn new(name: impl Into<String>, responses: Vec<i32>, fallback: i32) -> Self {
        Self {
            name: name.into(),
            responses,
            fallback,
        }
    }
}

impl FunctionHandler for ReplayFunctionHandler {
    fn handle(&self, ctx: &mut Context, _call_site: u32, _target: u32) -> bool {
        clobber_caller_saved(ctx);
        let invocation = ctx.function_states.next(&self.name) as usize;
        let value = match self.responses.get(invocation) {
            Some(v) => *v,
            None => {
                warn!(
                    "{}: no recorded response for invocation {}, returning {:#x}",
                    self.name, invocation, self.fallback
                );
                self.fallback
            }
        };
        ctx.set(Reg::V0, value.into());
        false
    }
}

/// Redirects the call into replacement code the embedder loaded at
/// `address`; the engine then executes that code in place of the
/// original function.
#[derive(Debug, Clone, Copy)]
pub struct ProvidedFunctionHandler {
    address: u32,
}

impl ProvidedFunctionHandler {
    pub fn new(address: u32) -> Self {
        Self { address }
    }
}

impl FunctionHandler for ProvidedFunctionHandler {
    fn handle(&self, ctx: &mut Context, _call_site: u32, _target: u32) -> bool {
        ctx.set_pc(self.address);
        true
    }
}
