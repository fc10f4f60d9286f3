use std::sync::Arc;

use log::trace;
use thiserror::Error;

use crate::expr::{SymExpr, UnaryOp};

/// First address handed out by [`Memory::allocate`].
pub const BUFFER_ALLOC_START: u32 = 0x0880_0000;

/// Byte used to fill freshly allocated buffers.
pub const ALLOC_INIT_BYTE: u8 = 0xCD;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unaligned {width}-byte access at {address:#010x}")]
    Unaligned { address: u32, width: u32 },
}

/// A single byte written to memory; the unit of the write log.
#[derive(Debug, Clone)]
pub struct StoreOp {
    pub address: SymExpr,
    pub value: SymExpr,
}

/// Read override consulted before the write log; lets embedders model
/// memory-mapped hardware registers as fresh symbolic values.
pub type ReadHook = Arc<dyn Fn(u32) -> Option<SymExpr> + Send + Sync>;

/// Byte-granular symbolic memory.
///
/// Writes append to a log of byte stores. A read first tries the hooks,
/// then scans the log backwards for an exact concrete-address match; if the
/// scan is inconclusive the pending log is frozen into a *capture* and the
/// read becomes a `Select` against that capture, which the solver
/// materializes as an SMT array version.
#[derive(Clone)]
pub struct Memory {
    captures: Vec<Arc<Vec<StoreOp>>>,
    stores: Vec<StoreOp>,
    concrete: bool,
    ignore_illegal_access: bool,
    alloc_next: u32,
    writes_since_last_branch: u32,
    hw_word_reads_since_last_branch: u32,
    word_read_hooks: Vec<ReadHook>,
    half_read_hooks: Vec<ReadHook>,
    byte_read_hooks: Vec<ReadHook>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self {
            captures: Vec::new(),
            stores: Vec::new(),
            concrete: false,
            ignore_illegal_access: false,
            alloc_next: BUFFER_ALLOC_START,
            writes_since_last_branch: 0,
            hw_word_reads_since_last_branch: 0,
            word_read_hooks: Vec::new(),
            half_read_hooks: Vec::new(),
            byte_read_hooks: Vec::new(),
        }
    }

    /// In concrete mode a read that misses the write log yields zero
    /// instead of a symbolic `Select`.
    pub fn concrete() -> Self {
        Self {
            concrete: true,
            ..Self::new()
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.concrete
    }

    pub fn set_concrete(&mut self, concrete: bool) {
        self.concrete = concrete;
    }

    pub fn set_ignore_illegal_access(&mut self, ignore: bool) {
        self.ignore_illegal_access = ignore;
    }

    pub fn add_word_read_hook(&mut self, hook: ReadHook) {
        self.word_read_hooks.push(hook);
    }

    pub fn add_half_read_hook(&mut self, hook: ReadHook) {
        self.half_read_hooks.push(hook);
    }

    pub fn add_byte_read_hook(&mut self, hook: ReadHook) {
        self.byte_read_hooks.push(hook);
    }

    /// Frozen memory versions referenced by `Select` nodes. The solver
    /// folds capture *i* over version *i - 1*.
    pub fn captures(&self) -> &[Arc<Vec<StoreOp>>] {
        &self.captures
    }

    /// Addresses with a `0xBC..=0xBE` top byte are memory-mapped hardware.
    pub fn is_hw_address(address: u32) -> bool {
        matches!(address >> 24, 0xBC..=0xBE)
    }

    pub fn writes_since_last_branch(&self) -> u32 {
        self.writes_since_last_branch
    }

    pub fn hw_word_reads_since_last_branch(&self) -> u32 {
        self.hw_word_reads_since_last_branch
    }

    pub fn reset_branch_access_tracking(&mut self) {
        self.writes_since_last_branch = 0;
        self.hw_word_reads_since_last_branch = 0;
    }

    /// Reserve `size` bytes filled with `init_byte` and return the base
    /// address. The next allocation starts at the following 16-byte
    /// boundary.
    pub fn allocate(&mut self, size: u32, init_byte: u8) -> u32 {
        let base = self.alloc_next;
        for offset in 0..size {
            self.stores.push(StoreOp {
                address: SymExpr::constant(base.wrapping_add(offset) as i32),
                value: SymExpr::constant(init_byte as i32),
            });
        }
        self.alloc_next = (base.wrapping_add(size) / 0x10 + 1) * 0x10;
        trace!("allocated {} bytes at {:#010x}", size, base);
        base
    }

    pub fn write_byte(&mut self, address: SymExpr, value: SymExpr) {
        self.writes_since_last_branch += 1;
        self.stores.push(StoreOp {
            address,
            value: byte_lane(value, 0),
        });
    }

    pub fn write_half(&mut self, address: SymExpr, value: SymExpr) -> Result<(), MemoryError> {
        self.check_alignment(&address, 2)?;
        self.writes_since_last_branch += 1;
        for i in 0..2 {
            self.stores.push(StoreOp {
                address: offset_address(&address, i),
                value: byte_lane(value.clone(), i),
            });
        }
        Ok(())
    }

    pub fn write_word(&mut self, address: SymExpr, value: SymExpr) -> Result<(), MemoryError> {
        self.check_alignment(&address, 4)?;
        self.writes_since_last_branch += 1;
        for i in 0..4 {
            self.stores.push(StoreOp {
                address: offset_address(&address, i),
                value: byte_lane(value.clone(), i),
            });
        }
        Ok(())
    }

    pub fn read_byte(&mut self, address: SymExpr, unsigned: bool) -> SymExpr {
        let lane = self.read_byte_lane(&address, &self.byte_read_hooks.clone());
        let op = if unsigned {
            UnaryOp::ZebMem
        } else {
            UnaryOp::SebMem
        };
        SymExpr::unary(op, lane)
    }

    pub fn read_half(
        &mut self,
        address: SymExpr,
        unsigned: bool,
    ) -> Result<SymExpr, MemoryError> {
        self.check_alignment(&address, 2)?;
        if let Some(v) = self.run_hooks(&address, &self.half_read_hooks.clone()) {
            return Ok(v);
        }
        let value = self.read_lanes(&address, 2);
        let op = if unsigned {
            UnaryOp::ZehMem
        } else {
            UnaryOp::SehMem
        };
        Ok(SymExpr::unary(op, value))
    }

    pub fn read_word(&mut self, address: SymExpr) -> Result<SymExpr, MemoryError> {
        self.check_alignment(&address, 4)?;
        if let Some(a) = address.as_const() {
            if Self::is_hw_address(a as u32) {
                self.hw_word_reads_since_last_branch += 1;
            }
        }
        if let Some(v) = self.run_hooks(&address, &self.word_read_hooks.clone()) {
            return Ok(v);
        }
        Ok(self.read_lanes(&address, 4))
    }

    /// Read `count` byte lanes starting at `address`, little-endian, and
    /// recompose them into a single value. All-constant lanes collapse to
    /// one `Const`; otherwise the lanes form a `Concat` chain.
    fn read_lanes(&mut self, address: &SymExpr, count: u32) -> SymExpr {
        let hooks = self.byte_read_hooks.clone();
        let lanes: Vec<SymExpr> = (0..count)
            .map(|i| self.read_byte_lane(&offset_address(address, i), &hooks))
            .collect();

        if lanes.iter().all(|l| l.as_const().is_some()) {
            let mut v: u32 = 0;
            for lane in lanes.iter().rev() {
                v = (v << 8) | (lane.as_const().unwrap() as u32 & 0xFF);
            }
            return SymExpr::constant(v as i32);
        }

        let mut iter = lanes.into_iter().rev();
        let msb = iter.next().unwrap();
        iter.fold(msb, |acc, lsb| SymExpr::concat(acc, lsb))
    }

    fn run_hooks(&mut self, address: &SymExpr, hooks: &[ReadHook]) -> Option<SymExpr> {
        let a = address.as_const()? as u32;
        hooks.iter().find_map(|hook| hook(a))
    }

    fn read_byte_lane(&mut self, address: &SymExpr, hooks: &[ReadHook]) -> SymExpr {
        if let Some(v) = self.run_hooks(address, hooks) {
            return v;
        }

        // Most recent write wins. A symbolic store address could alias
        // anything, so the whole scan stops there, older matches included,
        // and defers to the solver.
        if let Some(target) = address.as_const() {
            let mut blocked = false;
            for store in self.stores.iter().rev() {
                match store.address.as_const() {
                    Some(a) if a == target => return store.value.clone(),
                    Some(_) => {}
                    None => {
                        blocked = true;
                        break;
                    }
                }
            }
            if !blocked {
                'captures: for capture in self.captures.iter().rev() {
                    for store in capture.iter().rev() {
                        match store.address.as_const() {
                            Some(a) if a == target => return store.value.clone(),
                            Some(_) => {}
                            None => break 'captures,
                        }
                    }
                }
            }
            if self.concrete {
                return SymExpr::zero();
            }
        } else if self.concrete {
            return SymExpr::zero();
        }

        let capture = self.capture_stores();
        SymExpr::select(address.clone(), capture)
    }

    /// Freeze the pending write log into a new capture and return the
    /// version a fresh `Select` should target.
    fn capture_stores(&mut self) -> Option<usize> {
        if !self.stores.is_empty() {
            let frozen = std::mem::take(&mut self.stores);
            trace!("captured {} stores as mem{}", frozen.len(), self.captures.len());
            self.captures.push(Arc::new(frozen));
        }
        self.captures.len().checked_sub(1)
    }

    fn check_alignment(&self, address: &SymExpr, width: u32) -> Result<(), MemoryError> {
        if self.ignore_illegal_access {
            return Ok(());
        }
        if let Some(a) = address.as_const() {
            if (a as u32) % width != 0 {
                return Err(MemoryError::Unaligned {
                    address: a as u32,
                    width,
                });
            }
        }
        Ok(())
    }
}

fn offset_address(address: &SymExpr, offset: u32) -> SymExpr {
    if offset == 0 {
        return address.clone();
    }
    SymExpr::binary(
        crate::expr::BinaryOp::Add,
        address.clone(),
        SymExpr::constant(offset as i32),
    )
}

fn byte_lane(value: SymExpr, lane: u32) -> SymExpr {
    let low = lane * 8;
    SymExpr::extract(value, low + 7, low)
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("captures", &self.captures.len())
            .field("stores", &self.stores.len())
            .field("concrete", &self.concrete)
            .field("alloc_next", &self.alloc_next)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;

    fn addr(a: u32) -> SymExpr {
        SymExpr::constant(a as i32)
    }

    #[test]
    fn word_write_read_round_trip() {
        let mut mem = Memory::new();
        mem.write_word(addr(0x1000), SymExpr::constant(0x1234_5678))
            .unwrap();
        let v = mem.read_word(addr(0x1000)).unwrap();
        assert_eq!(v.as_const(), Some(0x1234_5678));
        // Little-endian lanes.
        assert_eq!(
            mem.read_byte(addr(0x1000), true).as_const(),
            Some(0x78)
        );
        assert_eq!(
            mem.read_byte(addr(0x1003), true).as_const(),
            Some(0x12)
        );
    }

    #[test]
    fn half_reads_extend_correctly() {
        let mut mem = Memory::new();
        mem.write_half(addr(0x2000), SymExpr::constant(0x8001))
            .unwrap();
        assert_eq!(
            mem.read_half(addr(0x2000), true).unwrap().as_const(),
            Some(0x8001)
        );
        assert_eq!(
            mem.read_half(addr(0x2000), false).unwrap().as_const(),
            Some(0x8001u16 as i16 as i32)
        );
    }

    #[test]
    fn latest_write_wins() {
        let mut mem = Memory::new();
        mem.write_word(addr(0x1000), SymExpr::constant(1)).unwrap();
        mem.write_word(addr(0x1000), SymExpr::constant(2)).unwrap();
        assert_eq!(mem.read_word(addr(0x1000)).unwrap().as_const(), Some(2));
    }

    #[test]
    fn unaligned_access_is_an_error() {
        let mut mem = Memory::new();
        assert!(matches!(
            mem.read_word(addr(0x1001)),
            Err(MemoryError::Unaligned {
                address: 0x1001,
                width: 4
            })
        ));
        assert!(mem.write_half(addr(0x2001), SymExpr::constant(1)).is_err());

        mem.set_ignore_illegal_access(true);
        assert!(mem.read_word(addr(0x1001)).is_ok());
    }

    #[test]
    fn concrete_mode_reads_zero_for_unwritten_memory() {
        let mut mem = Memory::concrete();
        assert_eq!(mem.read_word(addr(0x3000)).unwrap().as_const(), Some(0));
        assert!(mem.captures().is_empty());
    }

    #[test]
    fn unwritten_read_becomes_select_against_base_ram() {
        let mut mem = Memory::new();
        let v = mem.read_byte(addr(0x4000), true);
        match &*v {
            Expr::Unary(UnaryOp::ZebMem, lane) => match &**lane {
                Expr::Select { capture, .. } => assert_eq!(*capture, None),
                other => panic!("expected select, got {:?}", other),
            },
            other => panic!("expected zero-extended lane, got {:?}", other),
        }
    }

    #[test]
    fn symbolic_read_freezes_pending_stores() {
        let mut mem = Memory::new();
        mem.write_word(addr(0x1000), SymExpr::constant(42)).unwrap();
        let sym = SymExpr::symbolic("p");
        let v = mem.read_byte(sym, true);
        assert_eq!(mem.captures().len(), 1);
        assert_eq!(mem.captures()[0].len(), 4);
        match &*v {
            Expr::Unary(_, lane) => match &**lane {
                Expr::Select { capture, .. } => assert_eq!(*capture, Some(0)),
                other => panic!("expected select, got {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        // Concrete reads still see through frozen captures.
        assert_eq!(mem.read_word(addr(0x1000)).unwrap().as_const(), Some(42));
    }

    #[test]
    fn symbolic_store_address_blocks_point_lookup() {
        let mut mem = Memory::new();
        mem.write_word(addr(0x1000), SymExpr::constant(42)).unwrap();
        mem.write_byte(SymExpr::symbolic("q"), SymExpr::constant(7));
        let v = mem.read_byte(addr(0x1000), true);
        assert!(v.as_const().is_none());
    }

    #[test]
    fn symbolic_store_shadows_captured_concrete_value() {
        let mut mem = Memory::new();
        mem.write_word(addr(0x1000), SymExpr::constant(42)).unwrap();
        // Freeze the concrete store into a capture.
        let _ = mem.read_byte(SymExpr::symbolic("p"), true);
        assert_eq!(mem.captures().len(), 1);
        // A later store through a symbolic address may alias 0x1000; the
        // captured 42 must not leak past it.
        mem.write_byte(SymExpr::symbolic("q"), SymExpr::constant(7));
        let v = mem.read_byte(addr(0x1000), true);
        assert!(v.as_const().is_none());
        match &*v {
            Expr::Unary(_, lane) => match &**lane {
                Expr::Select { capture, .. } => assert_eq!(*capture, Some(1)),
                other => panic!("expected select, got {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn allocator_aligns_to_sixteen() {
        let mut mem = Memory::new();
        let a = mem.allocate(5, ALLOC_INIT_BYTE);
        assert_eq!(a, BUFFER_ALLOC_START);
        let b = mem.allocate(1, 0x00);
        assert_eq!(b % 0x10, 0);
        assert!(b >= a + 5);
        assert_eq!(
            mem.read_byte(addr(a + 4), true).as_const(),
            Some(ALLOC_INIT_BYTE as i32)
        );
        assert_eq!(mem.read_byte(addr(b), true).as_const(), Some(0));
    }

    #[test]
    fn read_hooks_override_the_write_log() {
        let mut mem = Memory::new();
        mem.write_word(addr(0xBC00_0010), SymExpr::constant(1))
            .unwrap();
        mem.add_word_read_hook(Arc::new(|a| {
            (a == 0xBC00_0010).then(|| SymExpr::symbolic("hw:status"))
        }));
        let v = mem.read_word(addr(0xBC00_0010)).unwrap();
        assert!(matches!(&*v, Expr::Symbolic(name) if name == "hw:status"));
    }

    #[test]
    fn hw_word_reads_are_counted() {
        let mut mem = Memory::new();
        let _ = mem.read_word(addr(0xBD00_0000)).unwrap();
        let _ = mem.read_word(addr(0x1000)).unwrap();
        assert_eq!(mem.hw_word_reads_since_last_branch(), 1);
        mem.write_byte(addr(0x1), SymExpr::constant(0));
        assert_eq!(mem.writes_since_last_branch(), 1);
        mem.reset_branch_access_tracking();
        assert_eq!(mem.hw_word_reads_since_last_branch(), 0);
        assert_eq!(mem.writes_since_last_branch(), 0);
    }
}
