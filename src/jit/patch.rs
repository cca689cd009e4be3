//! Patch step: move assembled bytes into executable memory and resolve
//! every reference that needed the code's final address: runtime-stub
//! calls, inline-cache anchors, switch jump tables and exception-handler
//! targets.
//!
//! After `finalize` returns, the code bytes are sealed. The only mutable
//! state attached to a compiled function is its inline-cache slots, which
//! live outside the code and are written as whole aligned words; nothing
//! ever re-emits instructions in place.

use std::sync::Arc;

use crate::error::CompileError;
use crate::vm::value::Value;

use super::compiler::{AnchorKind, CompileEnv, JitCompiler};
use super::ic::{CallCacheSlot, PropertyCacheSlot};
use super::memory::ExecutableAlloc;
use super::stubs::stub_addr;

/// A switch jump table with fully resolved absolute targets; holes were
/// filled with the default target at patch time.
pub struct NativeSwitchTable {
    pub min: i64,
    pub default: u64,
    pub targets: Vec<u64>,
}

/// Offsets the runtime needs to find its way around one inline-cache site.
#[derive(Debug, Clone, Copy)]
pub struct IcSite {
    pub bytecode_offset: u32,
    pub hot_path_begin: usize,
    pub cold_path_begin: usize,
}

/// The finalized output of one compilation: sealed executable code plus
/// the tables the runtime consumes.
pub struct CompiledCode {
    alloc: ExecutableAlloc,
    size: usize,
    /// Exception handlers: bytecode target -> native offset.
    handler_table: Vec<(u32, usize)>,
    /// Native return offsets of every call emitted, with the bytecode
    /// offset of the owning opcode; used to attribute faults when walking
    /// frames.
    call_returns: Vec<(usize, u32)>,
    switch_tables: Vec<NativeSwitchTable>,
    prop_ics: Vec<Box<PropertyCacheSlot>>,
    call_ics: Vec<Box<CallCacheSlot>>,
    prop_sites: Vec<IcSite>,
    call_sites: Vec<IcSite>,
    unresolved: usize,
}

// The code is sealed read-execute and all remaining mutation goes through
// the cache slots' atomics.
unsafe impl Send for CompiledCode {}
unsafe impl Sync for CompiledCode {}

impl CompiledCode {
    pub fn entry(&self) -> *const u8 {
        self.alloc.as_ptr()
    }

    pub fn code_size(&self) -> usize {
        self.size
    }

    /// Deferred references that survived finalization; always zero.
    pub fn unresolved_references(&self) -> usize {
        self.unresolved
    }

    /// Absolute native address of a bytecode offset that is an exception
    /// handler target.
    pub fn native_addr_of(&self, handler_target: u32) -> u64 {
        self.handler_table
            .iter()
            .find(|(bc, _)| *bc == handler_target)
            .map(|(_, off)| self.entry() as u64 + *off as u64)
            .unwrap_or(0)
    }

    pub fn handler_table(&self) -> &[(u32, usize)] {
        &self.handler_table
    }

    pub fn call_return_table(&self) -> &[(usize, u32)] {
        &self.call_returns
    }

    /// Bytecode offset owning the call that returns to `native_offset`.
    pub fn bytecode_for_return(&self, native_offset: usize) -> Option<u32> {
        self.call_returns
            .iter()
            .find(|(off, _)| *off == native_offset)
            .map(|(_, bc)| *bc)
    }

    /// Resolve a switch dispatch to an absolute native target.
    pub fn switch_target(&self, table_index: usize, scrutinee: Value) -> u64 {
        let table = &self.switch_tables[table_index];
        if scrutinee.is_int() {
            let i = scrutinee.as_int() - table.min;
            if (0..table.targets.len() as i64).contains(&i) {
                return table.targets[i as usize];
            }
        }
        table.default
    }

    pub fn prop_cache(&self, index: usize) -> &PropertyCacheSlot {
        &self.prop_ics[index]
    }

    pub fn prop_cache_count(&self) -> usize {
        self.prop_ics.len()
    }

    pub fn call_cache(&self, index: usize) -> &CallCacheSlot {
        &self.call_ics[index]
    }

    pub fn call_cache_count(&self) -> usize {
        self.call_ics.len()
    }

    pub fn prop_sites(&self) -> &[IcSite] {
        &self.prop_sites
    }

    pub fn call_sites(&self) -> &[IcSite] {
        &self.call_sites
    }
}

/// Copy the assembled bytes into pooled executable memory and resolve all
/// remaining absolute references.
pub(crate) fn finalize(
    c: JitCompiler<'_>,
    env: &CompileEnv,
) -> Result<Arc<CompiledCode>, CompileError> {
    let JitCompiler {
        unit,
        mut buf,
        labels,
        calls,
        call_returns,
        anchors,
        prop_sites,
        call_sites,
        switches,
        ..
    } = c;

    // Cache slots first: their addresses are what the anchors resolve to.
    let prop_ics: Vec<Box<PropertyCacheSlot>> = prop_sites
        .iter()
        .map(|s| Box::new(PropertyCacheSlot::new(s.sym)))
        .collect();
    let call_ics: Vec<Box<CallCacheSlot>> =
        call_sites.iter().map(|_| Box::new(CallCacheSlot::new())).collect();

    let mut unresolved = calls.len() + anchors.len();
    for rec in &calls {
        buf.patch_u64(rec.imm_at, stub_addr(rec.stub));
        unresolved -= 1;
    }
    for a in &anchors {
        let addr = match a.kind {
            AnchorKind::Prop(i) => &*prop_ics[i] as *const PropertyCacheSlot as u64,
            AnchorKind::Call(i) => &*call_ics[i] as *const CallCacheSlot as u64,
        };
        buf.patch_u64(a.imm_at, addr);
        unresolved -= 1;
    }

    let code = buf.into_code();
    let mut alloc = env.pool.acquire(code.len())?;
    alloc.memory_mut().write(0, &code)?;
    let base = alloc.as_ptr() as u64;

    let label_addr = |bc: usize| -> Result<u64, CompileError> {
        match labels.get(bc).map(|l| l.offset) {
            Some(off) if off != usize::MAX => Ok(base + off as u64),
            _ => Err(CompileError::MalformedBytecode {
                unit: unit.name.clone(),
                offset: bc,
                reason: "branch target inside an instruction".into(),
            }),
        }
    };

    // Translate switch case offsets into absolute addresses, filling holes
    // with the default target.
    let mut switch_tables = Vec::with_capacity(switches.len());
    for record in &switches {
        let table = &unit.switch_tables[record.table_index];
        let default_rel = unit.code[record.bc + 2] as i32;
        let default = label_addr((record.bc as i64 + default_rel as i64) as usize)?;
        let mut targets = Vec::with_capacity(table.offsets.len());
        for &off in &table.offsets {
            if off == 0 {
                targets.push(default);
            } else {
                targets.push(label_addr((record.bc as i64 + off as i64) as usize)?);
            }
        }
        switch_tables.push(NativeSwitchTable {
            min: table.min,
            default,
            targets,
        });
    }

    let mut handler_table = Vec::with_capacity(unit.handlers.len());
    for h in &unit.handlers {
        let addr = label_addr(h.target as usize)?;
        handler_table.push((h.target, (addr - base) as usize));
    }

    // New call sites dispatch through the pre-link trampoline until the
    // runtime links them.
    for ic in &call_ics {
        ic.set_slow_target(env.trampolines.prelink_addr());
    }

    alloc.memory_mut().make_executable()?;

    let to_sites = |bc: u32, hot: usize, cold: usize| IcSite {
        bytecode_offset: bc,
        hot_path_begin: hot,
        cold_path_begin: cold,
    };

    Ok(Arc::new(CompiledCode {
        alloc,
        size: code.len(),
        handler_table,
        call_returns,
        switch_tables,
        prop_sites: prop_sites
            .iter()
            .map(|s| to_sites(s.bc, s.hot_begin, s.cold_begin))
            .collect(),
        call_sites: call_sites
            .iter()
            .map(|s| to_sites(s.bc, s.hot_begin, s.cold_begin))
            .collect(),
        prop_ics,
        call_ics,
        unresolved,
    }))
}
