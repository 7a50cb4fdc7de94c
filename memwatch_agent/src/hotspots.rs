//! Allocation hotspot tracker: a sampling profiler behind the global
//! allocator. Every `sample_rate`-th allocation above `min_alloc_bytes`
//! captures a short call stack; reports aggregate live bytes per code
//! location.
//!
//! The allocator hook can only reach the profiler through a process-wide
//! slot. Everything else goes through [`HotspotTracker`], which owns the
//! start/stop lifecycle and is handed to the aggregator explicitly.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    cmp::Reverse,
    collections::HashMap,
    ffi::c_void,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use backtrace::{resolve, trace_unsynchronized};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::info;

use crate::error::AgentError;
use crate::snapshot::{HotspotEntry, HotspotLocation, SourceKind};

const MAX_STACK_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub enabled: bool,
    pub sample_rate: u64,
    pub min_alloc_bytes: usize,
    pub max_tracked: usize,
    /// Frames skipped at the top of each captured stack (the stack walker).
    pub stack_skip: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 64,
            min_alloc_bytes: 128,
            max_tracked: 100_000,
            stack_skip: 2,
        }
    }
}

#[derive(Clone, Copy, Default, Hash, Eq, PartialEq)]
struct StackKey {
    len: u8,
    frames: [usize; MAX_STACK_DEPTH],
}

impl StackKey {
    fn from_frames(frames: &[usize]) -> Self {
        let mut key = StackKey::default();
        let n = frames.len().min(MAX_STACK_DEPTH);
        key.frames[..n].copy_from_slice(&frames[..n]);
        key.len = n as u8;
        key
    }

    fn frames(&self) -> &[usize] {
        &self.frames[..self.len as usize]
    }
}

#[derive(Clone, Copy)]
struct AllocationMeta {
    stack: StackKey,
    weighted_bytes: u64,
    weight: u64,
}

#[derive(Clone, Copy, Default)]
struct StackStats {
    live_bytes: u64,
    live_count: u64,
    first_seen: u64,
}

#[derive(Debug, Clone)]
struct ResolvedFrame {
    symbol: String,
    file: Option<String>,
    line: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProfilerStats {
    pub recording: bool,
    pub sample_rate: u64,
    pub tracked_allocations: usize,
    pub dropped_allocations: u64,
    pub distinct_stacks: usize,
}

pub struct AllocationProfiler {
    recording: AtomicBool,
    sample_rate: AtomicU64,
    min_alloc_bytes: AtomicUsize,
    max_tracked: AtomicUsize,
    stack_skip: usize,
    alloc_seq: AtomicU64,
    stack_seq: AtomicU64,
    tracked: AtomicUsize,
    dropped: AtomicU64,
    allocations: DashMap<usize, AllocationMeta>,
    stacks: DashMap<StackKey, StackStats>,
    symbols: DashMap<usize, Vec<ResolvedFrame>>,
}

impl AllocationProfiler {
    pub fn new(config: &ProfilerConfig) -> Self {
        Self {
            recording: AtomicBool::new(false),
            sample_rate: AtomicU64::new(config.sample_rate.max(1)),
            min_alloc_bytes: AtomicUsize::new(config.min_alloc_bytes),
            max_tracked: AtomicUsize::new(config.max_tracked.max(1)),
            stack_skip: config.stack_skip,
            alloc_seq: AtomicU64::new(0),
            stack_seq: AtomicU64::new(0),
            tracked: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            allocations: DashMap::new(),
            stacks: DashMap::new(),
            symbols: DashMap::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        let _guard = ReentryGuard::enter();
        self.allocations.clear();
        self.stacks.clear();
        self.alloc_seq.store(0, Ordering::Relaxed);
        self.stack_seq.store(0, Ordering::Relaxed);
        self.tracked.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ProfilerStats {
        ProfilerStats {
            recording: self.is_recording(),
            sample_rate: self.sample_rate.load(Ordering::Relaxed),
            tracked_allocations: self.tracked.load(Ordering::Relaxed),
            dropped_allocations: self.dropped.load(Ordering::Relaxed),
            distinct_stacks: self.stacks.len(),
        }
    }

    fn on_alloc(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() || !self.is_recording() {
            return;
        }
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };
        if let Some(weight) = self.sample_decision(size) {
            let stack = self.capture_stack();
            self.insert(ptr as usize, size, weight, stack);
        }
    }

    fn on_dealloc(&self, ptr: *mut u8) {
        if ptr.is_null() || self.tracked.load(Ordering::Relaxed) == 0 {
            return;
        }
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };
        self.remove(ptr as usize);
    }

    fn on_realloc(&self, old_ptr: *mut u8, new_ptr: *mut u8, size: usize) {
        self.on_dealloc(old_ptr);
        self.on_alloc(new_ptr, size);
    }

    /// `Some(weight)` when this allocation is sampled.
    fn sample_decision(&self, size: usize) -> Option<u64> {
        if size < self.min_alloc_bytes.load(Ordering::Relaxed) {
            return None;
        }
        let rate = self.sample_rate.load(Ordering::Relaxed).max(1);
        let seq = self.alloc_seq.fetch_add(1, Ordering::Relaxed);
        (seq % rate == 0).then_some(rate)
    }

    fn insert(&self, ptr: usize, size: usize, weight: u64, stack: StackKey) {
        if self.tracked.load(Ordering::Relaxed) >= self.max_tracked.load(Ordering::Relaxed) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // address reuse while a stale entry is still tracked
        self.remove(ptr);

        let weighted_bytes = (size as u64).saturating_mul(weight);
        self.allocations.insert(
            ptr,
            AllocationMeta {
                stack,
                weighted_bytes,
                weight,
            },
        );
        self.tracked.fetch_add(1, Ordering::Relaxed);

        let mut stats = self.stacks.entry(stack).or_insert_with(|| StackStats {
            first_seen: self.stack_seq.fetch_add(1, Ordering::Relaxed),
            ..StackStats::default()
        });
        stats.live_bytes = stats.live_bytes.saturating_add(weighted_bytes);
        stats.live_count = stats.live_count.saturating_add(weight);
    }

    fn remove(&self, ptr: usize) -> bool {
        let Some((_, meta)) = self.allocations.remove(&ptr) else {
            return false;
        };
        self.release_slot();
        if let Some(mut stats) = self.stacks.get_mut(&meta.stack) {
            stats.live_bytes = stats.live_bytes.saturating_sub(meta.weighted_bytes);
            stats.live_count = stats.live_count.saturating_sub(meta.weight);
        }
        true
    }

    // A reset on another thread may already have zeroed the counter.
    fn release_slot(&self) {
        let _ = self
            .tracked
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    fn capture_stack(&self) -> StackKey {
        let mut frames = [0usize; MAX_STACK_DEPTH];
        let mut len = 0usize;
        let mut skip = self.stack_skip;
        // SAFETY: only the current thread's stack is walked and no
        // symbolization happens inside the allocator hook.
        unsafe {
            trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                if ip == 0 {
                    return true;
                }
                if skip > 0 {
                    skip -= 1;
                    return true;
                }
                frames[len] = ip;
                len += 1;
                len < MAX_STACK_DEPTH
            });
        }
        StackKey::from_frames(&frames[..len])
    }

    /// Every symbol at `addr`, innermost inlined frame first.
    fn resolve_frame(&self, addr: usize) -> Vec<ResolvedFrame> {
        if let Some(hit) = self.symbols.get(&addr) {
            return hit.value().clone();
        }
        let mut chain = Vec::new();
        resolve(addr as *mut c_void, |symbol| {
            chain.push(ResolvedFrame {
                symbol: symbol
                    .name()
                    .map(|name| strip_symbol_hash(&name.to_string()))
                    .unwrap_or_else(|| format!("0x{addr:x}")),
                file: symbol.filename().map(|p| p.display().to_string()),
                line: symbol.lineno(),
            });
        });
        if chain.is_empty() {
            chain.push(ResolvedFrame {
                symbol: format!("0x{addr:x}"),
                file: None,
                line: None,
            });
        }
        self.symbols.insert(addr, chain.clone());
        chain
    }

    /// First frame outside allocator and profiler plumbing.
    fn site_for(&self, stack: &StackKey) -> HotspotLocation {
        let mut first = None;
        for addr in stack.frames() {
            for frame in self.resolve_frame(*addr) {
                if !is_internal_symbol(&frame.symbol) {
                    return location(frame);
                }
                first.get_or_insert(frame);
            }
        }
        first.map(location).unwrap_or_else(|| HotspotLocation {
            file: None,
            line: None,
            symbol: "unknown".into(),
        })
    }

    /// Largest live allocation sites, ties by first observation.
    pub fn top_sites(&self, n: usize) -> Vec<HotspotEntry> {
        let _guard = ReentryGuard::enter();
        let rows: Vec<(StackKey, StackStats)> = self
            .stacks
            .iter()
            .filter(|e| e.value().live_bytes > 0)
            .map(|e| (*e.key(), *e.value()))
            .collect();

        // location -> (live bytes, live count, first seen)
        let mut sites: HashMap<HotspotLocation, (u64, u64, u64)> = HashMap::new();
        for (stack, stats) in rows {
            let entry = sites
                .entry(self.site_for(&stack))
                .or_insert((0, 0, stats.first_seen));
            entry.0 = entry.0.saturating_add(stats.live_bytes);
            entry.1 = entry.1.saturating_add(stats.live_count);
            entry.2 = entry.2.min(stats.first_seen);
        }

        let mut ranked: Vec<_> = sites.into_iter().collect();
        ranked.sort_by_key(|(_, (bytes, _, first))| (Reverse(*bytes), *first));
        ranked
            .into_iter()
            .take(n)
            .map(|(location, (size_bytes, count, _))| HotspotEntry {
                location,
                size_bytes,
                count,
            })
            .collect()
    }
}

fn location(frame: ResolvedFrame) -> HotspotLocation {
    HotspotLocation {
        file: frame.file,
        line: frame.line,
        symbol: frame.symbol,
    }
}

fn strip_symbol_hash(value: &str) -> String {
    if let Some(index) = value.rfind("::h") {
        let hash = &value[index + 3..];
        if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return value[..index].to_string();
        }
    }
    value.to_string()
}

const INTERNAL_PREFIXES: [&str; 13] = [
    "memwatch_agent::hotspots::",
    "core::",
    "alloc::",
    "std::",
    "__rust_",
    "__rdl_",
    "__rg_",
    "backtrace::",
    "dashmap::",
    "hashbrown::",
    "once_cell::",
    "_Unwind_",
    "0x",
];

fn has_internal_prefix(path: &str) -> bool {
    INTERNAL_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Allocator shims, std/alloc plumbing and the profiler itself. Handles the
/// `__rustc[<hash>]::` shim prefix and `<T as Trait>::method` paths.
fn is_internal_symbol(symbol: &str) -> bool {
    let symbol = match symbol.strip_prefix("__rustc[").and_then(|rest| rest.split_once("]::")) {
        Some((_, shim)) => shim,
        None => symbol,
    };
    match symbol.strip_prefix('<') {
        Some(qualified) => match qualified.split_once(" as ") {
            Some((ty, tr)) => has_internal_prefix(ty) || has_internal_prefix(tr),
            None => has_internal_prefix(qualified),
        },
        None => has_internal_prefix(symbol),
    }
}

thread_local! {
    static IN_PROFILER_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Keeps the profiler's own allocations out of its books.
struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> Option<Self> {
        IN_PROFILER_HOOK
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(ReentryGuard)
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_PROFILER_HOOK.try_with(|flag| flag.set(false));
    }
}

static PROFILER: OnceCell<AllocationProfiler> = OnceCell::new();

fn active_profiler() -> Option<&'static AllocationProfiler> {
    PROFILER.get().filter(|p| p.is_recording())
}

/// System allocator with sampling hooks. Install with `#[global_allocator]`.
pub struct SamplingAllocator;

unsafe impl GlobalAlloc for SamplingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if let Some(p) = active_profiler() {
            p.on_alloc(ptr, layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if let Some(p) = active_profiler() {
            p.on_alloc(ptr, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(p) = PROFILER.get() {
            p.on_dealloc(ptr);
        }
        System.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let next = System.realloc(ptr, layout, new_size);
        if !next.is_null() {
            if let Some(p) = PROFILER.get() {
                p.on_realloc(ptr, next, new_size);
            }
        }
        next
    }
}

pub trait HotspotSource: Send + Sync {
    fn top_hotspots(&self, n: usize) -> Result<Vec<HotspotEntry>, AgentError>;
}

/// Process-scoped handle on the allocation profiler.
pub struct HotspotTracker {
    profiler: &'static AllocationProfiler,
}

impl HotspotTracker {
    /// Bind to the process-wide profiler slot (created on first call).
    pub fn install(config: &ProfilerConfig) -> Self {
        let profiler = PROFILER.get_or_init(|| AllocationProfiler::new(config));
        Self { profiler }
    }

    pub fn with_profiler(profiler: &'static AllocationProfiler) -> Self {
        Self { profiler }
    }

    pub fn start(&self) {
        self.profiler.set_recording(true);
        info!(
            "allocation profiler started (1 in {} allocations)",
            self.profiler.stats().sample_rate
        );
    }

    /// Stop recording and drop everything gathered so far.
    pub fn stop(&self) {
        self.profiler.set_recording(false);
        self.profiler.reset();
        info!("allocation profiler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.profiler.is_recording()
    }

    pub fn stats(&self) -> ProfilerStats {
        self.profiler.stats()
    }
}

impl HotspotSource for HotspotTracker {
    fn top_hotspots(&self, n: usize) -> Result<Vec<HotspotEntry>, AgentError> {
        if !self.is_running() {
            return Err(AgentError::unavailable(
                SourceKind::Hotspots,
                "allocation profiler is not running",
            ));
        }
        Ok(self.profiler.top_sites(n))
    }
}
