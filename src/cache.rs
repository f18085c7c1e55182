// src/cache.rs
//
// Compiling a program is expensive and depends only on compile-time inputs:
// operation identity, shapes, dtypes, layouts, attributes. Device buffer
// addresses are cheap and change on every call. The cache therefore keys on
// a fingerprint of the former and re-binds the latter on every submission,
// hit or miss. Address independence is structural: nothing address-shaped
// can enter a `Fingerprint`, and the cached artifact is immutable — binding
// produces a fresh `BoundProgram`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::DeviceAddr;

/// Element type of a tensor, as far as compilation cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bfloat16,
    Float32,
    Uint32,
}

/// On-device page layout of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageLayout {
    RowMajor,
    Tile,
}

/// Which memory bank a tensor lives in. Part of the fingerprint because it
/// changes the generated data-movement code, unlike the address within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    Dram,
    L1,
}

/// Compile-time-significant description of one tensor input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub shape: Vec<u32>,
    pub dtype: DataType,
    pub layout: PageLayout,
    pub memory: MemoryKind,
}

impl TensorSpec {
    pub fn new(shape: impl Into<Vec<u32>>, dtype: DataType, layout: PageLayout) -> Self {
        TensorSpec {
            shape: shape.into(),
            dtype,
            layout,
            memory: MemoryKind::Dram,
        }
    }

    pub fn in_memory(mut self, memory: MemoryKind) -> Self {
        self.memory = memory;
        self
    }

    /// Element count, for builders that size work by volume.
    pub fn volume(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }
}

/// A compile-time operation attribute.
///
/// Floats are stored as bit patterns so fingerprints stay `Eq + Hash` without
/// tolerance ambiguity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Bool(bool),
    Str(String),
    F32Bits(u32),
}

impl AttrValue {
    pub fn from_f32(value: f32) -> Self {
        AttrValue::F32Bits(value.to_bits())
    }
}

/// Cache key: a faithful function of every compile-time-significant input.
///
/// Two submissions with equal fingerprints must be satisfiable by the same
/// compiled program; runtime addresses are deliberately unrepresentable here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    op: String,
    attrs: Vec<(String, AttrValue)>,
    inputs: Vec<TensorSpec>,
}

impl Fingerprint {
    pub fn new(op: impl Into<String>) -> Self {
        Fingerprint {
            op: op.into(),
            attrs: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.push((name.into(), value));
        self
    }

    pub fn input(mut self, spec: TensorSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    pub fn op(&self) -> &str {
        &self.op
    }
}

/// Runtime arguments of a program: the per-call words the patch callback
/// rewrites, addresses first among them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeArgs {
    words: Vec<u32>,
}

impl RuntimeArgs {
    pub fn new(words: Vec<u32>) -> Self {
        RuntimeArgs { words }
    }

    pub fn set(&mut self, index: usize, value: u32) {
        self.words[index] = value;
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }
}

type PatchFn = dyn Fn(&mut RuntimeArgs, &[DeviceAddr]) + Send + Sync;

/// A compiled device program: instruction words plus the callback that
/// injects fresh buffer addresses into its runtime arguments.
///
/// Immutable once cached; every submission binds addresses into a fresh
/// [`BoundProgram`] instead of mutating the cached artifact.
pub struct CompiledProgram {
    instructions: Arc<[u32]>,
    base_args: RuntimeArgs,
    patch: Box<PatchFn>,
    generation: u64,
}

impl CompiledProgram {
    pub fn new(
        instructions: Vec<u32>,
        base_args: Vec<u32>,
        patch: impl Fn(&mut RuntimeArgs, &[DeviceAddr]) + Send + Sync + 'static,
    ) -> Self {
        CompiledProgram {
            instructions: instructions.into(),
            base_args: RuntimeArgs::new(base_args),
            patch: Box::new(patch),
            generation: 0,
        }
    }

    pub fn instructions(&self) -> &[u32] {
        &self.instructions
    }

    /// Cache admission order; distinguishes rebuilt entries after a clear.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bind the current buffer addresses, producing the submittable form.
    /// Applied on every submission, hit or miss.
    pub fn bind(&self, addresses: &[DeviceAddr]) -> BoundProgram {
        let mut args = self.base_args.clone();
        (self.patch)(&mut args, addresses);
        BoundProgram {
            instructions: self.instructions.clone(),
            args,
            generation: self.generation,
        }
    }
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("instructions", &self.instructions.len())
            .field("base_args", &self.base_args.words().len())
            .field("generation", &self.generation)
            .finish()
    }
}

/// A program with addresses bound, ready to be encoded into a command
/// payload.
#[derive(Debug, Clone)]
pub struct BoundProgram {
    instructions: Arc<[u32]>,
    args: RuntimeArgs,
    generation: u64,
}

impl BoundProgram {
    pub fn instructions(&self) -> &[u32] {
        &self.instructions
    }

    pub fn args(&self) -> &RuntimeArgs {
        &self.args
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Payload layout: instruction count, arg count, instructions, args; all
    /// little-endian u32.
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(8 + 4 * (self.instructions.len() + self.args.words().len()));
        buf.extend_from_slice(&(self.instructions.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.args.words().len() as u32).to_le_bytes());
        for word in self.instructions.iter() {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        for word in self.args.words() {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }
}

/// Decode a payload produced by [`BoundProgram::encode_payload`] back into
/// (instructions, runtime args). Used by the device side.
pub fn decode_program_payload(buf: &[u8]) -> Option<(Vec<u32>, Vec<u32>)> {
    if buf.len() < 8 {
        return None;
    }
    let word = |i: usize| -> u32 {
        u32::from_le_bytes(buf[4 * i..4 * i + 4].try_into().expect("4-byte slice"))
    };
    let n_instr = word(0) as usize;
    let n_args = word(1) as usize;
    if buf.len() < 8 + 4 * (n_instr + n_args) {
        return None;
    }
    let instructions = (0..n_instr).map(|i| word(2 + i)).collect();
    let args = (0..n_args).map(|i| word(2 + n_instr + i)).collect();
    Some((instructions, args))
}

struct CacheSlot {
    program: Mutex<Option<Arc<CompiledProgram>>>,
}

/// The compiled-program cache.
///
/// Guarantees at most one build per distinct fingerprint, also under
/// concurrent submission: the map lock is held only to find or create the
/// per-fingerprint slot, and the slot's own lock serializes the build.
/// Entries persist for the process lifetime — this is a correctness cache,
/// not a capacity-bounded one.
pub struct ProgramCache {
    enabled: AtomicBool,
    entries: Mutex<HashMap<Fingerprint, Arc<CacheSlot>>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramCache {
    pub fn new() -> Self {
        ProgramCache {
            enabled: AtomicBool::new(true),
            entries: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
        }
    }

    /// Return the cached program for `fingerprint`, or invoke `build` exactly
    /// once to create it.
    ///
    /// With the cache disabled, `build` runs on every call and nothing is
    /// stored — the differential-testing baseline for the enabled cache.
    pub fn get_or_build(
        &self,
        fingerprint: &Fingerprint,
        build: impl FnOnce() -> CompiledProgram,
    ) -> Arc<CompiledProgram> {
        if !self.is_enabled() {
            return Arc::new(self.run_builder(build));
        }

        let slot = {
            let mut entries = self.entries.lock();
            entries
                .entry(fingerprint.clone())
                .or_insert_with(|| {
                    Arc::new(CacheSlot {
                        program: Mutex::new(None),
                    })
                })
                .clone()
        };

        let mut program = slot.program.lock();
        match &*program {
            Some(cached) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    target: "spindle::cache",
                    op = fingerprint.op(),
                    "program cache hit"
                );
                cached.clone()
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target: "spindle::cache",
                    op = fingerprint.op(),
                    "program cache miss, compiling"
                );
                let built = Arc::new(self.run_builder(build));
                *program = Some(built.clone());
                built
            }
        }
    }

    fn run_builder(&self, build: impl FnOnce() -> CompiledProgram) -> CompiledProgram {
        let mut program = build();
        program.generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.builds.fetch_add(1, Ordering::Relaxed);
        program
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Number of distinct fingerprints admitted.
    pub fn num_entries(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drop every entry (testing hook; the hot path never evicts).
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Total builder invocations, including disabled-path builds.
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }
}
