//! # NetSpec Core
//!
//! Shared types and utilities for declarative network instantiation.
//!
//! ## Contents
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`NetSpecError`] | Every failure a build can report |
//! | [`SimConfig`] | Simulation-wide configuration handed through to the engine |
//! | [`StreamKey`] | Reproducible random streams keyed by stable identifiers |
//! | [`CellCollection`] | Ordered set of cell identifiers |
//!
//! ## Design Philosophy
//!
//! 1. Fail fast: no partially built network is ever usable
//! 2. Reproducibility independent of thread count or scheduling
//! 3. Declarations are validated into typed structures before any generation

use nalgebra::Point3;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// ERRORS
// =============================================================================

/// Kind of label a declaration can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReferenceKind {
    SynMech,
    StimSource,
    CellRule,
    ConnRule,
    Tag,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReferenceKind::SynMech => "synaptic mechanism",
            ReferenceKind::StimSource => "stimulus source",
            ReferenceKind::CellRule => "cell parameter rule",
            ReferenceKind::ConnRule => "connectivity rule",
            ReferenceKind::Tag => "cell tag",
        };
        f.write_str(name)
    }
}

/// Common errors
#[derive(Debug, Error)]
pub enum NetSpecError {
    #[error("Unresolved {kind} '{label}' referenced by '{context}'")]
    UnresolvedReference {
        kind: ReferenceKind,
        label: String,
        context: String,
    },

    #[error("Malformed expression in '{label}': {detail} in `{expr}`{}", render_bindings(.bindings))]
    MalformedExpression {
        label: String,
        expr: String,
        detail: String,
        /// Bound variable values at the point of failure, empty at compile time
        bindings: String,
    },

    #[error("Invalid range in '{label}': {detail}")]
    InvalidRange { label: String, detail: String },

    #[error("Probability {value} of rule '{label}' is outside [0, 1]{}", render_pair(.pair))]
    InvalidProbability {
        label: String,
        value: f64,
        /// (pre, post) when the value came from a per-pair formula
        pair: Option<(CellId, CellId)>,
    },

    #[error("Invalid declaration '{label}': {detail}")]
    InvalidDeclaration { label: String, detail: String },

    #[error("Build stage out of order: cannot {requested} while {current}")]
    Stage { requested: String, current: String },

    #[error("Template import failed for '{file}': {detail}")]
    Import { file: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn render_bindings(bindings: &str) -> String {
    if bindings.is_empty() {
        String::new()
    } else {
        format!(" where {bindings}")
    }
}

fn render_pair(pair: &Option<(CellId, CellId)>) -> String {
    match pair {
        Some((pre, post)) => format!(" for pair {pre} -> {post}"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, NetSpecError>;

// =============================================================================
// UNITS AND IDENTIFIERS
// =============================================================================

/// Length (um)
pub type Micrometer = f64;

/// Time (ms)
pub type Millisecond = f64;

/// Rate (Hz)
pub type Hertz = f64;

/// Global cell identifier, assigned sequentially across populations
pub type CellId = usize;

/// Absolute cell position (um)
pub type Position = Point3<Micrometer>;

/// Ordered collection of cell identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCollection {
    pub ids: Vec<CellId>,
}

impl CellCollection {
    pub fn new(ids: Vec<CellId>) -> Self {
        Self { ids }
    }

    /// `len` consecutive identifiers starting at `start`
    pub fn contiguous(start: CellId, len: usize) -> Self {
        Self::new((start..start + len).collect())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn first(&self) -> Option<CellId> {
        self.ids.first().copied()
    }

    pub fn last(&self) -> Option<CellId> {
        self.ids.last().copied()
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CellId> {
        self.ids.iter()
    }
}

impl<'a> IntoIterator for &'a CellCollection {
    type Item = &'a CellId;
    type IntoIter = std::slice::Iter<'a, CellId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

// =============================================================================
// SIMULATION CONFIGURATION
// =============================================================================

/// Per-stage random seeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Seeds {
    /// Connectivity draws
    pub conn: u64,
    /// Stimulus weight/delay draws
    pub stim: u64,
    /// Cell placement
    pub loc: u64,
}

impl Seeds {
    /// Same seed for every stage
    pub fn uniform(seed: u64) -> Self {
        Self {
            conn: seed,
            stim: seed,
            loc: seed,
        }
    }
}

impl Default for Seeds {
    fn default() -> Self {
        Self::uniform(1)
    }
}

/// Simulation configuration
///
/// Only `seeds`, `threads` and `print_syns_after_rule` influence the build;
/// the remaining fields travel with the network graph to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimConfig {
    /// Simulated time (ms)
    pub duration: Millisecond,
    /// Integration time step (ms)
    pub dt: Millisecond,
    /// Recording interval (ms)
    pub record_step: Millisecond,
    /// Output file stem
    pub filename: String,
    pub verbose: bool,
    /// Log the number of connections produced by each rule
    pub print_syns_after_rule: bool,
    pub seeds: Seeds,
    /// Worker threads for connectivity; `None` uses the global pool
    pub threads: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            duration: 1000.0,
            dt: 0.025,
            record_step: 0.1,
            filename: "model_output".into(),
            verbose: false,
            print_syns_after_rule: false,
            seeds: Seeds::default(),
            threads: None,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.dt > 0.0) {
            return Err(NetSpecError::Config(format!("dt must be positive, got {}", self.dt)));
        }
        if !(self.duration >= 0.0) {
            return Err(NetSpecError::Config(format!(
                "duration must be non-negative, got {}",
                self.duration
            )));
        }
        if !(self.record_step > 0.0) {
            return Err(NetSpecError::Config(format!(
                "recordStep must be positive, got {}",
                self.record_step
            )));
        }
        if self.threads == Some(0) {
            return Err(NetSpecError::Config("threads must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// REPRODUCIBLE RANDOM STREAMS
// =============================================================================

/// Key of an independent random stream.
///
/// Keys are derived by folding stable identifiers (seed, stage, declaration
/// label, cell ids) so that every draw depends only on *what* is being
/// generated, never on the order or thread it is generated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey(u64);

impl StreamKey {
    /// Root key for one build stage
    pub fn root(seed: u64, domain: &str) -> Self {
        Self(splitmix64(seed ^ fnv1a(domain.as_bytes())))
    }

    /// Key scoped to a declaration
    pub fn child(self, label: &str) -> Self {
        Self(splitmix64(self.0 ^ fnv1a(label.as_bytes())))
    }

    /// Generator for one entity (cell, pair, ...)
    pub fn rng(self, ids: &[u64]) -> ChaCha12Rng {
        let key = ids.iter().fold(self.0, |acc, &id| splitmix64(acc ^ splitmix64(id)));
        ChaCha12Rng::seed_from_u64(key)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(FNV_OFFSET, |hash, &b| (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME))
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
