//! Formula variables
//!
//! Two binding modes exist. Pair formulas (connection probability, weight,
//! delay) see both endpoints and their distances. Cell formulas
//! (convergence, divergence, stimulus weight and delay) see a single cell
//! under a `pre_` or `post_` prefix. Both see the network globals.
//!
//! ## Pair variables
//!
//! | Name | Meaning |
//! |------|---------|
//! | `pre_x` .. `pre_znorm` | Presynaptic position and normalized position |
//! | `post_x` .. `post_znorm` | Postsynaptic position and normalized position |
//! | `dist_x`, `dist_y`, `dist_z` | Absolute per-axis distance (um) |
//! | `dist_3D` | Euclidean distance (um) |
//! | `dist_2D` | Distance in the x-z plane (um) |
//! | `dist_xnorm` .. `dist_znorm` | Absolute per-axis normalized distance |
//! | `dist_norm3D`, `dist_norm2D` | Normalized Euclidean distances |

use crate::params::NetParams;
use crate::population::Cell;
use netspec_core::{NetSpecError, Result};
use netspec_expr::{Compiled, ExprArena, ParamValue, Scope, Slot, SymbolTable};
use rand::Rng;

const FIELDS: [&str; 6] = ["x", "y", "z", "xnorm", "ynorm", "znorm"];

const DISTANCES: [&str; 10] = [
    "dist_x",
    "dist_y",
    "dist_z",
    "dist_3D",
    "dist_2D",
    "dist_xnorm",
    "dist_ynorm",
    "dist_znorm",
    "dist_norm3D",
    "dist_norm2D",
];

const PRE_BASE: u16 = 0;
const POST_BASE: u16 = 6;
const DIST_BASE: u16 = 12;
/// First slot of the globals block
pub const GLOBAL_BASE: u16 = 32;

const BUILTIN_GLOBALS: [&str; 7] = [
    "sizeX",
    "sizeY",
    "sizeZ",
    "propVelocity",
    "probLengthConst",
    "defaultWeight",
    "defaultDelay",
];

// =============================================================================
// GLOBALS
// =============================================================================

/// Named constants visible to every formula
#[derive(Debug, Clone, PartialEq)]
pub struct Globals {
    names: Vec<String>,
    values: Vec<f64>,
}

impl Globals {
    /// Built-in network globals followed by user globals
    pub fn from_params(params: &NetParams) -> Result<Self> {
        let builtin = [
            params.size_x,
            params.size_y,
            params.size_z,
            params.prop_velocity,
            params.prob_length_const,
            params.default_weight,
            params.default_delay,
        ];
        let mut globals = Self {
            names: BUILTIN_GLOBALS.iter().map(|s| s.to_string()).collect(),
            values: builtin.to_vec(),
        };

        for (name, &value) in &params.globals {
            if globals.get(name).is_some() || is_reserved(name) {
                return Err(NetSpecError::InvalidDeclaration {
                    label: name.clone(),
                    detail: "global name collides with a built-in name".into(),
                });
            }
            if !value.is_finite() {
                return Err(NetSpecError::InvalidDeclaration {
                    label: name.clone(),
                    detail: format!("global value {value} is not finite"),
                });
            }
            globals.names.push(name.clone());
            globals.values.push(value);
        }
        Ok(globals)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.position(name).map(|i| self.values[i])
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn default_weight(&self) -> f64 {
        self.values[5]
    }

    pub fn default_delay(&self) -> f64 {
        self.values[6]
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    fn resolve(&self, name: &str) -> Option<Slot> {
        self.position(name).map(|i| Slot(GLOBAL_BASE + i as u16))
    }

    fn name_of(&self, slot: Slot) -> Option<String> {
        let index = slot.0.checked_sub(GLOBAL_BASE)? as usize;
        self.names.get(index).cloned()
    }

    fn value_at(&self, slot: Slot) -> f64 {
        slot.0
            .checked_sub(GLOBAL_BASE)
            .and_then(|i| self.values.get(i as usize))
            .copied()
            .unwrap_or(f64::NAN)
    }
}

fn is_reserved(name: &str) -> bool {
    name == "pi"
        || DISTANCES.contains(&name)
        || ["pre_", "post_"]
            .iter()
            .any(|prefix| name.strip_prefix(*prefix).map_or(false, |f| FIELDS.contains(&f)))
}

// =============================================================================
// SYMBOL TABLES
// =============================================================================

/// Which endpoint a cell formula is written against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Pre,
    Post,
}

impl Side {
    fn prefix(self) -> &'static str {
        match self {
            Side::Pre => "pre_",
            Side::Post => "post_",
        }
    }
}

/// Names available to pair formulas
#[derive(Debug, Clone, Copy)]
pub struct PairSymbols<'a> {
    pub globals: &'a Globals,
}

impl SymbolTable for PairSymbols<'_> {
    fn resolve(&self, name: &str) -> Option<Slot> {
        let field = |rest: &str| FIELDS.iter().position(|f| *f == rest);
        if let Some(i) = name.strip_prefix("pre_").and_then(field) {
            return Some(Slot(PRE_BASE + i as u16));
        }
        if let Some(i) = name.strip_prefix("post_").and_then(field) {
            return Some(Slot(POST_BASE + i as u16));
        }
        if let Some(i) = DISTANCES.iter().position(|d| *d == name) {
            return Some(Slot(DIST_BASE + i as u16));
        }
        self.globals.resolve(name)
    }

    fn name_of(&self, slot: Slot) -> Option<String> {
        let index = slot.0 as usize;
        match slot.0 {
            s if s < POST_BASE => Some(format!("pre_{}", FIELDS[index])),
            s if s < DIST_BASE => Some(format!("post_{}", FIELDS[index - POST_BASE as usize])),
            s if s < DIST_BASE + DISTANCES.len() as u16 => Some(DISTANCES[index - DIST_BASE as usize].to_string()),
            _ => self.globals.name_of(slot),
        }
    }
}

/// Names available to single-cell formulas
#[derive(Debug, Clone, Copy)]
pub struct CellSymbols<'a> {
    pub side: Side,
    pub globals: &'a Globals,
}

impl SymbolTable for CellSymbols<'_> {
    fn resolve(&self, name: &str) -> Option<Slot> {
        let field = name
            .strip_prefix(self.side.prefix())
            .and_then(|rest| FIELDS.iter().position(|f| *f == rest));
        match field {
            Some(i) => Some(Slot(i as u16)),
            None => self.globals.resolve(name),
        }
    }

    fn name_of(&self, slot: Slot) -> Option<String> {
        match FIELDS.get(slot.0 as usize) {
            Some(field) => Some(format!("{}{}", self.side.prefix(), field)),
            None => self.globals.name_of(slot),
        }
    }
}

// =============================================================================
// SCOPES
// =============================================================================

/// Bindings for a candidate cell pair
#[derive(Debug, Clone, Copy)]
pub struct PairScope<'a> {
    pub pre: &'a Cell,
    pub post: &'a Cell,
    pub globals: &'a Globals,
}

impl Scope for PairScope<'_> {
    fn value(&self, slot: Slot) -> f64 {
        let s = slot.0;
        if s < POST_BASE {
            return self.pre.coordinate(s as usize);
        }
        if s < DIST_BASE {
            return self.post.coordinate((s - POST_BASE) as usize);
        }
        if s >= GLOBAL_BASE {
            return self.globals.value_at(slot);
        }

        let d = |i: usize| (self.pre.coordinate(i) - self.post.coordinate(i)).abs();
        match s - DIST_BASE {
            0 => d(0),
            1 => d(1),
            2 => d(2),
            3 => (d(0).powi(2) + d(1).powi(2) + d(2).powi(2)).sqrt(),
            4 => (d(0).powi(2) + d(2).powi(2)).sqrt(),
            5 => d(3),
            6 => d(4),
            7 => d(5),
            8 => (d(3).powi(2) + d(4).powi(2) + d(5).powi(2)).sqrt(),
            9 => (d(3).powi(2) + d(5).powi(2)).sqrt(),
            _ => f64::NAN,
        }
    }
}

/// Bindings for a single cell
#[derive(Debug, Clone, Copy)]
pub struct CellScope<'a> {
    pub cell: &'a Cell,
    pub globals: &'a Globals,
}

impl Scope for CellScope<'_> {
    fn value(&self, slot: Slot) -> f64 {
        if (slot.0 as usize) < FIELDS.len() {
            self.cell.coordinate(slot.0 as usize)
        } else {
            self.globals.value_at(slot)
        }
    }
}

// =============================================================================
// COMPILE AND EVALUATE WITH CONTEXT
// =============================================================================

/// Compile a declared value, labelling failures with the owning declaration
pub fn compile_param(
    arena: &mut ExprArena,
    owner: &str,
    value: &ParamValue,
    symbols: &dyn SymbolTable,
) -> Result<Compiled> {
    arena
        .compile_value(value, symbols)
        .map_err(|err| NetSpecError::MalformedExpression {
            label: owner.to_string(),
            expr: err.expr().to_string(),
            detail: err.to_string(),
            bindings: String::new(),
        })
}

/// Evaluate a compiled value, reporting the bound variables on failure
pub fn eval_param<S, R>(
    arena: &ExprArena,
    owner: &str,
    value: Compiled,
    scope: &S,
    symbols: &dyn SymbolTable,
    rng: &mut R,
) -> Result<f64>
where
    S: Scope,
    R: Rng + ?Sized,
{
    arena.evaluate(value, scope, rng).map_err(|err| {
        let bindings = match value {
            Compiled::Formula(id) => arena.describe_bindings(id, scope, symbols),
            Compiled::Const(_) => String::new(),
        };
        NetSpecError::MalformedExpression {
            label: owner.to_string(),
            expr: err.expr().to_string(),
            detail: err.to_string(),
            bindings,
        }
    })
}
