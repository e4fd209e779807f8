//! Connectivity generation
//!
//! Each rule selects presynaptic and postsynaptic cells by condition and
//! connects them by one of four patterns:
//!
//! | Pattern | Declared as | Behaviour |
//! |---------|-------------|-----------|
//! | Full | nothing | every matching pair |
//! | Probability | `probability` | independent draw per pair |
//! | Convergence | `convergence` | N distinct presynaptic cells per postsynaptic cell |
//! | Divergence | `divergence` | N distinct postsynaptic cells per presynaptic cell |
//!
//! Every candidate pair draws from its own stream keyed by rule label and
//! both cell identifiers, so results do not depend on thread count or
//! iteration order. Output within a rule is sorted by (pre, post).

use crate::conditions::Condition;
use crate::params::{ConnParams, SynMechParams};
use crate::population::{Cell, CellView, Population};
use crate::variables::{compile_param, eval_param, CellScope, CellSymbols, Globals, PairScope, PairSymbols, Side};
use netspec_core::{CellId, Millisecond, NetSpecError, ReferenceKind, Result, StreamKey};
use netspec_expr::{Compiled, ExprArena, ParamValue};
use rand::seq::index;
use rand::Rng;
use rand_chacha::ChaCha12Rng;
use rayon::prelude::*;
use serde::Serialize;

// =============================================================================
// SYNAPTIC MECHANISMS
// =============================================================================

/// A validated synaptic mechanism
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynMech {
    pub label: String,
    #[serde(flatten)]
    pub params: SynMechParams,
}

impl SynMech {
    pub fn compile(label: &str, params: &SynMechParams) -> Result<Self> {
        let taus = match params {
            SynMechParams::Exp2Syn { tau1, tau2, .. } => vec![("tau1", *tau1), ("tau2", *tau2)],
            SynMechParams::ExpSyn { tau, .. } => vec![("tau", *tau)],
        };
        for (name, tau) in taus {
            if !(tau > 0.0) {
                return Err(NetSpecError::InvalidDeclaration {
                    label: label.to_string(),
                    detail: format!("{name} must be positive, got {tau}"),
                });
            }
        }
        Ok(Self {
            label: label.to_string(),
            params: params.clone(),
        })
    }
}

/// Index of the requested mechanism, or of the first declared one
pub fn resolve_syn_mech(syn_mechs: &[SynMech], requested: Option<&str>, owner: &str) -> Result<usize> {
    let unresolved = |label: &str| NetSpecError::UnresolvedReference {
        kind: ReferenceKind::SynMech,
        label: label.to_string(),
        context: owner.to_string(),
    };
    match requested {
        Some(label) => syn_mechs
            .iter()
            .position(|m| m.label == label)
            .ok_or_else(|| unresolved(label)),
        None if syn_mechs.is_empty() => Err(unresolved("<default>")),
        None => Ok(0),
    }
}

// =============================================================================
// RULES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pattern {
    Full,
    Probability(Compiled),
    Convergence(Compiled),
    Divergence(Compiled),
}

impl Pattern {
    pub fn name(&self) -> &'static str {
        match self {
            Pattern::Full => "full",
            Pattern::Probability(_) => "probability",
            Pattern::Convergence(_) => "convergence",
            Pattern::Divergence(_) => "divergence",
        }
    }
}

/// A compiled connectivity rule
#[derive(Debug, Clone)]
pub struct ConnRule {
    pub label: String,
    pub pre: Condition,
    pub post: Condition,
    pub pattern: Pattern,
    pub weight: Compiled,
    pub delay: Compiled,
    pub syn_mech: usize,
    pub sec: String,
    pub loc: f64,
    pub allow_self: bool,
}

impl ConnRule {
    pub fn compile(
        label: &str,
        params: &ConnParams,
        arena: &mut ExprArena,
        globals: &Globals,
        syn_mechs: &[SynMech],
    ) -> Result<Self> {
        let pair = PairSymbols { globals };

        let pattern = match (&params.probability, &params.convergence, &params.divergence) {
            (None, None, None) => Pattern::Full,
            (Some(p), None, None) => {
                let p = compile_param(arena, label, p, &pair)?;
                if let Compiled::Const(value) = p {
                    if !(0.0..=1.0).contains(&value) {
                        return Err(NetSpecError::InvalidProbability {
                            label: label.to_string(),
                            value,
                            pair: None,
                        });
                    }
                }
                Pattern::Probability(p)
            }
            (None, Some(n), None) => Pattern::Convergence(compile_count(arena, label, n, Side::Post, globals)?),
            (None, None, Some(n)) => Pattern::Divergence(compile_count(arena, label, n, Side::Pre, globals)?),
            _ => {
                return Err(NetSpecError::InvalidDeclaration {
                    label: label.to_string(),
                    detail: "at most one of probability, convergence and divergence may be given".into(),
                })
            }
        };

        let weight = match &params.weight {
            Some(w) => compile_param(arena, label, w, &pair)?,
            None => Compiled::Const(globals.default_weight()),
        };
        let delay = match &params.delay {
            Some(d) => compile_param(arena, label, d, &pair)?,
            None => Compiled::Const(globals.default_delay()),
        };

        if !(0.0..=1.0).contains(&params.loc) {
            return Err(NetSpecError::InvalidRange {
                label: label.to_string(),
                detail: format!("loc {} lies outside [0, 1]", params.loc),
            });
        }

        Ok(Self {
            label: label.to_string(),
            pre: Condition::compile(label, &params.pre_conds)?,
            post: Condition::compile(label, &params.post_conds)?,
            pattern,
            weight,
            delay,
            syn_mech: resolve_syn_mech(syn_mechs, params.syn_mech.as_deref(), label)?,
            sec: params.sec.clone(),
            loc: params.loc,
            allow_self: params.allow_self_conns,
        })
    }

    /// Generate this rule's connections, sorted by (pre, post)
    ///
    /// `index` is the rule's declaration index, recorded on each connection.
    pub fn generate(&self, index: usize, ctx: &ConnContext<'_>) -> Result<Vec<Connection>> {
        if let Pattern::Probability(Compiled::Const(p)) = self.pattern {
            if p == 0.0 {
                return Ok(Vec::new());
            }
        }

        let pres = ctx.matching(&self.pre);
        let posts = ctx.matching(&self.post);
        if pres.is_empty() || posts.is_empty() {
            return Ok(Vec::new());
        }

        let key = ctx.key.child(&self.label);
        let chunks: Vec<Result<Vec<Connection>>> = match self.pattern {
            Pattern::Full => pres
                .par_iter()
                .map(|&pre| self.fan_out(index, pre, &posts, None, ctx, key))
                .collect(),
            Pattern::Probability(p) => pres
                .par_iter()
                .map(|&pre| self.fan_out(index, pre, &posts, Some(p), ctx, key))
                .collect(),
            Pattern::Convergence(n) => posts
                .par_iter()
                .map(|&post| self.converge(index, post, &pres, n, ctx, key))
                .collect(),
            Pattern::Divergence(n) => pres
                .par_iter()
                .map(|&pre| self.diverge(index, pre, &posts, n, ctx, key))
                .collect(),
        };

        // First error in iteration order, independent of scheduling
        let mut connections: Vec<Connection> = chunks
            .into_iter()
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        connections.sort_unstable_by_key(|c| (c.pre, c.post));
        Ok(connections)
    }

    /// Resolved connection probability for one pair, if the rule is probabilistic
    pub fn probability(&self, pre: &Cell, post: &Cell, ctx: &ConnContext<'_>) -> Result<Option<f64>> {
        let Pattern::Probability(p) = self.pattern else {
            return Ok(None);
        };
        let scope = PairScope {
            pre,
            post,
            globals: ctx.globals,
        };
        let mut rng = ctx.key.child(&self.label).rng(&[pre.gid as u64, post.gid as u64]);
        let symbols = PairSymbols { globals: ctx.globals };
        eval_param(ctx.arena, &self.label, p, &scope, &symbols, &mut rng).map(Some)
    }

    fn fan_out(
        &self,
        index: usize,
        pre: &Cell,
        posts: &[&Cell],
        probability: Option<Compiled>,
        ctx: &ConnContext<'_>,
        key: StreamKey,
    ) -> Result<Vec<Connection>> {
        let mut out = Vec::new();
        for &post in posts {
            if !self.allow_self && pre.gid == post.gid {
                continue;
            }
            let scope = PairScope {
                pre,
                post,
                globals: ctx.globals,
            };
            let mut rng = key.rng(&[pre.gid as u64, post.gid as u64]);
            if let Some(p) = probability {
                if !self.accept(p, &scope, ctx, &mut rng)? {
                    continue;
                }
            }
            out.push(self.connection(index, &scope, ctx, &mut rng)?);
        }
        Ok(out)
    }

    fn accept(&self, probability: Compiled, scope: &PairScope<'_>, ctx: &ConnContext<'_>, rng: &mut ChaCha12Rng) -> Result<bool> {
        let symbols = PairSymbols { globals: ctx.globals };
        let p = eval_param(ctx.arena, &self.label, probability, scope, &symbols, rng)?;
        if !(0.0..=1.0).contains(&p) {
            return Err(NetSpecError::InvalidProbability {
                label: self.label.clone(),
                value: p,
                pair: Some((scope.pre.gid, scope.post.gid)),
            });
        }
        if p == 0.0 {
            return Ok(false);
        }
        Ok(p >= 1.0 || rng.gen::<f64>() < p)
    }

    fn converge(
        &self,
        index: usize,
        post: &Cell,
        pres: &[&Cell],
        count: Compiled,
        ctx: &ConnContext<'_>,
        key: StreamKey,
    ) -> Result<Vec<Connection>> {
        let candidates: Vec<&Cell> = pres
            .iter()
            .copied()
            .filter(|pre| self.allow_self || pre.gid != post.gid)
            .collect();
        let chosen = self.choose(count, post, Side::Post, candidates.len(), ctx, key)?;
        chosen
            .into_iter()
            .map(|i| self.pair_connection(index, candidates[i], post, ctx, key))
            .collect()
    }

    fn diverge(
        &self,
        index: usize,
        pre: &Cell,
        posts: &[&Cell],
        count: Compiled,
        ctx: &ConnContext<'_>,
        key: StreamKey,
    ) -> Result<Vec<Connection>> {
        let candidates: Vec<&Cell> = posts
            .iter()
            .copied()
            .filter(|post| self.allow_self || post.gid != pre.gid)
            .collect();
        let chosen = self.choose(count, pre, Side::Pre, candidates.len(), ctx, key)?;
        chosen
            .into_iter()
            .map(|i| self.pair_connection(index, pre, candidates[i], ctx, key))
            .collect()
    }

    /// Pick up to N distinct candidate indices for an anchor cell
    fn choose(
        &self,
        count: Compiled,
        anchor: &Cell,
        side: Side,
        available: usize,
        ctx: &ConnContext<'_>,
        key: StreamKey,
    ) -> Result<Vec<usize>> {
        let symbols = CellSymbols {
            side,
            globals: ctx.globals,
        };
        let scope = CellScope {
            cell: anchor,
            globals: ctx.globals,
        };
        let mut rng = key.child(self.pattern.name()).rng(&[anchor.gid as u64]);
        let n = eval_param(ctx.arena, &self.label, count, &scope, &symbols, &mut rng)?;
        if n < 0.0 {
            return Err(NetSpecError::InvalidDeclaration {
                label: self.label.clone(),
                detail: format!("{} evaluated to {} for cell {}", self.pattern.name(), n, anchor.gid),
            });
        }

        let n = (n.round() as usize).min(available);
        let mut picked = index::sample(&mut rng, available, n).into_vec();
        picked.sort_unstable();
        Ok(picked)
    }

    fn pair_connection(&self, index: usize, pre: &Cell, post: &Cell, ctx: &ConnContext<'_>, key: StreamKey) -> Result<Connection> {
        let scope = PairScope {
            pre,
            post,
            globals: ctx.globals,
        };
        let mut rng = key.rng(&[pre.gid as u64, post.gid as u64]);
        self.connection(index, &scope, ctx, &mut rng)
    }

    fn connection(&self, index: usize, scope: &PairScope<'_>, ctx: &ConnContext<'_>, rng: &mut ChaCha12Rng) -> Result<Connection> {
        let symbols = PairSymbols { globals: ctx.globals };
        let weight = eval_param(ctx.arena, &self.label, self.weight, scope, &symbols, rng)?;
        let delay = eval_param(ctx.arena, &self.label, self.delay, scope, &symbols, rng)?;
        Ok(Connection {
            pre: scope.pre.gid,
            post: scope.post.gid,
            weight,
            delay,
            syn_mech: self.syn_mech,
            rule: index,
        })
    }
}

fn compile_count(arena: &mut ExprArena, label: &str, value: &ParamValue, side: Side, globals: &Globals) -> Result<Compiled> {
    let count = compile_param(arena, label, value, &CellSymbols { side, globals })?;
    if let Compiled::Const(n) = count {
        if !(n >= 0.0) {
            return Err(NetSpecError::InvalidDeclaration {
                label: label.to_string(),
                detail: format!("connection count {n} must be non-negative"),
            });
        }
    }
    Ok(count)
}

// =============================================================================
// GENERATION
// =============================================================================

/// Everything a rule reads while generating
#[derive(Debug, Clone, Copy)]
pub struct ConnContext<'a> {
    pub populations: &'a [Population],
    pub cells: &'a [Cell],
    pub arena: &'a ExprArena,
    pub globals: &'a Globals,
    pub key: StreamKey,
}

impl<'a> ConnContext<'a> {
    fn matching(&self, condition: &Condition) -> Vec<&'a Cell> {
        let populations = self.populations;
        self.cells
            .iter()
            .filter(|cell| condition.matches(&CellView::new(cell, populations)))
            .collect()
    }
}

/// A directed synaptic connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub pre: CellId,
    pub post: CellId,
    pub weight: f64,
    pub delay: Millisecond,
    /// Index into the network's synaptic mechanisms
    pub syn_mech: usize,
    /// Index of the generating rule
    pub rule: usize,
}
