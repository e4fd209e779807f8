//! Staged network builder
//!
//! ```text
//! initialize -> create_pops -> create_cells -> add_stims -> connect_cells -> finish
//! ```
//!
//! Every declaration is validated and compiled by [`Network::initialize`]
//! before anything is generated. Stages must run in order; any failure
//! leaves the builder unusable. [`Network::finish`] hands back an immutable
//! [`NetworkGraph`].

use crate::cell_rules::{CellRule, CellTemplate, TemplateImporter, TemplateResolver};
use crate::connectivity::{ConnContext, ConnRule, Connection, SynMech};
use crate::params::NetParams;
use crate::population::{create_populations, place_cells, Cell, CellView, Extents, Population, PopulationSpec};
use crate::stimulation::{StimSource, StimTarget, Stimulus};
use crate::variables::Globals;
use netspec_core::{CellId, Micrometer, NetSpecError, ReferenceKind, Result, SimConfig, StreamKey};
use netspec_expr::ExprArena;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

/// Build progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initialized,
    PopsCreated,
    CellsCreated,
    StimsAdded,
    Connected,
    /// A stage failed; the builder cannot continue
    Failed,
}

impl Stage {
    fn previous(self) -> Option<Stage> {
        match self {
            Stage::PopsCreated => Some(Stage::Initialized),
            Stage::CellsCreated => Some(Stage::PopsCreated),
            Stage::StimsAdded => Some(Stage::CellsCreated),
            Stage::Connected => Some(Stage::StimsAdded),
            Stage::Initialized | Stage::Failed => None,
        }
    }

    fn action(self) -> &'static str {
        match self {
            Stage::Initialized => "initialize",
            Stage::PopsCreated => "create populations",
            Stage::CellsCreated => "create cells",
            Stage::StimsAdded => "add stimuli",
            Stage::Connected => "connect cells",
            Stage::Failed => "fail",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Stage::Initialized => "initialized",
            Stage::PopsCreated => "populations created",
            Stage::CellsCreated => "cells created",
            Stage::StimsAdded => "stimuli added",
            Stage::Connected => "connected",
            Stage::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Compiled declarations
#[derive(Debug, Clone)]
struct CompiledSpec {
    extents: Extents,
    globals: Globals,
    arena: ExprArena,
    populations: Vec<PopulationSpec>,
    cell_rules: Vec<CellRule>,
    syn_mechs: Vec<SynMech>,
    stim_sources: Vec<StimSource>,
    stim_targets: Vec<StimTarget>,
    conn_rules: Vec<ConnRule>,
}

impl CompiledSpec {
    fn compile(params: &NetParams, importer: &dyn TemplateImporter) -> Result<Self> {
        let extents = Extents::new(params.size_x, params.size_y, params.size_z)?;
        let globals = Globals::from_params(params)?;
        let mut arena = ExprArena::new();

        let populations = params
            .pop_params
            .iter()
            .map(|(label, pop)| PopulationSpec::compile(label, pop, &extents))
            .collect::<Result<Vec<_>>>()?;
        let cell_rules = params
            .cell_params
            .iter()
            .map(|(label, rule)| CellRule::compile(label, rule, importer))
            .collect::<Result<Vec<_>>>()?;
        let syn_mechs = params
            .syn_mech_params
            .iter()
            .map(|(label, mech)| SynMech::compile(label, mech))
            .collect::<Result<Vec<_>>>()?;
        let stim_sources = params
            .stim_source_params
            .iter()
            .map(|(label, source)| StimSource::compile(label, source))
            .collect::<Result<Vec<_>>>()?;

        let mut stim_targets = Vec::with_capacity(params.stim_target_params.len());
        for (label, target) in params.stim_target_params.iter() {
            stim_targets.push(StimTarget::compile(label, target, &mut arena, &globals, &stim_sources, &syn_mechs)?);
        }
        let mut conn_rules = Vec::with_capacity(params.conn_params.len());
        for (label, conn) in params.conn_params.iter() {
            conn_rules.push(ConnRule::compile(label, conn, &mut arena, &globals, &syn_mechs)?);
        }

        debug!(target: "netspec", "Compiled {} formulas ({} nodes)", arena.len(), arena.node_count());

        Ok(Self {
            extents,
            globals,
            arena,
            populations,
            cell_rules,
            syn_mechs,
            stim_sources,
            stim_targets,
            conn_rules,
        })
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Staged network builder
#[derive(Debug)]
pub struct Network {
    spec: CompiledSpec,
    cfg: SimConfig,
    stage: Stage,
    populations: Vec<Population>,
    cells: Vec<Cell>,
    templates: Vec<CellTemplate>,
    stims: Vec<Stimulus>,
    connections: Vec<Connection>,
}

impl Network {
    /// Validate configuration and compile every declaration
    pub fn initialize(params: &NetParams, cfg: SimConfig, importer: &dyn TemplateImporter) -> Result<Self> {
        cfg.validate()?;
        info!(target: "netspec", "Initializing network ({} populations, {} connectivity rules)", params.pop_params.len(), params.conn_params.len());
        let spec = CompiledSpec::compile(params, importer)?;

        Ok(Self {
            spec,
            cfg,
            stage: Stage::Initialized,
            populations: Vec::new(),
            cells: Vec::new(),
            templates: Vec::new(),
            stims: Vec::new(),
            connections: Vec::new(),
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn sim_config(&self) -> &SimConfig {
        &self.cfg
    }

    pub fn create_pops(&mut self) -> Result<&[Population]> {
        self.advance(Stage::PopsCreated, |net| {
            net.populations = create_populations(&net.spec.populations);
            for pop in &net.populations {
                debug!(target: "netspec", "  Population {}: {} cells", pop.label, pop.len());
            }
            info!(target: "netspec", "Created {} populations", net.populations.len());
            Ok(())
        })?;
        Ok(&self.populations)
    }

    pub fn create_cells(&mut self) -> Result<&[Cell]> {
        self.advance(Stage::CellsCreated, |net| {
            let key = StreamKey::root(net.cfg.seeds.loc, "loc");
            let mut cells = place_cells(&net.populations, &net.spec.extents, key);

            let mut resolver = TemplateResolver::new(&net.spec.cell_rules);
            for cell in &mut cells {
                let template = resolver.resolve(&CellView::new(cell, &net.populations));
                if template.is_none() && !net.spec.cell_rules.is_empty() {
                    warn!(target: "netspec", "Cell {} ({}) matches no cell rule", cell.gid, net.populations[cell.pop].label);
                }
                cell.template = template;
            }
            net.templates = resolver.into_templates();
            net.cells = cells;

            info!(target: "netspec", "Created {} cells ({} distinct templates)", net.cells.len(), net.templates.len());
            Ok(())
        })?;
        Ok(&self.cells)
    }

    pub fn add_stims(&mut self) -> Result<&[Stimulus]> {
        self.advance(Stage::StimsAdded, |net| {
            let key = StreamKey::root(net.cfg.seeds.stim, "stim");
            let mut stims = Vec::new();
            for (index, target) in net.spec.stim_targets.iter().enumerate() {
                let attached = target.apply(index, &net.populations, &net.cells, &net.spec.arena, &net.spec.globals, key)?;
                debug!(target: "netspec", "  Stim target {}: {} cells", target.label, attached.len());
                stims.extend(attached);
            }
            net.stims = stims;
            info!(target: "netspec", "Added {} stimuli", net.stims.len());
            Ok(())
        })?;
        Ok(&self.stims)
    }

    pub fn connect_cells(&mut self) -> Result<&[Connection]> {
        self.advance(Stage::Connected, |net| {
            let connections = match net.cfg.threads {
                Some(threads) => {
                    let pool = rayon::ThreadPoolBuilder::new()
                        .num_threads(threads)
                        .build()
                        .map_err(|e| NetSpecError::Config(e.to_string()))?;
                    let net = &*net;
                    pool.install(|| net.generate_connections())?
                }
                None => net.generate_connections()?,
            };
            net.connections = connections;
            info!(target: "netspec", "Created {} connections", net.connections.len());
            Ok(())
        })?;
        Ok(&self.connections)
    }

    /// Resolved probability of a probabilistic rule for one cell pair
    ///
    /// Returns `None` for rules with another pattern. Requires created cells.
    pub fn pair_probability(&self, rule: &str, pre: CellId, post: CellId) -> Result<Option<f64>> {
        if !matches!(self.stage, Stage::CellsCreated | Stage::StimsAdded | Stage::Connected) {
            return Err(NetSpecError::Stage {
                requested: "resolve probabilities".into(),
                current: self.stage.to_string(),
            });
        }
        let conn = self
            .spec
            .conn_rules
            .iter()
            .find(|r| r.label == rule)
            .ok_or_else(|| NetSpecError::UnresolvedReference {
                kind: ReferenceKind::ConnRule,
                label: rule.to_string(),
                context: "pair probability".into(),
            })?;
        let cell = |gid: CellId| {
            self.cells
                .get(gid)
                .ok_or_else(|| NetSpecError::Config(format!("no cell {gid}")))
        };
        conn.probability(cell(pre)?, cell(post)?, &self.conn_context())
    }

    /// Hand back the finished graph
    pub fn finish(self) -> Result<NetworkGraph> {
        if self.stage != Stage::Connected {
            return Err(NetSpecError::Stage {
                requested: "finish".into(),
                current: self.stage.to_string(),
            });
        }

        let spec = self.spec;
        Ok(NetworkGraph {
            sim_config: self.cfg,
            extents: spec.extents,
            populations: self.populations,
            cells: self.cells,
            templates: self.templates,
            syn_mechs: spec.syn_mechs,
            stim_sources: spec.stim_sources,
            stim_targets: spec
                .stim_targets
                .iter()
                .map(|t| SiteInfo {
                    label: t.label.clone(),
                    sec: t.sec.clone(),
                    loc: t.loc,
                })
                .collect(),
            conn_rules: spec
                .conn_rules
                .iter()
                .map(|r| SiteInfo {
                    label: r.label.clone(),
                    sec: r.sec.clone(),
                    loc: r.loc,
                })
                .collect(),
            stims: self.stims,
            connections: self.connections,
        })
    }

    fn conn_context(&self) -> ConnContext<'_> {
        ConnContext {
            populations: &self.populations,
            cells: &self.cells,
            arena: &self.spec.arena,
            globals: &self.spec.globals,
            key: StreamKey::root(self.cfg.seeds.conn, "conn"),
        }
    }

    fn generate_connections(&self) -> Result<Vec<Connection>> {
        let ctx = self.conn_context();
        let mut connections = Vec::new();
        for (index, rule) in self.spec.conn_rules.iter().enumerate() {
            let generated = rule.generate(index, &ctx)?;
            if self.cfg.print_syns_after_rule {
                info!(target: "netspec", "  Rule {} ({}): {} connections", rule.label, rule.pattern.name(), generated.len());
            } else {
                debug!(target: "netspec", "  Rule {} ({}): {} connections", rule.label, rule.pattern.name(), generated.len());
            }
            connections.extend(generated);
        }
        Ok(connections)
    }

    fn advance<F>(&mut self, next: Stage, step: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if next.previous() != Some(self.stage) {
            return Err(NetSpecError::Stage {
                requested: next.action().into(),
                current: self.stage.to_string(),
            });
        }
        match step(self) {
            Ok(()) => {
                self.stage = next;
                Ok(())
            }
            Err(e) => {
                self.stage = Stage::Failed;
                Err(e)
            }
        }
    }
}

// =============================================================================
// GRAPH
// =============================================================================

/// Section and location of a rule's synapses or stimuli
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteInfo {
    pub label: String,
    pub sec: String,
    pub loc: f64,
}

/// An instantiated network
///
/// Cells, stimuli and connections are fixed once built; the graph only
/// hands out shared references.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkGraph {
    sim_config: SimConfig,
    extents: Extents,
    populations: Vec<Population>,
    cells: Vec<Cell>,
    templates: Vec<CellTemplate>,
    syn_mechs: Vec<SynMech>,
    stim_sources: Vec<StimSource>,
    stim_targets: Vec<SiteInfo>,
    conn_rules: Vec<SiteInfo>,
    stims: Vec<Stimulus>,
    connections: Vec<Connection>,
}

impl NetworkGraph {
    pub fn sim_config(&self) -> &SimConfig {
        &self.sim_config
    }

    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    pub fn populations(&self) -> &[Population] {
        &self.populations
    }

    pub fn population(&self, label: &str) -> Option<&Population> {
        self.populations.iter().find(|p| p.label == label)
    }

    /// First declared population whose depth range contains `depth`
    pub fn population_at_depth(&self, depth: Micrometer) -> Option<&Population> {
        self.populations.iter().find(|p| p.spans_depth(depth))
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell(&self, gid: CellId) -> Option<&Cell> {
        self.cells.get(gid)
    }

    /// Population owning a cell
    pub fn population_of(&self, cell: &Cell) -> &Population {
        &self.populations[cell.pop]
    }

    pub fn template_of(&self, cell: &Cell) -> Option<&CellTemplate> {
        cell.template.map(|i| &self.templates[i])
    }

    pub fn templates(&self) -> &[CellTemplate] {
        &self.templates
    }

    pub fn syn_mechs(&self) -> &[SynMech] {
        &self.syn_mechs
    }

    pub fn stim_sources(&self) -> &[StimSource] {
        &self.stim_sources
    }

    pub fn stim_targets(&self) -> &[SiteInfo] {
        &self.stim_targets
    }

    pub fn conn_rules(&self) -> &[SiteInfo] {
        &self.conn_rules
    }

    pub fn stims(&self) -> &[Stimulus] {
        &self.stims
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Connections produced by the rule with this label
    pub fn connections_for_rule<'a>(&'a self, label: &str) -> impl Iterator<Item = &'a Connection> + 'a {
        let rule = self.conn_rules.iter().position(|r| r.label == label);
        self.connections.iter().filter(move |c| Some(c.rule) == rule)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
