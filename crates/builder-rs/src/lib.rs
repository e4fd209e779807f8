//! # NetSpec Builder
//!
//! Instantiates networks of point or multi-compartment cells from
//! declarative parameters.
//!
//! A model declares populations (cell type, count, spatial box), cell
//! property rules, synaptic mechanisms, stimulation and connectivity rules.
//! The builder validates every declaration, compiles their formulas, then
//! generates cells, stimuli and connections reproducibly from per-stage
//! seeds.
//!
//! ## Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`params`] | Declarations as read from a model file |
//! | [`conditions`] | Tag constraints selecting cells |
//! | [`population`] | Population bounds and cell placement |
//! | [`cell_rules`] | Template import, merging and assignment |
//! | [`variables`] | Formula symbol tables and scopes |
//! | [`connectivity`] | Rule compilation and connection generation |
//! | [`stimulation`] | Stimulus sources and targets |
//! | [`network`] | Staged builder and the finished graph |
//!
//! ## Example
//!
//! ```no_run
//! use netspec_builder::{build, JsonTemplateImporter, ModelFile};
//!
//! let model = ModelFile::load("model.json")?;
//! let graph = build(&model.net_params, model.sim_config, &JsonTemplateImporter::new("."))?;
//! println!("{} connections", graph.connections().len());
//! # Ok::<(), netspec_core::NetSpecError>(())
//! ```

pub mod cell_rules;
pub mod conditions;
pub mod connectivity;
pub mod network;
pub mod params;
pub mod population;
pub mod stimulation;
pub mod variables;

pub use cell_rules::{CellTemplate, ImportedTemplate, JsonTemplateImporter, SectionTemplate, TemplateImporter};
pub use conditions::{CondValue, Conds, Condition, Scalar, Tag};
pub use connectivity::{Connection, SynMech};
pub use network::{Network, NetworkGraph, SiteInfo, Stage};
pub use params::{ConnParams, Declarations, ModelFile, NetParams, PopParams, StimSourceParams, StimTargetParams, SynMechParams};
pub use population::{Cell, Extents, Population};
pub use stimulation::{StimSource, Stimulus};

use netspec_core::{Result, SimConfig};

/// Run every stage and return the finished graph
pub fn build(params: &NetParams, cfg: SimConfig, importer: &dyn TemplateImporter) -> Result<NetworkGraph> {
    let mut net = Network::initialize(params, cfg, importer)?;
    net.create_pops()?;
    net.create_cells()?;
    net.add_stims()?;
    net.connect_cells()?;
    net.finish()
}
