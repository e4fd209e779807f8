//! Declarative network parameters
//!
//! Everything here mirrors the JSON model file one to one. Nothing is
//! validated at this level beyond shape; [`crate::Network::initialize`]
//! turns these declarations into checked, compiled structures.

use crate::cell_rules::SectionTemplate;
use crate::conditions::Conds;
use netspec_core::{Hertz, Micrometer, Millisecond, NetSpecError, ReferenceKind, Result, SimConfig};
use netspec_expr::ParamValue;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

// =============================================================================
// LABELLED DECLARATIONS
// =============================================================================

/// Label-keyed declarations kept in declaration order
///
/// Labels are unique; a duplicate label in a model file is rejected while
/// parsing. Insertion through [`Declarations::insert`] replaces an existing
/// entry in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Declarations<T> {
    entries: Vec<(String, T)>,
}

impl<T> Default for Declarations<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> Declarations<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>, value: T) {
        let label = label.into();
        match self.position(&label) {
            Some(index) => self.entries[index].1 = value,
            None => self.entries.push((label, value)),
        }
    }

    pub fn get(&self, label: &str) -> Option<&T> {
        self.position(label).map(|index| &self.entries[index].1)
    }

    pub fn get_mut(&mut self, label: &str) -> Option<&mut T> {
        self.position(label).map(move |index| &mut self.entries[index].1)
    }

    /// Declaration index of a label
    pub fn position(&self, label: &str) -> Option<usize> {
        self.entries.iter().position(|(l, _)| l == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(label, value)| (label.as_str(), value))
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(label, _)| label.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Serialize> Serialize for Declarations<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (label, value) in &self.entries {
            map.serialize_entry(label, value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Declarations<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DeclarationVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for DeclarationVisitor<T> {
            type Value = Declarations<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of labelled declarations")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut declarations = Declarations::new();
                while let Some((label, value)) = map.next_entry::<String, T>()? {
                    if declarations.position(&label).is_some() {
                        return Err(de::Error::custom(format!("duplicate label '{label}'")));
                    }
                    declarations.entries.push((label, value));
                }
                Ok(declarations)
            }
        }

        deserializer.deserialize_map(DeclarationVisitor(PhantomData))
    }
}

// =============================================================================
// NETWORK PARAMETERS
// =============================================================================

/// Complete declarative network description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct NetParams {
    /// Network extent along x (um)
    pub size_x: Micrometer,
    /// Network extent along y, the cortical depth axis (um)
    pub size_y: Micrometer,
    pub size_z: Micrometer,
    /// Axonal propagation velocity (um/ms)
    pub prop_velocity: f64,
    /// Length constant for distance-dependent probabilities (um)
    pub prob_length_const: Micrometer,
    pub default_weight: f64,
    pub default_delay: Millisecond,
    /// User constants visible to every formula
    pub globals: BTreeMap<String, f64>,

    pub pop_params: Declarations<PopParams>,
    pub cell_params: Declarations<CellParams>,
    pub syn_mech_params: Declarations<SynMechParams>,
    pub stim_source_params: Declarations<StimSourceParams>,
    pub stim_target_params: Declarations<StimTargetParams>,
    pub conn_params: Declarations<ConnParams>,
}

impl Default for NetParams {
    fn default() -> Self {
        Self {
            size_x: 100.0,
            size_y: 100.0,
            size_z: 100.0,
            prop_velocity: 500.0,
            prob_length_const: 500.0,
            default_weight: 1.0,
            default_delay: 1.0,
            globals: BTreeMap::new(),
            pop_params: Declarations::new(),
            cell_params: Declarations::new(),
            syn_mech_params: Declarations::new(),
            stim_source_params: Declarations::new(),
            stim_target_params: Declarations::new(),
            conn_params: Declarations::new(),
        }
    }
}

impl NetParams {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Declare a cell rule whose template is imported from a saved file
    ///
    /// The rule starts without conditions; attach them with
    /// [`NetParams::set_cell_rule_conds`].
    pub fn load_cell_params_rule(&mut self, label: &str, file_name: impl Into<PathBuf>) {
        self.cell_params.insert(
            label,
            CellParams {
                import: Some(ImportSpec {
                    file_name: file_name.into(),
                    cell_name: None,
                    cell_instance: false,
                }),
                ..CellParams::default()
            },
        );
    }

    pub fn set_cell_rule_conds(&mut self, label: &str, conds: Conds) -> Result<()> {
        let rule = self
            .cell_params
            .get_mut(label)
            .ok_or_else(|| NetSpecError::UnresolvedReference {
                kind: ReferenceKind::CellRule,
                label: label.to_string(),
                context: "cellParams".into(),
            })?;
        rule.conds = conds;
        Ok(())
    }
}

fn default_sec() -> String {
    "soma".into()
}

fn default_loc() -> f64 {
    0.5
}

/// Population declaration
///
/// Placement along x and z defaults to the full extent. Depth (y) must be
/// given explicitly, either in um or normalized to `sizeY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PopParams {
    pub cell_type: String,
    #[serde(default)]
    pub cell_model: String,
    pub num_cells: usize,
    pub x_range: Option<[f64; 2]>,
    pub xnorm_range: Option<[f64; 2]>,
    pub y_range: Option<[f64; 2]>,
    pub ynorm_range: Option<[f64; 2]>,
    pub z_range: Option<[f64; 2]>,
    pub znorm_range: Option<[f64; 2]>,
}

/// Cell property rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CellParams {
    #[serde(default)]
    pub conds: Conds,
    #[serde(default)]
    pub secs: BTreeMap<String, SectionTemplate>,
    #[serde(default)]
    pub globals: BTreeMap<String, f64>,
    #[serde(default)]
    pub import: Option<ImportSpec>,
}

/// Reference to a cell template saved outside the model file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImportSpec {
    pub file_name: PathBuf,
    #[serde(default)]
    pub cell_name: Option<String>,
    /// Template is a class to instantiate rather than a single cell
    #[serde(default)]
    pub cell_instance: bool,
}

/// Synaptic mechanism kinetics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mod")]
pub enum SynMechParams {
    /// Double exponential conductance
    Exp2Syn {
        tau1: Millisecond,
        tau2: Millisecond,
        /// Reversal potential (mV)
        e: f64,
    },
    /// Single exponential conductance
    ExpSyn { tau: Millisecond, e: f64 },
}

impl SynMechParams {
    pub fn model(&self) -> &'static str {
        match self {
            SynMechParams::Exp2Syn { .. } => "Exp2Syn",
            SynMechParams::ExpSyn { .. } => "ExpSyn",
        }
    }
}

/// Stimulus source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StimSourceParams {
    /// Poisson-like spike generator
    NetStim {
        rate: Hertz,
        /// Fraction of randomness in inter-spike intervals
        #[serde(default)]
        noise: f64,
        #[serde(default)]
        start: Millisecond,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        number: Option<f64>,
    },
    /// Current clamp
    IClamp {
        del: Millisecond,
        dur: Millisecond,
        /// Amplitude (nA)
        amp: f64,
    },
    /// Alpha-function conductance
    AlphaSynapse {
        onset: Millisecond,
        tau: Millisecond,
        /// Peak conductance (uS)
        gmax: f64,
        e: f64,
    },
}

/// Stimulus target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StimTargetParams {
    pub source: String,
    #[serde(default)]
    pub conds: Conds,
    #[serde(default)]
    pub weight: Option<ParamValue>,
    #[serde(default)]
    pub delay: Option<ParamValue>,
    #[serde(default)]
    pub syn_mech: Option<String>,
    #[serde(default = "default_sec")]
    pub sec: String,
    #[serde(default = "default_loc")]
    pub loc: f64,
}

/// Connectivity rule
///
/// At most one of `probability`, `convergence` and `divergence` may be
/// given. With none, every matching pair is connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnParams {
    #[serde(default)]
    pub pre_conds: Conds,
    #[serde(default)]
    pub post_conds: Conds,
    #[serde(default)]
    pub probability: Option<ParamValue>,
    #[serde(default)]
    pub convergence: Option<ParamValue>,
    #[serde(default)]
    pub divergence: Option<ParamValue>,
    #[serde(default)]
    pub weight: Option<ParamValue>,
    #[serde(default)]
    pub delay: Option<ParamValue>,
    #[serde(default)]
    pub syn_mech: Option<String>,
    #[serde(default = "default_sec")]
    pub sec: String,
    #[serde(default = "default_loc")]
    pub loc: f64,
    #[serde(default)]
    pub allow_self_conns: bool,
}

impl Default for ConnParams {
    fn default() -> Self {
        Self {
            pre_conds: Conds::new(),
            post_conds: Conds::new(),
            probability: None,
            convergence: None,
            divergence: None,
            weight: None,
            delay: None,
            syn_mech: None,
            sec: default_sec(),
            loc: default_loc(),
            allow_self_conns: false,
        }
    }
}

// =============================================================================
// MODEL FILE
// =============================================================================

/// A model file: network declarations plus simulation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModelFile {
    pub net_params: NetParams,
    #[serde(default)]
    pub sim_config: SimConfig,
}

impl ModelFile {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
