//! Cell property rules and templates
//!
//! Rules attach biophysical templates to cells by condition. A cell matching
//! several rules receives their templates merged in declaration order, later
//! rules overriding earlier ones per section and per global. Cells that share
//! the same set of matching rules share one merged template.

use crate::conditions::{Condition, Conds, Tagged};
use crate::params::{CellParams, ImportSpec};
use netspec_core::{NetSpecError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// TEMPLATES
// =============================================================================

/// Placement of a section on its parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    pub parent_sec: String,
    pub parent_x: f64,
    pub child_x: f64,
}

/// One morphological section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionTemplate {
    /// Geometry (diam, L, Ra, cm, nseg)
    pub geom: BTreeMap<String, f64>,
    /// Mechanism name to parameter values
    pub mechs: BTreeMap<String, BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topol: Option<Topology>,
}

/// Biophysical cell template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellTemplate {
    #[serde(default)]
    pub secs: BTreeMap<String, SectionTemplate>,
    #[serde(default)]
    pub globals: BTreeMap<String, f64>,
    /// File an opaque template was imported from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl CellTemplate {
    /// Overlay `other` onto `self`
    pub fn merge(&mut self, other: &CellTemplate) {
        for (name, sec) in &other.secs {
            self.secs.insert(name.clone(), sec.clone());
        }
        for (name, value) in &other.globals {
            self.globals.insert(name.clone(), *value);
        }
        if other.source.is_some() {
            self.source = other.source.clone();
        }
    }
}

// =============================================================================
// IMPORT
// =============================================================================

/// Result of importing a template file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportedTemplate {
    pub template: CellTemplate,
    /// Conditions saved alongside the template, if any
    pub conds: Option<Conds>,
}

/// Resolves `import` entries of cell rules
pub trait TemplateImporter {
    fn import(&self, spec: &ImportSpec) -> Result<ImportedTemplate>;
}

/// Saved cell rule layout
#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default)]
    conds: Option<Conds>,
    #[serde(default)]
    secs: BTreeMap<String, SectionTemplate>,
    #[serde(default)]
    globals: BTreeMap<String, f64>,
}

/// Reads saved JSON cell rules relative to a base directory
///
/// Only scalar templates are read: every geometry entry and mechanism
/// parameter must be a single number. A file carrying lists (3D points,
/// per-segment values) fails with an import error; keep such cells in their
/// native format so they load as opaque templates. Files in any other format
/// are kept as opaque templates that only record where they came from.
#[derive(Debug, Clone)]
pub struct JsonTemplateImporter {
    base_dir: PathBuf,
}

impl JsonTemplateImporter {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

impl Default for JsonTemplateImporter {
    fn default() -> Self {
        Self::new(".")
    }
}

impl TemplateImporter for JsonTemplateImporter {
    fn import(&self, spec: &ImportSpec) -> Result<ImportedTemplate> {
        let path = self.base_dir.join(&spec.file_name);
        let is_json = path.extension().map_or(false, |ext| ext == "json");

        if !is_json {
            debug!(target: "netspec", "Opaque template {}", path.display());
            return Ok(ImportedTemplate {
                template: CellTemplate {
                    source: Some(path),
                    ..CellTemplate::default()
                },
                conds: None,
            });
        }

        let import_error = |detail: String| NetSpecError::Import {
            file: path.display().to_string(),
            detail,
        };
        let text = std::fs::read_to_string(&path).map_err(|e| import_error(e.to_string()))?;
        let file: TemplateFile = serde_json::from_str(&text).map_err(|e| import_error(e.to_string()))?;

        Ok(ImportedTemplate {
            template: CellTemplate {
                secs: file.secs,
                globals: file.globals,
                source: Some(path),
            },
            conds: file.conds,
        })
    }
}

// =============================================================================
// RULES
// =============================================================================

/// A compiled cell rule
#[derive(Debug, Clone)]
pub struct CellRule {
    pub label: String,
    pub condition: Condition,
    pub template: CellTemplate,
}

impl CellRule {
    /// Compile a declared rule, importing its template if needed
    ///
    /// Inline sections and globals are overlaid on the imported template.
    /// Declared conditions win over conditions saved in the imported file.
    pub fn compile(label: &str, params: &CellParams, importer: &dyn TemplateImporter) -> Result<Self> {
        let (mut template, saved_conds) = match &params.import {
            Some(spec) => {
                let imported = importer.import(spec)?;
                (imported.template, imported.conds)
            }
            None => (CellTemplate::default(), None),
        };

        template.merge(&CellTemplate {
            secs: params.secs.clone(),
            globals: params.globals.clone(),
            source: None,
        });

        let conds = match saved_conds {
            Some(saved) if params.conds.is_empty() => saved,
            _ => params.conds.clone(),
        };

        Ok(Self {
            label: label.to_string(),
            condition: Condition::compile(label, &conds)?,
            template,
        })
    }
}

/// Assigns merged templates to cells, sharing identical rule combinations
#[derive(Debug)]
pub struct TemplateResolver<'a> {
    rules: &'a [CellRule],
    cache: HashMap<Vec<usize>, usize>,
    templates: Vec<CellTemplate>,
}

impl<'a> TemplateResolver<'a> {
    pub fn new(rules: &'a [CellRule]) -> Self {
        Self {
            rules,
            cache: HashMap::new(),
            templates: Vec::new(),
        }
    }

    /// Template index for an entity, or `None` when no rule matches
    pub fn resolve<T: Tagged + ?Sized>(&mut self, entity: &T) -> Option<usize> {
        let matched: Vec<usize> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.condition.matches(entity))
            .map(|(index, _)| index)
            .collect();
        if matched.is_empty() {
            return None;
        }

        if let Some(&index) = self.cache.get(&matched) {
            return Some(index);
        }

        let mut merged = CellTemplate::default();
        for &rule in &matched {
            merged.merge(&self.rules[rule].template);
        }
        let index = self.templates.len();
        self.templates.push(merged);
        self.cache.insert(matched, index);
        Some(index)
    }

    pub fn into_templates(self) -> Vec<CellTemplate> {
        self.templates
    }
}
