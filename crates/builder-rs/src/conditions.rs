//! Condition matching over cell tags
//!
//! A condition is a conjunction of per-tag constraints. Declared values map
//! to constraints by shape:
//!
//! | Declared | Tag kind | Constraint |
//! |----------|----------|------------|
//! | `"E"` | text | equality |
//! | `["E", "I"]` | text | set membership |
//! | `250` | numeric | equality |
//! | `[100, 300]` | numeric | inclusive range |
//! | `[1, 2, 3]` | numeric | set membership |
//!
//! A list of exactly two numbers is always a range. An empty condition
//! matches every cell.

use netspec_core::{NetSpecError, ReferenceKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared conditions, keyed by tag name
pub type Conds = BTreeMap<String, CondValue>;

/// A declared condition value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CondValue {
    Number(f64),
    Text(String),
    List(Vec<Scalar>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Number(f64),
    Text(String),
}

impl From<&str> for Scalar {
    fn from(text: &str) -> Self {
        Scalar::Text(text.to_string())
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

impl From<&str> for CondValue {
    fn from(text: &str) -> Self {
        CondValue::Text(text.to_string())
    }
}

impl From<f64> for CondValue {
    fn from(value: f64) -> Self {
        CondValue::Number(value)
    }
}

/// A matchable cell tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Pop,
    CellType,
    CellModel,
    X,
    Y,
    Z,
    XNorm,
    YNorm,
    ZNorm,
}

impl Tag {
    pub const ALL: [Tag; 9] = [
        Tag::Pop,
        Tag::CellType,
        Tag::CellModel,
        Tag::X,
        Tag::Y,
        Tag::Z,
        Tag::XNorm,
        Tag::YNorm,
        Tag::ZNorm,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Tag::Pop => "pop",
            Tag::CellType => "cellType",
            Tag::CellModel => "cellModel",
            Tag::X => "x",
            Tag::Y => "y",
            Tag::Z => "z",
            Tag::XNorm => "xnorm",
            Tag::YNorm => "ynorm",
            Tag::ZNorm => "znorm",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.name() == name)
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, Tag::Pop | Tag::CellType | Tag::CellModel)
    }
}

/// Value of one tag on a concrete entity
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TagValue<'a> {
    Text(&'a str),
    Number(f64),
}

/// Anything carrying cell tags
pub trait Tagged {
    fn tag(&self, tag: Tag) -> TagValue<'_>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Text(String),
    TextSet(Vec<String>),
    Number(f64),
    NumberSet(Vec<f64>),
    /// Both bounds inclusive
    Range { low: f64, high: f64 },
}

impl Constraint {
    fn admits(&self, value: TagValue<'_>) -> bool {
        match (self, value) {
            (Constraint::Text(expected), TagValue::Text(actual)) => expected == actual,
            (Constraint::TextSet(set), TagValue::Text(actual)) => set.iter().any(|s| s == actual),
            (Constraint::Number(expected), TagValue::Number(actual)) => *expected == actual,
            (Constraint::NumberSet(set), TagValue::Number(actual)) => set.contains(&actual),
            (Constraint::Range { low, high }, TagValue::Number(actual)) => *low <= actual && actual <= *high,
            _ => false,
        }
    }
}

/// Compiled conjunction of tag constraints
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    clauses: Vec<(Tag, Constraint)>,
}

impl Condition {
    /// Matches every entity
    pub fn any() -> Self {
        Self::default()
    }

    /// Compile declared conditions; `owner` labels the declaring entry in errors
    pub fn compile(owner: &str, conds: &Conds) -> Result<Self> {
        let clauses = conds
            .iter()
            .map(|(name, value)| {
                let tag = Tag::from_name(name).ok_or_else(|| NetSpecError::UnresolvedReference {
                    kind: ReferenceKind::Tag,
                    label: name.clone(),
                    context: owner.to_string(),
                })?;
                Ok((tag, constraint_for(owner, tag, value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { clauses })
    }

    pub fn with(mut self, tag: Tag, constraint: Constraint) -> Self {
        self.clauses.push((tag, constraint));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches<T: Tagged + ?Sized>(&self, entity: &T) -> bool {
        self.clauses
            .iter()
            .all(|(tag, constraint)| constraint.admits(entity.tag(*tag)))
    }
}

fn constraint_for(owner: &str, tag: Tag, value: &CondValue) -> Result<Constraint> {
    let mismatch = |what: &str| NetSpecError::InvalidDeclaration {
        label: owner.to_string(),
        detail: format!("condition on '{}' expects {}", tag.name(), what),
    };
    let expected = if tag.is_numeric() { "numbers" } else { "text" };

    match value {
        CondValue::Text(text) if !tag.is_numeric() => Ok(Constraint::Text(text.clone())),
        CondValue::Number(number) if tag.is_numeric() => Ok(Constraint::Number(*number)),
        CondValue::List(items) => {
            let numbers: Option<Vec<f64>> = items
                .iter()
                .map(|item| match item {
                    Scalar::Number(n) => Some(*n),
                    Scalar::Text(_) => None,
                })
                .collect();
            let texts: Option<Vec<String>> = items
                .iter()
                .map(|item| match item {
                    Scalar::Text(t) => Some(t.clone()),
                    Scalar::Number(_) => None,
                })
                .collect();

            if items.is_empty() {
                return Err(NetSpecError::InvalidDeclaration {
                    label: owner.to_string(),
                    detail: format!("empty condition list on '{}'", tag.name()),
                });
            }

            match (numbers, texts) {
                (Some(numbers), _) if tag.is_numeric() => {
                    if let [low, high] = numbers[..] {
                        if low > high {
                            return Err(NetSpecError::InvalidRange {
                                label: owner.to_string(),
                                detail: format!("condition on '{}' has low {} above high {}", tag.name(), low, high),
                            });
                        }
                        Ok(Constraint::Range { low, high })
                    } else {
                        Ok(Constraint::NumberSet(numbers))
                    }
                }
                (_, Some(texts)) if !tag.is_numeric() => Ok(Constraint::TextSet(texts)),
                _ => Err(mismatch(expected)),
            }
        }
        _ => Err(mismatch(expected)),
    }
}
