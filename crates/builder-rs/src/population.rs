//! Populations and cell placement
//!
//! Each population occupies a box inside the network volume. Cells are
//! placed uniformly within the box, one random stream per cell keyed by
//! population label and index, so placement never depends on how many
//! cells other populations hold.

use crate::conditions::{Tag, TagValue, Tagged};
use crate::params::PopParams;
use netspec_core::{CellCollection, CellId, Micrometer, NetSpecError, Position, Result, StreamKey};
use nalgebra::Point3;
use rand::Rng;
use serde::Serialize;

/// Network volume (um)
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Extents {
    pub x: Micrometer,
    pub y: Micrometer,
    pub z: Micrometer,
}

impl Extents {
    pub fn new(x: Micrometer, y: Micrometer, z: Micrometer) -> Result<Self> {
        for (axis, size) in [("sizeX", x), ("sizeY", y), ("sizeZ", z)] {
            if !(size > 0.0) || !size.is_finite() {
                return Err(NetSpecError::InvalidRange {
                    label: "netParams".into(),
                    detail: format!("{axis} must be positive, got {size}"),
                });
            }
        }
        Ok(Self { x, y, z })
    }

    pub fn as_array(&self) -> [Micrometer; 3] {
        [self.x, self.y, self.z]
    }
}

// =============================================================================
// DECLARED POPULATIONS
// =============================================================================

/// A validated population declaration with absolute bounds
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationSpec {
    pub label: String,
    pub cell_type: String,
    pub cell_model: String,
    pub num_cells: usize,
    /// Inclusive [low, high] per axis (um)
    pub bounds: [[Micrometer; 2]; 3],
}

impl PopulationSpec {
    pub fn compile(label: &str, params: &PopParams, extents: &Extents) -> Result<Self> {
        let x = axis_bounds(label, "x", extents.x, params.x_range, params.xnorm_range, false)?;
        let y = axis_bounds(label, "y", extents.y, params.y_range, params.ynorm_range, true)?;
        let z = axis_bounds(label, "z", extents.z, params.z_range, params.znorm_range, false)?;

        Ok(Self {
            label: label.to_string(),
            cell_type: params.cell_type.clone(),
            cell_model: params.cell_model.clone(),
            num_cells: params.num_cells,
            bounds: [x, y, z],
        })
    }
}

fn axis_bounds(
    label: &str,
    axis: &str,
    size: Micrometer,
    absolute: Option<[f64; 2]>,
    normalized: Option<[f64; 2]>,
    required: bool,
) -> Result<[Micrometer; 2]> {
    let invalid = |detail: String| NetSpecError::InvalidRange {
        label: label.to_string(),
        detail,
    };
    let check = |[low, high]: [f64; 2], limit: f64, name: String| {
        if !(low < high) {
            return Err(invalid(format!("{name} [{low}, {high}] must have low below high")));
        }
        if low < 0.0 || high > limit {
            return Err(invalid(format!("{name} [{low}, {high}] lies outside [0, {limit}]")));
        }
        Ok([low, high])
    };

    match (absolute, normalized) {
        (Some(_), Some(_)) => Err(invalid(format!("both {axis}Range and {axis}normRange given"))),
        (Some(range), None) => check(range, size, format!("{axis}Range")),
        (None, Some(range)) => {
            let [low, high] = check(range, 1.0, format!("{axis}normRange"))?;
            Ok([low * size, high * size])
        }
        (None, None) if required => Err(invalid(format!("one of {axis}Range or {axis}normRange is required"))),
        (None, None) => Ok([0.0, size]),
    }
}

// =============================================================================
// CREATED POPULATIONS AND CELLS
// =============================================================================

/// A population with assigned cell identifiers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Population {
    pub label: String,
    pub cell_type: String,
    pub cell_model: String,
    pub bounds: [[Micrometer; 2]; 3],
    pub cell_ids: CellCollection,
}

impl Population {
    pub fn len(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_ids.is_empty()
    }

    /// Whether `depth` lies within the population's y bounds
    pub fn spans_depth(&self, depth: Micrometer) -> bool {
        let [low, high] = self.bounds[1];
        low <= depth && depth <= high
    }
}

/// Assign contiguous identifiers in declaration order
pub fn create_populations(specs: &[PopulationSpec]) -> Vec<Population> {
    let mut next: CellId = 0;
    specs
        .iter()
        .map(|spec| {
            let cell_ids = CellCollection::contiguous(next, spec.num_cells);
            next += spec.num_cells;
            Population {
                label: spec.label.clone(),
                cell_type: spec.cell_type.clone(),
                cell_model: spec.cell_model.clone(),
                bounds: spec.bounds,
                cell_ids,
            }
        })
        .collect()
}

/// A placed cell
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cell {
    pub gid: CellId,
    /// Index of the owning population
    pub pop: usize,
    pub position: Position,
    /// Position divided by the network extents
    pub norm: Point3<f64>,
    /// Index of the merged template, if any rule matched
    pub template: Option<usize>,
}

impl Cell {
    /// x, y, z, xnorm, ynorm, znorm by index
    pub fn coordinate(&self, index: usize) -> f64 {
        match index {
            0..=2 => self.position[index],
            3..=5 => self.norm[index - 3],
            _ => f64::NAN,
        }
    }
}

/// Place every cell of every population
pub fn place_cells(populations: &[Population], extents: &Extents, key: StreamKey) -> Vec<Cell> {
    let sizes = extents.as_array();
    let mut cells = Vec::with_capacity(populations.iter().map(Population::len).sum());

    for (pop_index, pop) in populations.iter().enumerate() {
        let pop_key = key.child(&pop.label);
        for (i, &gid) in pop.cell_ids.iter().enumerate() {
            let mut rng = pop_key.rng(&[i as u64]);
            let mut coords = [0.0; 3];
            for (axis, coord) in coords.iter_mut().enumerate() {
                let [low, high] = pop.bounds[axis];
                *coord = rng.gen_range(low..=high);
            }
            let position = Point3::from(coords);
            let norm = Point3::new(coords[0] / sizes[0], coords[1] / sizes[1], coords[2] / sizes[2]);
            cells.push(Cell {
                gid,
                pop: pop_index,
                position,
                norm,
                template: None,
            });
        }
    }
    cells
}

/// A cell seen together with its population's tags
#[derive(Debug, Clone, Copy)]
pub struct CellView<'a> {
    pub cell: &'a Cell,
    pub pop: &'a Population,
}

impl<'a> CellView<'a> {
    pub fn new(cell: &'a Cell, populations: &'a [Population]) -> Self {
        Self {
            cell,
            pop: &populations[cell.pop],
        }
    }
}

impl Tagged for CellView<'_> {
    fn tag(&self, tag: Tag) -> TagValue<'_> {
        match tag {
            Tag::Pop => TagValue::Text(&self.pop.label),
            Tag::CellType => TagValue::Text(&self.pop.cell_type),
            Tag::CellModel => TagValue::Text(&self.pop.cell_model),
            Tag::X => TagValue::Number(self.cell.position.x),
            Tag::Y => TagValue::Number(self.cell.position.y),
            Tag::Z => TagValue::Number(self.cell.position.z),
            Tag::XNorm => TagValue::Number(self.cell.norm.x),
            Tag::YNorm => TagValue::Number(self.cell.norm.y),
            Tag::ZNorm => TagValue::Number(self.cell.norm.z),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn extents() -> Extents {
        Extents::new(100.0, 1000.0, 100.0).unwrap()
    }

    fn pop(y: Option<[f64; 2]>, ynorm: Option<[f64; 2]>, num_cells: usize) -> PopParams {
        PopParams {
            cell_type: "E".into(),
            cell_model: "HH_reduced".into(),
            num_cells,
            x_range: None,
            xnorm_range: None,
            y_range: y,
            ynorm_range: ynorm,
            z_range: None,
            znorm_range: None,
        }
    }

    #[test]
    fn test_extents_positive() {
        assert!(Extents::new(100.0, 0.0, 100.0).is_err());
        assert!(Extents::new(-1.0, 10.0, 100.0).is_err());
        assert!(Extents::new(f64::NAN, 10.0, 100.0).is_err());
    }

    #[test]
    fn test_normalized_bounds() {
        let spec = PopulationSpec::compile("E2", &pop(None, Some([0.1, 0.4]), 5), &extents()).unwrap();
        assert_eq!(spec.bounds[0], [0.0, 100.0]);
        assert_eq!(spec.bounds[1], [100.0, 400.0]);
        assert_eq!(spec.bounds[2], [0.0, 100.0]);
    }

    #[test]
    fn test_absolute_bounds() {
        let spec = PopulationSpec::compile("E4", &pop(Some([300.0, 600.0]), None, 5), &extents()).unwrap();
        assert_eq!(spec.bounds[1], [300.0, 600.0]);
    }

    #[test]
    fn test_invalid_ranges() {
        let e = extents();
        let cases = [
            pop(None, Some([1.0, 2.0]), 5),
            pop(None, Some([0.5, 0.5]), 5),
            pop(Some([300.0, 1200.0]), None, 5),
            pop(Some([100.0, 200.0]), Some([0.1, 0.2]), 5),
            pop(None, None, 5),
        ];
        for params in &cases {
            let err = PopulationSpec::compile("I5", params, &e).unwrap_err();
            assert!(matches!(err, NetSpecError::InvalidRange { ref label, .. } if label == "I5"));
        }
    }

    #[test]
    fn test_x_and_z_ranges() {
        let e = extents();
        let base = pop(None, Some([0.1, 0.4]), 5);

        let restricted = PopParams {
            x_range: Some([20.0, 80.0]),
            znorm_range: Some([0.5, 1.0]),
            ..base.clone()
        };
        let spec = PopulationSpec::compile("E2", &restricted, &e).unwrap();
        assert_eq!(spec.bounds[0], [20.0, 80.0]);
        assert_eq!(spec.bounds[2], [50.0, 100.0]);

        let cases = [
            PopParams {
                x_range: Some([0.0, 50.0]),
                xnorm_range: Some([0.0, 0.5]),
                ..base.clone()
            },
            PopParams {
                z_range: Some([0.0, 50.0]),
                znorm_range: Some([0.0, 0.5]),
                ..base.clone()
            },
            PopParams {
                x_range: Some([50.0, 150.0]),
                ..base.clone()
            },
            PopParams {
                z_range: Some([-10.0, 50.0]),
                ..base.clone()
            },
            PopParams {
                xnorm_range: Some([0.5, 1.5]),
                ..base.clone()
            },
            PopParams {
                znorm_range: Some([0.8, 0.2]),
                ..base.clone()
            },
        ];
        for params in &cases {
            let err = PopulationSpec::compile("I5", params, &e).unwrap_err();
            assert!(matches!(err, NetSpecError::InvalidRange { ref label, .. } if label == "I5"));
        }
    }

    #[test]
    fn test_contiguous_ids() {
        let e = extents();
        let specs = vec![
            PopulationSpec::compile("E2", &pop(None, Some([0.1, 0.4]), 3), &e).unwrap(),
            PopulationSpec::compile("I2", &pop(None, Some([0.1, 0.4]), 0), &e).unwrap(),
            PopulationSpec::compile("E4", &pop(None, Some([0.4, 0.6]), 2), &e).unwrap(),
        ];
        let pops = create_populations(&specs);
        assert_eq!(pops[0].cell_ids.ids, vec![0, 1, 2]);
        assert!(pops[1].is_empty());
        assert_eq!(pops[2].cell_ids.ids, vec![3, 4]);
    }

    #[test]
    fn test_placement_independent_of_other_pops() {
        let e = extents();
        let a = PopulationSpec::compile("A", &pop(None, Some([0.1, 0.4]), 4), &e).unwrap();
        let b = PopulationSpec::compile("B", &pop(None, Some([0.5, 0.9]), 3), &e).unwrap();
        let key = StreamKey::root(1, "loc");

        let alone = place_cells(&create_populations(&[b.clone()]), &e, key);
        let after_a = place_cells(&create_populations(&[a, b]), &e, key);
        for (x, y) in alone.iter().zip(&after_a[4..]) {
            assert_eq!(x.position, y.position);
        }
    }

    #[test]
    fn test_cell_view_tags() {
        let e = extents();
        let specs = vec![PopulationSpec::compile("E2", &pop(None, Some([0.1, 0.4]), 1), &e).unwrap()];
        let pops = create_populations(&specs);
        let cells = place_cells(&pops, &e, StreamKey::root(1, "loc"));
        let view = CellView::new(&cells[0], &pops);
        assert_eq!(view.tag(Tag::Pop), TagValue::Text("E2"));
        assert_eq!(view.tag(Tag::CellModel), TagValue::Text("HH_reduced"));
        assert_eq!(view.tag(Tag::Y), TagValue::Number(cells[0].position.y));
        assert_eq!(cells[0].coordinate(4), cells[0].norm.y);
    }

    proptest! {
        #[test]
        fn prop_cells_inside_bounds(
            seed in any::<u64>(),
            low in 0.0f64..0.9,
            width in 0.01f64..0.1,
            n in 1usize..40,
        ) {
            let e = extents();
            let spec = PopulationSpec::compile("P", &pop(None, Some([low, low + width]), n), &e).unwrap();
            let pops = create_populations(&[spec]);
            let cells = place_cells(&pops, &e, StreamKey::root(seed, "loc"));
            prop_assert_eq!(cells.len(), n);
            for cell in &cells {
                for axis in 0..3 {
                    let [lo, hi] = pops[0].bounds[axis];
                    prop_assert!(lo <= cell.position[axis] && cell.position[axis] <= hi);
                }
                prop_assert!(pops[0].spans_depth(cell.position.y));
            }
        }
    }
}
