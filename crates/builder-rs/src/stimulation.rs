//! Stimulation sources and targets
//!
//! Sources describe what is delivered; targets bind a source to the cells
//! matching their conditions. Event sources (NetStim) reach their targets
//! through a synaptic mechanism with per-cell weight and delay. Point
//! processes (IClamp, AlphaSynapse) are inserted directly and carry neither.

use crate::conditions::Condition;
use crate::connectivity::{resolve_syn_mech, SynMech};
use crate::params::{StimSourceParams, StimTargetParams};
use crate::population::{Cell, CellView, Population};
use crate::variables::{compile_param, eval_param, CellScope, CellSymbols, Globals, Side};
use netspec_core::{CellId, Millisecond, NetSpecError, ReferenceKind, Result, StreamKey};
use netspec_expr::{Compiled, ExprArena};
use serde::Serialize;
use tracing::warn;

/// A validated stimulus source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StimSource {
    pub label: String,
    #[serde(flatten)]
    pub params: StimSourceParams,
}

impl StimSource {
    pub fn compile(label: &str, params: &StimSourceParams) -> Result<Self> {
        let invalid = |detail: String| NetSpecError::InvalidDeclaration {
            label: label.to_string(),
            detail,
        };
        match *params {
            StimSourceParams::NetStim { rate, noise, start, number } => {
                if !(rate >= 0.0) {
                    return Err(invalid(format!("rate must be non-negative, got {rate}")));
                }
                if !(0.0..=1.0).contains(&noise) {
                    return Err(invalid(format!("noise must lie in [0, 1], got {noise}")));
                }
                if !(start >= 0.0) {
                    return Err(invalid(format!("start must be non-negative, got {start}")));
                }
                if let Some(n) = number {
                    if !(n >= 0.0) {
                        return Err(invalid(format!("number must be non-negative, got {n}")));
                    }
                }
            }
            StimSourceParams::IClamp { del, dur, .. } => {
                if !(del >= 0.0 && dur >= 0.0) {
                    return Err(invalid(format!("del and dur must be non-negative, got {del} and {dur}")));
                }
            }
            StimSourceParams::AlphaSynapse { onset, tau, .. } => {
                if !(onset >= 0.0) || !(tau > 0.0) {
                    return Err(invalid(format!("onset must be non-negative and tau positive, got {onset} and {tau}")));
                }
            }
        }
        Ok(Self {
            label: label.to_string(),
            params: params.clone(),
        })
    }

    /// Whether the source delivers spike events through a synapse
    pub fn delivers_events(&self) -> bool {
        matches!(self.params, StimSourceParams::NetStim { .. })
    }
}

/// Weight, delay and mechanism of an event-delivering target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delivery {
    pub weight: Compiled,
    pub delay: Compiled,
    pub syn_mech: usize,
}

/// A compiled stimulus target
#[derive(Debug, Clone)]
pub struct StimTarget {
    pub label: String,
    pub source: usize,
    pub condition: Condition,
    pub delivery: Option<Delivery>,
    pub sec: String,
    pub loc: f64,
}

impl StimTarget {
    pub fn compile(
        label: &str,
        params: &StimTargetParams,
        arena: &mut ExprArena,
        globals: &Globals,
        sources: &[StimSource],
        syn_mechs: &[SynMech],
    ) -> Result<Self> {
        let source = sources
            .iter()
            .position(|s| s.label == params.source)
            .ok_or_else(|| NetSpecError::UnresolvedReference {
                kind: ReferenceKind::StimSource,
                label: params.source.clone(),
                context: label.to_string(),
            })?;

        let delivery = if sources[source].delivers_events() {
            let symbols = CellSymbols {
                side: Side::Post,
                globals,
            };
            let weight = match &params.weight {
                Some(w) => compile_param(arena, label, w, &symbols)?,
                None => Compiled::Const(globals.default_weight()),
            };
            let delay = match &params.delay {
                Some(d) => compile_param(arena, label, d, &symbols)?,
                None => Compiled::Const(globals.default_delay()),
            };
            Some(Delivery {
                weight,
                delay,
                syn_mech: resolve_syn_mech(syn_mechs, params.syn_mech.as_deref(), label)?,
            })
        } else {
            if params.weight.is_some() || params.delay.is_some() || params.syn_mech.is_some() {
                warn!(target: "netspec", "Stim target '{}': weight, delay and synMech ignored for point process '{}'", label, params.source);
            }
            None
        };

        if !(0.0..=1.0).contains(&params.loc) {
            return Err(NetSpecError::InvalidRange {
                label: label.to_string(),
                detail: format!("loc {} lies outside [0, 1]", params.loc),
            });
        }

        Ok(Self {
            label: label.to_string(),
            source,
            condition: Condition::compile(label, &params.conds)?,
            delivery,
            sec: params.sec.clone(),
            loc: params.loc,
        })
    }

    /// Attach this target's source to every matching cell, in gid order
    pub fn apply(
        &self,
        index: usize,
        populations: &[Population],
        cells: &[Cell],
        arena: &ExprArena,
        globals: &Globals,
        key: StreamKey,
    ) -> Result<Vec<Stimulus>> {
        let key = key.child(&self.label);
        let symbols = CellSymbols {
            side: Side::Post,
            globals,
        };

        cells
            .iter()
            .filter(|cell| self.condition.matches(&CellView::new(cell, populations)))
            .map(|cell| -> Result<Stimulus> {
                let mut stim = Stimulus {
                    cell: cell.gid,
                    source: self.source,
                    target: index,
                    weight: None,
                    delay: None,
                    syn_mech: None,
                };
                if let Some(delivery) = self.delivery {
                    let scope = CellScope { cell, globals };
                    let mut rng = key.rng(&[cell.gid as u64]);
                    stim.weight = Some(eval_param(arena, &self.label, delivery.weight, &scope, &symbols, &mut rng)?);
                    stim.delay = Some(eval_param(arena, &self.label, delivery.delay, &scope, &symbols, &mut rng)?);
                    stim.syn_mech = Some(delivery.syn_mech);
                }
                Ok(stim)
            })
            .collect()
    }
}

/// A stimulus attached to one cell
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stimulus {
    pub cell: CellId,
    /// Index into the network's stimulus sources
    pub source: usize,
    /// Index of the generating target
    pub target: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<Millisecond>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syn_mech: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{NetParams, PopParams, SynMechParams};
    use crate::population::{create_populations, place_cells, Extents, PopulationSpec};

    struct Fixture {
        pops: Vec<Population>,
        cells: Vec<Cell>,
        globals: Globals,
        arena: ExprArena,
        sources: Vec<StimSource>,
        mechs: Vec<SynMech>,
    }

    fn fixture() -> Fixture {
        let params = NetParams {
            size_y: 1000.0,
            ..NetParams::default()
        };
        let extents = Extents::new(params.size_x, params.size_y, params.size_z).unwrap();
        let pop = |label: &str, cell_type: &str, n: usize| {
            let p = PopParams {
                cell_type: cell_type.into(),
                cell_model: "HH".into(),
                num_cells: n,
                x_range: None,
                xnorm_range: None,
                y_range: None,
                ynorm_range: Some([0.1, 0.4]),
                z_range: None,
                znorm_range: None,
            };
            PopulationSpec::compile(label, &p, &extents).unwrap()
        };
        let pops = create_populations(&[pop("E2", "E", 5), pop("I2", "I", 3)]);
        let cells = place_cells(&pops, &extents, StreamKey::root(1, "loc"));
        let sources = vec![
            StimSource::compile(
                "bkg",
                &StimSourceParams::NetStim {
                    rate: 40.0,
                    noise: 0.3,
                    start: 0.0,
                    number: None,
                },
            )
            .unwrap(),
            StimSource::compile(
                "clamp",
                &StimSourceParams::IClamp {
                    del: 10.0,
                    dur: 100.0,
                    amp: 0.2,
                },
            )
            .unwrap(),
        ];
        Fixture {
            pops,
            cells,
            globals: Globals::from_params(&params).unwrap(),
            arena: ExprArena::new(),
            sources,
            mechs: vec![SynMech::compile("exc", &SynMechParams::Exp2Syn { tau1: 0.1, tau2: 5.0, e: 0.0 }).unwrap()],
        }
    }

    fn compile(fx: &mut Fixture, json: &str) -> Result<StimTarget> {
        let params: StimTargetParams = serde_json::from_str(json).unwrap();
        StimTarget::compile("target", &params, &mut fx.arena, &fx.globals, &fx.sources, &fx.mechs)
    }

    fn apply(fx: &Fixture, target: &StimTarget, seed: u64) -> Vec<Stimulus> {
        target
            .apply(0, &fx.pops, &fx.cells, &fx.arena, &fx.globals, StreamKey::root(seed, "stim"))
            .unwrap()
    }

    #[test]
    fn test_event_source_attachment() {
        let mut fx = fixture();
        let target = compile(
            &mut fx,
            r#"{"source": "bkg", "conds": {"cellType": ["E", "I"]}, "weight": 0.01, "delay": "max(1, normal(5,2))", "synMech": "exc"}"#,
        )
        .unwrap();
        let stims = apply(&fx, &target, 1);
        assert_eq!(stims.len(), 8);
        for stim in &stims {
            assert_eq!(stim.weight, Some(0.01));
            assert!(stim.delay.unwrap() >= 1.0);
            assert_eq!(stim.syn_mech, Some(0));
        }
        assert_eq!(stims, apply(&fx, &target, 1));
    }

    #[test]
    fn test_point_process_has_no_delivery() {
        let mut fx = fixture();
        let target = compile(&mut fx, r#"{"source": "clamp", "conds": {"pop": "I2"}, "sec": "dend", "loc": 0.3}"#).unwrap();
        assert!(target.delivery.is_none());
        assert_eq!(target.sec, "dend");
        let stims = apply(&fx, &target, 1);
        assert_eq!(stims.iter().map(|s| s.cell).collect::<Vec<_>>(), vec![5, 6, 7]);
        assert!(stims.iter().all(|s| s.weight.is_none() && s.syn_mech.is_none()));
    }

    #[test]
    fn test_weight_formula_sees_post_cell() {
        let mut fx = fixture();
        let target = compile(&mut fx, r#"{"source": "bkg", "weight": "0.02 * post_ynorm"}"#).unwrap();
        for stim in apply(&fx, &target, 3) {
            let expected = 0.02 * fx.cells[stim.cell].norm.y;
            assert!((stim.weight.unwrap() - expected).abs() < 1e-15);
            assert_eq!(stim.delay, Some(1.0));
        }
    }

    #[test]
    fn test_unresolved_source() {
        let mut fx = fixture();
        let err = compile(&mut fx, r#"{"source": "thalamus"}"#).unwrap_err();
        assert!(matches!(
            err,
            NetSpecError::UnresolvedReference { kind: ReferenceKind::StimSource, ref label, ref context }
                if label == "thalamus" && context == "target"
        ));
    }

    #[test]
    fn test_pair_variables_rejected() {
        let mut fx = fixture();
        let err = compile(&mut fx, r#"{"source": "bkg", "weight": "dist_3D"}"#).unwrap_err();
        assert!(matches!(err, NetSpecError::MalformedExpression { .. }));
    }

    #[test]
    fn test_source_validation() {
        let bad = StimSourceParams::NetStim {
            rate: -5.0,
            noise: 0.0,
            start: 0.0,
            number: None,
        };
        assert!(StimSource::compile("bkg", &bad).is_err());
        let bad = StimSourceParams::AlphaSynapse {
            onset: 5.0,
            tau: 0.0,
            gmax: 0.1,
            e: 0.0,
        };
        assert!(StimSource::compile("alpha", &bad).is_err());
    }
}
