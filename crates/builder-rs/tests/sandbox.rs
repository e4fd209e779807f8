//! End-to-end builds of the sandbox model

use netspec_builder::{build, JsonTemplateImporter, ModelFile, NetParams, Network, NetworkGraph};
use netspec_core::{NetSpecError, ReferenceKind, Seeds, SimConfig};
use std::path::PathBuf;

fn demos() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos")
}

fn sandbox() -> ModelFile {
    ModelFile::load(demos().join("sandbox.json")).unwrap()
}

fn build_model(params: &NetParams, cfg: SimConfig) -> netspec_core::Result<NetworkGraph> {
    build(params, cfg, &JsonTemplateImporter::new(demos()))
}

fn build_sandbox() -> NetworkGraph {
    let model = sandbox();
    build_model(&model.net_params, model.sim_config).unwrap()
}

#[test]
fn test_sandbox_populations() {
    let graph = build_sandbox();
    assert_eq!(graph.populations().len(), 6);
    assert_eq!(graph.cells().len(), 30);

    for pop in graph.populations() {
        assert_eq!(pop.len(), 5);
        for &gid in &pop.cell_ids {
            let cell = graph.cell(gid).unwrap();
            for axis in 0..3 {
                let [low, high] = pop.bounds[axis];
                assert!(low <= cell.position[axis] && cell.position[axis] <= high);
            }
        }
    }

    let e5 = graph.population("E5").unwrap();
    assert_eq!(e5.bounds[1], [600.0, 1000.0]);
    assert_eq!(e5.bounds[0], [0.0, 200.0]);
}

#[test]
fn test_sandbox_is_reproducible() {
    let a = build_sandbox().to_json().unwrap();
    let b = build_sandbox().to_json().unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_thread_count_does_not_change_result() {
    let model = sandbox();
    let run = |threads| {
        let cfg = SimConfig {
            threads: Some(threads),
            ..model.sim_config.clone()
        };
        build_model(&model.net_params, cfg).unwrap()
    };
    let single = run(1);
    let many = run(8);
    assert_eq!(single.connections(), many.connections());
    assert_eq!(single.stims(), many.stims());
}

#[test]
fn test_seeds_are_per_stage() {
    let model = sandbox();
    let base = build_model(&model.net_params, model.sim_config.clone()).unwrap();
    let reseeded = build_model(
        &model.net_params,
        SimConfig {
            seeds: Seeds {
                conn: 99,
                ..Seeds::default()
            },
            ..model.sim_config.clone()
        },
    )
    .unwrap();

    assert_eq!(base.cells(), reseeded.cells());
    assert_eq!(base.stims(), reseeded.stims());
    assert_ne!(base.connections(), reseeded.connections());
}

#[test]
fn test_excitatory_rule() {
    let graph = build_sandbox();
    let conns: Vec<_> = graph.connections_for_rule("E->all").collect();
    assert!(!conns.is_empty());

    for c in &conns {
        let pre = graph.cell(c.pre).unwrap();
        let post = graph.cell(c.post).unwrap();
        assert_eq!(graph.population_of(pre).cell_type, "E");
        assert!(post.position.y >= 100.0 && post.position.y <= 1000.0);
        assert!((c.weight - 5.0 * post.norm.y).abs() < 1e-12);

        let dist = nalgebra::distance(&pre.position, &post.position);
        assert!((c.delay - (dist / 100.0).max(1.0)).abs() < 1e-9);
        assert_eq!(graph.syn_mechs()[c.syn_mech].label, "exc");
        assert_ne!(c.pre, c.post);
    }
    assert!(conns.windows(2).all(|w| (w[0].pre, w[0].post) < (w[1].pre, w[1].post)));
    assert_eq!(graph.conn_rules()[0].sec, "soma");
}

#[test]
fn test_no_inhibitory_cells_in_sandbox() {
    // No sandbox population declares cellType "I"
    let graph = build_sandbox();
    assert_eq!(graph.connections_for_rule("I->E").count(), 0);
}

#[test]
fn test_sandbox_templates() {
    let graph = build_sandbox();
    let template_of = |pop: &str| {
        let gid = graph.population(pop).and_then(|p| p.cell_ids.first()).unwrap();
        graph.template_of(graph.cell(gid).unwrap())
    };

    let e2 = template_of("E2").unwrap();
    assert!(e2.secs.contains_key("soma"));
    assert_eq!(e2.secs["Adend1"].topol.as_ref().map(|t| t.parent_sec.as_str()), Some("soma"));
    assert_eq!(e2.globals["celsius"], 34.0);
    assert_eq!(template_of("E5"), Some(e2));

    let i5 = template_of("I5").unwrap();
    assert!(i5.secs.is_empty());
    assert!(i5.source.as_ref().unwrap().ends_with("cells/LTS3.hoc"));

    assert!(template_of("I2").is_none());
    assert!(template_of("I4").is_none());
    assert_eq!(graph.templates().len(), 2);
}

#[test]
fn test_sandbox_stimuli() {
    let graph = build_sandbox();
    // Only the excitatory populations match cellType E or I
    assert_eq!(graph.stims().len(), 15);
    for stim in graph.stims() {
        assert_eq!(stim.weight, Some(10.0));
        assert!(stim.delay.unwrap() >= 1.0);
        assert_eq!(stim.syn_mech, Some(0));
        assert_eq!(graph.population_of(graph.cell(stim.cell).unwrap()).cell_type, "E");
    }
    assert_eq!(graph.stim_targets()[0].sec, "soma");
}

#[test]
fn test_population_lookup_by_depth() {
    let graph = build_sandbox();
    let at = |y| graph.population_at_depth(y).map(|p| p.label.clone());
    assert_eq!(at(200.0).as_deref(), Some("E2"));
    assert_eq!(at(300.0).as_deref(), Some("E2"));
    assert_eq!(at(450.0).as_deref(), Some("E4"));
    assert_eq!(at(800.0).as_deref(), Some("E5"));
    assert_eq!(at(50.0), None);
}

#[test]
fn test_out_of_range_population_rejected() {
    let mut model = sandbox();
    if let Some(i5) = model.net_params.pop_params.get_mut("I5") {
        i5.ynorm_range = Some([1.0, 2.0]);
    }
    let err = build_model(&model.net_params, model.sim_config).unwrap_err();
    assert!(matches!(err, NetSpecError::InvalidRange { ref label, .. } if label == "I5"));
}

#[test]
fn test_unresolved_stim_source() {
    let mut model = sandbox();
    if let Some(target) = model.net_params.stim_target_params.get_mut("bkg->all") {
        target.source = "thalamus".into();
    }
    let err = build_model(&model.net_params, model.sim_config).unwrap_err();
    assert!(matches!(
        err,
        NetSpecError::UnresolvedReference { kind: ReferenceKind::StimSource, ref label, .. } if label == "thalamus"
    ));
}

fn inhibitory_model(probability: &str) -> NetParams {
    NetParams::from_json(&format!(
        r#"{{
            "sizeX": 200, "sizeY": 1000, "sizeZ": 20, "probLengthConst": 150.0,
            "popParams": {{
                "E2": {{"cellType": "E", "numCells": 20, "yRange": [100, 300], "cellModel": "HH"}},
                "I2": {{"cellType": "I", "numCells": 10, "yRange": [100, 300], "cellModel": "HH"}}
            }},
            "synMechParams": {{"inh": {{"mod": "Exp2Syn", "tau1": 0.6, "tau2": 8.5, "e": -75}}}},
            "connParams": {{
                "I->E": {{
                    "preConds": {{"cellType": "I"}}, "postConds": {{"pop": ["E2"]}},
                    "probability": "{probability}", "synMech": "inh"
                }}
            }}
        }}"#
    ))
    .unwrap()
}

#[test]
fn test_inhibitory_rule_respects_conditions() {
    let params = inhibitory_model("0.4*exp(-dist_3D/probLengthConst)");
    let graph = build_model(&params, SimConfig::default()).unwrap();
    let e2 = graph.population("E2").unwrap();
    let i2 = graph.population("I2").unwrap();

    assert!(graph.connections().iter().all(|c| !e2.cell_ids.contains(c.pre)));
    assert!(graph.connections().iter().all(|c| i2.cell_ids.contains(c.pre) && e2.cell_ids.contains(c.post)));
}

#[test]
fn test_distance_dependent_probability_decreases() {
    let params = inhibitory_model("0.4*exp(-dist_3D/probLengthConst)");
    let mut net = Network::initialize(&params, SimConfig::default(), &JsonTemplateImporter::new(demos())).unwrap();
    net.create_pops().unwrap();
    let cells = net.create_cells().unwrap().to_vec();

    let mut samples = Vec::new();
    for pre in cells.iter().filter(|c| c.pop == 1) {
        for post in cells.iter().filter(|c| c.pop == 0) {
            let p = net.pair_probability("I->E", pre.gid, post.gid).unwrap().unwrap();
            samples.push((nalgebra::distance(&pre.position, &post.position), p));
        }
    }
    samples.sort_by(|a, b| a.0.total_cmp(&b.0));
    assert!(samples.windows(2).all(|w| w[1].1 <= w[0].1));
    assert!(samples.iter().all(|&(_, p)| p > 0.0 && p <= 0.4));
}

#[test]
fn test_probability_extremes() {
    let always = build_model(&inhibitory_model("1.0"), SimConfig::default()).unwrap();
    assert_eq!(always.connections().len(), 10 * 20);

    let never = build_model(&inhibitory_model("0"), SimConfig::default()).unwrap();
    assert!(never.connections().is_empty());
}

#[test]
fn test_graph_written_to_disk() {
    let graph = build_sandbox();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("network.json");
    std::fs::write(&path, graph.to_json().unwrap()).unwrap();

    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["cells"].as_array().map(Vec::len), Some(30));
    assert_eq!(value["simConfig"]["filename"], "net_lfp");
    assert_eq!(value["synMechs"][1]["mod"], "Exp2Syn");
    assert_eq!(value["stimSources"][0]["type"], "NetStim");
}
