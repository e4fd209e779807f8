//! # NetSpec CLI
//!
//! Command-line interface for declarative network instantiation.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use netspec_builder::{build, JsonTemplateImporter, ModelFile, Network, NetworkGraph};
use netspec_core::Seeds;
use netspec_expr::Function;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "netspec")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Declarative neural network instantiation", long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a model file without generating anything
    Check {
        /// Model file (JSON with netParams and simConfig)
        model: PathBuf,
    },

    /// Build a network and summarize it
    Build {
        /// Model file
        model: PathBuf,
        /// Seed for every stage, replacing the model's seeds
        #[arg(short, long)]
        seed: Option<u64>,
        /// Worker threads for connectivity
        #[arg(short, long)]
        threads: Option<usize>,
        /// Write the network graph as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Find the population spanning a depth
    Locate {
        /// Model file
        model: PathBuf,
        /// Depth along y (um)
        #[arg(short, long)]
        depth: f64,
    },

    /// List formula functions
    Functions,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    match cli.command {
        Commands::Check { model } => {
            let (file, importer) = load(&model)?;
            init_tracing(verbose || file.sim_config.verbose);
            Network::initialize(&file.net_params, file.sim_config.clone(), &importer)?;

            let params = &file.net_params;
            println!("{} {}", "Model OK:".green().bold(), model.display());
            println!("  populations       {}", params.pop_params.len());
            println!("  cell rules        {}", params.cell_params.len());
            println!("  synaptic mechs    {}", params.syn_mech_params.len());
            println!("  stim sources      {}", params.stim_source_params.len());
            println!("  stim targets      {}", params.stim_target_params.len());
            println!("  connectivity      {}", params.conn_params.len());
        }

        Commands::Build {
            model,
            seed,
            threads,
            output,
        } => {
            let (mut file, importer) = load(&model)?;
            init_tracing(verbose || file.sim_config.verbose);
            if let Some(seed) = seed {
                file.sim_config.seeds = Seeds::uniform(seed);
            }
            if threads.is_some() {
                file.sim_config.threads = threads;
            }

            debug!(
                target: "netspec",
                "Seeds loc={} conn={} stim={}, threads {}",
                file.sim_config.seeds.loc,
                file.sim_config.seeds.conn,
                file.sim_config.seeds.stim,
                file.sim_config.threads.map_or_else(|| "auto".to_string(), |n| n.to_string())
            );
            let spinner = spinner(format!("Building {}", model.display()));
            let graph = build(&file.net_params, file.sim_config, &importer);
            spinner.finish_and_clear();
            let graph = graph?;

            summarize(&graph);

            if let Some(path) = output {
                std::fs::write(&path, graph.to_json()?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("{} {}", "Wrote network:".green().bold(), path.display());
            }
        }

        Commands::Locate { model, depth } => {
            let (file, importer) = load(&model)?;
            init_tracing(verbose || file.sim_config.verbose);
            let graph = build(&file.net_params, file.sim_config, &importer)?;
            match graph.population_at_depth(depth) {
                Some(pop) => println!(
                    "{} {} at y = {} um ({} cells, y in [{}, {}])",
                    "Population:".green().bold(),
                    pop.label.cyan(),
                    depth,
                    pop.len(),
                    pop.bounds[1][0],
                    pop.bounds[1][1]
                ),
                None => println!("{} no population spans y = {} um", "Population:".yellow().bold(), depth),
            }
        }

        Commands::Functions => {
            println!("{}", "Formula functions:".green().bold());
            println!();
            for func in Function::ALL {
                let kind = if func.is_stochastic() { "random" } else { "" };
                println!("  {:<26} {}", func.signature().cyan(), kind.dimmed());
            }
            println!();
            println!("  Operators: + - * / ^ **, unary minus; constant pi");
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "warn,netspec=debug" } else { "warn,netspec=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .init();
}

/// Read a model and an importer rooted at the model's directory
fn load(path: &Path) -> anyhow::Result<(ModelFile, JsonTemplateImporter)> {
    let model = ModelFile::load(path).with_context(|| format!("failed to load {}", path.display()))?;
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((model, JsonTemplateImporter::new(base)))
}

fn spinner(message: String) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::default_spinner());
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn summarize(graph: &NetworkGraph) {
    println!("{}", "Populations:".green().bold());
    for pop in graph.populations() {
        let [low, high] = pop.bounds[1];
        println!(
            "  {:<8} {:<12} {:>6} cells   y {:>7.1} .. {:<7.1}",
            pop.label.cyan(),
            pop.cell_type,
            pop.len(),
            low,
            high
        );
    }

    println!("{}", "Connectivity:".green().bold());
    for (index, rule) in graph.conn_rules().iter().enumerate() {
        let count = graph.connections().iter().filter(|c| c.rule == index).count();
        println!("  {:<16} {:>8} connections", rule.label.cyan(), count);
    }

    println!(
        "{} {} cells, {} templates, {} stimuli, {} connections",
        "Total:".green().bold(),
        graph.cells().len(),
        graph.templates().len(),
        graph.stims().len(),
        graph.connections().len()
    );
}
