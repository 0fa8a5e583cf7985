use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::{rngs::StdRng, SeedableRng};
use randwire_eval::{generator::RandomGraph, graph::write_graph_info};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GraphModel {
    /// Watts-Strogatz, uses `k` and `p`
    Ws,
    /// Erdos-Renyi, uses `p`
    Er,
    /// Barabasi-Albert, uses `m`
    Ba,
}

/// Write random stage graphs as `<prefix><stage>.txt`.
#[derive(Parser, Debug)]
#[command(name = "generate_graph", version)]
struct Args {
    #[arg(long, value_enum, default_value = "ws")]
    model: GraphModel,

    #[arg(long, default_value_t = 32)]
    nodes: usize,

    #[arg(long, default_value_t = 4)]
    k: usize,

    #[arg(long, default_value_t = 0.75)]
    p: f64,

    #[arg(long, default_value_t = 5)]
    m: usize,

    #[arg(long, default_value_t = 5)]
    seed: u64,

    #[arg(long, value_delimiter = ',', default_value = "2,3,4,5")]
    stages: Vec<usize>,

    #[arg(long, default_value = "ws_4_075_conv")]
    prefix: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let model = match args.model {
        GraphModel::Ws => RandomGraph::WattsStrogatz { k: args.k, p: args.p },
        GraphModel::Er => RandomGraph::ErdosRenyi { p: args.p },
        GraphModel::Ba => RandomGraph::BarabasiAlbert { m: args.m },
    };
    let mut rng = StdRng::seed_from_u64(args.seed);

    for stage in &args.stages {
        let graph = model
            .generate(args.nodes, &mut rng)
            .with_context(|| format!("failed to generate graph for stage {stage}"))?;
        let path = PathBuf::from(format!("{}{stage}.txt", args.prefix));
        write_graph_info(&graph, &path)?;

        tracing::info!(
            "wrote {} ({} nodes, {} edges, {} inputs, {} outputs)",
            path.display(),
            graph.nodes.len(),
            graph.edge_count(),
            graph.input_nodes.len(),
            graph.output_nodes.len()
        );
    }

    Ok(())
}
