use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use pbs_analysis::reports::{save_block_data, save_comparison_data, save_transaction_data};
use pbs_analysis::revenue::{
    block_reward, compute_range_stats, count_sandwich_blocks, BlockReward, RangeStats,
};
use pbs_data::entropy::SampleStream;
use pbs_data::store::{BidRow, BlockRow, Store, TxRow};
use pbs_data::types::Block;
use pbs_sim::{Mode, NodeRecipe, SimConfig, Simulation};

#[derive(Debug, Clone)]
struct AppContext {
    db_path: String,
}

#[derive(Parser, Debug)]
#[command(name = "pbs-sim")]
#[command(about = "Agent-based PBS vs POS block auction simulator")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(long, global = true, default_value = "data/pbs.sqlite")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a simulation and write its reports.
    Run(RunArgs),
    /// Summarise a stored run's revenue split.
    Analyze(AnalyzeArgs),
    /// Generate the sample-stream file the bid optimiser reads.
    GenEntropy(GenEntropyArgs),
    /// Show what the result store contains.
    Status(StatusArgs),
}

/// Arguments for the `run` subcommand.
///
/// The node recipe flags mirror the factory: counts per role, with shared
/// connection/characteristic/bidding parameters applied to every node.
#[derive(Args, Debug)]
struct RunArgs {
    /// Number of slots to simulate.
    #[arg(long, default_value_t = 1000)]
    chain_length: u64,

    /// Fresh user transactions injected per slot.
    #[arg(long, default_value_t = 100)]
    txs_per_slot: usize,

    /// Probability a generated transaction carries MEV.
    #[arg(long, default_value_t = 0.5)]
    mev_fraction: f64,

    /// Block capacity handed to every builder.
    #[arg(long, default_value_t = 10)]
    max_block_size: usize,

    /// Master seed; a run is reproducible from this alone.
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Target degree for every node.
    #[arg(long, default_value_t = 5)]
    connections: usize,

    /// Gossip acceptance probability for every node.
    #[arg(long, default_value_t = 1.0)]
    characteristic: f64,

    /// Bid-optimiser lookahead horizon.
    #[arg(long, default_value_t = 0)]
    depth: u32,

    /// Monte-Carlo trials per utility estimate.
    #[arg(long, default_value_t = 100)]
    num_simulations: u32,

    /// Lower edge of the bid search as a fraction of block value.
    #[arg(long, default_value_t = 0.0)]
    min_bid_frac: f64,

    /// MEV-to-gas ratio attackers require of a victim.
    #[arg(long, default_value_t = 3.0)]
    mev_threshold: f64,

    /// Chains to produce: pbs, pos, or both.
    #[arg(long, default_value = "both")]
    mode: String,

    /// Gas-greedy builders.
    #[arg(long, default_value_t = 0)]
    builders: usize,

    /// Sandwich-interleaving builders.
    #[arg(long, default_value_t = 0)]
    attacker_builders: usize,

    /// Pure mempool adversaries.
    #[arg(long, default_value_t = 0)]
    attackers: usize,

    /// Pure proposers.
    #[arg(long, default_value_t = 0)]
    proposers: usize,

    /// Proposers that also build gas-greedily.
    #[arg(long, default_value_t = 0)]
    proposer_builders: usize,

    /// Proposers that also build sandwich-interleaved blocks.
    #[arg(long, default_value_t = 0)]
    proposer_attacker_builders: usize,

    /// Non-participating relay nodes.
    #[arg(long, default_value_t = 2)]
    plain_nodes: usize,

    /// Sample-stream file feeding the Monte-Carlo bid sampler.
    #[arg(long, default_value = "data/random_numbers.txt")]
    entropy: PathBuf,

    /// Directory the CSV reports land in.
    #[arg(long, default_value = "data")]
    out_dir: PathBuf,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Run to analyse; defaults to the most recent.
    #[arg(long)]
    run_id: Option<i64>,

    /// Which chain to summarise: pbs or pos.
    #[arg(long, default_value = "pbs")]
    chain: String,

    /// Output format: table (default), json, or csv.
    #[arg(long, default_value = "table")]
    output: String,
}

#[derive(Args, Debug)]
struct GenEntropyArgs {
    /// Where to write the stream.
    #[arg(long, default_value = "data/random_numbers.txt")]
    out: PathBuf,

    /// Number of values to generate.
    #[arg(long, default_value_t = 1_000_000)]
    count: usize,

    /// Values are uniform in [0, max).
    #[arg(long, default_value_t = 100.0)]
    max: f32,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// How many recent runs to list.
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let ctx = AppContext {
        db_path: cli.db_path,
    };

    match cli.command {
        Commands::Run(args) => handle_run(&ctx, args),
        Commands::Analyze(args) => handle_analyze(&ctx, args),
        Commands::GenEntropy(args) => handle_gen_entropy(args),
        Commands::Status(args) => handle_status(&ctx, args),
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn handle_run(ctx: &AppContext, args: RunArgs) -> Result<()> {
    let mode = Mode::parse(&args.mode)?;
    let config = SimConfig {
        chain_length: args.chain_length,
        txs_per_slot: args.txs_per_slot,
        mev_fraction: args.mev_fraction,
        max_block_size: args.max_block_size,
        seed: args.seed,
        connections: args.connections,
        characteristic: args.characteristic,
        depth: args.depth,
        num_simulations: args.num_simulations,
        min_bid_frac: args.min_bid_frac,
        mev_threshold: args.mev_threshold,
        mode,
        recipe: NodeRecipe {
            builders: args.builders,
            attacker_builders: args.attacker_builders,
            attackers: args.attackers,
            proposers: args.proposers,
            proposer_builders: args.proposer_builders,
            proposer_attacker_builders: args.proposer_attacker_builders,
            plain_nodes: args.plain_nodes,
        },
    };
    config.validate().wrap_err("invalid configuration")?;

    let stream = SampleStream::load(&args.entropy).wrap_err(
        "sample stream unavailable; generate one first with `pbs-sim gen-entropy`",
    )?;

    ensure_dir(&args.out_dir)?;
    let store = Store::new(&ctx.db_path).wrap_err("failed to open result store")?;

    let mut sim = Simulation::new(config, stream)?;

    let pb = ProgressBar::new(args.chain_length);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} slots")
            .wrap_err("failed to create progress style")?
            .progress_chars("#>-"),
    );
    for _ in 0..args.chain_length {
        sim.step().wrap_err("simulation slot failed")?;
        pb.inc(1);
    }
    pb.finish_and_clear();

    let pbs_blocks = &sim.chain.pbs_blocks;
    let pos_blocks = &sim.chain.pos_blocks;

    let run_id = store
        .begin_run(args.seed, args.chain_length, mode.as_str())
        .wrap_err("failed to register run")?;
    persist_chain(&store, run_id, "pbs", pbs_blocks)?;
    persist_chain(&store, run_id, "pos", pos_blocks)?;
    persist_auction_bids(&store, run_id, pbs_blocks)?;

    if !pbs_blocks.is_empty() {
        save_block_data(&args.out_dir.join("pbs_blocks.csv"), pbs_blocks)?;
        save_transaction_data(&args.out_dir.join("pbs_transactions.csv"), pbs_blocks)?;
    }
    if !pos_blocks.is_empty() {
        save_block_data(&args.out_dir.join("pos_blocks.csv"), pos_blocks)?;
        save_transaction_data(&args.out_dir.join("pos_transactions.csv"), pos_blocks)?;
    }
    if !pbs_blocks.is_empty() && !pos_blocks.is_empty() {
        save_comparison_data(&args.out_dir.join("comparison.csv"), pbs_blocks, pos_blocks)?;
    }

    print_run_summary(run_id, pbs_blocks, pos_blocks);

    info!(
        run_id,
        slots = sim.slots_run(),
        pbs_blocks = pbs_blocks.len(),
        pos_blocks = pos_blocks.len(),
        db_path = %ctx.db_path,
        "run command completed"
    );

    Ok(())
}

fn persist_chain(store: &Store, run_id: i64, chain: &str, blocks: &[Block]) -> Result<usize> {
    let block_rows: Vec<BlockRow> = blocks
        .iter()
        .enumerate()
        .map(|(at, block)| {
            let record = block_reward(at as u64 + 1, block);
            (
                record.block_number,
                record.proposer_id,
                record.builder_id,
                record.bid,
                record.block_value,
                record.reward,
            )
        })
        .collect();
    store
        .insert_blocks(run_id, chain, &block_rows)
        .wrap_err_with(|| format!("failed to insert {chain} block rows"))?;

    let tx_rows: Vec<TxRow> = blocks
        .iter()
        .enumerate()
        .flat_map(|(at, block)| {
            block
                .transactions
                .iter()
                .enumerate()
                .map(move |(j, tx)| (at as u64 + 1, j as u64, tx.id, tx.gas, tx.mev))
        })
        .collect();
    store
        .insert_block_transactions(run_id, chain, &tx_rows)
        .wrap_err_with(|| format!("failed to insert {chain} transaction rows"))?;

    Ok(block_rows.len())
}

fn persist_auction_bids(store: &Store, run_id: i64, blocks: &[Block]) -> Result<usize> {
    let rows: Vec<BidRow> = blocks
        .iter()
        .enumerate()
        .flat_map(|(at, block)| {
            block.all_bids.iter().map(move |(&builder_id, &bid)| {
                let block_value = block
                    .all_block_values
                    .get(&builder_id)
                    .copied()
                    .unwrap_or_default();
                (at as u64 + 1, builder_id, bid, block_value)
            })
        })
        .collect();
    store
        .insert_auction_bids(run_id, &rows)
        .wrap_err("failed to insert auction bid rows")
}

fn print_run_summary(run_id: i64, pbs_blocks: &[Block], pos_blocks: &[Block]) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "PBS", "POS"]);

    let pbs_rewards: Vec<BlockReward> = pbs_blocks
        .iter()
        .enumerate()
        .map(|(at, block)| block_reward(at as u64 + 1, block))
        .collect();
    let pos_rewards: Vec<BlockReward> = pos_blocks
        .iter()
        .enumerate()
        .map(|(at, block)| block_reward(at as u64 + 1, block))
        .collect();
    let pbs = compute_range_stats(&pbs_rewards);
    let pos = compute_range_stats(&pos_rewards);

    table.add_row(vec![
        "Blocks".to_string(),
        pbs.block_count.to_string(),
        pos.block_count.to_string(),
    ]);
    table.add_row(vec![
        "Mean block value".to_string(),
        format!("{:.3}", pbs.mean_block_value),
        format!("{:.3}", pos.mean_block_value),
    ]);
    table.add_row(vec![
        "Mean winning bid".to_string(),
        format!("{:.3}", pbs.mean_bid),
        format!("{:.3}", pos.mean_bid),
    ]);
    table.add_row(vec![
        "Total proposer revenue".to_string(),
        format!("{:.3}", pbs.total_proposer_revenue),
        format!("{:.3}", pos.total_proposer_revenue),
    ]);
    table.add_row(vec![
        "Total builder reward".to_string(),
        format!("{:.3}", pbs.total_builder_reward),
        format!("{:.3}", pos.total_builder_reward),
    ]);
    table.add_row(vec![
        "Self-dealt blocks".to_string(),
        pbs.self_dealt_blocks.to_string(),
        pos.self_dealt_blocks.to_string(),
    ]);
    table.add_row(vec![
        "Sandwich-bearing blocks".to_string(),
        count_sandwich_blocks(pbs_blocks).to_string(),
        count_sandwich_blocks(pos_blocks).to_string(),
    ]);

    println!("\nRun {run_id} summary:\n{table}\n");
}

fn handle_analyze(ctx: &AppContext, args: AnalyzeArgs) -> Result<()> {
    if args.chain != "pbs" && args.chain != "pos" {
        return Err(eyre!("unknown chain '{}'; use 'pbs' or 'pos'", args.chain));
    }

    let store = Store::new(&ctx.db_path).wrap_err("failed to open result store")?;
    let run_id = match args.run_id {
        Some(id) => id,
        None => store
            .latest_run_id()?
            .ok_or_else(|| eyre!("no runs in the store yet"))?,
    };

    let rows = store.get_blocks(run_id, &args.chain)?;
    if rows.is_empty() {
        return Err(eyre!(
            "run {run_id} has no '{}' blocks in the store",
            args.chain
        ));
    }

    let records: Vec<BlockReward> = rows.iter().map(BlockReward::from).collect();
    let stats = compute_range_stats(&records);

    match args.output.to_lowercase().as_str() {
        "table" => print_analysis_table(run_id, &records, &stats),
        "json" => print_analysis_json(&records, &stats)?,
        "csv" => print_analysis_csv(&records),
        _ => {
            return Err(eyre!(
                "unknown output format '{}'; use 'table', 'json', or 'csv'",
                args.output
            ))
        }
    }

    info!(
        run_id,
        chain = %args.chain,
        blocks = records.len(),
        output = %args.output,
        "analyze command completed"
    );

    Ok(())
}

fn print_analysis_table(run_id: i64, records: &[BlockReward], stats: &RangeStats) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Block",
        "Proposer",
        "Builder",
        "Bid",
        "Block Value",
        "Builder Reward",
    ]);

    for record in records {
        table.add_row(vec![
            record.block_number.to_string(),
            record.proposer_id.to_string(),
            record.builder_id.to_string(),
            format!("{:.3}", record.bid),
            format!("{:.3}", record.block_value),
            format!("{:.3}", record.reward),
        ]);
    }

    println!("\nRun {run_id}:\n{table}\n");
    println!("Summary (blocks: {}):", stats.block_count);
    println!("  Total block value:      {:.3}", stats.total_block_value);
    println!("  Total proposer revenue: {:.3}", stats.total_proposer_revenue);
    println!("  Total builder reward:   {:.3}", stats.total_builder_reward);
    println!("  Mean winning bid:       {:.3}", stats.mean_bid);
    println!("  Self-dealt blocks:      {}\n", stats.self_dealt_blocks);
}

fn print_analysis_json(records: &[BlockReward], stats: &RangeStats) -> Result<()> {
    use serde::Serialize;

    #[derive(Serialize)]
    struct JsonOutput<'a> {
        blocks: &'a [BlockReward],
        summary: &'a RangeStats,
    }

    let output = JsonOutput {
        blocks: records,
        summary: stats,
    };
    let json_str = serde_json::to_string_pretty(&output).wrap_err("failed to serialize JSON")?;
    println!("{json_str}");
    Ok(())
}

fn print_analysis_csv(records: &[BlockReward]) {
    println!("block_number,proposer_id,builder_id,bid,block_value,reward");
    for record in records {
        println!(
            "{},{},{},{},{},{}",
            record.block_number,
            record.proposer_id,
            record.builder_id,
            record.bid,
            record.block_value,
            record.reward,
        );
    }
}

fn handle_gen_entropy(args: GenEntropyArgs) -> Result<()> {
    if args.count == 0 {
        return Err(eyre!("--count must be positive"));
    }
    if let Some(parent) = args.out.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }

    SampleStream::generate_file(&args.out, args.seed, args.count, args.max)
        .wrap_err("failed to generate sample stream")?;

    info!(
        path = %args.out.display(),
        count = args.count,
        max = args.max,
        seed = args.seed,
        "gen-entropy command completed"
    );
    Ok(())
}

fn handle_status(ctx: &AppContext, args: StatusArgs) -> Result<()> {
    let store = Store::new(&ctx.db_path).wrap_err("failed to open result store")?;
    let runs = store.list_runs(args.limit)?;

    let db_size_str = if ctx.db_path == ":memory:" {
        "N/A (in-memory)".to_string()
    } else {
        match std::fs::metadata(&ctx.db_path) {
            Ok(metadata) => format!("{} MB", metadata.len() / 1_000_000),
            Err(_) => "N/A (file not found)".to_string(),
        }
    };

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Run", "Started", "Seed", "Slots", "Mode", "PBS Blocks"]);
    for run in &runs {
        table.add_row(vec![
            run.id.to_string(),
            run.started_at.clone(),
            run.seed.to_string(),
            run.chain_length.to_string(),
            run.mode.clone(),
            run.block_count.to_string(),
        ]);
    }

    println!("\nStore: {} ({})\n{}\n", ctx.db_path, db_size_str, table);

    info!(runs = runs.len(), db_path = %ctx.db_path, "status command completed");
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .wrap_err_with(|| format!("failed to create directory {}", path.display()))?;
    Ok(())
}
