//! PowerLine - command runner
//!
//! Replays a CSV command script against the tree and writes snapshots:
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────┐    ┌──────────┐
//! │ Commands │───▶│ Placement │───▶│  Volume  │───▶│  Output  │
//! │  (CSV)   │    │ /Enroll   │    │ + Cycles │    │ CSV/JSON │
//! └──────────┘    └───────────┘    └──────────┘    └──────────┘
//! ```
//!
//! With `--data-dir` (or `journal.enabled`) every mutation is journaled and
//! a second run continues from the recovered tree.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use powerline::csv_io::{
    COMMANDS_CSV, COMMISSIONS_CSV, InputCommand, POSITIONS_CSV, dump_commissions, dump_positions,
    load_commands,
};
use powerline::ledger::CommissionFilter;
use powerline::{AppConfig, EngineStatsSnapshot, InvariantReport, MemoryTreeStore, PowerLine};

// ============================================================
// ARGUMENTS
// ============================================================

fn get_arg(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn get_env() -> String {
    get_arg(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_input_path() -> String {
    get_arg(&["--input", "-i"]).unwrap_or_else(|| COMMANDS_CSV.to_string())
}

fn get_output_dir() -> String {
    get_arg(&["--output", "-o"]).unwrap_or_else(|| "output".to_string())
}

fn get_data_dir() -> Option<String> {
    get_arg(&["--data-dir"])
}

// ============================================================
// SUMMARY
// ============================================================

#[derive(Serialize)]
struct RunSummary {
    commands: usize,
    rejected: usize,
    elapsed_ms: u128,
    positions: u64,
    commissions: usize,
    total_commission_amount: u64,
    invariants: InvariantReport,
    stats: EngineStatsSnapshot,
}

fn execute(engine: &PowerLine, command: &InputCommand) -> Result<(), powerline::PowerLineError> {
    match command {
        InputCommand::Place {
            anchor,
            preferred_side,
        } => {
            let receipt = engine.place_prospect(anchor, *preferred_side, None)?;
            tracing::debug!(node_id = %receipt.node_id, "placed");
        }
        InputCommand::Enroll {
            node_id,
            promoter_id,
            method,
        } => {
            engine.enroll(node_id, *promoter_id, *method)?;
            // Matched volume banked while vacant becomes payable now
            engine.evaluate(node_id)?;
        }
        InputCommand::Volume { node_id, amount } => {
            engine.record_volume_event(node_id, *amount)?;
        }
        InputCommand::SetActive { node_id, is_active } => {
            engine.set_active(node_id, *is_active)?;
        }
    }
    Ok(())
}

// ============================================================
// MAIN
// ============================================================

fn main() -> Result<()> {
    let env = get_env();
    let input_path = get_input_path();
    let output_dir = get_output_dir();

    let mut config = AppConfig::load(&env)?;
    if let Some(data_dir) = get_data_dir() {
        config.journal.enabled = true;
        config.journal.data_dir = data_dir;
    }
    let _log_guard = powerline::logging::init_logging(&config);

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        journal = config.journal.enabled,
        "Starting PowerLine in {} mode",
        env
    );
    println!("=== PowerLine ===");
    println!("Input: {}", input_path);
    println!("Output directory: {}/\n", output_dir);

    println!("[1] Opening tree...");
    let engine = PowerLine::open(config, Arc::new(MemoryTreeStore::new()))
        .context("Failed to open PowerLine")?;
    println!("    {} positions, root {}", engine.len(), engine.root()?.node_id);

    println!("\n[2] Loading commands...");
    let commands = load_commands(&input_path)?;
    println!("    Loaded {} commands", commands.len());

    println!("\n[3] Executing commands...");
    let start = Instant::now();
    let mut rejected = 0;
    for (i, command) in commands.iter().enumerate() {
        if let Err(e) = execute(&engine, command) {
            rejected += 1;
            tracing::warn!(index = i, code = e.code(), error = %e, "Command rejected");
        }
    }
    let elapsed = start.elapsed();
    println!(
        "    Executed {} commands in {:.2?} ({} rejected)",
        commands.len(),
        elapsed,
        rejected
    );

    println!("\n[4] Verifying invariants...");
    let invariants = engine.verify_invariants().context("Invariant audit failed")?;
    println!("    ✅ {} positions consistent", invariants.positions);

    println!("\n[5] Writing snapshots...");
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create {}", output_dir))?;
    let positions_path = format!("{}/{}", output_dir, POSITIONS_CSV);
    let commissions_path = format!("{}/{}", output_dir, COMMISSIONS_CSV);
    dump_positions(&engine.snapshot(), &positions_path)?;
    let commissions = engine.commissions();
    dump_commissions(&commissions, &commissions_path)?;
    println!("    {}", positions_path);
    println!("    {}", commissions_path);

    let summary = RunSummary {
        commands: commands.len(),
        rejected,
        elapsed_ms: elapsed.as_millis(),
        positions: engine.len(),
        commissions: commissions.len(),
        total_commission_amount: engine
            .commission_summary(&CommissionFilter::default())
            .total_amount,
        invariants,
        stats: engine.stats(),
    };
    println!("\n{}", serde_json::to_string_pretty(&summary)?);
    tracing::info!("{}", engine.stats());

    Ok(())
}
