//! Spectrum CLI: evolutionary orchestration of policy networks
//!
//! Commands:
//!   spectrum run          run every configured generation (resumes automatically)
//!   spectrum init         build missing generation-0 models
//!   spectrum status       show per-lineage progress of a generation
//!   spectrum leaderboard  print the cross-lineage leaderboard of a generation
//!   spectrum scan         list planets and live units on the world servers
//!   spectrum probe        check that the world server is reachable

use spectrum_core::evolution::{
    ChampionPromoter, GenerationReport, LeaderboardEntry, LineageRegistry, Orchestrator,
    PromotionDecision, RankedEntry,
};
use spectrum_core::runtime::{probe_with_retries, scan, AgentRuntime};
use spectrum_core::storage::{self, layout::parse_summary_index};
use spectrum_core::{
    ExperimentConfig, JsonModelProvider, ModelsLayout, SimulatedRuntime, TcpRuntime,
};
use std::env;
use std::process;
use std::time::Duration;

fn print_usage() {
    println!(
        r#"
╔══════════════════════════════════════════════════════════════╗
║        Spectrum v0.1 : Evolutionary Policy Orchestration    ║
║        lineages · variants · dispatch · champions            ║
╚══════════════════════════════════════════════════════════════╝

Usage: spectrum <command> [options]

Commands:
  run          <config> [--simulate]     Run all generations (resumes where it stopped)
  init         <config>                  Build missing generation-0 models
  status       <config> [generation]     Show per-lineage progress (default: latest ranked)
  leaderboard  <config> <generation>     Print the leaderboard of a generation
  scan         <config>                  List planets and live units on world servers
  probe        <config>                  Check the world server is reachable

Environment:
  GAME_HOST, GAME_PORT, GAME_AUTH, SPECTRUM_MODELS_ROOT override the config file.
  RUST_LOG controls log verbosity (default: info).

Examples:
  spectrum init experiment.json
  spectrum run experiment.json --simulate
  spectrum status experiment.json 3
  spectrum leaderboard experiment.json 3
"#
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let ok = match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "init" => cmd_init(&args[2..]),
        "status" => cmd_status(&args[2..]),
        "leaderboard" => cmd_leaderboard(&args[2..]),
        "scan" => cmd_scan(&args[2..]).await,
        "probe" => cmd_probe(&args[2..]).await,
        "help" | "--help" | "-h" => {
            print_usage();
            true
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            false
        }
    };
    if !ok {
        process::exit(1);
    }
}

fn load_config(path: &str) -> Option<ExperimentConfig> {
    match ExperimentConfig::load(path) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("  Failed to load {}: {}", path, e);
            None
        }
    }
}

fn parse_generation(arg: Option<&String>) -> Option<u32> {
    match arg.map(|s| s.parse::<u32>()) {
        Some(Ok(gen)) => Some(gen),
        Some(Err(_)) => {
            eprintln!("  Generation must be a non-negative number");
            None
        }
        None => None,
    }
}

async fn cmd_run(args: &[String]) -> bool {
    if args.is_empty() {
        eprintln!("Usage: spectrum run <config> [--simulate]");
        return false;
    }
    let Some(config) = load_config(&args[0]) else {
        return false;
    };
    let simulate = args[1..].iter().any(|a| a == "--simulate");

    if simulate {
        println!(
            "\n  Running '{}' against the in-process simulated world",
            config.name
        );
        drive(config, SimulatedRuntime::new()).await
    } else {
        let endpoint = config.endpoint();
        let probe = probe_with_retries(
            &endpoint.address,
            endpoint.timeout,
            Duration::from_millis(config.runtime.probe_delay_ms),
            config.runtime.probe_attempts,
        )
        .await;
        if let Err(e) = probe {
            eprintln!(
                "  World server unreachable: {}",
                spectrum_core::EvolveError::from(e)
            );
            return false;
        }
        println!("\n  Running '{}' against {}", config.name, endpoint.address);
        drive(config, TcpRuntime::new(endpoint)).await
    }
}

async fn drive<R: AgentRuntime>(config: ExperimentConfig, runtime: R) -> bool {
    let mut orchestrator = match Orchestrator::new(config, runtime, JsonModelProvider) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("  Invalid configuration: {}", e);
            return false;
        }
    };
    match orchestrator.run().await {
        Ok(reports) => {
            for report in &reports {
                print_generation(report);
            }
            let failed = reports.iter().any(|r| !r.errors.is_empty());
            if orchestrator.status().dropped() > 0 {
                println!(
                    "\n  ({} older status events were dropped from the in-memory log)",
                    orchestrator.status().dropped()
                );
            }
            !failed
        }
        Err(e) => {
            eprintln!("  Run aborted: {}", e);
            false
        }
    }
}

fn print_generation(report: &GenerationReport) {
    println!("\n  Generation {}", report.generation);
    println!("  {}", "-".repeat(72));
    for lineage in &report.lineages {
        if lineage.lease_skipped {
            println!(
                "  {:<24} skipped (lease held by another process)",
                lineage.lineage
            );
            continue;
        }
        let champion = match &lineage.promotion {
            Some(PromotionDecision::Promoted { variant, score, .. }) => {
                format!("promoted variant {} ({:.4})", variant, score)
            }
            Some(PromotionDecision::Kept { incumbent, .. }) => {
                format!("kept ({:.4})", incumbent.score)
            }
            None if lineage.ranked => "already checked".to_string(),
            None => "pending".to_string(),
        };
        println!(
            "  {:<24} evaluated={} skipped={} failed={}  champion: {}",
            lineage.lineage,
            lineage.evaluated.len(),
            lineage.skipped.len(),
            lineage.failed.len(),
            champion
        );
    }
    for failure in &report.errors {
        let hint = if failure.transient {
            "rerun to resume"
        } else {
            "needs repair"
        };
        println!(
            "  {:<24} ERROR ({}) {}",
            failure.lineage, hint, failure.reason
        );
    }
    if report.leaderboard_written {
        println!("  Leaderboard written");
    }
}

fn cmd_init(args: &[String]) -> bool {
    if args.is_empty() {
        eprintln!("Usage: spectrum init <config>");
        return false;
    }
    let Some(config) = load_config(&args[0]) else {
        return false;
    };
    let orchestrator = match Orchestrator::new(config, SimulatedRuntime::new(), JsonModelProvider) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("  Invalid configuration: {}", e);
            return false;
        }
    };
    match orchestrator.init_models() {
        Ok(created) => {
            println!(
                "\n  {} lineages, {} new generation-0 models under {}",
                orchestrator.registry().len(),
                created,
                orchestrator.layout().root().display()
            );
            true
        }
        Err(e) => {
            eprintln!("  Failed to build models: {}", e);
            false
        }
    }
}

fn cmd_status(args: &[String]) -> bool {
    if args.is_empty() {
        eprintln!("Usage: spectrum status <config> [generation]");
        return false;
    }
    let Some(config) = load_config(&args[0]) else {
        return false;
    };
    let layout = ModelsLayout::new(&config.models_root);
    let gen = if args.len() > 1 {
        match parse_generation(args.get(1)) {
            Some(gen) => gen,
            None => return false,
        }
    } else {
        let latest = LineageRegistry::from_config(&config)
            .iter()
            .filter_map(|l| l.last_ranked_generation(&layout))
            .max();
        match latest {
            Some(gen) => gen,
            None => {
                println!("\n  Nothing ranked yet under {}", layout.root().display());
                return true;
            }
        }
    };
    let promoter = ChampionPromoter::new(&layout);

    println!(
        "\n  Generation {} ({} variants per lineage)",
        gen, config.spectrum_steps
    );
    println!("  {}", "-".repeat(72));
    for key in config.lineages() {
        let variants = (0..config.spectrum_steps)
            .filter(|i| layout.variant(gen, &key, *i).exists())
            .count();
        let summaries = std::fs::read_dir(layout.results_dir(gen, &key))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| parse_summary_index(&e.file_name().to_string_lossy()).is_some())
                    .count()
            })
            .unwrap_or(0);
        let ranked = match storage::read_json::<Vec<RankedEntry>>(&layout.ranked(gen, &key)) {
            Ok(entries) => entries
                .first()
                .map(|top| format!("best variant {} ({:.4})", top.variant, top.mean_progress))
                .unwrap_or_else(|| "empty".to_string()),
            Err(_) => "not ranked".to_string(),
        };
        let champion = promoter
            .provenance(&key)
            .map(|p| {
                format!(
                    "gen {} variant {} ({:.4})",
                    p.generation, p.variant, p.score
                )
            })
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} variants {}/{}  summaries {}/{}  {}  champion: {}",
            key.label(),
            variants,
            config.spectrum_steps,
            summaries,
            config.spectrum_steps,
            ranked,
            champion
        );
    }
    true
}

fn cmd_leaderboard(args: &[String]) -> bool {
    if args.len() < 2 {
        eprintln!("Usage: spectrum leaderboard <config> <generation>");
        return false;
    }
    let Some(config) = load_config(&args[0]) else {
        return false;
    };
    let Some(gen) = parse_generation(args.get(1)) else {
        return false;
    };
    let layout = ModelsLayout::new(&config.models_root);
    let path = layout.leaderboard(gen);
    if !path.exists() {
        println!("\n  No leaderboard for generation {} yet", gen);
        return true;
    }
    match storage::read_json::<Vec<LeaderboardEntry>>(&path) {
        Ok(board) => {
            println!("\n  Leaderboard, generation {}:", gen);
            println!("  {}", "-".repeat(60));
            for (place, entry) in board.iter().enumerate() {
                println!(
                    "  {:>2}. {:<10} {:<14} variant {:<4} {:>10.4}",
                    place + 1,
                    entry.num_type,
                    entry.mode,
                    entry.variant,
                    entry.mean_progress
                );
            }
            true
        }
        Err(e) => {
            eprintln!("  {}", e);
            false
        }
    }
}

async fn cmd_scan(args: &[String]) -> bool {
    if args.is_empty() {
        eprintln!("Usage: spectrum scan <config>");
        return false;
    }
    let Some(config) = load_config(&args[0]) else {
        return false;
    };
    let snapshot = scan(&config.scan_config()).await;
    println!("\n  Planets ({}):", snapshot.planets.len());
    for planet in &snapshot.planets {
        println!(
            "  {:<16} ({:.1}, {:.1}, {:.1})  on {}:{}",
            planet.name,
            planet.position[0],
            planet.position[1],
            planet.position[2],
            planet.host,
            planet.port
        );
    }
    println!("\n  Live units ({}):", snapshot.total_units());
    for (host, units) in &snapshot.units_by_host {
        println!("  {:<24} {}", host, units.len());
    }
    true
}

async fn cmd_probe(args: &[String]) -> bool {
    if args.is_empty() {
        eprintln!("Usage: spectrum probe <config>");
        return false;
    }
    let Some(config) = load_config(&args[0]) else {
        return false;
    };
    let endpoint = config.endpoint();
    match probe_with_retries(
        &endpoint.address,
        endpoint.timeout,
        Duration::from_millis(config.runtime.probe_delay_ms),
        config.runtime.probe_attempts,
    )
    .await
    {
        Ok(attempt) => {
            println!("\n  {} reachable (attempt {})", endpoint.address, attempt);
            true
        }
        Err(e) => {
            eprintln!("  {}", spectrum_core::EvolveError::from(e));
            false
        }
    }
}
