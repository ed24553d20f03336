//! Microgrid market simulator entry point: CLI wiring and config-driven runs.

use std::path::{Path, PathBuf};
use std::process;

use tracing::Level;

use microgrid_market::config::ScenarioConfig;
use microgrid_market::io::export::{export_flows_csv, export_ledger_csv};
use microgrid_market::runner::{Prepared, build_engine, run_prepared};
use microgrid_market::sim::snapshot::JsonFileSink;

/// Parsed CLI arguments.
struct CliArgs {
    scenario_path: Option<String>,
    preset: Option<String>,
    seed_override: Option<u64>,
    feed_path: Option<String>,
    flows_out: Option<String>,
    ledger_out: Option<String>,
    snapshot_out: Option<String>,
    verbose: bool,
    #[cfg(feature = "api")]
    serve: bool,
    #[cfg(feature = "api")]
    port: u16,
}

fn print_help() {
    eprintln!("microgrid-market: peer-to-peer microgrid energy market simulator");
    eprintln!();
    eprintln!("Usage: microgrid-market [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>        Load scenario from TOML config file");
    eprintln!(
        "  --preset <name>          Use a built-in preset ({})",
        ScenarioConfig::PRESETS.join(", ")
    );
    eprintln!("  --seed <u64>             Override random seed");
    eprintln!("  --feed <path>            Read generation, load, and grid state from CSV");
    eprintln!("  --flows-out <path>       Export settled flows to CSV");
    eprintln!("  --ledger-out <path>      Export per-tick participant state to CSV");
    eprintln!("  --snapshot-out <path>    Keep the latest state snapshot as JSON");
    eprintln!("  --verbose                Log every flow and policy decision");
    #[cfg(feature = "api")]
    {
        eprintln!("  --serve                  Start REST API server after the run");
        eprintln!("  --port <u16>             API server port (default: 3000)");
    }
    eprintln!("  --help                   Show this help message");
    eprintln!();
    eprintln!("If no --scenario or --preset is given, the baseline preset is used.");
}

/// Returns the value following flag `args[*i]`, or exits with an error.
fn value_of(args: &[String], i: &mut usize, what: &str) -> String {
    let flag = &args[*i];
    *i += 1;
    match args.get(*i) {
        Some(v) => v.clone(),
        None => {
            eprintln!("error: {flag} requires {what}");
            process::exit(1);
        }
    }
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        scenario_path: None,
        preset: None,
        seed_override: None,
        feed_path: None,
        flows_out: None,
        ledger_out: None,
        snapshot_out: None,
        verbose: false,
        #[cfg(feature = "api")]
        serve: false,
        #[cfg(feature = "api")]
        port: 3000,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--scenario" => cli.scenario_path = Some(value_of(&args, &mut i, "a path argument")),
            "--preset" => cli.preset = Some(value_of(&args, &mut i, "a name argument")),
            "--seed" => {
                let raw = value_of(&args, &mut i, "a u64 argument");
                if let Ok(s) = raw.parse::<u64>() {
                    cli.seed_override = Some(s);
                } else {
                    eprintln!("error: --seed value \"{raw}\" is not a valid u64");
                    process::exit(1);
                }
            }
            "--feed" => cli.feed_path = Some(value_of(&args, &mut i, "a path argument")),
            "--flows-out" => cli.flows_out = Some(value_of(&args, &mut i, "a path argument")),
            "--ledger-out" => cli.ledger_out = Some(value_of(&args, &mut i, "a path argument")),
            "--snapshot-out" => {
                cli.snapshot_out = Some(value_of(&args, &mut i, "a path argument"));
            }
            "--verbose" | "-v" => cli.verbose = true,
            #[cfg(feature = "api")]
            "--serve" => {
                cli.serve = true;
            }
            #[cfg(feature = "api")]
            "--port" => {
                let raw = value_of(&args, &mut i, "a u16 argument");
                if let Ok(p) = raw.parse::<u16>() {
                    cli.port = p;
                } else {
                    eprintln!("error: --port value \"{raw}\" is not a valid u16");
                    process::exit(1);
                }
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn main() {
    let cli = parse_args();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Load config: --scenario takes priority, then --preset, then baseline default
    let mut scenario = if let Some(ref path) = cli.scenario_path {
        match ScenarioConfig::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else if let Some(ref name) = cli.preset {
        match ScenarioConfig::from_preset(name) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        ScenarioConfig::baseline()
    };

    if let Some(seed) = cli.seed_override {
        scenario.simulation.seed = seed;
    }
    if let Some(ref path) = cli.feed_path {
        scenario.feed.path = Some(PathBuf::from(path));
    }

    // Validate
    let errors = scenario.validate();
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("{e}");
        }
        process::exit(1);
    }

    // Build and run
    let Prepared {
        mut engine,
        discrepancies,
    } = match build_engine(&scenario) {
        Ok(prepared) => prepared,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };
    if let Some(ref path) = cli.snapshot_out {
        engine = engine.with_state_sink(JsonFileSink::new(path));
    }
    let prepared = Prepared {
        engine,
        discrepancies,
    };

    let output = match run_prepared(&scenario, prepared, |r| println!("{r}")) {
        Ok(output) => output,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    println!("\n{}", output.kpis);
    println!(
        "Community donations:   {:.2} kWh",
        output.community.total_donated_energy
    );

    if let Some(ref path) = cli.flows_out {
        if let Err(e) = export_flows_csv(&output.reports, Path::new(path)) {
            eprintln!("error: failed to write flows CSV: {e}");
            process::exit(1);
        }
        eprintln!("Flows written to {path}");
    }
    if let Some(ref path) = cli.ledger_out {
        if let Err(e) = export_ledger_csv(&output.reports, Path::new(path)) {
            eprintln!("error: failed to write ledger CSV: {e}");
            process::exit(1);
        }
        eprintln!("Ledger written to {path}");
    }

    // Start API server if requested
    #[cfg(feature = "api")]
    if cli.serve {
        use std::net::SocketAddr;
        use std::sync::Arc;

        let state = Arc::new(microgrid_market::api::AppState::from(output));
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
        let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
            eprintln!("error: failed to create tokio runtime: {e}");
            process::exit(1);
        });
        if let Err(e) = rt.block_on(microgrid_market::api::serve(state, addr)) {
            eprintln!("error: API server failed: {e}");
            process::exit(1);
        }
    }
}
