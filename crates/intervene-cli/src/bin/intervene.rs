//! Intervene CLI - simulate and fit causal learning agents
//!
//! Usage:
//!   intervene simulate --variables 3 --steps 60 --ground-truth 1,0,0,0,0,-1
//!   intervene fit --trials trials.json [--config agent.json] [-o json]
//!   intervene sweep --trials trials.json --parameter theta --values 0.25,0.5,1
//!
//! Trial files hold a JSON array of trials; `simulate -o json` writes one.
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use clap::{Parser, Subcommand};
use intervene_core::config::AgentConfig;
use intervene_core::fitting::{aggregate_log_likelihood, sweep, SweepParameter, TrialFit};
use intervene_core::{fit_trials, Experiment, RunSummary, TrialData};
use serde::Serialize;
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "intervene")]
#[command(version)]
#[command(about = "Intervene - causal learning agents on attractor networks")]
#[command(long_about = "Simulate active causal learners and fit them to recorded trials")]
struct Cli {
    /// Agent configuration (JSON); defaults apply to missing fields
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<String>,

    /// Output format: summary or json
    #[arg(short, long, global = true, default_value = "summary", value_name = "FORMAT")]
    output: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run agents in generative mode
    Simulate {
        /// Number of variables
        #[arg(short = 'k', long, default_value_t = 3)]
        variables: usize,

        /// Trial length
        #[arg(short = 'n', long, default_value_t = 60)]
        steps: usize,

        /// True link vector, comma separated
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true, required = true)]
        ground_truth: Vec<f64>,

        /// Number of trials; trial `i` uses seed `seed + i`
        #[arg(long, default_value_t = 1)]
        trials: usize,

        /// Participant label written into the trials
        #[arg(long, default_value = "simulated")]
        participant: String,
    },
    /// Fit the configuration to recorded trials
    Fit {
        /// Trial file (JSON array)
        #[arg(short, long, value_name = "FILE")]
        trials: String,
    },
    /// Fit across a grid of one parameter
    Sweep {
        #[arg(short, long, value_name = "FILE")]
        trials: String,

        /// smoothing, temperature, theta or sigma
        #[arg(short, long)]
        parameter: SweepParameter,

        /// Grid values, comma separated
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true, required = true)]
        values: Vec<f64>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    configure_threads();

    let config = match &cli.config {
        Some(path) => match read_json::<AgentConfig>(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Error reading config '{}': {}", path, e);
                process::exit(1);
            }
        },
        None => AgentConfig::default(),
    };
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        process::exit(1);
    }

    match &cli.command {
        Command::Simulate {
            variables,
            steps,
            ground_truth,
            trials,
            participant,
        } => simulate(&cli, &config, *variables, *steps, ground_truth, *trials, participant),
        Command::Fit { trials } => fit(&cli, &config, trials),
        Command::Sweep {
            trials,
            parameter,
            values,
        } => run_sweep(&cli, &config, trials, *parameter, values),
    }
}

/// Sizes the global rayon pool from `RAYON_NUM_THREADS` when it is set.
fn configure_threads() {
    let Ok(raw) = std::env::var("RAYON_NUM_THREADS") else {
        return;
    };
    match raw.parse::<usize>() {
        Ok(threads) => {
            if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
                eprintln!("Error configuring thread pool: {}", e);
            }
        }
        Err(_) => eprintln!("Ignoring RAYON_NUM_THREADS='{}': not a number", raw),
    }
}

fn simulate(
    cli: &Cli,
    config: &AgentConfig,
    variables: usize,
    steps: usize,
    ground_truth: &[f64],
    trials: usize,
    participant: &str,
) {
    let mut runs = Vec::with_capacity(trials);
    for i in 0..trials {
        let trial_config = AgentConfig {
            seed: config.seed.wrapping_add(i as u64),
            ..config.clone()
        };
        let run = trial_config
            .build_agent(steps, variables, None)
            .and_then(|agent| {
                let env = trial_config.build_environment(steps, variables, ground_truth)?;
                Experiment::new(agent, env)?.run()
            });
        match run {
            Ok(run) => {
                info!(trial = i, map = ?run.map, "simulated");
                runs.push(run);
            }
            Err(e) => {
                eprintln!("Error simulating trial {}: {}", i, e);
                process::exit(1);
            }
        }
    }

    match cli.output.as_str() {
        "json" => {
            let trials: Vec<TrialData> = runs
                .iter()
                .map(|run| TrialData::from_run(run, participant))
                .collect();
            print_json(&trials);
        }
        _ => {
            for (i, run) in runs.iter().enumerate() {
                print_run_summary(i, run);
            }
        }
    }
}

fn print_run_summary(index: usize, run: &RunSummary) {
    let interventions = run.interventions.iter().filter(|iv| iv.is_some()).count();
    let correct = run
        .map
        .iter()
        .zip(&run.ground_truth)
        .filter(|(m, g)| m == g)
        .count();
    println!("✓ Trial {}", index);
    println!("  steps:          {}", run.interventions.len());
    println!("  interventions:  {}", interventions);
    println!(
        "  entropy:        {:.4} -> {:.4} bits",
        run.entropy_history.first().copied().unwrap_or(f64::NAN),
        run.entropy_history.last().copied().unwrap_or(f64::NAN)
    );
    println!("  ground truth:   {:?}", run.ground_truth);
    println!("  MAP:            {:?}", run.map);
    println!("  links correct:  {}/{}", correct, run.ground_truth.len());
}

fn fit(cli: &Cli, config: &AgentConfig, path: &str) {
    let trials = load_trials(path);
    let batch = fit_trials(config, &trials);
    for (index, err) in &batch.failed {
        eprintln!("Skipped trial {}: {}", index, err);
    }
    let aggregate = aggregate_log_likelihood(&batch.fits);

    match cli.output.as_str() {
        "json" => {
            #[derive(Serialize)]
            struct FitOutput<'a> {
                fits: &'a [TrialFit],
                aggregate: &'a intervene_core::fitting::Aggregate,
                failed: Vec<usize>,
            }
            print_json(&FitOutput {
                fits: &batch.fits,
                aggregate: &aggregate,
                failed: batch.failed.iter().map(|(i, _)| *i).collect(),
            });
        }
        _ => {
            println!("✓ Fitted {} of {} trials\n", batch.fits.len(), trials.len());
            for fit in &batch.fits {
                println!(
                    "  [{}] {}: actions {:.4}, judgements {}",
                    fit.index,
                    fit.participant,
                    fit.summary.action_log_likelihood,
                    fit.summary
                        .judgement_log_likelihood
                        .map_or_else(|| "-".to_string(), |j| format!("{:.4}", j))
                );
            }
            println!(
                "\nLog-likelihood: {:.4} ({} included, {} excluded)",
                aggregate.log_likelihood, aggregate.included, aggregate.excluded
            );
        }
    }
}

fn run_sweep(cli: &Cli, config: &AgentConfig, path: &str, parameter: SweepParameter, values: &[f64]) {
    let trials = load_trials(path);
    let points = match sweep(config, &trials, parameter, values) {
        Ok(points) => points,
        Err(e) => {
            eprintln!("Error running sweep over {}: {}", parameter, e);
            process::exit(1);
        }
    };

    match cli.output.as_str() {
        "json" => print_json(&points),
        _ => {
            println!("✓ Sweep over {} ({} trials)\n", parameter, trials.len());
            for point in &points {
                println!(
                    "  {} = {:<10} log-likelihood {:.4} ({} excluded, {} failed)",
                    parameter,
                    point.value,
                    point.aggregate.log_likelihood,
                    point.aggregate.excluded,
                    point.failed
                );
            }
            let best = points
                .iter()
                .filter(|p| p.aggregate.log_likelihood.is_finite())
                .max_by(|a, b| a.aggregate.log_likelihood.total_cmp(&b.aggregate.log_likelihood));
            if let Some(best) = best {
                println!("\nBest: {} = {}", parameter, best.value);
            }
        }
    }
}

fn load_trials(path: &str) -> Vec<TrialData> {
    match read_json::<Vec<TrialData>>(path) {
        Ok(trials) => trials,
        Err(e) => {
            eprintln!("Error reading trials '{}': {}", path, e);
            process::exit(1);
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&text).map_err(|e| e.to_string())
}

fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing to JSON: {}", e);
            process::exit(1);
        }
    }
}
