mod demo;

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shoal::{Agent, Config, Coordinator, Trainer, bail_assert, util::env};
use tracing::{error_span, info, level_filters::LevelFilter};

use crate::demo::{DemoEvolver, sphere};

#[derive(Parser)]
#[clap(version)]
#[command(about = "🐟 Shoal - Distributed Fitness Evaluation 🐟")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default shoal.toml in the current directory, or in a new one if a path is given
    Init {
        /// Path to initialize in
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Validate a config file
    Validate {
        /// Config file
        #[arg(default_value = "shoal.toml")]
        config: PathBuf,
    },
    /// Run the coordinator and train the demo population
    Coordinator {
        /// Config file, defaults are used if it does not exist
        #[arg(short, long, default_value = "shoal.toml")]
        config: PathBuf,
        /// Address to listen on
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on, 0 picks a free one
        #[arg(short, long)]
        port: Option<u16>,
        /// Number of generations to train for
        #[arg(short, long)]
        generations: Option<usize>,
        /// Number of genomes per generation
        #[arg(long)]
        population_size: Option<usize>,
    },
    /// Run a worker that evaluates the demo fitness function
    Worker {
        /// Config file, defaults are used if it does not exist
        #[arg(short, long, default_value = "shoal.toml")]
        config: PathBuf,
        /// Coordinator address (e.g. 192.168.0.42:5556)
        #[arg(short('a'), long)]
        coordinator: Option<String>,
        /// Worker id sent to the coordinator, defaults to worker-<pid>
        #[arg(long)]
        id: Option<String>,
        /// Number of genomes to evaluate concurrently
        #[arg(short('n'), long)]
        capacity: Option<u32>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match std::env::var("SHOAL_LOG")
        .unwrap_or_else(|_| "INFO".to_string())
        .to_uppercase()
        .as_str()
    {
        "OFF" => LevelFilter::OFF,
        "ERROR" => LevelFilter::ERROR,
        "WARN" => LevelFilter::WARN,
        "INFO" => LevelFilter::INFO,
        "DEBUG" => LevelFilter::DEBUG,
        "TRACE" => LevelFilter::TRACE,
        x => {
            eprintln!("Invalid log level: {}", x);
            eprintln!("Using default log level: INFO");
            LevelFilter::INFO
        }
    };

    match args.command {
        Commands::Init { path } => {
            fs::create_dir_all(&path)?;
            let config_path = path.join("shoal.toml");
            bail_assert!(
                !config_path.exists(),
                "`{}` already exists",
                config_path.display()
            );
            fs::write(&config_path, include_bytes!("../templates/shoal.toml"))?;

            println!(
                "🐟 Initialized Shoal config in {}",
                path.canonicalize()?.display()
            );
        }
        Commands::Validate { config: cpath } => {
            Config::load(&cpath)?;
            println!("✅ Config `{}` is valid", cpath.display());
        }
        Commands::Coordinator {
            config,
            host,
            port,
            generations,
            population_size,
        } => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_max_level(log_level)
                .init();

            let mut config = Config::load_or_default(&config)?;
            if let Some(host) = host {
                config.coordinator.host = host;
            }
            if let Some(port) = port {
                config.coordinator.port = port;
            }
            if let Some(g) = generations {
                config.trainer.generations = g;
            }
            if let Some(p) = population_size {
                config.trainer.population_size = p;
            }
            config.coordinator.validate()?;
            config.trainer.validate()?;

            let coordinator = Coordinator::bind(config.coordinator)?;
            let mut evolver = DemoEvolver::new(&config.trainer);
            let population = evolver.random_population(config.trainer.population_size)?;

            let trainer = Trainer::new(config.trainer);
            let report = error_span!("trainer").in_scope(|| {
                trainer.run(&coordinator, &mut evolver, population)
            });
            coordinator.shutdown();
            let report = report?;

            match report.best_fitness() {
                Some(f) => println!(
                    "✅ Training finished ({}), best fitness {:.6}",
                    report.finish_reason, f
                ),
                None => println!(
                    "❌ Training finished ({}) without a single evaluated genome",
                    report.finish_reason
                ),
            }
        }
        Commands::Worker {
            config,
            coordinator,
            id,
            capacity,
        } => {
            tracing_subscriber::fmt()
                .with_target(false)
                .with_max_level(log_level)
                .init();

            let mut config = Config::load_or_default(&config)?.worker;
            config.coordinator = match coordinator {
                Some(x) => x,
                None => env("SHOAL_COORDINATOR").unwrap_or(config.coordinator),
            };
            if id.is_some() {
                config.worker_id = id;
            }
            if let Some(c) = capacity {
                config.capacity = c;
            }
            config
                .validate()
                .context("Invalid worker configuration")?;

            info!("Evaluating the demo sphere function");
            Agent::new(config, sphere).run()?;
        }
    }

    Ok(())
}
