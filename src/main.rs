//! Federated simulation CLI - Run a simulation from JSON configuration.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::fs;
use std::path::PathBuf;

use fedsim::{FederatedConfig, Simulation};

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json>", args[0]);
        eprintln!();
        eprintln!("Run a federated learning simulation from JSON configuration.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to simulation configuration file");
        eprintln!();
        eprintln!("Example configuration is printed with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let config: FederatedConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });

    println!("Federated Simulation");
    println!("====================");
    println!(
        "Participants: {} (C = {}, E = {})",
        config.num_participants, config.participation, config.local_epochs
    );
    println!("Rounds: {}", config.rounds);
    println!("Aggregator: {:?}", config.aggregator);
    println!("Partition: {:?}", config.dataset.partition);
    println!();

    let mut simulation = Simulation::from_config(config).unwrap_or_else(|e| {
        eprintln!("Error setting up simulation: {}", e);
        std::process::exit(1);
    });
    println!("Seed: {}", simulation.seed());
    println!("Running...");

    let result = simulation.run().unwrap_or_else(|e| {
        eprintln!("Simulation failed: {}", e);
        std::process::exit(1);
    });

    println!();
    for (round, (loss, acc)) in result
        .history
        .val_loss
        .iter()
        .zip(&result.history.val_acc)
        .enumerate()
    {
        println!("  Round {}: val_loss={:.4}, val_acc={:.4}", round + 1, loss, acc);
    }
    println!();
    println!("Time: {:.2}s", result.elapsed_seconds);
}

fn print_example_config() {
    let config = FederatedConfig::default();

    println!("Example configuration (config.json):");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing config: {}", e),
    }
}
