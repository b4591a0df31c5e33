//! Tradepost CLI binary

use anyhow::Context;
use clap::Parser;
use tradepost::cli::{Cli, Commands, SimulationApp, TradePlan};
use tradepost::{ActorId, Role, TradeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TradeConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => TradeConfig::default(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Simulate {
            initiator,
            counterpart,
            give,
            take,
            slots,
            solo,
        } => {
            let plan = TradePlan {
                initiator: ActorId::new(initiator),
                counterpart: ActorId::new(counterpart),
                give,
                take,
                storage_slots: slots,
                solo,
            };

            tracing::info!(
                "Simulating trade between {} and {}",
                plan.initiator,
                if plan.solo { &plan.initiator } else { &plan.counterpart }
            );

            let app = SimulationApp::new(config, &plan)?;
            let report = app.run(&plan).await?;

            if report.result.success {
                println!("{}", report.result.message);
            } else {
                println!(
                    "{}: {}",
                    plan.initiator,
                    report.result.notice_for(Role::Initiator)
                );
                if !plan.solo {
                    println!(
                        "{}: {}",
                        plan.counterpart,
                        report.result.notice_for(Role::Counterpart)
                    );
                }
            }

            let mut actors: Vec<_> = report.after.keys().collect();
            actors.sort();
            for actor in actors {
                println!("{}:", actor);
                let before = report.before.get(actor);
                for (kind, quantity) in &report.after[actor] {
                    let had = before.and_then(|b| b.get(kind)).copied().unwrap_or(0);
                    println!("  {:<16} {:>6} (was {})", kind.as_str(), quantity, had);
                }
                if let Some(before) = before {
                    for (kind, had) in before {
                        if !report.after[actor].contains_key(kind) {
                            println!("  {:<16} {:>6} (was {})", kind.as_str(), 0, had);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
