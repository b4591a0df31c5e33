//! CLI command definitions

use crate::types::ResourceEntry;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tradepost")]
#[command(about = "Tradepost - atomic two-party resource trading", long_about = None)]
pub struct Cli {
    /// JSON configuration file (CountdownDuration, RequestTimeout, DefaultMaxStack, Debug)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one trade end to end between two in-memory actors
    Simulate {
        /// Actor sending the request
        #[arg(long, default_value = "alice")]
        initiator: String,

        /// Actor receiving the request
        #[arg(long, default_value = "bob")]
        counterpart: String,

        /// Resources the initiator offers, as kind:quantity (repeatable)
        #[arg(short, long)]
        give: Vec<ResourceEntry>,

        /// Resources the counterpart offers, as kind:quantity (repeatable)
        #[arg(short, long)]
        take: Vec<ResourceEntry>,

        /// Storage slots per actor, besides a 9-slot hotbar
        #[arg(short, long, default_value = "27")]
        slots: usize,

        /// Trade with yourself; needs Debug enabled in the configuration
        #[arg(long)]
        solo: bool,
    },

    /// Print the effective configuration
    Config,
}
