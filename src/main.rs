// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use oxherd::{ArtifactStore, Flake, ToolConfig};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::exit;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  oxherd [options] <oxherd-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        match self.command {
            Command::Select(opts) => run_select(opts),
            Command::Precache(opts) => run_precache(opts),
            Command::Machine(opts) => run_machine(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    #[command(override_usage = "oxherd select [options] <flake_ref> <selector>")]
    Select(SelectOptions),

    #[command(override_usage = "oxherd precache [options] <flake_ref> <selector>...")]
    Precache(PrecacheOptions),

    #[command(override_usage = "oxherd machine [options] <flake_ref> <machine> <selector>")]
    Machine(MachineOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SelectOptions {
    #[arg(value_name = "flake_ref")]
    pub flake: String,

    #[arg(value_name = "selector")]
    pub selector: String,

    #[arg(short, long, value_name = "option")]
    pub option: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PrecacheOptions {
    #[arg(value_name = "flake_ref")]
    pub flake: String,

    #[arg(value_name = "selector", required = true)]
    pub selectors: Vec<String>,

    #[arg(short, long, value_name = "option")]
    pub option: Vec<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct MachineOptions {
    #[arg(value_name = "flake_ref")]
    pub flake: String,

    #[arg(value_name = "machine")]
    pub machine: String,

    #[arg(value_name = "selector")]
    pub selector: String,

    #[arg(short, long, value_name = "option")]
    pub option: Vec<String>,
}

fn main() {
    let layer = fmt::layer().compact();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry().with(layer).with(filter).init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn build_flake(identifier: String, extra_options: Vec<String>) -> Result<Flake> {
    let config = ToolConfig::load_default()?;

    let mut flake = Flake::new(identifier);
    if let Some(store_dir) = config.store_dir {
        flake = flake.with_artifact_store(ArtifactStore::new(store_dir));
    }
    if let Some(cache_dir) = config.cache_dir {
        flake = flake.with_cache_root(cache_dir);
    }

    let mut options = config.evaluator.options;
    options.extend(extra_options);
    Ok(flake.with_options(options))
}

fn run_select(opts: SelectOptions) -> Result<()> {
    let mut flake = build_flake(opts.flake, opts.option)?;
    let value = flake.select(&opts.selector)?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    Ok(())
}

fn run_precache(opts: PrecacheOptions) -> Result<()> {
    let mut flake = build_flake(opts.flake, opts.option)?;
    let selectors: Vec<&str> = opts.selectors.iter().map(String::as_str).collect();
    flake.precache(&selectors)?;

    Ok(())
}

fn run_machine(opts: MachineOptions) -> Result<()> {
    let mut flake = build_flake(opts.flake, opts.option)?;
    let value = flake.select_machine(&opts.machine, &opts.selector)?;
    println!("{}", serde_json::to_string_pretty(&value)?);

    Ok(())
}
