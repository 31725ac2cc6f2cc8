use std::process::ExitCode;

use clap::{Parser, Subcommand};

use town::commands::GlobalArgs;
use town::commands::bead::BeadCommand;
use town::commands::doctor::DoctorArgs;
use town::commands::escalation::{EscalateArgs, EscalationsArgs};
use town::commands::init::InitArgs;
use town::commands::rig::RigCommand;
use town::commands::run::RunArgs;
use town::commands::sling::SlingArgs;
use town::commands::status::StatusArgs;
use town::commands::tick::TickArgs;
use town::error::TownError;
use town::{commands, telemetry};

#[derive(Debug, Parser)]
#[command(
    name = "town",
    version,
    about = "Per-town control plane for containerized coding agents"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a new town in the data directory
    Init(InitArgs),
    /// Host every town and run their schedulers until interrupted
    Run(RunArgs),
    /// Run one scheduler tick against a town
    Tick(TickArgs),
    /// Show town counts and agents
    Status(StatusArgs),
    /// Manage rigs (repositories attached to the town)
    Rig {
        #[command(subcommand)]
        command: RigCommand,
    },
    /// Create, list and close beads
    Bead {
        #[command(subcommand)]
        command: BeadCommand,
    },
    /// Create a bead on a rig and hook it to a polecat
    Sling(SlingArgs),
    /// Raise an escalation
    Escalate(EscalateArgs),
    /// List or acknowledge escalations
    Escalations(EscalationsArgs),
    /// Check settings, token secret and the container runtime
    Doctor(DoctorArgs),
    /// Print the JSON Schema for town.toml
    Schema,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Init(_) => "init",
            Self::Run(_) => "run",
            Self::Tick(_) => "tick",
            Self::Status(_) => "status",
            Self::Rig { .. } => "rig",
            Self::Bead { .. } => "bead",
            Self::Sling(_) => "sling",
            Self::Escalate(_) => "escalate",
            Self::Escalations(_) => "escalations",
            Self::Doctor(_) => "doctor",
            Self::Schema => "schema",
        }
    }
}

fn main() -> ExitCode {
    let _telemetry = telemetry::init();

    let cli = Cli::parse();

    let _span = tracing::info_span!("command", name = cli.command.name()).entered();

    let global = &cli.global;
    let result = match &cli.command {
        Commands::Init(args) => args.execute(global),
        Commands::Run(args) => args.execute(global),
        Commands::Tick(args) => args.execute(global),
        Commands::Status(args) => args.execute(global),
        Commands::Rig { command } => command.execute(global),
        Commands::Bead { command } => command.execute(global),
        Commands::Sling(args) => args.execute(global),
        Commands::Escalate(args) => args.execute(global),
        Commands::Escalations(args) => args.execute(global),
        Commands::Doctor(args) => args.execute(global),
        Commands::Schema => commands::schema::run_schema(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            e.downcast_ref::<TownError>()
                .map_or(ExitCode::FAILURE, TownError::exit_code)
        }
    }
}
