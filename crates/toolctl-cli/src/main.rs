use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use toolctl::config::{CliOverrides, Config};
use toolctl::{ChainStore, RecipeStore};
use toolctl_types::plan::{Answers, ChoiceAnswer, ConfirmationGate};
use toolctl_types::profile::ProbeCategory;

#[derive(Parser, Debug)]
#[command(name = "toolctl", version)]
#[command(about = "Resolves, plans, and executes tool installs across package managers")]
struct Cli {
    /// Directory holding `*.recipe.json` + `catalog.json` (default: .toolctl.toml's [recipes], else "recipes")
    #[arg(long)]
    catalog_dir: Option<PathBuf>,

    /// Directory for chain and plan-state records
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Max escalation depth before a remediation chain refuses to grow further
    #[arg(long)]
    max_depth: Option<u32>,

    /// Path to a `.toolctl.toml` config file (default: look in the current directory)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the fast host profile as JSON.
    Profile,
    /// Print a deep host profile for the given categories (comma-separated; default: all).
    Probe {
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,
    },
    /// Print a tool's resolved choices as JSON.
    Choices { tool_id: String },
    /// Resolve and print an install plan as JSON, without running it.
    Plan {
        tool_id: String,
        /// `choice_id=option_id` pairs, repeatable.
        #[arg(long = "answer")]
        answers: Vec<String>,
    },
    /// Resolve a plan and execute it.
    Install {
        tool_id: String,
        #[arg(long = "answer")]
        answers: Vec<String>,
        /// Print the plan and the steps that would run, without running them.
        #[arg(long)]
        dry_run: bool,
        /// Skip the confirmation gate for medium/high-risk plans.
        #[arg(long)]
        yes: bool,
    },
    /// Resume a previously paused plan from its persisted state.
    Resume { state_id: String },
    /// List escalation chains awaiting a remediation decision.
    Chains,
    /// Cancel a pending escalation chain.
    Cancel { chain_id: String },
    /// Print environment diagnostics: catalog load, chain store, PATH tools.
    Doctor,
}

fn main() -> Result<()> {
    let filter = std::env::var("TOOLCTL_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let workspace_root = std::env::current_dir().context("reading current directory")?;
    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load_from_workspace(&workspace_root)?,
    };
    config.validate()?;

    let overrides = CliOverrides {
        state_dir: cli.state_dir.clone(),
        max_depth: cli.max_depth,
        catalog_dir: cli.catalog_dir.clone(),
        ..Default::default()
    };
    config.apply_probe_ttl(&overrides);

    let catalog_dir = config.catalog_dir(&overrides);
    let store = RecipeStore::load(&catalog_dir)
        .with_context(|| format!("loading recipe catalog from {}", catalog_dir.display()))?;

    let state_dir = config.state_dir(&overrides);
    let chain_store = ChainStore::new(state_dir.clone());

    match cli.cmd {
        Commands::Profile => cmd_profile(),
        Commands::Probe { categories } => cmd_probe(&categories),
        Commands::Choices { tool_id } => cmd_choices(&tool_id, &store),
        Commands::Plan { tool_id, answers } => cmd_plan(&tool_id, &answers, &store),
        Commands::Install { tool_id, answers, dry_run, yes } => {
            cmd_install(&tool_id, &answers, dry_run, yes, &store, &chain_store)
        }
        Commands::Resume { state_id } => cmd_resume(&state_id, &store, &chain_store),
        Commands::Chains => cmd_chains(&chain_store),
        Commands::Cancel { chain_id } => cmd_cancel(&chain_id, &chain_store),
        Commands::Doctor => cmd_doctor(&catalog_dir, &state_dir, &store),
    }
}

fn parse_answers(raw: &[String]) -> Result<Answers> {
    let mut answers = Answers::default();
    for entry in raw {
        let (choice_id, option_id) = entry
            .split_once('=')
            .with_context(|| format!("--answer must be `choice_id=option_id`, got {entry:?}"))?;
        answers.choices.insert(choice_id.to_string(), ChoiceAnswer::Single(option_id.to_string()));
    }
    Ok(answers)
}

fn cmd_profile() -> Result<()> {
    let profile = toolctl::probe::probe_fast();
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

fn cmd_probe(categories: &[String]) -> Result<()> {
    let needed: Vec<ProbeCategory> = if categories.is_empty() {
        ProbeCategory::ALL.to_vec()
    } else {
        categories
            .iter()
            .map(|c| parse_probe_category(c))
            .collect::<Result<Vec<_>>>()?
    };
    let profile = toolctl::probe::probe_fast();
    let profile = toolctl::probe::probe_deep(profile, &needed);
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

fn parse_probe_category(name: &str) -> Result<ProbeCategory> {
    Ok(match name {
        "shell" => ProbeCategory::Shell,
        "init_system" => ProbeCategory::InitSystem,
        "network" => ProbeCategory::Network,
        "build" => ProbeCategory::Build,
        "gpu" => ProbeCategory::Gpu,
        "kernel" => ProbeCategory::Kernel,
        "wsl_interop" => ProbeCategory::WslInterop,
        "services" => ProbeCategory::Services,
        "filesystem" => ProbeCategory::Filesystem,
        "security" => ProbeCategory::Security,
        other => anyhow::bail!("unknown probe category: {other}"),
    })
}

fn cmd_choices(tool_id: &str, store: &RecipeStore) -> Result<()> {
    let profile = toolctl::probe::probe_fast();
    let choices = toolctl::resolver::resolve_choices(tool_id, &profile, store);
    println!("{}", serde_json::to_string_pretty(&choices)?);
    Ok(())
}

fn cmd_plan(tool_id: &str, raw_answers: &[String], store: &RecipeStore) -> Result<()> {
    let answers = parse_answers(raw_answers)?;
    let profile = toolctl::probe::probe_fast();
    let plan = toolctl::resolver::resolve_install_plan_with_choices(tool_id, &profile, store, &answers);
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn cmd_install(
    tool_id: &str,
    raw_answers: &[String],
    dry_run: bool,
    yes: bool,
    store: &RecipeStore,
    chain_store: &ChainStore,
) -> Result<()> {
    let answers = parse_answers(raw_answers)?;
    let profile = toolctl::probe::probe_fast();
    let plan = toolctl::resolver::resolve_install_plan_with_choices(tool_id, &profile, store, &answers);

    if plan.error.is_some() {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        anyhow::bail!("plan could not be resolved for {tool_id}");
    }
    if plan.already_installed {
        println!("{tool_id} is already installed");
        return Ok(());
    }
    if plan.confirmation_gate != ConfirmationGate::None && !yes && !dry_run {
        anyhow::bail!(
            "plan risk is {:?}, which requires confirmation; pass --yes to proceed",
            plan.risk_summary.level
        );
    }

    let ctx = toolctl::executor::ExecutionContext {
        sudo_password: std::env::var("TOOLCTL_SUDO_PASSWORD").ok(),
        dry_run,
        timeout_override: None,
    };
    let events = toolctl::executor::execute(&plan, &ctx, 0, &profile, store, Some(chain_store));
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

fn cmd_resume(state_id: &str, store: &RecipeStore, chain_store: &ChainStore) -> Result<()> {
    let Some(state) = chain_store.load_plan_state(state_id)? else {
        anyhow::bail!("no persisted plan state for {state_id}");
    };
    let profile = toolctl::probe::probe_fast();
    let ctx = toolctl::executor::ExecutionContext {
        sudo_password: std::env::var("TOOLCTL_SUDO_PASSWORD").ok(),
        dry_run: false,
        timeout_override: None,
    };
    let events = toolctl::executor::execute_resume(&state, &ctx, &profile, store, Some(chain_store));
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

fn cmd_chains(chain_store: &ChainStore) -> Result<()> {
    let pending = chain_store.list_pending_chains()?;
    println!("{}", serde_json::to_string_pretty(&pending)?);
    Ok(())
}

fn cmd_cancel(chain_id: &str, chain_store: &ChainStore) -> Result<()> {
    chain_store.cancel_chain(chain_id)?;
    println!("cancelled {chain_id}");
    Ok(())
}

fn cmd_doctor(catalog_dir: &std::path::Path, state_dir: &std::path::Path, store: &RecipeStore) -> Result<()> {
    println!("catalog_dir: {}", catalog_dir.display());
    println!("recipes loaded: {}", store.tool_ids().len());
    println!("state_dir: {}", state_dir.display());

    let profile = toolctl::probe::probe_fast();
    println!("distro: {:?}", profile.fast.distro);
    println!("primary package manager: {:?}", profile.primary_pm());
    println!();

    for cmd in ["git", "which"] {
        print_cmd_version(cmd);
    }
    Ok(())
}

fn print_cmd_version(cmd: &str) {
    match Command::new(cmd).arg("--version").output() {
        Ok(out) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
            println!("{cmd}: {text}");
        }
        Ok(out) => {
            tracing::warn!(cmd, stderr = %String::from_utf8_lossy(&out.stderr), "--version failed");
        }
        Err(e) => {
            tracing::warn!(cmd, error = %e, "unable to run --version");
        }
    }
}
