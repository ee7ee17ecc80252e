//! `ralph` command-line entry point.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use ralph::engine::{EngineSettings, LoopEngine};
use ralph::exit_codes;
use ralph::io::agent::AgentInvoker;
use ralph::io::config::{CONFIG_FILE_NAME, RalphConfig, RunPaths, load_config};
use ralph::io::context::ContextBuilder;
use ralph::io::git::Git;
use ralph::io::init::{InitOptions, init_project};
use ralph::io::task_store::{TaskStore, list_markdown};
use ralph::io::validation::ShellValidator;
use ralph::logging;
use ralph::observer::TracingObserver;

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Run AI coding agents against a queue of Markdown tasks until validation passes"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Debug, Clone, Default)]
struct GlobalArgs {
    /// Path to ralph.toml (defaults to ./ralph.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging.
    #[arg(long, global = true, conflicts_with = "quiet")]
    debug: bool,

    /// Only warnings and errors.
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process pending tasks (the default command).
    Run {
        /// Only run this task (file name, name without `.md`, or unique prefix).
        #[arg(long)]
        task: Option<String>,
    },
    /// List tasks by state.
    List,
    /// Create task directories, seed personas and write ralph.toml.
    Init {
        /// Default provider to record in ralph.toml.
        #[arg(long)]
        provider: Option<String>,
        /// Default model to record in ralph.toml.
        #[arg(long)]
        model: Option<String>,
    },
}

impl GlobalArgs {
    fn log_level(&self) -> Option<&'static str> {
        if self.debug {
            Some("debug")
        } else if self.quiet {
            Some("warn")
        } else {
            None
        }
    }

    /// Config file path and the project root it lives in.
    fn locate(&self) -> Result<(PathBuf, PathBuf)> {
        let cwd = env::current_dir().context("resolve current directory")?;
        let config_path = match &self.config {
            Some(path) => cwd.join(path),
            None => cwd.join(CONFIG_FILE_NAME),
        };
        let root = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(cwd);
        Ok((config_path, root))
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.global.log_level());
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command.unwrap_or(Command::Run { task: None }) {
        Command::Run { task } => cmd_run(&cli.global, task.as_deref()),
        Command::List => cmd_list(&cli.global),
        Command::Init { provider, model } => cmd_init(&cli.global, provider, model),
    }
}

fn cmd_run(global: &GlobalArgs, task: Option<&str>) -> Result<i32> {
    let (config_path, root) = global.locate()?;
    let cfg = load_config(&config_path)?;
    let paths = RunPaths::resolve(&root, &cfg.dirs);

    let git = Git::new(&root);
    if !git.is_repo() {
        bail!("{} is not inside a git repository", root.display());
    }
    ensure_clean(&git, &cfg)?;
    if !paths.todo.is_dir() {
        warn!(dir = %paths.todo.display(), "todo directory missing; run `ralph init`");
    }
    if cfg.provider.is_none() {
        warn!("no default provider configured; tasks must set `provider`");
    }

    let agent = AgentInvoker::new(cfg.registry()?, cfg.model.clone())
        .with_output_limit(cfg.agent_output_limit_bytes)
        .with_workdir(&root);
    let engine = LoopEngine::new(
        TaskStore::new(&paths.todo, &paths.done, &paths.failed),
        ContextBuilder::new(&paths.personas, &paths.context, cfg.persona.clone()),
        agent,
        ShellValidator::in_dir(&root),
        git,
        EngineSettings::from_config(&cfg),
    );

    let summary = engine.run_all(task, &mut TracingObserver)?;
    info!(
        done = summary.done(),
        failed = summary.failed(),
        "run finished"
    );
    for outcome in &summary.tasks {
        println!("{} {}", outcome.status, outcome.file_name);
    }
    Ok(if summary.has_failures() {
        exit_codes::TASK_FAILED
    } else {
        exit_codes::OK
    })
}

/// Refuse to run on a dirty worktree; the context directory is exempt.
fn ensure_clean(git: &Git, cfg: &RalphConfig) -> Result<()> {
    let dirty = git.dirty_entries(&[cfg.dirs.context.as_path()])?;
    if dirty.is_empty() {
        return Ok(());
    }
    let mut msg = String::from("working tree not clean; commit or stash first:\n");
    for entry in dirty {
        msg.push_str(&format!("{} {}\n", entry.code, entry.path));
    }
    bail!(msg.trim_end().to_string())
}

fn cmd_list(global: &GlobalArgs) -> Result<i32> {
    let (config_path, root) = global.locate()?;
    let cfg = load_config(&config_path)?;
    let paths = RunPaths::resolve(&root, &cfg.dirs);
    for (label, dir) in [("todo", &paths.todo), ("done", &paths.done), ("failed", &paths.failed)] {
        let names = list_markdown(dir)?;
        println!("{label} ({}):", names.len());
        for name in names {
            println!("  {name}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_init(global: &GlobalArgs, provider: Option<String>, model: Option<String>) -> Result<i32> {
    let (_, root) = global.locate()?;
    let report = init_project(&root, &InitOptions { provider, model })?;
    if report.created.is_empty() {
        println!("already initialized ({})", report.config_path.display());
    }
    for path in &report.created {
        let shown = path.strip_prefix(&root).unwrap_or(path);
        println!("created {}", shown.display());
    }
    Ok(exit_codes::OK)
}
