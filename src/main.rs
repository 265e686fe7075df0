//! mender - self-healing retry loop for browser end-to-end tests
//!
//! Command-line entry point: heals one or many tests, plans todo lists and
//! inspects audit trails.

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use mender::audit::{self, AuditTrail};
use mender::reasoning::build_plan_prompt;
use mender::{
    heal_many, ClaudeReasoner, CommandAdapter, Framework, HealConfig, HealError, HealingSession,
    ReasoningClient, RetryController, SessionVerdict, TestArtifact, TodoList, TodoStatus,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "mender")]
#[command(version)]
#[command(about = "Self-healing retry loop for failing browser end-to-end tests", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".", env = "MENDER_PROJECT_DIR")]
    project_dir: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Heal a single failing test
    Heal {
        /// Test file to heal
        path: PathBuf,

        /// Test framework (inferred from the file name when omitted)
        #[arg(short, long, value_enum)]
        framework: Option<Framework>,

        /// Patch/re-execute cycles allowed after the first run
        #[arg(short, long, env = "MENDER_MAX_ITERATIONS")]
        max_iterations: Option<u32>,

        /// Consecutive unknown diagnoses tolerated (0 disables the rule)
        #[arg(short, long, env = "MENDER_UNKNOWN_TOLERANCE")]
        unknown_tolerance: Option<u32>,

        /// Todo list driving the patch requests
        #[arg(short, long)]
        todo: Option<PathBuf>,

        /// Output the session summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Heal several tests concurrently
    HealAll {
        /// Test files or directories to search for tests
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Concurrent sessions
        #[arg(short, long, env = "MENDER_WORKERS")]
        workers: Option<usize>,

        /// Test framework for files whose framework cannot be inferred
        #[arg(short, long, value_enum)]
        framework: Option<Framework>,

        /// Patch/re-execute cycles allowed after the first run
        #[arg(short, long, env = "MENDER_MAX_ITERATIONS")]
        max_iterations: Option<u32>,
    },

    /// Break a test into planned todo steps
    Plan {
        /// Test file to plan
        path: PathBuf,

        /// Test framework (inferred from the file name when omitted)
        #[arg(short, long, value_enum)]
        framework: Option<Framework>,
    },

    /// Show a todo list
    Todos {
        /// Todo file
        file: PathBuf,
    },

    /// Inspect session audit trails
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Verify the hash chain of an audit file
    Verify {
        /// Audit file
        file: PathBuf,
    },

    /// Show the entries of an audit file
    Show {
        /// Audit file
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "mender=debug,info"
    } else {
        "mender=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            e.chain()
                .find_map(|cause| cause.downcast_ref::<HealError>())
                .map_or(1, HealError::exit_code)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    // Resolve project path
    let project_path = cli
        .project_dir
        .canonicalize()
        .unwrap_or(cli.project_dir.clone());

    if !project_path.is_dir() {
        anyhow::bail!(
            "Project directory does not exist: {}",
            project_path.display()
        );
    }

    match cli.command {
        Commands::Heal {
            path,
            framework,
            max_iterations,
            unknown_tolerance,
            todo,
            json,
        } => {
            let mut config = HealConfig::load(&project_path)?;
            if let Some(max) = max_iterations {
                config.max_iterations = max;
            }
            if let Some(tolerance) = unknown_tolerance {
                config.unknown_tolerance = tolerance;
            }
            config.validate()?;

            let path = resolve(&project_path, &path);
            let framework = framework
                .or_else(|| Framework::infer(&path))
                .unwrap_or(config.framework);
            let artifact = TestArtifact::load(&path, framework)?;

            let todo_path = todo.map(|t| resolve(&project_path, &t));
            let todos = todo_path
                .as_deref()
                .map(TodoList::load)
                .transpose()
                .context("Failed to load todo list")?;

            let config = Arc::new(config);
            let controller = build_controller(&config, &project_path);

            let mut session = HealingSession::new(artifact);
            if let Some(todos) = todos {
                session = session.with_todos(todos);
            }
            controller.heal(&mut session).await;

            if let (Some(todos), Some(todo_path)) = (&session.todos, &todo_path) {
                todos
                    .save_to(todo_path)
                    .with_context(|| format!("Failed to save {}", todo_path.display()))?;
            }

            let audit_path = AuditTrail::new(&config.results_dir)
                .write(&session, &config)
                .context("Failed to write audit trail")?;

            if json {
                let summary = session_summary(&session, &audit_path);
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_session(&session, &audit_path);
            }

            Ok(session.verdict.map_or(1, |v| v.exit_code()))
        }

        Commands::HealAll {
            paths,
            workers,
            framework,
            max_iterations,
        } => {
            let mut config = HealConfig::load(&project_path)?;
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(max) = max_iterations {
                config.max_iterations = max;
            }
            config.validate()?;

            let files = collect_tests(&project_path, &paths);
            if files.is_empty() {
                println!("{} No tests found.", "Heal:".cyan().bold());
                return Ok(0);
            }

            let artifacts = files
                .iter()
                .map(|file| {
                    let framework = Framework::infer(file)
                        .or(framework)
                        .unwrap_or(config.framework);
                    TestArtifact::load(file, framework)
                })
                .collect::<mender::Result<Vec<_>>>()?;

            let config = Arc::new(config);
            let controller = Arc::new(build_controller(&config, &project_path));

            let progress = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]") {
                progress.set_style(style);
            }
            progress.set_message(format!(
                "Healing {} tests with {} workers",
                artifacts.len(),
                config.workers
            ));
            progress.enable_steady_tick(Duration::from_millis(120));

            let sessions = heal_many(controller, artifacts, config.workers).await;
            progress.finish_and_clear();

            let trail = AuditTrail::new(&config.results_dir);
            println!(
                "\n{} {} sessions",
                "Heal:".cyan().bold(),
                sessions.len()
            );
            println!("{}", "─".repeat(60));
            for session in &sessions {
                let audit_path = trail
                    .write(session, &config)
                    .context("Failed to write audit trail")?;
                println!(
                    "   {} {} ({} records)",
                    verdict_label(session.verdict),
                    session.artifact.path.display(),
                    session.records().len()
                );
                if let Some(explanation) = &session.explanation {
                    println!("     {}", explanation.dimmed());
                }
                println!("     audit: {}", audit_path.display());
            }

            let healed = sessions
                .iter()
                .filter(|s| s.verdict == Some(SessionVerdict::Healed))
                .count();
            println!("\n   {healed}/{} healed", sessions.len());

            Ok(sessions
                .iter()
                .map(|s| s.verdict.map_or(1, |v| v.exit_code()))
                .max()
                .unwrap_or(0))
        }

        Commands::Plan { path, framework } => {
            let config = HealConfig::load(&project_path)?;
            config.validate()?;

            let path = resolve(&project_path, &path);
            let framework = framework
                .or_else(|| Framework::infer(&path))
                .unwrap_or(config.framework);
            let artifact = TestArtifact::load(&path, framework)?;

            let reasoner = ClaudeReasoner::from_config(&config.reasoning, &project_path);
            let prompt = build_plan_prompt(&artifact, config.max_prompt_chars);
            let response = tokio::time::timeout(config.reasoning_timeout(), reasoner.run_prompt(&prompt))
                .await
                .map_err(|_| {
                    HealError::reasoning(format!(
                        "planning timed out after {}ms",
                        config.reasoning_timeout_ms
                    ))
                })??;

            let todos = TodoList::from_plan_response(&response, artifact.slug())?;
            let saved = todos.save(&config.todo_dir)?;

            println!(
                "\n{} {} steps for {}",
                "Plan:".cyan().bold(),
                todos.todos.len(),
                artifact.path.display()
            );
            println!("{}", "─".repeat(60));
            for todo in &todos.todos {
                println!("   {}", todo.to_line());
            }
            if !todos.related_scripts.is_empty() {
                println!("\n   Related scripts:");
                for script in &todos.related_scripts {
                    println!("     - {}", script.display());
                }
            }
            println!("\n   Saved to {}", saved.display());
            Ok(0)
        }

        Commands::Todos { file } => {
            let file = resolve(&project_path, &file);
            let todos = TodoList::load(&file)?;

            println!(
                "\n{} {} ({} steps)",
                "Todos:".cyan().bold(),
                todos.id,
                todos.todos.len()
            );
            println!("{}", "─".repeat(60));
            for todo in &todos.todos {
                let line = todo.to_line();
                let line = match todo.status {
                    TodoStatus::Done => line.green(),
                    TodoStatus::Failed => line.red(),
                    TodoStatus::InProgress => line.yellow(),
                    TodoStatus::Pending => line.normal(),
                };
                println!("   {line}");
            }
            println!(
                "\n   pending: {}  in-progress: {}  done: {}  failed: {}",
                todos.count(TodoStatus::Pending),
                todos.count(TodoStatus::InProgress),
                todos.count(TodoStatus::Done),
                todos.count(TodoStatus::Failed)
            );
            Ok(0)
        }

        Commands::Audit { action } => match action {
            AuditAction::Verify { file } => {
                let file = resolve(&project_path, &file);
                let result = audit::verify(&file)?;
                if result.is_valid {
                    println!(
                        "{} {} entries verified",
                        "Valid:".green().bold(),
                        result.entries_verified
                    );
                    Ok(0)
                } else {
                    println!(
                        "{} entry {} failed verification: {}",
                        "Invalid:".red().bold(),
                        result.first_invalid_entry.unwrap_or_default(),
                        result.error_description.unwrap_or_default()
                    );
                    Ok(1)
                }
            }

            AuditAction::Show { file, json } => {
                let file = resolve(&project_path, &file);
                let entries = audit::read_entries(&file)?;

                if json {
                    println!("{}", serde_json::to_string_pretty(&entries)?);
                    return Ok(0);
                }

                println!("\n{} {}", "Audit:".cyan().bold(), file.display());
                println!("{}", "─".repeat(60));
                for entry in &entries {
                    println!(
                        "   [{}] {} {}",
                        entry.sequence,
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                        entry.kind.to_string().bold()
                    );
                    for key in ["artifact", "iteration", "outcome", "verdict", "explanation"] {
                        if let Some(value) = entry.data.get(key) {
                            let value = value
                                .as_str()
                                .map_or_else(|| value.to_string(), str::to_string);
                            println!("       {key}: {value}");
                        }
                    }
                }
                Ok(0)
            }
        },

        Commands::Config { action } => match action {
            ConfigAction::Show { json } => {
                let config = HealConfig::load(&project_path)?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&config)?);
                } else {
                    let path = HealConfig::config_path(&project_path);
                    println!("\n{} {}", "Config:".cyan().bold(), path.display());
                    if !path.exists() {
                        println!("   {}", "(not found, using defaults)".dimmed());
                    }
                    println!("{}", "─".repeat(60));
                    println!("{}", config.to_toml()?);
                }
                Ok(0)
            }

            ConfigAction::Validate => {
                let config = HealConfig::load(&project_path)?;
                config.validate()?;
                println!("{} Configuration is valid", "OK:".green().bold());
                Ok(0)
            }
        },
    }
}

fn build_controller(config: &Arc<HealConfig>, project_path: &Path) -> RetryController {
    let adapter = Arc::new(CommandAdapter::from_config(config, project_path));
    let reasoner = Arc::new(ClaudeReasoner::from_config(&config.reasoning, project_path));
    let controller = RetryController::new(Arc::clone(config), adapter, reasoner);
    cancel_on_ctrl_c(controller.cancellation_token());
    controller
}

/// Cancel running sessions on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{} stopping at the next safe point",
                "Interrupted:".yellow().bold()
            );
            token.cancel();
        }
    });
}

fn resolve(project_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        path.to_path_buf()
    } else {
        project_path.join(path)
    }
}

/// Expand files and directories into the list of test files to heal.
fn collect_tests(project_path: &Path, paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |path: PathBuf| {
        let key = path.canonicalize().unwrap_or_else(|_| path.clone());
        if seen.insert(key) {
            files.push(path);
        }
    };
    for path in paths {
        let path = resolve(project_path, path);
        if path.is_dir() {
            let found = WalkDir::new(&path)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| {
                    let name = e.file_name().to_string_lossy();
                    e.depth() == 0
                        || !(e.file_type().is_dir()
                            && (name.starts_with('.') || name == "node_modules"))
                })
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| Framework::infer(p).is_some());
            found.for_each(&mut push);
        } else {
            push(path);
        }
    }
    files
}

fn verdict_label(verdict: Option<SessionVerdict>) -> colored::ColoredString {
    match verdict {
        Some(SessionVerdict::Healed) => "HEALED".green().bold(),
        Some(SessionVerdict::Exhausted) => "EXHAUSTED".yellow().bold(),
        Some(SessionVerdict::Aborted) | None => "ABORTED".red().bold(),
    }
}

fn print_session(session: &HealingSession, audit_path: &Path) {
    println!(
        "\n{} {}",
        verdict_label(session.verdict),
        session.artifact.path.display()
    );
    println!("{}", "─".repeat(60));
    println!("   Session:    {}", session.id);
    println!("   Framework:  {}", session.artifact.framework);
    println!("   Records:    {}", session.records().len());
    println!("   Patches:    {}", session.patches_applied());
    if let Some(explanation) = &session.explanation {
        println!("   Reason:     {explanation}");
    }
    for record in session.records() {
        let category = record
            .diagnosis
            .as_ref()
            .map_or_else(|| "-".to_string(), |d| d.category.to_string());
        println!(
            "     #{} {:?} ({category})",
            record.iteration, record.outcome
        );
    }
    println!("   Audit:      {}", audit_path.display());
}

fn session_summary(session: &HealingSession, audit_path: &Path) -> serde_json::Value {
    serde_json::json!({
        "session_id": session.id,
        "artifact": session.artifact.path,
        "framework": session.artifact.framework,
        "verdict": session.verdict,
        "explanation": session.explanation,
        "records": session.records(),
        "patches_applied": session.patches_applied(),
        "fingerprint": session.artifact.fingerprint(),
        "audit": audit_path,
    })
}
