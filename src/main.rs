//! Relab CLI - reproducible experiment runner

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use relab::descr::Params;
use relab::error::{FixSuggestion, RelabError};
use relab::node::Node;
use relab::taskfile::{self, TaskFile};
use relab::{query, repo, Dag, LocalBackend, RunState, Store};

#[derive(Parser)]
#[command(name = "relab")]
#[command(about = "Run DAGs of experiments pinned to git commits, with content-addressed results")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct RunOpts {
    /// Maximum number of simultaneously running jobs
    #[arg(short, long, default_value_t = relab::DEFAULT_MAX_PROCESSES)]
    jobs: usize,

    /// Seconds between scheduler passes (fractional allowed)
    #[arg(long, default_value_t = 1.0)]
    poll_interval: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single experiment
    Run {
        /// Description of the experiment
        description: String,

        /// Shell command; `{}` is the results directory, a leading `@`
        /// names a macro
        command: Option<String>,

        /// Commit expression to pin the code to
        #[arg(default_value = "HEAD")]
        commit: String,

        /// Parameters as name:value, repeatable
        #[arg(short, long = "params", value_name = "K:V")]
        params: Vec<String>,

        /// Discard prior results for this experiment and run it again
        #[arg(long)]
        rerun: bool,

        /// Check out only the working directory instead of the whole tree
        #[arg(long)]
        subdir_only: bool,

        /// Adopt the result tree of a prior hash instead of running
        #[arg(long, value_name = "HSH")]
        import: Option<String>,

        #[command(flatten)]
        opts: RunOpts,
    },

    /// Parse a task file, archive it, and run the whole DAG
    Runfile {
        /// Path to the task file
        file: PathBuf,

        #[command(flatten)]
        opts: RunOpts,
    },

    /// Replay an archived task
    Runtask {
        /// Task id as printed at submission
        task_id: u64,

        #[command(flatten)]
        opts: RunOpts,
    },

    /// Summarize stored experiments, grouped by description
    List,

    /// Show details of matching experiments
    Show {
        /// Description, prefix, or hash
        descr: String,
    },

    /// Print hashes of matching experiments
    Hash {
        /// Description, prefix, or hash
        descr: String,

        /// Only the most recent match
        #[arg(long)]
        latest: bool,
    },

    /// Delete matching result trees
    Purge {
        /// Description, prefix, or hash
        descr: String,

        /// Delete every match instead of the most recent only
        #[arg(long)]
        all: bool,

        /// Report what would be deleted without touching disk
        #[arg(long)]
        dry_run: bool,
    },

    /// Expand experiment references in a command and run it
    Cmd {
        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,

        /// Parameters as name:value, repeatable
        #[arg(short, long = "params", value_name = "K:V")]
        params: Vec<String>,
    },

    /// Expand experiment references in a command and print it
    Print {
        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,

        /// Parameters as name:value, repeatable
        #[arg(short, long = "params", value_name = "K:V")]
        params: Vec<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match dispatch(cli.command) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            if let Some(suggestion) = e.fix_suggestion() {
                eprintln!("  {} {}", "Fix:".yellow(), suggestion);
            }
            std::process::exit(1);
        }
    }
}

fn dispatch(command: Commands) -> Result<i32, RelabError> {
    match command {
        Commands::Run {
            description,
            command,
            commit,
            params,
            rerun,
            subdir_only,
            import,
            opts,
        } => run_single(
            description,
            command,
            commit,
            params,
            rerun,
            subdir_only,
            import,
            opts,
        ),
        Commands::Runfile { file, opts } => run_file(&file, opts),
        Commands::Runtask { task_id, opts } => run_task(task_id, opts),
        Commands::List => {
            print!("{}", query::list(&Store::open()?)?);
            Ok(0)
        }
        Commands::Show { descr } => {
            print!("{}", query::show(&Store::open()?, &descr)?);
            Ok(0)
        }
        Commands::Hash { descr, latest } => {
            for hsh in query::hashes(&Store::open()?, &descr, latest)? {
                println!("{hsh}");
            }
            Ok(0)
        }
        Commands::Purge {
            descr,
            all,
            dry_run,
        } => {
            let store = Store::open()?;
            let victims = query::purge(&store, &descr, all, dry_run)?;
            let verb = if dry_run { "would purge" } else { "purged" };
            for hsh in victims {
                println!("{verb} {hsh}");
            }
            Ok(0)
        }
        Commands::Cmd { command, params } => {
            let store = Store::open()?;
            let expanded =
                query::expand_against_store(&store, &command.join(" "), &parse_params(&params)?)?;
            println!("{} {}", "→".cyan(), expanded);
            let cwd = std::env::current_dir()?;
            Ok(repo::exec_shell(&expanded, &cwd)?)
        }
        Commands::Print { command, params } => {
            let store = Store::open()?;
            let expanded =
                query::expand_against_store(&store, &command.join(" "), &parse_params(&params)?)?;
            println!("{expanded}");
            Ok(0)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_single(
    description: String,
    command: Option<String>,
    commit: String,
    params: Vec<String>,
    rerun: bool,
    subdir_only: bool,
    import: Option<String>,
    opts: RunOpts,
) -> Result<i32, RelabError> {
    let command = command.ok_or_else(|| RelabError::CommandCodeConflict {
        description: description.clone(),
    })?;
    let (command, code) = match command.strip_prefix('@') {
        Some(code) => (None, Some(code.to_string())),
        None => (Some(command), None),
    };

    let store = Store::open()?;
    let working_dir = repo::working_dir(store.root());
    let mut dag = dag_with_opts(store, working_dir, &opts);

    let mut node = Node::new(description, commit, command, code, parse_params(&params)?)?;
    node.rerun = rerun;
    node.subdir_only = subdir_only;
    node.import = import;
    dag.add_node(node);

    execute(dag)
}

fn run_file(file: &PathBuf, opts: RunOpts) -> Result<i32, RelabError> {
    let store = Store::open()?;
    let task = TaskFile::parse(file)?;

    // pin HEAD now so the archived task replays against the same code
    let commit = repo::rev_parse(store.root(), "HEAD")?;
    let task_id = taskfile::save_task(&store, file, &commit)?;
    println!("{} task archived with id {}", "→".cyan(), task_id.to_string().bold());

    let working_dir = repo::working_dir(store.root());
    let mut dag = dag_with_opts(store, working_dir, &opts);
    task.build_dag(&mut dag, Some(&commit))?;
    execute(dag)
}

fn run_task(task_id: u64, opts: RunOpts) -> Result<i32, RelabError> {
    let store = Store::open()?;
    let (file, commit) = taskfile::load_task(&store, task_id)?;
    let task = TaskFile::parse(&file)?;

    let working_dir = repo::working_dir(store.root());
    let mut dag = dag_with_opts(store, working_dir, &opts);
    task.build_dag(&mut dag, Some(&commit))?;
    execute(dag)
}

fn dag_with_opts(store: Store, working_dir: String, opts: &RunOpts) -> Dag {
    Dag::new(store, working_dir)
        .with_max_processes(opts.jobs)
        .with_poll_interval(Duration::from_secs_f64(opts.poll_interval.max(0.01)))
}

fn execute(mut dag: Dag) -> Result<i32, RelabError> {
    dag.init()?;
    match dag.main_loop(&LocalBackend::new())? {
        RunState::Success => {
            println!("{} task completed successfully", "✓".green());
            Ok(0)
        }
        state => {
            println!("{} task failed ({state})", "✗".red());
            Ok(1)
        }
    }
}

/// `name:value` pairs from the command line, values typed like task-file
/// parameters.
fn parse_params(pairs: &[String]) -> Result<Params, RelabError> {
    let mut params = Params::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once(':')
            .ok_or_else(|| RelabError::UnknownParameter { name: pair.clone() })?;
        let value = taskfile::parse_value(value.trim())
            .map_err(|_| RelabError::UnknownParameter { name: pair.clone() })?;
        params.insert(name.trim().to_string(), value);
    }
    Ok(params)
}
