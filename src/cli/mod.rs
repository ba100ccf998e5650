#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Args, CommandFactory as _, Parser, Subcommand};

use crate::config::{self, Config};
use crate::core::time::{now, seconds_between};
use crate::entity::{StatMap, Task, TaskStatus, WorkspaceKind};
use crate::output::table::{self, OutputFormat, Table};
use crate::project::{ProjectRoot, ProjectStores, StatusReport};
use crate::snapshot::SnapshotCreate;
use crate::task::TaskRunOptions;

#[derive(Debug, Parser)]
#[command(
    name = "datmo",
    version,
    about = "Version model experiments: code, environment, files, config and results"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Initialise (or rename) the project in the current directory
    Init(InitArgs),
    /// Remove everything datmo created for the project
    Cleanup(CleanupArgs),
    Status(StatusArgs),
    Snapshot(SnapshotArgs),
    /// Run a command as a task inside the project environment
    Run(RunArgs),
    /// List tasks
    Ls(TaskLsArgs),
    /// Run a previous task's command again
    Rerun(RerunArgs),
    Stop(StopArgs),
    #[command(alias = "rm")]
    Delete(TaskDeleteArgs),
    Task(TaskArgs),
    Session(SessionArgs),
    Notebook(WorkspaceArgs),
    Jupyterlab(WorkspaceArgs),
    Rstudio(WorkspaceArgs),
    Terminal(WorkspaceArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Args)]
pub struct InitArgs {
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,
    #[arg(short = 'd', long = "description")]
    pub description: Option<String>,
}

#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Skip the confirmation prompt
    #[arg(short = 'f', long = "force")]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    #[command(subcommand)]
    pub cmd: SnapshotCmd,
}

#[derive(Debug, Subcommand)]
pub enum SnapshotCmd {
    Create(SnapshotCreateArgs),
    Ls(SnapshotLsArgs),
    Checkout(IdArg),
    Update(SnapshotUpdateArgs),
    #[command(alias = "rm")]
    Delete(IdArg),
}

#[derive(Debug, Args)]
pub struct IdArg {
    pub id: String,
}

#[derive(Debug, Args)]
pub struct SnapshotCreateArgs {
    #[arg(short = 'm', long = "message")]
    pub message: Option<String>,
    #[arg(short = 'l', long = "label")]
    pub label: Option<String>,
    /// Promote the result of a finished task instead of capturing the working tree
    #[arg(long = "run-id", alias = "task-id")]
    pub run_id: Option<String>,

    #[arg(long = "code-id")]
    pub code_id: Option<String>,
    #[arg(long = "commit-id")]
    pub commit_id: Option<String>,

    #[arg(long = "environment-id")]
    pub environment_id: Option<String>,
    /// `SRC` or `SRC>DEST`, relative to the project root
    #[arg(long = "environment-paths")]
    pub environment_paths: Vec<String>,

    #[arg(long = "file-collection-id")]
    pub file_collection_id: Option<String>,
    /// `SRC` or `SRC>DEST`, relative to the project root
    #[arg(long = "paths")]
    pub paths: Vec<String>,

    /// JSON object
    #[arg(long = "config")]
    pub config: Option<String>,
    #[arg(long = "config-filepath")]
    pub config_filepath: Option<PathBuf>,
    #[arg(long = "config-filename")]
    pub config_filename: Option<String>,

    /// JSON object
    #[arg(long = "stats")]
    pub stats: Option<String>,
    #[arg(long = "stats-filepath")]
    pub stats_filepath: Option<PathBuf>,
    #[arg(long = "stats-filename")]
    pub stats_filename: Option<String>,
}

/// Rendering shared by the list verbs.
#[derive(Debug, Args)]
pub struct ListOutput {
    #[arg(long = "format", value_enum, default_value_t)]
    pub format: OutputFormat,
    /// Write the listing to a file instead of stdout
    #[arg(long = "download")]
    pub download: bool,
    /// Where `--download` writes; defaults to `<verb>_ls_<unix ms>` in the current directory
    #[arg(long = "download-path", requires = "download")]
    pub download_path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct SnapshotLsArgs {
    /// Include snapshots taken automatically around tasks
    #[arg(short = 'a', long = "all")]
    pub all: bool,
    /// Session name or id
    #[arg(long = "session-id")]
    pub session_id: Option<String>,
    #[arg(long = "details")]
    pub details: bool,
    #[command(flatten)]
    pub output: ListOutput,
}

#[derive(Debug, Args)]
pub struct SnapshotUpdateArgs {
    pub id: String,
    #[arg(short = 'm', long = "message")]
    pub message: Option<String>,
    #[arg(short = 'l', long = "label")]
    pub label: Option<String>,
}

#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Host:container port mapping, repeatable
    #[arg(short = 'p', long = "ports")]
    pub ports: Vec<String>,
    /// Container memory limit, e.g. `4g`
    #[arg(short = 'm', long = "mem-limit")]
    pub mem_limit: Option<String>,
    #[arg(long = "gpu")]
    pub gpu: bool,
    #[arg(long = "environment-id")]
    pub environment_id: Option<String>,
    #[arg(long = "environment-paths")]
    pub environment_paths: Vec<String>,
    #[arg(short = 'i', long = "interactive")]
    pub interactive: bool,
    #[arg(short = 'd', long = "detach")]
    pub detach: bool,
    /// Host path mounted under `/data`, as `SRC` or `SRC>DEST`
    #[arg(long = "data")]
    pub data: Vec<String>,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct TaskLsArgs {
    /// Session name or id
    #[arg(long = "session-id")]
    pub session_id: Option<String>,
    #[command(flatten)]
    pub output: ListOutput,
}

#[derive(Debug, Args)]
pub struct RerunArgs {
    pub id: String,
    #[arg(short = 'd', long = "detach")]
    pub detach: bool,
}

#[derive(Debug, Args)]
pub struct StopArgs {
    #[arg(long = "id", conflicts_with = "all")]
    pub id: Option<String>,
    #[arg(short = 'a', long = "all")]
    pub all: bool,
}

#[derive(Debug, Args)]
pub struct TaskDeleteArgs {
    pub id: String,
}

#[derive(Debug, Args)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub cmd: TaskCmd,
}

#[derive(Debug, Subcommand)]
pub enum TaskCmd {
    Run(RunArgs),
    Ls(TaskLsArgs),
    Stop(StopArgs),
    #[command(alias = "rm")]
    Delete(TaskDeleteArgs),
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    #[command(subcommand)]
    pub cmd: SessionCmd,
}

#[derive(Debug, Subcommand)]
pub enum SessionCmd {
    Create(SessionCreateArgs),
    /// Make a session current by name or id
    Select(SessionRefArg),
    Ls(SessionLsArgs),
    #[command(alias = "rm")]
    Delete(SessionRefArg),
    Update(SessionUpdateArgs),
}

#[derive(Debug, Args)]
pub struct SessionCreateArgs {
    #[arg(short = 'n', long = "name")]
    pub name: String,
}

#[derive(Debug, Args)]
pub struct SessionRefArg {
    pub name_or_id: String,
}

#[derive(Debug, Args)]
pub struct SessionLsArgs {
    #[command(flatten)]
    pub output: ListOutput,
}

#[derive(Debug, Args)]
pub struct SessionUpdateArgs {
    pub name_or_id: String,
    #[arg(short = 'n', long = "name")]
    pub name: String,
}

#[derive(Debug, Args)]
pub struct WorkspaceArgs {
    #[arg(long = "gpu")]
    pub gpu: bool,
    #[arg(short = 'm', long = "mem-limit")]
    pub mem_limit: Option<String>,
    #[arg(long = "environment-id")]
    pub environment_id: Option<String>,
    #[arg(long = "environment-paths")]
    pub environment_paths: Vec<String>,
    #[arg(long = "data")]
    pub data: Vec<String>,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    List,
    Set(ConfigSetArgs),
    Get(ConfigGetArgs),
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Args)]
pub struct ConfigGetArgs {
    pub key: String,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        Commands::Completion(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "datmo", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => Ok(cmd_version()),
        Commands::Config(args) => cmd_config(args),
        Commands::Init(args) => cmd_init(&project_root(false).await?, args),
        Commands::Cleanup(args) => cmd_cleanup(&project_root(true).await?, &args),
        Commands::Status(args) => cmd_status(&project_root(true).await?, &args),
        Commands::Snapshot(args) => cmd_snapshot(&open_project().await?, args),
        Commands::Run(args) | Commands::Task(TaskArgs { cmd: TaskCmd::Run(args) }) => {
            cmd_run(&open_project().await?, args).await
        }
        Commands::Ls(args) | Commands::Task(TaskArgs { cmd: TaskCmd::Ls(args) }) => {
            task_ls(&open_project().await?, &args)
        }
        Commands::Stop(args) | Commands::Task(TaskArgs { cmd: TaskCmd::Stop(args) }) => {
            task_stop(&open_project().await?, &args).await
        }
        Commands::Delete(args)
        | Commands::Task(TaskArgs {
            cmd: TaskCmd::Delete(args),
        }) => task_delete(&open_project().await?, &args).await,
        Commands::Rerun(args) => cmd_rerun(&open_project().await?, &args).await,
        Commands::Session(args) => cmd_session(&open_project().await?, args),
        Commands::Notebook(args) => cmd_workspace(WorkspaceKind::Notebook, args).await,
        Commands::Jupyterlab(args) => cmd_workspace(WorkspaceKind::Jupyterlab, args).await,
        Commands::Rstudio(args) => cmd_workspace(WorkspaceKind::Rstudio, args).await,
        Commands::Terminal(args) => cmd_workspace(WorkspaceKind::Terminal, args).await,
    }
}

/// The project at the working directory, or with `discover` the closest enclosing one.
async fn project_root(discover: bool) -> anyhow::Result<ProjectRoot> {
    let cfg = load_cfg().await?;
    crate::logging::init(&cfg.logging.level);
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    let root = if discover {
        ProjectRoot::discover(&cwd, cfg)?
    } else {
        ProjectRoot::new(&cwd, cfg)?
    };
    Ok(root)
}

async fn open_project() -> anyhow::Result<ProjectStores> {
    Ok(project_root(true).await?.open()?)
}

async fn load_cfg() -> anyhow::Result<Config> {
    tokio::task::spawn_blocking(config::load).await?
}

fn cmd_config(args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::List => print!("{}", config::list_resolved_toml()?),
        ConfigCmd::Set(set) => {
            config::set_value_string(&set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
        }
        ConfigCmd::Get(get) => match config::get_value_string(&get.key)? {
            Some(v) => println!("{v}"),
            None => anyhow::bail!(
                "configuration key '{}' not found - use 'datmo config list' to see available keys",
                get.key
            ),
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_init(root: &ProjectRoot, args: InitArgs) -> anyhow::Result<ExitCode> {
    let name = match args.name {
        Some(name) => name,
        None => root
            .root()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("cannot derive a project name from the directory; pass --name")?,
    };
    let reinit = root.is_initialized();
    let project = root.init(&name, args.description.as_deref())?;
    let verb = if reinit { "Updated" } else { "Initialized" };
    println!("{verb} project {} ({})", project.name, project.id);
    println!("  path: {}", root.root().display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_cleanup(root: &ProjectRoot, args: &CleanupArgs) -> anyhow::Result<ExitCode> {
    if !root.is_initialized() {
        println!("Nothing to clean up in {}", root.root().display());
        return Ok(ExitCode::SUCCESS);
    }
    if !args.force && !confirm(&format!("This removes all datmo state under {}.", root.root().display()))? {
        return Ok(ExitCode::SUCCESS);
    }
    root.cleanup()?;
    println!("Cleaned up project at {}", root.root().display());
    Ok(ExitCode::SUCCESS)
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt}\nAre you sure? (y/N): ");
    std::io::Write::flush(&mut std::io::stdout())?;
    let mut input = String::new();
    let _ = std::io::stdin().read_line(&mut input)?;
    let resp = input.trim().to_lowercase();
    Ok(resp == "y" || resp == "yes")
}

fn cmd_status(root: &ProjectRoot, args: &StatusArgs) -> anyhow::Result<ExitCode> {
    let report = root.status()?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }
    print_status(&report);
    Ok(ExitCode::SUCCESS)
}

fn print_status(report: &StatusReport) {
    println!("Project: {} ({})", report.project.name, report.project.id);
    if let Some(desc) = report.project.description.as_deref()
        && !desc.trim().is_empty()
    {
        println!("Description: {desc}");
    }
    if let Some(session) = &report.current_session {
        println!("Session: {}", session.name);
    }
    match &report.current_snapshot {
        Some(s) => println!("Current snapshot: {} {}", s.id, s.message),
        None => println!("Current snapshot: -"),
    }
    if let Some(s) = &report.latest_snapshot_user_generated {
        println!("Latest snapshot: {} {}", s.id, s.message);
    }
    if let Some(s) = &report.latest_snapshot_auto_generated {
        println!("Latest task snapshot: {} {}", s.id, s.message);
    }
    let unstaged: Vec<&str> = [
        (report.unstaged_code, "code"),
        (report.unstaged_environment, "environment"),
        (report.unstaged_files, "files"),
    ]
    .into_iter()
    .filter_map(|(dirty, name)| dirty.then_some(name))
    .collect();
    if unstaged.is_empty() {
        println!("No unstaged changes");
    } else {
        println!("Unstaged changes: {}", unstaged.join(", "));
    }
}

fn cmd_snapshot(stores: &ProjectStores, args: SnapshotArgs) -> anyhow::Result<ExitCode> {
    let snapshots = &stores.snapshots;
    match args.cmd {
        SnapshotCmd::Create(args) => {
            let run_id = args.run_id.clone();
            let opts = snapshot_create_options(args)?;
            let snapshot = match run_id {
                Some(task_id) => {
                    let task = stores.tasks.get(&task_id)?;
                    snapshots.create_from_task(&task.id, &opts)?
                }
                None => snapshots.create(&opts)?,
            };
            println!("Created snapshot {}", snapshot.id);
        }
        SnapshotCmd::Ls(args) => snapshot_ls(stores, &args)?,
        SnapshotCmd::Checkout(IdArg { id }) => {
            snapshots.checkout(&id)?;
            println!("Checked out snapshot {id}");
        }
        SnapshotCmd::Update(args) => {
            let updated =
                snapshots.update(&args.id, args.message.as_deref(), args.label.as_deref())?;
            println!("Updated snapshot {}", updated.id);
        }
        SnapshotCmd::Delete(IdArg { id }) => {
            snapshots.delete(&id)?;
            println!("Deleted snapshot {id}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn snapshot_create_options(args: SnapshotCreateArgs) -> anyhow::Result<SnapshotCreate> {
    Ok(SnapshotCreate {
        message: args.message,
        code_id: args.code_id,
        commit_id: args.commit_id,
        environment_id: args.environment_id,
        environment_paths: non_empty(args.environment_paths),
        file_collection_id: args.file_collection_id,
        paths: non_empty(args.paths),
        config: args.config.as_deref().map(|s| parse_json_map("--config", s)).transpose()?,
        config_filepath: args.config_filepath,
        config_filename: args.config_filename,
        stats: args.stats.as_deref().map(|s| parse_json_map("--stats", s)).transpose()?,
        stats_filepath: args.stats_filepath,
        stats_filename: args.stats_filename,
        label: args.label,
        ..SnapshotCreate::default()
    })
}

fn non_empty(v: Vec<String>) -> Option<Vec<String>> {
    (!v.is_empty()).then_some(v)
}

fn parse_json_map(flag: &str, raw: &str) -> anyhow::Result<StatMap> {
    serde_json::from_str(raw).with_context(|| format!("{flag} must be a JSON object"))
}

fn snapshot_ls(stores: &ProjectStores, args: &SnapshotLsArgs) -> anyhow::Result<()> {
    let visible = (!args.all).then_some(true);
    let snapshots = match args.session_id.as_deref() {
        Some(session) => stores.snapshots.list_in_session(session, visible)?,
        None => stores.snapshots.list(visible)?,
    };
    let mut t = if args.details {
        Table::new([
            "ID", "CREATED", "CODE", "ENVIRONMENT", "FILES", "CONFIG", "STATS", "MESSAGE", "LABEL",
        ])
    } else {
        Table::new(["ID", "CREATED", "CONFIG", "STATS", "MESSAGE", "LABEL"])
    };
    for s in &snapshots {
        let created = crate::core::time::format_timestamp(s.created_at);
        if args.details {
            t.row([
                s.id.clone(),
                created,
                table::short_id(&s.code_id),
                table::short_id(&s.environment_id),
                table::short_id(&s.file_collection_id),
                format_map(&s.config),
                format_map(&s.stats),
                s.message.clone(),
                s.label.clone().unwrap_or_default(),
            ]);
        } else {
            t.row([
                table::short_id(&s.id),
                created,
                table::truncate(&format_map(&s.config), 40),
                table::truncate(&format_map(&s.stats), 40),
                table::truncate(&s.message, 50),
                s.label.clone().unwrap_or_default(),
            ]);
        }
    }
    print_table(&t, &args.output, "snapshot", "No snapshots")
}

fn format_map(map: &StatMap) -> String {
    map.iter()
        .map(|(k, v)| match v {
            serde_json::Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_table(t: &Table, output: &ListOutput, verb: &str, empty: &str) -> anyhow::Result<()> {
    if output.download {
        let path = match &output.download_path {
            Some(path) => path.clone(),
            None => download_path(&std::env::current_dir()?, verb),
        };
        t.write_to(&path, output.format)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Listing written to {}", path.display());
        return Ok(());
    }
    if t.is_empty() && output.format == OutputFormat::Table {
        println!("{empty}");
        return Ok(());
    }
    t.print(output.format)?;
    Ok(())
}

fn download_path(dir: &std::path::Path, verb: &str) -> PathBuf {
    let millis = now().unix_timestamp_nanos() / 1_000_000;
    dir.join(format!("{verb}_ls_{millis}"))
}

async fn cmd_run(stores: &ProjectStores, args: RunArgs) -> anyhow::Result<ExitCode> {
    let opts = TaskRunOptions {
        command: (!args.command.is_empty()).then(|| args.command.join(" ")),
        command_list: non_empty(args.command),
        interactive: args.interactive,
        detach: args.detach,
        gpu: args.gpu,
        ports: args.ports,
        mem_limit: args.mem_limit,
        workspace: None,
        data_paths: args.data,
    };
    let snapshot = SnapshotCreate {
        environment_id: args.environment_id,
        environment_paths: non_empty(args.environment_paths),
        ..SnapshotCreate::default()
    };
    run_task(stores, snapshot, opts).await
}

async fn cmd_rerun(stores: &ProjectStores, args: &RerunArgs) -> anyhow::Result<ExitCode> {
    let previous = stores.tasks.get(&args.id)?;
    let mut opts = TaskRunOptions::from_task(&previous);
    opts.detach = args.detach;
    let environment_id = match previous.before_snapshot_id.as_deref() {
        Some(id) => Some(stores.snapshots.get(id)?.environment_id),
        None => None,
    };
    let snapshot = SnapshotCreate {
        environment_id,
        ..SnapshotCreate::default()
    };
    run_task(stores, snapshot, opts).await
}

async fn cmd_workspace(workspace: WorkspaceKind, args: WorkspaceArgs) -> anyhow::Result<ExitCode> {
    let stores = open_project().await?;
    let mut opts = TaskRunOptions::for_workspace(workspace);
    opts.gpu = args.gpu;
    opts.mem_limit = args.mem_limit;
    opts.data_paths = args.data;
    let snapshot = SnapshotCreate {
        environment_id: args.environment_id,
        environment_paths: non_empty(args.environment_paths),
        ..SnapshotCreate::default()
    };
    println!("Launching {workspace} workspace...");
    run_task(&stores, snapshot, opts).await
}

async fn run_task(
    stores: &ProjectStores,
    snapshot: SnapshotCreate,
    opts: TaskRunOptions,
) -> anyhow::Result<ExitCode> {
    let task = stores.tasks.create()?;
    let task = stores.tasks.run(&task.id, snapshot, opts).await?;
    print_task_details(&task);
    Ok(if task.status.is_terminal() && task.status != TaskStatus::Success {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

fn print_task_details(task: &Task) {
    println!("Task: {}", task.id);
    println!("Status: {}", task.status);
    if let Some(cmd) = task.command.as_deref() {
        println!("Command: {cmd}");
    }
    if let Some(run_id) = task.run_id.as_deref() {
        println!("Container: {}", table::short_id(run_id));
    }
    if let Some(results) = task.results.as_ref().filter(|r| !r.is_empty()) {
        println!("Results:");
        for (k, v) in results {
            println!("  {k}: {v}");
        }
    }
    if let Some(after) = task.after_snapshot_id.as_deref() {
        println!("After snapshot: {after}");
    }
}

fn task_ls(stores: &ProjectStores, args: &TaskLsArgs) -> anyhow::Result<ExitCode> {
    let tasks = match args.session_id.as_deref() {
        Some(session) => stores.tasks.list_in_session(session)?,
        None => stores.tasks.list()?,
    };
    let mut t = Table::new(["ID", "COMMAND", "STATUS", "RESULTS", "CREATED", "DURATION"]);
    for task in &tasks {
        let results = task
            .results
            .iter()
            .flatten()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        t.row([
            table::short_id(&task.id),
            table::truncate(task.command.as_deref().unwrap_or("-"), 40),
            task.status.to_string(),
            table::truncate(&results, 40),
            crate::core::time::format_timestamp(task.created_at),
            task_duration_string(task),
        ]);
    }
    print_table(&t, &args.output, "task", "No tasks")?;
    Ok(ExitCode::SUCCESS)
}

fn task_duration_string(task: &Task) -> String {
    if let Some(secs) = task.duration {
        return format_duration(secs);
    }
    match task.start_time {
        Some(start) if !task.status.is_terminal() => format_duration(seconds_between(start, now())),
        _ => "-".to_owned(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn format_duration(secs: f64) -> String {
    let secs = secs.max(0.0).round() as u64;
    if secs < 60 {
        return format!("{secs}s");
    }
    if secs < 3600 {
        return format!("{}m", secs / 60);
    }
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}

async fn task_stop(stores: &ProjectStores, args: &StopArgs) -> anyhow::Result<ExitCode> {
    match args.id.as_deref() {
        Some(id) => {
            let task = stores.tasks.get(id)?;
            stores.tasks.stop(Some(task.id.as_str()), false).await?;
            println!("Stopped task {}", task.id);
        }
        None => {
            stores.tasks.stop(None, args.all).await?;
            println!("Stopped all tasks");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn task_delete(stores: &ProjectStores, args: &TaskDeleteArgs) -> anyhow::Result<ExitCode> {
    let task = stores.tasks.get(&args.id)?;
    stores.tasks.delete(&task.id).await?;
    println!("Deleted task {}", task.id);
    Ok(ExitCode::SUCCESS)
}

fn cmd_session(stores: &ProjectStores, args: SessionArgs) -> anyhow::Result<ExitCode> {
    let sessions = stores.sessions();
    match args.cmd {
        SessionCmd::Create(args) => {
            let session = sessions.create(&args.name)?;
            println!("Created session {} ({})", session.name, session.id);
        }
        SessionCmd::Select(args) => {
            let session = sessions.select(&args.name_or_id)?;
            println!("Current session is now {} ({})", session.name, session.id);
        }
        SessionCmd::Ls(args) => {
            let mut t = Table::new(["", "NAME", "ID", "SNAPSHOTS", "TASKS", "CREATED"]);
            for session in sessions.list()? {
                let snapshots = stores.snapshots.list_in_session(&session.id, Some(true))?.len();
                let tasks = stores.tasks.list_in_session(&session.id)?.len();
                t.row([
                    if session.current { "*" } else { "" }.to_owned(),
                    session.name.clone(),
                    table::short_id(&session.id),
                    snapshots.to_string(),
                    tasks.to_string(),
                    crate::core::time::format_timestamp(session.created_at),
                ]);
            }
            print_table(&t, &args.output, "session", "No sessions")?;
        }
        SessionCmd::Delete(args) => {
            sessions.delete(&args.name_or_id)?;
            println!("Deleted session {}", args.name_or_id);
        }
        SessionCmd::Update(args) => {
            let session = sessions.rename(&args.name_or_id, &args.name)?;
            println!("Renamed session {} to {}", session.id, session.name);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_version() -> ExitCode {
    println!("datmo version {}", env!("CARGO_PKG_VERSION"));
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_with_trailing_command() {
        let cli = Cli::try_parse_from([
            "datmo", "run", "-p", "8888:8888", "--data", "in>raw", "python", "train.py", "--epochs", "3",
        ])
        .unwrap();
        let Commands::Run(args) = cli.cmd else {
            panic!("expected run");
        };
        assert_eq!(args.ports, vec!["8888:8888"]);
        assert_eq!(args.data, vec!["in>raw"]);
        assert_eq!(args.command, vec!["python", "train.py", "--epochs", "3"]);
    }

    #[test]
    fn stop_rejects_id_with_all() {
        assert!(Cli::try_parse_from(["datmo", "stop", "--id", "x", "--all"]).is_err());
        assert!(Cli::try_parse_from(["datmo", "task", "stop", "--all"]).is_ok());
    }

    #[test]
    fn snapshot_create_parses_json_maps() {
        let cli = Cli::try_parse_from([
            "datmo", "snapshot", "create", "-m", "s1", "--config", r#"{"lr":0.1}"#, "--paths", "a.txt",
        ])
        .unwrap();
        let Commands::Snapshot(SnapshotArgs {
            cmd: SnapshotCmd::Create(args),
        }) = cli.cmd
        else {
            panic!("expected snapshot create");
        };
        let opts = snapshot_create_options(args).unwrap();
        assert_eq!(opts.message.as_deref(), Some("s1"));
        assert_eq!(opts.config.unwrap()["lr"], serde_json::json!(0.1));
        assert_eq!(opts.paths, Some(vec!["a.txt".to_owned()]));
        assert!(opts.environment_paths.is_none());
    }

    #[test]
    fn malformed_json_is_reported_with_the_flag() {
        let err = parse_json_map("--stats", "[1,2]").unwrap_err();
        assert!(err.to_string().contains("--stats"));
    }

    #[test]
    fn session_verbs_parse() {
        let cli = Cli::try_parse_from(["datmo", "session", "select", "exp"]).unwrap();
        assert!(matches!(
            cli.cmd,
            Commands::Session(SessionArgs {
                cmd: SessionCmd::Select(SessionRefArg { ref name_or_id })
            }) if name_or_id == "exp"
        ));
        assert!(Cli::try_parse_from(["datmo", "ls", "--session-id", "exp", "--format", "csv"]).is_ok());
    }

    #[test]
    fn download_flags_parse() {
        let cli = Cli::try_parse_from([
            "datmo", "snapshot", "ls", "--download", "--download-path", "out.csv", "--format", "csv",
        ])
        .unwrap();
        let Commands::Snapshot(SnapshotArgs {
            cmd: SnapshotCmd::Ls(args),
        }) = cli.cmd
        else {
            panic!("expected snapshot ls");
        };
        assert!(args.output.download);
        assert_eq!(args.output.download_path, Some(PathBuf::from("out.csv")));
        assert!(Cli::try_parse_from(["datmo", "ls", "--download-path", "x"]).is_err());

        let path = download_path(std::path::Path::new("/tmp"), "task");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("task_ls_"), "{name}");
    }

    #[test]
    fn durations_render_compactly() {
        assert_eq!(format_duration(4.4), "4s");
        assert_eq!(format_duration(125.0), "2m");
        assert_eq!(format_duration(3725.0), "1h 2m");
    }
}
