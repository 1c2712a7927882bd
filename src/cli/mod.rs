#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::config::{self, Config};
use crate::core::audit::{AssignmentLog, LogFilter};
use crate::core::charging::ChargingDecision;
use crate::core::dispatcher::Dispatcher;
use crate::core::worker::{self, WorkerConfig};
use crate::error::DispatchError;
use crate::output::table::{OutputFormat, Table};
use crate::robot::link::TracingLink;
use crate::robot::model::{RobotCommand, RobotStatus, RobotView};
use crate::site::{SiteFile, SiteMap};
use crate::task::model::{NewTask, Task, TaskFilter, TaskState, TaskType, TaskView};
use crate::task::priority::parse_priority;

/// Exit code for "busy, try again" (EX_TEMPFAIL).
const EXIT_TEMPFAIL: u8 = 75;

#[derive(Debug, Parser)]
#[command(
    name = "robodispatch",
    version,
    about = "Priority-based task dispatch for restaurant service robots"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Task(TaskArgs),
    Robot(RobotArgs),
    Fleet(FleetArgs),
    /// Run one scheduling tick
    Tick(TickArgs),
    /// Show the assignment log
    Log(LogArgs),
    Charging(ChargingArgs),
    Stats(JsonArgs),
    Worker(WorkerArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    Version,
}

#[derive(Debug, Parser)]
pub struct TaskArgs {
    #[command(subcommand)]
    pub cmd: TaskCmd,
}

#[derive(Debug, Subcommand)]
pub enum TaskCmd {
    Add(TaskAddArgs),
    #[command(alias = "ls")]
    List(TaskListArgs),
    Show(TaskIdArgs),
    /// Show waypoint progress
    Step(TaskIdArgs),
    Override(TaskOverrideArgs),
    ClearOverride(TaskIdArgs),
    Critical(TaskIdArgs),
    Pause(TaskIdArgs),
    Resume(TaskIdArgs),
    ConfirmStep(TaskIdArgs),
    Start(TaskIdArgs),
    Complete(TaskIdArgs),
    Fail(TaskFailArgs),
}

#[derive(Debug, Parser)]
pub struct TaskAddArgs {
    /// ordering | delivery | collection | payment | charging
    #[arg(value_name = "TYPE")]
    pub task_type: String,
    /// Locations to visit, in order
    #[arg(required = true)]
    pub waypoints: Vec<String>,
    #[arg(long = "id")]
    pub id: Option<String>,
    /// Integer or low | medium | high
    #[arg(short = 'p', long = "priority", default_value = "50", value_parser = parse_priority)]
    pub priority: i64,
    /// RFC 3339 timestamp or +DURATION from now
    #[arg(long = "deadline")]
    pub deadline: Option<String>,
    /// RFC 3339 timestamp or +DURATION from now
    #[arg(long = "release")]
    pub release: Option<String>,
    #[arg(long = "start")]
    pub start_location: Option<String>,
    #[arg(long = "depends-on")]
    pub depends_on: Vec<String>,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TaskListArgs {
    #[arg(short = 's', long = "state")]
    pub state: Option<TaskState>,
    #[arg(short = 't', long = "type")]
    pub task_type: Option<String>,
    #[arg(short = 'r', long = "robot")]
    pub robot: Option<String>,
    #[arg(long = "min-priority")]
    pub min_priority: Option<i64>,
    /// Include DONE and FAILED tasks
    #[arg(short = 'a', long = "all")]
    pub all: bool,
    #[arg(long = "json")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct TaskIdArgs {
    pub id: String,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TaskOverrideArgs {
    pub id: String,
    #[arg(allow_negative_numbers = true)]
    pub delta: i64,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TaskFailArgs {
    pub id: String,
    #[arg(short = 'm', long = "reason", default_value = "failed by operator")]
    pub reason: String,
}

#[derive(Debug, Parser)]
pub struct RobotArgs {
    #[command(subcommand)]
    pub cmd: RobotCmd,
}

#[derive(Debug, Subcommand)]
pub enum RobotCmd {
    #[command(alias = "ls")]
    List(RobotListArgs),
    Register(RobotRegisterArgs),
    /// Apply a telemetry sample
    Telemetry(RobotTelemetryArgs),
    /// RETURN_TO_BASE | START_CHARGING
    Command(RobotCommandArgs),
    /// Report a robot fault
    Error(RobotErrorArgs),
}

#[derive(Debug, Parser)]
pub struct RobotListArgs {
    #[arg(long = "available")]
    pub available: bool,
    #[arg(long = "json")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct RobotRegisterArgs {
    pub id: String,
    #[arg(short = 'l', long = "location")]
    pub location: Option<String>,
    #[arg(short = 'b', long = "battery", default_value_t = 100)]
    pub battery: u8,
}

#[derive(Debug, Parser)]
pub struct RobotTelemetryArgs {
    pub id: String,
    #[arg(short = 'l', long = "location")]
    pub location: Option<String>,
    #[arg(short = 'b', long = "battery")]
    pub battery: Option<u8>,
}

#[derive(Debug, Parser)]
pub struct RobotCommandArgs {
    pub id: String,
    pub command: RobotCommand,
}

#[derive(Debug, Parser)]
pub struct RobotErrorArgs {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Parser)]
pub struct FleetArgs {
    #[command(subcommand)]
    pub cmd: FleetCmd,
}

#[derive(Debug, Subcommand)]
pub enum FleetCmd {
    /// Register every robot listed in a site file
    Register(FleetRegisterArgs),
}

#[derive(Debug, Parser)]
pub struct FleetRegisterArgs {
    /// Defaults to fleet.site_file
    pub file: Option<String>,
}

#[derive(Debug, Parser)]
pub struct TickArgs {
    /// Evaluate priorities at this RFC 3339 instant instead of now
    #[arg(long = "at")]
    pub at: Option<String>,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct LogArgs {
    #[arg(long = "task")]
    pub task: Option<String>,
    #[arg(long = "robot")]
    pub robot: Option<String>,
    #[arg(short = 'n', long = "limit")]
    pub limit: Option<usize>,
    #[arg(long = "json")]
    pub json: bool,
    #[arg(long = "csv")]
    pub csv: bool,
}

#[derive(Debug, Parser)]
pub struct ChargingArgs {
    #[command(subcommand)]
    pub cmd: ChargingCmd,
}

#[derive(Debug, Subcommand)]
pub enum ChargingCmd {
    Status(JsonArgs),
    /// Manual charging request
    Request(ChargingRequestArgs),
}

#[derive(Debug, Parser)]
pub struct ChargingRequestArgs {
    pub robot: String,
}

#[derive(Debug, Parser)]
pub struct JsonArgs {
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub cmd: WorkerCmd,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCmd {
    Start(WorkerStartArgs),
    Stop(WorkerStopArgs),
    Status(WorkerStatusArgs),
}

#[derive(Debug, Parser)]
pub struct WorkerStartArgs {
    /// Keep running when no task is open
    #[arg(long = "wait")]
    pub wait: bool,
    /// Overrides engine.tick_interval
    #[arg(long = "interval")]
    pub interval: Option<String>,
    #[arg(long = "max-ticks")]
    pub max_ticks: Option<u64>,
    /// Detach into a background process
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,
}

#[derive(Debug, Parser)]
pub struct WorkerStopArgs {
    #[arg(long = "timeout", default_value = "30s")]
    pub timeout: String,
}

#[derive(Debug, Parser)]
pub struct WorkerStatusArgs {
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
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

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

pub async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            let code = exit_status(&err);
            if code == EXIT_TEMPFAIL {
                eprintln!("{err}; try again later");
            } else {
                eprintln!("{err:#}");
            }
            ExitCode::from(code)
        }
    }
}

/// Busy entities and a saturated fleet are not failures.
fn exit_status(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<DispatchError>() {
        Some(e) if e.is_retryable() || e.is_steady_state() => EXIT_TEMPFAIL,
        _ => 1,
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.cmd {
        Commands::Completion(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "robodispatch", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config(args) => cmd_config(args).await,
        Commands::Version => Ok(cmd_version()),
        Commands::Worker(args) => {
            let cfg = load_cfg().await?;
            crate::logging::init(&cfg.logging)?;
            cmd_worker(cfg, args).await
        }
        cmd => {
            let cfg = load_cfg().await?;
            crate::logging::init(&cfg.logging)?;
            tokio::task::spawn_blocking(move || run_dispatch(&cfg, cmd))
                .await
                .context("command panicked")?
        }
    }
}

async fn load_cfg() -> anyhow::Result<Config> {
    let cfg = tokio::task::spawn_blocking(|| -> anyhow::Result<Config> {
        let (cfg, _paths) = config::load()?;
        Ok(cfg)
    })
    .await??;
    Ok(cfg)
}

async fn cmd_config(args: ConfigArgs) -> anyhow::Result<ExitCode> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<ExitCode> {
        match args.cmd {
            ConfigCmd::List => print!("{}", config::list_resolved_toml()?),
            ConfigCmd::Set(set) => {
                config::set_value_string(&set.key, &set.value)?;
                println!("Set {} = {}", set.key, set.value);
            }
            ConfigCmd::Get(get) => match config::get_value_string(&get.key)? {
                Some(v) => println!("{v}"),
                None => anyhow::bail!(
                    "configuration key '{}' not found - use 'robodispatch config list' to see available keys",
                    get.key
                ),
            },
        }
        Ok(ExitCode::SUCCESS)
    })
    .await?
}

fn state_dir(cfg: &Config) -> anyhow::Result<PathBuf> {
    config::expand_path(&cfg.storage.dir)
}

/// Builds a dispatcher over the configured store and site map.
pub fn open_dispatcher(cfg: &Config) -> anyhow::Result<Dispatcher> {
    let dir = state_dir(cfg)?;
    let store = crate::store::open(&cfg.storage, &dir);
    let site_path = config::expand_path(&cfg.fleet.site_file)?;
    let site = SiteFile::load_or_default(&site_path)?;
    if site.locations.is_empty() {
        tracing::debug!(path = %site_path.display(), "no site locations, every trip uses the unknown cost");
    }
    let map = SiteMap::new(&site.locations, cfg.engine.unknown_travel_cost);
    let dispatcher = Dispatcher::open(cfg, store, Arc::new(map), Arc::new(TracingLink))
        .with_context(|| format!("failed to open dispatcher state in {}", dir.display()))?;
    Ok(dispatcher)
}

fn run_dispatch(cfg: &Config, cmd: Commands) -> anyhow::Result<ExitCode> {
    let d = open_dispatcher(cfg)?;
    let now = OffsetDateTime::now_utc();
    match cmd {
        Commands::Task(args) => cmd_task(cfg, &d, args, now)?,
        Commands::Robot(args) => cmd_robot(cfg, &d, args, now)?,
        Commands::Fleet(FleetArgs {
            cmd: FleetCmd::Register(args),
        }) => {
            let file = args.file.as_deref().unwrap_or(&cfg.fleet.site_file);
            let path = config::expand_path(file)?;
            let site = SiteFile::load(&path)?;
            let created = d.register_fleet(&site.robots, now)?;
            println!(
                "Registered {created} new robot(s) from {} ({} listed)",
                path.display(),
                site.robots.len()
            );
        }
        Commands::Tick(args) => cmd_tick(&d, &args, now)?,
        Commands::Log(args) => {
            let entries = d.get_assignment_log(&LogFilter {
                task_id: args.task,
                robot_id: args.robot,
                since: None,
                limit: args.limit,
            });
            print_log(&entries, OutputFormat::from_flags(args.json, args.csv))?;
        }
        Commands::Charging(args) => cmd_charging(&d, args, now)?,
        Commands::Stats(args) => {
            let stats = d.stats()?;
            if args.json {
                print_json(&stats)?;
            } else {
                print_counts("Tasks by state", &stats.tasks_by_state);
                print_counts("Tasks by type", &stats.tasks_by_type);
                print_counts("Robots by status", &stats.robots_by_status);
                println!("Open tasks: {}", stats.open_tasks);
                println!("Assignments logged: {}", stats.assignments);
                println!(
                    "Charging slots: {}/{}",
                    stats.charging_slots_in_use, stats.charging_slots
                );
            }
        }
        Commands::Worker(_)
        | Commands::Config(_)
        | Commands::Completion(_)
        | Commands::Version => {
            anyhow::bail!("command does not use the dispatcher")
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_task(cfg: &Config, d: &Dispatcher, args: TaskArgs, now: OffsetDateTime) -> anyhow::Result<()> {
    match args.cmd {
        TaskCmd::Add(a) => {
            let req = NewTask {
                id: a.id,
                task_type: a.task_type,
                waypoints: a.waypoints,
                base_priority: a.priority,
                deadline: a.deadline.as_deref().map(|s| parse_when(s, now)).transpose()?,
                release_time: a.release.as_deref().map(|s| parse_when(s, now)).transpose()?,
                start_location: a.start_location,
                depends_on: a.depends_on,
            };
            let task = d.create_task(req, now)?;
            if a.json {
                print_json(&d.priority_policy().view(task, now))?;
            } else {
                println!(
                    "Task {} ({}) added as {}, priority {}",
                    task.id, task.task_type, task.state, task.base_priority
                );
            }
        }
        TaskCmd::List(a) => {
            let task_type = a.task_type.as_deref().map(str::parse::<TaskType>).transpose()?;
            let filter = TaskFilter {
                state: a.state,
                task_type,
                robot_id: a.robot,
                min_priority: a.min_priority,
                include_terminal: a.all,
            };
            let views = d.list_tasks(&filter, now)?;
            print_tasks(cfg, &views, OutputFormat::from_flags(a.json, a.csv), now)?;
        }
        TaskCmd::Show(a) => {
            let view = d.task_view(&a.id, now)?;
            if a.json {
                print_json(&view)?;
            } else {
                print_task_details(&view, now);
            }
        }
        TaskCmd::Step(a) => {
            let info = d.current_step(&a.id)?;
            if a.json {
                print_json(&info)?;
            } else {
                println!(
                    "{}: step {}/{}, next: {}",
                    info.task_id,
                    info.step,
                    info.total,
                    info.next_waypoint.as_deref().unwrap_or("-")
                );
            }
        }
        TaskCmd::Override(a) => {
            let view = d.set_operator_override(&a.id, a.delta, now)?;
            print_view_change(&view, a.json)?;
        }
        TaskCmd::ClearOverride(a) => {
            let view = d.clear_override(&a.id, now)?;
            print_view_change(&view, a.json)?;
        }
        TaskCmd::Critical(a) => {
            let view = d.mark_critical(&a.id, now)?;
            print_view_change(&view, a.json)?;
        }
        TaskCmd::Pause(a) => print_task_change(&d.pause_task(&a.id)?, a.json)?,
        TaskCmd::Resume(a) => print_task_change(&d.resume_task(&a.id)?, a.json)?,
        TaskCmd::Start(a) => print_task_change(&d.start_task(&a.id)?, a.json)?,
        TaskCmd::Complete(a) => print_task_change(&d.complete_task(&a.id, now)?, a.json)?,
        TaskCmd::ConfirmStep(a) => {
            let info = d.confirm_step(&a.id)?;
            if a.json {
                print_json(&info)?;
            } else {
                println!("{}: confirmed step {}/{}", info.task_id, info.step, info.total);
            }
        }
        TaskCmd::Fail(a) => print_task_change(&d.fail_task(&a.id, &a.reason, now)?, false)?,
    }
    Ok(())
}

fn cmd_robot(cfg: &Config, d: &Dispatcher, args: RobotArgs, now: OffsetDateTime) -> anyhow::Result<()> {
    match args.cmd {
        RobotCmd::List(a) => {
            let mut robots = d.robot_views()?;
            if a.available {
                robots.retain(|r| r.available);
            }
            print_robots(cfg, &robots, OutputFormat::from_flags(a.json, a.csv))?;
        }
        RobotCmd::Register(a) => {
            let location = a.location.as_deref().unwrap_or(&cfg.fleet.home_location);
            if d.register_robot(&a.id, location, a.battery, now)? {
                println!("Robot {} registered at {location} ({}%)", a.id, a.battery.min(100));
            } else {
                println!("Robot {} is already registered", a.id);
            }
        }
        RobotCmd::Telemetry(a) => {
            let r = d.update_telemetry(&a.id, a.location.as_deref(), a.battery, now)?;
            println!(
                "{}: {} at {} ({}%)",
                r.id, r.status, r.current_location, r.battery_level
            );
        }
        RobotCmd::Command(a) => {
            let r = d.send_robot_command(&a.id, a.command, now)?;
            println!("{}: {} -> {} at {}", r.id, a.command, r.status, r.current_location);
        }
        RobotCmd::Error(a) => {
            let r = d.report_robot_error(&a.id, &a.reason, now)?;
            println!("{}: {} ({})", r.id, r.status, a.reason);
        }
    }
    Ok(())
}

fn cmd_tick(d: &Dispatcher, args: &TickArgs, now: OffsetDateTime) -> anyhow::Result<()> {
    let at = args
        .at
        .as_deref()
        .map(|s| parse_when(s, now))
        .transpose()?
        .unwrap_or(now);
    let report = d.run_tick(at)?;
    if args.json {
        return print_json(&report);
    }
    for id in &report.promoted {
        println!("ready     {id}");
    }
    for id in &report.failed {
        println!("failed    {id} (dependency failed)");
    }
    for e in &report.assignments {
        println!(
            "assigned  {} -> {} (priority {}, score {:.1})",
            e.task_id, e.robot_id, e.effective_priority, e.score
        );
    }
    for decision in &report.charging.decisions {
        println!("charging  {}", describe_charging(decision));
    }
    if report.is_empty() {
        println!("Nothing to do.");
    }
    Ok(())
}

fn cmd_charging(d: &Dispatcher, args: ChargingArgs, now: OffsetDateTime) -> anyhow::Result<()> {
    match args.cmd {
        ChargingCmd::Status(a) => {
            let status = d.charging_status()?;
            if a.json {
                return print_json(&status);
            }
            println!(
                "Slots: {}/{} (auto charging {})",
                status.charging.len(),
                status.max_concurrent,
                if status.auto_enabled { "on" } else { "off" }
            );
            for (id, battery) in &status.charging {
                println!("  charging  {id} ({battery}%)");
            }
            for (n, (id, battery)) in status.queue.iter().enumerate() {
                println!("  queued #{}  {id} ({battery}%)", n + 1);
            }
        }
        ChargingCmd::Request(a) => {
            let r = d.request_charging(&a.robot, now)?;
            println!("{}: {} at {} ({}%)", r.id, r.status, r.current_location, r.battery_level);
        }
    }
    Ok(())
}

async fn cmd_worker(cfg: Config, args: WorkerArgs) -> anyhow::Result<ExitCode> {
    let dir = state_dir(&cfg)?;
    match args.cmd {
        WorkerCmd::Start(start) => worker_start(cfg, dir, start).await?,
        WorkerCmd::Stop(stop) => {
            let timeout = worker::parse_duration(&stop.timeout)?;
            if worker::load_worker_lock(&dir)?.is_none() {
                println!("No worker running.");
            } else if worker::request_stop(&dir, timeout).await? {
                println!("Worker stopped.");
            } else {
                anyhow::bail!("timed out waiting for worker to stop (timeout: {timeout:?})");
            }
        }
        WorkerCmd::Status(status) => {
            let stats = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
                Ok(open_dispatcher(&cfg)?.stats()?)
            })
            .await??;
            let report = worker::worker_status(&dir, &stats)?;
            if status.json {
                print_json(&report)?;
            } else {
                println!("Worker running: {}", report.running);
                if let Some(pid) = report.pid {
                    println!("PID: {pid}");
                }
                if let Some(started) = report.started_at.as_deref() {
                    println!("Started: {started}");
                }
                println!("Stop requested: {}", report.stop_requested);
                if status.verbose {
                    println!("\nTask counts:");
                    for (k, v) in &report.counts {
                        println!("  {k}: {v}");
                    }
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn worker_start(cfg: Config, state_dir: PathBuf, args: WorkerStartArgs) -> anyhow::Result<()> {
    let tick_interval = match args.interval.as_deref() {
        Some(s) => worker::parse_duration(s)?,
        None => cfg.engine.tick_interval()?,
    };
    if tick_interval.is_zero() {
        anyhow::bail!("tick interval must be greater than zero");
    }

    if args.daemon {
        let exe = std::env::current_exe().context("failed to resolve current executable")?;
        let mut cmd = std::process::Command::new(exe);
        cmd.arg("worker").arg("start");
        if args.wait {
            cmd.arg("--wait");
        }
        if let Some(interval) = args.interval.as_deref() {
            cmd.args(["--interval", interval]);
        }
        if let Some(max) = args.max_ticks {
            cmd.args(["--max-ticks", &max.to_string()]);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        let child = cmd.spawn().context("failed to spawn worker process")?;
        println!("Started worker (pid={})", child.id());
        return Ok(());
    }

    println!("Starting worker (tick every {tick_interval:?})");
    let wcfg = WorkerConfig {
        state_dir,
        tick_interval,
        wait: args.wait,
        max_ticks: args.max_ticks,
    };
    let ticks = worker::run_worker(wcfg, move || open_dispatcher(&cfg)).await?;
    println!("Worker stopped after {ticks} tick(s).");
    Ok(())
}

fn cmd_version() -> ExitCode {
    println!("robodispatch version {}", env!("CARGO_PKG_VERSION"));
    if let Some(commit) = option_env!("ROBODISPATCH_GIT_COMMIT") {
        println!("  commit: {commit}");
    }
    println!("  rust: {}", rustc_version_runtime::version());
    println!(
        "  os/arch: {}/{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    ExitCode::SUCCESS
}

/// RFC 3339, or `+DURATION` relative to `now`.
fn parse_when(s: &str, now: OffsetDateTime) -> anyhow::Result<OffsetDateTime> {
    let s = s.trim();
    if let Some(rel) = s.strip_prefix('+') {
        let d = worker::parse_duration(rel)?;
        let d = time::Duration::try_from(d).context("duration out of range")?;
        return Ok(now + d);
    }
    OffsetDateTime::parse(s, &Rfc3339)
        .with_context(|| format!("expected RFC 3339 time or +DURATION, got '{s}'"))
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let mut s = serde_json::to_string_pretty(value)?;
    s.push('\n');
    print!("{s}");
    Ok(())
}

fn print_counts(title: &str, counts: &std::collections::BTreeMap<String, usize>) {
    println!("{title}:");
    for (k, v) in counts {
        println!("  {k}: {v}");
    }
}

fn print_view_change(view: &TaskView, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(view);
    }
    println!(
        "{}: {} override {:+}, effective priority {}",
        view.task.id, view.task.state, view.task.operator_override, view.effective_priority
    );
    Ok(())
}

fn print_task_change(task: &Task, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(task);
    }
    println!("{}: {}", task.id, task.state);
    Ok(())
}

fn print_tasks(
    cfg: &Config,
    views: &[TaskView],
    format: OutputFormat,
    now: OffsetDateTime,
) -> anyhow::Result<()> {
    if views.is_empty() && format == OutputFormat::Table {
        println!("No tasks found.");
        return Ok(());
    }
    let mut t = Table::new([
        "TASK", "TYPE", "STATE", "PRIORITY", "BASE", "OVERRIDE", "ROBOT", "STEP", "DEADLINE",
        "WAYPOINTS",
    ]);
    for v in views {
        let task = &v.task;
        let id = if cfg.ui.icons && format == OutputFormat::Table {
            format!("{} {}", state_icon(task.state), task.id)
        } else {
            task.id.clone()
        };
        t.row([
            id,
            task.task_type.to_string(),
            task.state.to_string(),
            v.effective_priority.to_string(),
            task.base_priority.to_string(),
            format!("{:+}", task.operator_override),
            task.assigned_robot
                .clone()
                .or_else(|| task.last_robot.clone())
                .unwrap_or_else(|| "-".to_owned()),
            format!("{}/{}", task.current_step, task.waypoints.len()),
            task.deadline.map_or_else(|| "-".to_owned(), |d| relative(d, now)),
            truncate(&task.waypoints.join(" > "), 48),
        ]);
    }
    t.emit(format, views)
}

fn print_robots(cfg: &Config, robots: &[RobotView], format: OutputFormat) -> anyhow::Result<()> {
    if robots.is_empty() && format == OutputFormat::Table {
        println!("No robots registered.");
        return Ok(());
    }
    let mut t = Table::new(["ROBOT", "STATUS", "BATTERY", "LOCATION", "TASK", "AVAILABLE"]);
    for v in robots {
        let r = &v.robot;
        let id = if cfg.ui.icons && format == OutputFormat::Table {
            format!("{} {}", robot_icon(r.status), r.id)
        } else {
            r.id.clone()
        };
        t.row([
            id,
            r.status.to_string(),
            format!("{}%", r.battery_level),
            r.current_location.clone(),
            r.current_task_id.clone().unwrap_or_else(|| "-".to_owned()),
            if v.available {
                "yes".to_owned()
            } else if v.needs_charge {
                "low battery".to_owned()
            } else {
                "no".to_owned()
            },
        ]);
    }
    t.emit(format, robots)
}

fn print_log(entries: &[AssignmentLog], format: OutputFormat) -> anyhow::Result<()> {
    if entries.is_empty() && format == OutputFormat::Table {
        println!("No assignments logged.");
        return Ok(());
    }
    let mut t = Table::new(["SEQ", "TIME", "TASK", "ROBOT", "PRIORITY", "SCORE", "REASON"]);
    for e in entries {
        t.row([
            e.seq.to_string(),
            e.timestamp
                .format(&Rfc3339)
                .unwrap_or_else(|_| "-".to_owned()),
            e.task_id.clone(),
            e.robot_id.clone(),
            e.effective_priority.to_string(),
            format!("{:.1}", e.score),
            if format == OutputFormat::Table {
                truncate(&e.reason, 60)
            } else {
                e.reason.clone()
            },
        ]);
    }
    t.emit(format, entries)
}

fn print_task_details(view: &TaskView, now: OffsetDateTime) {
    let task = &view.task;
    println!("Task: {} ({})", task.id, task.task_type);
    println!("State: {}", task.state);
    println!(
        "Priority: {} (base {}, override {:+}, urgency {})",
        view.effective_priority,
        task.base_priority,
        task.operator_override,
        view.effective_priority - task.base_priority - task.operator_override
    );
    println!("Released: {}", relative(task.release_time, now));
    if let Some(deadline) = task.deadline {
        println!("Deadline: {}", relative(deadline, now));
    }
    if let Some(start) = task.start_location.as_deref() {
        println!("Start location: {start}");
    }
    println!(
        "Waypoints ({}/{} confirmed): {}",
        task.current_step,
        task.waypoints.len(),
        task.waypoints.join(" > ")
    );
    if let Some(robot) = task.assigned_robot.as_deref() {
        println!("Robot: {robot}");
    } else if let Some(robot) = task.last_robot.as_deref() {
        println!("Last robot: {robot}");
    }
    if !task.depends_on.is_empty() {
        println!("Dependencies: {}", task.depends_on.join(", "));
    }
    if !task.override_history.is_empty() {
        println!("\nOverride history:");
        for r in &task.override_history {
            println!("  {}  {:+}  {:?}", relative(r.at, now), r.delta, r.source);
        }
    }
    if let Some(err) = task.last_error.as_deref()
        && !err.trim().is_empty()
    {
        println!("\nLast Error:\n{err}");
    }
}

fn describe_charging(decision: &ChargingDecision) -> String {
    match decision {
        ChargingDecision::Started { robot_id, battery } => {
            format!("started   {robot_id} ({battery}%)")
        }
        ChargingDecision::Queued {
            robot_id,
            battery,
            position,
        } => format!("queued    {robot_id} ({battery}%, #{position})"),
        ChargingDecision::Deferred {
            robot_id,
            task_id,
            critical,
        } => format!(
            "deferred  {robot_id} until {task_id} ends{}",
            if *critical { " (critical)" } else { "" }
        ),
        ChargingDecision::Finished { robot_id, battery } => {
            format!("finished  {robot_id} ({battery}%)")
        }
    }
}

fn state_icon(state: TaskState) -> &'static str {
    match state {
        TaskState::Waiting => "⏳",
        TaskState::Ready => "○",
        TaskState::Claimed => "◐",
        TaskState::Running => "●",
        TaskState::Paused => "‖",
        TaskState::Done => "✓",
        TaskState::Failed => "✗",
    }
}

fn robot_icon(status: RobotStatus) -> &'static str {
    match status {
        RobotStatus::Idle => "○",
        RobotStatus::Moving => "●",
        RobotStatus::Charging => "⚡",
        RobotStatus::Error => "✗",
    }
}

fn relative(at: OffsetDateTime, now: OffsetDateTime) -> String {
    let secs = (at - now).whole_seconds();
    let (sign, secs) = if secs < 0 { ("-", -secs) } else { ("+", secs) };
    if secs < 60 {
        format!("{sign}{secs}s")
    } else if secs < 3600 {
        format!("{sign}{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{sign}{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}

fn truncate(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if s.chars().count() > max {
        out.push_str("...");
    }
    out
}
