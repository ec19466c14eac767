use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::{
    ClassContext, CsvLog, MarkingPolicy, Outcome, ReplayRecognizer, RosterIndex,
    SessionController, SessionError, SessionSettings, StopSignal, SyntheticFrames,
};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start(&self, branch: &str, section: &str) -> zbus::Result<String>;
    fn stop(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance sessions")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an attendance session on the daemon
    Start {
        /// Branch, e.g. "CSE"
        branch: String,
        /// Section, e.g. "A"
        section: String,
    },
    /// Stop the daemon's session and print its summary
    Stop,
    /// Show daemon status
    Status,
    /// List the enrolled students of a class
    Roster {
        #[arg(long)]
        branch: String,
        #[arg(long)]
        section: String,
        #[command(flatten)]
        data: DataArgs,
    },
    /// Run a session offline from a replay script
    Run {
        branch: String,
        section: String,
        /// JSON-lines detections keyed by frame sequence
        #[arg(long)]
        replay: PathBuf,
        /// Number of synthetic frames to feed
        #[arg(long, default_value_t = 100)]
        frames: u32,
        /// Attendance CSV to append to
        #[arg(long, default_value = "attendance.csv")]
        log: PathBuf,
        /// Recognize every Nth frame
        #[arg(long, default_value_t = 2)]
        sample_every: u32,
        /// Flush every N sampling ticks
        #[arg(long, default_value_t = 10)]
        flush_every: u32,
        /// Distance below which a match is accepted
        #[arg(long, default_value_t = 75.0)]
        acceptance_bound: f32,
        #[arg(long, value_enum, default_value_t = Policy::Session)]
        policy: Policy,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        data: DataArgs,
    },
}

#[derive(clap::Args)]
struct DataArgs {
    /// Directory with one folder per enrolled identity
    #[arg(long, default_value = "dataset")]
    dataset: PathBuf,
    /// Student directory JSON
    #[arg(long, default_value = "student_database.json")]
    students: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum Policy {
    Session,
    Day,
}

impl From<Policy> for MarkingPolicy {
    fn from(p: Policy) -> Self {
        match p {
            Policy::Session => MarkingPolicy::Session,
            Policy::Day => MarkingPolicy::Day,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { branch, section } => {
            let proxy = connect(cli.system).await?;
            let reply = proxy.start(&branch, &section).await?;
            print_json(&reply)?;
        }
        Commands::Stop => {
            let proxy = connect(cli.system).await?;
            let reply = proxy.stop().await?;
            print_json(&reply)?;
        }
        Commands::Status => {
            let proxy = connect(cli.system).await?;
            let reply = proxy.status().await?;
            print_json(&reply)?;
        }
        Commands::Roster {
            branch,
            section,
            data,
        } => {
            let roster = RosterIndex::load(&data.dataset, &data.students)?;
            let context = ClassContext::new(&branch, &section);
            let members = roster.class_members(&context);
            if members.is_empty() {
                bail!("no enrolled students in class {context}");
            }
            println!("{context}: {} students", members.len());
            for record in members {
                println!("  {:<12} {}", record.roll_no, record.name);
            }
        }
        Commands::Run {
            branch,
            section,
            replay,
            frames,
            log,
            sample_every,
            flush_every,
            acceptance_bound,
            policy,
            json,
            data,
        } => {
            let settings = SessionSettings {
                sample_every,
                flush_every_ticks: flush_every,
                acceptance_bound,
                marking_policy: policy.into(),
                ..SessionSettings::default()
            };
            let stop = StopSignal::new();
            let signal = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal.raise();
                }
            });

            let context = ClassContext::new(&branch, &section);
            let summary = tokio::task::spawn_blocking(move || {
                run_offline(&data, &replay, &log, settings, context, frames, &stop)
            })
            .await??;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{summary}");
            }
        }
    }

    Ok(())
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    let connection = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn run_offline(
    data: &DataArgs,
    replay: &std::path::Path,
    log: &std::path::Path,
    settings: SessionSettings,
    context: ClassContext,
    frames: u32,
    stop: &StopSignal,
) -> Result<rollcall_core::SessionSummary> {
    let roster = RosterIndex::load(&data.dataset, &data.students)?;
    let recognizer = ReplayRecognizer::load(replay)?;
    let log = CsvLog::open(log)?;

    let mut controller = SessionController::new(roster, recognizer, log, settings);
    controller.start(context)?;

    let result = controller.run_with(&mut SyntheticFrames::new(frames), |_, report| {
        if let Some(report) = report {
            for marked in report.newly_marked() {
                if let Some(record) = &marked.record {
                    println!(
                        "frame {:>5}  present  {} ({})",
                        report.frame_sequence, record.name, record.roll_no
                    );
                }
            }
            for c in &report.classifications {
                if let (Outcome::WrongClass { enrolled_class }, Some(record)) = (&c.outcome, &c.record) {
                    tracing::debug!(name = %record.name, enrolled_class, "seen outside session class");
                }
            }
        }
        if stop.is_raised() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });

    match result {
        Ok(summary) => Ok(summary),
        Err(SessionError::Capture { source, summary }) => {
            eprintln!("capture failed: {source}");
            Ok(*summary)
        }
        Err(e) => Err(e.into()),
    }
}
