use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};
use coroutine_scan::NullCoroutineSource;
use patch_engine::{
    fan_out_control, list_target_pids, process_info, process_patch, process_unpatch, FanOutControl, InfoFilter,
    PatchEngineError, Storage,
};
use proc_ctl::{PtraceControl, Tid};

#[derive(Parser)]
#[command(name = "hotpatch", version, about = "Live user-space binary patching")]
struct Cli {
    /// Raise log verbosity; repeatable (warn, info, debug, trace).
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply a patch blob to one or more running processes.
    Patch {
        /// Mark the target as just-spawned: let the dynamic loader finish
        /// before scanning loaded objects.
        #[arg(short = 's', long = "just-started")]
        just_started: bool,
        #[arg(short = 'p', long = "pid")]
        pid: PidSelector,
        /// Feedback descriptor the caller already has open; unused beyond
        /// being accepted and echoed, since this tool has no daemon mode.
        #[arg(short = 'r', long = "fd")]
        fd: Option<i32>,
        patch_path: PathBuf,
    },
    /// Revoke a previously applied patch.
    Unpatch {
        #[arg(short = 'p', long = "pid")]
        pid: PidSelector,
        /// build-id or object file name; none means "every applied patch".
        selectors: Vec<String>,
    },
    /// List ELF objects loaded in a process and their patch status.
    Info {
        #[arg(short = 'b', long = "build-id", conflicts_with = "regexp")]
        build_id: Option<String>,
        #[arg(short = 'r', long = "regexp", conflicts_with = "build_id")]
        regexp: Option<String>,
        #[arg(short = 'p', long = "pid")]
        pid: Option<PidSelector>,
        #[arg(short = 's', long = "storage", conflicts_with = "build_id")]
        storage: Option<PathBuf>,
    },
}

#[derive(Clone)]
enum PidSelector {
    All,
    One(i32),
}

impl FromStr for PidSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            Ok(PidSelector::All)
        } else {
            s.parse::<i32>().map(PidSelector::One).map_err(|_| format!("invalid pid: {}", s))
        }
    }
}

fn resolve_pids(selector: &PidSelector) -> std::io::Result<Vec<i32>> {
    match selector {
        PidSelector::One(pid) => Ok(vec![*pid]),
        PidSelector::All => list_target_pids(std::process::id() as i32),
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).format_timestamp(None).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("hotpatch: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<bool> {
    match command {
        Command::Patch { just_started, pid, fd, patch_path } => run_patch(pid, just_started, fd, &patch_path),
        Command::Unpatch { pid, selectors } => run_unpatch(pid, &selectors),
        Command::Info { build_id, regexp, pid, storage } => run_info(build_id, regexp, pid, storage),
    }
}

fn run_patch(pid: PidSelector, just_started: bool, _fd: Option<i32>, patch_path: &PathBuf) -> Result<bool> {
    let mut storage = Storage::open(patch_path)?;
    let pids = resolve_pids(&pid)?;
    let mut all_ok = true;

    'fanout: for raw_pid in pids {
        let tid = Tid::from_raw(raw_pid);
        let mut ctl = PtraceControl::default();
        let summary = match process_patch(tid, &mut ctl, &mut storage, just_started, &NullCoroutineSource) {
            Ok(outcomes) => {
                let n: usize = outcomes
                    .iter()
                    .filter_map(|o| match o {
                        patch_engine::ObjectOutcome::Applied { hunks, .. } => Some(*hunks),
                        _ => None,
                    })
                    .sum();
                if n == 0 {
                    "no applicable patches".to_string()
                } else {
                    format!("applied {} patch hunk(s)", n)
                }
            }
            Err(e) => {
                all_ok = false;
                let code = callback_code(&e);
                println!("pid {}: failed: {}", raw_pid, e);
                if fan_out_control(code) == FanOutControl::Stop {
                    break 'fanout;
                }
                continue;
            }
        };
        println!("pid {}: {}", raw_pid, summary);
    }

    Ok(all_ok)
}

fn run_unpatch(pid: PidSelector, selectors: &[String]) -> Result<bool> {
    let pids = resolve_pids(&pid)?;
    let mut all_ok = true;

    'fanout: for raw_pid in pids {
        let tid = Tid::from_raw(raw_pid);
        let mut ctl = PtraceControl::default();
        match process_unpatch(tid, &mut ctl, selectors, &NullCoroutineSource) {
            Ok(outcomes) => {
                let n: usize = outcomes
                    .iter()
                    .filter_map(|o| match o {
                        patch_engine::ObjectOutcome::Revoked { hunks, .. } => Some(*hunks),
                        _ => None,
                    })
                    .sum();
                let summary = if n == 0 { "no applicable patches".to_string() } else { format!("revoked {} patch hunk(s)", n) };
                println!("pid {}: {}", raw_pid, summary);
            }
            Err(e) => {
                all_ok = false;
                let code = callback_code(&e);
                println!("pid {}: failed: {}", raw_pid, e);
                if fan_out_control(code) == FanOutControl::Stop {
                    break 'fanout;
                }
            }
        }
    }

    Ok(all_ok)
}

fn run_info(
    build_id: Option<String>,
    regexp: Option<String>,
    pid: Option<PidSelector>,
    storage: Option<PathBuf>,
) -> Result<bool> {
    let regex = regexp.as_deref().map(regex::Regex::new).transpose()?;
    let filter = if let Some(bid) = &build_id {
        InfoFilter::BuildId(bid)
    } else if let Some(re) = &regex {
        InfoFilter::NameRegex(re)
    } else {
        InfoFilter::HasStoragePatch
    };

    let mut storage = storage.map(|p| Storage::open(&p)).transpose()?;
    let pids = resolve_pids(&pid.unwrap_or(PidSelector::All))?;

    for raw_pid in pids {
        let tid = Tid::from_raw(raw_pid);
        let mut ctl = PtraceControl::default();
        let rows = match process_info(tid, &mut ctl, storage.as_mut(), &filter) {
            Ok(rows) => rows,
            Err(e) => {
                println!("pid {}: failed: {}", raw_pid, e);
                continue;
            }
        };
        for row in rows {
            println!("{}  {}  {}", row.build_id, row.path, row.status.as_str());
        }
    }

    Ok(true)
}

/// Maps an engine error to the `-1`/`-2` fan-out callback convention: every
/// failure is "recorded but continue" except a dead/unreachable target,
/// which stops the whole fan-out rather than spending the drive timeout on
/// every remaining PID.
fn callback_code(err: &PatchEngineError) -> i32 {
    match err {
        PatchEngineError::ProcessAttach(_) => -2,
        _ => -1,
    }
}
