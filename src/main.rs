//! Thin CLI over the ACC library (§6, §10.5): `acc run` drives one
//! bounded goal session; `acc doctor` checks decider/ADB reachability
//! without starting one. Grounded on the base crate's `main.rs`
//! `#[derive(Parser)]`/`#[derive(Subcommand)]` shape and `run_doctor()`;
//! terminal narration reuses `oneshot.rs`'s ANSI constants, driven off
//! the `Event` stream rather than interleaved with business logic.

use acc::config::AccConfig;
use acc::decider::{LocalDecider, RemoteDecider};
use acc::orchestrator::{CancelToken, Orchestrator};
use acc::{register_builtin_tools, AdbActionSink, AdbScreenSource, Event, ToolRegistry};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

#[derive(Parser)]
#[command(name = "acc", version, about = "Agent Control Core: goal-directed UI automation")]
struct Cli {
    #[arg(short, long, help = "Path to a TOML config file (optional)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one goal-directed session to completion.
    Run {
        #[arg(long, help = "Natural-language goal, e.g. \"Open Clock and set a 5 minute timer\"")]
        goal: String,
        #[arg(long, value_enum, default_value = "auto")]
        model: ModelChoice,
        #[arg(long, help = "Override AGENT_MAX_STEPS")]
        max_steps: Option<u32>,
        #[arg(long, help = "Override the max run duration, in seconds")]
        max_duration: Option<u64>,
        #[arg(long, value_enum, default_value = "off")]
        vision: VisionChoice,
        #[arg(long, help = "Target a specific adb device, e.g. emulator-5554")]
        adb_device: Option<String>,
    },
    /// Check decider reachability and ADB connectivity without a run.
    Doctor,
}

#[derive(Clone, clap::ValueEnum)]
enum ModelChoice {
    Local,
    Remote,
    Auto,
}

#[derive(Clone, clap::ValueEnum)]
enum VisionChoice {
    On,
    Off,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "acc=info".into()))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match AccConfig::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{RED}configuration error:{RESET} {e}");
                return std::process::ExitCode::from(4);
            }
        },
        None => AccConfig::default_with_env(),
    };

    match cli.command {
        Command::Doctor => {
            run_doctor(&config).await;
            std::process::ExitCode::from(0)
        }
        Command::Run { goal, model, max_steps, max_duration, vision, adb_device } => {
            run_goal(config, goal, model, max_steps, max_duration, vision, adb_device).await
        }
    }
}

async fn run_goal(
    mut config: AccConfig,
    goal: String,
    model: ModelChoice,
    max_steps: Option<u32>,
    max_duration: Option<u64>,
    vision: VisionChoice,
    adb_device: Option<String>,
) -> std::process::ExitCode {
    if let Some(n) = max_steps {
        config.orchestrator.max_steps = n;
    }
    if let Some(secs) = max_duration {
        config.orchestrator.max_duration_secs = secs;
    }
    if let Some(ref mut remote) = config.decider.remote {
        remote.vision_enabled = matches!(vision, VisionChoice::On);
    }

    let (remote, local) = match model {
        ModelChoice::Remote => (build_remote(&config), None),
        ModelChoice::Local => (None, build_local(&config)),
        ModelChoice::Auto => (build_remote(&config), build_local(&config)),
    };

    if remote.is_none() && local.is_none() {
        eprintln!(
            "{RED}configuration error:{RESET} no decider configured — set AGENT_REMOTE_ENDPOINT/AGENT_REMOTE_API_KEY \
             or configure a local backend in the config file"
        );
        return std::process::ExitCode::from(4);
    }

    let screen_source = Arc::new(AdbScreenSource::new(adb_device.clone()));
    let action_sink = Arc::new(AdbActionSink::new(adb_device));
    let mut tools = ToolRegistry::new();
    register_builtin_tools(&mut tools);

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let cancel = CancelToken::new();

    let orchestrator =
        Orchestrator::new(config, screen_source, action_sink, remote, local, tools, tx, cancel.clone());

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.request_stop();
            }
        });
    }

    println!("{BOLD}{CYAN}Goal:{RESET} {goal}\n");

    let run_handle = tokio::spawn(async move { orchestrator.run(&goal).await });

    let mut exit_code: u8 = 1;
    while let Some(event) = rx.recv().await {
        match event {
            Event::Log(msg) => println!("{DIM}· {msg}{RESET}"),
            Event::Step { step, action, result } => {
                println!("{BOLD}[{step}]{RESET} {action} {DIM}->{RESET} {result}");
                info!("step {step}: {action} -> {result}");
            }
            Event::Speak(text) => println!("{CYAN}says:{RESET} {text}"),
            Event::Done(reason) => {
                let terse = reason.starts_with("Max steps") || reason.starts_with("Max duration");
                println!("\n{GREEN}{BOLD}done:{RESET} {reason}");
                exit_code = if terse { 3 } else { 0 };
            }
            Event::Error(msg) => {
                println!("\n{RED}{BOLD}error:{RESET} {msg}");
                exit_code = 1;
            }
        }
    }

    match run_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            eprintln!("{RED}run failed:{RESET} {e}");
        }
        Err(e) => {
            error!("orchestrator task panicked: {e}");
            exit_code = 1;
        }
    }

    if cancel.is_stopped() && exit_code == 1 {
        exit_code = 2;
    }

    std::process::ExitCode::from(exit_code)
}

fn build_remote(config: &AccConfig) -> Option<Arc<dyn acc::Decider>> {
    let remote_config = config.decider.remote.clone()?;
    if remote_config.endpoint.is_empty() || remote_config.api_key.is_empty() {
        return None;
    }
    Some(Arc::new(RemoteDecider::new(remote_config)))
}

fn build_local(config: &AccConfig) -> Option<Arc<dyn acc::Decider>> {
    config.decider.local.clone().map(|c| Arc::new(LocalDecider::new(c)) as Arc<dyn acc::Decider>)
}

async fn run_doctor(config: &AccConfig) {
    println!("{BOLD}ACC Doctor{RESET}\n");

    match &config.decider.remote {
        Some(remote) if !remote.endpoint.is_empty() => {
            print!("remote decider ({}): ", remote.endpoint);
            match reqwest::Client::new().head(&remote.endpoint).send().await {
                Ok(resp) if resp.status().is_success() || resp.status().as_u16() < 500 => {
                    println!("{GREEN}reachable{RESET}")
                }
                Ok(resp) => println!("{YELLOW}responded with {}{RESET}", resp.status()),
                Err(e) => println!("{RED}unreachable: {e}{RESET}"),
            }
        }
        _ => println!("remote decider: {YELLOW}not configured{RESET}"),
    }

    match &config.decider.local {
        Some(local) => println!("local decider: {GREEN}configured{RESET} ({} @ {})", local.model, local.endpoint),
        None => println!("local decider: {YELLOW}not configured{RESET}"),
    }

    print!("adb: ");
    match tokio::process::Command::new("adb").args(["devices"]).output().await {
        Ok(out) => {
            let devices = String::from_utf8_lossy(&out.stdout);
            let connected = devices.lines().filter(|l| l.contains("\tdevice")).count();
            if connected > 0 {
                println!("{GREEN}{connected} device(s) connected{RESET}");
            } else {
                println!("{YELLOW}no devices connected{RESET}");
            }
        }
        Err(_) => println!("{RED}not found in PATH{RESET}"),
    }

    println!(
        "\nbudgets: max_steps={} max_duration_secs={} step_delay_ms={} max_tool_iterations={}",
        config.orchestrator.max_steps,
        config.orchestrator.max_duration_secs,
        config.orchestrator.step_delay_ms,
        config.orchestrator.max_tool_iterations,
    );
}
