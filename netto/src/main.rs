use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netto::arbiter::TrafficArbiter;
use netto::channel::{DecisionChannel, FilterEndpoint};
use netto::classifier;
use netto::config::Config;
use netto::events::EventLog;
use netto::monitor::BandwidthMonitor;
use netto::monitor::publisher::SnapshotSubscription;
use netto::policy::PolicyStore;
use netto::process::ProcessBandwidth;
use netto_common::{ConnectionRequest, Direction};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

/// How often `serve` checks the channel and re-registers when it dropped
const REGISTER_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "netto")]
#[command(version)]
#[command(
    about = "Per-application traffic arbiter and per-process bandwidth monitor",
    long_about = None
)]
struct Args {
    /// Config file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register with the traffic filter and answer decision requests
    Serve {
        /// Also run the bandwidth monitor and log its snapshots
        #[arg(long)]
        monitor: bool,

        /// Decision channel socket
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },
    /// Print per-process bandwidth snapshots
    Monitor {
        /// Stop after this many snapshots
        #[arg(long, value_name = "N")]
        count: Option<usize>,

        /// Rows printed per snapshot
        #[arg(long, default_value_t = 15)]
        top: usize,
    },
    /// Inspect or edit stored decisions
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Tell whether an application is a proxy or VPN client
    Classify {
        app_id: String,

        /// Display name of the application
        #[arg(long)]
        name: Option<String>,
    },
    /// Act as the traffic filter: wait for a control process and ask it about one flow
    Simulate {
        app_id: String,
        host: String,
        port: u16,

        #[arg(long)]
        inbound: bool,

        /// Decision channel socket
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,

        /// Seconds to wait for a control process to register
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyAction {
    /// List stored decisions
    List,
    /// Allow an application
    Allow { app_id: String },
    /// Deny an application
    Deny { app_id: String },
}

fn open_policies(config: &Config) -> Result<PolicyStore> {
    let path = config.policy_path()?;
    PolicyStore::open(&path).with_context(|| format!("Failed to open policy store {:?}", path))
}

async fn run_serve(config: &Config, with_monitor: bool, socket: Option<PathBuf>) -> Result<()> {
    let arbiter = Arc::new(TrafficArbiter::new(
        open_policies(config)?,
        EventLog::new(config.event_log_capacity),
        config.default_allow,
    ));
    let channel = DecisionChannel::new(socket.unwrap_or_else(|| config.socket_path.clone()));

    let monitor = with_monitor.then(|| Arc::new(BandwidthMonitor::new(config.monitor_settings())));
    if let Some(monitor) = &monitor {
        let subscription = monitor.subscribe();
        if monitor.start().await.is_ok() {
            tokio::spawn(log_snapshots(subscription));
        }
    }

    let mut ticker = tokio::time::interval(REGISTER_INTERVAL);
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down");
                break;
            }
            _ = ticker.tick() => {
                if !channel.is_registered() {
                    log::debug!("Decision channel is {}", channel.state());
                    channel.register(arbiter.clone()).await;
                }
            }
        }
    }

    channel.unregister();
    if let Some(monitor) = &monitor {
        monitor.stop().await;
    }
    arbiter.flush();
    Ok(())
}

async fn log_snapshots(mut subscription: SnapshotSubscription) {
    while let Some(snapshot) = subscription.next().await {
        for process in snapshot.processes.iter().take(5) {
            log::info!(
                "{} ({}): down {} up {}",
                process.name,
                process.pid,
                ProcessBandwidth::format_rate(process.download_speed),
                ProcessBandwidth::format_rate(process.upload_speed)
            );
        }
    }
}

async fn run_monitor(config: &Config, count: Option<usize>, top: usize) -> Result<()> {
    let monitor = BandwidthMonitor::new(config.monitor_settings());
    let mut subscription = monitor.subscribe();
    monitor
        .start()
        .await
        .context("Failed to start bandwidth monitoring")?;

    let mut printed = 0;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!();
                break;
            }
            snapshot = subscription.next() => {
                let Some(snapshot) = snapshot else { break };
                print_snapshot(&snapshot.processes, top);
                printed += 1;
                if count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
        }
    }

    monitor.stop().await;
    Ok(())
}

fn print_snapshot(processes: &[ProcessBandwidth], top: usize) {
    println!("{:<32} {:>8} {:>14} {:>14}", "PROCESS", "PID", "DOWN", "UP");
    for process in processes.iter().take(top) {
        println!(
            "{:<32} {:>8} {:>14} {:>14}",
            process.name,
            process.pid,
            ProcessBandwidth::format_rate(process.download_speed),
            ProcessBandwidth::format_rate(process.upload_speed)
        );
    }
    println!();
}

fn run_policy(config: &Config, action: PolicyAction) -> Result<()> {
    let mut store = open_policies(config)?;

    match action {
        PolicyAction::List => {
            if store.is_empty() {
                println!("No stored decisions in {:?}", store.path());
            }
            for decision in store.all() {
                println!(
                    "{:<48} {:<6} {}",
                    decision.app_id,
                    if decision.allowed { "allow" } else { "deny" },
                    if decision.is_default() { "(default)" } else { "" }
                );
            }
            return Ok(());
        }
        PolicyAction::Allow { app_id } => store.set(&app_id, true),
        PolicyAction::Deny { app_id } => store.set(&app_id, false),
    }

    store.flush();
    if let Some(e) = store.last_persist_error() {
        return Err(e).context("Decision kept in memory but not saved");
    }
    println!("Saved to {:?}", store.path());
    Ok(())
}

async fn run_simulate(
    config: &Config,
    request: ConnectionRequest,
    socket: Option<PathBuf>,
    wait: Duration,
) -> Result<()> {
    let socket = socket.unwrap_or_else(|| config.socket_path.clone());
    let endpoint = FilterEndpoint::bind(&socket, config.reply_timeout())
        .with_context(|| format!("Failed to listen on {:?}", socket))?;

    println!("Waiting for a control process on {:?}", endpoint.path());
    let deadline = tokio::time::Instant::now() + wait;
    while !endpoint.is_registered() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("No control process registered within {:?}", wait);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let app_id = request.app_id.clone();
    let allowed = endpoint.request_decision(request).await?;
    println!("{}: {}", app_id, if allowed { "allow" } else { "deny" });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match args.command {
        Command::Serve { monitor, socket } => run_serve(&config, monitor, socket).await,
        Command::Monitor { count, top } => run_monitor(&config, count, top).await,
        Command::Policy { action } => run_policy(&config, action),
        Command::Classify { app_id, name } => {
            let proxy = classifier::is_proxy_app(&app_id, name.as_deref());
            println!("{}: {}", app_id, if proxy { "proxy/VPN" } else { "regular" });
            Ok(())
        }
        Command::Simulate {
            app_id,
            host,
            port,
            inbound,
            socket,
            wait,
        } => {
            let direction = if inbound {
                Direction::Inbound
            } else {
                Direction::Outbound
            };
            let request = ConnectionRequest::new(app_id, host, port, direction);
            run_simulate(&config, request, socket, Duration::from_secs(wait)).await
        }
    }
}
