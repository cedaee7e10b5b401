mod capability;
mod command;
mod config;
mod queue;
mod store;
mod transport;

use anyhow::{bail, Context, Result};
use capability::CapabilityDetector;
use clap::{ArgAction, Parser, Subcommand};
use command::{CommandExecutor, MqttCommandExecutor, SshCommandExecutor};
use config::OrchestratorConfig;
use fleet_shared::{Command, Device, DeviceClass, DeviceStatus};
use queue::{QueueEvent, QueueManager};
use std::path::PathBuf;
use std::sync::Arc;
use store::SqliteStore;
use tokio::sync::mpsc;
use transport::{MqttConnector, OpenSshConnector, RumqttConnector, SshConnector, TcpProbe};

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// fleetd - capability-aware command routing for SSH and MQTT device fleets
#[derive(Parser)]
#[command(name = "fleetd", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "FLEETD_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database holding devices and commands
    #[arg(long)]
    database: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Sweep pending commands periodically until interrupted
    Run {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,

        /// Override the sweep interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Queue a command for a device
    Submit {
        device: String,
        verb: String,
        /// Arguments passed to the verb
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
        /// Execute right away if the device is online
        #[arg(long)]
        now: bool,
    },
    /// Register a device and assign its baseline capabilities
    Register {
        id: String,
        /// Hardware class (raspberry_pi, jetson, beagle_bone, orange_pi, esp32, generic)
        #[arg(long, default_value = "generic")]
        class: DeviceClass,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        overlay_ip: Option<String>,
        /// SSH user for this device only
        #[arg(long)]
        ssh_user: Option<String>,
        /// Initial liveness status
        #[arg(long, default_value = "OFFLINE")]
        status: DeviceStatus,
        /// Skip the SSH reachability probe
        #[arg(long)]
        no_probe: bool,
    },
    /// Record a device's liveness status
    SetStatus { id: String, status: DeviceStatus },
    /// Show devices and commands
    List,
}

/// Everything the subcommands share
struct Runtime {
    config: OrchestratorConfig,
    store: Arc<SqliteStore>,
    detector: Arc<CapabilityDetector>,
    manager: Arc<QueueManager>,
}

impl Runtime {
    fn build(
        config: OrchestratorConfig,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> Result<Self> {
        let store = SqliteStore::open(&config.database)
            .with_context(|| format!("opening {}", config.database.display()))?;
        let store = Arc::new(store);

        let ssh = Arc::new(OpenSshConnector::new(config.ssh.transport_options()));
        let broker = Arc::new(RumqttConnector::new(config.mqtt.broker_options()));
        debug!(
            "[MAIN] transports: ssh via {}, mqtt via {}",
            ssh.name(),
            broker.name()
        );
        let executors: Vec<Arc<dyn CommandExecutor>> = vec![
            Arc::new(SshCommandExecutor::new(ssh, config.ssh.executor_config())),
            Arc::new(MqttCommandExecutor::new(broker, config.mqtt.executor_config())),
        ];

        let detector = Arc::new(CapabilityDetector::new(
            Arc::new(TcpProbe::new()),
            config.probe.timeout(),
        ));
        let manager = QueueManager::new(
            store.clone(),
            executors,
            Arc::new(events),
            config.queue.clone(),
        )
        .with_detector(detector.clone());

        Ok(Self {
            config,
            store,
            detector,
            manager: Arc::new(manager),
        })
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = OrchestratorConfig::load(cli.config.as_deref())?;
    if let Some(path) = cli.database {
        config.database = path;
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let runtime = Runtime::build(config, event_tx)?;
    let events = tokio::spawn(handle_queue_events(event_rx));

    let result = dispatch(&runtime, cli.command).await;

    // The manager owns the last sender; dropping it lets the event task drain and exit
    let Runtime { manager, .. } = runtime;
    drop(manager);
    if let Err(e) = events.await {
        error!("[MAIN] event task ended abnormally: {}", e);
    }
    result
}

async fn dispatch(runtime: &Runtime, command: Cmd) -> Result<()> {
    match command {
        Cmd::Run { once, interval } => run(runtime, once, interval).await,
        Cmd::Submit {
            device,
            verb,
            args,
            now,
        } => submit(runtime, &device, &verb, args, now).await,
        Cmd::Register {
            id,
            class,
            name,
            ip,
            overlay_ip,
            ssh_user,
            status,
            no_probe,
        } => {
            let mut device = Device::new(id.clone(), name.unwrap_or(id), class);
            device.ip_address = ip;
            device.overlay_ip = overlay_ip;
            device.ssh_username = ssh_user;
            device.status = status;

            let device = runtime.detector.register_device(device, !no_probe).await;
            println!(
                "{} [{}] protocols={:?} commands={:?} restrictions={:?}",
                device.id,
                device.class,
                device.capabilities.protocols(),
                device.capabilities.commands(),
                device.capabilities.restrictions()
            );
            runtime.store.upsert_device(device).await?;
            Ok(())
        }
        Cmd::SetStatus { id, status } => {
            let device = runtime.manager.set_device_status(&id, status).await?;
            println!("{} is now {}", device.id, device.status);
            Ok(())
        }
        Cmd::List => list(&runtime.store).await,
    }
}

async fn run(runtime: &Runtime, once: bool, interval: Option<u64>) -> Result<()> {
    if once {
        let report = runtime.manager.process_queue().await?;
        println!(
            "sweep: {} devices, {} executed, {} deferred",
            report.devices, report.executed, report.deferred
        );
        return Ok(());
    }

    let period = match interval {
        Some(secs) => std::time::Duration::from_secs(secs.max(1)),
        None => runtime.config.queue.sweep_interval(),
    };
    info!(
        "[MAIN] fleetd starting, database {}",
        runtime.config.database.display()
    );
    info!(
        "[MAIN]   MQTT broker: {}:{}",
        runtime.config.mqtt.host, runtime.config.mqtt.port
    );
    runtime.manager.start_queue_processing(period).await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("[MAIN] shutting down");

    runtime.manager.stop_queue_processing().await;
    Ok(())
}

async fn submit(
    runtime: &Runtime,
    device_id: &str,
    verb: &str,
    args: Vec<String>,
    now: bool,
) -> Result<()> {
    if verb.trim().is_empty() {
        bail!("command verb must not be empty");
    }
    let arguments = (!args.is_empty()).then(|| args.join(" "));
    let command = Command::new(uuid::Uuid::new_v4().to_string(), device_id, verb, arguments);
    let command_id = command.id.clone();
    runtime.store.insert_command(command).await?;
    println!("queued {} for {}", command_id, device_id);

    if now {
        let outcome = runtime
            .manager
            .execute_or_queue(device_id, &command_id)
            .await?;
        println!("{:?}", outcome);
    }
    Ok(())
}

async fn list(store: &SqliteStore) -> Result<()> {
    let snapshot = store.snapshot().await?;
    println!("DEVICES");
    for device in &snapshot.devices {
        println!(
            "  {:<16} {:<12} {:<12} {:<16} {:?}",
            device.id,
            device.class,
            device.status,
            device.preferred_address().unwrap_or("-"),
            device.capabilities.protocols()
        );
    }
    println!("COMMANDS");
    for command in &snapshot.commands {
        println!(
            "  {} {:<16} {:<10} {:<24} {}",
            command.id,
            command.device_id,
            command.status,
            command.shell_line(),
            command
                .exit_code
                .map_or_else(|| "-".to_string(), |c| c.to_string())
        );
    }
    Ok(())
}

/// Log queue events as they happen
async fn handle_queue_events(mut events: mpsc::UnboundedReceiver<QueueEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            QueueEvent::CommandStarted {
                command_id,
                device_id,
                protocol,
            } => {
                info!(
                    "[EVENT] {} started on {} via {}",
                    command_id, device_id, protocol
                );
            }
            QueueEvent::CommandFinished {
                command_id,
                device_id,
                status,
                exit_code,
                error,
            } => match error {
                Some(error) => warn!(
                    "[EVENT] {} on {} -> {} (exit {:?}): {}",
                    command_id, device_id, status, exit_code, error
                ),
                None => info!(
                    "[EVENT] {} on {} -> {} (exit {:?})",
                    command_id, device_id, status, exit_code
                ),
            },
            QueueEvent::DeviceStatusChanged {
                device_id,
                from,
                to,
            } => {
                info!("[EVENT] {} {} -> {}", device_id, from, to);
            }
            QueueEvent::CapabilitiesUpdated {
                device_id,
                capabilities,
            } => {
                info!(
                    "[EVENT] {} capabilities now protocols={:?} commands={:?}",
                    device_id,
                    capabilities.protocols(),
                    capabilities.commands()
                );
            }
            QueueEvent::SweepCompleted(report) => {
                debug!(
                    "[EVENT] sweep done: {} executed, {} deferred, {} skipped",
                    report.executed, report.deferred, report.skipped
                );
            }
        }
    }
}
