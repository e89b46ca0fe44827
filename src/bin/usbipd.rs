//! CLI front end (spec.md §6 "CLI (collaborator only)"). Subcommands
//! map one-to-one onto registry and enumerator operations; no
//! additional policy lives here. Exit codes: 0 success, 1 failure,
//! 2 parse-error, 3 cancelled.

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use usbipd::bus_id::BusId;
use usbipd::capture::{CaptureDriver, LinuxUsbfsCaptureDriver};
use usbipd::capture_sink::CaptureSink;
use usbipd::config::ServerConfig;
use usbipd::enumerator::{DeviceEnumerator, LinuxSysfsEnumerator};
use usbipd::flock::InstanceLock;
use usbipd::privilege::{AlwaysAllow, PrivilegeChecker, ProcessPrivilegeChecker};
use usbipd::protocol::ConnectedClientContext;
use usbipd::registry::{self, Registry};

#[cfg(feature = "test-support")]
use usbipd::capture::MockCaptureDriver;
#[cfg(feature = "test-support")]
use usbipd::enumerator::MockEnumerator;

#[derive(Parser)]
#[command(name = "usbipd", version, about = "USB/IP host server", long_about = None)]
struct Cli {
    /// Override the persisted binding registry path.
    #[arg(long, global = true)]
    registry_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a locally attached device (spec.md §4.B "bind").
    Bind {
        #[arg(long)]
        bus_id: String,
    },
    /// Stop sharing a device (spec.md §4.B "unbind").
    Unbind {
        #[arg(long)]
        bus_id: Option<String>,
        #[arg(long)]
        guid: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// List connected devices and their sharing/attachment state.
    List {
        /// Emit machine-readable JSON instead of the human table.
        #[arg(long)]
        json: bool,
    },
    /// Run the server (spec.md §9 "Service lifecycle").
    Server {
        /// Path to a TOML config file; defaults apply if absent.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Use in-memory mock collaborators instead of real USB hardware.
        #[cfg(feature = "test-support")]
        #[arg(long)]
        mock: bool,
    },
    /// Print license information.
    License,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let registry_path = cli.registry_path.clone().unwrap_or_else(registry::default_registry_path);
    match cli.command {
        Commands::Bind { bus_id } => cmd_bind(&registry_path, &bus_id).await,
        Commands::Unbind { bus_id, guid, all } => cmd_unbind(&registry_path, bus_id, guid, all).await,
        Commands::List { json } => cmd_list(&registry_path, json).await,
        #[cfg(feature = "test-support")]
        Commands::Server { config, mock } => cmd_server(registry_path, config, mock).await,
        #[cfg(not(feature = "test-support"))]
        Commands::Server { config } => cmd_server(registry_path, config).await,
        Commands::License => cmd_license(),
    }
}

fn parse_bus_id(raw: &str) -> Result<BusId, ExitCode> {
    raw.parse().map_err(|e| {
        eprintln!("invalid bus-id {raw:?}: {e}");
        ExitCode::from(2)
    })
}

async fn open_registry(path: &std::path::Path) -> Result<Registry, ExitCode> {
    Registry::open(path, Arc::new(ProcessPrivilegeChecker))
        .await
        .map_err(|e| {
            eprintln!("failed to open registry at {}: {e:#}", path.display());
            ExitCode::from(1)
        })
}

async fn cmd_bind(registry_path: &std::path::Path, bus_id: &str) -> ExitCode {
    let bus_id = match parse_bus_id(bus_id) {
        Ok(b) => b,
        Err(code) => return code,
    };
    let registry = match open_registry(registry_path).await {
        Ok(r) => r,
        Err(code) => return code,
    };
    let enumerator = LinuxSysfsEnumerator::new();
    let device = match enumerator.find(bus_id).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("failed to enumerate devices: {e:#}");
            return ExitCode::from(1);
        }
    };
    let currently_present = device.is_some();
    let description = device
        .as_ref()
        .map(|d| format!("VID_{:04X}&PID_{:04X}", d.vendor_id, d.product_id))
        .unwrap_or_else(|| "unknown".to_string());
    let instance_id = device.as_ref().map(|d| d.instance_id()).unwrap_or_default();

    match registry.bind(bus_id, description, instance_id, currently_present).await {
        Ok(guid) => {
            println!("bound {bus_id} ({guid})");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("bind failed: {e}");
            ExitCode::from(1)
        }
    }
}

async fn cmd_unbind(registry_path: &std::path::Path, bus_id: Option<String>, guid: Option<String>, all: bool) -> ExitCode {
    let specified = [bus_id.is_some(), guid.is_some(), all].iter().filter(|v| **v).count();
    if specified != 1 {
        eprintln!("exactly one of --bus-id, --guid, or --all is required");
        return ExitCode::from(2);
    }
    let registry = match open_registry(registry_path).await {
        Ok(r) => r,
        Err(code) => return code,
    };

    if all {
        return match registry.unbind_all().await {
            Ok(()) => {
                println!("unbound all devices");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("unbind failed: {e}");
                ExitCode::from(1)
            }
        };
    }

    if let Some(bus_id) = bus_id {
        let bus_id = match parse_bus_id(&bus_id) {
            Ok(b) => b,
            Err(code) => return code,
        };
        return match registry.unbind(bus_id).await {
            Ok(()) => {
                println!("unbound {bus_id}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("unbind failed: {e}");
                ExitCode::from(1)
            }
        };
    }

    let guid = guid.expect("exactly one selector was required above");
    let guid = match guid.parse::<Uuid>() {
        Ok(g) => g,
        Err(e) => {
            eprintln!("invalid guid {guid:?}: {e}");
            return ExitCode::from(2);
        }
    };
    match registry.unbind_by_guid(guid).await {
        Ok(()) => {
            println!("unbound {guid}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("unbind failed: {e}");
            ExitCode::from(1)
        }
    }
}

/// `list --json` row, mirroring the `UsbDevice` JSON field names
/// documented by usbipd-win's own client tooling (spec.md is silent on
/// a combined presentation of `listShared`/`listPersisted`; SPEC_FULL
/// §B adds this as the natural machine-readable counterpart).
#[derive(Serialize)]
struct ListedDeviceJson {
    #[serde(rename = "BusId")]
    bus_id: Option<String>,
    #[serde(rename = "ClientIPAddress")]
    client_ip_address: Option<String>,
    #[serde(rename = "Description")]
    description: String,
    #[serde(rename = "InstanceId")]
    instance_id: String,
    #[serde(rename = "PersistedGuid")]
    persisted_guid: Option<Uuid>,
    #[serde(rename = "IsForced")]
    is_forced: bool,
}

async fn cmd_list(registry_path: &std::path::Path, json: bool) -> ExitCode {
    let registry = match open_registry(registry_path).await {
        Ok(r) => r,
        Err(code) => return code,
    };
    let enumerator = LinuxSysfsEnumerator::new();
    let connected = match enumerator.list_connected().await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("failed to enumerate devices: {e:#}");
            return ExitCode::from(1);
        }
    };
    let shared = registry.list_shared().await;
    let connected_ids: Vec<BusId> = connected.iter().map(|d| d.bus_id).collect();
    let persisted = registry.list_persisted(&connected_ids).await;

    if json {
        let mut rows = Vec::new();
        for device in &connected {
            let shared_marker = shared.iter().find(|s| s.record.bus_id == device.bus_id);
            let (description, instance_id, persisted_guid, client_ip_address) = match shared_marker {
                None => (
                    format!("VID_{:04X}&PID_{:04X}", device.vendor_id, device.product_id),
                    device.instance_id(),
                    None,
                    None,
                ),
                Some(s) => {
                    let client = match s.attachment {
                        registry::AttachmentState::Attached { client_address, .. } => Some(client_address.to_string()),
                        registry::AttachmentState::Unattached => None,
                    };
                    (
                        s.record.stub_description.clone(),
                        s.record.instance_id.clone(),
                        Some(s.record.persistent_guid),
                        client,
                    )
                }
            };
            rows.push(ListedDeviceJson {
                bus_id: Some(device.bus_id.to_string()),
                client_ip_address,
                description,
                instance_id,
                persisted_guid,
                is_forced: false,
            });
        }
        for s in &persisted {
            rows.push(ListedDeviceJson {
                bus_id: None,
                client_ip_address: None,
                description: s.record.stub_description.clone(),
                instance_id: s.record.instance_id.clone(),
                persisted_guid: Some(s.record.persistent_guid),
                is_forced: false,
            });
        }
        match serde_json::to_string_pretty(&rows) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to serialize device list: {e}");
                ExitCode::from(1)
            }
        }
    } else {
        println!("Connected devices:");
        for device in &connected {
            let shared_marker = shared.iter().find(|s| s.record.bus_id == device.bus_id);
            let state = match shared_marker {
                None => "not shared".to_string(),
                Some(s) => match s.attachment {
                    registry::AttachmentState::Unattached => "shared".to_string(),
                    registry::AttachmentState::Attached { client_address, .. } => {
                        format!("shared, attached to {client_address}")
                    }
                },
            };
            println!(
                "  {}  {:04x}:{:04x}  {state}",
                device.bus_id, device.vendor_id, device.product_id
            );
        }

        if !persisted.is_empty() {
            println!("Persisted (not currently connected):");
            for s in &persisted {
                println!("  {}  {}", s.record.bus_id, s.record.stub_description);
            }
        }
        ExitCode::SUCCESS
    }
}

#[cfg(feature = "test-support")]
async fn cmd_server(registry_path: PathBuf, config_path: Option<PathBuf>, mock: bool) -> ExitCode {
    run_server(registry_path, config_path, mock).await
}

#[cfg(not(feature = "test-support"))]
async fn cmd_server(registry_path: PathBuf, config_path: Option<PathBuf>) -> ExitCode {
    run_server(registry_path, config_path, false).await
}

async fn run_server(registry_path: PathBuf, config_path: Option<PathBuf>, mock: bool) -> ExitCode {
    let mut config = match config_path {
        Some(path) => match ServerConfig::load(&path).await {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config at {}: {e:#}", path.display());
                return ExitCode::from(1);
            }
        },
        None => ServerConfig::default(),
    };
    config.registry_path = registry_path;

    let _instance_lock = match InstanceLock::acquire(&usbipd::flock::default_lock_path()) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(1);
        }
    };

    let privilege: Arc<dyn PrivilegeChecker> = if mock {
        Arc::new(AlwaysAllow)
    } else {
        Arc::new(ProcessPrivilegeChecker)
    };
    let registry = match Registry::open(&config.registry_path, privilege).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to open registry: {e:#}");
            return ExitCode::from(1);
        }
    };

    #[cfg(feature = "test-support")]
    let (enumerator, capture): (Arc<dyn DeviceEnumerator>, Arc<dyn CaptureDriver>) = if mock {
        (Arc::new(MockEnumerator::empty()), Arc::new(MockCaptureDriver::new(Vec::new())))
    } else {
        (Arc::new(LinuxSysfsEnumerator::new()), Arc::new(LinuxUsbfsCaptureDriver::new()))
    };
    #[cfg(not(feature = "test-support"))]
    let (enumerator, capture): (Arc<dyn DeviceEnumerator>, Arc<dyn CaptureDriver>) =
        (Arc::new(LinuxSysfsEnumerator::new()), Arc::new(LinuxUsbfsCaptureDriver::new()));

    let capture_sink = match &config.capture_path {
        Some(path) => match CaptureSink::open(path, config.capture_queue_depth).await {
            Ok(sink) => Some(sink.sender()),
            Err(e) => {
                warn!("failed to open capture sink at {}: {e:#}", path.display());
                None
            }
        },
        None => None,
    };

    let listen_addrs = config.listen_addrs.clone();
    let ctx = Arc::new(ConnectedClientContext {
        registry,
        enumerator,
        capture,
        config: Arc::new(config),
        capture_sink,
    });

    let root_cancellation = CancellationToken::new();
    let listener_cancellation = root_cancellation.clone();
    let listener_ctx = ctx.clone();
    let cancellation_deadline = ctx.config.cancellation_deadline();
    let mut listener_task = tokio::spawn(async move { usbipd::listener::run(&listen_addrs, listener_ctx, listener_cancellation).await });

    info!("usbipd started");
    tokio::select! {
        result = &mut listener_task => {
            match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    error!("listener failed: {e:#}");
                    ExitCode::from(1)
                }
                Err(e) => {
                    error!("listener task panicked: {e}");
                    ExitCode::from(1)
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, cancelling all sessions");
            root_cancellation.cancel();
            // spec.md §9 "join all tasks with a deadline, then exit":
            // give the listener (and, transitively, every attached
            // session it spawned) a bounded window to unwind before
            // exiting regardless.
            if tokio::time::timeout(cancellation_deadline, &mut listener_task).await.is_err() {
                warn!("listener did not finish within the shutdown deadline, exiting anyway");
            }
            ExitCode::from(3)
        }
    }
}

fn cmd_license() -> ExitCode {
    println!("usbipd is distributed under the terms of the MIT license or the Apache License (Version 2.0), at your option.");
    ExitCode::SUCCESS
}
