//! usb-session-monitor
//!
//! Watches USB devices on this host, negotiates access and opens permitted
//! devices, printing every session event until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::{DeviceDescriptor, setup_logging};
use monitor::{
    EventStream, MonitorConfig, MonitorEvent, PermissionRequest, RusbPlatform, SessionMonitor,
    create_event_channel,
};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-session-monitor")]
#[command(author, version, about = "Watch USB devices and manage their sessions")]
#[command(long_about = "
Tracks USB attach/detach on this host, requests access to matching devices
and opens them, printing session events as they happen.

EXAMPLES:
    # Watch every device
    usb-session-monitor

    # Only webcams from one vendor, opening them as they appear
    usb-session-monitor --filter 0x046d:* --auto-request

    # List matching devices and exit
    usb-session-monitor --list-devices --filter '!0x1d6b:*'

CONFIGURATION:
    The monitor looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-session/monitor.toml
    3. /etc/usb-session/monitor.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List matching USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Device filter `[!]0xVID:0xPID`, may be repeated
    #[arg(short, long, value_name = "FILTER")]
    filter: Vec<String>,

    /// Request permission for every attached device
    #[arg(long)]
    auto_request: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = MonitorConfig::default();
        let path = MonitorConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        MonitorConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        MonitorConfig::load_or_default()
    };
    config.filters.extend(args.filter.iter().cloned());
    config.validate().context("Invalid filter on command line")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.monitor.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-session-monitor v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let platform = Arc::new(RusbPlatform::new().context("Failed to initialize libusb")?);
    if !RusbPlatform::supports_hotplug() {
        warn!("libusb has no hotplug support here, relying on polling");
    }

    let monitor = Arc::new(
        SessionMonitor::new(platform, config).context("Failed to create session monitor")?,
    );

    if args.list_devices {
        let devices = monitor
            .device_list()
            .context("Failed to enumerate USB devices")?;
        print_devices(&monitor, &devices);
        return Ok(());
    }

    let (listener, events) = create_event_channel();
    monitor
        .set_listener(Arc::new(listener))
        .context("Failed to install listener")?;
    monitor.register().context("Failed to register for USB notifications")?;

    info!("Watching USB devices, press Ctrl+C to stop");
    watch(&monitor, events, args.auto_request).await;

    info!("Shutting down session monitor...");
    monitor.destroy();
    Ok(())
}

fn print_devices(monitor: &SessionMonitor, devices: &[DeviceDescriptor]) {
    if devices.is_empty() {
        println!("No USB devices found.");
        return;
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {} {:04x}:{:04x} - {} {}",
            device.name,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      Class {:02x}/{:02x}/{:02x}  Permitted: {}",
            device.class,
            device.subclass,
            device.protocol,
            monitor.has_permission(device)
        );
        if let Some(serial) = &device.serial_number {
            println!("      Serial: {}", serial);
        }
        println!();
    }
}

async fn watch(monitor: &SessionMonitor, events: EventStream, auto_request: bool) {
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                handle_event(monitor, event, auto_request);
            }
        }
    }
}

fn handle_event(monitor: &SessionMonitor, event: MonitorEvent, auto_request: bool) {
    match event {
        MonitorEvent::Attach(device) => {
            println!(
                "+ attach     {} {:04x}:{:04x}",
                device.name, device.vendor_id, device.product_id
            );
            if auto_request {
                match monitor.request_permission(&device) {
                    Ok(PermissionRequest::Cancelled) => {}
                    Ok(outcome) => info!("Permission for {}: {:?}", device.name, outcome),
                    Err(e) => warn!("Permission request for {} failed: {}", device.name, e),
                }
            }
        }
        MonitorEvent::Connect {
            device,
            block,
            newly_opened,
        } => {
            println!(
                "* connect    {} block={} new={} [{}]",
                device.name,
                block.id(),
                newly_opened,
                block.info()
            );
        }
        MonitorEvent::Disconnect { device, block } => {
            println!("- disconnect {} block={}", device.name, block.id());
        }
        MonitorEvent::Detach(device) => {
            println!("- detach     {}", device.name);
        }
        MonitorEvent::Cancel(device) => {
            println!("! cancel     {}", device.name);
        }
    }
}
