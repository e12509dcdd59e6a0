//! bmcd: the BMC control daemon.
//!
//! Wires the bus, the supervisor, and the services together. Real
//! configuration management lives outside this core; the flags here cover
//! bring-up and development.
mod bus;
mod kvm;
mod mounts;
mod powermgr;
mod service;
mod telemetry;

use anyhow::Context;
use bus::Bus;
use clap::Parser;
use kvm::KvmService;
use powermgr::PowerManager;
use powermgr::config::{
    BackendConfig, ComponentConfig, ComponentType, GpioBackendConfig, LineRef, MockBackendConfig,
    PowerManagerConfig, ThermalConfig,
};
use service::{RestartPolicy, Supervisor};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "bmcd", about = "BMC hardware-control daemon")]
struct Args {
    /// Use mock power backends and the synthetic video pattern.
    #[arg(long)]
    mock: bool,

    /// Number of managed hosts.
    #[arg(long, default_value_t = 1)]
    hosts: u32,

    /// GPIO chip driving the power and reset buttons.
    #[arg(long, default_value = "/dev/gpiochip0")]
    gpio_chip: String,

    /// V4L2 capture device for the KVM.
    #[arg(long, default_value = "/dev/video0")]
    video_device: PathBuf,

    #[arg(long, default_value = "0.0.0.0:5900")]
    vnc_listen: SocketAddr,

    #[arg(long, default_value = "0.0.0.0:8080")]
    http_listen: SocketAddr,

    /// Components shut down on a thermal emergency, in order.
    #[arg(long = "shutdown-component")]
    shutdown_components: Vec<String>,

    /// Mount the virtual filesystems before starting (init duty).
    #[arg(long)]
    bootstrap_mounts: bool,
}

fn power_config(args: &Args) -> PowerManagerConfig {
    let mut components = Vec::new();
    for host in 0..args.hosts {
        let backend = if args.mock {
            BackendConfig::Mock(MockBackendConfig::default())
        } else {
            BackendConfig::Gpio(GpioBackendConfig {
                chip: args.gpio_chip.clone(),
                power_button: LineRef::Name(format!("power-btn-{host}")),
                power_button_active: bmc_gpio::Active::Low,
                reset_button: Some(LineRef::Name(format!("reset-btn-{host}"))),
                power_status: Some(LineRef::Name(format!("power-good-{host}"))),
                power_status_active: bmc_gpio::Active::High,
            })
        };
        components.push(ComponentConfig::new(
            format!("host.{host}"),
            ComponentType::Host,
            backend,
        ));
    }
    components.push(ComponentConfig::new(
        "bmc.0",
        ComponentType::Bmc,
        BackendConfig::Mock(MockBackendConfig::default()),
    ));

    let shutdown_components = if args.shutdown_components.is_empty() {
        components
            .iter()
            .filter(|c| c.component_type == ComponentType::Host)
            .map(|c| c.name.clone())
            .collect()
    } else {
        args.shutdown_components.clone()
    };

    PowerManagerConfig {
        components,
        thermal: ThermalConfig {
            shutdown_components,
            ..ThermalConfig::default()
        },
        ..PowerManagerConfig::default()
    }
}

fn kvm_config(args: &Args) -> kvm::KvmConfig {
    let mut config = kvm::KvmConfig::default();
    config.test_pattern = args.mock;
    config.video.device = args.video_device.clone();
    config.vnc.listen = args.vnc_listen;
    config.http.listen = args.http_listen;
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing("info");

    if args.bootstrap_mounts {
        mounts::bootstrap().context("mount bootstrap")?;
    }

    let bus = Bus::new();
    let metrics = telemetry::Metrics::new();
    let gpio = bmc_gpio::Manager::new(bmc_gpio::Defaults {
        consumer: "bmcd".into(),
        ..bmc_gpio::Defaults::default()
    });

    let mut supervisor = Supervisor::new(bus.connection(), RestartPolicy::default());
    supervisor.add_service(PowerManager::new(
        power_config(&args),
        gpio.clone(),
        metrics.clone(),
    ));
    supervisor.add_service(KvmService::new(kvm_config(&args), metrics.clone()));

    let root = CancellationToken::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                root.cancel();
            }
        });
    }

    supervisor.run(root).await;
    gpio.close().ok();
    tracing::info!("bmcd stopped");
    Ok(())
}
