//! # GroundLink Station
//!
//! Estação de solo: publica amostras de sensor, encaminha os tópicos
//! configurados pelo link serial (UART/Bluetooth SPP) e registra a
//! telemetria que volta do peer.
//!
//! ## Uso
//! ```bash
//! groundlink_station                       # config.toml ao lado do executável
//! groundlink_station --port COM3           # sobrescreve [serial].port
//! groundlink_station --loopback            # sem hardware (eco em memória)
//! groundlink_station --list-ports          # lista portas e sai
//! ```

mod station;

use clap::Parser;
use groundlink_core::config::AppConfig;
use groundlink_core::port::list_ports;
use station::Station;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "groundlink_station")]
#[command(about = "Estação de solo com link serial por tópicos")]
#[command(version)]
struct Args {
    /// Caminho do config.toml (padrão: ao lado do executável)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Porta serial (sobrescreve [serial].port)
    #[arg(short, long)]
    port: Option<String>,

    /// Usa um dispositivo em memória com eco em vez da UART
    #[arg(long)]
    loopback: bool,

    /// Lista as portas seriais disponíveis e sai
    #[arg(long)]
    list_ports: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if args.list_ports {
        let ports = list_ports().map_err(anyhow::Error::msg)?;
        if ports.is_empty() {
            println!("Nenhuma porta serial encontrada");
        }
        for port in ports {
            match port.product {
                Some(product) => println!("{:<20} {:<10} {product}", port.name, port.kind),
                None => println!("{:<20} {}", port.name, port.kind),
            }
        }
        return Ok(());
    }

    // ── Carregar config ──
    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if args.loopback {
        config.station.loopback = true;
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("Config: {e}");
        }
        anyhow::bail!("{} erro(s) em {}", errors.len(), config_path.display());
    }

    let interval = Duration::from_secs_f64(config.station.publish_interval_secs);

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   📡 GROUNDLINK STATION – ATIVO");
    println!("══════════════════════════════════════════════");
    if config.station.loopback {
        println!("  Porta:     loopback (memória)");
    } else {
        println!("  Porta:     {} @ {} baud", config.serial.port, config.serial.baud_rate);
    }
    println!("  Intervalo: {:.1}s", config.station.publish_interval_secs);
    println!("  Tópicos →: {:?}", config.station.forward_topics);
    println!(
        "  Protocolo: frame v{}",
        groundlink_core::protocol::PROTOCOL_VERSION
    );
    println!("══════════════════════════════════════════════");
    println!();

    let mut station = Station::start(&config)?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    info!("Estação ativa. Ctrl+C para sair.");

    let outcome = station.run(interval, &running);
    if let Err(e) = station.shutdown() {
        warn!("Encerramento incompleto: {e}");
    }
    outcome
}
