//! Montagem da estação: registro, codec, transporte e gateway.
//!
//! Callbacks do registro e do transporte rodam na thread de I/O; aqui eles
//! só viram [`StationEvent`] num channel consumido pela thread principal.

use anyhow::{Context, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use groundlink_core::codec::PacketCodec;
use groundlink_core::config::AppConfig;
use groundlink_core::device::{MemoryHandle, NativeOpener, memory_link};
use groundlink_core::gateway::{Gateway, GatewayError, GatewayListener};
use groundlink_core::registry::{DispatchReport, Origin, TopicRegistry};
use groundlink_core::transport::{
    LinkFault, SerialTransport, TransportEvent, TransportListener, TransportState,
};
use groundlink_core::protocol::encode_frame;
use groundlink_core::types::{SensorSample, TelemetryIndex, TopicMessage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Espera máxima do loop principal entre checagens do sinal de parada.
const TICK: Duration = Duration::from_millis(200);

/// Mensagem entregue à thread principal.
#[derive(Debug, Clone, PartialEq)]
pub enum StationEvent {
    Telemetry(TelemetryIndex, Origin),
    Sample(SensorSample, Origin),
    Link(TransportEvent),
    /// Frame de entrada rejeitado pelo gateway
    Gateway(GatewayError),
}

/// Repassa erros e mudanças de estado do transporte e os frames rejeitados
/// pelo gateway. Os dados brutos ficam com o gateway.
struct LinkEvents(Sender<StationEvent>);

impl TransportListener for LinkEvents {
    fn on_data(&self, _chunk: &[u8]) {}

    fn on_error(&self, fault: &LinkFault) {
        let _ = self.0.send(StationEvent::Link(TransportEvent::Error(fault.clone())));
    }

    fn on_state(&self, state: TransportState) {
        let _ = self.0.send(StationEvent::Link(TransportEvent::State(state)));
    }
}

impl GatewayListener for LinkEvents {
    fn on_rejected(&self, error: &GatewayError) {
        let _ = self.0.send(StationEvent::Gateway(error.clone()));
    }
}

pub struct Station {
    registry: Arc<TopicRegistry>,
    transport: Arc<SerialTransport>,
    gateway: Arc<Gateway>,
    events: Receiver<StationEvent>,
    /// Lado "peer" do dispositivo em memória (só no modo loopback)
    peer: Option<MemoryHandle>,
    sensor_name: String,
    next_index: u32,
}

impl Station {
    /// Monta tudo e abre o link serial.
    pub fn start(config: &AppConfig) -> anyhow::Result<Self> {
        let port = config
            .serial
            .to_port_config()
            .context("Seção [serial] inválida")?;
        let options = config.link.to_options();

        let (transport, peer) = if config.station.loopback {
            let (opener, handle) = memory_link();
            handle.set_echo(true);
            info!("Modo LOOPBACK: escritas voltam como dados de entrada");
            (Arc::new(SerialTransport::new(opener, options)), Some(handle))
        } else {
            (Arc::new(SerialTransport::new(NativeOpener, options)), None)
        };

        let registry = Arc::new(TopicRegistry::new());
        let codec = Arc::new(PacketCodec::with_default_topics());
        let gateway = Gateway::new(Arc::clone(&registry), codec, &transport);

        let (tx, events) = unbounded();
        transport.add_listener(gateway.clone());
        let link_events = Arc::new(LinkEvents(tx.clone()));
        transport.add_listener(link_events.clone());
        gateway.add_listener(link_events);

        for &topic in &config.station.forward_topics {
            gateway
                .forward_topic(topic)
                .with_context(|| format!("Não foi possível encaminhar o tópico {topic}"))?;
        }

        let sink = tx.clone();
        registry.subscribe_message::<TelemetryIndex, _>(move |msg, origin| {
            let _ = sink.send(StationEvent::Telemetry(msg, origin));
        });
        registry.subscribe_message::<SensorSample, _>(move |msg, origin| {
            let _ = tx.send(StationEvent::Sample(msg, origin));
        });

        transport.configure(port)?;
        transport.open()?;

        Ok(Self {
            registry,
            transport,
            gateway,
            events,
            peer,
            sensor_name: config.station.sensor_name.clone(),
            next_index: 0,
        })
    }

    pub fn transport(&self) -> &SerialTransport {
        &self.transport
    }

    /// Publica a próxima amostra sintética do sensor.
    pub fn publish_sample(&mut self) -> anyhow::Result<DispatchReport> {
        let index = self.next_index;
        let t = f64::from(index) * 0.1;
        let sample = SensorSample::new(&self.sensor_name, index, t.sin(), t.cos(), t)?;
        let report = self.registry.publish_message(&sample)?;
        self.next_index = self.next_index.wrapping_add(1);
        Ok(report)
    }

    /// Loop principal: publica a cada `interval` e trata os eventos até
    /// `running` virar `false` ou o link falhar.
    pub fn run(&mut self, interval: Duration, running: &AtomicBool) -> anyhow::Result<()> {
        let started = Instant::now();
        let mut next_publish = started;

        while running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= next_publish {
                match self.publish_sample() {
                    Ok(report) if !report.is_clean() => {
                        warn!(
                            "Amostra #{}: {} assinantes falharam",
                            self.next_index.wrapping_sub(1),
                            report.failures.len()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Erro ao publicar amostra: {e}"),
                }
                if let Some(peer) = &self.peer {
                    if let Err(e) = self.simulate_peer(peer, started.elapsed()) {
                        warn!("Erro ao simular o peer: {e}");
                    }
                }
                next_publish = now + interval;
            }

            let wait = next_publish.saturating_duration_since(Instant::now()).min(TICK);
            match self.events.recv_timeout(wait) {
                Ok(event) => self.handle_event(event)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    /// No loopback faz o papel do peer e injeta um índice de telemetria.
    fn simulate_peer(&self, peer: &MemoryHandle, uptime: Duration) -> anyhow::Result<()> {
        let msg = TelemetryIndex {
            index: i64::from(self.next_index),
            timestamp_secs: u32::try_from(uptime.as_secs()).unwrap_or(u32::MAX),
        };
        peer.inject(&encode_frame(TelemetryIndex::TOPIC, &msg.to_payload()?)?);
        Ok(())
    }

    /// Próximo evento, esperando até `timeout`.
    #[cfg(test)]
    fn next_event(&self, timeout: Duration) -> Option<StationEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    fn handle_event(&self, event: StationEvent) -> anyhow::Result<()> {
        match event {
            StationEvent::Telemetry(msg, _) => {
                info!("← Telemetria #{} | t={}s", msg.index, msg.timestamp_secs);
            }
            StationEvent::Sample(sample, Origin::Local) => {
                debug!("→ {} #{}", sample.name(), sample.index);
            }
            StationEvent::Sample(sample, Origin::Remote) => {
                info!(
                    "← {} #{} | x={:.3} y={:.3} z={:.3}",
                    sample.name(),
                    sample.index,
                    sample.x,
                    sample.y,
                    sample.z
                );
            }
            StationEvent::Link(TransportEvent::Error(fault)) => warn!("Link: {fault}"),
            StationEvent::Link(TransportEvent::State(TransportState::Failed)) => {
                error!("Link serial falhou");
                bail!("Link serial falhou ({})", self.describe_port());
            }
            StationEvent::Link(TransportEvent::State(state)) => debug!("Link: {state:?}"),
            StationEvent::Link(TransportEvent::Data(_)) => {}
            StationEvent::Gateway(e) => warn!("Frame recebido descartado: {e}"),
        }
        Ok(())
    }

    fn describe_port(&self) -> String {
        self.transport
            .config()
            .map_or_else(|| "sem porta".into(), |c| c.to_string())
    }

    /// Fecha o transporte e registra os contadores finais.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.transport.close()?;
        let link = self.transport.stats();
        let gw = self.gateway.stats();
        info!(
            "Link encerrado: {} bytes enviados, {} recebidos | frames {} → / {} ← ({} rejeitados)",
            link.bytes_written, link.bytes_read, gw.frames_out, gw.frames_in, gw.rejected_in
        );
        Ok(())
    }
}
