//! Gateway entre o [`TopicRegistry`] e o link serial.
//!
//! - **Saída**: tópicos marcados com `forward_topic` têm cada `publish`
//!   local enquadrado ([`encode_frame`]) e entregue ao link.
//! - **Entrada**: chunks do transporte (sem alinhamento de frame) passam
//!   pelo [`FrameDecoder`]; cada frame válido é redespachado no registro com
//!   [`Origin::Remote`], e por isso nunca é reenviado ao peer.

use crate::codec::{CodecError, PacketCodec, TopicId};
use crate::protocol::{FrameDecoder, WireError, encode_frame};
use crate::registry::{DispatchReport, Frame, Origin, SubscriptionHandle, TopicRegistry};
use crate::transport::{LinkFault, SerialTransport, TransportError, TransportListener};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, info, warn};

/// Destino dos frames de saída.
pub trait OutboundLink: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError>;
}

impl OutboundLink for SerialTransport {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.enqueue_write(frame)
    }
}

/// Erros do gateway, reportados por frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Tópico {topic}: payload com {actual} bytes, layout exige {expected}")]
    LengthMismatch {
        topic: TopicId,
        expected: usize,
        actual: usize,
    },

    #[error("Link de saída não existe mais")]
    LinkGone,
}

/// Consumidor dos frames de entrada rejeitados.
///
/// Chamado na thread de I/O quando o gateway está registrado como listener
/// do transporte; um consumidor single-thread deve encaminhar via channel.
pub trait GatewayListener: Send + Sync {
    fn on_rejected(&self, error: &GatewayError);
}

impl GatewayListener for Sender<GatewayError> {
    fn on_rejected(&self, error: &GatewayError) {
        let _ = self.send(error.clone());
    }
}

/// Resultado de um `feed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedReport {
    /// Frames entregues ao registro
    pub dispatched: usize,
    pub errors: Vec<GatewayError>,
    /// Bytes descartados na ressincronização durante este feed
    pub discarded_bytes: u64,
}

/// Contadores do gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    pub frames_out: u64,
    pub frames_in: u64,
    pub rejected_in: u64,
    pub send_errors: u64,
}

#[derive(Default)]
struct Counters {
    frames_out: AtomicU64,
    frames_in: AtomicU64,
    rejected_in: AtomicU64,
    send_errors: AtomicU64,
}

pub struct Gateway {
    registry: Arc<TopicRegistry>,
    codec: Arc<PacketCodec>,
    link: Weak<dyn OutboundLink>,
    decoder: Mutex<FrameDecoder>,
    forwarded: Mutex<BTreeMap<TopicId, SubscriptionHandle>>,
    listeners: RwLock<Vec<Arc<dyn GatewayListener>>>,
    counters: Counters,
}

impl Gateway {
    /// Guarda só uma referência fraca ao link: quem é dono do transporte
    /// é a aplicação.
    pub fn new<L>(registry: Arc<TopicRegistry>, codec: Arc<PacketCodec>, link: &Arc<L>) -> Arc<Self>
    where
        L: OutboundLink + 'static,
    {
        let link: Arc<dyn OutboundLink> = link.clone();
        Arc::new(Self {
            registry,
            codec,
            link: Arc::downgrade(&link),
            decoder: Mutex::new(FrameDecoder::new()),
            forwarded: Mutex::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    /// Espelha no link todo `publish` local do tópico.
    pub fn forward_topic(self: &Arc<Self>, topic: TopicId) -> Result<(), GatewayError> {
        self.codec.width(topic)?;

        let mut forwarded = lock(&self.forwarded);
        if forwarded.contains_key(&topic) {
            return Ok(());
        }

        let gateway = Arc::downgrade(self);
        let handle = self.registry.subscribe(topic, move |frame| {
            if frame.origin == Origin::Remote {
                return Ok(());
            }
            match gateway.upgrade() {
                Some(gw) => gw
                    .send(frame)
                    .map_err(|e| crate::registry::HandlerError::Failed(e.to_string())),
                None => Ok(()),
            }
        });
        forwarded.insert(topic, handle);
        info!("Tópico {topic} encaminhado para o link serial");
        Ok(())
    }

    /// Para de espelhar o tópico. Retorna `false` se ele não era encaminhado.
    pub fn stop_forwarding(&self, topic: TopicId) -> bool {
        match lock(&self.forwarded).remove(&topic) {
            Some(handle) => {
                self.registry.unsubscribe(handle);
                info!("Tópico {topic} não é mais encaminhado");
                true
            }
            None => false,
        }
    }

    /// Registra um consumidor dos erros de entrada vistos em `on_data`.
    pub fn add_listener(&self, listener: Arc<dyn GatewayListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    pub fn forwarded_topics(&self) -> Vec<TopicId> {
        lock(&self.forwarded).keys().copied().collect()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            frames_out: self.counters.frames_out.load(Ordering::Relaxed),
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            rejected_in: self.counters.rejected_in.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
        }
    }

    /// Enquadra e entrega um frame local ao link.
    fn send(&self, frame: &Frame) -> Result<(), GatewayError> {
        let result = self.check_width(frame.topic, frame.payload.len()).and_then(|()| {
            let wire = encode_frame(frame.topic, &frame.payload)?;
            let link = self.link.upgrade().ok_or(GatewayError::LinkGone)?;
            link.send_frame(wire)?;
            Ok(())
        });

        match &result {
            Ok(()) => {
                self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
                debug!("→ tópico {} ({} bytes)", frame.topic, frame.payload.len());
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Falha ao encaminhar tópico {}: {e}", frame.topic);
            }
        }
        result
    }

    fn check_width(&self, topic: TopicId, actual: usize) -> Result<(), GatewayError> {
        let expected = self.codec.width(topic)?;
        if actual < expected {
            return Err(CodecError::ShortBuffer {
                topic,
                expected,
                actual,
            }
            .into());
        }
        if actual > expected {
            return Err(GatewayError::LengthMismatch {
                topic,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Processa um chunk de entrada. Bytes de um frame incompleto ficam
    /// retidos para o próximo chunk.
    pub fn feed(&self, chunk: &[u8]) -> FeedReport {
        // Extrai tudo sob o lock e despacha depois, fora dele
        let (frames, discarded_bytes) = {
            let mut decoder = lock(&self.decoder);
            let before = decoder.discarded();
            decoder.push(chunk);
            let frames: Vec<_> = std::iter::from_fn(|| decoder.next_frame()).collect();
            (frames, decoder.discarded() - before)
        };

        let mut report = FeedReport {
            discarded_bytes,
            ..Default::default()
        };
        for candidate in frames {
            match candidate
                .map_err(GatewayError::from)
                .and_then(|wf| self.check_width(wf.topic, wf.payload.len()).map(|()| wf))
            {
                Ok(wf) => {
                    let frame = Frame {
                        topic: wf.topic,
                        payload: wf.payload,
                        origin: Origin::Remote,
                    };
                    debug!("← tópico {} ({} bytes)", frame.topic, frame.payload.len());
                    let dispatch: DispatchReport = self.registry.dispatch(&frame);
                    if !dispatch.is_clean() {
                        debug!(
                            "Tópico {}: {} assinantes falharam",
                            frame.topic,
                            dispatch.failures.len()
                        );
                    }
                    self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
                    report.dispatched += 1;
                }
                Err(e) => {
                    warn!("Frame de entrada rejeitado: {e}");
                    self.counters.rejected_in.fetch_add(1, Ordering::Relaxed);
                    report.errors.push(e);
                }
            }
        }
        report
    }

    /// Bytes retidos esperando o resto de um frame.
    pub fn buffered(&self) -> usize {
        lock(&self.decoder).buffered()
    }
}

impl TransportListener for Gateway {
    fn on_data(&self, chunk: &[u8]) {
        let report = self.feed(chunk);
        if report.errors.is_empty() {
            return;
        }
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for error in &report.errors {
            for l in &listeners {
                l.on_rejected(error);
            }
        }
    }

    fn on_error(&self, fault: &LinkFault) {
        debug!("Gateway ignorando falha do transporte: {fault}");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory_link;
    use crate::port::PortConfig;
    use crate::transport::LinkOptions;
    use crate::types::{
        SENSOR_SAMPLE_TOPIC, SensorSample, TELEMETRY_INDEX_TOPIC, TelemetryIndex, TopicMessage,
    };
    use std::time::Duration;

    /// Link que só guarda os frames enviados.
    #[derive(Default)]
    struct CaptureLink {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl OutboundLink for CaptureLink {
        fn send_frame(&self, frame: Vec<u8>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn setup() -> (Arc<TopicRegistry>, Arc<CaptureLink>, Arc<Gateway>) {
        let registry = Arc::new(TopicRegistry::new());
        let link = Arc::new(CaptureLink::default());
        let gateway = Gateway::new(
            Arc::clone(&registry),
            Arc::new(PacketCodec::with_default_topics()),
            &link,
        );
        (registry, link, gateway)
    }

    fn collect_remote<T: TopicMessage + Clone>(registry: &TopicRegistry) -> Arc<Mutex<Vec<T>>> {
        let got = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&got);
        registry.subscribe_message::<T, _>(move |msg, origin| {
            if origin == Origin::Remote {
                sink.lock().unwrap().push(msg);
            }
        });
        got
    }

    fn sample() -> SensorSample {
        SensorSample::new("Magnetometer", 0, 3.1415, 2.7182, 12345.0).unwrap()
    }

    #[test]
    fn forwarded_publish_is_framed_to_link() {
        let (registry, link, gateway) = setup();
        gateway.forward_topic(SENSOR_SAMPLE_TOPIC).unwrap();
        registry.publish_message(&sample()).unwrap();

        let sent = link.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            encode_frame(SENSOR_SAMPLE_TOPIC, &sample().to_payload().unwrap()).unwrap()
        );
        assert_eq!(gateway.stats().frames_out, 1);
    }

    #[test]
    fn unforwarded_topics_stay_local() {
        let (registry, link, gateway) = setup();
        gateway.forward_topic(SENSOR_SAMPLE_TOPIC).unwrap();
        registry
            .publish_message(&TelemetryIndex {
                index: 1,
                timestamp_secs: 1,
            })
            .unwrap();
        assert!(link.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn forward_unknown_topic_fails() {
        let (_registry, _link, gateway) = setup();
        assert_eq!(
            gateway.forward_topic(77),
            Err(GatewayError::Codec(CodecError::UnknownTopic(77)))
        );
        assert!(gateway.forwarded_topics().is_empty());
    }

    #[test]
    fn forwarding_twice_sends_once() {
        let (registry, link, gateway) = setup();
        gateway.forward_topic(SENSOR_SAMPLE_TOPIC).unwrap();
        gateway.forward_topic(SENSOR_SAMPLE_TOPIC).unwrap();
        registry.publish_message(&sample()).unwrap();
        assert_eq!(link.sent.lock().unwrap().len(), 1);
        assert_eq!(gateway.forwarded_topics(), vec![SENSOR_SAMPLE_TOPIC]);
    }

    #[test]
    fn stop_forwarding_detaches_topic() {
        let (registry, link, gateway) = setup();
        gateway.forward_topic(SENSOR_SAMPLE_TOPIC).unwrap();
        assert!(gateway.stop_forwarding(SENSOR_SAMPLE_TOPIC));
        assert!(!gateway.stop_forwarding(SENSOR_SAMPLE_TOPIC));
        registry.publish_message(&sample()).unwrap();
        assert!(link.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn wrong_width_publish_is_not_sent() {
        let (registry, link, gateway) = setup();
        gateway.forward_topic(TELEMETRY_INDEX_TOPIC).unwrap();
        let report = registry.publish(TELEMETRY_INDEX_TOPIC, vec![0; 13]);
        assert_eq!(report.failures.len(), 1);
        assert!(link.sent.lock().unwrap().is_empty());
        assert_eq!(gateway.stats().send_errors, 1);
    }

    #[test]
    fn inbound_frame_is_dispatched_as_remote_and_not_echoed() {
        let (registry, link, gateway) = setup();
        gateway.forward_topic(SENSOR_SAMPLE_TOPIC).unwrap();
        let got = collect_remote::<SensorSample>(&registry);

        let wire = encode_frame(SENSOR_SAMPLE_TOPIC, &sample().to_payload().unwrap()).unwrap();
        let report = gateway.feed(&wire);

        assert_eq!(report.dispatched, 1);
        assert!(report.errors.is_empty());
        let got = got.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name(), "Magnetometer");
        assert_eq!((got[0].index, got[0].x, got[0].y, got[0].z), (0, 3.1415, 2.7182, 12345.0));
        assert!(link.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn frame_split_at_every_boundary_dispatches_once() {
        let msg = TelemetryIndex {
            index: i64::MIN,
            timestamp_secs: 86_400,
        };
        let wire = encode_frame(TELEMETRY_INDEX_TOPIC, &msg.to_payload().unwrap()).unwrap();

        for split in 1..wire.len() {
            let (registry, _link, gateway) = setup();
            let got = collect_remote::<TelemetryIndex>(&registry);

            let first = gateway.feed(&wire[..split]);
            assert_eq!(first.dispatched, 0, "split {split}");
            let second = gateway.feed(&wire[split..]);
            assert_eq!(second.dispatched, 1, "split {split}");

            assert_eq!(*got.lock().unwrap(), vec![msg]);
            assert_eq!(gateway.buffered(), 0);
        }
    }

    #[test]
    fn unknown_topic_frame_is_reported_and_next_frame_still_dispatched() {
        let (registry, _link, gateway) = setup();
        let got = collect_remote::<TelemetryIndex>(&registry);

        let msg = TelemetryIndex {
            index: 3,
            timestamp_secs: 9,
        };
        let mut stream = encode_frame(4242, &[1, 2, 3]).unwrap();
        stream.extend(encode_frame(TELEMETRY_INDEX_TOPIC, &[0; 5]).unwrap());
        stream.extend(encode_frame(TELEMETRY_INDEX_TOPIC, &msg.to_payload().unwrap()).unwrap());

        let report = gateway.feed(&stream);
        assert_eq!(report.dispatched, 1);
        assert_eq!(
            report.errors,
            vec![
                GatewayError::Codec(CodecError::UnknownTopic(4242)),
                GatewayError::Codec(CodecError::ShortBuffer {
                    topic: TELEMETRY_INDEX_TOPIC,
                    expected: 12,
                    actual: 5,
                }),
            ]
        );
        assert_eq!(*got.lock().unwrap(), vec![msg]);
        assert_eq!(gateway.stats().rejected_in, 2);
    }

    #[test]
    fn rejected_frames_reach_listeners_through_on_data() {
        let (_registry, _link, gateway) = setup();
        let (tx, rx) = crossbeam_channel::unbounded();
        gateway.add_listener(Arc::new(tx));

        let mut stream = encode_frame(4242, &[1, 2, 3]).unwrap();
        stream.extend(encode_frame(TELEMETRY_INDEX_TOPIC, &[0; 5]).unwrap());
        gateway.on_data(&stream);

        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![
                GatewayError::Codec(CodecError::UnknownTopic(4242)),
                GatewayError::Codec(CodecError::ShortBuffer {
                    topic: TELEMETRY_INDEX_TOPIC,
                    expected: 12,
                    actual: 5,
                }),
            ]
        );
    }

    #[test]
    fn garbage_between_frames_is_discarded() {
        let (registry, _link, gateway) = setup();
        let got = collect_remote::<TelemetryIndex>(&registry);
        let msg = TelemetryIndex {
            index: 1,
            timestamp_secs: 2,
        };

        let mut stream = vec![0xDE, 0xAD, 0xBE, 0xEF];
        stream.extend(encode_frame(TELEMETRY_INDEX_TOPIC, &msg.to_payload().unwrap()).unwrap());
        let report = gateway.feed(&stream);

        assert_eq!(report.dispatched, 1);
        assert_eq!(report.discarded_bytes, 4);
        assert_eq!(*got.lock().unwrap(), vec![msg]);
    }

    #[test]
    fn dropped_link_reports_link_gone() {
        let (registry, link, gateway) = setup();
        gateway.forward_topic(SENSOR_SAMPLE_TOPIC).unwrap();
        drop(link);
        let report = registry.publish_message(&sample()).unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(gateway.stats().send_errors, 1);
    }

    #[test]
    fn loopback_through_real_transport() {
        let (opener, handle) = memory_link();
        handle.set_echo(true);
        let transport = Arc::new(SerialTransport::new(
            opener,
            LinkOptions {
                poll_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        transport.configure(PortConfig::new("loop0", 115200)).unwrap();

        let registry = Arc::new(TopicRegistry::new());
        let gateway = Gateway::new(
            Arc::clone(&registry),
            Arc::new(PacketCodec::with_default_topics()),
            &transport,
        );
        transport.add_listener(gateway.clone());
        gateway.forward_topic(SENSOR_SAMPLE_TOPIC).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        registry.subscribe_message::<SensorSample, _>(move |msg, origin| {
            if origin == Origin::Remote {
                let _ = tx.send(msg);
            }
        });

        transport.open().unwrap();
        registry.publish_message(&sample()).unwrap();

        let echoed = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(echoed, sample());
        transport.close().unwrap();
        // O eco não volta a ser encaminhado
        assert_eq!(gateway.stats().frames_out, 1);
        assert_eq!(gateway.stats().frames_in, 1);
    }

    #[test]
    fn unknown_topic_from_device_reaches_consumer() {
        let (opener, handle) = memory_link();
        let transport = Arc::new(SerialTransport::new(
            opener,
            LinkOptions {
                poll_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        transport.configure(PortConfig::new("mem0", 115200)).unwrap();

        let registry = Arc::new(TopicRegistry::new());
        let gateway = Gateway::new(
            Arc::clone(&registry),
            Arc::new(PacketCodec::with_default_topics()),
            &transport,
        );
        transport.add_listener(gateway.clone());
        let (tx, rx) = crossbeam_channel::unbounded();
        gateway.add_listener(Arc::new(tx));

        transport.open().unwrap();
        handle.inject(&encode_frame(4242, &[1, 2, 3]).unwrap());

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(GatewayError::Codec(CodecError::UnknownTopic(4242)))
        );
        transport.close().unwrap();
        assert_eq!(gateway.stats().rejected_in, 1);
    }
}
