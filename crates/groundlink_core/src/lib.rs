//! # GroundLink Core
//!
//! Crate compartilhada da estação: transporte serial com thread de I/O,
//! codec de payloads por tópico, enquadramento no fio, registro
//! publish/subscribe e o gateway que liga tudo isso ao peer.
//!
//! ## Módulos
//! - [`port`] – Parâmetros de linha (baud, paridade, stop bits…)
//! - [`device`] – UART nativa e dispositivo em memória
//! - [`transport`] – Thread de I/O, fila de escrita e eventos
//! - [`codec`] – Layouts fixos por tópico
//! - [`types`] – Mensagens tipadas (SensorSample, TelemetryIndex)
//! - [`protocol`] – Frames com magic byte e CRC32
//! - [`registry`] – Assinantes por tópico
//! - [`gateway`] – Encaminhamento registry ⇄ transporte
//! - [`config`] – Configuração unificada via TOML

pub mod port;
pub mod device;
pub mod transport;
pub mod codec;
pub mod types;
pub mod protocol;
pub mod registry;
pub mod gateway;
pub mod config;

// Re-exports convenientes
pub use codec::{PacketCodec, TopicId};
pub use config::AppConfig;
pub use device::{NativeOpener, memory_link};
pub use gateway::Gateway;
pub use port::PortConfig;
pub use registry::{Origin, TopicRegistry};
pub use transport::{LinkOptions, SerialTransport, TransportEvent, TransportState};
pub use types::{SensorSample, TelemetryIndex, TopicMessage};
