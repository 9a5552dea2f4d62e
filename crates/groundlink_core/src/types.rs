//! Mensagens tipadas dos tópicos da estação.
//!
//! bincode 1 (configuração padrão: inteiros de largura fixa em
//! little-endian, arrays sem prefixo de tamanho) gera exatamente o layout
//! declarado em [`TopicMessage::layout`], então os structs abaixo
//! serializam direto no formato do fio.

use crate::codec::{CodecError, FieldKind, TopicId, TopicLayout};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Tópico estação → peer (amostra de sensor).
pub const SENSOR_SAMPLE_TOPIC: TopicId = 1002;

/// Tópico peer → estação (índice e tempo da telemetria).
pub const TELEMETRY_INDEX_TOPIC: TopicId = 1003;

/// Tamanho do campo de nome do sensor.
pub const SENSOR_NAME_LEN: usize = 20;

/// Payload tipado associado a um tópico.
pub trait TopicMessage: Serialize + DeserializeOwned + Send + 'static {
    const TOPIC: TopicId;

    fn layout() -> TopicLayout;

    fn to_payload(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serialize(self).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn from_payload(bytes: &[u8]) -> Result<Self, CodecError> {
        let expected = Self::layout().width();
        if bytes.len() < expected {
            return Err(CodecError::ShortBuffer {
                topic: Self::TOPIC,
                expected,
                actual: bytes.len(),
            });
        }
        bincode::deserialize(&bytes[..expected]).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

// ──────────────────────────────────────────────
// Amostra de sensor
// ──────────────────────────────────────────────

/// Leitura de um sensor de 3 eixos (48 bytes no fio).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SensorSample {
    /// Nome completado com `\0`
    pub name: [u8; SENSOR_NAME_LEN],
    pub index: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl SensorSample {
    /// Nomes maiores que 20 bytes são rejeitados.
    pub fn new(name: &str, index: u32, x: f64, y: f64, z: f64) -> Result<Self, CodecError> {
        let raw = name.as_bytes();
        if raw.len() > SENSOR_NAME_LEN {
            return Err(CodecError::TextTooLong {
                field: "name".into(),
                len: raw.len(),
                max: SENSOR_NAME_LEN,
            });
        }
        if raw.contains(&0) {
            return Err(CodecError::TextContainsNul {
                field: "name".into(),
            });
        }
        let mut padded = [0u8; SENSOR_NAME_LEN];
        padded[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            name: padded,
            index,
            x,
            y,
            z,
        })
    }

    /// Nome sem os `\0` finais (bytes inválidos viram U+FFFD).
    pub fn name(&self) -> String {
        let end = self.name.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

impl TopicMessage for SensorSample {
    const TOPIC: TopicId = SENSOR_SAMPLE_TOPIC;

    fn layout() -> TopicLayout {
        TopicLayout::new("sensor_sample")
            .field("name", FieldKind::Text(SENSOR_NAME_LEN))
            .field("index", FieldKind::U32)
            .field("x", FieldKind::F64)
            .field("y", FieldKind::F64)
            .field("z", FieldKind::F64)
    }
}

// ──────────────────────────────────────────────
// Índice de telemetria
// ──────────────────────────────────────────────

/// Contador e tempo enviados pelo peer (12 bytes no fio).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryIndex {
    pub index: i64,
    /// Segundos desde o boot do peer
    pub timestamp_secs: u32,
}

impl TopicMessage for TelemetryIndex {
    const TOPIC: TopicId = TELEMETRY_INDEX_TOPIC;

    fn layout() -> TopicLayout {
        TopicLayout::new("telemetry_index")
            .field("index", FieldKind::I64)
            .field("timestamp_secs", FieldKind::U32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldValue, PacketCodec};

    #[test]
    fn sensor_sample_matches_layout_codec() {
        let sample = SensorSample::new("Magnetometer", 0, 3.1415, 2.7182, 12345.0).unwrap();
        let typed = sample.to_payload().unwrap();

        let codec = PacketCodec::with_default_topics();
        let dynamic = codec
            .encode(
                SENSOR_SAMPLE_TOPIC,
                &[
                    FieldValue::Text("Magnetometer".into()),
                    FieldValue::U32(0),
                    FieldValue::F64(3.1415),
                    FieldValue::F64(2.7182),
                    FieldValue::F64(12345.0),
                ],
            )
            .unwrap();

        assert_eq!(typed.len(), 48);
        assert_eq!(typed, dynamic);
    }

    #[test]
    fn telemetry_index_matches_layout_codec() {
        let msg = TelemetryIndex {
            index: -42,
            timestamp_secs: 3600,
        };
        let typed = msg.to_payload().unwrap();
        let codec = PacketCodec::with_default_topics();
        let dynamic = codec
            .encode(
                TELEMETRY_INDEX_TOPIC,
                &[FieldValue::I64(-42), FieldValue::U32(3600)],
            )
            .unwrap();
        assert_eq!(typed.len(), 12);
        assert_eq!(typed, dynamic);
        assert_eq!(TelemetryIndex::from_payload(&typed).unwrap(), msg);
    }

    #[test]
    fn sensor_sample_roundtrip_and_name() {
        let sample = SensorSample::new("Gyro", u32::MAX, -1.5, 0.0, f64::MAX).unwrap();
        let decoded = SensorSample::from_payload(&sample.to_payload().unwrap()).unwrap();
        assert_eq!(decoded, sample);
        assert_eq!(decoded.name(), "Gyro");
        assert_eq!(SensorSample::new("", 0, 0.0, 0.0, 0.0).unwrap().name(), "");
    }

    #[test]
    fn from_payload_rejects_short_buffer() {
        assert_eq!(
            TelemetryIndex::from_payload(&[0u8; 11]),
            Err(CodecError::ShortBuffer {
                topic: TELEMETRY_INDEX_TOPIC,
                expected: 12,
                actual: 11,
            })
        );
    }

    #[test]
    fn sensor_name_with_nul_is_rejected() {
        assert_eq!(
            SensorSample::new("Mag\0", 0, 0.0, 0.0, 0.0),
            Err(CodecError::TextContainsNul {
                field: "name".into()
            })
        );
    }

    #[test]
    fn long_sensor_name_is_rejected() {
        assert!(matches!(
            SensorSample::new("Magnetometer-with-suffix", 0, 0.0, 0.0, 0.0),
            Err(CodecError::TextTooLong { len: 24, max: 20, .. })
        ));
    }
}
