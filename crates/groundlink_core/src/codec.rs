//! Codec de payload por tópico.
//!
//! Cada tópico declara um layout fixo de campos. O layout é o contrato com
//! o peer remoto e precisa bater byte a byte (sem versão, sem descrição
//! embutida):
//!
//! - ordem dos campos = ordem de declaração
//! - inteiros e floats em **little-endian**
//! - **sem padding** entre campos nem no final
//! - texto em array fixo, completado com `\0`; na decodificação os `\0`
//!   finais são removidos

use crate::types::{SENSOR_SAMPLE_TOPIC, SensorSample, TELEMETRY_INDEX_TOPIC, TelemetryIndex, TopicMessage};
use std::collections::BTreeMap;

/// Identificador numérico de tópico.
pub type TopicId = u32;

/// Erros de codificação/decodificação de payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Tópico desconhecido: {0}")]
    UnknownTopic(TopicId),

    #[error("Tópico {0} já registrado")]
    DuplicateTopic(TopicId),

    #[error("Buffer curto para o tópico {topic}: {actual} bytes, layout exige {expected}")]
    ShortBuffer {
        topic: TopicId,
        expected: usize,
        actual: usize,
    },

    #[error("Tópico {topic}: {actual} campos, layout declara {expected}")]
    FieldCount {
        topic: TopicId,
        expected: usize,
        actual: usize,
    },

    #[error("Campo {field:?}: esperado {expected:?}")]
    TypeMismatch { field: String, expected: FieldKind },

    #[error("Campo {field:?}: texto com {len} bytes excede {max}")]
    TextTooLong { field: String, len: usize, max: usize },

    #[error("Campo {field:?}: texto não é UTF-8")]
    InvalidText { field: String },

    /// O padding é `\0`, então um NUL no texto não sobreviveria ao decode.
    #[error("Campo {field:?}: texto contém byte NUL")]
    TextContainsNul { field: String },

    #[error("Erro de serialização: {0}")]
    Serialize(String),

    #[error("Erro de deserialização: {0}")]
    Deserialize(String),
}

// ──────────────────────────────────────────────
// Layout
// ──────────────────────────────────────────────

/// Tipo e largura de um campo no fio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Texto em array fixo de N bytes
    Text(usize),
}

impl FieldKind {
    pub fn width(self) -> usize {
        match self {
            FieldKind::U8 | FieldKind::I8 => 1,
            FieldKind::U16 | FieldKind::I16 => 2,
            FieldKind::U32 | FieldKind::I32 | FieldKind::F32 => 4,
            FieldKind::U64 | FieldKind::I64 | FieldKind::F64 => 8,
            FieldKind::Text(n) => n,
        }
    }
}

/// Valor decodificado de um campo.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// Layout fixo de um tópico.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl TopicLayout {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Acrescenta um campo (builder).
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
        });
        self
    }

    /// Largura total em bytes.
    pub fn width(&self) -> usize {
        self.fields.iter().map(|f| f.kind.width()).sum()
    }
}

// ──────────────────────────────────────────────
// Codec
// ──────────────────────────────────────────────

/// Registro de layouts por tópico.
#[derive(Debug, Clone, Default)]
pub struct PacketCodec {
    layouts: BTreeMap<TopicId, TopicLayout>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec com os tópicos da estação: amostra de sensor e índice de telemetria.
    pub fn with_default_topics() -> Self {
        let mut codec = Self::new();
        codec.layouts.insert(SENSOR_SAMPLE_TOPIC, SensorSample::layout());
        codec.layouts.insert(TELEMETRY_INDEX_TOPIC, TelemetryIndex::layout());
        codec
    }

    pub fn register(&mut self, topic: TopicId, layout: TopicLayout) -> Result<(), CodecError> {
        if self.layouts.contains_key(&topic) {
            return Err(CodecError::DuplicateTopic(topic));
        }
        self.layouts.insert(topic, layout);
        Ok(())
    }

    pub fn layout(&self, topic: TopicId) -> Option<&TopicLayout> {
        self.layouts.get(&topic)
    }

    pub fn width(&self, topic: TopicId) -> Result<usize, CodecError> {
        self.layout(topic)
            .map(TopicLayout::width)
            .ok_or(CodecError::UnknownTopic(topic))
    }

    pub fn topics(&self) -> impl Iterator<Item = TopicId> + '_ {
        self.layouts.keys().copied()
    }

    /// Codifica `fields` no layout do tópico.
    pub fn encode(&self, topic: TopicId, fields: &[FieldValue]) -> Result<Vec<u8>, CodecError> {
        let layout = self.layout(topic).ok_or(CodecError::UnknownTopic(topic))?;
        if fields.len() != layout.fields.len() {
            return Err(CodecError::FieldCount {
                topic,
                expected: layout.fields.len(),
                actual: fields.len(),
            });
        }

        let mut out = Vec::with_capacity(layout.width());
        for (spec, value) in layout.fields.iter().zip(fields) {
            encode_field(&mut out, spec, value)?;
        }
        Ok(out)
    }

    /// Decodifica os primeiros `width` bytes de `bytes`.
    ///
    /// Nunca lê além do buffer: menos bytes que o layout é `ShortBuffer`.
    pub fn decode(&self, topic: TopicId, bytes: &[u8]) -> Result<Vec<FieldValue>, CodecError> {
        let layout = self.layout(topic).ok_or(CodecError::UnknownTopic(topic))?;
        let expected = layout.width();
        if bytes.len() < expected {
            return Err(CodecError::ShortBuffer {
                topic,
                expected,
                actual: bytes.len(),
            });
        }

        let mut offset = 0;
        let mut values = Vec::with_capacity(layout.fields.len());
        for spec in &layout.fields {
            let width = spec.kind.width();
            values.push(decode_field(spec, &bytes[offset..offset + width])?);
            offset += width;
        }
        Ok(values)
    }
}

fn encode_field(out: &mut Vec<u8>, spec: &FieldSpec, value: &FieldValue) -> Result<(), CodecError> {
    let mismatch = || CodecError::TypeMismatch {
        field: spec.name.clone(),
        expected: spec.kind,
    };

    match (spec.kind, value) {
        (FieldKind::U8, FieldValue::U8(v)) => out.push(*v),
        (FieldKind::U16, FieldValue::U16(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldKind::U32, FieldValue::U32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldKind::U64, FieldValue::U64(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldKind::I8, FieldValue::I8(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldKind::I16, FieldValue::I16(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldKind::I32, FieldValue::I32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldKind::I64, FieldValue::I64(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldKind::F32, FieldValue::F32(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldKind::F64, FieldValue::F64(v)) => out.extend_from_slice(&v.to_le_bytes()),
        (FieldKind::Text(max), FieldValue::Text(s)) => {
            let raw = s.as_bytes();
            if raw.len() > max {
                return Err(CodecError::TextTooLong {
                    field: spec.name.clone(),
                    len: raw.len(),
                    max,
                });
            }
            if raw.contains(&0) {
                return Err(CodecError::TextContainsNul {
                    field: spec.name.clone(),
                });
            }
            out.extend_from_slice(raw);
            out.resize(out.len() + (max - raw.len()), 0);
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

/// `raw` tem exatamente a largura do campo.
fn decode_field(spec: &FieldSpec, raw: &[u8]) -> Result<FieldValue, CodecError> {
    fn arr<const N: usize>(raw: &[u8]) -> [u8; N] {
        let mut a = [0u8; N];
        a.copy_from_slice(&raw[..N]);
        a
    }

    Ok(match spec.kind {
        FieldKind::U8 => FieldValue::U8(raw[0]),
        FieldKind::U16 => FieldValue::U16(u16::from_le_bytes(arr(raw))),
        FieldKind::U32 => FieldValue::U32(u32::from_le_bytes(arr(raw))),
        FieldKind::U64 => FieldValue::U64(u64::from_le_bytes(arr(raw))),
        FieldKind::I8 => FieldValue::I8(i8::from_le_bytes(arr(raw))),
        FieldKind::I16 => FieldValue::I16(i16::from_le_bytes(arr(raw))),
        FieldKind::I32 => FieldValue::I32(i32::from_le_bytes(arr(raw))),
        FieldKind::I64 => FieldValue::I64(i64::from_le_bytes(arr(raw))),
        FieldKind::F32 => FieldValue::F32(f32::from_le_bytes(arr(raw))),
        FieldKind::F64 => FieldValue::F64(f64::from_le_bytes(arr(raw))),
        FieldKind::Text(_) => {
            let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            let text = std::str::from_utf8(&raw[..end]).map_err(|_| CodecError::InvalidText {
                field: spec.name.clone(),
            })?;
            FieldValue::Text(text.to_string())
        }
    })
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
