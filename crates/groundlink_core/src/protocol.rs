//! Enquadramento binário dos tópicos no fio serial.
//!
//! O stream serial não preserva fronteiras, então cada payload vai dentro
//! de um frame auto-delimitado:
//!
//! ```text
//! ┌──────────┬─────────┬──────────────┬─────────────┬──────────────┬────────────┐
//! │ Magic(1) │ Ver.(1) │ Tópico(4 LE) │ Tamanho(2 LE)│ Payload (N) │ CRC32(4 LE)│
//! └──────────┴─────────┴──────────────┴─────────────┴──────────────┴────────────┘
//! ```
//!
//! - Magic `0x54` ('T') marca o início de um frame
//! - CRC32 cobre do tópico até o fim do payload
//!
//! Ressincronização: bytes antes de um magic são descartados; versão
//! errada, tamanho acima de [`MAX_PAYLOAD`] ou CRC inválido descartam
//! **um** byte e a busca recomeça. Frames incompletos esperam mais bytes.

use crate::codec::TopicId;
use tracing::debug;

/// Magic byte que inicia cada frame.
pub const MAGIC_BYTE: u8 = 0x54; // 'T'

/// Versão atual do enquadramento.
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic + versão + tópico + tamanho.
pub const HEADER_SIZE: usize = 8;

/// CRC32 no final do frame.
pub const TRAILER_SIZE: usize = 4;

/// Maior payload aceito num frame.
pub const MAX_PAYLOAD: usize = 1024;

/// Erros do enquadramento.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("Payload muito grande ({0} bytes, máximo {MAX_PAYLOAD})")]
    PayloadTooLarge(usize),

    #[error("Versão incompatível: {0} (suportada: {PROTOCOL_VERSION})")]
    VersionMismatch(u8),

    #[error("CRC inválido no tópico {topic}: 0x{actual:08X} (esperado 0x{expected:08X})")]
    Checksum {
        topic: TopicId,
        expected: u32,
        actual: u32,
    },
}

/// Frame extraído do stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub topic: TopicId,
    pub payload: Vec<u8>,
}

/// Monta o frame completo para `payload`.
pub fn encode_frame(topic: TopicId, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + TRAILER_SIZE);
    frame.push(MAGIC_BYTE);
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&topic.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);

    let crc = crc32fast::hash(&frame[2..]);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Decodificador incremental: acumula chunks e extrai frames completos.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    discarded: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anexa um chunk lido do dispositivo.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes retidos esperando o resto de um frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total de bytes descartados na ressincronização.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Próximo frame completo.
    ///
    /// `None` = precisa de mais bytes. `Some(Err(_))` = um candidato foi
    /// rejeitado e o decodificador já avançou; chamar de novo continua a busca.
    pub fn next_frame(&mut self) -> Option<Result<WireFrame, WireError>> {
        loop {
            match self.buf.iter().position(|&b| b == MAGIC_BYTE) {
                Some(0) => {}
                Some(start) => self.discard(start),
                None => {
                    let all = self.buf.len();
                    self.discard(all);
                    return None;
                }
            }

            if self.buf.len() < 2 {
                return None;
            }
            if self.buf[1] != PROTOCOL_VERSION {
                let version = self.buf[1];
                self.discard(1);
                return Some(Err(WireError::VersionMismatch(version)));
            }

            if self.buf.len() < HEADER_SIZE {
                return None;
            }
            let topic = u32::from_le_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]);
            let len = u16::from_le_bytes([self.buf[6], self.buf[7]]) as usize;
            if len > MAX_PAYLOAD {
                // Magic falso no meio de lixo: tenta o próximo
                self.discard(1);
                continue;
            }

            let total = HEADER_SIZE + len + TRAILER_SIZE;
            if self.buf.len() < total {
                return None;
            }

            let body_end = HEADER_SIZE + len;
            let expected = crc32fast::hash(&self.buf[2..body_end]);
            let actual = u32::from_le_bytes([
                self.buf[body_end],
                self.buf[body_end + 1],
                self.buf[body_end + 2],
                self.buf[body_end + 3],
            ]);
            if expected != actual {
                self.discard(1);
                return Some(Err(WireError::Checksum {
                    topic,
                    expected,
                    actual,
                }));
            }

            let payload = self.buf[HEADER_SIZE..body_end].to_vec();
            self.buf.drain(..total);
            return Some(Ok(WireFrame { topic, payload }));
        }
    }

    fn discard(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        debug!("Descartando {n} bytes fora de frame");
        self.buf.drain(..n);
        self.discarded += n as u64;
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<Result<WireFrame, WireError>> {
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    #[test]
    fn header_is_correct() {
        let frame = encode_frame(1003, &[1, 2, 3]).unwrap();
        assert_eq!(frame[0], MAGIC_BYTE);
        assert_eq!(frame[1], PROTOCOL_VERSION);
        assert_eq!(&frame[2..6], &1003u32.to_le_bytes());
        assert_eq!(&frame[6..8], &3u16.to_le_bytes());
        assert_eq!(&frame[8..11], &[1, 2, 3]);
        assert_eq!(frame.len(), HEADER_SIZE + 3 + TRAILER_SIZE);
    }

    #[test]
    fn rejects_oversized_payload() {
        assert_eq!(
            encode_frame(1, &vec![0; MAX_PAYLOAD + 1]),
            Err(WireError::PayloadTooLarge(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn decodes_back_to_back_frames_in_one_chunk() {
        let mut stream = encode_frame(1, b"first").unwrap();
        stream.extend(encode_frame(2, b"").unwrap());
        stream.extend(encode_frame(3, b"third").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        let frames: Vec<_> = drain(&mut decoder).into_iter().map(Result::unwrap).collect();
        assert_eq!(
            frames.iter().map(|f| f.topic).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(frames[2].payload, b"third");
        assert!(frames[1].payload.is_empty());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn every_split_point_yields_one_frame() {
        let frame = encode_frame(1002, &[7u8; 48]).unwrap();
        for split in 1..frame.len() {
            let mut decoder = FrameDecoder::new();
            decoder.push(&frame[..split]);
            assert!(decoder.next_frame().is_none(), "split {split}");
            assert_eq!(decoder.buffered(), split);
            decoder.push(&frame[split..]);
            let got = decoder.next_frame().unwrap().unwrap();
            assert_eq!(got.topic, 1002);
            assert_eq!(got.payload, vec![7u8; 48]);
            assert!(decoder.next_frame().is_none());
        }
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut stream = vec![0x00, 0xFF, 0x13, 0x37];
        stream.extend(encode_frame(5, b"ok").unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        let got = decoder.next_frame().unwrap().unwrap();
        assert_eq!(got.payload, b"ok");
        assert_eq!(decoder.discarded(), 4);
    }

    #[test]
    fn garbage_without_magic_is_dropped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[1, 2, 3, 4, 5]);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(decoder.discarded(), 5);
    }

    #[test]
    fn corrupted_frame_reports_checksum_and_resyncs() {
        let mut bad = encode_frame(9, b"payload").unwrap();
        bad[HEADER_SIZE] ^= 0x01;
        let good = encode_frame(9, b"payload").unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&bad);
        decoder.push(&good);
        let results = drain(&mut decoder);

        assert!(matches!(results[0], Err(WireError::Checksum { topic: 9, .. })));
        let frames: Vec<_> = results.into_iter().filter_map(Result::ok).collect();
        assert_eq!(frames, vec![WireFrame { topic: 9, payload: b"payload".to_vec() }]);
    }

    #[test]
    fn wrong_version_is_reported() {
        let mut frame = encode_frame(1, b"x").unwrap();
        frame[1] = 99;
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        assert_eq!(decoder.next_frame(), Some(Err(WireError::VersionMismatch(99))));
    }

    #[test]
    fn false_magic_with_huge_length_is_skipped() {
        // 0x54 0x01 seguido de um tamanho absurdo
        let mut stream = vec![MAGIC_BYTE, PROTOCOL_VERSION, 0, 0, 0, 0, 0xFF, 0xFF];
        stream.extend(encode_frame(4, b"real").unwrap());
        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        let got = decoder.next_frame().unwrap().unwrap();
        assert_eq!(got.topic, 4);
        assert_eq!(decoder.discarded(), 8);
    }

    #[test]
    fn partial_tail_is_retained() {
        let first = encode_frame(1, b"a").unwrap();
        let second = encode_frame(2, b"bb").unwrap();
        let mut stream = first.clone();
        stream.extend_from_slice(&second[..5]);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        assert_eq!(decoder.next_frame().unwrap().unwrap().topic, 1);
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 5);

        decoder.push(&second[5..]);
        assert_eq!(decoder.next_frame().unwrap().unwrap().payload, b"bb");
    }
}
