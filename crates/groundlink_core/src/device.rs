//! Dispositivos seriais: a UART nativa (crate `serialport`) e um
//! dispositivo em memória usado pelo modo loopback e pelos testes.
//!
//! O transporte só enxerga os traits [`SerialDevice`] e [`DeviceOpener`].

use crate::port::{DataBits, FlowControl, Parity, PortConfig, StopBits};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Tamanho do buffer de leitura por chamada ao driver.
const READ_CHUNK: usize = 1024;

/// Motivo de uma falha de abertura.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenFailure {
    #[error("dispositivo não encontrado")]
    NotFound,

    #[error("permissão negada")]
    PermissionDenied,

    #[error("dispositivo ocupado")]
    Busy,

    #[error("parâmetro não suportado pelo driver: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Falha ao adquirir o dispositivo. A tentativa é terminal (sem retry).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Falha ao abrir {port}: {reason}")]
pub struct OpenError {
    pub port: String,
    pub reason: OpenFailure,
}

impl OpenError {
    pub fn new(port: impl Into<String>, reason: OpenFailure) -> Self {
        Self {
            port: port.into(),
            reason,
        }
    }
}

/// Dispositivo aberto, de posse exclusiva da thread de I/O.
pub trait SerialDevice: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;

    /// Espera até `timeout` por dados e lê tudo o que estiver disponível.
    ///
    /// Retorna o número de bytes anexados a `buf` (0 = nada chegou).
    fn read_available(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize>;
}

/// Fábrica de dispositivos a partir de uma [`PortConfig`].
pub trait DeviceOpener: Send + Sync {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialDevice>, OpenError>;
}

// ──────────────────────────────────────────────
// UART nativa
// ──────────────────────────────────────────────

/// Abre portas reais via `serialport`.
#[derive(Debug, Clone, Default)]
pub struct NativeOpener;

struct NativeDevice {
    port: Box<dyn serialport::SerialPort>,
    timeout: Duration,
}

impl DeviceOpener for NativeOpener {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialDevice>, OpenError> {
        let fail = |reason| OpenError::new(config.name.clone(), reason);

        // O backend não expressa paridade Space/Mark nem 1.5 stop bits
        let parity = match config.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Space | Parity::Mark => {
                return Err(fail(OpenFailure::Unsupported(format!(
                    "paridade {:?}",
                    config.parity
                ))));
            }
        };
        let stop_bits = match config.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
            StopBits::OnePointFive => {
                return Err(fail(OpenFailure::Unsupported("1.5 stop bits".into())));
            }
        };
        let data_bits = match config.data_bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        };
        let flow_control = match config.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software => serialport::FlowControl::Software,
        };

        let timeout = Duration::from_millis(100);
        let port = serialport::new(&config.name, config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .timeout(timeout)
            .open()
            .map_err(|e| fail(classify_open_error(&e)))?;

        info!("Porta aberta: {config}");
        Ok(Box::new(NativeDevice { port, timeout }))
    }
}

fn classify_open_error(e: &serialport::Error) -> OpenFailure {
    match e.kind {
        serialport::ErrorKind::NoDevice => OpenFailure::NotFound,
        serialport::ErrorKind::InvalidInput => OpenFailure::Unsupported(e.description.clone()),
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => OpenFailure::NotFound,
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => OpenFailure::PermissionDenied,
        _ if e.description.to_ascii_lowercase().contains("busy") => OpenFailure::Busy,
        _ => OpenFailure::Other(e.description.clone()),
    }
}

impl SerialDevice for NativeDevice {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn read_available(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize> {
        if timeout != self.timeout {
            self.port.set_timeout(timeout)?;
            self.timeout = timeout;
        }

        let mut chunk = [0u8; READ_CHUNK];
        let first = match self.port.read(&mut chunk) {
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                n
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(0),
            Err(e) => return Err(e),
        };

        Ok(first + drain_buffered(&mut self.port, buf))
    }
}

/// Buffer de recepção do driver, consultado sem bloquear.
trait DriverBuffer {
    fn pending(&self) -> io::Result<usize>;

    fn read_some(&mut self, chunk: &mut [u8]) -> io::Result<usize>;
}

impl DriverBuffer for Box<dyn serialport::SerialPort> {
    fn pending(&self) -> io::Result<usize> {
        Ok(self.bytes_to_read()? as usize)
    }

    fn read_some(&mut self, chunk: &mut [u8]) -> io::Result<usize> {
        self.read(chunk)
    }
}

/// Drena o que já está no buffer do driver sem esperar de novo.
///
/// Um erro aqui encerra a drenagem mas mantém o que já foi anexado a `buf`;
/// se persistir, reaparece no próximo poll.
fn drain_buffered(source: &mut impl DriverBuffer, buf: &mut Vec<u8>) -> usize {
    let mut chunk = [0u8; READ_CHUNK];
    let mut total = 0;
    loop {
        let pending = match source.pending() {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Consulta ao buffer do driver falhou: {e}");
                break;
            }
        };
        match source.read_some(&mut chunk[..pending.min(READ_CHUNK)]) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                total += n;
            }
            Err(e) => {
                debug!("Leitura do buffer do driver falhou: {e}");
                break;
            }
        }
    }
    total
}

// ──────────────────────────────────────────────
// Dispositivo em memória
// ──────────────────────────────────────────────

struct MemoryShared {
    writes_tx: Sender<Vec<u8>>,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    stalled_tx: Sender<()>,
    echo: AtomicBool,
    unplugged: AtomicBool,
    fail_writes: AtomicUsize,
    fail_reads: AtomicUsize,
    stall: Mutex<bool>,
    stall_cv: Condvar,
    refuse: Mutex<Option<OpenFailure>>,
    last_config: Mutex<Option<PortConfig>>,
    open_devices: AtomicUsize,
}

/// Cria um par opener/handle de dispositivo em memória.
///
/// O handle observa as escritas na ordem em que chegam ao "fio" e injeta
/// bytes de entrada. Com `set_echo(true)` vira um loopback.
pub fn memory_link() -> (MemoryOpener, MemoryHandle) {
    let (writes_tx, writes_rx) = unbounded();
    let (inbound_tx, inbound_rx) = unbounded();
    let (stalled_tx, stalled_rx) = unbounded();
    let shared = Arc::new(MemoryShared {
        writes_tx,
        inbound_tx,
        inbound_rx,
        stalled_tx,
        echo: AtomicBool::new(false),
        unplugged: AtomicBool::new(false),
        fail_writes: AtomicUsize::new(0),
        fail_reads: AtomicUsize::new(0),
        stall: Mutex::new(false),
        stall_cv: Condvar::new(),
        refuse: Mutex::new(None),
        last_config: Mutex::new(None),
        open_devices: AtomicUsize::new(0),
    });
    (
        MemoryOpener {
            shared: Arc::clone(&shared),
        },
        MemoryHandle {
            shared,
            writes_rx,
            stalled_rx,
        },
    )
}

/// Opener do dispositivo em memória.
#[derive(Clone)]
pub struct MemoryOpener {
    shared: Arc<MemoryShared>,
}

impl DeviceOpener for MemoryOpener {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn SerialDevice>, OpenError> {
        if let Some(reason) = lock(&self.shared.refuse).clone() {
            return Err(OpenError::new(config.name.clone(), reason));
        }
        if self.shared.unplugged.load(Ordering::SeqCst) {
            return Err(OpenError::new(config.name.clone(), OpenFailure::NotFound));
        }
        *lock(&self.shared.last_config) = Some(config.clone());
        self.shared.open_devices.fetch_add(1, Ordering::SeqCst);
        debug!("Dispositivo em memória aberto: {config}");
        Ok(Box::new(MemoryDevice {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryDevice {
    shared: Arc<MemoryShared>,
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        self.shared.open_devices.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SerialDevice for MemoryDevice {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        {
            let mut stalled = lock(&self.shared.stall);
            if *stalled {
                let _ = self.shared.stalled_tx.send(());
                while *stalled {
                    stalled = self
                        .shared
                        .stall_cv
                        .wait(stalled)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }

        if self.shared.unplugged.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if take_one(&self.shared.fail_writes) {
            return Err(io::Error::other("falha de escrita simulada"));
        }

        let _ = self.shared.writes_tx.send(data.to_vec());
        if self.shared.echo.load(Ordering::SeqCst) {
            let _ = self.shared.inbound_tx.send(data.to_vec());
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn read_available(&mut self, buf: &mut Vec<u8>, timeout: Duration) -> io::Result<usize> {
        if self.shared.unplugged.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if take_one(&self.shared.fail_reads) {
            return Err(io::Error::other("falha de leitura simulada"));
        }

        let first = match self.shared.inbound_rx.recv_timeout(timeout) {
            Ok(chunk) => chunk,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return Ok(0),
        };
        let mut total = first.len();
        buf.extend_from_slice(&first);
        while let Ok(chunk) = self.shared.inbound_rx.try_recv() {
            total += chunk.len();
            buf.extend_from_slice(&chunk);
        }
        Ok(total)
    }
}

/// Controle do dispositivo em memória (lado do "peer").
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<MemoryShared>,
    writes_rx: Receiver<Vec<u8>>,
    stalled_rx: Receiver<()>,
}

impl MemoryHandle {
    /// Próxima escrita que chegou ao dispositivo, esperando até `timeout`.
    pub fn next_write(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.writes_rx.recv_timeout(timeout).ok()
    }

    /// Escritas já recebidas, sem esperar.
    pub fn take_writes(&self) -> Vec<Vec<u8>> {
        self.writes_rx.try_iter().collect()
    }

    /// Entrega bytes para a próxima leitura do transporte.
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.shared.inbound_tx.send(bytes.to_vec());
    }

    /// Ecoa cada escrita de volta como dado de entrada.
    pub fn set_echo(&self, enabled: bool) {
        self.shared.echo.store(enabled, Ordering::SeqCst);
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.shared.fail_writes.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.shared.fail_reads.store(count, Ordering::SeqCst);
    }

    /// Simula o cabo removido: toda I/O falha com `BrokenPipe`.
    pub fn unplug(&self) {
        self.shared.unplugged.store(true, Ordering::SeqCst);
    }

    pub fn replug(&self) {
        self.shared.unplugged.store(false, Ordering::SeqCst);
    }

    /// Faz a próxima escrita bloquear dentro do "driver" até `resume_writes`.
    pub fn stall_writes(&self) {
        *lock(&self.shared.stall) = true;
    }

    pub fn resume_writes(&self) {
        *lock(&self.shared.stall) = false;
        self.shared.stall_cv.notify_all();
    }

    /// Espera uma escrita ficar presa no dispositivo.
    pub fn wait_stalled(&self, timeout: Duration) -> bool {
        self.stalled_rx.recv_timeout(timeout).is_ok()
    }

    /// Faz as próximas aberturas falharem com `reason` (`None` libera).
    pub fn refuse_open(&self, reason: Option<OpenFailure>) {
        *lock(&self.shared.refuse) = reason;
    }

    /// Há um dispositivo aberto e ainda não liberado.
    pub fn is_open(&self) -> bool {
        self.shared.open_devices.load(Ordering::SeqCst) > 0
    }

    pub fn last_config(&self) -> Option<PortConfig> {
        lock(&self.shared.last_config).clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
