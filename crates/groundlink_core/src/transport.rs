//! Transporte serial com thread de I/O dedicada.
//!
//! A thread dona do dispositivo repete o ciclo:
//!
//! ```text
//! ┌──────────────────────┐   ┌────────────────────────┐   ┌──────────────┐
//! │ (a) drena a fila de  │ → │ (b) poll de leitura    │ → │ (c) checa o  │
//! │ escrita + flush      │   │ (timeout T) → on_data  │   │ sinal de stop│
//! └──────────────────────┘   └────────────────────────┘   └──────────────┘
//! ```
//!
//! A escrita tem prioridade em cada ciclo para que comandos enfileirados
//! não fiquem presos atrás de um peer lento ou ausente. A vazão é limitada
//! por T (design de polling, não orientado a eventos).

use crate::device::{DeviceOpener, OpenError, SerialDevice};
use crate::port::{ConfigError, PortConfig};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Capacidade inicial do buffer de leitura da thread de I/O.
const READ_BUFFER_CAPACITY: usize = 4096;

// ──────────────────────────────────────────────
// Estado e eventos
// ──────────────────────────────────────────────

/// Ciclo de vida do transporte.
///
/// `Closed → Opening → Open → Closing → Closed`; `Failed` vem de `Opening`
/// (falha de abertura) ou de `Open` (dispositivo sumiu) e exige `open()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Closed,
    Opening,
    Open,
    Closing,
    Failed,
}

/// Origem de uma falha de I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Open,
    Write,
    Read,
}

/// Falha reportada via `on_error`. Não derruba o transporte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFault {
    pub kind: FaultKind,
    pub message: String,
}

impl LinkFault {
    fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for LinkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self.kind {
            FaultKind::Open => "abertura",
            FaultKind::Write => "escrita",
            FaultKind::Read => "leitura",
        };
        write!(f, "Erro de {what}: {}", self.message)
    }
}

/// Notificação da thread de I/O para o consumidor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Data(Vec<u8>),
    Error(LinkFault),
    State(TransportState),
}

/// Consumidor das notificações do transporte.
///
/// Os métodos rodam na thread de I/O (ou na thread que chamou `open`/`close`
/// para mudanças de estado). Um consumidor single-thread deve encaminhar
/// via channel, como faz a implementação para `Sender<TransportEvent>`.
pub trait TransportListener: Send + Sync {
    /// Uma leitura não vazia. Sem alinhamento de frame.
    fn on_data(&self, chunk: &[u8]);

    fn on_error(&self, fault: &LinkFault);

    fn on_state(&self, _state: TransportState) {}
}

impl TransportListener for Sender<TransportEvent> {
    fn on_data(&self, chunk: &[u8]) {
        let _ = self.send(TransportEvent::Data(chunk.to_vec()));
    }

    fn on_error(&self, fault: &LinkFault) {
        let _ = self.send(TransportEvent::Error(fault.clone()));
    }

    fn on_state(&self, state: TransportState) {
        let _ = self.send(TransportEvent::State(state));
    }
}

// ──────────────────────────────────────────────
// Opções
// ──────────────────────────────────────────────

/// O que fazer quando a fila de escrita está cheia.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// `enqueue_write` falha com [`TransportError::QueueFull`].
    RejectNew,
    /// Descarta a entrada mais antiga e aceita a nova.
    DropOldest,
}

/// O que acontece com entradas pendentes no `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    /// Tudo o que foi enfileirado antes do close é tentado.
    FlushPending,
    /// Entradas pendentes são descartadas antes do sinal de stop.
    DropPending,
}

/// Parâmetros do loop de I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOptions {
    /// Espera máxima do poll de leitura por ciclo
    pub poll_timeout: Duration,
    /// Espera máxima do `close()` pela thread de I/O
    pub close_timeout: Duration,
    /// Entradas máximas na fila de escrita
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub close_policy: ClosePolicy,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(100),
            close_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            overflow: OverflowPolicy::RejectNew,
            close_policy: ClosePolicy::FlushPending,
        }
    }
}

// ──────────────────────────────────────────────
// Erros
// ──────────────────────────────────────────────

/// Erros síncronos da API do transporte.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Open(#[from] OpenError),

    #[error("Porta não está aberta (estado: {0:?})")]
    NotOpen(TransportState),

    #[error("Transporte já em uso (estado: {0:?})")]
    AlreadyOpen(TransportState),

    #[error("Fila de escrita cheia ({0} entradas)")]
    QueueFull(usize),

    #[error("Abertura cancelada por close() (estado: {0:?})")]
    OpenCancelled(TransportState),

    #[error("Thread de I/O não encerrou em {0:?}")]
    CloseTimeout(Duration),

    #[error("Falha ao criar thread de I/O: {0}")]
    Spawn(String),
}

// ──────────────────────────────────────────────
// Estatísticas
// ──────────────────────────────────────────────

/// Contadores acumulados desde a criação do transporte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub write_errors: u64,
    pub read_errors: u64,
    /// Entradas descartadas (fila cheia, close com DropPending, falha)
    pub dropped_entries: u64,
}

#[derive(Default)]
struct Counters {
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    write_errors: AtomicU64,
    read_errors: AtomicU64,
    dropped_entries: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LinkStats {
        LinkStats {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            dropped_entries: self.dropped_entries.load(Ordering::Relaxed),
        }
    }
}

// ──────────────────────────────────────────────
// Transporte
// ──────────────────────────────────────────────

/// Estado compartilhado entre o consumidor e a thread de I/O.
struct Shared {
    state: Mutex<TransportState>,
    stop: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn TransportListener>>>,
    counters: Counters,
}

impl Shared {
    fn listeners(&self) -> Vec<Arc<dyn TransportListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_state(&self, new: TransportState) {
        *lock(&self.state) = new;
        self.notify_state(new);
    }

    fn notify_state(&self, state: TransportState) {
        debug!("Estado do transporte: {state:?}");
        for l in self.listeners() {
            l.on_state(state);
        }
    }

    fn emit_data(&self, chunk: &[u8]) {
        for l in self.listeners() {
            l.on_data(chunk);
        }
    }

    fn emit_error(&self, fault: LinkFault) {
        warn!("{fault}");
        for l in self.listeners() {
            l.on_error(&fault);
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    done_rx: Receiver<()>,
}

/// Dono exclusivo do dispositivo serial e da fila de escrita.
pub struct SerialTransport {
    opener: Box<dyn DeviceOpener>,
    options: LinkOptions,
    config: Mutex<Option<PortConfig>>,
    shared: Arc<Shared>,
    queue_tx: Sender<Vec<u8>>,
    queue_rx: Receiver<Vec<u8>>,
    /// Mantido durante todo o `close()` e na troca `Opening → Open`.
    worker: Mutex<Option<Worker>>,
}

impl SerialTransport {
    pub fn new(opener: impl DeviceOpener + 'static, options: LinkOptions) -> Self {
        let (queue_tx, queue_rx) = bounded(options.queue_capacity.max(1));
        Self {
            opener: Box::new(opener),
            options,
            config: Mutex::new(None),
            shared: Arc::new(Shared {
                state: Mutex::new(TransportState::Closed),
                stop: AtomicBool::new(false),
                listeners: RwLock::new(Vec::new()),
                counters: Counters::default(),
            }),
            queue_tx,
            queue_rx,
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TransportState {
        *lock(&self.shared.state)
    }

    pub fn config(&self) -> Option<PortConfig> {
        lock(&self.config).clone()
    }

    pub fn stats(&self) -> LinkStats {
        self.shared.counters.snapshot()
    }

    /// Entradas ainda não retiradas da fila pela thread de I/O.
    pub fn pending_writes(&self) -> usize {
        self.queue_rx.len()
    }

    /// Registra um consumidor de `on_data`/`on_error`/`on_state`.
    pub fn add_listener(&self, listener: Arc<dyn TransportListener>) {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    /// Define os parâmetros de linha para o próximo `open()`.
    pub fn configure(&self, config: PortConfig) -> Result<(), TransportError> {
        config.validate()?;
        let state = self.state();
        if matches!(
            state,
            TransportState::Opening | TransportState::Open | TransportState::Closing
        ) {
            return Err(TransportError::AlreadyOpen(state));
        }
        info!("Porta configurada: {config}");
        *lock(&self.config) = Some(config);
        Ok(())
    }

    /// Adquire o dispositivo e inicia a thread de I/O.
    ///
    /// O opener roda sem o lock do worker: um `close()` concorrente retorna
    /// sem esperar o driver, e a abertura termina em `OpenCancelled`.
    pub fn open(&self) -> Result<(), TransportError> {
        let config = lock(&self.config)
            .clone()
            .ok_or(TransportError::Config(ConfigError::NotConfigured))?;
        config.validate()?;

        {
            let mut state = lock(&self.shared.state);
            match *state {
                TransportState::Closed | TransportState::Failed => *state = TransportState::Opening,
                other => return Err(TransportError::AlreadyOpen(other)),
            }
        }
        self.shared.notify_state(TransportState::Opening);

        // Worker anterior (saída por falha) já terminou
        let old = lock(&self.worker).take();
        if let Some(old) = old {
            let _ = old.handle.join();
        }

        let device = match self.opener.open(&config) {
            Ok(device) => device,
            Err(e) => {
                error!("{e}");
                self.shared.emit_error(LinkFault::new(FaultKind::Open, e.to_string()));
                let mut state = lock(&self.shared.state);
                if *state == TransportState::Opening {
                    *state = TransportState::Failed;
                    drop(state);
                    self.shared.notify_state(TransportState::Failed);
                }
                return Err(e.into());
            }
        };

        // Daqui até guardar o worker, close() espera neste lock
        let mut worker_slot = lock(&self.worker);
        {
            let mut state = lock(&self.shared.state);
            if *state != TransportState::Opening {
                let now = *state;
                drop(state);
                drop(device);
                info!("Abertura de {} cancelada por close()", config.name);
                return Err(TransportError::OpenCancelled(now));
            }
            let stale = self.discard_pending();
            if stale > 0 {
                debug!("{stale} entradas antigas descartadas antes de abrir");
            }
            self.shared.stop.store(false, Ordering::SeqCst);
            *state = TransportState::Open;
        }
        self.shared.notify_state(TransportState::Open);

        let (done_tx, done_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let queue = self.queue_rx.clone();
        let poll_timeout = self.options.poll_timeout;

        let spawned = std::thread::Builder::new()
            .name("serial-io".into())
            .spawn(move || {
                io_loop(device, &shared, &queue, poll_timeout);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                info!("Transporte aberto: {config}");
                *worker_slot = Some(Worker { handle, done_rx });
                Ok(())
            }
            Err(e) => {
                error!("Falha ao criar thread de I/O: {e}");
                self.shared.set_state(TransportState::Failed);
                Err(TransportError::Spawn(e.to_string()))
            }
        }
    }

    /// Anexa bytes à fila de escrita. Nunca bloqueia.
    pub fn enqueue_write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        // O lock de estado impede que uma entrada passe depois do close
        let state = lock(&self.shared.state);
        if *state != TransportState::Open {
            return Err(TransportError::NotOpen(*state));
        }

        let mut entry = bytes;
        loop {
            match self.queue_tx.try_send(entry) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(rejected)) => match self.options.overflow {
                    OverflowPolicy::RejectNew => {
                        Counters::add(&self.shared.counters.dropped_entries, 1);
                        debug!("Fila de escrita cheia, entrada rejeitada");
                        return Err(TransportError::QueueFull(self.options.queue_capacity));
                    }
                    OverflowPolicy::DropOldest => {
                        if self.queue_rx.try_recv().is_ok() {
                            Counters::add(&self.shared.counters.dropped_entries, 1);
                            debug!("Fila de escrita cheia, entrada mais antiga descartada");
                        }
                        entry = rejected;
                    }
                },
                // O transporte mantém um receiver vivo
                Err(TrySendError::Disconnected(_)) => {
                    return Err(TransportError::NotOpen(*state));
                }
            }
        }
    }

    /// Para a thread de I/O e libera o dispositivo.
    ///
    /// Idempotente. Espera no máximo `close_timeout`; se a thread estiver
    /// presa numa chamada ao driver retorna `CloseTimeout` e uma nova
    /// chamada volta a esperar.
    pub fn close(&self) -> Result<(), TransportError> {
        let mut worker_slot = lock(&self.worker);

        let entered_closing = {
            let mut state = lock(&self.shared.state);
            match *state {
                TransportState::Open | TransportState::Opening => {
                    *state = TransportState::Closing;
                    true
                }
                _ => false,
            }
        };
        if entered_closing {
            self.shared.notify_state(TransportState::Closing);
        }

        if self.options.close_policy == ClosePolicy::DropPending {
            let dropped = self.discard_pending();
            if dropped > 0 {
                info!("{dropped} entradas pendentes descartadas no close");
            }
        }

        self.shared.stop.store(true, Ordering::SeqCst);

        if let Some(worker) = worker_slot.take() {
            match worker.done_rx.recv_timeout(self.options.close_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        error!("Thread de I/O terminou em pânico");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "Thread de I/O não respondeu em {:?}; dispositivo ainda preso",
                        self.options.close_timeout
                    );
                    *worker_slot = Some(worker);
                    return Err(TransportError::CloseTimeout(self.options.close_timeout));
                }
            }
        }

        if self.state() != TransportState::Closed {
            self.shared.set_state(TransportState::Closed);
            info!("Transporte fechado");
        }
        Ok(())
    }

    fn discard_pending(&self) -> usize {
        let dropped = self.queue_rx.try_iter().count();
        Counters::add(&self.shared.counters.dropped_entries, dropped as u64);
        dropped
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Falha ao fechar transporte: {e}");
        }
    }
}

// ──────────────────────────────────────────────
// Loop de I/O
// ──────────────────────────────────────────────

/// Erros que indicam que o dispositivo sumiu (cabo, adaptador USB).
fn is_unrecoverable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::NotFound
    )
}

fn io_loop(
    mut device: Box<dyn SerialDevice>,
    shared: &Shared,
    queue: &Receiver<Vec<u8>>,
    poll_timeout: Duration,
) {
    let mut buf = Vec::with_capacity(READ_BUFFER_CAPACITY);

    let fatal = loop {
        // (a) escrita primeiro
        if let Err(e) = drain_queue(device.as_mut(), shared, queue) {
            break Some(LinkFault::new(FaultKind::Write, e.to_string()));
        }

        // (b) poll limitado por poll_timeout
        buf.clear();
        match device.read_available(&mut buf, poll_timeout) {
            Ok(0) => {}
            Ok(n) => {
                Counters::add(&shared.counters.bytes_read, n as u64);
                shared.emit_data(&buf);
            }
            Err(e) if is_unrecoverable(&e) => {
                break Some(LinkFault::new(FaultKind::Read, e.to_string()));
            }
            Err(e) => {
                Counters::add(&shared.counters.read_errors, 1);
                shared.emit_error(LinkFault::new(FaultKind::Read, e.to_string()));
                // Mantém o período do ciclo mesmo com erro imediato
                std::thread::sleep(poll_timeout);
            }
        }

        // (c) stop
        if shared.stop.load(Ordering::SeqCst) {
            break None;
        }
    };

    match fatal {
        None => {
            // Entradas enfileiradas antes do close ainda são tentadas
            if let Err(e) = drain_queue(device.as_mut(), shared, queue) {
                shared.emit_error(LinkFault::new(FaultKind::Write, e.to_string()));
            }
            drop(device);
            debug!("Dispositivo liberado");
        }
        Some(fault) => {
            drop(device);
            Counters::add(&shared.counters.dropped_entries, queue.try_iter().count() as u64);
            error!("Dispositivo perdido: {fault}");
            shared.emit_error(fault);
            let mut state = lock(&shared.state);
            if *state == TransportState::Open {
                *state = TransportState::Failed;
                drop(state);
                shared.notify_state(TransportState::Failed);
            }
        }
    }
}

/// Escreve a fila inteira. Erros comuns são reportados e a entrada é
/// perdida; só um erro irrecuperável interrompe.
fn drain_queue(
    device: &mut dyn SerialDevice,
    shared: &Shared,
    queue: &Receiver<Vec<u8>>,
) -> io::Result<()> {
    while let Ok(entry) = queue.try_recv() {
        match device.write_all(&entry).and_then(|()| device.flush()) {
            Ok(()) => Counters::add(&shared.counters.bytes_written, entry.len() as u64),
            Err(e) if is_unrecoverable(&e) => return Err(e),
            Err(e) => {
                Counters::add(&shared.counters.write_errors, 1);
                shared.emit_error(LinkFault::new(FaultKind::Write, e.to_string()));
            }
        }
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
