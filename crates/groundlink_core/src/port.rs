//! Parâmetros de linha da porta serial.
//!
//! [`PortConfig`] é imutável depois de aplicado a um transporte aberto:
//! mudar qualquer campo exige `close()` + `open()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Baud rates aceitos pela estação.
pub const SUPPORTED_BAUD_RATES: [u32; 5] = [9600, 19200, 38400, 57600, 115200];

/// Erros de configuração (locais, nenhuma I/O é tentada).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Nome da porta vazio")]
    EmptyPortName,

    #[error("Baud rate não suportado: {0} (aceitos: 9600, 19200, 38400, 57600, 115200)")]
    UnsupportedBaudRate(u32),

    #[error("Data bits inválido: {0} (aceitos: 5, 6, 7, 8)")]
    InvalidDataBits(u8),

    #[error("Paridade inválida: {0:?} (aceitas: none, even, odd, space, mark)")]
    InvalidParity(String),

    #[error("Stop bits inválido: {0:?} (aceitos: 1, 1.5, 2)")]
    InvalidStopBits(String),

    #[error("Controle de fluxo inválido: {0:?} (aceitos: none, hardware, software)")]
    InvalidFlowControl(String),

    #[error("Transporte sem configuração de porta")]
    NotConfigured,
}

// ──────────────────────────────────────────────
// Enums de linha
// ──────────────────────────────────────────────

/// Bits de dados por caractere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    pub fn bits(self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl TryFrom<u8> for DataBits {
    type Error = ConfigError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            5 => Ok(DataBits::Five),
            6 => Ok(DataBits::Six),
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(ConfigError::InvalidDataBits(other)),
        }
    }
}

/// Paridade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    None,
    Even,
    Odd,
    Space,
    Mark,
}

impl FromStr for Parity {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "even" | "e" => Ok(Parity::Even),
            "odd" | "o" => Ok(Parity::Odd),
            "space" | "s" => Ok(Parity::Space),
            "mark" | "m" => Ok(Parity::Mark),
            _ => Err(ConfigError::InvalidParity(s.to_string())),
        }
    }
}

impl Parity {
    /// Letra usada na notação curta (`8N1`).
    pub fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
            Parity::Space => 'S',
            Parity::Mark => 'M',
        }
    }
}

/// Stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl FromStr for StopBits {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            _ => Err(ConfigError::InvalidStopBits(s.to_string())),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopBits::One => write!(f, "1"),
            StopBits::OnePointFive => write!(f, "1.5"),
            StopBits::Two => write!(f, "2"),
        }
    }
}

/// Controle de fluxo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    Hardware,
    Software,
}

impl FromStr for FlowControl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(FlowControl::None),
            "hardware" | "rts/cts" => Ok(FlowControl::Hardware),
            "software" | "xon/xoff" => Ok(FlowControl::Software),
            _ => Err(ConfigError::InvalidFlowControl(s.to_string())),
        }
    }
}

// ──────────────────────────────────────────────
// PortConfig
// ──────────────────────────────────────────────

/// Descrição imutável dos parâmetros de linha.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Nome do dispositivo (ex: "/dev/rfcomm0", "COM3")
    pub name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl PortConfig {
    /// Configuração 8N1 sem controle de fluxo.
    pub fn new(name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            name: name.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }

    /// Valida os campos que não são garantidos pelo tipo.
    ///
    /// A existência do dispositivo só é verificada em `open()`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyPortName);
        }
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(ConfigError::UnsupportedBaudRate(self.baud_rate));
        }
        Ok(())
    }
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {} baud ({}{}{})",
            self.name,
            self.baud_rate,
            self.data_bits.bits(),
            self.parity.letter(),
            self.stop_bits
        )
    }
}

// ──────────────────────────────────────────────
// Enumeração de portas
// ──────────────────────────────────────────────

/// Dispositivo serial visível no sistema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    /// "USB", "Bluetooth", "PCI" ou "Unknown"
    pub kind: String,
    pub product: Option<String>,
}

/// Lista as portas seriais disponíveis.
pub fn list_ports() -> Result<Vec<PortInfo>, String> {
    let ports = serialport::available_ports().map_err(|e| e.to_string())?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let (kind, product) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => ("USB", info.product),
                serialport::SerialPortType::BluetoothPort => ("Bluetooth", None),
                serialport::SerialPortType::PciPort => ("PCI", None),
                serialport::SerialPortType::Unknown => ("Unknown", None),
            };
            PortInfo {
                name: p.port_name,
                kind: kind.into(),
                product,
            }
        })
        .collect())
}
