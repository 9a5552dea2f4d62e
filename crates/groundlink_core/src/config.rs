//! Configuração unificada via TOML.
//!
//! Um único `config.toml` com as seções `[serial]`, `[link]` e `[station]`.
//! Os valores de linha ficam crus no arquivo ("none", "1.5"…) e só viram
//! tipos em [`SerialSection::to_port_config`].

use crate::codec::TopicId;
use crate::port::{ConfigError, DataBits, PortConfig};
use crate::transport::{ClosePolicy, LinkOptions, OverflowPolicy};
use crate::types::{SENSOR_NAME_LEN, SENSOR_SAMPLE_TOPIC};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Parâmetros de linha como aparecem no arquivo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    /// Dispositivo (ex: "/dev/rfcomm0", "COM3")
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    /// "none", "even", "odd", "space" ou "mark"
    pub parity: String,
    /// "1", "1.5" ou "2"
    pub stop_bits: String,
    /// "none", "hardware" ou "software"
    pub flow_control: String,
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: "/dev/rfcomm0".into(),
            baud_rate: 115200,
            data_bits: 8,
            parity: "none".into(),
            stop_bits: "1".into(),
            flow_control: "none".into(),
        }
    }
}

impl SerialSection {
    /// Converte e valida os campos crus.
    pub fn to_port_config(&self) -> Result<PortConfig, ConfigError> {
        let config = PortConfig {
            name: self.port.trim().to_string(),
            baud_rate: self.baud_rate,
            data_bits: DataBits::try_from(self.data_bits)?,
            parity: self.parity.parse()?,
            stop_bits: self.stop_bits.parse()?,
            flow_control: self.flow_control.parse()?,
        };
        config.validate()?;
        Ok(config)
    }
}

impl TryFrom<&SerialSection> for PortConfig {
    type Error = ConfigError;

    fn try_from(section: &SerialSection) -> Result<Self, Self::Error> {
        section.to_port_config()
    }
}

/// Parâmetros do transporte.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSection {
    pub poll_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub close_policy: ClosePolicy,
}

impl Default for LinkSection {
    fn default() -> Self {
        let options = LinkOptions::default();
        Self {
            poll_timeout_ms: options.poll_timeout.as_millis() as u64,
            close_timeout_ms: options.close_timeout.as_millis() as u64,
            queue_capacity: options.queue_capacity,
            overflow: options.overflow,
            close_policy: options.close_policy,
        }
    }
}

impl LinkSection {
    pub fn to_options(&self) -> LinkOptions {
        LinkOptions {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
            queue_capacity: self.queue_capacity,
            overflow: self.overflow,
            close_policy: self.close_policy,
        }
    }
}

/// Comportamento do binário da estação.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationSection {
    /// Intervalo entre amostras publicadas (segundos)
    pub publish_interval_secs: f64,
    /// Nome gravado nas amostras (até 20 bytes)
    pub sensor_name: String,
    /// Tópicos encaminhados ao peer
    pub forward_topics: Vec<TopicId>,
    /// Usa o dispositivo em memória com eco em vez da UART
    pub loopback: bool,
}

impl Default for StationSection {
    fn default() -> Self {
        Self {
            publish_interval_secs: 1.0,
            sensor_name: "Magnetometer".into(),
            forward_topics: vec![SENSOR_SAMPLE_TOPIC],
            loopback: false,
        }
    }
}

/// Configuração raiz.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialSection,
    pub link: LinkSection,
    pub station: StationSection,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML.
    ///
    /// Arquivo ausente ou inválido cai na configuração padrão.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Configuração carregada de {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!("Erro ao parsear {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Erro ao ler {}: {}", path.display(), e);
                }
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(path, content).map_err(|e| e.to_string())?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml (ao lado do executável).
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = self.serial.to_port_config() {
            errors.push(format!("[serial] {e}"));
        }
        if self.link.poll_timeout_ms == 0 {
            errors.push("poll_timeout_ms não pode ser 0".into());
        }
        if self.link.close_timeout_ms < self.link.poll_timeout_ms {
            errors.push(format!(
                "close_timeout_ms ({}) menor que poll_timeout_ms ({})",
                self.link.close_timeout_ms, self.link.poll_timeout_ms
            ));
        }
        if self.link.queue_capacity == 0 {
            errors.push("queue_capacity não pode ser 0".into());
        }
        if self.station.publish_interval_secs < 0.05 || self.station.publish_interval_secs > 3600.0 {
            errors.push(format!(
                "Intervalo de publicação inválido: {} (0.05–3600.0)",
                self.station.publish_interval_secs
            ));
        }
        if self.station.sensor_name.len() > SENSOR_NAME_LEN {
            errors.push(format!(
                "sensor_name com {} bytes (máximo {})",
                self.station.sensor_name.len(),
                SENSOR_NAME_LEN
            ));
        }
        if self.station.sensor_name.contains('\0') {
            errors.push("sensor_name não pode conter \\0".into());
        }

        errors
    }
}
