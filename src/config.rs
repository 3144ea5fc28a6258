//! Configuração do nó carregada a partir de `brownout.toml`.
//!
//! A struct [`NodeConfig`] agrupa todas as seções configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis, de modo que um
//! nó sem arquivo de configuração ainda roda com os valores da frota.
//! A variável de ambiente `BROWNOUT_NODE_ADDRESS` tem precedência sobre o arquivo.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "brownout.toml";
const ADDRESS_ENV: &str = "BROWNOUT_NODE_ADDRESS";
/// Teto para qualquer espera configurada em milissegundos (um dia).
const MAX_WAIT_MS: u64 = 86_400_000;

/// Configuração de nível superior carregada de `brownout.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub power: PowerConfig,
    pub workload: WorkloadConfig,
    pub gossip: GossipConfig,
    pub selection: SelectionConfig,
    pub transfer: TransferConfig,
    pub markers: MarkerConfig,
}

/// Identidade do nó e ritmo do laço principal.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Endereço anunciado aos pares. Descoberto pela interface quando ausente.
    pub address: Option<IpAddr>,
    /// Interface de rede usada para o alias e para descobrir o endereço.
    pub interface: String,
    /// Diretório onde ficam os marcadores de comando e o relatório.
    pub state_dir: PathBuf,
    /// Intervalo entre ticks da máquina de estados.
    pub tick_interval_ms: u64,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            address: None,
            interface: "eth0".to_string(),
            state_dir: PathBuf::from("/home/pi"),
            tick_interval_ms: 50,
        }
    }
}

impl NodeSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Sensoriamento de energia (ADC exposto via sysfs).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Chave explícita: desligada, o nó nunca migra sozinho.
    pub sensing_enabled: bool,
    /// Número de amostras na média móvel.
    pub window_size: usize,
    /// Abaixo desta média o nó migra preventivamente.
    pub migrate_threshold_volts: f64,
    /// Abaixo desta média o nó vai direto para desligamento.
    pub shutdown_threshold_volts: f64,
    pub voltage_path: PathBuf,
    pub current_path: PathBuf,
    /// Multiplicador aplicado à leitura bruta de tensão.
    pub voltage_scale: f64,
    /// Multiplicador aplicado à leitura bruta de corrente.
    pub current_scale: f64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            sensing_enabled: true,
            window_size: 5,
            migrate_threshold_volts: 12.0,
            shutdown_threshold_volts: 4.0,
            voltage_path: PathBuf::from("/sys/bus/iio/devices/iio:device0/in_voltage2_raw"),
            current_path: PathBuf::from(
                "/sys/bus/iio/devices/iio:device0/in_voltage1-voltage0_raw",
            ),
            // MCP3008 de 10 bits atrás de um divisor de 55:1.
            voltage_scale: 55.0 / 1023.0,
            current_scale: 0.1 / 1023.0,
        }
    }
}

/// A carga de trabalho migrável (uma por nó).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub name: String,
    pub directory: PathBuf,
    /// Programa e argumentos usados num início do zero.
    pub command: Vec<String>,
    /// Trecho da linha de comando usado para achar o PID.
    pub process_pattern: String,
    /// Endereço pelo qual clientes alcançam a carga, em qualquer nó.
    pub alias: IpAddr,
    pub alias_prefix_len: u8,
    /// Subdiretório (dentro de `directory`) com as imagens do checkpoint.
    pub images_dir: String,
    /// Espera máxima para resolver o PID após iniciar ou restaurar.
    pub start_timeout_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            name: "videoboard".to_string(),
            directory: PathBuf::from("/home/pi/videoboard"),
            command: vec![
                "python3".to_string(),
                "vidboardmain.py".to_string(),
                "--bind_ip".to_string(),
                "192.168.137.3".to_string(),
            ],
            process_pattern: "vidboardmain.py".to_string(),
            alias: IpAddr::from([192, 168, 137, 3]),
            alias_prefix_len: 24,
            images_dir: "checkpoint".to_string(),
            start_timeout_ms: 2000,
        }
    }
}

impl WorkloadConfig {
    pub fn images_path(&self) -> PathBuf {
        self.directory.join(&self.images_dir)
    }
}

/// Protocolo de fofoca (broadcast UDP).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub broadcast_address: IpAddr,
    pub port: u16,
    pub broadcast_interval_ms: u64,
    pub receive_timeout_ms: u64,
    /// Após este número de timeouts seguidos a tabela de pares é zerada.
    pub max_consecutive_timeouts: u32,
    /// Entradas sem notícia há mais que isto são descartadas.
    pub stale_after_ms: u64,
    pub packet_size: usize,
    /// Espera máxima ao parar as tarefas de fundo.
    pub stop_grace_ms: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            broadcast_address: IpAddr::from([255, 255, 255, 255]),
            port: 12345,
            broadcast_interval_ms: 200,
            receive_timeout_ms: 1000,
            max_consecutive_timeouts: 8,
            stale_after_ms: 10_000,
            packet_size: 512,
            stop_grace_ms: 2000,
        }
    }
}

impl GossipConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

/// Escolha do nó de destino.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Exige um pacote novo do candidato antes de migrar para ele.
    pub confirm_liveness: bool,
    pub confirm_timeout_ms: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            confirm_liveness: true,
            confirm_timeout_ms: 3000,
        }
    }
}

/// Cópia remota dos artefatos (scp com autenticação por chave).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub user: String,
    pub ssh_port: u16,
    pub connect_timeout_secs: u64,
    /// Tempo máximo de cada cópia.
    pub timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            user: "pi".to_string(),
            ssh_port: 22,
            connect_timeout_secs: 5,
            timeout_ms: 30_000,
        }
    }
}

/// Nomes dos arquivos marcadores, relativos a `node.state_dir`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub start: String,
    pub handoff: String,
    pub resume: String,
    pub migrate: String,
    pub shutdown: String,
    pub idle: String,
    pub report: String,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            start: "startflag.txt".to_string(),
            handoff: "cpflag.txt".to_string(),
            resume: "resume_on_boot.txt".to_string(),
            migrate: "force_migrate.txt".to_string(),
            shutdown: "force_shutdown.txt".to_string(),
            idle: "force_idle.txt".to_string(),
            report: "migrate_stats.txt".to_string(),
        }
    }
}

impl NodeConfig {
    /// Carrega a configuração do caminho informado ou de `brownout.toml`.
    /// Usa valores padrão se o arquivo padrão não existir; um caminho
    /// explícito inexistente é erro.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        // Variável de ambiente tem precedência sobre o arquivo para o endereço do nó.
        if let Ok(raw) = std::env::var(ADDRESS_ENV) {
            if !raw.is_empty() {
                let address = raw
                    .parse()
                    .with_context(|| format!("{ADDRESS_ENV}={raw} is not an IP address"))?;
                config.node.address = Some(address);
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str::<NodeConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Rejeita combinações que tornariam a média móvel ou os limiares sem sentido.
    pub fn validate(&self) -> Result<()> {
        if self.power.window_size == 0 {
            bail!("power.window_size must be at least 1");
        }
        if self.power.shutdown_threshold_volts > self.power.migrate_threshold_volts {
            bail!(
                "power.shutdown_threshold_volts ({}) must not exceed power.migrate_threshold_volts ({})",
                self.power.shutdown_threshold_volts,
                self.power.migrate_threshold_volts
            );
        }
        if self.workload.command.is_empty() {
            bail!("workload.command must name a program");
        }
        if self.gossip.max_consecutive_timeouts == 0 {
            bail!("gossip.max_consecutive_timeouts must be at least 1");
        }
        if self.gossip.broadcast_interval_ms == 0 {
            bail!("gossip.broadcast_interval_ms must be at least 1");
        }
        let waits = [
            ("node.tick_interval_ms", self.node.tick_interval_ms),
            ("workload.start_timeout_ms", self.workload.start_timeout_ms),
            ("gossip.broadcast_interval_ms", self.gossip.broadcast_interval_ms),
            ("gossip.receive_timeout_ms", self.gossip.receive_timeout_ms),
            ("gossip.stale_after_ms", self.gossip.stale_after_ms),
            ("gossip.stop_grace_ms", self.gossip.stop_grace_ms),
            ("selection.confirm_timeout_ms", self.selection.confirm_timeout_ms),
            ("transfer.timeout_ms", self.transfer.timeout_ms),
            (
                "transfer.connect_timeout_secs",
                self.transfer.connect_timeout_secs.saturating_mul(1000),
            ),
        ];
        for (name, ms) in waits {
            if ms > MAX_WAIT_MS {
                bail!("{name} exceeds the {MAX_WAIT_MS}ms limit");
            }
        }
        Ok(())
    }
}
