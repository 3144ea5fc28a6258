//! Interface de linha de comando do nó baseada em clap.
//!
//! Um único ponto de entrada: sem flags o nó lê o sensor de energia e
//! migra sozinho; `--no-power-sensing` desliga o sensor para testes de
//! bancada sem hardware.

use clap::Parser;
use std::path::PathBuf;

/// brownout: orquestrador de migração de carga para nós com energia solar.
#[derive(Debug, Parser)]
#[command(name = "brownout", version, about)]
pub struct Cli {
    /// Desliga o sensoriamento de energia; o nó só migra por comando do operador.
    #[arg(long, default_value_t = false)]
    pub no_power_sensing: bool,

    /// Caminho para o arquivo de configuração (padrão: ./brownout.toml).
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn power_sensing_enabled_by_default() {
        let cli = Cli::parse_from(["brownout"]);
        assert!(!cli.no_power_sensing);
        assert!(cli.config.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn cli_parses_no_power_sensing() {
        let cli = Cli::parse_from(["brownout", "--no-power-sensing"]);
        assert!(cli.no_power_sensing);
    }

    #[test]
    fn cli_parses_config_and_verbose() {
        let cli = Cli::parse_from(["brownout", "--config", "/etc/brownout.toml", "-v"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/brownout.toml")));
        assert!(cli.verbose);
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
