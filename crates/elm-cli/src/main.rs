//! elm-tool - send BMW-FAST telegrams through an ELM327 adapter

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use elm_transport::stream::ElmStream;
use elm_transport::telegram::{checksum, encode_telegram, FAST_PHYSICAL};
use elm_transport::{
    address, AsyncElmClient, ElmConfig, ElmInterface, SerialElmStream, TcpElmStream,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "elm-tool")]
#[command(author, version, about = "BMW-FAST over ELM327 diagnostic tool")]
struct Cli {
    /// Wi-Fi adapter address
    #[arg(long, env = "ELM_TCP", conflicts_with = "serial")]
    tcp: Option<String>,

    /// Serial device of a USB or Bluetooth adapter
    #[arg(long, env = "ELM_SERIAL")]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = SerialElmStream::DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Configuration file path
    #[arg(short, long, env = "ELM_CONFIG")]
    config: Option<PathBuf>,

    /// Response timeout in milliseconds
    #[arg(short, long, default_value = "1000")]
    timeout: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the adapter and report its transport variant
    Info,

    /// Send a complete telegram, e.g. `82 12 F1 1A 80`
    Raw {
        /// Telegram bytes in hex (spaces allowed)
        telegram: Vec<String>,
    },

    /// Send a diagnostic request to one ECU
    Request {
        /// Target ECU address in hex
        ecu: String,

        /// Request bytes in hex (spaces allowed)
        data: Vec<String>,
    },
}

fn init_logging(verbose: bool) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

fn parse_hex(parts: &[String]) -> Result<Vec<u8>> {
    let text: String = parts.concat().chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&text).with_context(|| format!("invalid hex: {text}"))
}

fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run<S: ElmStream + 'static>(stream: S, config: ElmConfig, cli: &Cli) -> Result<()> {
    let client = AsyncElmClient::new(ElmInterface::new(stream, config));
    let kind = client.init().await.context("Adapter init failed")?;
    info!("Adapter ready: {:?}", kind);

    let request = match &cli.command {
        Commands::Info => {
            println!("{kind:?}");
            return client.disconnect().await.map_err(Into::into);
        }
        Commands::Raw { telegram } => parse_hex(telegram)?,
        Commands::Request { ecu, data } => {
            let target = u8::from_str_radix(ecu.trim_start_matches("0x"), 16)
                .with_context(|| format!("invalid ECU address: {ecu}"))?;
            let payload = parse_hex(data)?;
            let mut telegram = encode_telegram(FAST_PHYSICAL, target, address::TESTER, &payload);
            telegram.push(checksum(&telegram));
            telegram
        }
    };

    println!("> {}", format_hex(&request));
    let response = client
        .exchange(request, Duration::from_millis(cli.timeout))
        .await
        .context("Exchange failed")?;
    println!("< {}", format_hex(&response));

    client.disconnect().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config = match &cli.config {
        Some(path) => ElmConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ElmConfig::default(),
    };

    match (&cli.tcp, &cli.serial) {
        (_, Some(path)) => {
            let stream = SerialElmStream::open(path, cli.baud)
                .with_context(|| format!("Failed to open {path}"))?;
            run(stream, config, &cli).await
        }
        (Some(addr), None) => {
            let stream = TcpElmStream::connect(addr, config.command_timeout())
                .with_context(|| format!("Failed to connect to {addr}"))?;
            run(stream, config, &cli).await
        }
        (None, None) => {
            info!("No adapter given, using {}", TcpElmStream::DEFAULT_ADDR);
            let addr = TcpElmStream::DEFAULT_ADDR;
            let stream = TcpElmStream::connect(addr, config.command_timeout())
                .context("Failed to connect to the default Wi-Fi adapter")?;
            run(stream, config, &cli).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_with_spaces() {
        let parts = vec!["82 12".to_string(), "F1".to_string(), "1a80".to_string()];
        assert_eq!(parse_hex(&parts).unwrap(), vec![0x82, 0x12, 0xF1, 0x1A, 0x80]);
        assert!(parse_hex(&["8".to_string()]).is_err());
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[0x82, 0xF1, 0x12]), "82 F1 12");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn test_cli_parses_request() {
        let args = ["elm-tool", "--tcp", "127.0.0.1:35000", "request", "12", "1A", "80"];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.tcp.as_deref(), Some("127.0.0.1:35000"));
        assert!(matches!(cli.command, Commands::Request { ref ecu, .. } if ecu == "12"));
    }

    #[test]
    fn test_cli_rejects_two_adapters() {
        let args = ["elm-tool", "--tcp", "a:1", "--serial", "/dev/ttyUSB0", "info"];
        let result = Cli::try_parse_from(args);
        assert!(result.is_err());
    }
}
