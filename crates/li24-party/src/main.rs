//! Li24 Party CLI
//!
//! Command-line interface for running threshold ECDSA party operations
//! over a TCP mesh:
//! - Distributed Key Generation
//! - Key Refresh
//! - Signing
//! - Address derivation

mod net;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use li24_core::types::session_id_from_label;
use li24_core::{address, keygen, sign, PartyId, SessionId, ThresholdConfig};
use net::TcpNetwork;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};

/// Li24 Party - threshold ECDSA party node
#[derive(Parser)]
#[command(name = "li24-party")]
#[command(about = "Threshold ECDSA party node")]
#[command(version)]
struct Cli {
    /// Party ID (0-indexed)
    #[arg(short, long, env = "PARTY_ID")]
    party_id: PartyId,

    /// Address to accept peer connections on
    #[arg(short, long, env = "LISTEN", default_value = "127.0.0.1:7000")]
    listen: SocketAddr,

    /// Peers as `id=host:port`, comma-separated
    #[arg(long, env = "PEERS", value_delimiter = ',', value_parser = parse_peer)]
    peers: Vec<(PartyId, SocketAddr)>,

    /// Data directory for key shares
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    /// Label of this protocol run, identical at every party and fresh for
    /// each keygen, refresh or signing run
    #[arg(long, env = "SESSION")]
    session: Option<String>,

    /// Seconds to keep dialing unreachable peers
    #[arg(long, env = "DIAL_TIMEOUT", default_value_t = net::DEFAULT_DIAL_TIMEOUT.as_secs())]
    dial_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run distributed key generation with every listed peer
    Keygen {
        /// Threshold: any t + 1 parties can sign
        #[arg(short, long, default_value_t = li24_core::DEFAULT_THRESHOLD)]
        t: usize,
    },

    /// Refresh key shares
    Refresh,

    /// Sign a message
    Sign {
        /// Message to sign (UTF-8, or hex with --hex)
        #[arg(short, long)]
        message: String,

        /// Treat the message as hex
        #[arg(long)]
        hex: bool,

        /// Signing party IDs (comma-separated, self included)
        #[arg(short, long, value_delimiter = ',')]
        signers: Vec<PartyId>,
    },

    /// Print addresses of the group key or a derived child
    Address {
        /// Unhardened derivation path (e.g., m/44/60/0/0/0)
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Show key share info
    Info,
}

fn parse_peer(s: &str) -> std::result::Result<(PartyId, SocketAddr), String> {
    let (id, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {}", s))?;
    let id = id.trim().parse().map_err(|e| format!("party id {}: {}", id, e))?;
    let addr = addr.trim().parse().map_err(|e| format!("address {}: {}", addr, e))?;
    Ok((id, addr))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.dest)?;

    match &cli.command {
        Commands::Keygen { t } => run_keygen(&cli, *t).await?,
        Commands::Refresh => run_refresh(&cli).await?,
        Commands::Sign {
            message,
            hex,
            signers,
        } => run_sign(&cli, message, *hex, signers).await?,
        Commands::Address { path } => show_address(&cli, path.as_deref())?,
        Commands::Info => show_info(&cli)?,
    }

    Ok(())
}

impl Cli {
    fn key_share_path(&self) -> PathBuf {
        self.dest.join(format!("keyshare.{}.bin", self.party_id))
    }

    fn session_id(&self) -> Result<SessionId> {
        match &self.session {
            Some(label) => Ok(session_id_from_label(label)),
            None => bail!("--session is required for protocol runs"),
        }
    }

    fn peer_map(&self) -> BTreeMap<PartyId, SocketAddr> {
        self.peers
            .iter()
            .copied()
            .filter(|(id, _)| *id != self.party_id)
            .collect()
    }

    async fn connect(&self, only: Option<&[PartyId]>) -> Result<TcpNetwork> {
        let mut peers = self.peer_map();
        if let Some(only) = only {
            peers.retain(|id, _| only.contains(id));
        }
        let network = TcpNetwork::connect(
            self.party_id,
            self.listen,
            &peers,
            Duration::from_secs(self.dial_timeout),
        )
        .await?;
        Ok(network)
    }
}

fn load_config(cli: &Cli) -> Result<ThresholdConfig> {
    let path = cli.key_share_path();
    let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ThresholdConfig::from_bytes(&bytes)?)
}

fn save_config(cli: &Cli, config: &ThresholdConfig) -> Result<PathBuf> {
    let path = cli.key_share_path();
    std::fs::write(&path, config.to_bytes()?)?;
    Ok(path)
}

async fn run_keygen(cli: &Cli, t: usize) -> Result<()> {
    let mut party_ids: Vec<PartyId> = cli.peer_map().keys().copied().collect();
    party_ids.push(cli.party_id);

    let session_id = cli.session_id()?;
    let network = cli.connect(None).await?;
    let config = keygen::run_keygen(&party_ids, cli.party_id, t, &session_id, &network).await?;
    let path = save_config(cli, &config)?;

    let public_key = hex::encode(config.public_key_bytes());
    info!(public_key = %public_key, path = ?path, "Keygen completed, key share saved");
    println!("Public Key: {}", public_key);
    Ok(())
}

async fn run_refresh(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let session_id = cli.session_id()?;
    let network = cli.connect(Some(config.party_ids().as_slice())).await?;
    let refreshed = keygen::run_key_refresh(&config, &session_id, &network).await?;
    save_config(cli, &refreshed)?;
    info!("Key refresh completed");
    Ok(())
}

async fn run_sign(cli: &Cli, message: &str, is_hex: bool, signers: &[PartyId]) -> Result<()> {
    let config = load_config(cli)?;
    let message = if is_hex {
        hex::decode(message)?
    } else {
        message.as_bytes().to_vec()
    };
    if !signers.contains(&cli.party_id) {
        bail!("Party {} is not among the signers {:?}", cli.party_id, signers);
    }

    let session_id = cli.session_id()?;
    let network = cli.connect(Some(signers)).await?;
    let output = sign::run_sign(&config, signers, &message, &session_id, &network).await?;
    // the ratcheted seeds must replace the old ones before anything else signs
    save_config(cli, &output.config)?;

    let signature = output.signature;
    info!(
        r = hex::encode(signature.r().to_bytes()),
        s = hex::encode(signature.s().to_bytes()),
        recovery_id = signature.recovery_id(),
        "Signature generated"
    );
    println!("Signature:");
    println!("  r: {}", hex::encode(signature.r().to_bytes()));
    println!("  s: {}", hex::encode(signature.s().to_bytes()));
    println!("  v: {}", signature.recovery_id());
    println!("  DER: {}", hex::encode(signature.to_der()?));
    Ok(())
}

fn show_address(cli: &Cli, path: Option<&str>) -> Result<()> {
    let config = load_config(cli)?;
    let config = match path {
        Some(path) => config.derive_path(path)?,
        None => config,
    };
    let public_key = config.public_point();
    println!("Public Key: {}", hex::encode(config.public_key_bytes()));
    println!("Bitcoin:    {}", address::bitcoin_p2pkh(&public_key));
    println!("Ethereum:   {}", address::ethereum(&public_key));
    Ok(())
}

fn show_info(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    println!("Key Share Info:");
    println!("  Party ID: {}", config.self_id);
    println!("  Parties: {:?}", config.party_ids());
    println!("  Threshold: {}", config.threshold);
    println!("  Public Key: {}", hex::encode(config.public_key_bytes()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        assert_eq!(
            parse_peer("2=127.0.0.1:7002").unwrap(),
            (2, "127.0.0.1:7002".parse().unwrap())
        );
        assert!(parse_peer("127.0.0.1:7002").is_err());
        assert!(parse_peer("x=127.0.0.1:7002").is_err());
    }

    #[test]
    fn test_cli_reads_peer_list() {
        let cli = Cli::try_parse_from([
            "li24-party",
            "--party-id",
            "1",
            "--peers",
            "0=127.0.0.1:7000,1=127.0.0.1:7001,2=127.0.0.1:7002",
            "--session",
            "order-42",
            "sign",
            "--message",
            "hello",
            "--signers",
            "0,1",
        ])
        .unwrap();
        assert_eq!(cli.peer_map().keys().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert!(matches!(cli.command, Commands::Sign { ref signers, .. } if signers == &[0, 1]));
        assert_eq!(cli.session_id().unwrap(), session_id_from_label("order-42"));
    }

    #[test]
    fn test_protocol_runs_need_a_session() {
        let cli = Cli::try_parse_from(["li24-party", "--party-id", "0", "refresh"]).unwrap();
        assert!(cli.session_id().is_err());
    }
}
