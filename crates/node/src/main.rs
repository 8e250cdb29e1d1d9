//! # rPoS Node Entry Point
//!
//! Runs one chain instance on LMDB and drives its consensus clock.
//!
//! ## Environment
//! Required:
//! - `RPOS_DATA_DIR`: LMDB directory
//!
//! Optional:
//! - `RPOS_CONFIG`: path to a JSON `ChainConfig` (defaults otherwise)
//! - `RPOS_VALIDATOR_KEY`: hex Ed25519 secret; without it the node only observes
//! - `RPOS_TICK_MS`: consensus poll interval (default 250)
//! - `RPOS_LOG`: max log level (default `info`)
//!
//! ## Loop
//! 1. poll the slot clock; misses are charged there
//! 2. when the slot is ours and open, produce a block
//! 3. every `EXPIRY_SWEEP_TICKS` ticks, expire old pool entries
//! 4. Ctrl-C: stop the loop, write a shutdown checkpoint, flush

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, warn, Level};

use rpos_chain::events::{ChainEvent, ChainEventListener, ChannelListener, CompositeListener, LoggingListener};
use rpos_chain::{now_ms, Chain, ChainConfig, Ed25519Signer, KeySigner, SlotStatus};

const DEFAULT_TICK_MS: u64 = 250;
const EXPIRY_SWEEP_TICKS: u64 = 240;
const EVENT_BUFFER: usize = 1024;

// ════════════════════════════════════════════════════════════════════════════
// NODE CONFIGURATION
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct NodeConfig {
    data_dir: PathBuf,
    chain_config: Option<PathBuf>,
    validator_key: Option<String>,
    tick_ms: u64,
    log_level: Level,
}

impl NodeConfig {
    fn from_env() -> Result<Self> {
        let data_dir = env::var("RPOS_DATA_DIR").context("RPOS_DATA_DIR environment variable not set")?;
        let chain_config = env::var("RPOS_CONFIG").ok().map(PathBuf::from);
        let validator_key = env::var("RPOS_VALIDATOR_KEY").ok().filter(|k| !k.trim().is_empty());
        let tick_ms = match env::var("RPOS_TICK_MS") {
            Ok(v) => v.parse().context("RPOS_TICK_MS must be a number of milliseconds")?,
            Err(_) => DEFAULT_TICK_MS,
        };
        let log_level = match env::var("RPOS_LOG") {
            Ok(v) => Level::from_str(&v).map_err(|_| anyhow::anyhow!("RPOS_LOG: unknown level {:?}", v))?,
            Err(_) => Level::INFO,
        };
        Ok(Self { data_dir: PathBuf::from(data_dir), chain_config, validator_key, tick_ms, log_level })
    }

    fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            bail!("data directory cannot be empty");
        }
        if self.tick_ms == 0 {
            bail!("tick interval cannot be 0");
        }
        if let Some(path) = &self.chain_config {
            if !path.is_file() {
                bail!("chain config {} does not exist", path.display());
            }
        }
        Ok(())
    }

    fn load_chain_config(&self) -> Result<ChainConfig> {
        match &self.chain_config {
            Some(path) => ChainConfig::from_json_file(path)
                .with_context(|| format!("loading chain config from {}", path.display())),
            None => Ok(ChainConfig::default()),
        }
    }

    fn signer(&self) -> Result<Option<Ed25519Signer>> {
        self.validator_key
            .as_deref()
            .map(|k| Ed25519Signer::from_secret_hex(k.trim()).context("RPOS_VALIDATOR_KEY is not a valid key"))
            .transpose()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// MAIN
// ════════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeConfig::from_env()?;
    tracing_subscriber::fmt().with_max_level(config.log_level).with_target(false).init();
    config.validate()?;

    let signer = config.signer()?;
    let mut chain_config = config.load_chain_config()?;
    if let Some(s) = &signer {
        if chain_config.distribution.genesis_operator == rpos_chain::Address::ZERO {
            warn!(operator = %s.address(), "no genesis operator configured, using the validator key");
            chain_config.distribution.genesis_operator = s.address();
        }
    }

    info!(
        data_dir = %config.data_dir.display(),
        validator = ?signer.as_ref().map(|s| s.address()),
        tick_ms = config.tick_ms,
        "starting rpos node"
    );

    let (channel, mut rx) = ChannelListener::new(EVENT_BUFFER);
    let mut listeners = CompositeListener::new();
    listeners.add_listener(Arc::new(LoggingListener));
    listeners.add_listener(Arc::new(channel));
    let listener: Arc<dyn ChainEventListener> = Arc::new(listeners);

    let chain = Arc::new(Chain::open_lmdb(&config.data_dir, chain_config, listener)?);

    if let Some(s) = &signer {
        if chain.tip().is_none() && s.address() == chain.config().distribution.genesis_operator {
            let genesis = chain.init_genesis(s, now_ms())?;
            info!(hash = %genesis.hash.short(), "genesis block written");
        }
    }
    if chain.tip().is_none() {
        warn!("no genesis yet; waiting for the operator's genesis block");
    }

    let events_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            consume_event(&event);
        }
    });

    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    let driver = {
        let chain = chain.clone();
        let tick = Duration::from_millis(config.tick_ms);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {
                        ticks += 1;
                        drive(&chain, signer.as_ref(), ticks);
                    }
                }
            }
            debug!("consensus driver stopped");
        })
    };

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(e) => error!(error = %e, "failed to listen for ctrl-c, shutting down"),
    }
    let _ = stop_tx.send(true);
    if let Err(e) = driver.await {
        error!(error = %e, "consensus driver panicked");
    }

    chain.shutdown()?;
    drop(chain);
    events_task.abort();
    info!("node stopped cleanly");
    Ok(())
}

/// One tick of the slot clock.
fn drive(chain: &Chain, signer: Option<&Ed25519Signer>, ticks: u64) {
    let now = now_ms();
    match chain.poll_consensus(now) {
        SlotStatus::Ready(slot) => {
            if let Some(s) = signer.filter(|s| s.address() == slot.proposer) {
                if let Err(e) = chain.produce_block(s, now) {
                    warn!(height = slot.height, round = slot.round, error = %e, "block production failed");
                }
            }
        }
        SlotStatus::Missed { missed, next } => {
            debug!(height = missed.slot.height, next_round = ?next.map(|n| n.round), "slot moved on");
        }
        SlotStatus::Paused(reason) => {
            if ticks % EXPIRY_SWEEP_TICKS == 1 {
                warn!(%reason, "block production paused");
            }
        }
        SlotStatus::Waiting(_) => {}
    }

    if ticks % EXPIRY_SWEEP_TICKS == 0 {
        let expired = chain.expire_mempool(now);
        if !expired.is_empty() {
            info!(count = expired.len(), "expired pool transactions");
        }
    }
}

/// Hook for the outbound side (gossip, RPC subscribers). Logging is done by
/// `LoggingListener`; here we only surface what an operator must act on.
fn consume_event(event: &ChainEvent) {
    match event {
        ChainEvent::StoreReset { reason } => error!(%reason, "block store was reset, resync required"),
        other if other.is_warning() => debug!(event = %other, "operator attention"),
        _ => {}
    }
}
