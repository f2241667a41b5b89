use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use config::{Config, File as ConfigFile};
use filechain_ledger::{check_chain, Ledger, LedgerConfig};
use filechain_p2p::{Collaborators, OverlayConfig, OverlayNode, RedundancyTracker, RewardLedger};
use filechain_storage::{ChainStore, FsContentStore, JsonChainStore, MemoryChainStore};
use filechain_types::{now_ms, BlockIndex, FileRecord};
use fs2::FileExt;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod version;

use version::{git_commit_hash, FILECHAIN_VERSION, PROTOCOL_VERSION};

const DEFAULT_CONFIG_PATH: &str = "config/node.toml";
const CHAIN_FILE: &str = "chain.json";
const FILES_DIR: &str = "files";
const NODE_ID_FILE: &str = "node_id";

#[derive(Debug, Clone, PartialEq)]
struct AppConfig {
    config_path: Option<PathBuf>,

    // Node identity
    node_id: Option<String>,
    data_dir: PathBuf,

    // P2P
    p2p_host: String,
    p2p_port: u16,
    advertised_port: Option<u16>,
    bootstrap_peers: Vec<String>,
    connect_timeout_secs: u64,
    max_frame_bytes: usize,
    outbound_queue: usize,
    send_timeout_secs: u64,

    // Ledger
    difficulty: usize,
    max_mining_attempts: u64,

    // Files
    file_request_timeout_secs: u64,
    register: Vec<PathBuf>,

    // Observability
    prometheus_enabled: bool,
    metrics_host: String,
    metrics_port: u16,

    // Logging
    log_level: String,
    log_format: String,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("filechain"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl AppConfig {
    fn load(config_path_override: Option<&str>) -> Result<Self> {
        let resolved_path = match config_path_override {
            Some(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    anyhow::bail!(
                        "Configuration file {} not found (specified via --config)",
                        path.display()
                    );
                }
                Some(path)
            }
            None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|path| path.exists()),
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("FILECHAIN"));
        let config = builder.build()?;

        let ledger_defaults = LedgerConfig::default();
        let overlay_defaults = OverlayConfig::default();

        Ok(Self {
            config_path: resolved_path,
            node_id: get_string_value(&config, &["node_id", "node.id"]),
            data_dir: get_string_value(&config, &["data_dir", "node.data_dir"])
                .map(PathBuf::from)
                .unwrap_or_else(default_data_dir),
            p2p_host: get_string_value(&config, &["p2p_host", "p2p.host"])
                .unwrap_or(overlay_defaults.listen_host),
            p2p_port: get_parsed_value(&config, &["p2p_port", "p2p.port"])?
                .unwrap_or(overlay_defaults.listen_port),
            advertised_port: get_parsed_value(
                &config,
                &["advertised_port", "p2p.advertised_port"],
            )?,
            bootstrap_peers: get_list_value(&config, &["bootstrap_peers", "p2p.bootstrap_peers"])
                .unwrap_or_default(),
            connect_timeout_secs: get_parsed_value(
                &config,
                &["connect_timeout_secs", "p2p.connect_timeout_secs"],
            )?
            .unwrap_or(overlay_defaults.connect_timeout.as_secs()),
            max_frame_bytes: get_parsed_value(&config, &["max_frame_bytes", "p2p.max_frame_bytes"])?
                .unwrap_or(overlay_defaults.max_frame_bytes),
            outbound_queue: get_parsed_value(&config, &["outbound_queue", "p2p.outbound_queue"])?
                .unwrap_or(overlay_defaults.outbound_queue),
            send_timeout_secs: get_parsed_value(
                &config,
                &["send_timeout_secs", "p2p.send_timeout_secs"],
            )?
            .unwrap_or(overlay_defaults.send_timeout.as_secs()),
            difficulty: get_parsed_value(&config, &["difficulty", "ledger.difficulty"])?
                .unwrap_or(ledger_defaults.difficulty),
            max_mining_attempts: get_parsed_value(
                &config,
                &["max_mining_attempts", "ledger.max_mining_attempts"],
            )?
            .unwrap_or(ledger_defaults.max_mining_attempts),
            file_request_timeout_secs: get_parsed_value(
                &config,
                &["file_request_timeout_secs", "files.request_timeout_secs"],
            )?
            .unwrap_or(overlay_defaults.file_request_timeout.as_secs()),
            register: Vec::new(),
            prometheus_enabled: get_bool_value(
                &config,
                &["prometheus_enabled", "metrics.enabled"],
                false,
            ),
            metrics_host: get_string_value(&config, &["metrics_host", "metrics.host"])
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            metrics_port: get_parsed_value(&config, &["metrics_port", "metrics.port"])?
                .unwrap_or(9898),
            log_level: get_string_value(&config, &["log_level", "logging.level"])
                .unwrap_or_else(|| "info".to_string()),
            log_format: get_string_value(&config, &["log_format", "logging.format"])
                .unwrap_or_else(|| "pretty".to_string()),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("DATA_DIR must not be empty");
        }
        if matches!(&self.node_id, Some(id) if id.trim().is_empty()) {
            anyhow::bail!("NODE_ID must not be empty when set");
        }
        if self.p2p_port == 0 {
            anyhow::bail!("P2P_PORT must be greater than zero");
        }
        if self.prometheus_enabled && self.metrics_port == self.p2p_port {
            anyhow::bail!("METRICS_PORT and P2P_PORT must be different values");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("CONNECT_TIMEOUT_SECS must be greater than zero");
        }
        if self.send_timeout_secs == 0 {
            anyhow::bail!("SEND_TIMEOUT_SECS must be greater than zero");
        }
        if self.file_request_timeout_secs == 0 {
            anyhow::bail!("FILE_REQUEST_TIMEOUT_SECS must be greater than zero");
        }
        self.ledger_config()
            .validate()
            .map_err(|err| anyhow!("{err}"))?;
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "LOG_FORMAT must be 'pretty' or 'json', got '{}'",
                self.log_format
            );
        }
        Ok(())
    }

    fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            difficulty: self.difficulty,
            max_mining_attempts: self.max_mining_attempts,
        }
    }

    fn overlay_config(&self, node_id: String) -> OverlayConfig {
        OverlayConfig {
            node_id,
            listen_host: self.p2p_host.clone(),
            listen_port: self.p2p_port,
            advertised_port: self.advertised_port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_frame_bytes: self.max_frame_bytes,
            outbound_queue: self.outbound_queue,
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            file_request_timeout: Duration::from_secs(self.file_request_timeout_secs),
            ..OverlayConfig::default()
        }
    }

    fn chain_path(&self) -> PathBuf {
        self.data_dir.join(CHAIN_FILE)
    }
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn get_parsed_value<T>(config: &Config, keys: &[&str]) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = get_string_value(config, keys) else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|err| anyhow!("invalid value '{raw}' for {}: {err}", keys[0]))
}

/// Accepts a TOML array or a comma-separated string (the form env vars use).
fn get_list_value(config: &Config, keys: &[&str]) -> Option<Vec<String>> {
    keys.iter().find_map(|key| {
        if let Ok(values) = config.get_array(key) {
            return Some(
                values
                    .into_iter()
                    .filter_map(|value| value.into_string().ok())
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .collect(),
            );
        }
        config.get_string(key).ok().map(|raw| {
            raw.split(',')
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect()
        })
    })
}

fn arg_string(matches: &ArgMatches, id: &str) -> Option<String> {
    matches.try_get_one::<String>(id).ok().flatten().cloned()
}

fn arg_value<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> Option<T> {
    matches.try_get_one::<T>(id).ok().flatten().cloned()
}

fn arg_flag(matches: &ArgMatches, id: &str) -> bool {
    arg_value::<bool>(matches, id).unwrap_or(false)
}

fn arg_list(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .try_get_many::<String>(id)
        .ok()
        .flatten()
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn load_config_with_overrides(
    matches: &ArgMatches,
    sub_matches: Option<&ArgMatches>,
) -> Result<AppConfig> {
    let config_path = sub_matches
        .and_then(|sub| arg_string(sub, "config"))
        .or_else(|| arg_string(matches, "config"));
    let mut config = AppConfig::load(config_path.as_deref())?;
    apply_overrides(matches, &mut config);
    if let Some(sub) = sub_matches {
        apply_overrides(sub, &mut config);
    }
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &ArgMatches, config: &mut AppConfig) {
    if let Some(data_dir) = arg_string(matches, "data-dir") {
        config.data_dir = PathBuf::from(data_dir);
    }
    if let Some(node_id) = arg_string(matches, "node-id") {
        config.node_id = Some(node_id);
    }
    if let Some(log_level) = arg_string(matches, "log-level") {
        config.log_level = log_level;
    }
    if let Some(log_format) = arg_string(matches, "log-format") {
        config.log_format = log_format;
    }
    if let Some(host) = arg_string(matches, "host") {
        config.p2p_host = host;
    }
    if let Some(port) = arg_value::<u16>(matches, "port") {
        config.p2p_port = port;
    }
    if let Some(port) = arg_value::<u16>(matches, "advertised-port") {
        config.advertised_port = Some(port);
    }
    if let Some(difficulty) = arg_value::<usize>(matches, "difficulty") {
        config.difficulty = difficulty;
    }
    if let Some(port) = arg_value::<u16>(matches, "metrics-port") {
        config.prometheus_enabled = true;
        config.metrics_port = port;
    }
    if arg_flag(matches, "disable-metrics") {
        config.prometheus_enabled = false;
    }

    for peer in arg_list(matches, "peer") {
        if !config.bootstrap_peers.contains(&peer) {
            config.bootstrap_peers.push(peer);
        }
    }
    for path in arg_list(matches, "register").into_iter().map(PathBuf::from) {
        if !config.register.contains(&path) {
            config.register.push(path);
        }
    }
}

fn build_cli() -> Command {
    Command::new("filechain-node")
        .version(FILECHAIN_VERSION)
        .about("Filechain file-registration ledger node")
        .disable_version_flag(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (defaults to config/node.toml when present)")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory holding the chain, stored files, and lock file")
                .global(true),
        )
        .arg(
            Arg::new("node-id")
                .long("node-id")
                .value_name("ID")
                .help("Node id advertised to peers (generated once per data dir when omitted)")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .arg(
            Arg::new("version_flag")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue)
                .help("Print detailed version information and exit")
                .global(true),
        )
        .subcommand(
            Command::new("run")
                .about("Start the node: listen for peers, sync the chain, serve files")
                .arg(
                    Arg::new("host")
                        .long("host")
                        .value_name("HOST")
                        .help("Override the P2P bind host"),
                )
                .arg(
                    Arg::new("port")
                        .short('p')
                        .long("port")
                        .value_name("PORT")
                        .value_parser(value_parser!(u16))
                        .help("Override the P2P port"),
                )
                .arg(
                    Arg::new("advertised-port")
                        .long("advertised-port")
                        .value_name("PORT")
                        .value_parser(value_parser!(u16))
                        .help("Port announced in handshakes when it differs from the bound port"),
                )
                .arg(
                    Arg::new("peer")
                        .long("peer")
                        .value_name("ADDR")
                        .action(ArgAction::Append)
                        .help("Bootstrap peer host:port (repeatable)"),
                )
                .arg(
                    Arg::new("register")
                        .long("register")
                        .value_name("PATH")
                        .action(ArgAction::Append)
                        .help("Register a local file on startup (repeatable)"),
                )
                .arg(
                    Arg::new("difficulty")
                        .long("difficulty")
                        .value_name("N")
                        .value_parser(value_parser!(usize))
                        .help("Leading zero hex digits required when sealing blocks"),
                )
                .arg(
                    Arg::new("metrics-port")
                        .long("metrics-port")
                        .value_name("PORT")
                        .value_parser(value_parser!(u16))
                        .help("Enable the Prometheus endpoint on this port"),
                )
                .arg(
                    Arg::new("disable-metrics")
                        .long("disable-metrics")
                        .action(ArgAction::SetTrue)
                        .help("Disable the Prometheus metrics endpoint"),
                ),
        )
        .subcommand(Command::new("verify").about("Validate the persisted chain and exit"))
        .subcommand(
            Command::new("files").about("Print the live file set of the persisted chain as JSON"),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let (command, sub_matches) = match matches.subcommand() {
        Some((name, sub)) => (name, Some(sub)),
        None => ("run", None),
    };

    let version_requested = arg_flag(&matches, "version_flag")
        || sub_matches.is_some_and(|sub| arg_flag(sub, "version_flag"));
    if version_requested {
        print_version_info();
        return Ok(());
    }

    let config = load_config_with_overrides(&matches, sub_matches)?;

    match command {
        "run" => run_node(config).await,
        "verify" => verify_chain(&config),
        "files" => print_files(&config),
        other => Err(anyhow!("Unsupported command {other}")),
    }
}

async fn run_node(config: AppConfig) -> Result<()> {
    init_logging(&config)?;
    info!(
        version = FILECHAIN_VERSION,
        commit = git_commit_hash(),
        protocol = PROTOCOL_VERSION,
        "Starting Filechain node"
    );
    if let Some(path) = &config.config_path {
        info!(path = %path.display(), "Loaded configuration file");
    }

    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let _lock = DataDirLock::acquire(&config.data_dir, "run")?;
    let node_id = resolve_node_id(&config)?;
    init_metrics(&config);

    let store: Arc<dyn ChainStore> = Arc::new(JsonChainStore::new(config.chain_path()));
    let ledger = Ledger::open(config.ledger_config(), store)
        .with_context(|| format!("failed to load chain from {}", config.chain_path().display()))?
        .into_shared();
    {
        let ledger = ledger.lock();
        info!(height = ledger.tip().index, tip = %ledger.tip().hash, "Chain loaded");
    }

    let content = Arc::new(
        FsContentStore::open(config.data_dir.join(FILES_DIR))
            .context("failed to open content store")?,
    );
    let collaborators = Collaborators {
        redundancy: Arc::new(LoggingCollaborators),
        rewards: Arc::new(LoggingCollaborators),
    };
    let overlay = OverlayNode::new(
        config.overlay_config(node_id.clone()),
        ledger,
        content,
        collaborators,
    )?;
    let addr = overlay.start().await?;
    info!(%node_id, %addr, "Filechain node is listening");

    for peer in &config.bootstrap_peers {
        match overlay.connect_to_peer(peer).await {
            Ok(info) => info!(peer = %peer, conn = info.conn_id, "Connected to bootstrap peer"),
            Err(err) => warn!(peer = %peer, error = %err, "Failed to connect to bootstrap peer"),
        }
    }

    for path in &config.register {
        if let Err(err) = register_path(&overlay, path).await {
            error!(path = %path.display(), error = %err, "Failed to register file");
        }
    }

    let mut fatal = overlay.fatal_signal();
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Shutting down Filechain node");
            Ok(())
        }
        changed = fatal.wait_for(|reason| reason.is_some()) => {
            let reason = match changed {
                Ok(reason) => reason.clone().unwrap_or_default(),
                Err(_) => "overlay stopped".to_string(),
            };
            error!(%reason, "Stopping after fatal persistence failure");
            Err(anyhow!("chain persistence failed: {reason}"))
        }
    };

    overlay.shutdown();
    info!("Filechain node shutdown complete");
    outcome
}

async fn register_path(overlay: &OverlayNode, path: &Path) -> Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
    let original_path = fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string();

    let size = bytes.len();
    let block = overlay
        .register_file(&filename, &original_path, bytes, None)
        .await?;
    info!(
        file_id = %block.payload.file.id,
        index = block.index,
        bytes = size,
        %filename,
        "Registered file"
    );
    Ok(())
}

/// Load the persisted chain without creating one.
fn load_persisted_chain(config: &AppConfig) -> Result<Option<Vec<filechain_types::Block>>> {
    let store = JsonChainStore::new(config.chain_path());
    store
        .load()
        .with_context(|| format!("failed to read {}", store.path().display()))
}

fn verify_chain(config: &AppConfig) -> Result<()> {
    let Some(chain) = load_persisted_chain(config)? else {
        println!("No chain persisted at {}", config.chain_path().display());
        return Ok(());
    };
    if let Err(err) = check_chain(&chain) {
        anyhow::bail!("chain at {} is invalid: {err}", config.chain_path().display());
    }
    if let Some(tip) = chain.last() {
        println!("OK: {} blocks, tip {} ({})", chain.len(), tip.index, tip.hash);
    }
    Ok(())
}

fn live_files(config: &AppConfig) -> Result<Vec<FileRecord>> {
    let chain = load_persisted_chain(config)?.unwrap_or_default();
    let store = Arc::new(MemoryChainStore::with_chain(chain));
    let ledger = Ledger::open(config.ledger_config(), store).context("persisted chain is invalid")?;
    Ok(ledger.all_files())
}

fn print_files(config: &AppConfig) -> Result<()> {
    let files = live_files(config)?;
    println!("{}", serde_json::to_string_pretty(&files)?);
    Ok(())
}

/// Use the configured id, else the one stored in the data dir, else mint one.
fn resolve_node_id(config: &AppConfig) -> Result<String> {
    if let Some(node_id) = &config.node_id {
        return Ok(node_id.clone());
    }

    let path = config.data_dir.join(NODE_ID_FILE);
    if let Ok(existing) = fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }

    let node_id = format!("node-{}", uuid::Uuid::new_v4().simple());
    fs::write(&path, &node_id).with_context(|| format!("failed to write {}", path.display()))?;
    info!(%node_id, "Generated node id");
    Ok(node_id)
}

/// Reports collaborator notifications through the log.
struct LoggingCollaborators;

impl RedundancyTracker for LoggingCollaborators {
    fn notify_local_file_stored(&self, record: &FileRecord) {
        debug!(file_id = %record.id, bytes = record.size_bytes, "File stored locally");
    }

    fn notify_remote_file_seen(&self, node_id: &str, file_id: &str, size_hint: u64) {
        debug!(%node_id, %file_id, size_hint, "Peer announced file");
    }
}

impl RewardLedger for LoggingCollaborators {
    fn notify_block_validated(&self, node_id: &str, block_index: BlockIndex) {
        debug!(%node_id, block_index, "Block validated");
    }

    fn notify_bytes_served(&self, node_id: &str, file_id: &str, byte_count: u64, block_index: BlockIndex) {
        debug!(%node_id, %file_id, byte_count, block_index, "Bytes served");
    }
}

fn init_metrics(config: &AppConfig) {
    if !config.prometheus_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return;
    }

    let addr: SocketAddr = match format!("{}:{}", config.metrics_host, config.metrics_port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            warn!("Invalid metrics listen address: {}", err);
            return;
        }
    };

    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            info!(%addr, "Prometheus metrics exporter listening");
            describe_gauge!("filechain_chain_height", "Index of the local chain tip");
            describe_gauge!("filechain_p2p_peers", "Currently connected peer sessions");
            describe_counter!(
                "filechain_p2p_messages_received_total",
                "Decoded protocol messages by type"
            );
            describe_counter!(
                "filechain_p2p_messages_dropped_total",
                "Inbound frames dropped as malformed or oversized"
            );
            describe_counter!(
                "filechain_p2p_blocks_appended_total",
                "Blocks appended to the local chain"
            );
            describe_counter!(
                "filechain_p2p_chain_replacements_total",
                "Times a longer peer chain replaced the local chain"
            );
            describe_counter!(
                "filechain_p2p_bytes_served_total",
                "File bytes streamed to peers"
            );
            describe_counter!(
                "filechain_p2p_transfers_rejected_total",
                "Downloaded files discarded for a content hash mismatch"
            );
            describe_counter!(
                "filechain_p2p_transfers_abandoned_total",
                "Transfers dropped after an undecodable chunk"
            );
            describe_counter!(
                "filechain_p2p_slow_peers_closed_total",
                "Peers closed after their outbound queue stayed full past send_timeout"
            );
            describe_counter!(
                "filechain_p2p_fatal_errors_total",
                "Persistence failures that stop the node"
            );
        }
        Err(err) => warn!("Failed to install Prometheus metrics exporter: {}", err),
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn print_version_info() {
    println!(
        "Filechain {} (commit {}) [protocol v{}]",
        FILECHAIN_VERSION,
        git_commit_hash(),
        PROTOCOL_VERSION
    );
}

struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    fn acquire<P: AsRef<Path>>(data_dir: P, purpose: &str) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(".filechain.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if let Err(err) = file.try_lock_exclusive() {
            return Err(anyhow!(
                "Data directory {} is locked by another process ({}). \
                 Stop the running node or remove {} if you are sure it is stale.",
                dir.display(),
                err,
                lock_path.display()
            ));
        }

        file.set_len(0)?;
        writeln!(
            &file,
            "pid={};purpose={};started_ms={}",
            std::process::id(),
            purpose,
            now_ms()
        )?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}
