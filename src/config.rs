/// Configuration
///
/// CLI flags (`clap`) layered over a config file and environment variables
/// (the `config` crate), exposed as one typed `Config` struct — following
/// the teacher's config-loading pattern but enumerating every option
/// explicitly instead of reading loose keys out of a dynamic map, per
/// SPEC_FULL.md §9 ("Dynamic-typed config").
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "claimhub", about = "Claim-trie hub indexer")]
pub struct Cli {
    /// Directory holding the RocksDB store.
    #[arg(long)]
    pub db_dir: Option<PathBuf>,

    /// JSON-RPC URL of the upstream full node.
    #[arg(long)]
    pub node_rpc_url: Option<String>,

    /// Maximum depth a reorg is allowed to walk back before aborting.
    #[arg(long)]
    pub reorg_limit: Option<u32>,

    /// Block cache size, in MiB, for the RocksDB block cache.
    #[arg(long)]
    pub cache_mib: Option<u32>,

    /// Max open file handles RocksDB is allowed.
    #[arg(long)]
    pub max_open_files: Option<i32>,

    /// Country code, carried through for parity with the teacher's deployment config.
    #[arg(long)]
    pub country: Option<String>,

    /// UDP status port, if the optional UDP status responder is enabled.
    #[arg(long)]
    pub udp_port: Option<u16>,

    /// Exit cleanly once first sync (catching up to the node's tip) completes.
    #[arg(long)]
    pub shutdown_on_sync: bool,

    /// Column-family prefixes (as hex bytes, e.g. "75") where integrity
    /// violations are downgraded to warnings instead of fatal errors.
    #[arg(long)]
    pub unsafe_prefix: Vec<String>,

    /// Channel claim hashes (40 hex chars) whose claims are fully blocked:
    /// excluded from search results and refused on resolve.
    #[arg(long)]
    pub block_filter_channel: Vec<String>,

    /// Channel claim hashes (40 hex chars) whose claims are hidden from
    /// `resolve`/`search` but not otherwise blocked.
    #[arg(long)]
    pub resolve_filter_channel: Vec<String>,

    /// Path to a TOML config file layered under CLI flags/env vars.
    #[arg(long, default_value = "config.toml")]
    pub config_file: String,

    /// HTTP bind address for the resolve/search/status API.
    #[arg(long)]
    pub http_addr: Option<String>,

    /// HTTP bind address for the /metrics endpoint.
    #[arg(long)]
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_dir: PathBuf,
    pub node_rpc_url: String,
    pub node_rpc_user: String,
    pub node_rpc_password: String,
    pub reorg_limit: u32,
    pub max_undo_depth: u32,
    pub cache_mib: u32,
    pub max_open_files: i32,
    pub country: String,
    pub udp_status: Option<(String, u16)>,
    pub first_sync_shutdown: bool,
    pub unsafe_prefixes: std::collections::HashSet<u8>,
    pub block_filter_channels: Vec<[u8; 20]>,
    pub resolve_filter_channels: Vec<[u8; 20]>,
    pub http_addr: String,
    pub metrics_addr: String,
}

impl Config {
    /// Layers CLI flags (highest priority) over a config file and
    /// `NODE_RPC_USER`/`NODE_RPC_PASSWORD` environment variables.
    pub fn load(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
        let file_cfg = config::Config::builder()
            .add_source(config::File::with_name(&cli.config_file).required(false))
            .add_source(config::Environment::with_prefix("CLAIMHUB"))
            .build()?;

        let db_dir = cli
            .db_dir
            .clone()
            .or_else(|| file_cfg.get_string("db_dir").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("./data"));
        let db_dir = PathBuf::from(shellexpand::tilde(&db_dir.to_string_lossy()).into_owned());

        let node_rpc_url = cli
            .node_rpc_url
            .clone()
            .or_else(|| file_cfg.get_string("node_rpc_url").ok())
            .unwrap_or_else(|| "http://127.0.0.1:9245".to_string());

        let node_rpc_user = std::env::var("NODE_RPC_USER").unwrap_or_default();
        let node_rpc_password = std::env::var("NODE_RPC_PASSWORD").unwrap_or_default();

        let reorg_limit = cli.reorg_limit.or_else(|| file_cfg.get_int("reorg_limit").ok().map(|v| v as u32)).unwrap_or(200);
        let max_undo_depth = file_cfg.get_int("max_undo_depth").ok().map(|v| v as u32).unwrap_or(200);
        let cache_mib = cli.cache_mib.or_else(|| file_cfg.get_int("cache_mib").ok().map(|v| v as u32)).unwrap_or(1024);
        let max_open_files = cli.max_open_files.or_else(|| file_cfg.get_int("max_open_files").ok().map(|v| v as i32)).unwrap_or(512);
        let country = cli.country.clone().or_else(|| file_cfg.get_string("country").ok()).unwrap_or_else(|| "US".to_string());
        let udp_port = cli.udp_port.or_else(|| file_cfg.get_int("udp_port").ok().map(|v| v as u16));
        let udp_status = udp_port.map(|p| ("0.0.0.0".to_string(), p));
        let first_sync_shutdown = cli.shutdown_on_sync || file_cfg.get_bool("shutdown_on_sync").unwrap_or(false);

        let mut unsafe_prefixes = std::collections::HashSet::new();
        for raw in &cli.unsafe_prefix {
            if let Ok(bytes) = hex::decode(raw) {
                if let Some(&b) = bytes.first() {
                    unsafe_prefixes.insert(b);
                }
            }
        }

        let http_addr = cli.http_addr.clone().or_else(|| file_cfg.get_string("http_addr").ok()).unwrap_or_else(|| "0.0.0.0:8000".to_string());
        let metrics_addr = cli.metrics_addr.clone().or_else(|| file_cfg.get_string("metrics_addr").ok()).unwrap_or_else(|| "0.0.0.0:9000".to_string());

        let cli_channel_hashes = |raw: &[String]| -> Vec<[u8; 20]> {
            raw.iter().filter_map(|s| hex::decode(s).ok()).filter_map(|b| b.try_into().ok()).collect()
        };
        let file_channel_hashes = |key: &str| -> Vec<[u8; 20]> {
            file_cfg
                .get_array(key)
                .map(|values| values.into_iter().filter_map(|v| v.into_string().ok()).filter_map(|s| hex::decode(s).ok()).filter_map(|b| b.try_into().ok()).collect())
                .unwrap_or_default()
        };
        let block_filter_channels = if cli.block_filter_channel.is_empty() { file_channel_hashes("block_filter_channels") } else { cli_channel_hashes(&cli.block_filter_channel) };
        let resolve_filter_channels = if cli.resolve_filter_channel.is_empty() { file_channel_hashes("resolve_filter_channels") } else { cli_channel_hashes(&cli.resolve_filter_channel) };

        Ok(Config {
            db_dir,
            node_rpc_url,
            node_rpc_user,
            node_rpc_password,
            reorg_limit,
            max_undo_depth,
            cache_mib,
            max_open_files,
            country,
            udp_status,
            first_sync_shutdown,
            unsafe_prefixes,
            block_filter_channels,
            resolve_filter_channels,
            http_addr,
            metrics_addr,
        })
    }
}
