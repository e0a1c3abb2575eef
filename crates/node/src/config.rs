//! Command-line and `pivx.conf` configuration.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use pivxd_chainstate::ChainStateConfig;
use pivxd_consensus::constants::DEFAULT_MAX_REORG_DEPTH;
use pivxd_consensus::money::COIN;
use pivxd_consensus::Network;
use pivxd_log::{Category, Format, Level};

use crate::policy::{MempoolPolicy, DEFAULT_LIMIT_FREE_RELAY, DEFAULT_MIN_RELAY_FEE_PER_KB};

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "pivx.conf";
pub const DEFAULT_DB_CACHE_MB: u64 = 100;
pub const DEFAULT_MAX_MEMPOOL_MB: u64 = 300;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub log_level: Level,
    pub log_format: Format,
    pub log_timestamps: bool,
    pub debug_categories: Vec<Category>,
    /// Bootstrap files replayed before the node idles.
    pub imports: Vec<PathBuf>,
    /// Exit once the imports finish instead of idling until a signal.
    pub stop_after_import: bool,
    pub db_cache_mb: u64,
    pub max_mempool_mb: u64,
    pub min_relay_fee_per_kb: i64,
    pub limit_free_relay_kb_per_minute: u32,
    pub max_reorg_depth: i32,
    /// Script verification threads; 0 means one per core.
    pub script_threads: usize,
    pub check_block_index: bool,
    /// Overrides the network's standardness default.
    pub require_standard: Option<bool>,
}

impl Config {
    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn chain_state_config(&self) -> ChainStateConfig {
        ChainStateConfig {
            coin_cache_bytes: (self.db_cache_mb as usize).saturating_mul(1 << 20),
            max_reorg_depth: self.max_reorg_depth,
            script_threads: self.script_threads,
            check_block_index: self.check_block_index,
            ..ChainStateConfig::default()
        }
    }

    pub fn mempool_policy(&self) -> MempoolPolicy {
        let mut policy = MempoolPolicy::for_network(self.network);
        if let Some(require_standard) = self.require_standard {
            policy.require_standard = require_standard;
        }
        policy.min_relay_fee_per_kb = self.min_relay_fee_per_kb;
        policy.dust_relay_fee_per_kb = self.min_relay_fee_per_kb;
        policy.limit_free_relay_kb_per_minute = self.limit_free_relay_kb_per_minute;
        policy.max_mempool_bytes = (self.max_mempool_mb as usize).saturating_mul(1_000_000);
        policy
    }
}

#[derive(Debug)]
pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut network_set = false;
    let mut log_level = Level::Info;
    let mut log_level_set = false;
    let mut log_format = Format::Text;
    let mut log_timestamps = true;
    let mut debug_categories: Vec<Category> = Vec::new();
    let mut imports: Vec<PathBuf> = Vec::new();
    let mut stop_after_import = false;
    let mut db_cache_mb = DEFAULT_DB_CACHE_MB;
    let mut db_cache_set = false;
    let mut max_mempool_mb = DEFAULT_MAX_MEMPOOL_MB;
    let mut max_mempool_set = false;
    let mut min_relay_fee_per_kb = DEFAULT_MIN_RELAY_FEE_PER_KB;
    let mut min_relay_fee_set = false;
    let mut limit_free_relay_kb_per_minute = DEFAULT_LIMIT_FREE_RELAY;
    let mut limit_free_relay_set = false;
    let mut max_reorg_depth = DEFAULT_MAX_REORG_DEPTH;
    let mut max_reorg_set = false;
    let mut script_threads = 0usize;
    let mut script_threads_set = false;
    let mut check_block_index = false;
    let mut check_block_index_set = false;
    let mut require_standard: Option<bool> = None;
    let mut args = raw_args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => {
                data_dir = Some(PathBuf::from(next_value(&mut args, "--data-dir")?));
            }
            "--conf" => {
                conf_path = Some(PathBuf::from(next_value(&mut args, "--conf")?));
            }
            "--network" => {
                let value = next_value(&mut args, "--network")?;
                network = parse_network(&value).ok_or_else(|| {
                    format!(
                        "invalid network '{value}' (expected mainnet|testnet|regtest)\n{}",
                        usage()
                    )
                })?;
                network_set = true;
            }
            "--regtest" => {
                network = Network::Regtest;
                network_set = true;
            }
            "--testnet" => {
                network = Network::Testnet;
                network_set = true;
            }
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
            }
            "--no-log-timestamps" => {
                log_timestamps = false;
            }
            "--debug" => {
                let value = next_value(&mut args, "--debug")?;
                debug_categories.extend(parse_categories(&value)?);
            }
            "--import" => {
                imports.push(PathBuf::from(next_value(&mut args, "--import")?));
            }
            "--stop-after-import" => {
                stop_after_import = true;
            }
            "--dbcache" => {
                let value = next_value(&mut args, "--dbcache")?;
                db_cache_mb = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid dbcache '{value}'\n{}", usage()))?;
                db_cache_set = true;
            }
            "--maxmempool" => {
                let value = next_value(&mut args, "--maxmempool")?;
                max_mempool_mb = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid maxmempool '{value}'\n{}", usage()))?;
                max_mempool_set = true;
            }
            "--minrelaytxfee" => {
                let value = next_value(&mut args, "--minrelaytxfee")?;
                min_relay_fee_per_kb =
                    parse_fee_rate_per_kb(&value).map_err(|err| format!("{err}\n{}", usage()))?;
                min_relay_fee_set = true;
            }
            "--limitfreerelay" => {
                let value = next_value(&mut args, "--limitfreerelay")?;
                limit_free_relay_kb_per_minute = value
                    .parse::<u32>()
                    .map_err(|_| format!("invalid limitfreerelay '{value}'\n{}", usage()))?;
                limit_free_relay_set = true;
            }
            "--maxreorg" => {
                let value = next_value(&mut args, "--maxreorg")?;
                max_reorg_depth = parse_max_reorg(&value)
                    .ok_or_else(|| format!("invalid maxreorg '{value}'\n{}", usage()))?;
                max_reorg_set = true;
            }
            "--par" => {
                let value = next_value(&mut args, "--par")?;
                script_threads = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid par '{value}'\n{}", usage()))?;
                script_threads_set = true;
            }
            "--checkblockindex" => {
                check_block_index = true;
                check_block_index_set = true;
            }
            "--accept-non-standard" => {
                require_standard = Some(false);
            }
            "--require-standard" => {
                require_standard = Some(true);
            }
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    if let Some(conf) = load_conf(&conf_file)? {
        let bad = |key: &str, raw: &str| format!("invalid {key} '{raw}' in {}", conf_file.display());

        if !network_set {
            if let Some(raw) = conf_last(&conf, "regtest") {
                match parse_conf_bool(raw) {
                    Some(true) => network = Network::Regtest,
                    Some(false) => {}
                    None => return Err(bad("regtest", raw)),
                }
            }
            if network != Network::Regtest {
                if let Some(raw) = conf_last(&conf, "testnet") {
                    match parse_conf_bool(raw) {
                        Some(true) => network = Network::Testnet,
                        Some(false) => {}
                        None => return Err(bad("testnet", raw)),
                    }
                }
            }
        }
        if !log_level_set {
            if let Some(raw) = conf_last(&conf, "loglevel") {
                log_level = Level::parse(raw).ok_or_else(|| bad("loglevel", raw))?;
            }
        }
        if let Some(values) = conf.get("debug") {
            for raw in values {
                debug_categories.extend(parse_categories(raw)?);
            }
        }
        if !db_cache_set {
            if let Some(raw) = conf_last(&conf, "dbcache") {
                db_cache_mb = raw.parse::<u64>().map_err(|_| bad("dbcache", raw))?;
            }
        }
        if !max_mempool_set {
            if let Some(raw) = conf_last(&conf, "maxmempool") {
                max_mempool_mb = raw.parse::<u64>().map_err(|_| bad("maxmempool", raw))?;
            }
        }
        if !min_relay_fee_set {
            if let Some(raw) = conf_last(&conf, "minrelaytxfee") {
                min_relay_fee_per_kb = parse_fee_rate_per_kb(raw)
                    .map_err(|err| format!("{}: {err}", bad("minrelaytxfee", raw)))?;
            }
        }
        if !limit_free_relay_set {
            if let Some(raw) = conf_last(&conf, "limitfreerelay") {
                limit_free_relay_kb_per_minute =
                    raw.parse::<u32>().map_err(|_| bad("limitfreerelay", raw))?;
            }
        }
        if !max_reorg_set {
            if let Some(raw) = conf_last(&conf, "maxreorg") {
                max_reorg_depth = parse_max_reorg(raw).ok_or_else(|| bad("maxreorg", raw))?;
            }
        }
        if !script_threads_set {
            if let Some(raw) = conf_last(&conf, "par") {
                script_threads = raw.parse::<usize>().map_err(|_| bad("par", raw))?;
            }
        }
        if !check_block_index_set {
            if let Some(raw) = conf_last(&conf, "checkblockindex") {
                check_block_index = parse_conf_bool(raw).ok_or_else(|| bad("checkblockindex", raw))?;
            }
        }
        if require_standard.is_none() {
            if let Some(raw) = conf_last(&conf, "acceptnonstdtxn") {
                let accept = parse_conf_bool(raw).ok_or_else(|| bad("acceptnonstdtxn", raw))?;
                require_standard = Some(!accept);
            }
        }
    }

    debug_categories.dedup();
    Ok(CliAction::Run(Config {
        backend,
        data_dir,
        conf_path: conf_file,
        network,
        log_level,
        log_format,
        log_timestamps,
        debug_categories,
        imports,
        stop_after_import,
        db_cache_mb,
        max_mempool_mb,
        min_relay_fee_per_kb,
        limit_free_relay_kb_per_minute,
        max_reorg_depth,
        script_threads,
        check_block_index,
        require_standard,
    }))
}

fn next_value<I: Iterator<Item = String>>(args: &mut I, flag: &str) -> Result<String, String> {
    args.next()
        .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
}

fn parse_network(value: &str) -> Option<Network> {
    match value {
        "mainnet" | "main" => Some(Network::Mainnet),
        "testnet" | "test" => Some(Network::Testnet),
        "regtest" => Some(Network::Regtest),
        _ => None,
    }
}

fn parse_max_reorg(value: &str) -> Option<i32> {
    value.parse::<i32>().ok().filter(|depth| *depth > 0)
}

fn parse_categories(value: &str) -> Result<Vec<Category>, String> {
    let value = value.trim();
    if value.is_empty() || value == "1" || value == "all" {
        return Ok(Category::ALL.to_vec());
    }
    value
        .split(',')
        .map(|raw| Category::parse(raw).ok_or_else(|| format!("unknown debug category '{raw}'")))
        .collect()
}

/// Reads `key=value` lines. `#` and `;` start comments; a bare key means `1`.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(|ch: char| ch == '#' || ch == ';') {
            line = &line[..idx];
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn conf_last<'a>(conf: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    conf.get(key)
        .and_then(|values| values.last())
        .map(String::as_str)
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Satoshis per kB, or a decimal coin amount when the value has a point.
fn parse_fee_rate_per_kb(value: &str) -> Result<i64, String> {
    if value.contains('.') {
        return parse_amount(value);
    }
    match value.parse::<i64>() {
        Ok(amount) if amount >= 0 => Ok(amount),
        Ok(_) => Err("fee rate must be >= 0".to_string()),
        Err(_) => Err(format!("invalid fee rate '{value}'")),
    }
}

fn parse_amount(value: &str) -> Result<i64, String> {
    let value = value.trim();
    if value.starts_with('-') {
        return Err("amount must be >= 0".to_string());
    }
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    if whole.is_empty() && frac.is_empty() {
        return Err(format!("invalid amount '{value}'"));
    }
    if frac.len() > 8 || !frac.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(format!("invalid amount '{value}'"));
    }
    let whole = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<i64>()
            .map_err(|_| format!("invalid amount '{value}'"))?
    };
    let frac = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<8}")
            .parse::<i64>()
            .map_err(|_| format!("invalid amount '{value}'"))?
    };
    whole
        .checked_mul(COIN)
        .and_then(|whole| whole.checked_add(frac))
        .ok_or_else(|| format!("amount out of range '{value}'"))
}

pub fn usage() -> String {
    [
        "Usage:",
        "  pivxd [options]",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --backend  Storage backend to use (memory|fjall) (default: fjall)",
        "  --data-dir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <data-dir>/pivx.conf)",
        "  --network  Chain to validate (mainnet|testnet|regtest) (default: mainnet)",
        "  --testnet, --regtest  Shorthands for --network",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --debug  Comma-separated debug categories (bench,mempool,mempoolrej,reindex,validation,coindb|all)",
        "  --import  Import blocks from a bootstrap file (repeatable)",
        "  --stop-after-import  Exit after importing instead of waiting for a signal",
        "  --dbcache  Coin cache size in MiB (default: 100)",
        "  --maxmempool  Mempool memory ceiling in MB (default: 300)",
        "  --minrelaytxfee  Relay fee floor per kB, in satoshis or PIV (default: 10000)",
        "  --limitfreerelay  Free transaction budget in kB per minute (default: 30)",
        "  --maxreorg  Deepest reorganization accepted (default: 100)",
        "  --par  Script verification threads, 0 for one per core (default: 0)",
        "  --checkblockindex  Verify block tree invariants after every update",
        "  --accept-non-standard  Relay non-standard transactions",
        "  --require-standard  Enforce standardness even on regtest",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    fn run_config(raw: &[&str]) -> Config {
        match parse_args_from(args(raw)).expect("parse") {
            CliAction::Run(config) => config,
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn defaults_without_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = run_config(&["--data-dir", &data_dir]);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.conf_path, dir.path().join(CONF_FILE_NAME));
        assert_eq!(config.max_reorg_depth, DEFAULT_MAX_REORG_DEPTH);
        assert_eq!(config.min_relay_fee_per_kb, 10_000);
        let policy = config.mempool_policy();
        assert!(policy.require_standard);
        assert_eq!(policy.max_mempool_bytes, 300_000_000);
    }

    #[test]
    fn command_line_overrides_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join(CONF_FILE_NAME);
        fs::write(
            &conf,
            "# node settings\nregtest=1\ndbcache = 450\nmaxreorg=20 ; shallow\ncheckblockindex\nminrelaytxfee=0.0002\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_string_lossy().to_string();

        let config = run_config(&["--data-dir", &data_dir, "--dbcache", "64"]);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.db_cache_mb, 64);
        assert_eq!(config.max_reorg_depth, 20);
        assert!(config.check_block_index);
        assert_eq!(config.min_relay_fee_per_kb, 20_000);
        assert!(!config.mempool_policy().require_standard);

        let config = run_config(&["--data-dir", &data_dir, "--network", "testnet"]);
        assert_eq!(config.network, Network::Testnet);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_args_from(args(&["--backend", "rocks"])).is_err());
        assert!(parse_args_from(args(&["--maxreorg", "0"])).is_err());
        assert!(parse_args_from(args(&["--dbcache"])).is_err());
        assert!(parse_args_from(args(&["--debug", "wallet"])).is_err());
        assert!(parse_args_from(args(&["--frobnicate"])).is_err());
        assert!(matches!(
            parse_args_from(args(&["--version"])),
            Ok(CliAction::PrintVersion)
        ));
    }

    #[test]
    fn imports_and_categories_accumulate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().to_string();
        let config = run_config(&[
            "--data-dir",
            &data_dir,
            "--import",
            "a.dat",
            "--import",
            "b.dat",
            "--debug",
            "mempool,validation",
        ]);
        assert_eq!(config.imports, vec![PathBuf::from("a.dat"), PathBuf::from("b.dat")]);
        assert_eq!(
            config.debug_categories,
            vec![Category::Mempool, Category::Validation]
        );
    }

    #[test]
    fn fee_amounts() {
        assert_eq!(parse_fee_rate_per_kb("1000"), Ok(1000));
        assert_eq!(parse_fee_rate_per_kb("0.0001"), Ok(10_000));
        assert_eq!(parse_fee_rate_per_kb(".5"), Ok(50_000_000));
        assert!(parse_fee_rate_per_kb("-1").is_err());
        assert!(parse_fee_rate_per_kb("0.123456789").is_err());
    }
}
