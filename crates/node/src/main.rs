pub mod admission;
pub mod config;
pub mod context;
pub mod import;
pub mod mempool;
pub mod policy;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use pivxd_chainstate::flush::FlushMode;
use pivxd_chainstate::ChainState;
use pivxd_consensus::{chain_params, hash256_to_hex};
use pivxd_log::{log_error, log_info, log_warn, LogConfig};
use pivxd_storage::fjall::FjallStore;
use pivxd_storage::memory::MemoryStore;
use pivxd_storage::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch};

use crate::config::{parse_args, usage, Backend, CliAction, Config};
use crate::context::ValidationContext;

const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const LOG_FILE_NAME: &str = "debug.log";
const FLUSH_TICK: Duration = Duration::from_secs(60);

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }

    fn sync(&self) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.sync(),
            Store::Fjall(store) => store.sync(),
        }
    }

    fn approximate_size(&self) -> Option<u64> {
        match self {
            Store::Memory(store) => store.approximate_size(),
            Store::Fjall(store) => store.approximate_size(),
        }
    }
}

pub fn open_store(backend: Backend, db_dir: &Path) -> Result<Store, String> {
    match backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => FjallStore::open(db_dir)
            .map(Store::Fjall)
            .map_err(|err| format!("failed to open database {}: {err}", db_dir.display())),
    }
}

pub struct DataDirLock {
    _file: File,
}

pub fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "data dir {} is already locked (another pivxd instance may be running); lock file {}{suffix}",
                data_dir.display(),
                lock_path.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("pivxd-rust {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(Instant::now(), config).await,
    }
}

async fn run_with_config(start_time: Instant, config: Config) -> Result<(), String> {
    pivxd_log::init(LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    for category in &config.debug_categories {
        pivxd_log::enable_category(*category);
    }

    fs::create_dir_all(&config.data_dir).map_err(|err| err.to_string())?;
    let _data_dir_lock = lock_data_dir(&config.data_dir)?;
    if let Err(err) = pivxd_log::open_log_file(&config.data_dir.join(LOG_FILE_NAME)) {
        log_warn!("failed to open log file: {err}");
    }
    log_info!(
        "Startup: begin (backend={:?}, network={:?}, data_dir={})",
        config.backend,
        config.network,
        config.data_dir.display()
    );

    let params = chain_params(config.network);
    let blocks_dir = config.blocks_dir();
    fs::create_dir_all(&blocks_dir).map_err(|err| err.to_string())?;
    let store = Arc::new(open_store(config.backend, &config.db_dir())?);
    let chain = ChainState::open(
        params.consensus.clone(),
        config.chain_state_config(),
        store,
        &blocks_dir,
    )
    .map_err(|err| format!("failed to open chain state: {err}"))?;
    let ctx = Arc::new(ValidationContext::new(chain, config.mempool_policy()));
    match ctx.tip() {
        Some(tip) => log_info!(
            "Startup: chain tip {} at height {} ({}ms)",
            hash256_to_hex(&tip.hash),
            tip.height,
            start_time.elapsed().as_millis()
        ),
        None => log_warn!("Startup: chain state has no tip"),
    }

    if !config.imports.is_empty() {
        let imports = config.imports.clone();
        let magic = params.message_start;
        let ctx = Arc::clone(&ctx);
        let join = tokio::task::spawn_blocking(move || {
            for path in &imports {
                import::import_file(ctx.as_ref(), path, magic)
                    .map_err(|err| format!("import of {} failed: {err}", path.display()))?;
            }
            ctx.flush(FlushMode::Always)
                .map_err(|err| format!("flush after import failed: {err}"))
        });
        match join.await {
            Ok(result) => result?,
            Err(err) => return Err(format!("import task failed: {err}")),
        }
    }

    if !config.stop_after_import {
        wait_for_shutdown(ctx.as_ref()).await;
    }

    log_info!("Shutdown: flushing chain state");
    if let Err(err) = ctx.flush(FlushMode::Always) {
        log_error!("final flush failed: {err}");
        return Err(err.to_string());
    }
    log_info!("Shutdown: done");
    Ok(())
}

async fn wait_for_shutdown<S: KeyValueStore + Clone>(ctx: &ValidationContext<S>) {
    let mut ticker = tokio::time::interval(FLUSH_TICK);
    ticker.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log_info!("Signal received; requesting shutdown.");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = ctx.flush(FlushMode::Periodic) {
                    log_error!("periodic flush failed: {err}");
                    return;
                }
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            }
            Err(err) => {
                log_warn!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
