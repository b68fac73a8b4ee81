//! Bytecode Inspection
//!
//! Contract/EOA determination for the node classifier. An address with empty
//! code is an externally-owned account.
//!
//! Two implementations ship with the crate: an in-memory inspector for tests
//! and dry runs, and an IPC-backed inspector issuing `eth_getCode` against a
//! local node with exponential-backoff reconnection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use alloy::primitives::{Address, Bytes};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::pubsub::PubSubFrontend;
use alloy::transports::ipc::IpcConnect;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::transaction::parse_address;

/// Default IPC socket paths to try
pub const DEFAULT_IPC_PATHS: &[&str] = &[
    "/tmp/anvil.ipc",
    "~/.foundry/anvil.ipc",
    "/var/run/geth.ipc",
    "~/.ethereum/geth.ipc",
];

/// Maximum number of reconnection attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Initial backoff delay for reconnection
pub const INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay for reconnection
pub const MAX_BACKOFF_MS: u64 = 30000;

/// Per-request timeout in milliseconds
pub const REQUEST_TIMEOUT_MS: u64 = 5000;

/// Errors that can occur while managing the IPC connection
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IPC socket not found at path: {0}")]
    SocketNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Max reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),

    #[error("Invalid IPC path: {0}")]
    InvalidPath(String),

    #[error("Reconnection already in progress")]
    Reconnecting,
}

/// Errors surfaced by a bytecode lookup
#[derive(Error, Debug)]
pub enum InspectorError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Capability to fetch deployed bytecode for an address
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BytecodeInspector: Send + Sync {
    /// Deployed code at `address`; empty for accounts without code
    async fn get_code(&self, address: Address) -> Result<Bytes, InspectorError>;

    /// Whether `address` has deployed code
    async fn is_contract(&self, address: Address) -> Result<bool, InspectorError> {
        Ok(!self.get_code(address).await?.is_empty())
    }
}

#[derive(Debug, Clone)]
enum MarkedCode {
    Code(Bytes),
    Failing,
}

/// Inspector backed by a map of marked addresses
///
/// Unmarked addresses have no code.
#[derive(Debug, Default)]
pub struct InMemoryBytecodeInspector {
    entries: RwLock<HashMap<Address, MarkedCode>>,
}

impl InMemoryBytecodeInspector {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark(&self, address: &str, entry: Option<MarkedCode>) {
        let Some(parsed) = parse_address(address) else {
            warn!("Ignoring malformed address {}", address);
            return;
        };
        let mut entries = match self.entries.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entry {
            Some(entry) => entries.insert(parsed, entry),
            None => entries.remove(&parsed),
        };
    }

    /// Mark an address as a contract with placeholder code
    pub fn mark_contract(&self, address: &str) {
        // PUSH1 0x80 PUSH1 0x40 MSTORE
        self.mark_code(address, Bytes::from_static(&[0x60, 0x80, 0x60, 0x40, 0x52]));
    }

    pub fn mark_code(&self, address: &str, code: Bytes) {
        self.mark(address, Some(MarkedCode::Code(code)));
    }

    /// Mark an address as an externally-owned account
    pub fn mark_eoa(&self, address: &str) {
        self.mark(address, None);
    }

    /// Make lookups for this address fail
    pub fn mark_failing(&self, address: &str) {
        self.mark(address, Some(MarkedCode::Failing));
    }
}

#[async_trait]
impl BytecodeInspector for InMemoryBytecodeInspector {
    async fn get_code(&self, address: Address) -> Result<Bytes, InspectorError> {
        let entries = match self.entries.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(&address) {
            Some(MarkedCode::Code(code)) => Ok(code.clone()),
            Some(MarkedCode::Failing) => {
                Err(InspectorError::Rpc(format!("lookup for {address:#x} marked as failing")))
            }
            None => Ok(Bytes::new()),
        }
    }
}

/// Configuration for IPC connection
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Path to the IPC socket
    pub socket_path: String,
    /// Maximum reconnection attempts
    pub max_reconnect_attempts: u32,
    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_IPC_PATHS[0].to_string(),
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
            timeout_ms: REQUEST_TIMEOUT_MS,
        }
    }
}

impl IpcConfig {
    pub fn with_path(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Calculate backoff delay for a given attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_backoff_ms * 2u64.pow(attempt.min(10));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }
}

/// Check if an IPC socket exists at the given path
pub fn socket_exists(path: &str) -> bool {
    Path::new(&expand_path(path)).exists()
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

/// Find the first available IPC socket from default paths
pub fn find_ipc_socket() -> Option<String> {
    DEFAULT_IPC_PATHS
        .iter()
        .find(|path| socket_exists(path))
        .map(|path| expand_path(path))
}

/// IPC connection manager with reconnection support
pub struct IpcConnection {
    config: IpcConfig,
    reconnect_attempts: u32,
}

impl IpcConnection {
    pub fn new(config: IpcConfig) -> Self {
        Self {
            config,
            reconnect_attempts: 0,
        }
    }

    pub fn with_path(socket_path: impl Into<String>) -> Self {
        Self::new(IpcConfig::with_path(socket_path))
    }

    pub fn socket_path(&self) -> &str {
        &self.config.socket_path
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    /// Delay before the next reconnection attempt
    pub fn next_backoff_delay(&self) -> Duration {
        self.config.backoff_delay(self.reconnect_attempts)
    }

    /// Connect to the IPC socket
    pub async fn connect(&mut self) -> Result<RootProvider<PubSubFrontend>, IpcError> {
        if self.config.socket_path.is_empty() {
            return Err(IpcError::InvalidPath("Path cannot be empty".to_string()));
        }
        let expanded_path = expand_path(&self.config.socket_path);

        if !Path::new(&expanded_path).exists() {
            return Err(IpcError::SocketNotFound(expanded_path));
        }

        info!("Connecting to IPC socket at {}", expanded_path);

        let ipc: IpcConnect<String> = IpcConnect::new(expanded_path);
        let provider = ProviderBuilder::new()
            .on_ipc(ipc)
            .await
            .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;

        self.reconnect_attempts = 0;
        info!("Successfully connected to IPC socket");

        Ok(provider)
    }

    /// Reconnect with exponential backoff until the attempt budget is spent
    ///
    /// A cycle that exhausts the budget resets it, so a later call starts a
    /// fresh cycle.
    pub async fn reconnect(&mut self) -> Result<RootProvider<PubSubFrontend>, IpcError> {
        while self.reconnect_attempts < self.config.max_reconnect_attempts {
            let delay = self.next_backoff_delay();
            warn!(
                "Attempting to reconnect (attempt {}/{}), waiting {:?}",
                self.reconnect_attempts + 1,
                self.config.max_reconnect_attempts,
                delay
            );

            sleep(delay).await;
            self.reconnect_attempts += 1;

            match self.connect().await {
                Ok(provider) => return Ok(provider),
                Err(e) => {
                    error!("Reconnection attempt {} failed: {}", self.reconnect_attempts, e);
                }
            }
        }

        self.reconnect_attempts = 0;
        Err(IpcError::MaxReconnectAttemptsExceeded(self.config.max_reconnect_attempts))
    }
}

/// `eth_getCode` over a node's IPC socket
///
/// One lookup at a time owns reconnection; lookups arriving while it backs
/// off fail fast with [`IpcError::Reconnecting`].
pub struct IpcBytecodeInspector {
    connection: Mutex<IpcConnection>,
    provider: Mutex<Option<RootProvider<PubSubFrontend>>>,
    timeout_ms: u64,
}

impl IpcBytecodeInspector {
    /// Connect eagerly; fails if the socket is unreachable
    pub async fn connect(config: IpcConfig) -> Result<Self, IpcError> {
        let timeout_ms = config.timeout_ms;
        let mut connection = IpcConnection::new(config);
        let provider = connection.connect().await?;
        Ok(Self {
            connection: Mutex::new(connection),
            provider: Mutex::new(Some(provider)),
            timeout_ms,
        })
    }

    /// Inspector that connects on its first lookup
    pub fn deferred(config: IpcConfig) -> Self {
        let timeout_ms = config.timeout_ms;
        Self {
            connection: Mutex::new(IpcConnection::new(config)),
            provider: Mutex::new(None),
            timeout_ms,
        }
    }

    async fn cached_provider(&self) -> Option<RootProvider<PubSubFrontend>> {
        self.provider.lock().await.clone()
    }

    async fn provider(&self) -> Result<RootProvider<PubSubFrontend>, IpcError> {
        if let Some(provider) = self.cached_provider().await {
            return Ok(provider);
        }
        let Ok(mut connection) = self.connection.try_lock() else {
            return Err(IpcError::Reconnecting);
        };
        // Another lookup may have reconnected between the two locks
        if let Some(provider) = self.cached_provider().await {
            return Ok(provider);
        }
        let provider = connection.reconnect().await?;
        *self.provider.lock().await = Some(provider.clone());
        Ok(provider)
    }

    async fn fetch(&self, provider: &RootProvider<PubSubFrontend>, address: Address) -> Result<Bytes, InspectorError> {
        match timeout(Duration::from_millis(self.timeout_ms), provider.get_code_at(address)).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(e)) => Err(InspectorError::Rpc(e.to_string())),
            Err(_) => Err(InspectorError::Timeout(self.timeout_ms)),
        }
    }
}

#[async_trait]
impl BytecodeInspector for IpcBytecodeInspector {
    async fn get_code(&self, address: Address) -> Result<Bytes, InspectorError> {
        let provider = self.provider().await?;
        match self.fetch(&provider, address).await {
            Ok(code) => {
                debug!("Fetched {} bytes of code for {:#x}", code.len(), address);
                Ok(code)
            }
            Err(e) => {
                // Drop the provider so the next lookup reconnects
                warn!("getCode for {:#x} failed: {}", address, e);
                self.provider.lock().await.take();
                Err(e)
            }
        }
    }
}
