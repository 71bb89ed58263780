//! Process list of a node: who is connected, what each session runs, and
//! how to kill it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};

use crate::meta_keys::now_unix_ms;

/// One row of the process list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: u64,
    pub user: String,
    pub host: String,
    pub db: Option<String>,
    /// "Query", "Sleep" or "Daemon" for internal sessions.
    pub command: String,
    /// Statement currently executing, if any.
    pub info: Option<String>,
    pub started_at_unix_ms: u64,
}

/// TLS material a server applies to new client connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: Option<PathBuf>,
}

/// Administrative view over the sessions of one server node.
pub trait SessionManager: Send + Sync {
    fn show_process_list(&self) -> BTreeMap<u64, ProcessInfo>;
    fn get_process_info(&self, id: u64) -> Option<ProcessInfo>;
    /// `query == true` interrupts the running statement only; otherwise the
    /// whole connection is terminated.
    fn kill(&self, connection_id: u64, query: bool);
    fn update_tls_config(&self, config: Option<Arc<TlsConfig>>);
}

/// Kill flags observed cooperatively by a running session.
#[derive(Debug, Default)]
pub struct KillSignal {
    query: AtomicBool,
    connection: AtomicBool,
}

impl KillSignal {
    pub fn is_killed(&self) -> bool {
        self.query.load(Ordering::SeqCst) || self.connection.load(Ordering::SeqCst)
    }

    pub fn is_connection_killed(&self) -> bool {
        self.connection.load(Ordering::SeqCst)
    }

    /// Clears a query-level kill before the next statement starts.
    pub fn reset_query(&self) {
        self.query.store(false, Ordering::SeqCst);
    }
}

struct RegisteredProcess {
    info: ProcessInfo,
    kill: Arc<KillSignal>,
}

/// In-process `SessionManager` backing both client and internal sessions.
pub struct ProcessRegistry {
    host: String,
    next_id: AtomicU64,
    processes: RwLock<BTreeMap<u64, RegisteredProcess>>,
    tls: RwLock<Option<Arc<TlsConfig>>>,
}

impl ProcessRegistry {
    /// Ids are prefixed with the node id so they are unique cluster-wide.
    pub fn new(node_id: u64) -> Arc<Self> {
        Arc::new(Self {
            host: format!("node-{node_id}"),
            next_id: AtomicU64::new((node_id << 40) | 1),
            processes: RwLock::new(BTreeMap::new()),
            tls: RwLock::new(None),
        })
    }

    pub fn register(self: &Arc<Self>, user: &str, command: &str) -> ProcessHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let kill = Arc::new(KillSignal::default());
        let info = ProcessInfo {
            id,
            user: user.to_string(),
            host: self.host.clone(),
            db: None,
            command: command.to_string(),
            info: None,
            started_at_unix_ms: now_unix_ms(),
        };
        self.processes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                id,
                RegisteredProcess {
                    info,
                    kill: Arc::clone(&kill),
                },
            );
        ProcessHandle {
            id,
            kill,
            registry: Arc::downgrade(self),
        }
    }

    pub fn tls_config(&self) -> Option<Arc<TlsConfig>> {
        self.tls
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_statement(&self, id: u64, statement: Option<String>) {
        let mut processes = self
            .processes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(process) = processes.get_mut(&id) {
            process.info.info = statement;
        }
    }

    fn unregister(&self, id: u64) {
        self.processes
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
    }
}

impl SessionManager for ProcessRegistry {
    fn show_process_list(&self) -> BTreeMap<u64, ProcessInfo> {
        self.processes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, process)| (*id, process.info.clone()))
            .collect()
    }

    fn get_process_info(&self, id: u64) -> Option<ProcessInfo> {
        self.processes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .map(|process| process.info.clone())
    }

    fn kill(&self, connection_id: u64, query: bool) {
        let processes = self
            .processes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(process) = processes.get(&connection_id) else {
            tracing::debug!(connection_id, "kill for unknown process ignored");
            return;
        };
        if query {
            process.kill.query.store(true, Ordering::SeqCst);
        } else {
            process.kill.connection.store(true, Ordering::SeqCst);
        }
        tracing::info!(
            connection_id,
            query,
            statement = process.info.info.as_deref().unwrap_or(""),
            "process killed"
        );
    }

    fn update_tls_config(&self, config: Option<Arc<TlsConfig>>) {
        *self
            .tls
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }
}

/// Registration of one session; unregisters on drop.
pub struct ProcessHandle {
    id: u64,
    kill: Arc<KillSignal>,
    registry: Weak<ProcessRegistry>,
}

impl ProcessHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kill_signal(&self) -> &Arc<KillSignal> {
        &self.kill
    }

    pub fn set_statement(&self, statement: Option<String>) {
        if statement.is_some() {
            self.kill.reset_query();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.set_statement(self.id, statement);
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}
