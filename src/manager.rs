//! The connection manager: registry, single-connection acquire, replica-set
//! topology discovery, and the acquisition strategy on top of them.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;

use crate::common::{ReadMode, ReadPreference};
use crate::connection::{Connection, IsMasterOutcome, IsMasterResult};
use crate::error::Error::OperationError;
use crate::error::{Error, Result};
use crate::log::{clip, LogHook, LogLevel, LogModule};
use crate::select;
use crate::server::{hashed_password, ServerDef, ServerList, TopologyType};
use crate::wire::WireConnector;

/// Seconds a successful ping stays fresh for the same connection.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(5);
/// Seconds a successful `ismaster` probe stays fresh for the same connection.
pub const DEFAULT_ISMASTER_INTERVAL: Duration = Duration::from_secs(15);
/// Width of the selection latency window, in milliseconds.
pub const DEFAULT_LATENCY_THRESHOLD_MS: u64 = 15;

bitflags! {
    /// Flags steering one acquisition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnectionFlags: u32 {
        /// The caller intends to write; replica-set selection targets the
        /// primary regardless of the read preference's mode.
        const WRITE = 0b0001;
        /// Look up existing connections only; never open new sockets.
        const DONT_CONNECT = 0b0010;
    }
}

/// A registered connection, shared between the registry and callers.
pub type ManagedConnection = Arc<Mutex<Connection>>;

// Hash-keyed registry with external insertion order. Iteration order is
// registration order, which keeps selection deterministic up to the final
// random pick.
struct Registry {
    entries: HashMap<String, ManagedConnection>,
    order: Vec<String>,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn find(&self, hash: &str) -> Option<ManagedConnection> {
        self.entries.get(hash).cloned()
    }

    fn insert(&mut self, hash: String, con: ManagedConnection) {
        if self.entries.insert(hash.clone(), con).is_none() {
            self.order.push(hash);
        }
    }

    fn remove(&mut self, hash: &str) -> Option<ManagedConnection> {
        let removed = self.entries.remove(hash);
        if removed.is_some() {
            self.order.retain(|h| h != hash);
        }
        removed
    }

    fn iter(&self) -> impl Iterator<Item = &ManagedConnection> {
        self.order
            .iter()
            .filter_map(move |hash| self.entries.get(hash))
    }

    // Empties the registry in registration order.
    fn drain(&mut self) -> Vec<ManagedConnection> {
        let order = std::mem::take(&mut self.order);
        order.iter().filter_map(|h| self.entries.remove(h)).collect()
    }
}

/// Long-lived owner of the registry, the wire connector, and the probe
/// tunables.
///
/// The manager is single-threaded and not reentrant; callers that need
/// concurrency own one manager per thread. Dropping the manager destroys
/// every registered connection in registration order.
pub struct Manager {
    connector: Box<dyn WireConnector>,
    registry: Registry,
    pub ping_interval: Duration,
    pub ismaster_interval: Duration,
    pub latency_threshold_ms: u64,
    log_hook: Option<LogHook>,
}

impl Manager {
    pub fn new(connector: Box<dyn WireConnector>) -> Manager {
        Manager {
            connector,
            registry: Registry::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
            ismaster_interval: DEFAULT_ISMASTER_INTERVAL,
            latency_threshold_ms: DEFAULT_LATENCY_THRESHOLD_MS,
            log_hook: None,
        }
    }

    /// Installs the log sink. Without one, logging is a no-op.
    pub fn set_log_hook(&mut self, hook: LogHook) {
        self.log_hook = Some(hook);
    }

    pub(crate) fn log(&self, module: LogModule, level: LogLevel, message: String) {
        if let Some(hook) = &self.log_hook {
            hook(module, level, &clip(message));
        }
    }

    /// Returns the registered connection with this identity hash, if any.
    pub fn connection_find_by_hash(&self, hash: &str) -> Option<ManagedConnection> {
        let found = self.registry.find(hash);
        if found.is_some() {
            self.log(
                LogModule::Connection,
                LogLevel::Fine,
                format!("found connection {}", hash),
            );
        }
        found
    }

    /// Appends `con` to the registry. The caller guarantees via a prior
    /// [`Manager::connection_find_by_hash`] that the hash is not yet
    /// registered.
    pub fn connection_register(&mut self, con: Connection) -> ManagedConnection {
        let hash = con.hash().to_owned();
        self.log(
            LogModule::Connection,
            LogLevel::Fine,
            format!("registering connection {}", hash),
        );
        let managed = Arc::new(Mutex::new(con));
        self.registry.insert(hash, managed.clone());
        managed
    }

    /// Unlinks the entry with this connection's hash and destroys the
    /// connection. Returns whether an entry was removed.
    ///
    /// The caller must not hold the connection's lock.
    pub fn connection_deregister(&mut self, con: &ManagedConnection) -> Result<bool> {
        let hash = con.lock()?.hash().to_owned();
        match self.registry.remove(&hash) {
            Some(entry) => {
                self.log(
                    LogModule::Connection,
                    LogLevel::Info,
                    format!("freeing connection {}", hash),
                );
                entry.lock()?.destroy();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Primary entry point: returns one live, registered, recently pinged
    /// connection satisfying the list's deployment type, read preference,
    /// and the caller's flags.
    ///
    /// `Ok(None)` is only returned under `DONT_CONNECT` when no seed had a
    /// usable registered connection.
    pub fn get_read_write_connection(
        &mut self,
        servers: &mut ServerList,
        flags: ConnectionFlags,
    ) -> Result<Option<ManagedConnection>> {
        match servers.con_type {
            TopologyType::Standalone => {
                self.log(
                    LogModule::Connection,
                    LogLevel::Info,
                    "get_read_write_connection: finding a standalone connection".to_owned(),
                );
                self.get_connection_multiple(servers, flags)
            }
            TopologyType::ReplicaSet => {
                self.log(
                    LogModule::Connection,
                    LogLevel::Info,
                    format!(
                        "get_read_write_connection: finding a replica set connection ({})",
                        if flags.contains(ConnectionFlags::WRITE) {
                            "write"
                        } else {
                            "read"
                        }
                    ),
                );
                self.get_connection_replica_set(servers, flags)
            }
            TopologyType::Multiple => {
                self.log(
                    LogModule::Connection,
                    LogLevel::Fine,
                    "get_read_write_connection: finding a router connection".to_owned(),
                );
                self.get_connection_multiple(servers, flags)
            }
        }
    }

    // Find-or-create for one server definition.
    fn get_connection_single(
        &mut self,
        server: &ServerDef,
        flags: ConnectionFlags,
    ) -> Result<Option<ManagedConnection>> {
        let hash = server.hash();

        if let Some(con) = self.connection_find_by_hash(&hash) {
            let pinged = match con.lock() {
                Ok(mut guard) => guard.ping(self.ping_interval),
                Err(_) => Err(Error::PoisonLockError),
            };
            return match pinged {
                Ok(()) => Ok(Some(con)),
                Err(err) => {
                    let _ = self.connection_deregister(&con);
                    Err(err)
                }
            };
        }

        if flags.contains(ConnectionFlags::DONT_CONNECT) {
            return Ok(None);
        }

        let mut con = Connection::connect(self.connector.as_ref(), server)?;
        if let (Some(db), Some(user), Some(password)) =
            (&server.db, &server.username, &server.password)
        {
            self.log(
                LogModule::Connection,
                LogLevel::Info,
                format!("get_connection_single: authenticating {}", hash),
            );
            if let Err(err) = con.authenticate(db, user, password) {
                con.destroy();
                return Err(err);
            }
        }
        if let Err(err) = con.handshake() {
            con.destroy();
            return Err(err);
        }
        if let Err(err) = con.ping(self.ping_interval) {
            con.destroy();
            return Err(err);
        }
        Ok(Some(self.connection_register(con)))
    }

    // Expands the server list to the members the cluster actually reports.
    //
    // The loop is index-based with the bound re-read on every step: entries
    // appended while iterating are themselves interrogated before the loop
    // ends. An individual probe failure is never fatal to the acquisition.
    fn discover_topology(&mut self, servers: &mut ServerList) {
        let mut repl_set_name = servers.repl_set_name.clone();

        let mut i = 0;
        while i < servers.servers.len() {
            let seed = servers.servers[i].clone();
            let hash = seed.hash();
            self.log(
                LogModule::Topology,
                LogLevel::Fine,
                format!("discover_topology: checking ismaster for {}", hash),
            );

            let con = match self.connection_find_by_hash(&hash) {
                Some(con) => con,
                None => {
                    self.log(
                        LogModule::Topology,
                        LogLevel::Warn,
                        format!("discover_topology: no connection for {}", hash),
                    );
                    i += 1;
                    continue;
                }
            };

            let outcome = match con.lock() {
                Ok(mut guard) => guard.is_master(&mut repl_set_name, &seed, self.ismaster_interval),
                Err(_) => Err(Error::PoisonLockError),
            };

            match outcome {
                Err(err) => {
                    self.log(
                        LogModule::Topology,
                        LogLevel::Warn,
                        format!(
                            "discover_topology: ismaster returned an error for {}:{}: {}",
                            seed.host, seed.port, err
                        ),
                    );
                    let _ = self.connection_deregister(&con);
                }
                Ok(IsMasterOutcome::Skipped) => {
                    self.log(
                        LogModule::Topology,
                        LogLevel::Fine,
                        "discover_topology: ismaster got skipped".to_owned(),
                    );
                }
                Ok(IsMasterOutcome::RemoveSeed(result)) => {
                    // Deregister first; the payload is still good for
                    // finding the members hiding behind the alias.
                    self.log(
                        LogModule::Topology,
                        LogLevel::Warn,
                        "discover_topology: ismaster worked, but the seed host's connection has to go"
                            .to_owned(),
                    );
                    let _ = self.connection_deregister(&con);
                    self.expand_hosts(servers, i, &result);
                }
                Ok(IsMasterOutcome::Ok(result)) => {
                    self.log(
                        LogModule::Topology,
                        LogLevel::Info,
                        "discover_topology: ismaster worked".to_owned(),
                    );
                    self.expand_hosts(servers, i, &result);
                }
            }

            i += 1;
        }
    }

    // Connects to every reported host not yet in the registry; connected
    // ones join the server list so they get interrogated in turn.
    fn expand_hosts(&mut self, servers: &mut ServerList, seed_idx: usize, result: &IsMasterResult) {
        for address in &result.hosts {
            let def = match servers.servers[seed_idx].derive(address) {
                Ok(def) => def,
                Err(err) => {
                    self.log(
                        LogModule::Topology,
                        LogLevel::Warn,
                        format!(
                            "discover_topology: skipping reported host '{}': {}",
                            address, err
                        ),
                    );
                    continue;
                }
            };
            if self.connection_find_by_hash(&def.hash()).is_some() {
                continue;
            }
            self.log(
                LogModule::Topology,
                LogLevel::Info,
                format!("discover_topology: found new host: {}:{}", def.host, def.port),
            );
            match self.get_connection_single(&def, ConnectionFlags::WRITE) {
                Ok(Some(_)) => servers.servers.push(def),
                Ok(None) => {}
                Err(err) => {
                    self.log(
                        LogModule::Topology,
                        LogLevel::Info,
                        format!(
                            "discover_topology: could not connect to new host: {}:{}: {}",
                            def.host, def.port, err
                        ),
                    );
                }
            }
        }
    }

    // Standalone and router deployments: connect every seed, no discovery,
    // select with the preference's mode forced to nearest. Seed failures
    // compose into the surfaced error when selection comes up empty.
    fn get_connection_multiple(
        &mut self,
        servers: &ServerList,
        flags: ConnectionFlags,
    ) -> Result<Option<ManagedConnection>> {
        let mut found = false;
        let mut messages: Vec<String> = Vec::new();

        for server in &servers.servers {
            match self.get_connection_single(server, flags) {
                Ok(Some(_)) => found = true,
                Ok(None) => {}
                Err(err) => {
                    if !flags.contains(ConnectionFlags::DONT_CONNECT) {
                        self.log(
                            LogModule::Connection,
                            LogLevel::Warn,
                            format!("Couldn't connect to '{}:{}': {}", server.host, server.port, err),
                        );
                        messages.push(format!(
                            "Failed to connect to: {}:{}: {}",
                            server.host, server.port, err
                        ));
                    }
                }
            }
        }

        if !found && flags.contains(ConnectionFlags::DONT_CONNECT) {
            return Ok(None);
        }

        let auth_hash = seed_auth_hash(servers);
        let mut pref = servers.read_pref.clone();
        pref.mode = ReadMode::Nearest;

        match self.run_selection(&pref, auth_hash.as_deref())? {
            Some(con) => Ok(Some(con)),
            None if messages.is_empty() => {
                Err(OperationError("No candidate servers found".to_owned()))
            }
            None => Err(OperationError(messages.join("; "))),
        }
    }

    // Replica sets: connect every seed, discover the real membership, then
    // select. Seed failures are recoverable through discovery and never
    // compose into the surfaced error.
    fn get_connection_replica_set(
        &mut self,
        servers: &mut ServerList,
        flags: ConnectionFlags,
    ) -> Result<Option<ManagedConnection>> {
        let mut found = false;

        for i in 0..servers.servers.len() {
            let server = servers.servers[i].clone();
            match self.get_connection_single(&server, flags) {
                Ok(Some(_)) => found = true,
                Ok(None) => {}
                Err(err) => {
                    if !flags.contains(ConnectionFlags::DONT_CONNECT) {
                        self.log(
                            LogModule::Connection,
                            LogLevel::Warn,
                            format!("Couldn't connect to '{}:{}': {}", server.host, server.port, err),
                        );
                    }
                }
            }
        }

        if !found && flags.contains(ConnectionFlags::DONT_CONNECT) {
            return Ok(None);
        }

        self.discover_topology(servers);

        let auth_hash = seed_auth_hash(servers);
        let pref = if flags.contains(ConnectionFlags::WRITE) {
            let mut pref = servers.read_pref.clone();
            pref.mode = ReadMode::Primary;
            pref
        } else {
            servers.read_pref.clone()
        };

        match self.run_selection(&pref, auth_hash.as_deref())? {
            Some(con) => Ok(Some(con)),
            None => Err(OperationError("No candidate servers found".to_owned())),
        }
    }

    fn run_selection(
        &self,
        pref: &ReadPreference,
        auth_hash: Option<&str>,
    ) -> Result<Option<ManagedConnection>> {
        let mut snapshot = Vec::new();
        for con in self.registry.iter() {
            let guard = con.lock()?;
            snapshot.push(select::Candidate {
                hash: guard.hash().to_owned(),
                kind: guard.kind(),
                tags: guard.tags().clone(),
                ping_ms: guard.ping_ms(),
                con: con.clone(),
            });
        }

        let mut candidates = select::candidate_servers(snapshot, pref, auth_hash);
        self.log(
            LogModule::Selection,
            LogLevel::Fine,
            format!("selection: {} candidate(s) left after filtering", candidates.len()),
        );
        select::sort_by_latency(&mut candidates);
        let candidates = select::select_nearest(candidates, pref.mode, self.latency_threshold_ms);
        Ok(select::pick_server(&candidates))
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        for con in self.registry.drain() {
            if let Ok(mut guard) = con.lock() {
                guard.destroy();
            }
        }
    }
}

fn seed_auth_hash(servers: &ServerList) -> Option<String> {
    servers
        .servers
        .first()
        .and_then(|s| match (&s.username, &s.password) {
            (Some(user), Some(password)) => Some(hashed_password(user, password)),
            _ => None,
        })
}
