//! Scriptable in-memory stand-in for the wire-protocol collaborator.
//!
//! Each address gets a canned `ismaster` reply, optional credentials, and
//! per-operation counters so tests can observe exactly which calls went
//! over the "wire".
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use bson::{doc, Bson, Document};
use mongocon::server::hashed_password;
use mongocon::wire::{WireConnector, WireSession};
use mongocon::{Error, Result, ServerDef};

#[derive(Default)]
pub struct ServerState {
    pub ismaster: Document,
    pub reachable: bool,
    pub fail_ping: bool,
    pub credentials: Option<(String, String)>,
    pub connects: usize,
    pub pings: usize,
    pub ismasters: usize,
    pub nonces: usize,
    pub closes: usize,
}

/// The set of fake servers one test talks to.
#[derive(Clone, Default)]
pub struct MockCluster {
    servers: Arc<Mutex<HashMap<String, ServerState>>>,
}

impl MockCluster {
    pub fn new() -> MockCluster {
        MockCluster::default()
    }

    /// Adds a reachable server answering `ismaster` with `reply`.
    pub fn add(&self, address: &str, reply: Document) {
        let mut servers = self.servers.lock().unwrap();
        let state = servers.entry(address.to_owned()).or_default();
        state.ismaster = reply;
        state.reachable = true;
    }

    /// Adds a reachable server that requires the nonce handshake.
    pub fn add_with_credentials(&self, address: &str, reply: Document, user: &str, password: &str) {
        self.add(address, reply);
        self.with(address, |state| {
            state.credentials = Some((user.to_owned(), password.to_owned()))
        });
    }

    /// Adds a server that refuses connections.
    pub fn add_down(&self, address: &str) {
        self.with(address, |state| state.reachable = false);
    }

    pub fn set_fail_ping(&self, address: &str, fail: bool) {
        self.with(address, |state| state.fail_ping = fail);
    }

    pub fn connector(&self) -> Box<dyn WireConnector> {
        Box::new(MockConnector {
            cluster: self.clone(),
        })
    }

    pub fn connects(&self, address: &str) -> usize {
        self.read(address, |s| s.connects)
    }

    pub fn pings(&self, address: &str) -> usize {
        self.read(address, |s| s.pings)
    }

    pub fn ismasters(&self, address: &str) -> usize {
        self.read(address, |s| s.ismasters)
    }

    pub fn nonces(&self, address: &str) -> usize {
        self.read(address, |s| s.nonces)
    }

    pub fn closes(&self, address: &str) -> usize {
        self.read(address, |s| s.closes)
    }

    fn with(&self, address: &str, apply: impl FnOnce(&mut ServerState)) {
        let mut servers = self.servers.lock().unwrap();
        apply(servers.entry(address.to_owned()).or_default());
    }

    fn read(&self, address: &str, extract: impl FnOnce(&ServerState) -> usize) -> usize {
        let servers = self.servers.lock().unwrap();
        servers.get(address).map(extract).unwrap_or(0)
    }
}

struct MockConnector {
    cluster: MockCluster,
}

impl WireConnector for MockConnector {
    fn connect(&self, server: &ServerDef) -> Result<Box<dyn WireSession>> {
        let address = server.address();
        let mut servers = self.cluster.servers.lock().unwrap();
        match servers.get_mut(&address) {
            Some(state) if state.reachable => {
                state.connects += 1;
                Ok(Box::new(MockSession {
                    cluster: self.cluster.clone(),
                    address,
                }))
            }
            _ => Err(Error::IoError(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("connection refused: {}", address),
            ))),
        }
    }
}

struct MockSession {
    cluster: MockCluster,
    address: String,
}

impl MockSession {
    fn with_state<T>(&self, apply: impl FnOnce(&mut ServerState) -> T) -> T {
        let mut servers = self.cluster.servers.lock().unwrap();
        apply(servers.entry(self.address.clone()).or_default())
    }
}

impl WireSession for MockSession {
    fn is_master(&mut self) -> Result<Document> {
        Ok(self.with_state(|state| {
            state.ismasters += 1;
            state.ismaster.clone()
        }))
    }

    fn get_nonce(&mut self) -> Result<String> {
        self.with_state(|state| state.nonces += 1);
        Ok("2375531c32080ae8".to_owned())
    }

    fn authenticate(&mut self, _db: &str, user: &str, key: &str, nonce: &str) -> Result<()> {
        self.with_state(|state| match &state.credentials {
            Some((expected_user, password)) if expected_user == user => {
                let expected_key = format!(
                    "{:x}",
                    md5::compute(format!(
                        "{}{}{}",
                        nonce,
                        user,
                        hashed_password(user, password)
                    ))
                );
                if key == expected_key {
                    Ok(())
                } else {
                    Err(Error::AuthenticationError(format!(
                        "auth failed for user {}",
                        user
                    )))
                }
            }
            _ => Err(Error::AuthenticationError(format!(
                "auth failed for user {}",
                user
            ))),
        })
    }

    fn ping(&mut self) -> Result<()> {
        let address = self.address.clone();
        self.with_state(|state| {
            state.pings += 1;
            if state.fail_ping {
                Err(Error::OperationError(format!("ping failed for {}", address)))
            } else {
                Ok(())
            }
        })
    }

    fn close(&mut self) {
        self.with_state(|state| state.closes += 1);
    }
}

/// Reply of a standalone mongod.
pub fn standalone_doc() -> Document {
    doc! { "ok": 1.0, "ismaster": true, "maxBsonObjectSize": 16_777_216_i32 }
}

/// Reply of a mongos router.
pub fn mongos_doc() -> Document {
    doc! { "ok": 1.0, "ismaster": true, "msg": "isdbgrid" }
}

/// Reply of a replica-set member that knows the given host list.
pub fn rs_doc(set_name: &str, primary: bool, hosts: &[&str]) -> Document {
    let host_arr: Vec<Bson> = hosts
        .iter()
        .map(|h| Bson::String((*h).to_owned()))
        .collect();
    doc! {
        "ok": 1.0,
        "ismaster": primary,
        "secondary": !primary,
        "setName": set_name,
        "hosts": host_arr,
    }
}

/// Same as [`rs_doc`], with member tags.
pub fn rs_doc_with_tags(
    set_name: &str,
    primary: bool,
    hosts: &[&str],
    tags: &[(&str, &str)],
) -> Document {
    let mut reply = rs_doc(set_name, primary, hosts);
    let mut tag_doc = Document::new();
    for (key, value) in tags {
        tag_doc.insert(*key, *value);
    }
    reply.insert("tags", tag_doc);
    reply
}
