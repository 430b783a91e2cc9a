//! The connection primitive: one live session to one server.
use std::time::{Duration, Instant};

use bson::{Bson, Document};
use chrono::{DateTime, Utc};

use crate::common::TagSet;
use crate::error::Error::{OperationError, ResponseError};
use crate::error::Result;
use crate::server::{hashed_password, ServerDef};
use crate::wire::{WireConnector, WireSession};

pub const DEFAULT_MAX_BSON_OBJECT_SIZE: i64 = 16 * 1024 * 1024;

/// The role a server reports through `ismaster`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    /// Role not yet probed, or not recognizable from the reply.
    Unknown,
    /// Replica set primary.
    Primary,
    /// Replica set secondary.
    Secondary,
    /// Replica set arbiter.
    Arbiter,
    /// Shard router.
    Mongos,
    /// Standalone server.
    Standalone,
}

/// The result of an `ismaster` round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsMasterResult {
    pub is_master: bool,
    pub is_secondary: bool,
    pub arbiter_only: bool,
    pub is_replica_set: bool,
    pub msg: String,
    pub set_name: String,
    /// All members this server knows, as `host:port` strings.
    pub hosts: Vec<String>,
    pub tags: TagSet,
    pub max_bson_object_size: i64,
    pub local_time: Option<DateTime<Utc>>,
}

impl IsMasterResult {
    /// Parses an `ismaster` reply document from the server.
    pub fn parse(doc: Document) -> Result<IsMasterResult> {
        let is_master = match doc.get("ismaster") {
            Some(&Bson::Boolean(b)) => b,
            _ => {
                return Err(ResponseError(
                    "result does not contain 'ismaster'.".to_owned(),
                ))
            }
        };

        let mut result = IsMasterResult {
            is_master,
            is_secondary: false,
            arbiter_only: false,
            is_replica_set: false,
            msg: String::new(),
            set_name: String::new(),
            hosts: Vec::new(),
            tags: TagSet::new(),
            max_bson_object_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
            local_time: None,
        };

        if let Some(Bson::Boolean(b)) = doc.get("secondary") {
            result.is_secondary = *b;
        }

        if let Some(Bson::Boolean(b)) = doc.get("arbiterOnly") {
            result.arbiter_only = *b;
        }

        if let Some(Bson::Boolean(b)) = doc.get("isreplicaset") {
            result.is_replica_set = *b;
        }

        if let Some(Bson::String(s)) = doc.get("msg") {
            result.msg = s.to_owned();
        }

        if let Some(Bson::String(s)) = doc.get("setName") {
            result.set_name = s.to_owned();
        }

        if let Some(Bson::Array(arr)) = doc.get("hosts") {
            result.hosts = arr
                .iter()
                .filter_map(|bson| match bson {
                    Bson::String(s) => Some(s.to_owned()),
                    _ => None,
                })
                .collect();
        }

        if let Some(Bson::Document(tags)) = doc.get("tags") {
            for (k, v) in tags.iter() {
                if let Bson::String(tag) = v {
                    result.tags.insert(k.to_owned(), tag.to_owned());
                }
            }
        }

        match doc.get("maxBsonObjectSize") {
            Some(&Bson::Int32(v)) => result.max_bson_object_size = i64::from(v),
            Some(&Bson::Int64(v)) => result.max_bson_object_size = v,
            _ => {}
        }

        if let Some(Bson::DateTime(datetime)) = doc.get("localTime") {
            result.local_time = Some(datetime.to_chrono());
        }

        Ok(result)
    }

    /// Classifies the role the reply describes.
    pub fn kind(&self) -> ServerKind {
        let set_name_empty = self.set_name.is_empty();
        let msg_empty = self.msg.is_empty();

        if msg_empty && set_name_empty && !self.is_replica_set {
            ServerKind::Standalone
        } else if !msg_empty {
            ServerKind::Mongos
        } else if self.is_master && !set_name_empty {
            ServerKind::Primary
        } else if self.is_secondary && !set_name_empty {
            ServerKind::Secondary
        } else if self.arbiter_only && !set_name_empty {
            ServerKind::Arbiter
        } else {
            ServerKind::Unknown
        }
    }
}

/// What an interval-gated `ismaster` probe concluded.
#[derive(Debug)]
pub enum IsMasterOutcome {
    /// The probe ran; the payload is usable for discovery.
    Ok(IsMasterResult),
    /// The previous probe is recent enough; nothing was sent.
    Skipped,
    /// The probe ran, but the contacted host is not a member of the host
    /// list it reported. The caller must drop this connection, then it may
    /// still expand the payload's host list.
    RemoveSeed(IsMasterResult),
}

/// Owns one live session, its identity hash, and the liveness bookkeeping
/// that decides when real probes go over the wire.
pub struct Connection {
    hash: String,
    session: Box<dyn WireSession>,
    kind: ServerKind,
    tags: TagSet,
    max_bson_size: i64,
    ping_ms: u64,
    last_ping: Option<Instant>,
    last_ismaster: Option<Instant>,
    closed: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("hash", &self.hash)
            .field("kind", &self.kind)
            .field("tags", &self.tags)
            .field("max_bson_size", &self.max_bson_size)
            .field("ping_ms", &self.ping_ms)
            .field("last_ping", &self.last_ping)
            .field("last_ismaster", &self.last_ismaster)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Connection {
    /// Opens a session to `server` and wraps it with defaults. The new
    /// connection is not registered.
    pub fn connect(connector: &dyn WireConnector, server: &ServerDef) -> Result<Connection> {
        let session = connector.connect(server)?;
        Ok(Connection {
            hash: server.hash(),
            session,
            kind: ServerKind::Unknown,
            tags: TagSet::new(),
            max_bson_size: DEFAULT_MAX_BSON_OBJECT_SIZE,
            ping_ms: 0,
            last_ping: None,
            last_ismaster: None,
            closed: false,
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// Round-trip time of the last real ping, in milliseconds.
    pub fn ping_ms(&self) -> u64 {
        self.ping_ms
    }

    pub fn max_bson_size(&self) -> i64 {
        self.max_bson_size
    }

    /// Runs the nonce handshake for `user` against `db`.
    pub fn authenticate(&mut self, db: &str, user: &str, password: &str) -> Result<()> {
        let nonce = self.session.get_nonce()?;
        let key = auth_key(&nonce, user, &hashed_password(user, password));
        self.session.authenticate(db, user, &key, &nonce)
    }

    /// One `ismaster` round trip at creation time that records the server's
    /// role, tags, and size limit. Deliberately does not stamp the probe
    /// timestamp, so the first discovery pass still interrogates the host.
    pub(crate) fn handshake(&mut self) -> Result<()> {
        let doc = self.session.is_master()?;
        let result = IsMasterResult::parse(doc)?;
        self.apply(&result);
        Ok(())
    }

    /// Interval-gated topology probe.
    ///
    /// `expected_repl_set` is read and written: a reported set name is
    /// checked against it when present and adopted into it when absent.
    pub fn is_master(
        &mut self,
        expected_repl_set: &mut Option<String>,
        server: &ServerDef,
        interval: Duration,
    ) -> Result<IsMasterOutcome> {
        if let Some(at) = self.last_ismaster {
            if at.elapsed() < interval {
                return Ok(IsMasterOutcome::Skipped);
            }
        }

        let doc = self.session.is_master()?;
        let result = IsMasterResult::parse(doc)?;
        self.apply(&result);
        self.last_ismaster = Some(Instant::now());

        if !result.set_name.is_empty() {
            match expected_repl_set {
                Some(expected) if *expected != result.set_name => {
                    return Err(OperationError(format!(
                        "Host {} is not a member of replica set {}.",
                        server.address(),
                        expected
                    )));
                }
                Some(_) => {}
                None => *expected_repl_set = Some(result.set_name.clone()),
            }
        }

        let address = server.address();
        if result.hosts.iter().any(|h| *h == address) {
            Ok(IsMasterOutcome::Ok(result))
        } else {
            Ok(IsMasterOutcome::RemoveSeed(result))
        }
    }

    /// Liveness probe. Within `interval` of the last successful ping this
    /// returns immediately without a round trip; otherwise the elapsed wall
    /// time of the probe becomes the new `ping_ms`.
    pub fn ping(&mut self, interval: Duration) -> Result<()> {
        if let Some(at) = self.last_ping {
            if at.elapsed() < interval {
                return Ok(());
            }
        }

        let start = Instant::now();
        self.session.ping()?;
        self.ping_ms = start.elapsed().as_millis() as u64;
        self.last_ping = Some(Instant::now());
        Ok(())
    }

    /// Closes the wire session. Safe to call more than once.
    pub(crate) fn destroy(&mut self) {
        if !self.closed {
            self.session.close();
            self.closed = true;
        }
    }

    fn apply(&mut self, result: &IsMasterResult) {
        self.kind = result.kind();
        self.tags = result.tags.clone();
        self.max_bson_size = result.max_bson_object_size;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.destroy();
    }
}

// The digest sent in the authenticate command.
fn auth_key(nonce: &str, user: &str, hashed_password: &str) -> String {
    format!(
        "{:x}",
        md5::compute(format!("{}{}{}", nonce, user, hashed_password))
    )
}
