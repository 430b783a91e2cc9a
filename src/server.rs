//! Server definitions and the identity hash that keys the registry.
use crate::common::ReadPreference;
use crate::error::Error::ArgumentError;
use crate::error::Result;

/// Derives the salted password digest used both in the identity hash and in
/// the authentication handshake.
pub fn hashed_password(username: &str, password: &str) -> String {
    format!("{:x}", md5::compute(format!("{}:mongo:{}", username, password)))
}

/// The declared shape of the deployment a seed list points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyType {
    /// A single server.
    Standalone,
    /// A replica set; the seed list is expanded by topology discovery.
    ReplicaSet,
    /// Several independent routing servers.
    Multiple,
}

/// Declarative identity of a server the caller wants to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDef {
    pub host: String,
    pub port: u16,
    pub db: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ServerDef {
    /// Returns a definition without credentials.
    pub fn new(host: &str, port: u16) -> ServerDef {
        ServerDef {
            host: host.to_owned(),
            port,
            db: None,
            username: None,
            password: None,
        }
    }

    /// Returns a definition that authenticates against `db`.
    pub fn with_auth(host: &str, port: u16, db: &str, username: &str, password: &str) -> ServerDef {
        ServerDef {
            host: host.to_owned(),
            port,
            db: Some(db.to_owned()),
            username: Some(username.to_owned()),
            password: Some(password.to_owned()),
        }
    }

    /// The wire endpoint as reported in `ismaster` host lists.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Computes the registry key for this definition.
    ///
    /// Definitions hash equal exactly when they address the same endpoint
    /// with the same effective credentials. The credential digest leads the
    /// string so that authenticated entries are recognizable by prefix.
    pub fn hash(&self) -> String {
        match (&self.db, &self.username, &self.password) {
            (Some(db), Some(user), Some(pwd)) => format!(
                "{}/{}/{}:{}",
                hashed_password(user, pwd),
                db,
                self.host,
                self.port
            ),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Builds the definition of a newly reported member, inheriting this
    /// definition's credentials.
    pub fn derive(&self, address: &str) -> Result<ServerDef> {
        let (host, port) = match address.rfind(':') {
            Some(idx) => (&address[..idx], &address[idx + 1..]),
            None => {
                return Err(ArgumentError(
                    format!("Host '{}' is missing a port.", address),
                ))
            }
        };
        let port: u16 = port
            .parse()
            .map_err(|_| ArgumentError(format!("Port in '{}' must be an integer.", address)))?;
        if port == 0 {
            return Err(ArgumentError(
                format!("Port in '{}' must be non-zero.", address),
            ));
        }
        Ok(ServerDef {
            host: host.to_owned(),
            port,
            db: self.db.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        })
    }
}

/// The live working set for one acquisition.
///
/// Discovery appends to `servers`; entries are never reordered or removed.
#[derive(Debug, Clone)]
pub struct ServerList {
    pub servers: Vec<ServerDef>,
    pub con_type: TopologyType,
    pub repl_set_name: Option<String>,
    pub read_pref: ReadPreference,
}

impl ServerList {
    pub fn new(con_type: TopologyType) -> ServerList {
        ServerList {
            servers: Vec::new(),
            con_type,
            repl_set_name: None,
            read_pref: ReadPreference::default(),
        }
    }
}
