//! Narrow interface to the wire-protocol collaborator.
//!
//! The manager never frames messages itself. It talks to servers through
//! these two traits and interprets the reply documents they hand back.
use bson::Document;

use crate::error::Result;
use crate::server::ServerDef;

/// Encapsulates how sessions to a server are opened.
///
/// Implementations own the socket-level connect and read timeouts for the
/// given definition; a timeout surfaces as an error from the blocking call.
pub trait WireConnector: Send {
    fn connect(&self, server: &ServerDef) -> Result<Box<dyn WireSession>>;
}

/// One live session to one server.
///
/// Every call blocks the calling thread until the server replies or the
/// session's read timeout fires.
pub trait WireSession: Send {
    /// Issues `ismaster` and returns the raw reply document.
    fn is_master(&mut self) -> Result<Document>;

    /// Issues `getnonce` and returns the server nonce.
    fn get_nonce(&mut self) -> Result<String>;

    /// Sends the `authenticate` command with a precomputed digest key.
    fn authenticate(&mut self, db: &str, user: &str, key: &str, nonce: &str) -> Result<()>;

    /// Issues `ping`.
    fn ping(&mut self) -> Result<()>;

    /// Closes the session. Must be safe to call more than once.
    fn close(&mut self);
}
