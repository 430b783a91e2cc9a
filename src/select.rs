//! Candidate selection over the registry: filter, latency sort, latency
//! window, random pick.
use rand::seq::SliceRandom;

use crate::common::{ReadMode, ReadPreference, TagSet};
use crate::connection::ServerKind;
use crate::manager::ManagedConnection;

/// Snapshot of one registered connection, taken under its lock so the
/// phases below never have to lock again.
pub(crate) struct Candidate {
    pub hash: String,
    pub kind: ServerKind,
    pub tags: TagSet,
    pub ping_ms: u64,
    pub con: ManagedConnection,
}

/// Phase 1: keep connections whose hash carries the caller's credential
/// prefix, whose role fits the mode, and which satisfy the first tag set
/// that yields at least one survivor.
pub(crate) fn candidate_servers(
    all: Vec<Candidate>,
    pref: &ReadPreference,
    auth_hash: Option<&str>,
) -> Vec<Candidate> {
    let prefix = auth_hash.unwrap_or("");
    let eligible: Vec<Candidate> = all
        .into_iter()
        .filter(|c| c.hash.starts_with(prefix) && kind_matches(c.kind, pref.mode))
        .collect();

    if pref.tag_sets.is_empty() {
        return eligible;
    }

    let mut winner: Option<&TagSet> = None;
    for tag_set in &pref.tag_sets {
        if eligible.iter().any(|c| provides_tags(&c.tags, tag_set)) {
            winner = Some(tag_set);
            break;
        }
    }

    match winner {
        Some(tag_set) => eligible
            .into_iter()
            .filter(|c| provides_tags(&c.tags, tag_set))
            .collect(),
        None => Vec::new(),
    }
}

/// Phase 2: stable sort by round-trip time, ascending.
pub(crate) fn sort_by_latency(candidates: &mut Vec<Candidate>) {
    candidates.sort_by_key(|c| c.ping_ms);
}

/// Phase 3: keep candidates within the latency window of the fastest one,
/// then collapse the preferred role when it survived. Expects sorted input.
pub(crate) fn select_nearest(
    mut candidates: Vec<Candidate>,
    mode: ReadMode,
    threshold_ms: u64,
) -> Vec<Candidate> {
    if candidates.is_empty() {
        return candidates;
    }

    let min_ping = candidates[0].ping_ms;
    candidates.retain(|c| c.ping_ms <= min_ping + threshold_ms);

    match mode {
        ReadMode::PrimaryPreferred => {
            if candidates.iter().any(|c| c.kind == ServerKind::Primary) {
                candidates.retain(|c| c.kind == ServerKind::Primary);
            }
        }
        ReadMode::SecondaryPreferred => {
            if candidates.iter().any(|c| c.kind == ServerKind::Secondary) {
                candidates.retain(|c| c.kind == ServerKind::Secondary);
            }
        }
        _ => {}
    }

    candidates
}

/// Phase 4: uniform random pick among the survivors.
pub(crate) fn pick_server(candidates: &[Candidate]) -> Option<ManagedConnection> {
    candidates
        .choose(&mut rand::thread_rng())
        .map(|c| c.con.clone())
}

// Standalone servers and routers act as primaries for the modes that accept
// more than one role; discovery never reclassifies them.
fn kind_matches(kind: ServerKind, mode: ReadMode) -> bool {
    match mode {
        ReadMode::Primary => kind == ServerKind::Primary,
        ReadMode::Secondary => kind == ServerKind::Secondary,
        ReadMode::PrimaryPreferred | ReadMode::SecondaryPreferred | ReadMode::Nearest => matches!(
            kind,
            ServerKind::Primary | ServerKind::Secondary | ServerKind::Standalone | ServerKind::Mongos
        ),
    }
}

// A connection matches a tag set when it provides every tag in it; extra
// tags on the connection are ignored.
fn provides_tags(provided: &TagSet, wanted: &TagSet) -> bool {
    wanted.iter().all(|(k, v)| provided.get(k) == Some(v))
}
