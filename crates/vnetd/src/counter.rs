//! Counter name normalization.
//!
//! Hardware counter names arrive in vendor form ("port rx bytes",
//! "port_tx.runt packets"). Before publication they are normalized
//! (space, dot and underscore all become `-`) and then translated through
//! a fixed alias table to the conventional names kernel tools report.
//! Names missing from the table pass through normalized but untranslated.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Single separator every space, dot and underscore collapses to.
pub const SEPARATOR: &str = "-";

static SEPARATOR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ ._]").expect("Invalid regex pattern"));

/// Names that count monotonically and therefore have meaningful deltas.
static COUNTER_LIKE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(packets|bytes)").expect("Invalid regex pattern"));

static LINK_STAT_TRANSLATION: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("port-rx-multicast-packets", "multicast"),
        ("port-rx-bytes", "rx-bytes"),
        ("port-rx-crc-error-packets", "rx-crc-errors"),
        ("port-rx-runt-packets", "rx-fifo-errors"),
        ("port-rx-undersize-packets", "rx-length-errors"),
        ("port-rx-oversize-packets", "rx-over-errors"),
        ("port-rx-packets", "rx-packets"),
        ("port-tx-total-collisions", "collisions"),
        ("port-tx-fifo-underrun-packets", "tx-aborted-errors"),
        ("port-tx-bytes", "tx-bytes"),
        ("port-tx-runt-packets", "tx-fifo-errors"),
        ("port-tx-packets", "tx-packets"),
    ])
});

/// Replaces every separator character with [`SEPARATOR`].
pub fn normalize(name: &str) -> String {
    SEPARATOR_RE.replace_all(name, SEPARATOR).into_owned()
}

/// Normalizes `name` and maps it through the alias table.
pub fn translate(name: &str) -> String {
    let normalized = normalize(name);
    match LINK_STAT_TRANSLATION.get(normalized.as_str()) {
        Some(alias) => (*alias).to_string(),
        None => normalized,
    }
}

/// True for byte and packet counters.
pub fn is_counter_like(name: &str) -> bool {
    COUNTER_LIKE_RE.is_match(name)
}
