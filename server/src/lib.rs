//! ouiwatch: keeps a local copy of the Wireshark `manuf` OUI database fresh
//! and resolves MAC addresses to vendors by longest-prefix match.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod oui;
pub mod refresh;
