//! Code shared by Vigil nodes: configuration, mDNS discovery and the feed
//! server wire protocol.

pub mod config;
pub mod discovery;
pub mod protocol;
