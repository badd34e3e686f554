//! Operator networking toolkit built around a SOCKS5 proxy core, with
//! netcat-style sessions, TCP file transfer and an HTTP beacon riding
//! the same plumbing.

pub mod commands;
pub mod config;
pub mod encryption;
pub mod file_handling;
pub mod netcat;
pub mod networking;
pub mod util;
