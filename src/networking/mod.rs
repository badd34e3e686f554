pub mod dialer;
pub mod egress;
pub mod server;
pub mod socks5;
