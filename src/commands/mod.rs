pub mod exec;
pub mod http_beacon;
