//! Private-network reachability discovery for the NetDesk asset registry:
//! an on-demand port scanner and a periodic host liveness sweep.
pub mod addr;
pub mod config;
pub mod error;
pub mod ports;
pub mod pool;
pub mod probe;
pub mod reach;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod sweep;
pub mod types;
