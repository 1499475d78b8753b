pub mod alerts;
pub mod constants;
pub mod logging;
pub mod market;
pub mod node;
pub mod p2p;
pub mod service;
pub mod store;
pub mod swap;
