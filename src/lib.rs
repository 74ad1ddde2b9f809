pub mod config;
pub mod domain;
pub mod http;
pub mod id;
pub mod propagate;
pub mod state;
pub mod transport;
pub mod version;
pub mod viewers;
