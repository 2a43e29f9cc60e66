pub mod config;
pub mod dedupe;
pub mod domain;
pub mod error;
pub mod export;
pub mod fingerprint;
pub mod logging;
pub mod normalize;
pub mod runner;
pub mod sources;
pub mod store;
