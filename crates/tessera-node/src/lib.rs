//! Tessera Node - Runs threshold groups on a local devnet
//!
//! This crate provides:
//! - JSON node configuration
//! - Simulated key generation and signing rounds
//! - An in-process devnet running every operator of a group

pub mod config;
pub mod devnet;
pub mod error;
pub mod executor;

pub use config::{GroupConfig, NodeConfig, OperatorConfig, ScenarioConfig, TimingConfig, CONFIG_ENV};
pub use devnet::{
    agreed_public_key, Devnet, DevnetReport, KeyGenerationReport, SeatKeyGeneration,
    SignatureReport, SigningReport,
};
pub use error::{NodeError, Result};
pub use executor::{GeneratedKey, SimulatedKeyGenerator, SimulatedSigner};
