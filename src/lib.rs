//! mTLS trust manager library
//!
//! Establishes and continuously maintains the TLS identities and trust roots
//! used for mutually-authenticated service-to-service connections.
//!
//! # Features
//!
//! - **Service CA**: issues leaf certificates for service subjects with
//!   year-long, multi-day or multi-hour signing profiles
//! - **File maps**: canonical `ca.pem` / `cert.pem` / `key.pem` secret layout
//! - **Hot-swapped TLS configs**: listeners keep serving freshly rotated
//!   certificates without a restart
//! - **Client CA registry**: maps presented certificate fingerprints back to
//!   the identity provider that registered them
//! - **Directory watching**: debounced reload of mounted certificate secrets

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod certwatch;
pub mod cli;
pub mod config;
pub mod error;
pub mod mtls;
pub mod tlsconfig;
pub mod trust;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Namespace the platform is installed into unless configured otherwise
pub const DEFAULT_NAMESPACE: &str = "stackrox";

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?;
        }
        _ => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?;
        }
    }

    Ok(())
}
