//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::mtls::ca::SigningProfile;
use crate::mtls::subject::ServiceType;

/// Mutual-TLS trust manager: service CA tooling and hot-reloading TLS listeners
#[derive(Parser, Debug)]
#[command(name = "mtls-trust")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MTLS_TRUST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MTLS_TRUST_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MTLS_TRUST_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the configured TLS listeners (default)
    Serve,

    /// Create a service CA in a directory, keeping an existing one
    InitCa {
        /// Directory for `ca.pem` / `ca-key.pem`
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Issue a service certificate signed by the CA in `--ca-dir`
    Issue {
        /// Directory holding `ca.pem` and `ca-key.pem`
        #[arg(long)]
        ca_dir: PathBuf,

        /// Output directory for the certificate and key
        #[arg(short, long)]
        out: PathBuf,

        /// Service type, e.g. `SCANNER_DB_SERVICE`
        #[arg(long, value_parser = clap::value_parser!(ServiceType))]
        service_type: ServiceType,

        /// Service identifier
        #[arg(long)]
        id: String,

        /// Also cover the service hostnames in this namespace
        #[arg(long)]
        namespace: Option<String>,

        /// Signing profile (default, hours, days)
        #[arg(long, default_value = "default", value_parser = clap::value_parser!(SigningProfile))]
        profile: SigningProfile,

        /// File name prefix, e.g. `scanner-db-`; `--prefix auto` derives it
        /// from the service type
        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Print the SHA-256 fingerprint of every certificate in a PEM file
    Fingerprint {
        /// PEM file
        #[arg(required = true)]
        file: PathBuf,
    },
}
