//! Dynamically updatable TLS server configuration.
//!
//! ```text
//! SourceCell<ServerCertificate> ─┐
//! SourceCell<ServerCertificate> ─┼─▶ TlsConfigHolder::update_tls_config ─▶ TlsSnapshot (published)
//! SourceCell<CertificateDer>    ─┘                                            ▲
//!                                                    handshake ─ LiveCertResolver / LiveClientVerifier
//! ```
//!
//! Listeners are configured once with [`TlsConfigHolder::tls_config`] (or
//! accept through [`TlsConfigHolder::accept`]); every later update is picked
//! up by the next handshake.

pub mod holder;
mod resolver;
pub mod source;

pub use holder::{
    ClientAuthMode, ClientCaSourceCell, ServerCertSourceCell, TlsConfigHolder, TlsSnapshot,
    TlsTemplate,
};
pub use source::SourceCell;
