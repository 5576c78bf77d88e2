//! Trust management: internal roots, the default certificate, identity
//! provider client CAs, and the TLS holders built from them.

pub mod default_cert;
pub mod manager;
pub mod registry;

pub use default_cert::{DefaultCertHandler, load_default_cert};
pub use manager::{
    ClientCaSource, InternalTrust, ServerCertSource, TlsConfigurerOptions, TrustManager, TrustSettings,
};
pub use registry::{AuthProvider, ClientCaRegistry};
