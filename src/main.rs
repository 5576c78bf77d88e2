//! mTLS trust manager - service CA tooling and hot-reloading TLS listeners

use std::net::SocketAddr;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mtls_trust::{
    cli::{Cli, Command},
    config::TrustConfig,
    mtls::{
        CertIdentity, IssueOptions, ServiceType, SigningProfile, Subject,
        file_map::{
            add_ca_cert_to_file_map, ca_from_file_map_or_generate, issue_service_cert,
            load_ca_from_file_map, read_file_map_from_dir, service_prefix,
            verify_service_cert_and_key, write_file_map_to_dir,
        },
        load_certs,
    },
    setup_tracing,
    tlsconfig::TlsConfigHolder,
    trust::TrustManager,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::InitCa { ref out }) => run_init_ca(out),
        Some(Command::Issue {
            ref ca_dir,
            ref out,
            service_type,
            ref id,
            ref namespace,
            profile,
            ref prefix,
        }) => run_issue(&IssueArgs {
            ca_dir,
            out,
            service_type,
            id,
            namespace: namespace.as_deref(),
            profile,
            prefix,
        }),
        Some(Command::Fingerprint { ref file }) => run_fingerprint(file),
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Create or keep a CA in `out`
fn run_init_ca(out: &Path) -> anyhow::Result<()> {
    let mut map = read_file_map_from_dir(out)
        .with_context(|| format!("reading CA directory {}", out.display()))?;
    let ca = ca_from_file_map_or_generate(&mut map)?;
    write_file_map_to_dir(&map, out)
        .with_context(|| format!("writing CA directory {}", out.display()))?;

    println!("✅ Service CA ready in {}", out.display());
    println!("   Fingerprint: {}", ca.identity().fingerprint);
    println!("   Expires:     {}", ca.identity().not_after);
    Ok(())
}

struct IssueArgs<'a> {
    ca_dir: &'a Path,
    out: &'a Path,
    service_type: ServiceType,
    id: &'a str,
    namespace: Option<&'a str>,
    profile: SigningProfile,
    prefix: &'a str,
}

/// Issue a service certificate into `out`
fn run_issue(args: &IssueArgs<'_>) -> anyhow::Result<()> {
    let ca_map = read_file_map_from_dir(args.ca_dir)?;
    let ca = load_ca_from_file_map(&ca_map)
        .with_context(|| format!("loading CA from {}", args.ca_dir.display()))?;
    if !ca.can_sign() {
        bail!("CA in {} cannot sign", args.ca_dir.display());
    }

    let prefix = if args.prefix == "auto" {
        service_prefix(args.service_type)
    } else {
        args.prefix.to_string()
    };
    let mut opts = IssueOptions::default().with_profile(args.profile);
    if let Some(ns) = args.namespace {
        opts = opts.with_namespace(ns);
    }

    let mut out_map = read_file_map_from_dir(args.out)?;
    let subject = Subject::new(args.service_type, args.id);
    let issued = issue_service_cert(&mut out_map, &ca, &subject, &prefix, &opts)?;
    add_ca_cert_to_file_map(&mut out_map, &ca);
    verify_service_cert_and_key(
        &out_map,
        &prefix,
        &ca,
        args.service_type,
        OffsetDateTime::now_utc(),
        None,
    )
    .context("verifying freshly issued certificate")?;
    write_file_map_to_dir(&out_map, args.out)
        .with_context(|| format!("writing {}", args.out.display()))?;

    let identity = issued.cert_identity()?;
    println!("✅ Issued {subject}");
    println!("   Serial:    {}", issued.service_identity.serial);
    println!("   DNS names: {}", identity.san_dns_names.join(", "));
    println!("   Expires:   {}", identity.not_after);
    println!("   Identity:  {}", serde_json::to_string(&issued.service_identity)?);
    Ok(())
}

/// Print fingerprints of every certificate in `file`
fn run_fingerprint(file: &Path) -> anyhow::Result<()> {
    for cert in load_certs(file)? {
        let identity = CertIdentity::from_der(&cert)?;
        println!("{}  {}", identity.fingerprint, identity.display_name());
    }
    Ok(())
}

/// Run every configured TLS listener until Ctrl-C
async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let config = TrustConfig::load(cli.config.as_deref()).context("loading configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = %config.namespace,
        subject = %config.subject(),
        endpoints = config.endpoints.len(),
        "Starting mTLS trust manager"
    );

    let manager = Arc::new(TrustManager::load(&config).context("loading internal trust material")?);
    let token = CancellationToken::new();
    let mut tasks = Vec::new();

    if let Some(dir) = &config.default_cert_dir {
        tasks.push(manager.watch_default_cert(dir.clone(), config.watch_interval, token.child_token()));
    }

    for endpoint in &config.endpoints {
        let holder = manager.tls_configurer(&endpoint.configurer_options())?;
        let addr = endpoint.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding endpoint '{}' to {addr}", endpoint.name))?;
        info!(endpoint = %endpoint.name, %addr, "Listening");

        tasks.push(tokio::spawn(serve_endpoint(
            endpoint.name.clone(),
            listener,
            holder,
            Arc::clone(&manager),
            token.child_token(),
        )));
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutting down");
    token.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

async fn serve_endpoint(
    name: String,
    listener: TcpListener,
    holder: Arc<TlsConfigHolder>,
    manager: Arc<TrustManager>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(
                        name.clone(),
                        stream,
                        peer,
                        Arc::clone(&holder),
                        Arc::clone(&manager),
                    ));
                }
                Err(e) => warn!(endpoint = %name, error = %e, "Accept failed"),
            },
            () = token.cancelled() => {
                debug!(endpoint = %name, "Listener shutting down");
                break;
            }
        }
    }
}

/// Complete the handshake and report the authenticated peer back to it
async fn handle_connection(
    endpoint: String,
    stream: TcpStream,
    peer: SocketAddr,
    holder: Arc<TlsConfigHolder>,
    manager: Arc<TrustManager>,
) {
    // One snapshot serves the whole handshake, so a rotation landing
    // mid-handshake cannot mix certificates and client CAs.
    let mut tls = match holder.accept(stream).await {
        Ok(tls) => tls,
        Err(e) => {
            debug!(%endpoint, %peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let chain = tls.get_ref().1.peer_certificates().map(<[_]>::to_vec);
    let summary = match chain.as_deref() {
        Some([leaf, ..]) => {
            let name = CertIdentity::from_der(leaf).map_or_else(|e| e.to_string(), |id| id.display_name());
            let service = manager.ca().validate_and_extract_subject(leaf).ok();
            let provider = chain
                .as_deref()
                .and_then(|c| manager.provider_for_chain(c))
                .map(|p| p.name().to_string());
            info!(
                %endpoint,
                %peer,
                client = %name,
                service = ?service.as_ref().map(ToString::to_string),
                provider = ?provider,
                "Authenticated client"
            );
            format!("hello {name}\n")
        }
        _ => {
            info!(%endpoint, %peer, "Anonymous client");
            "hello anonymous\n".to_string()
        }
    };

    if let Err(e) = tls.write_all(summary.as_bytes()).await {
        debug!(%endpoint, %peer, error = %e, "Write failed");
    }
    let _ = tls.shutdown().await;
}
