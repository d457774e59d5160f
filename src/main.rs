//! Security-server client gateway
//!
//! Per-client TLS authentication in front of the backend services.

use std::fs;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use chrono::DateTime;
use clap::Parser;
use tracing::{error, info, warn};

use security_server_gateway::{
    cli::{CertCommand, Cli, Command},
    config::Config,
    gateway::Gateway,
    mtls::{
        CertIdentity,
        cert_manager::{CaParams, CertGenerator, LeafCertParams, Validity, load_certs},
    },
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Cert(ref cmd)) => match run_cert_command(cmd) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("❌ {e:#}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Load the configuration and apply CLI overrides
fn load_config(cli: &Cli) -> security_server_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.http_port {
        config.server.http_port = port;
    }
    if let Some(port) = cli.https_port {
        config.server.https_port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    Ok(config)
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        http_port = config.server.http_port,
        https = config.server.tls.is_some(),
        clients = config.trust.clients.len(),
        "Starting security server gateway"
    );

    if config.metrics.enabled {
        start_metrics(&config.metrics.listen).await;
    }

    let gateway = match Gateway::new(config, cli.config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

#[cfg(feature = "metrics")]
async fn start_metrics(listen: &str) {
    let addr = match listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(listen, error = %e, "Invalid metrics listen address, metrics disabled");
            return;
        }
    };
    if let Err(e) = security_server_gateway::metrics::install_prometheus(addr).await {
        warn!(error = %e, "Metrics endpoint not started");
    }
}

#[cfg(not(feature = "metrics"))]
async fn start_metrics(_listen: &str) {
    warn!("metrics.enabled is set but the binary was built without the `metrics` feature");
}

/// Validate configuration and print the compiled trust snapshot
fn run_check_config(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };
    let snapshot = match config.trust_snapshot() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("✅ Configuration valid\n");
    println!(
        "   Listeners: http={} https={}",
        describe_port(config.server.http_port, true),
        describe_port(config.server.https_port, config.server.tls.is_some()),
    );
    println!("   Backend: {}", config.backend.url);
    println!(
        "   Validity period enforced: {}",
        snapshot.enforce_validity_period()
    );
    println!("   Clients: {}\n", snapshot.len());

    let now = chrono::Utc::now().timestamp();
    let mut clients: Vec<_> = snapshot.clients().collect();
    clients.sort_by_key(|(id, _)| id.to_string());
    for (id, trust) in clients {
        println!("  {id} [{}]", trust.policy());
        for cert in trust.trusted().iter() {
            let identity = cert.identity();
            let marker = if identity.is_valid_at(now) { " " } else { "!" };
            println!(
                "   {marker} {} (sha256 {}…) {} .. {}",
                identity.display_name,
                &identity.fingerprint[..16],
                format_ts(identity.not_before),
                format_ts(identity.not_after),
            );
        }
    }
    ExitCode::SUCCESS
}

fn describe_port(port: u16, enabled: bool) -> String {
    if enabled && port != 0 {
        port.to_string()
    } else {
        "off".to_string()
    }
}

fn format_ts(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0).map_or_else(|| ts.to_string(), |dt| dt.format("%Y-%m-%d").to_string())
}

/// Run certificate tooling commands
fn run_cert_command(cmd: &CertCommand) -> anyhow::Result<()> {
    match cmd {
        CertCommand::InitCa {
            cn,
            days,
            ca_cert,
            ca_key,
            out,
            name,
        } => {
            let params = CaParams {
                cn,
                validity: Validity::days_from_now(*days)?,
            };
            let ca = match (ca_cert, ca_key) {
                (Some(cert_path), Some(key_path)) => {
                    let ca_pem = read_to_string(cert_path)?;
                    let key_pem = read_to_string(key_path)?;
                    CertGenerator::issue_ca(&params, &ca_pem, &key_pem)?
                }
                _ => CertGenerator::init_ca(&params)?,
            };
            CertGenerator::write_to_dir(&ca, out, name)?;
            println!("✅ CA '{cn}' written to {}/{name}.crt", out.display());
        }

        CertCommand::Issue {
            cn,
            org,
            san_dns,
            days,
            ca_cert,
            ca_key,
            out,
            name,
        } => {
            let params = LeafCertParams {
                cn,
                organization: org.as_deref(),
                san_dns: san_dns.clone(),
                validity: Validity::days_from_now(*days)?,
            };
            let cert = match (ca_cert, ca_key) {
                (Some(cert_path), Some(key_path)) => {
                    let ca_pem = read_to_string(cert_path)?;
                    let key_pem = read_to_string(key_path)?;
                    CertGenerator::issue_leaf(&params, &ca_pem, &key_pem)?
                }
                _ => CertGenerator::self_signed(&params)?,
            };
            let stem = name.as_deref().unwrap_or(cn);
            CertGenerator::write_to_dir(&cert, out, stem)?;
            println!("✅ Certificate '{cn}' written to {}/{stem}.crt", out.display());
        }

        CertCommand::Inspect { file } => {
            let certs = load_certs(file)?;
            for (depth, der) in certs.iter().enumerate() {
                let identity = CertIdentity::from_der(der)
                    .with_context(|| format!("certificate {depth} in {}", file.display()))?;
                println!("[{depth}] {}", identity.display_name);
                if let Some(ref o) = identity.organization {
                    println!("    O:       {o}");
                }
                if !identity.san_dns_names.is_empty() {
                    println!("    DNS:     {}", identity.san_dns_names.join(", "));
                }
                println!("    Serial:  {}", identity.serial);
                println!("    SHA-256: {}", identity.fingerprint);
                println!(
                    "    Valid:   {} .. {}",
                    format_ts(identity.not_before),
                    format_ts(identity.not_after)
                );
            }
        }
    }
    Ok(())
}

fn read_to_string(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("Cannot read '{}'", path.display()))
}
