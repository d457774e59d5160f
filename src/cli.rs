//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Security-server client gateway - per-client TLS authentication
#[derive(Parser, Debug)]
#[command(name = "ssgw")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "SSGW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Plain HTTP port
    #[arg(long, env = "SSGW_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// HTTPS port
    #[arg(long, env = "SSGW_HTTPS_PORT")]
    pub https_port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "SSGW_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "SSGW_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "SSGW_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load the configuration, compile the trust snapshot and print it
    CheckConfig,

    /// Certificate tooling
    #[command(subcommand)]
    Cert(CertCommand),
}

/// Certificate subcommands
#[derive(Subcommand, Debug)]
pub enum CertCommand {
    /// Create a CA for issuing information-system certificates
    InitCa {
        /// CA common name
        #[arg(long, default_value = "Security Server Test CA")]
        cn: String,

        /// Validity in days
        #[arg(long, default_value_t = 3650)]
        days: u32,

        /// Parent CA certificate; makes an intermediate, self-signed when omitted
        #[arg(long, requires = "ca_key")]
        ca_cert: Option<PathBuf>,

        /// Parent CA private key
        #[arg(long, requires = "ca_cert")]
        ca_key: Option<PathBuf>,

        /// Output directory (writes `<name>.crt` and `<name>.key`)
        #[arg(long, default_value = "certs")]
        out: PathBuf,

        /// Output file stem
        #[arg(long, default_value = "ca")]
        name: String,
    },

    /// Issue a client (or, with `--san`, server) certificate
    Issue {
        /// Common name
        #[arg(long)]
        cn: String,

        /// Organisation
        #[arg(long)]
        org: Option<String>,

        /// DNS subject alternative names (makes a server certificate)
        #[arg(long = "san")]
        san_dns: Vec<String>,

        /// Validity in days
        #[arg(long, default_value_t = 365)]
        days: u32,

        /// Issuing CA certificate; self-signed when omitted
        #[arg(long, requires = "ca_key")]
        ca_cert: Option<PathBuf>,

        /// Issuing CA private key
        #[arg(long, requires = "ca_cert")]
        ca_key: Option<PathBuf>,

        /// Output directory
        #[arg(long, default_value = "certs")]
        out: PathBuf,

        /// Output file stem (defaults to the common name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Print identity and validity of a PEM certificate file
    Inspect {
        /// Certificate file
        #[arg(required = true)]
        file: PathBuf,
    },
}
