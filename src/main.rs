//! phonelink - browse, copy and manage certificates on a Series 40 phone

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use phonelink::certstore::{certificate_info, CertificateStore};
use phonelink::logger::{Logger, NoopLogger, TextLogger};
use phonelink::progress::TransferProgress;
use phonelink::{EntryKind, Framer, KeyUsage, ParsedCertificate, PhoneClient, SessionConfig, Transport};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "phonelink - file and certificate access for Series 40 phones over Bluetooth"
)]
struct Args {
    /// Bound RFCOMM device node, e.g. /dev/rfcomm0
    #[arg(short, long, global = true, conflicts_with = "tcp")]
    device: Option<PathBuf>,

    /// host:port of a phone emulator
    #[arg(long, global = true)]
    tcp: Option<String>,

    /// Session config file (default: <config dir>/phonelink.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hex-dump every frame to the log and list transferred files
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Append session events to this file instead of stderr
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show firmware version, date, model and IMEI
    Identify,
    /// Restart the phone
    Reboot,
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show one entry
    Stat { path: String },
    /// Download a file
    Get {
        remote: String,
        /// Local destination (default: the remote file name)
        local: Option<PathBuf>,
    },
    /// Upload a file
    Put { local: PathBuf, remote: String },
    /// Delete a file
    Rm { path: String },
    /// Copy a remote directory to a local one
    Dump {
        remote: String,
        local: PathBuf,
        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
        /// Show a progress spinner
        #[arg(short, long)]
        progress: bool,
    },
    /// List certificates registered on the phone
    Certs,
    /// Install a PEM or DER certificate
    InstallCert {
        file: PathBuf,
        /// What the phone should trust the certificate for
        #[arg(long, value_enum, value_delimiter = ',', default_value = "apps-signing")]
        usage: Vec<Usage>,
    },
    /// Print certificate digests and names without touching the phone
    CertInfo { file: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Usage {
    AppsSigning,
    CrossCertification,
    ServerAuthentic,
}

impl From<Usage> for KeyUsage {
    fn from(u: Usage) -> Self {
        match u {
            Usage::AppsSigning => KeyUsage::APPS_SIGNING,
            Usage::CrossCertification => KeyUsage::CROSS_CERTIFICATION,
            Usage::ServerAuthentic => KeyUsage::SERVER_AUTHENTIC,
        }
    }
}

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let args = Args::parse();

    let config = match &args.config {
        Some(p) => SessionConfig::load_from(p),
        None => SessionConfig::load(),
    }
    .context("loading session config")?;

    if let Command::CertInfo { file } = &args.command {
        let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        print_certificate(&certificate_info(&bytes)?);
        return Ok(());
    }

    let logger: Arc<dyn Logger> = match &args.log_file {
        Some(p) => Arc::new(
            TextLogger::new(p, args.verbose)
                .with_context(|| format!("opening log file {}", p.display()))?,
        ),
        None if args.verbose => Arc::new(TextLogger::stderr(true)),
        None => Arc::new(NoopLogger),
    };
    let logger: Arc<dyn Logger> = match &args.command {
        Command::Dump { progress: true, .. } => Arc::new(TransferProgress::new(true, logger)),
        _ => logger,
    };

    let transport = open_transport(&args)?;
    let framer = Framer::new(transport)
        .with_policy(config.idle_policy())
        .with_logger(logger.clone());
    let mut client = PhoneClient::connect(framer).context("phone handshake failed")?;

    if let Command::Reboot = args.command {
        return client.reboot().context("rebooting phone");
    }
    run(&args, &config, &mut client, logger)?;
    client.close().context("closing connection")?;
    Ok(())
}

#[cfg(unix)]
fn open_transport(args: &Args) -> Result<Box<dyn Transport>> {
    use phonelink::transport::fd::FdTransport;
    match (&args.device, &args.tcp) {
        (Some(dev), _) => Ok(Box::new(
            FdTransport::open_device(dev).with_context(|| format!("opening {}", dev.display()))?,
        )),
        (None, Some(addr)) => Ok(Box::new(
            FdTransport::connect_tcp(addr).with_context(|| format!("connecting to {}", addr))?,
        )),
        (None, None) => bail!("either --device or --tcp is required"),
    }
}

#[cfg(not(unix))]
fn open_transport(_args: &Args) -> Result<Box<dyn Transport>> {
    bail!("serial and TCP transports are only available on Unix-like systems")
}

fn run(
    args: &Args,
    config: &SessionConfig,
    client: &mut PhoneClient<Box<dyn Transport>>,
    logger: Arc<dyn Logger>,
) -> Result<()> {
    match &args.command {
        Command::Identify => {
            let info = client.device_info().clone();
            let imei = client.imei().context("reading IMEI")?;
            println!("Model:    {}", info.phone_model);
            println!("Firmware: {} ({})", info.firmware_version, info.firmware_date);
            println!("IMEI:     {}", imei);
        }
        Command::Ls { path } => {
            for e in client.list_directory(path)? {
                let stamp = e
                    .modified_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".repeat(19));
                let marker = if e.kind == EntryKind::Directory { "d" } else { "-" };
                println!("{} {:>10} {} {}", marker, e.size_bytes, stamp, e.name);
            }
        }
        Command::Stat { path } => {
            let e = client.stat_entry(path)?;
            println!("{}: {} of {} bytes, modified {:?}", path, e.kind, e.size_bytes, e.modified_at);
        }
        Command::Get { remote, local } => {
            let dest = match local {
                Some(p) => p.clone(),
                None => PathBuf::from(
                    remote
                        .rsplit('/')
                        .next()
                        .filter(|n| !n.is_empty())
                        .ok_or_else(|| anyhow!("cannot derive a file name from {}", remote))?,
                ),
            };
            let bytes = client
                .download_file(remote, &dest)
                .with_context(|| format!("downloading {}", remote))?;
            println!("{} -> {} ({} bytes)", remote, dest.display(), bytes);
        }
        Command::Put { local, remote } => {
            let bytes = client
                .upload_file(remote, local)
                .with_context(|| format!("uploading {}", local.display()))?;
            println!("{} -> {} ({} bytes)", local.display(), remote, bytes);
        }
        Command::Rm { path } => {
            client.delete_file(path).with_context(|| format!("deleting {}", path))?;
        }
        Command::Dump {
            remote,
            local,
            recursive,
            ..
        } => dump(client, remote, local, *recursive, logger)?,
        Command::Certs => {
            let mut store = CertificateStore::new(client, config);
            let dir = store.list_certificates()?;
            println!("{} certificates ({:?}-endian directory)", dir.items.len(), dir.endianness);
            for item in &dir.items {
                println!("{}", item);
            }
        }
        Command::InstallCert { file, usage } => {
            let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            let usage = usage
                .iter()
                .fold(KeyUsage::empty(), |acc, u| acc | KeyUsage::from(*u));
            let mut store = CertificateStore::new(client, config);
            let cert = store.install_certificate(&bytes, usage)?;
            println!("Installed {} ({})", cert.common_name()?, usage);
        }
        Command::Reboot | Command::CertInfo { .. } => {}
    }
    Ok(())
}

fn dump(
    client: &mut PhoneClient<Box<dyn Transport>>,
    remote: &str,
    local: &Path,
    recursive: bool,
    logger: Arc<dyn Logger>,
) -> Result<()> {
    let start = Instant::now();
    let stats = client
        .dump_tree(remote, local, recursive)
        .with_context(|| format!("dumping {} to {}", remote, local.display()))?;
    let secs = start.elapsed().as_secs_f64();
    logger.done(stats.files, stats.bytes, secs);
    println!(
        "{} files, {} directories, {} bytes in {:.1}s",
        stats.files, stats.directories, stats.bytes, secs
    );
    std::io::stdout().flush().ok();
    Ok(())
}

fn print_certificate(cert: &ParsedCertificate) {
    println!("Subject:      {}", cert.subject);
    println!("Issuer:       {}", cert.issuer);
    println!("Key size:     {} bits", cert.modulus_bits);
    println!("Fingerprint:  {}", hex::encode(cert.fingerprint));
    println!("Modulus hash: {}", hex::encode(cert.modulus_hash));
    println!("Subject hash: {}", hex::encode(cert.subject_hash));
    println!("Issuer hash:  {}", hex::encode(cert.issuer_hash));
}
