use std::{error::Error, fs, net::SocketAddr, path::PathBuf};

use clap::Parser;
use maazdb::{
    protocol::{load_certificates, load_private_key, server_config},
    server::MockServer,
};

#[derive(Debug, Parser)]
#[command(version, about = "In-memory mock MaazDB server", long_about = None)]
struct Cli {
    /// Listen for new connection at address
    #[arg(default_value = "127.0.0.1:8888")]
    address: SocketAddr,
    /// User accepted by the handshake
    #[arg(long, default_value = "admin")]
    user: String,
    #[arg(long, default_value = "admin")]
    password: String,
    /// Number of connections served at once; further clients are told the server is busy
    #[arg(
        long,
        default_value_t = 8,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    workers: usize,
    /// PEM certificate chain; serves TLS when given
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,
    /// PEM private key for --tls-cert
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut server = MockServer::bind(cli.address, [(cli.user, cli.password)], cli.workers)?;
    if let (Some(cert), Some(key)) = (cli.tls_cert, cli.tls_key) {
        let certificates = load_certificates(&fs::read(cert)?)?;
        let key = load_private_key(&fs::read(key)?)?;
        server = server.with_tls(server_config(certificates, key)?);
    }

    server.listen()?;
    Ok(())
}
