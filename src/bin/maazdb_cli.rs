use std::{error::Error, fs, io, path::PathBuf, process, sync::Arc, time::Duration};

use clap::Parser;
use log::debug;
use maazdb::{ClientConfig, ClientError, Input, MaazDB, prompt, protocol::TlsOptions};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server host name or address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Server port
    #[arg(long, default_value_t = 8888)]
    port: u16,
    #[arg(long, default_value = "admin")]
    user: String,
    #[arg(long)]
    password: String,
    /// Seconds to wait for each query result
    #[arg(long, default_value_t = 30)]
    timeout: u64,
    /// Connect over TLS
    #[arg(long)]
    tls: bool,
    /// PEM certificate to trust instead of the bundled web roots
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::default().with_query_timeout(Duration::from_secs(cli.timeout));
    if cli.tls {
        let options = match &cli.ca_cert {
            Some(path) => TlsOptions::from_pem(&fs::read(path)?)?,
            None => TlsOptions::webpki_roots(),
        };
        config = config.with_tls(options);
    }
    let db = Arc::new(MaazDB::connect_with(
        config,
        &cli.host,
        cli.port,
        &cli.user,
        &cli.password,
    )?);
    println!("connected to {}:{} as {}", cli.host, cli.port, cli.user);

    let handler_db = Arc::clone(&db);
    ctrlc::set_handler(move || {
        debug!("interrupted; closing connection");
        handler_db.close();
        process::exit(130);
    })?;

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        let input = match prompt(stdin.lock(), &mut stdout) {
            Ok(input) => input,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let text = match input {
            Input::Exit => break,
            Input::Empty => continue,
            Input::Statement(text) => text,
        };

        match db.query(&text) {
            Ok(result) => println!("{result}"),
            Err(ClientError::ConnectionClosed) => {
                eprintln!("connection closed by server");
                break;
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }

    db.close();
    Ok(())
}
