//! A pluggable TCP relay
//!
//! tcpforwarderd relays a local port to the first reachable target and can be
//! unplugged (`SIGUSR1`) and plugged again (`SIGUSR2`) while it runs.
//!
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::*;

use tcpforwarder as tf;

#[derive(Parser, Debug)]
#[command(name = "tcpforwarderd", version, about)]
struct Opt {
    /// Set path to config file (format: yaml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Set ipaddress to listen on
    #[arg(short = 'i', long = "listen-ip")]
    listen_ip: Option<IpAddr>,

    /// Set port to listen on
    #[arg(short = 'p', long = "listen-port")]
    listen_port: Option<u16>,

    /// Add a target (host:port); repeat for failover, tried in order
    #[arg(short = 't', long = "target")]
    targets: Vec<tf::Target>,

    /// Timeout for connecting to a target in milliseconds
    #[arg(long = "connect-timeout-ms")]
    connect_timeout_ms: Option<u64>,

    /// Do not accept connections until SIGUSR2 is received
    #[arg(long = "start-unplugged")]
    start_unplugged: bool,
}

impl Opt {
    fn into_config(self) -> anyhow::Result<tf::ForwarderConfig> {
        let mut config = match self.config {
            Some(ref path) => tf::ForwarderConfig::with_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => tf::ForwarderConfig::default(),
        };
        if let Some(ip) = self.listen_ip {
            config.listen_ip = ip;
        }
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if !self.targets.is_empty() {
            // targets on the command line replace the file's list
            config.targets = self.targets;
        }
        if let Some(ms) = self.connect_timeout_ms {
            config.set_connect_timeout(Some(Duration::from_millis(ms)));
        }
        if self.start_unplugged {
            config.set_start_unplugged(true);
        }
        Ok(config)
    }
}

fn command_for(signal: i32) -> Option<tf::ForwarderCommand> {
    use signal_hook::consts::signal::*;
    use tf::ForwarderCommand::*;
    match signal {
        SIGTERM | SIGINT | SIGQUIT => Some(Terminate),
        SIGUSR1 => Some(Unplug),
        SIGUSR2 => Some(Plug),
        _ => None,
    }
}

fn set_handler(signals: &[i32], handler: impl Fn(i32) + Send + 'static) -> io::Result<()> {
    let mut signals = signal_hook::iterator::Signals::new(signals)?;
    std::thread::spawn(move || signals.forever().for_each(handler));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    use signal_hook::consts::signal::*;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("tcpforwarderd");
    let opt = Opt::parse();
    debug!("option: {:?}", opt);

    let config = opt.into_config()?;
    let forwarder = tf::Forwarder::new(config).context("server config")?;

    let (tx, rx) = mpsc::channel();
    set_handler(
        &[SIGTERM, SIGINT, SIGQUIT, SIGUSR1, SIGUSR2],
        move |signal| {
            if let Some(cmd) = command_for(signal) {
                tx.send(cmd).ok();
            }
        },
    )
    .context("setting signal handler")?;

    if let Err(err) = forwarder.serve(rx) {
        error!("server error: {:?}", err);
        return Err(err.into());
    }
    Ok(())
}
