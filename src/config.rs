use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;
use crate::target::Target;

pub const DEFAULT_LISTEN_PORT: u16 = 6789;
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub listen_ip: IpAddr,
    /// `0` binds an ephemeral port on the first plug; replugs reuse it
    pub listen_port: u16,
    /// candidates tried in order for every accepted connection
    pub targets: Vec<Target>,
    pub connect_timeout: Option<Duration>,
    /// accept poll interval; bounds how long `unplug` waits for the listener
    pub accept_timeout: Option<Duration>,
    pub buffer_size: usize,
    pub nodelay: bool,
    pub start_unplugged: bool,
    pub shutdown_timeout: Option<Duration>,
}

/// On-disk form of [`ForwarderConfig`]. Durations are in milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    listen_ip: Option<IpAddr>,
    listen_port: Option<u16>,
    targets: Vec<Target>,
    connect_timeout_ms: Option<u64>,
    accept_timeout_ms: Option<u64>,
    buffer_size: Option<usize>,
    nodelay: Option<bool>,
    start_unplugged: Option<bool>,
    shutdown_timeout_ms: Option<u64>,
}

impl ForwarderConfig {
    pub fn new(listen_ip: IpAddr, listen_port: u16, targets: Vec<Target>) -> Self {
        Self {
            listen_ip,
            listen_port,
            targets,
            ..Self::default()
        }
    }

    pub fn with_file(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let conf: ConfigFile = serde_yaml::from_reader(file)
            .map_err(|err| Error::config_fmt(format_args!("{}: {}", path.display(), err)))?;
        Ok(conf.into_config())
    }

    pub fn from_yaml(s: &str) -> Result<Self, Error> {
        let conf: ConfigFile =
            serde_yaml::from_str(s).map_err(|err| Error::config_fmt(format_args!("{}", err)))?;
        Ok(conf.into_config())
    }
}

impl ConfigFile {
    fn into_config(self) -> ForwarderConfig {
        let default = ForwarderConfig::default();
        ForwarderConfig {
            listen_ip: self.listen_ip.unwrap_or(default.listen_ip),
            listen_port: self.listen_port.unwrap_or(default.listen_port),
            targets: self.targets,
            connect_timeout: self
                .connect_timeout_ms
                .map(Duration::from_millis)
                .or(default.connect_timeout),
            accept_timeout: self
                .accept_timeout_ms
                .map(Duration::from_millis)
                .or(default.accept_timeout),
            buffer_size: self.buffer_size.unwrap_or(default.buffer_size),
            nodelay: self.nodelay.unwrap_or(default.nodelay),
            start_unplugged: self.start_unplugged.unwrap_or(default.start_unplugged),
            shutdown_timeout: self
                .shutdown_timeout_ms
                .map(Duration::from_millis)
                .or(default.shutdown_timeout),
        }
    }
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            listen_ip: Ipv4Addr::new(0, 0, 0, 0).into(),
            listen_port: DEFAULT_LISTEN_PORT,
            targets: vec![],
            connect_timeout: Some(Duration::from_secs(5)),
            accept_timeout: Some(Duration::from_millis(250)),
            buffer_size: DEFAULT_BUFFER_SIZE,
            nodelay: true,
            start_unplugged: false,
            shutdown_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl ForwarderConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    /// Check everything that does not need the network.
    pub fn validate(&self) -> Result<(), Error> {
        if self.targets.is_empty() {
            return Err(Error::NoTarget);
        }
        if self.buffer_size == 0 {
            return Err(Error::config_fmt(format_args!("buffer_size must be positive")));
        }
        // `None` means no timeout; zero would fail every connect or spin the accept loop
        let timeouts = [
            ("connect_timeout", self.connect_timeout),
            ("accept_timeout", self.accept_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ];
        for (name, timeout) in timeouts {
            if timeout == Some(Duration::ZERO) {
                return Err(Error::config_fmt(format_args!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn add_target(&mut self, target: Target) -> &mut Self {
        self.targets.push(target);
        self
    }

    pub fn set_connect_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.connect_timeout = dur;
        self
    }

    pub fn set_accept_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.accept_timeout = dur;
        self
    }

    pub fn set_buffer_size(&mut self, size: usize) -> &mut Self {
        self.buffer_size = size;
        self
    }

    pub fn set_nodelay(&mut self, nodelay: bool) -> &mut Self {
        self.nodelay = nodelay;
        self
    }

    pub fn set_start_unplugged(&mut self, unplugged: bool) -> &mut Self {
        self.start_unplugged = unplugged;
        self
    }

    pub fn set_shutdown_timeout(&mut self, dur: Option<Duration>) -> &mut Self {
        self.shutdown_timeout = dur;
        self
    }
}
