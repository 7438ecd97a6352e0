use std::fmt;
use std::net::SocketAddr;
use std::sync;

use thiserror::Error;

use crate::target::Target;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {}", message)]
    Config { message: String },
    #[error("invalid target: {}", target)]
    InvalidTarget { target: String },
    #[error("no target configured")]
    NoTarget,
    #[error("target not resolved: {}", target)]
    TargetUnresolved { target: Target },
    #[error("address already in use: {}", addr)]
    AddressAlreadyInUse { addr: SocketAddr },
    #[error("address not available: {}", addr)]
    AddressNotAvailable { addr: SocketAddr },
    /// rejected by the target host
    #[error("connection refused: {}", target)]
    ConnectionRefused { target: Target },
    /// every configured target failed
    #[error("all targets unreachable: {} attempt(s)", attempts)]
    Unreachable { attempts: usize },
    /// dialing abandoned because the forwarder is unplugging
    #[error("unplugged")]
    Unplugged,
    #[error("poisoned error: {}", _0)]
    Poisoned(String),
}

impl Error {
    pub fn config_fmt(message: fmt::Arguments) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    pub fn invalid_target<S: Into<String>>(target: S) -> Self {
        Self::InvalidTarget {
            target: target.into(),
        }
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(error: sync::PoisonError<T>) -> Self {
        Error::Poisoned(format!("{:?}", error))
    }
}
