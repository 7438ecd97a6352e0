//! This crate provides a TCP relay that can be unplugged and plugged again,
//! for simulating backend outages in front of a real service.
//!
//! # Feature
//! ## Relay
//!
//! Every accepted connection is paired with a connection to the first
//! reachable target, and bytes are copied in both directions by one thread
//! per direction. Payloads are opaque: no protocol is inspected or altered.
//!
//! An orderly close on one side is passed on as a half-close to the other
//! side. A reset or an I/O error ends the whole session.
//!
//! ## Unplug / Plug
//!
//! `unplug` closes the listening socket, so new clients are refused, and
//! severs every active session. `plug` listens again on the same port.
//!
//! ## Failover
//!
//! Targets are tried in the configured order for each new connection.
//!
//! # Usage
//!
//! ```rust
//! use std::io::{Read, Write};
//! use std::net::{TcpListener, TcpStream};
//! use std::thread;
//! use std::time::Duration;
//! use tcpforwarder::*;
//!
//! // a one-shot echo service
//! let service = TcpListener::bind("127.0.0.1:0").unwrap();
//! let target = service.local_addr().unwrap();
//! thread::spawn(move || {
//!     let (mut strm, _) = service.accept().unwrap();
//!     let mut rd = strm.try_clone().unwrap();
//!     std::io::copy(&mut rd, &mut strm).ok();
//! });
//!
//! let config = ForwarderConfig::new("127.0.0.1".parse().unwrap(), 0, vec![target.into()]);
//! let forwarder = Forwarder::start(config).unwrap();
//! let addr = forwarder.local_addr().unwrap();
//!
//! let mut client = TcpStream::connect(addr).unwrap();
//! client.write_all(b"hello").unwrap();
//! let mut buf = [0; 5];
//! client.read_exact(&mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! assert_eq!(forwarder.active_links(), 1);
//!
//! forwarder.unplug().unwrap();
//! assert!(!forwarder.is_plugged());
//! assert!(forwarder.wait_drained(Some(Duration::from_secs(5))));
//! ```
//!
//! ## Daemon
//!
//! `tcpforwarderd` wraps [`Forwarder::serve`]; `SIGUSR1` unplugs, `SIGUSR2`
//! plugs and `SIGTERM` terminates.

pub mod acceptor;
pub mod byte_stream;
pub mod config;
pub mod connector;
pub mod error;
pub mod link;
pub mod relay;
pub mod server;
pub mod server_command;
mod target;
mod tcp_listener_ext;
mod thread;

pub use config::*;
pub use error::Error;
pub use link::{LinkId, LinkInfo, LinkState};
pub use server::*;
pub use server_command::*;
pub use target::Target;
