use std::convert::TryInto;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

pub trait TcpListenerExt {
    fn accept_timeout(&self, timeout: Option<Duration>) -> io::Result<(TcpStream, SocketAddr)>;
}

impl TcpListenerExt for TcpListener {
    /// accept(2) with timeout
    ///
    /// * `timeout`
    ///   Timeout for _accept_. If the value is `None`, wait connection indefinitely.
    ///
    /// The listener is expected to be in non-blocking mode, so a connection
    /// that is reset between `poll(2)` and `accept(2)` shows up as a
    /// timeout instead of blocking. Accepted streams are always blocking.
    fn accept_timeout(&self, timeout: Option<Duration>) -> io::Result<(TcpStream, SocketAddr)> {
        let tm = timeout.map(dur_to_millis).transpose()?.unwrap_or(-1);

        // poll has no FD_SETSIZE limit on the descriptor number
        let mut fds = [PollFd::new(self.as_raw_fd(), PollFlags::POLLIN)];
        let r = poll(&mut fds, tm).map_err(io::Error::from)?;
        let ready = fds[0]
            .revents()
            .map_or(false, |ev| ev.intersects(PollFlags::POLLIN | PollFlags::POLLERR));
        if r == 0 || !ready {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "poll accept"));
        }

        match self.accept() {
            Ok((tcp, addr)) => {
                tcp.set_nonblocking(false)?;
                Ok((tcp, addr))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "accept would block"))
            }
            Err(err) => Err(err),
        }
    }
}

/// Convert Duration to a poll(2) timeout in milliseconds, rounding up so a
/// sub-millisecond timeout still waits.
fn dur_to_millis(dur: Duration) -> io::Result<i32> {
    let millis = dur.as_micros().saturating_add(999) / 1000;
    millis.try_into().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("timeout convert error: {:?}", dur),
        )
    })
}
