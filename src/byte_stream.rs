use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::ops::Deref;
use std::time::Duration;

use socket2::SockRef;

use crate::error::Error;

/// write side of a split stream
pub trait WriteHalf: io::Write + Send {
    /// Propagate an orderly close to the peer (half-close).
    fn shutdown_write(&mut self) -> io::Result<()>;
}

/// Handle that forcibly closes a stream from another thread.
pub trait Sever: fmt::Debug + Send + Sync {
    /// Close both directions, waking up any blocked reader or writer.
    fn sever(&self) -> io::Result<()>;
}

/// read/write operations on byte stream
pub trait ByteStream: fmt::Debug + io::Read + io::Write + Send {
    #[allow(clippy::type_complexity)]
    fn split(&self) -> Result<(Box<dyn io::Read + Send>, Box<dyn WriteHalf>), Error>;
    fn severer(&self) -> Result<Box<dyn Sever>, Error>;
}

impl WriteHalf for TcpStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}

impl Sever for TcpStream {
    fn sever(&self) -> io::Result<()> {
        // zero linger: the peer sees a reset once the last descriptor closes
        SockRef::from(self).set_linger(Some(Duration::from_secs(0)))?;
        self.shutdown(Shutdown::Both)
    }
}

/// byte stream on tcp connection
impl ByteStream for TcpStream {
    #[allow(clippy::type_complexity)]
    fn split(&self) -> Result<(Box<dyn io::Read + Send>, Box<dyn WriteHalf>), Error> {
        let rd = self.try_clone()?;
        let wr = self.try_clone()?;
        Ok((Box::new(rd), Box::new(wr)))
    }

    fn severer(&self) -> Result<Box<dyn Sever>, Error> {
        Ok(Box::new(self.try_clone()?))
    }
}

/// Boxed stream
impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    #[allow(clippy::type_complexity)]
    fn split(&self) -> Result<(Box<dyn io::Read + Send>, Box<dyn WriteHalf>), Error> {
        self.deref().split()
    }

    fn severer(&self) -> Result<Box<dyn Sever>, Error> {
        self.deref().severer()
    }
}
