use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::*;

use crate::byte_stream::WriteHalf;
use crate::link::{Direction, LinkHandle};
use crate::thread::{current_name, spawn_thread};

/// Why a relay direction stopped.
#[derive(Debug)]
pub enum Termination {
    /// the source closed its side in order
    Eof,
    /// read or write failed, including a cut of the link
    Failed(io::Error),
}

/// Reports the termination of a relay to its link when dropped, so the link
/// hears about it exactly once, panics included.
struct DoneGuard {
    link: LinkHandle,
    direction: Direction,
    termination: Option<Termination>,
}

impl DoneGuard {
    fn new(link: LinkHandle, direction: Direction) -> Self {
        Self {
            link,
            direction,
            termination: None,
        }
    }
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let termination = self.termination.take().unwrap_or_else(|| {
            Termination::Failed(io::Error::new(io::ErrorKind::Other, "relay aborted"))
        });
        self.link.done(self.direction, termination);
    }
}

/// Spawn a thread relaying `src` to `dst` for one direction of a link.
///
/// * `traffic`
///    Incremented by the number of bytes written to `dst`.
/// * `buffer_size`
///    Upper bound on a single read.
pub fn spawn_relay_half(
    direction: Direction,
    link: LinkHandle,
    mut src: Box<dyn io::Read + Send>,
    mut dst: Box<dyn WriteHalf>,
    traffic: Arc<AtomicU64>,
    buffer_size: usize,
) -> io::Result<JoinHandle<()>> {
    let name = format!("{}-{:x}", direction, link.id().0);
    spawn_thread(name, move || {
        let mut guard = DoneGuard::new(link, direction);
        let termination = relay_half(&mut *src, &mut *dst, &traffic, buffer_size);
        guard.termination = Some(termination);
    })
}

/// Copy `src` to `dst` until end of stream or an error.
///
/// End of stream is passed on as a half-close of `dst`.
pub fn relay_half<R, W>(
    src: &mut R,
    dst: &mut W,
    traffic: &AtomicU64,
    buffer_size: usize,
) -> Termination
where
    R: io::Read + ?Sized,
    W: WriteHalf + ?Sized,
{
    let name = current_name();
    let mut buf = vec![0; buffer_size];
    debug!("spawned relay: {}", name);
    loop {
        let size = match src.read(&mut buf) {
            Ok(0) => {
                if let Err(err) = dst.shutdown_write() {
                    debug!("{}: half-close: {}", name, err);
                }
                return Termination::Eof;
            }
            Ok(size) => size,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Termination::Failed(err),
        };
        if let Err(err) = dst.write_all(&buf[..size]) {
            return Termination::Failed(err);
        }
        traffic.fetch_add(size as u64, Ordering::Relaxed);
        trace!("{}: {} bytes", name, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream::test::{BufferStream, ErrorStream, IterBuffer};
    use std::io::Read;

    /// fails once with `Interrupted` before every chunk
    struct Interrupting<R> {
        inner: R,
        interrupt: bool,
    }

    impl<R: Read> Read for Interrupting<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                Err(io::ErrorKind::Interrupted.into())
            } else {
                self.inner.read(buf)
            }
        }
    }

    #[test]
    fn relay_until_eof() {
        let mut src = IterBuffer::new(
            vec![b"hello".to_vec(), b" ".to_vec(), b"client".to_vec()].into_iter(),
            io::Cursor::new(vec![]),
        );
        let mut dst = BufferStream::new();
        let traffic = AtomicU64::new(0);

        let termination = relay_half(&mut src, &mut dst, &traffic, 64);
        assert!(matches!(termination, Termination::Eof));
        assert_eq!(dst.written(), b"hello client".to_vec());
        assert!(dst.is_write_closed());
        assert_eq!(traffic.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn relay_in_small_chunks() {
        let payload: Vec<u8> = (0..=255).cycle().take(10_000).collect();
        let mut src = io::Cursor::new(payload.clone());
        let mut dst = BufferStream::new();
        let traffic = AtomicU64::new(0);

        let termination = relay_half(&mut src, &mut dst, &traffic, 7);
        assert!(matches!(termination, Termination::Eof));
        assert_eq!(dst.written(), payload);
        assert_eq!(traffic.load(Ordering::SeqCst), 10_000);
    }

    #[test]
    fn retry_interrupted_read() {
        let mut src = Interrupting {
            inner: io::Cursor::new(b"abc".to_vec()),
            interrupt: false,
        };
        let mut dst = BufferStream::new();
        let termination = relay_half(&mut src, &mut dst, &AtomicU64::new(0), 2);
        assert!(matches!(termination, Termination::Eof));
        assert_eq!(dst.written(), b"abc".to_vec());
    }

    #[test]
    fn read_error_stops_relay() {
        let mut dst = BufferStream::new();
        let termination = relay_half(&mut ErrorStream, &mut dst, &AtomicU64::new(0), 16);
        match termination {
            Termination::Failed(err) => assert_eq!(err.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(dst.written().is_empty());
        // an abrupt end is not forwarded as an orderly close
        assert!(!dst.is_write_closed());
    }

    #[test]
    fn write_error_stops_relay() {
        let mut src = io::Cursor::new(b"never arrives".to_vec());
        let traffic = AtomicU64::new(0);
        let termination = relay_half(&mut src, &mut ErrorStream, &traffic, 16);
        assert!(matches!(termination, Termination::Failed(_)));
        assert_eq!(traffic.load(Ordering::SeqCst), 0);
    }
}
