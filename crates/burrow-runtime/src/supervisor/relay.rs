//! Per-direction byte relays between the host and the child.
//!
//! A relay holds at most one read's worth of bytes. It is only refilled once
//! everything read before has been written out, so a slow reader on one
//! side throttles the other side instead of losing data.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::BorrowedFd;

use burrow_common::constants::{INTERRUPT_BYTE, INTERRUPT_REPEAT, RELAY_BUFFER_SIZE};

/// Outcome of one read or write on a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// This many bytes moved.
    Moved(usize),
    /// The other end is gone: end of input, or a reader that closed.
    Closed,
    /// Nothing could move right now; poll again.
    Retry,
}

/// A fixed-size buffer with a pending byte count.
#[derive(Debug)]
pub struct Relay {
    buf: Box<[u8]>,
    pending: usize,
}

impl Default for Relay {
    fn default() -> Self {
        Self::with_capacity(RELAY_BUFFER_SIZE)
    }
}

impl Relay {
    /// Creates a relay moving at most `capacity` bytes per read.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            pending: 0,
        }
    }

    /// True when every byte read has been written out.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Bytes read but not written yet.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.pending]
    }

    /// Drops whatever is pending.
    pub const fn clear(&mut self) {
        self.pending = 0;
    }

    /// Performs one read from `src` into the empty buffer.
    ///
    /// Returns [`Transfer::Retry`] without reading while bytes are pending.
    ///
    /// # Errors
    ///
    /// Returns any read error other than a would-block, an interruption or
    /// the `EIO` a pseudo-terminal master reports once the child side has
    /// closed.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> std::io::Result<Transfer> {
        if !self.is_empty() {
            return Ok(Transfer::Retry);
        }
        match src.read(&mut self.buf) {
            Ok(0) => Ok(Transfer::Closed),
            Ok(n) => {
                self.pending = n;
                Ok(Transfer::Moved(n))
            }
            Err(e) => classify(e),
        }
    }

    /// Performs one write of the pending bytes into `dst`, keeping whatever
    /// it did not accept at the front of the buffer.
    ///
    /// # Errors
    ///
    /// Returns any write error other than a would-block, an interruption,
    /// a closed reader or a closed pseudo-terminal.
    pub fn flush_into<W: Write>(&mut self, dst: &mut W) -> std::io::Result<Transfer> {
        if self.is_empty() {
            return Ok(Transfer::Moved(0));
        }
        match dst.write(&self.buf[..self.pending]) {
            Ok(0) => Ok(Transfer::Retry),
            Ok(n) => {
                self.buf.copy_within(n..self.pending, 0);
                self.pending -= n;
                Ok(Transfer::Moved(n))
            }
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(Transfer::Closed),
            Err(e) => classify(e),
        }
    }
}

fn classify(e: std::io::Error) -> std::io::Result<Transfer> {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => Ok(Transfer::Retry),
        _ if e.raw_os_error() == Some(libc::EIO) => Ok(Transfer::Closed),
        _ => Err(e),
    }
}

/// Watches host input for [`INTERRUPT_REPEAT`] consecutive
/// [`INTERRUPT_BYTE`]s, across read boundaries.
#[derive(Debug, Default)]
pub struct InterruptDetector {
    run: usize,
}

impl InterruptDetector {
    /// Feeds freshly read host input; true once the sequence is complete.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        for &b in bytes {
            if b == INTERRUPT_BYTE {
                self.run += 1;
                if self.run >= INTERRUPT_REPEAT {
                    return true;
                }
            } else {
                self.run = 0;
            }
        }
        false
    }
}

/// Unbuffered [`Read`]/[`Write`] over a borrowed descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FdStream<'fd>(pub BorrowedFd<'fd>);

impl Read for FdStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::read(self.0, buf)?)
    }
}

impl Write for FdStream<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(nix::unistd::write(self.0, buf)?)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `limit` bytes per write and refuses every other call.
    struct Throttled {
        out: Vec<u8>,
        limit: usize,
        calls: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn throttled_writer_receives_every_byte_in_order() {
        let input: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut src = std::io::Cursor::new(input.clone());
        let mut dst = Throttled {
            out: Vec::new(),
            limit: 7,
            calls: 0,
        };
        let mut relay = Relay::with_capacity(64);

        loop {
            if relay.is_empty() && relay.fill_from(&mut src).expect("read") == Transfer::Closed {
                break;
            }
            let _ = relay.flush_into(&mut dst).expect("write");
        }
        assert_eq!(dst.out, input);
    }

    #[test]
    fn no_refill_while_pending() {
        let mut relay = Relay::with_capacity(4);
        let mut src = std::io::Cursor::new(b"abcdefgh".to_vec());
        assert_eq!(relay.fill_from(&mut src).expect("read"), Transfer::Moved(4));
        assert_eq!(relay.fill_from(&mut src).expect("read"), Transfer::Retry);
        assert_eq!(relay.pending(), b"abcd");
    }

    #[test]
    fn partial_write_keeps_the_tail() {
        let mut relay = Relay::with_capacity(8);
        let _ = relay
            .fill_from(&mut std::io::Cursor::new(b"hello".to_vec()))
            .expect("read");
        let mut dst = Throttled {
            out: Vec::new(),
            limit: 2,
            calls: 0,
        };
        assert_eq!(relay.flush_into(&mut dst).expect("write"), Transfer::Moved(2));
        assert_eq!(relay.pending(), b"llo");
        assert_eq!(relay.flush_into(&mut dst).expect("write"), Transfer::Retry);
        assert_eq!(relay.pending(), b"llo");
    }

    #[test]
    fn broken_pipe_closes_the_direction() {
        struct Gone;
        impl Write for Gone {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let mut relay = Relay::with_capacity(8);
        let _ = relay
            .fill_from(&mut std::io::Cursor::new(b"x".to_vec()))
            .expect("read");
        assert_eq!(relay.flush_into(&mut Gone).expect("write"), Transfer::Closed);
    }

    #[test]
    fn interrupt_sequence_spans_reads() {
        let mut detector = InterruptDetector::default();
        assert!(!detector.feed(b"ls\x1d"));
        assert!(!detector.feed(b"\x1d"));
        assert!(detector.feed(b"\x1d"));
    }

    #[test]
    fn interrupt_needs_consecutive_bytes() {
        let mut detector = InterruptDetector::default();
        assert!(!detector.feed(b"\x1d\x1da\x1d\x1d"));
        assert!(detector.feed(b"\x1d"));
    }

    #[test]
    fn fd_stream_moves_bytes_through_a_pipe() {
        use std::os::fd::AsFd;

        let (reader, writer) = nix::unistd::pipe().expect("pipe");
        let n = FdStream(writer.as_fd()).write(b"ping").expect("write");
        assert_eq!(n, 4);
        let mut buf = [0u8; 8];
        let n = FdStream(reader.as_fd()).read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"ping");
    }
}
