//! Bounded byte streams connecting pipeline stages.
//!
//! A stream carries chunks and an explicit end marker. A reader that sees
//! the writer disappear without the end marker reports `UnexpectedEof`
//! instead of a clean EOF, so a downstream stage can never mistake a dead
//! producer for a finished one.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

enum Chunk {
    Data(Vec<u8>),
    End,
}

/// Shared cancellation flag for every stage of one pipeline.
///
/// Cancellation surfaces as `ConnectionAborted`, never `Interrupted`, which
/// `std::io` helpers would silently retry.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> io::Result<()> {
        if self.is_cancelled() {
            Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "pipeline cancelled",
            ))
        } else {
            Ok(())
        }
    }
}

/// Create a stream holding at most `capacity` in-flight chunks.
pub fn stream(capacity: usize, cancel: CancelToken) -> (StreamWriter, StreamReader) {
    let (tx, rx) = sync_channel(capacity);
    (
        StreamWriter {
            tx,
            cancel: cancel.clone(),
        },
        StreamReader {
            rx,
            cancel,
            pending: Vec::new(),
            pos: 0,
            done: false,
        },
    )
}

pub struct StreamWriter {
    tx: SyncSender<Chunk>,
    cancel: CancelToken,
}

impl StreamWriter {
    /// Mark the stream complete. Dropping without calling this signals failure.
    pub fn finish(self) -> io::Result<()> {
        self.cancel.check()?;
        self.tx.send(Chunk::End).map_err(|_| downstream_gone())
    }
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cancel.check()?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(Chunk::Data(buf.to_vec()))
            .map_err(|_| downstream_gone())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct StreamReader {
    rx: Receiver<Chunk>,
    cancel: CancelToken,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.pending.len() {
            if self.done {
                return Ok(0);
            }
            self.cancel.check()?;
            match self.rx.recv() {
                Ok(Chunk::Data(data)) => {
                    self.pending = data;
                    self.pos = 0;
                }
                Ok(Chunk::End) => self.done = true,
                Err(_) => return Err(upstream_gone()),
            }
        }

        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn downstream_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "downstream stage stopped reading")
}

fn upstream_gone() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "upstream stage ended without completing the stream",
    )
}

/// Errors a stage reports only because a neighbouring stage failed first.
pub(crate) fn is_knock_on(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_bytes_arrive_in_order() {
        let (mut w, mut r) = stream(2, CancelToken::default());
        let producer = thread::spawn(move || {
            for i in 0..100u8 {
                w.write_all(&[i; 10]).unwrap();
            }
            w.finish().unwrap();
        });

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        producer.join().unwrap();

        let expected: Vec<u8> = (0..100u8).flat_map(|i| [i; 10]).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_dropped_writer_is_not_eof() {
        let (mut w, mut r) = stream(4, CancelToken::default());
        w.write_all(b"partial").unwrap();
        drop(w);

        let mut out = Vec::new();
        let err = r.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(out, b"partial");
    }

    #[test]
    fn test_dropped_reader_breaks_writer() {
        let (mut w, r) = stream(1, CancelToken::default());
        drop(r);
        let err = w.write_all(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(is_knock_on(&err));
    }

    #[test]
    fn test_cancel_stops_writer() {
        let cancel = CancelToken::default();
        let (mut w, _r) = stream(1, cancel.clone());
        cancel.cancel();
        assert_eq!(
            w.write(b"x").unwrap_err().kind(),
            io::ErrorKind::ConnectionAborted
        );
    }
}
