//! Flushable stream wrappers over the raw transport.
//!
//! The writer is either a plain buffered writer or a snappy frame encoder
//! over one; the reader mirrors it. Phase boundaries call
//! [`StreamWriter::flush_frame`], which must push every buffered byte
//! across a frame boundary before flushing the transport, since the peer
//! blocks on a read until what we wrote is decodable on its side.

use std::io::{self, BufReader, BufWriter, Read, Write};

use snap::read::FrameDecoder;
use snap::write::FrameEncoder;

/// Post-compression byte meter, observational only.
struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum WriterKind<W: Write> {
    Plain(BufWriter<W>),
    Snappy(FrameEncoder<CountingWriter<BufWriter<W>>>),
}

pub struct StreamWriter<W: Write> {
    kind: WriterKind<W>,
    raw_bytes: u64,
}

impl<W: Write> StreamWriter<W> {
    pub fn new(out: W, compressed: bool) -> Self {
        let kind = if compressed {
            WriterKind::Snappy(FrameEncoder::new(CountingWriter {
                inner: BufWriter::new(out),
                count: 0,
            }))
        } else {
            WriterKind::Plain(BufWriter::new(out))
        };
        StreamWriter { kind, raw_bytes: 0 }
    }

    /// Emit any buffered data as a complete frame and flush the
    /// transport. The snap encoder compresses its pending block on
    /// `flush`; a compressor that only flushed its inner writer would
    /// need a finish-and-reset cycle here instead.
    pub fn flush_frame(&mut self) -> io::Result<()> {
        match &mut self.kind {
            WriterKind::Plain(w) => w.flush(),
            WriterKind::Snappy(enc) => enc.flush(),
        }
    }

    /// Bytes written (pre-compression, post-compression). Equal when
    /// compression is off.
    pub fn stats(&self) -> (u64, u64) {
        match &self.kind {
            WriterKind::Plain(_) => (self.raw_bytes, self.raw_bytes),
            WriterKind::Snappy(enc) => (self.raw_bytes, enc.get_ref().count),
        }
    }
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match &mut self.kind {
            WriterKind::Plain(w) => w.write(buf)?,
            WriterKind::Snappy(enc) => enc.write(buf)?,
        };
        self.raw_bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_frame()
    }
}

enum ReaderKind<R: Read> {
    Plain(BufReader<R>),
    Snappy(FrameDecoder<BufReader<R>>),
}

pub struct StreamReader<R: Read> {
    kind: ReaderKind<R>,
}

impl<R: Read> StreamReader<R> {
    pub fn new(input: R, compressed: bool) -> Self {
        let kind = if compressed {
            ReaderKind::Snappy(FrameDecoder::new(BufReader::new(input)))
        } else {
            ReaderKind::Plain(BufReader::new(input))
        };
        StreamReader { kind }
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.kind {
            ReaderKind::Plain(r) => r.read(buf),
            ReaderKind::Snappy(dec) => dec.read(buf),
        }
    }
}
