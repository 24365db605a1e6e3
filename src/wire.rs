//! Wire format between the dispatcher and the processing units.
//!
//! Data flows dispatcher -> unit as a single frame per cycle:
//!
//! ```text
//! [u32 big-endian payload length][payload]
//! ```
//!
//! where the payload is a batch encoded with [`Batch::to_csv`]. The
//! only thing a unit ever sends back is the bare failure signal
//! [`FAILURE_SIGNAL`], unframed, on the same connection.

use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;

use crate::errors::Error;
use crate::errors::Result;
use crate::record::Batch;

/// Sent by a unit declaring it can't take work this cycle.
pub const FAILURE_SIGNAL: &[u8] = b"panne";

/// Refuse to allocate for frames larger than this.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Bytes kept while scanning for the failure signal before
/// unrecognized traffic is discarded.
const SCAN_LIMIT: usize = 1024;

/// Length prefix for a payload of `len` bytes, if a receiver would
/// accept it.
fn frame_len(len: usize) -> Result<u32> {
    if len > MAX_FRAME_LEN {
        return Err(Error::Frame(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    u32::try_from(len).map_err(|_| Error::Frame(format!("frame of {len} bytes too large")))
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8]) -> Result<()> {
    let len = frame_len(payload.len())?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_frame(reader: &mut impl Read) -> Result<Vec<u8>> {
    try_read_frame(reader)?
        .ok_or_else(|| Error::Frame("connection closed before a frame".to_string()))
}

/// Like [`read_frame`], but a connection closed cleanly before the
/// length prefix yields `None`.
pub fn try_read_frame(reader: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    let mut filled = 0;
    while filled < len_bytes.len() {
        match reader.read(&mut len_bytes[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(Error::Frame(format!(
                    "connection closed after {filled} bytes of length prefix"
                )))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(Error::Frame(format!("reading length prefix: {err}"))),
        }
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    frame_len(len)?;
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|err| Error::Frame(format!("reading {len} byte payload: {err}")))?;
    Ok(Some(payload))
}

/// Encode and send a batch as one frame. Returns the payload length.
pub fn send_batch(writer: &mut impl Write, batch: &Batch) -> Result<usize> {
    let payload = batch.to_csv()?;
    write_frame(writer, &payload)?;
    Ok(payload.len())
}

/// Receive one frame and return its raw payload with the decoded
/// batch, or `None` if the sender closed without sending one.
///
/// The raw payload is what a unit derives the batch identity from.
pub fn recv_batch(reader: &mut impl Read) -> Result<Option<(Vec<u8>, Batch)>> {
    let Some(payload) = try_read_frame(reader)? else {
        return Ok(None);
    };
    let batch = Batch::from_csv(&payload)
        .map_err(|err| Error::Frame(format!("payload is not a batch: {err}")))?;
    Ok(Some((payload, batch)))
}

pub fn send_failure_signal(writer: &mut impl Write) -> Result<()> {
    writer.write_all(FAILURE_SIGNAL)?;
    writer.flush()?;
    Ok(())
}

/// Accumulates bytes read from a unit and reports when the failure
/// signal has arrived.
///
/// TCP may split the signal over several reads, so the check is over
/// everything received so far rather than each read.
#[derive(Debug, Default)]
pub struct SignalScanner {
    buf: Vec<u8>,
}

impl SignalScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the signal has been seen.
    pub fn feed(&mut self, bytes: &[u8]) -> bool {
        self.buf.extend_from_slice(bytes);
        if self
            .buf
            .windows(FAILURE_SIGNAL.len())
            .any(|w| w == FAILURE_SIGNAL)
        {
            return true;
        }
        if self.buf.len() > SCAN_LIMIT {
            tracing::warn!(
                bytes = self.buf.len(),
                "Discarding unrecognized traffic from unit"
            );
            // Keep a tail in case the signal straddles the cut.
            let keep = self.buf.len() - (FAILURE_SIGNAL.len() - 1);
            self.buf.drain(..keep);
        }
        false
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }
}

#[test]
fn frame_is_length_prefixed_big_endian() {
    let mut out = Vec::new();
    write_frame(&mut out, b"abc").unwrap();
    assert_eq!(out, vec![0, 0, 0, 3, b'a', b'b', b'c']);

    let payload = read_frame(&mut out.as_slice()).unwrap();
    assert_eq!(payload, b"abc");
}

#[test]
fn truncated_frame_is_an_error() {
    let bytes = [0u8, 0, 0, 10, b'x'];
    assert!(matches!(
        read_frame(&mut bytes.as_slice()),
        Err(Error::Frame(_))
    ));
}

#[test]
fn oversized_frame_is_refused_before_allocating() {
    let bytes = u32::MAX.to_be_bytes();
    let err = read_frame(&mut bytes.as_slice()).unwrap_err();
    assert!(err.to_string().contains("exceeds limit"), "got: {err}");
}

#[test]
fn batch_survives_the_wire() {
    let batch = Batch::new(vec![crate::record::reading("123456", "3.2 kWh")]);
    let mut out = Vec::new();
    let sent = send_batch(&mut out, &batch).unwrap();
    assert_eq!(sent + 4, out.len());

    let (payload, received) = recv_batch(&mut out.as_slice()).unwrap().unwrap();
    assert_eq!(payload.len(), sent);
    assert_eq!(received.records(), batch.records());
}

#[test]
fn scanner_finds_split_signal() {
    let mut scanner = SignalScanner::new();
    assert!(!scanner.feed(b"pa"));
    assert!(scanner.feed(b"nne"));
}

#[test]
fn scanner_ignores_other_traffic() {
    let mut scanner = SignalScanner::new();
    assert!(!scanner.feed(b"hello"));
    assert!(!scanner.feed(&[b'x'; 2048]));
    assert!(scanner.buffered().len() < 2048);
    assert!(scanner.feed(FAILURE_SIGNAL));
}

#[test]
fn clean_close_is_not_a_frame() {
    let empty: &[u8] = &[];
    assert!(recv_batch(&mut &*empty).unwrap().is_none());
    assert!(matches!(read_frame(&mut &*empty), Err(Error::Frame(_))));

    let partial: &[u8] = &[0, 0];
    assert!(matches!(try_read_frame(&mut &*partial), Err(Error::Frame(_))));
}

#[test]
fn writer_refuses_frames_the_reader_would_refuse() {
    assert_eq!(frame_len(MAX_FRAME_LEN).unwrap() as usize, MAX_FRAME_LEN);
    assert!(matches!(frame_len(MAX_FRAME_LEN + 1), Err(Error::Frame(_))));

    let payload = vec![0u8; MAX_FRAME_LEN + 1];
    let mut out = Vec::new();
    let err = write_frame(&mut out, &payload).unwrap_err();
    assert!(err.to_string().contains("exceeds limit"), "got: {err}");
    assert!(out.is_empty());
}
