//! wire format between a client and `hive serve`
//!
//! every message is one frame: a 4-byte big-endian length followed by that
//! many bytes of CBOR. archives travel as a run of raw frames ended by an
//! empty frame.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::ops::{Operation, Outcome};
use crate::transport::archive::{ArchiveRequest, ImportSummary};

/// largest frame either side accepts
pub const MAX_FRAME: usize = 64 << 20;

/// payload size of archive chunks
pub const CHUNK_SIZE: usize = 256 << 10;

/// client to server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// select a store of the server's registry
    Open { store: String },
    Execute(Operation),
    /// an archive follows as chunks
    Upload,
    Download(ArchiveRequest),
    Quit,
}

/// server to client
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ready,
    Outcome(Outcome),
    Imported(ImportSummary),
    /// an archive of `size` bytes follows as chunks
    Archive { size: u64 },
    Failed { kind: ErrorKind, message: String },
}

impl Response {
    pub fn failed(err: &Error) -> Self {
        Response::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

fn wire(e: io::Error) -> Error {
    Error::transport(format!("connection: {}", e))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME {
        return Err(Error::transport(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .map_err(wire)?;
    writer.write_all(payload).map_err(wire)
}

/// next frame, or `None` when the peer closed the connection between frames
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(wire(e)),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME {
        return Err(Error::transport(format!(
            "peer announced a frame of {} bytes",
            len
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(wire)?;
    Ok(Some(payload))
}

/// encode and send one message
pub fn send<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)?;
    write_frame(writer, &buf)?;
    writer.flush().map_err(wire)
}

/// receive one message, `None` on a clean disconnect
pub fn receive<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    match read_frame(reader)? {
        Some(frame) => ciborium::from_reader(&frame[..])
            .map(Some)
            .map_err(|e| Error::transport(format!("undecodable message: {}", e))),
        None => Ok(None),
    }
}

/// receive a message that must be there
pub fn expect<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    receive(reader)?.ok_or_else(|| Error::transport("connection closed by peer"))
}

/// copy `source` to the peer as chunks plus the closing empty frame
pub fn send_stream<W: Write, R: Read>(writer: &mut W, source: &mut R) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::transport(format!("reading archive: {}", e))),
        };
        write_frame(writer, &buf[..n])?;
        total += n as u64;
    }
    write_frame(writer, &[])?;
    writer.flush().map_err(wire)?;
    Ok(total)
}

/// write incoming chunks to `sink` until the closing empty frame
pub fn receive_stream<R: Read, W: Write>(reader: &mut R, sink: &mut W) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let chunk = read_frame(reader)?
            .ok_or_else(|| Error::transport("connection closed inside an archive"))?;
        if chunk.is_empty() {
            break;
        }
        sink.write_all(&chunk)
            .map_err(|e| Error::transport(format!("writing archive: {}", e)))?;
        total += chunk.len() as u64;
    }
    sink.flush()
        .map_err(|e| Error::transport(format!("writing archive: {}", e)))?;
    Ok(total)
}
