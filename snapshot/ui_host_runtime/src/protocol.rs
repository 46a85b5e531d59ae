use crate::patch::{PatchList, PatchOptions};
use crate::registry::NodeId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;

pub const MAIN_TO_BACKGROUND_CAP: usize = 65_536;
pub const BACKGROUND_TO_MAIN_CAP: usize = 1_048_576;

/// Messages the background side sends to the main side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum BackgroundEnvelope {
    #[serde(rename = "update_main_thread")]
    UpdateMainThread { data: PatchList, options: PatchOptions },

    #[serde(rename = "release_main_thread_value")]
    ReleaseMainThreadValue { id: i64 },

    #[serde(rename = "reload")]
    Reload { reload_version: u64 },
}

/// Messages the main side sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum MainEnvelope {
    #[serde(rename = "ready")]
    Ready { capabilities: Value },

    #[serde(rename = "context_not_found")]
    ContextNotFound { op: String, ids: Vec<NodeId> },

    #[serde(rename = "committed")]
    Committed { commit_task_id: u64 },

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

pub fn ready_envelope() -> MainEnvelope {
    MainEnvelope::Ready {
        capabilities: serde_json::json!({
            "snapshot_patch": true,
            "dev": cfg!(feature = "dev"),
            "transport": "stdio-packet-4"
        }),
    }
}

pub fn error_envelope(code: impl Into<String>, message: impl Into<String>) -> MainEnvelope {
    MainEnvelope::Error {
        code: code.into(),
        message: message.into(),
    }
}

pub fn writer_loop<T, W>(rx: Receiver<T>, writer: &mut W, max_payload: usize) -> io::Result<()>
where
    T: Serialize,
    W: Write,
{
    for envelope in rx {
        let payload = encode_envelope(&envelope)?;
        write_frame(writer, &payload, max_payload)?;
        writer.flush()?;
    }

    Ok(())
}

/// Reads frames until EOF. Undecodable payloads are handed to the callback
/// as errors; framing and I/O errors end the loop.
pub fn reader_loop<T, R, F>(
    reader: &mut R,
    max_payload: usize,
    mut on_envelope: F,
) -> io::Result<()>
where
    T: DeserializeOwned,
    R: Read,
    F: FnMut(Result<T, serde_json::Error>),
{
    loop {
        match read_frame(reader, max_payload) {
            Ok(payload) => on_envelope(serde_json::from_slice(&payload)),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

pub fn encode_envelope<T: Serialize>(envelope: &T) -> io::Result<Vec<u8>> {
    serde_json::to_vec(envelope).map_err(json_error)
}

pub fn decode_envelope<T: DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    serde_json::from_slice(payload).map_err(json_error)
}

pub fn read_frame(reader: &mut impl Read, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf)?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} > {max_payload}"),
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    if payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", payload.len(), max_payload),
        ));
    }

    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload exceeds u32"))?;

    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

fn json_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
