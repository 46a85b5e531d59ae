pub mod background;
pub mod backend;
pub mod encoder;
pub mod error;
pub mod gesture;
pub mod main_thread_value;
pub mod main_tree;
pub mod patch;
pub mod patch_apply;
pub mod protocol;
pub mod refs;
pub mod registry;
pub mod scheduler;
pub mod snapshot;
pub mod worklet_ref;

use crate::error::{ApplyError, HostError, RefError};
use crate::protocol::{error_envelope, reader_loop, ready_envelope, writer_loop};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;

pub use crate::backend::{ElementHandle, MemoryBackend, UiBackend};
pub use crate::main_tree::MainTree;
pub use crate::patch_apply::{MainThreadContext, apply_snapshot_patch};
pub use crate::protocol::{
    BACKGROUND_TO_MAIN_CAP, BackgroundEnvelope, MAIN_TO_BACKGROUND_CAP, MainEnvelope,
};
pub use crate::snapshot::SnapshotDefinitions;
pub use serde_json;

const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;
const OUTBOUND_QUEUE_CAP_ENV: &str = "SNAPSHOT_HOST_OUTBOUND_QUEUE_CAP";
const DEFINITIONS_ENV: &str = "SNAPSHOT_HOST_DEFINITIONS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub outbound_queue_cap: usize,
    pub definitions_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            outbound_queue_cap: DEFAULT_OUTBOUND_QUEUE_CAP,
            definitions_path: None,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self {
            outbound_queue_cap: parse_outbound_queue_capacity(
                std::env::var(OUTBOUND_QUEUE_CAP_ENV).ok(),
            ),
            definitions_path: std::env::var_os(DEFINITIONS_ENV)
                .filter(|raw| !raw.is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn load_definitions(&self) -> Result<SnapshotDefinitions, HostError> {
        match &self.definitions_path {
            Some(path) => {
                let definitions = SnapshotDefinitions::load(path)?;
                log::info!(
                    "loaded {} snapshot definition(s) from {}",
                    definitions.len(),
                    path.display()
                );
                Ok(definitions)
            }
            None => Ok(SnapshotDefinitions::new()),
        }
    }
}

/// Serves background envelopes from stdin and answers on stdout until EOF.
pub fn run<B: UiBackend>(
    context: &mut MainThreadContext<B>,
    config: &HostConfig,
) -> Result<(), HostError> {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    run_with_io(context, &mut reader, io::stdout(), config.outbound_queue_cap)
}

/// The calling thread reads and applies; a writer thread drains the bounded
/// outbound queue into `writer`.
pub fn run_with_io<B, R, W>(
    context: &mut MainThreadContext<B>,
    reader: &mut R,
    writer: W,
    queue_capacity: usize,
) -> Result<(), HostError>
where
    B: UiBackend,
    R: Read,
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<MainEnvelope>(queue_capacity);
    let writer_handle = thread::spawn(move || {
        let mut writer = writer;
        writer_loop(rx, &mut writer, MAIN_TO_BACKGROUND_CAP)
    });

    tx.send(ready_envelope()).map_err(|_| HostError::QueueClosed)?;

    let read_result =
        reader_loop::<BackgroundEnvelope, _, _>(reader, BACKGROUND_TO_MAIN_CAP, |decoded| {
            let envelope = match decoded {
                Ok(envelope) => envelope,
                Err(err) => {
                    log::warn!("dropping undecodable envelope: {err}");
                    let reply = error_envelope("decode_error", err.to_string());
                    enqueue_control_envelope(tx.clone(), reply, queue_capacity);
                    return;
                }
            };

            match context.handle_envelope(envelope) {
                Ok(replies) => {
                    for reply in replies {
                        enqueue_control_envelope(tx.clone(), reply, queue_capacity);
                    }
                }
                Err(err) => {
                    log::error!("failed to apply envelope: {err}");
                    let reply = error_envelope(error_code(&err), err.to_string());
                    enqueue_control_envelope(tx.clone(), reply, queue_capacity);
                }
            }
        });

    if let Err(err) = &read_result {
        log::error!("reader loop terminated with error: {err}");
    }

    drop(tx);
    match writer_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::error!("writer thread returned error: {err}"),
        Err(err) => log::error!("writer thread join failed: {err:?}"),
    }

    read_result.map_err(HostError::from)
}

/// Control replies must not be lost to a momentarily full queue; a helper
/// thread waits for room instead of blocking the apply loop.
fn enqueue_control_envelope(
    tx: SyncSender<MainEnvelope>,
    envelope: MainEnvelope,
    queue_capacity: usize,
) {
    match tx.try_send(envelope) {
        Ok(()) => {}
        Err(TrySendError::Full(envelope)) => {
            log::warn!(
                "outbound queue full (cap={queue_capacity}); waiting to enqueue control envelope"
            );
            thread::spawn(move || {
                if tx.send(envelope).is_err() {
                    log::warn!("outbound queue closed; control envelope dropped");
                }
            });
        }
        Err(TrySendError::Disconnected(envelope)) => {
            log::warn!("outbound queue closed; dropping {envelope:?}");
        }
    }
}

fn error_code(err: &ApplyError) -> &'static str {
    match err {
        ApplyError::Ref(RefError::InvalidMainThreadRef) => "invalid_main_thread_ref",
        ApplyError::Backend(_) => "patch_apply_error",
        #[cfg(feature = "dev")]
        ApplyError::DevEvaluation { .. } => "dev_evaluation_error",
    }
}

pub fn parse_outbound_queue_capacity(raw: Option<String>) -> usize {
    raw.and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAP)
}
