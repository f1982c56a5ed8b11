//! Serialized command execution against one transport.
//!
//! The device cannot interleave commands: a second command written while a
//! response is still draining corrupts both. [`CommandQueue`] owns the
//! transport inside a dedicated task and executes submissions strictly one
//! at a time; callers get a cheap clonable handle and await their reply on
//! a oneshot.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{CamResult, CameraError, ProtocolError, TransportError};
use crate::protocol::command::{CcdCommand, CommandRequest};
use crate::transport::Transport;

struct Submission {
    request: CommandRequest,
    reply: oneshot::Sender<CamResult<Bytes>>,
}

/// Handle to the queue task. Clones share the same serialized queue.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Submission>,
}

impl CommandQueue {
    /// Spawn the queue task over an already-connected transport.
    ///
    /// The task runs until every handle is dropped, then disconnects the
    /// transport.
    pub fn spawn(transport: Box<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run_queue(transport, rx));
        Self { tx }
    }

    /// Execute one command and return its response bytes.
    ///
    /// Submissions from concurrent callers are executed in arrival order,
    /// never interleaved on the wire.
    pub async fn submit(&self, command: &CcdCommand) -> CamResult<Bytes> {
        self.submit_request(command.request()).await
    }

    /// Execute a pre-lowered request.
    pub async fn submit_request(&self, request: CommandRequest) -> CamResult<Bytes> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Submission {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| queue_gone())?;
        reply_rx.await.map_err(|_| queue_gone())?
    }
}

fn queue_gone() -> CameraError {
    TransportError::Disconnected("command queue task is gone".into()).into()
}

async fn run_queue(mut transport: Box<dyn Transport>, mut rx: mpsc::Receiver<Submission>) {
    debug!(transport = transport.name(), "command queue running");
    while let Some(submission) = rx.recv().await {
        let result = execute(transport.as_mut(), &submission.request).await;
        if let Err(err) = &result {
            warn!(transport = transport.name(), error = %err, "command failed");
        }
        // The caller may have given up waiting; nothing to do then.
        let _ = submission.reply.send(result);
    }
    if let Err(err) = transport.disconnect().await {
        warn!(transport = transport.name(), error = %err, "disconnect failed");
    }
    debug!("command queue stopped");
}

async fn execute(
    transport: &mut dyn Transport,
    request: &CommandRequest,
) -> CamResult<Bytes> {
    if !request.write.is_empty() {
        transport.write_all(&request.write).await?;
    }
    if request.response_len == 0 {
        return Ok(Bytes::new());
    }

    let mut collected = Vec::with_capacity(request.response_len);
    while collected.len() < request.response_len {
        let chunk = transport
            .read_chunk(request.response_len - collected.len())
            .await?;
        if chunk.is_empty() {
            break;
        }
        collected.extend_from_slice(&chunk);
    }
    trace!(
        expected = request.response_len,
        actual = collected.len(),
        "response collected"
    );

    if collected.len() < request.response_len && !request.allows_underrun {
        return Err(ProtocolError::LengthMismatch {
            expected: request.response_len,
            actual: collected.len(),
        }
        .into());
    }
    Ok(Bytes::from(collected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::ExposureWindow;
    use crate::protocol::FieldSelector;
    use crate::transport::sim::{SimTransport, WireEvent};
    use crate::transport::Transport as _;

    async fn spawn_sim() -> (CommandQueue, crate::transport::sim::SimHandle) {
        let mut sim = SimTransport::progressive(100, 50);
        sim.connect().await.unwrap();
        let handle = sim.handle();
        (CommandQueue::spawn(Box::new(sim)), handle)
    }

    #[tokio::test]
    async fn accumulates_chunked_responses() {
        let (queue, handle) = spawn_sim().await;
        handle.set_chunk_limit(5);
        let response = queue
            .submit(&CcdCommand::GetCcd { cam_index: 0 })
            .await
            .unwrap();
        assert_eq!(response.len(), 17);
    }

    #[tokio::test]
    async fn short_response_without_underrun_is_an_error() {
        let (queue, handle) = spawn_sim().await;
        handle.short_next_pixel_read(100);
        queue
            .submit(&CcdCommand::LatchPixels {
                field: FieldSelector::Both,
                cam_index: 0,
                window: ExposureWindow {
                    x_offset: 0,
                    y_offset: 0,
                    width: 100,
                    height: 50,
                    x_bin: 1,
                    y_bin: 1,
                },
            })
            .await
            .unwrap();
        let err = queue
            .submit(&CcdCommand::BulkRead {
                byte_len: 100 * 50 * 2,
                allows_underrun: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CameraError::Protocol(ProtocolError::LengthMismatch {
                expected: 10_000,
                actual: 9_900,
            })
        ));
    }

    #[tokio::test]
    async fn short_response_with_underrun_is_accepted() {
        let (queue, handle) = spawn_sim().await;
        handle.short_next_pixel_read(100);
        queue
            .submit(&CcdCommand::LatchPixels {
                field: FieldSelector::Both,
                cam_index: 0,
                window: ExposureWindow {
                    x_offset: 0,
                    y_offset: 0,
                    width: 100,
                    height: 50,
                    x_bin: 1,
                    y_bin: 1,
                },
            })
            .await
            .unwrap();
        let response = queue
            .submit(&CcdCommand::BulkRead {
                byte_len: 100 * 50 * 2,
                allows_underrun: true,
            })
            .await
            .unwrap();
        assert_eq!(response.len(), 9_900);
    }

    #[tokio::test]
    async fn concurrent_submissions_never_interleave() {
        let (queue, handle) = spawn_sim().await;
        handle.set_chunk_limit(3);

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                let payload = Bytes::from(vec![i; 10]);
                let response = queue
                    .submit(&CcdCommand::Echo {
                        payload: payload.clone(),
                    })
                    .await
                    .unwrap();
                assert_eq!(response, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Every command's reads complete before the next command's write.
        let mut outstanding = 0usize;
        for event in handle.events() {
            match event {
                WireEvent::Write { .. } => {
                    assert_eq!(outstanding, 0, "write issued mid-response");
                    outstanding = 10;
                }
                WireEvent::Read { len } => outstanding -= len,
            }
        }
        assert_eq!(outstanding, 0);
    }

    #[tokio::test]
    async fn transport_failure_reaches_the_caller() {
        let (queue, handle) = spawn_sim().await;
        handle.unplug();
        let err = queue
            .submit(&CcdCommand::GetFirmwareVersion)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CameraError::Transport(TransportError::Disconnected(_))
        ));
    }
}
