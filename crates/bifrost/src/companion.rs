//! Companion side of the bridge - runs inside the companion process.
//!
//! The host side (spawning, monitoring) lives in supervisor.rs and monitor.rs.
//! This module reads dispatch frames from stdin, hands each script to a
//! [`ScriptHandler`], and reports completion on stdout:
//!
//! - stdin: [`FrameCodec`] frames carrying a [`DispatchRequest`]
//! - stdout: newline-delimited log text and JSON messages, ending every script
//!   with `{"type":"done"}`
//!
//! A handler error is reported as an `error` message and still followed by the
//! completion marker, so the host never waits on a failed script.

use std::pin::Pin;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::FramedRead;

use crate::bridge::codec::{FrameCodec, FrameError};
use crate::bridge::protocol::{CompanionMessage, DispatchRequest};

/// Executes dispatched scripts inside the companion.
#[async_trait::async_trait]
pub trait ScriptHandler: Send + Sync {
    async fn execute(&self, script: &str, output: &CompanionWriter) -> Result<(), String>;
}

/// Line writer for the companion's stdout, shared between the serve loop and handlers.
pub struct CompanionWriter {
    inner: Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
}

impl CompanionWriter {
    pub fn new(writer: impl AsyncWrite + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Box::pin(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    /// Write one line of plain text. Embedded newlines split into several lines.
    pub async fn line(&self, text: &str) -> std::io::Result<()> {
        let mut writer = self.inner.lock().await;
        for line in text.lines() {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await
    }

    pub async fn message(&self, msg: &CompanionMessage) -> std::io::Result<()> {
        let json = serde_json::to_string(msg)?;
        self.line(&json).await
    }

    pub async fn done(&self) -> std::io::Result<()> {
        self.message(&CompanionMessage::done()).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    #[error("failed to read dispatch frame: {0}")]
    Frame(#[from] FrameError),

    #[error("failed to write to host: {0}")]
    Output(#[from] std::io::Error),
}

/// Serve dispatches from `input` until the host closes it.
pub async fn serve<R, H>(
    input: R,
    output: &CompanionWriter,
    handler: &H,
) -> Result<(), CompanionError>
where
    R: AsyncRead + Unpin,
    H: ScriptHandler + ?Sized,
{
    let mut frames = FramedRead::new(input, FrameCodec::<DispatchRequest>::new());
    let mut served = 0u64;

    while let Some(frame) = frames.next().await {
        let request = frame?;
        served += 1;
        tracing::debug!(run = served, script_bytes = request.script.len(), "Executing script");

        if let Err(error) = handler.execute(&request.script, output).await {
            tracing::warn!(run = served, %error, "Script failed");
            output
                .message(&CompanionMessage::new("error").with_field("message", error))
                .await?;
        }
        output.done().await?;
    }

    tracing::debug!(runs = served, "Host closed dispatch stream");
    Ok(())
}
