//! Command channel - serialized, newline-terminated writes onto the server's stdin.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

pub type CommandSink = Box<dyn AsyncWrite + Send + Unpin>;

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("command channel is closed")]
    Closed,
    #[error("broken pipe: the server process is no longer reading commands")]
    BrokenPipe,
    #[error("command write did not complete within {0:?}")]
    Timeout(Duration),
    #[error("failed to write command: {0}")]
    Io(#[source] io::Error),
}

/// Writer handle onto the child's input stream.
///
/// Clones share the same sink; the mutex keeps concurrent commands from
/// interleaving, so each write lands as one complete line. A write that does
/// not finish (error, timeout or cancellation) closes the channel, so a torn
/// line is never followed by another command.
#[derive(Clone)]
pub struct CommandChannel {
    sink: Arc<Mutex<Option<CommandSink>>>,
    write_timeout: Duration,
}

impl CommandChannel {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Some(Box::new(writer)))),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// A channel with no writer; every write fails with `Closed`.
    pub fn closed() -> Self {
        Self {
            sink: Arc::new(Mutex::new(None)),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Write one command line and flush it, waiting at most the write timeout.
    pub async fn write(&self, line: &str) -> Result<(), ChannelError> {
        let mut data = String::with_capacity(line.len() + 1);
        data.push_str(line);
        if !data.ends_with('\n') {
            data.push('\n');
        }

        match tokio::time::timeout(self.write_timeout, self.write_exclusive(data.as_bytes())).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "Server input did not accept a command within {:?}; channel closed",
                    self.write_timeout
                );
                Err(ChannelError::Timeout(self.write_timeout))
            }
        }
    }

    async fn write_exclusive(&self, data: &[u8]) -> Result<(), ChannelError> {
        let mut guard = self.sink.lock().await;
        // 쓰는 동안 sink를 꺼내 둠. 중간에 취소되면 sink가 drop되어 채널이 닫힘
        let mut sink = guard.take().ok_or(ChannelError::Closed)?;
        match write_line(&mut sink, data).await {
            Ok(()) => {
                *guard = Some(sink);
                Ok(())
            }
            // 프로세스가 stdin을 닫음. 이후 쓰기는 Closed
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(ChannelError::BrokenPipe),
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    /// Drop the writer. The child sees end-of-file on its input.
    pub async fn close(&self) {
        let sink = match tokio::time::timeout(self.write_timeout, self.sink.lock()).await {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(mut sink) = sink {
            let _ = tokio::time::timeout(self.write_timeout, sink.shutdown()).await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.sink.lock().await.is_none()
    }
}

async fn write_line(sink: &mut CommandSink, data: &[u8]) -> io::Result<()> {
    sink.write_all(data).await?;
    sink.flush().await
}
