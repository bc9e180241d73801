//! Guest terminal backed by the process's standard streams.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use guestbox_runtime::{OutputStream, ServiceResult};

/// Where guest terminal I/O goes.
#[async_trait]
pub trait Terminal: Send + Sync {
    async fn write(&self, stream: OutputStream, bytes: Bytes) -> ServiceResult<()>;

    /// Read up to `max` bytes. Empty means end of input.
    async fn read(&self, max: usize) -> ServiceResult<Bytes>;
}

pub struct StdioTerminal {
    stdin: Mutex<tokio::io::Stdin>,
}

impl StdioTerminal {
    pub fn new() -> Self {
        Self {
            stdin: Mutex::new(tokio::io::stdin()),
        }
    }
}

impl Default for StdioTerminal {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Terminal for StdioTerminal {
    async fn write(&self, stream: OutputStream, bytes: Bytes) -> ServiceResult<()> {
        match stream {
            OutputStream::Stdout => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
            OutputStream::Stderr => {
                let mut stderr = tokio::io::stderr();
                stderr.write_all(&bytes).await?;
                stderr.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&self, max: usize) -> ServiceResult<Bytes> {
        let mut buf = vec![0u8; max];
        let n = self.stdin.lock().await.read(&mut buf).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}
