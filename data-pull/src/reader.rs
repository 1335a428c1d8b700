use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    file::DEFAULT_TRANSFER_SIZE,
    producer::{Producer, Transfer},
};

/// Pulls from any reader, e.g. standard input or the stdout of a
/// transcoding process. End of file closes the transfer.
pub struct ReaderProducer<R> {
    reader: R,
    buffer: Vec<u8>,
}

impl<R> ReaderProducer<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    pub fn new(reader: R, transfer_size: usize) -> Self {
        Self {
            reader,
            buffer: vec![0; transfer_size.max(1)],
        }
    }

    pub fn with_default_size(reader: R) -> Self {
        Self::new(reader, DEFAULT_TRANSFER_SIZE)
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R> Producer for ReaderProducer<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    async fn produce_more(&mut self, transfer: &mut Transfer<'_>) -> anyhow::Result<()> {
        let mut count = self.buffer.len();
        if let Some(remaining) = transfer.remaining() {
            count = count.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }
        if count == 0 {
            return Ok(());
        }

        let read = self
            .reader
            .read(&mut self.buffer[..count])
            .await
            .context("error reading input")?;
        if read == 0 {
            log::debug!("end of input, {} bytes", transfer.total_in());
            transfer.close();
            return Ok(());
        }
        if !transfer.write(&self.buffer[..read]) {
            anyhow::bail!("no sink accepted data");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "reader_test.rs"]
mod reader_test;
