use std::path::PathBuf;

use anyhow::Context;
use tokio::{fs::File, io::AsyncReadExt};

use crate::producer::{Producer, Transfer};

/// Default transfer size in bytes (1 MiB).
pub const DEFAULT_TRANSFER_SIZE: usize = 1024 * 1024;

const MIN_TRANSFER_SIZE: usize = 1024;

/// Concatenates files, in order, onto the sinks.
pub struct FileProducer {
    paths: Vec<PathBuf>,
    current: usize,
    file: Option<File>,
    buffer: Vec<u8>,
    total_size: u64,
}

impl FileProducer {
    pub fn new<I, P>(paths: I, transfer_size: usize) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let paths: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        // Missing files count as empty here; opening them fails later.
        let total_size = paths
            .iter()
            .filter_map(|path| std::fs::metadata(path).ok())
            .map(|metadata| metadata.len())
            .sum();
        Self {
            paths,
            current: 0,
            file: None,
            buffer: vec![0; transfer_size.max(MIN_TRANSFER_SIZE)],
            total_size,
        }
    }

    /// Sum of the input sizes when the producer was built.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Every 5% of the total below 100 MB, every 1% above.
    pub fn progress_interval(&self) -> u64 {
        if self.total_size < 100_000_000 {
            self.total_size / 20
        } else {
            self.total_size / 100
        }
    }

    pub fn transfer_size(&self) -> usize {
        self.buffer.len()
    }
}

impl Producer for FileProducer {
    async fn initialize(&mut self) -> anyhow::Result<()> {
        self.file = None;
        self.current = 0;
        Ok(())
    }

    async fn produce_more(&mut self, transfer: &mut Transfer<'_>) -> anyhow::Result<()> {
        loop {
            let Some(path) = self.paths.get(self.current) else {
                log::debug!("end of input files, {} bytes", transfer.total_in());
                transfer.close();
                return Ok(());
            };

            let file = match self.file.as_mut() {
                Some(file) => file,
                None => {
                    let file = File::open(path)
                        .await
                        .with_context(|| format!("error opening {}", path.display()))?;
                    self.file.insert(file)
                }
            };

            let mut count = self.buffer.len();
            if let Some(remaining) = transfer.remaining() {
                count = count.min(usize::try_from(remaining).unwrap_or(usize::MAX));
            }
            if count == 0 {
                return Ok(());
            }

            let read = file
                .read(&mut self.buffer[..count])
                .await
                .with_context(|| format!("error reading {}", path.display()))?;
            if read == 0 {
                self.file = None;
                self.current += 1;
                continue;
            }

            if !transfer.write(&self.buffer[..read]) {
                anyhow::bail!("no sink accepted data from {}", path.display());
            }
            return Ok(());
        }
    }

    fn finalize(&mut self, _success: bool) {
        self.file = None;
    }
}

#[cfg(test)]
#[path = "file_test.rs"]
mod file_test;
