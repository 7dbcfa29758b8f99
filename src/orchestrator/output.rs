//! Shared console output.
//!
//! Every run writes into its own buffer. When the run completes its buffer
//! is flushed here in a single locked write, so output of concurrent runs
//! appears as contiguous blocks and never interleaves line by line.
//!
//! The write is blocking. On a multi-threaded runtime [`OutputMux::write_block`]
//! moves the worker's other tasks elsewhere while it holds the lock.

use std::io::{self, Write};
use std::sync::Mutex;

use tokio::runtime::{Handle, RuntimeFlavor};

pub struct OutputMux {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl OutputMux {
    /// Multiplexer writing to the process's standard output.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn new<W: Write + Send + 'static>(sink: W) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
        }
    }

    /// Writes one run's captured output as a single block.
    pub fn flush(&self, block: &[u8]) -> io::Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        let mut sink = self
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sink.write_all(block)?;
        sink.flush()
    }

    /// [`flush`](Self::flush) from async code.
    ///
    /// Uses `block_in_place` on a multi-threaded runtime. Current-thread
    /// runtimes cannot give up their only worker, so the write happens inline.
    pub fn write_block(&self, block: &[u8]) -> io::Result<()> {
        match Handle::try_current().map(|handle| handle.runtime_flavor()) {
            Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| self.flush(block)),
            _ => self.flush(block),
        }
    }
}

impl Default for OutputMux {
    fn default() -> Self {
        Self::stdout()
    }
}
