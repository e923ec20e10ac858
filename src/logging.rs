//! Log subscriber setup.
//!
//! Events are formatted by `tracing-subscriber` and written a whole line at a
//! time, either straight to the sink or through a bounded queue drained by a
//! `log-flush` thread. A full queue falls back to writing in the caller.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{Config, LOG_QUEUE_CAPACITY};
use crate::error::ServerError;
use crate::sync::lock;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Hand lines to the flush thread instead of writing inline.
    pub async_queue: bool,
    /// Append to this file; stderr otherwise.
    pub file: Option<PathBuf>,
    /// Install nothing; every log call is a no-op.
    pub disabled: bool,
}

impl From<&Config> for LogOptions {
    fn from(config: &Config) -> Self {
        Self {
            async_queue: config.async_log,
            file: config.log_file.clone(),
            disabled: config.close_log,
        }
    }
}

/// Install the global subscriber. Level filtering follows `RUST_LOG`,
/// defaulting to `info`.
pub fn init(opts: &LogOptions) -> Result<(), ServerError> {
    if opts.disabled {
        return Ok(());
    }
    let sink = match &opts.file {
        Some(path) => Sink::File(Arc::new(Mutex::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        ))),
        None => Sink::Stderr,
    };
    let writer = if opts.async_queue {
        LogWriter::queued(sink, LOG_QUEUE_CAPACITY)?
    } else {
        LogWriter::direct(sink)
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_ansi(opts.file.is_none())
                .with_thread_names(true)
                .with_writer(writer),
        )
        .try_init()?;
    Ok(())
}

#[derive(Debug, Clone)]
enum Sink {
    Stderr,
    File(Arc<Mutex<File>>),
}

impl Sink {
    fn write_line(&self, line: &[u8]) {
        // Nowhere left to report a failing log sink.
        let _ = match self {
            Sink::Stderr => io::stderr().lock().write_all(line),
            Sink::File(file) => lock(file).write_all(line),
        };
    }
}

/// `MakeWriter` handing out one [`LineBuffer`] per event.
#[derive(Debug, Clone)]
pub struct LogWriter {
    sink: Sink,
    queue: Option<SyncSender<Vec<u8>>>,
}

impl LogWriter {
    fn direct(sink: Sink) -> Self {
        Self { sink, queue: None }
    }

    fn queued(sink: Sink, capacity: usize) -> io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let flush_sink = sink.clone();
        thread::Builder::new()
            .name("log-flush".into())
            .spawn(move || flush_lines(&rx, &flush_sink))?;
        Ok(Self {
            sink,
            queue: Some(tx),
        })
    }

    fn submit(&self, line: Vec<u8>) {
        let Some(queue) = &self.queue else {
            self.sink.write_line(&line);
            return;
        };
        match queue.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(line)) | Err(TrySendError::Disconnected(line)) => {
                self.sink.write_line(&line);
            }
        }
    }
}

fn flush_lines(rx: &Receiver<Vec<u8>>, sink: &Sink) {
    for line in rx {
        sink.write_line(&line);
    }
}

impl<'a> MakeWriter<'a> for LogWriter {
    type Writer = LineBuffer<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LineBuffer {
            buf: Vec::with_capacity(256),
            writer: self,
        }
    }
}

/// Collects one formatted event; submitted as a unit on drop.
pub struct LineBuffer<'a> {
    buf: Vec<u8>,
    writer: &'a LogWriter,
}

impl Write for LineBuffer<'_> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineBuffer<'_> {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.writer.submit(std::mem::take(&mut self.buf));
        }
    }
}
