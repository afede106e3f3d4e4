//! Non-blocking log sink.
//!
//! Request tasks must never stall on log I/O contention, so the subscriber
//! writes through a single-consumer channel: `write` hands the formatted
//! bytes to a dedicated drain thread and returns immediately. During
//! shutdown the channel may already be closed; such sends are dropped.

use std::io;
use std::sync::mpsc;
use std::thread;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Channel-backed writer handed to `tracing_subscriber::fmt`.
#[derive(Clone)]
pub struct AsyncLogWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl AsyncLogWriter {
    /// Create a writer draining to stdout on a dedicated thread.
    pub fn stdout() -> Self {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();

        thread::Builder::new()
            .name("log-drain".into())
            .spawn(move || {
                let stdout = io::stdout();
                for message in rx {
                    let mut out = stdout.lock();
                    let _ = io::Write::write_all(&mut out, &message);
                }
            })
            .expect("failed to spawn log drain thread");

        Self { tx }
    }
}

impl io::Write for AsyncLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Receiver gone means we are shutting down; drop the line.
        let _ = self.tx.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for AsyncLogWriter {
    type Writer = AsyncLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `enable_debug` from the configuration
/// picks between `debug` and `info`.
pub fn init(enable_debug: bool) {
    let default_level = if enable_debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(AsyncLogWriter::stdout()))
        .init();
}
