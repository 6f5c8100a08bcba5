//! Unix socket connection to the daemon.
//!
//! Writes go through an in-memory buffer drained with non blocking writes, so a slow
//! daemon never stalls the sampler. Replies are consumed by a reader task on the client
//! runtime.

use std::{
    io::{self, Write},
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Handle,
    task::JoinHandle,
};

use crate::{
    rate_limit::RateLimitedLog,
    wire::{Command, CommandSink},
};

pub const DEFAULT_LOW_WATERMARK: usize = 4096 * 1024;
pub const DEFAULT_HIGH_WATERMARK: usize = 8192 * 1024;

/// Prefix of the replies reporting a failed command.
const ERROR_RESPONSE: &str = "-1";

/// Buffer sizes between which writability flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATERMARK,
            high: DEFAULT_HIGH_WATERMARK,
        }
    }
}

impl Watermarks {
    /// Writability once `pending` bytes are buffered. Becomes false above the high mark
    /// and true again only below the low mark.
    pub fn writable(&self, writable: bool, pending: usize) -> bool {
        if writable {
            pending <= self.high
        } else {
            pending < self.low
        }
    }

    /// Whether the room left before the high mark is under a tenth of it.
    pub fn should_flush(&self, pending: usize) -> bool {
        self.high.saturating_sub(pending) < self.high / 10
    }
}

/// Replies received from the daemon since the last connection.
#[derive(Debug, Default)]
pub struct ResponseCounters {
    successes: AtomicU64,
    errors: AtomicU64,
}

static ERROR_RESPONSES: RateLimitedLog = RateLimitedLog::new(Duration::from_secs(5));

impl ResponseCounters {
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.successes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn record(&self, line: &str) {
        if line.starts_with(ERROR_RESPONSE) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            if ERROR_RESPONSES.should_log() {
                log::warn!("Collectd err: {line}");
            }
        } else {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

pub struct Transport {
    socket_path: PathBuf,
    handle: Handle,
    stream: Option<UnixStream>,
    reader: Option<JoinHandle<()>>,
    buffer: Vec<u8>,
    watermarks: Watermarks,
    writable: bool,
    counters: Arc<ResponseCounters>,
    connected: Arc<AtomicBool>,
    not_connected: RateLimitedLog,
    closed: RateLimitedLog,
    queue_full: RateLimitedLog,
}

impl Transport {
    /// The reader task is spawned on `handle` and records replies in `counters`.
    pub fn new(
        socket_path: &Path,
        watermarks: Watermarks,
        counters: Arc<ResponseCounters>,
        handle: Handle,
    ) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
            handle,
            stream: None,
            reader: None,
            buffer: Vec::new(),
            watermarks,
            writable: true,
            counters,
            connected: Arc::default(),
            not_connected: RateLimitedLog::new(Duration::from_secs(60)),
            closed: RateLimitedLog::new(Duration::from_secs(60)),
            queue_full: RateLimitedLog::new(Duration::from_secs(30)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn counters(&self) -> Arc<ResponseCounters> {
        self.counters.clone()
    }

    /// Connection status readable without locking the transport.
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Connects unless already connected.
    pub fn connect(&mut self) -> io::Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let stream = UnixStream::connect(&self.socket_path)?;
        self.attach(stream)?;
        log::info!("Connected to collectd at {}", self.socket_path.display());
        Ok(())
    }

    pub(crate) fn attach(&mut self, stream: UnixStream) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let reader = stream.try_clone()?;
        let reader = {
            let _guard = self.handle.enter();
            tokio::net::UnixStream::from_std(reader)?
        };

        self.counters.reset();
        self.buffer.clear();
        self.writable = true;
        if let Some(previous) = self.reader.take() {
            previous.abort();
        }
        self.reader = Some(self.handle.spawn(read_responses(reader, self.counters.clone())));
        self.stream = Some(stream);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Flushes what can be written without blocking and drops the connection.
    pub fn close(&mut self) {
        if self.stream.is_some() {
            self.flush();
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.connected.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.buffer.clear();
        self.writable = true;
    }

    fn disconnect(&mut self, err: &io::Error) {
        if self.closed.should_log() {
            log::warn!("Connection to collectd closed: {err}");
        }
        self.stream = None;
        self.connected.store(false, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.buffer.clear();
        self.writable = true;
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl CommandSink for Transport {
    fn send(&mut self, command: Command) -> bool {
        if self.stream.is_none() {
            if self.not_connected.should_log() {
                log::warn!("Connection to collectd not established");
            }
            return false;
        }

        if !self.writable {
            self.flush();
        }
        if !self.writable {
            if self.queue_full.should_log() {
                log::info!("Write queue full, dropping metrics");
            }
            return false;
        }

        if self.watermarks.should_flush(self.buffer.len()) {
            self.flush();
        }
        if self.stream.is_none() {
            return false;
        }
        self.buffer.extend_from_slice(command.encode().as_bytes());
        self.writable = self.watermarks.writable(self.writable, self.buffer.len());
        true
    }

    fn flush(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut written = 0;
        let result = loop {
            if written == self.buffer.len() {
                break Ok(());
            }
            match stream.write(&self.buffer[written..]) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.buffer.drain(..written);

        match result {
            Ok(()) => self.writable = self.watermarks.writable(self.writable, self.buffer.len()),
            Err(err) => self.disconnect(&err),
        }
    }
}

async fn read_responses(stream: tokio::net::UnixStream, counters: Arc<ResponseCounters>) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => counters.record(&line),
            Ok(None) => break,
            Err(err) => {
                log::debug!("Error reading collectd responses: {err}");
                break;
            }
        }
    }
}
