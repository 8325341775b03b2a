// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Handles writing log lines on a separate thread
//!
//! Each log file is owned by a thread receiving complete lines through a bounded queue. Callers
//! render lines on their own threads, only the queue is shared.

use log::{debug, error, info, warn};
use pingora_error::{Error, ErrorType};
use std::fs::File;
use std::io::{stdout, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::oneshot;
use tokio::task::block_in_place;

const QUEUE_CAPACITY: usize = 4096;
const BUFFER_CAPACITY: usize = 64 * 1024;

static DROPPED_LINES: AtomicU64 = AtomicU64::new(0);

/// Number of log lines dropped by all access logs of the process because they couldn't be
/// written.
pub fn dropped_lines() -> u64 {
    DROPPED_LINES.load(Ordering::Relaxed)
}

fn count_dropped(lines: u64) {
    DROPPED_LINES.fetch_add(lines, Ordering::Relaxed);
}

#[derive(Debug)]
pub(crate) enum WriterMessage {
    Line(Vec<u8>),
    Reopen,
    Flush(oneshot::Sender<()>),
}

type Output = BufWriter<Box<dyn Write + Send>>;

/// Terminates a line left incomplete by an earlier failed write, so that the next line doesn't
/// get appended to the fragment.
fn terminate_partial_line(path: &Path, file: &mut File) -> Result<(), std::io::Error> {
    let metadata = file.metadata()?;
    if !metadata.is_file() || metadata.len() == 0 {
        return Ok(());
    }

    let mut reader = File::open(path)?;
    reader.seek(SeekFrom::End(-1))?;
    let mut last = [0; 1];
    reader.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}

fn open_file(path: &Path) -> Result<Output, std::io::Error> {
    let output: Box<dyn Write + Send> = if path.as_os_str() == "-" {
        Box::new(stdout())
    } else {
        let mut file = File::options().append(true).create(true).open(path)?;
        terminate_partial_line(path, &mut file)?;
        Box::new(file)
    };
    Ok(BufWriter::with_capacity(BUFFER_CAPACITY, output))
}

struct Destination {
    path: PathBuf,
    writer: Option<Output>,
    /// Lines accepted since the last successful flush
    pending: u64,
    failing: bool,
}

impl Destination {
    fn new(path: PathBuf, writer: Option<Output>) -> Self {
        Self {
            path,
            writer,
            pending: 0,
            failing: false,
        }
    }

    fn failed(&mut self, action: &str, err: std::io::Error) {
        // Discard the buffer, dropping the writer would attempt writing it out again
        if let Some(writer) = self.writer.take() {
            let _ = writer.into_parts();
        }
        count_dropped(self.pending);
        self.pending = 0;

        if !self.failing {
            self.failing = true;
            error!(
                "Failed {action} log file {} (cause: {err}), dropping log lines until it recovers",
                self.path.display()
            );
        }
    }

    fn write_line(&mut self, line: &[u8]) {
        self.pending += 1;

        if self.writer.is_none() {
            match open_file(&self.path) {
                Ok(writer) => self.writer = Some(writer),
                Err(err) => {
                    self.failed("reopening", err);
                    return;
                }
            }
        }

        let result = match self.writer.as_mut() {
            Some(writer) => writer.write_all(line),
            None => return,
        };
        if let Err(err) = result {
            self.failed("writing to", err);
        }
    }

    fn flush(&mut self) {
        let result = match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => return,
        };
        match result {
            Ok(()) => {
                self.pending = 0;
                if self.failing {
                    self.failing = false;
                    info!("Writing to log file {} resumed", self.path.display());
                }
            }
            Err(err) => self.failed("flushing", err),
        }
    }

    fn reopen(&mut self) {
        self.flush();
        self.writer = None;
        debug!("Log file {} will be reopened", self.path.display());
    }

    fn handle(&mut self, message: WriterMessage) {
        match message {
            WriterMessage::Line(line) => self.write_line(&line),
            WriterMessage::Reopen => self.reopen(),
            WriterMessage::Flush(done) => {
                self.flush();
                let _ = done.send(());
            }
        }
    }
}

fn log_writer(mut destination: Destination, mut receiver: Receiver<WriterMessage>) {
    while let Some(message) = receiver.blocking_recv() {
        destination.handle(message);

        // Write out everything queued up, then flush once
        while let Ok(message) = receiver.try_recv() {
            destination.handle(message);
        }
        destination.flush();
    }

    debug!("Writer for log file {} stopped", destination.path.display());
}

/// A log file written to by a dedicated thread
///
/// Lines are written in the order they are queued, a line is never interleaved with another.
/// The file is kept open until [`LogFile::reopen`] is called, after that it is opened again
/// when the next line is written. A file renamed by log rotation will be recreated then.
///
/// Lines that couldn't be written are counted by [`dropped_lines`]. This includes lines still
/// buffered when flushing fails. If a failed write left an incomplete line in the file, it is
/// terminated when the file is opened again.
///
/// The thread stops once the last reference to the `LogFile` is dropped.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    sender: Sender<WriterMessage>,
    congested: AtomicBool,
}

impl LogFile {
    /// Opens or creates a log file for appending and starts its writer thread.
    ///
    /// The special path `-` writes to standard output.
    pub(crate) fn open(path: PathBuf) -> Result<Self, Box<Error>> {
        let writer = open_file(&path).map_err(|err| {
            Error::because(
                ErrorType::FileCreateError,
                format!("failed opening log file {}", path.display()),
                err,
            )
        })?;

        let (sender, receiver) = channel(QUEUE_CAPACITY);
        let destination = Destination::new(path.clone(), Some(writer));
        thread::Builder::new()
            .name("access-log-writer".to_owned())
            .spawn(move || log_writer(destination, receiver))
            .map_err(|err| {
                Error::because(
                    ErrorType::InternalError,
                    "failed starting log writer thread",
                    err,
                )
            })?;

        debug!("Opened log file {}", path.display());
        Ok(Self {
            path,
            sender,
            congested: AtomicBool::new(false),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer_gone(&self) {
        count_dropped(1);
        error!(
            "Failed logging to {}, writer thread crashed?",
            self.path.display()
        );
    }

    /// Queues a complete line (including its terminator) for writing.
    ///
    /// If the queue is full, this waits for the writer. This includes threads of a
    /// multi-threaded Tokio runtime, its workers are blocked via [`block_in_place`]. Only on a
    /// current-thread runtime waiting is impossible, there the line is dropped with a warning.
    /// Use [`crate::AccessLog::log_async`] in that case.
    pub(crate) fn write_line(&self, line: Vec<u8>) {
        let message = match self.sender.try_send(WriterMessage::Line(line)) {
            Ok(()) => {
                if self.congested.load(Ordering::Relaxed) {
                    self.congested.store(false, Ordering::Relaxed);
                }
                return;
            }
            Err(TrySendError::Full(message)) => message,
            Err(TrySendError::Closed(_)) => {
                self.writer_gone();
                return;
            }
        };

        let result = match Handle::try_current() {
            Err(_) => self.sender.blocking_send(message),
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                block_in_place(|| self.sender.blocking_send(message))
            }
            Ok(_) => {
                count_dropped(1);
                if !self.congested.swap(true, Ordering::Relaxed) {
                    warn!(
                        "Queue of log file {} is full, dropping lines logged synchronously \
                         from a current-thread runtime",
                        self.path.display()
                    );
                }
                return;
            }
        };
        if result.is_err() {
            self.writer_gone();
        }
    }

    /// Queues a complete line (including its terminator) for writing, waiting for the queue to
    /// have capacity.
    pub(crate) async fn write_line_async(&self, line: Vec<u8>) {
        if self.sender.send(WriterMessage::Line(line)).await.is_err() {
            self.writer_gone();
        }
    }

    /// Makes the writer close the file after writing the lines already queued. The file will be
    /// opened again for the next line.
    pub fn reopen(&self) {
        match self.sender.try_send(WriterMessage::Reopen) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                if let Ok(handle) = Handle::try_current() {
                    let sender = self.sender.clone();
                    handle.spawn(async move { sender.send(message).await });
                } else {
                    let _ = self.sender.blocking_send(message);
                }
            }
            Err(TrySendError::Closed(_)) => {
                error!(
                    "Failed reopening {}, writer thread crashed?",
                    self.path.display()
                );
            }
        }
    }

    /// Waits until all lines queued so far have been written and flushed.
    ///
    /// # Panics
    ///
    /// This function panics if called within an asynchronous execution context.
    pub fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.blocking_send(WriterMessage::Flush(done)).is_ok() {
            let _ = wait.blocking_recv();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::sync::Arc;
    use test_log::test;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "access-log-writer-test-{}-{name}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir.join("access.log")
    }

    #[test]
    fn writes_lines_in_order() {
        let path = temp_path("order");
        let file = LogFile::open(path.clone()).unwrap();
        for i in 0..100 {
            file.write_line(format!("line {i}\n").into_bytes());
        }
        file.flush();

        let content = fs::read_to_string(&path).unwrap();
        let expected: String = (0..100).map(|i| format!("line {i}\n")).collect();
        assert_eq!(content, expected);
    }

    #[test]
    fn appends_to_existing_file() {
        let path = temp_path("append");
        fs::write(&path, "existing\n").unwrap();

        let file = LogFile::open(path.clone()).unwrap();
        file.write_line(b"new\n".to_vec());
        file.flush();

        assert_eq!(fs::read_to_string(&path).unwrap(), "existing\nnew\n");
    }

    #[test]
    fn reopen_after_rename() {
        let path = temp_path("reopen");
        let rotated = path.with_extension("log.1");

        let file = LogFile::open(path.clone()).unwrap();
        file.write_line(b"first\n".to_vec());
        file.flush();

        fs::rename(&path, &rotated).unwrap();

        // Without reopening, the original handle keeps being used
        file.write_line(b"second\n".to_vec());
        file.flush();
        assert!(!path.exists());

        file.reopen();
        file.write_line(b"third\n".to_vec());
        file.flush();

        assert_eq!(fs::read_to_string(&rotated).unwrap(), "first\nsecond\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "third\n");
    }

    #[test]
    fn open_failure() {
        let path = temp_path("failure");
        fs::create_dir_all(&path).unwrap();

        let err = LogFile::open(path).unwrap_err();
        assert_eq!(err.etype(), &ErrorType::FileCreateError);
    }

    #[test]
    fn failed_reopen_drops_lines() {
        let path = temp_path("dropped");
        let file = LogFile::open(path.clone()).unwrap();
        file.write_line(b"kept\n".to_vec());
        file.flush();

        // Replace the file by a directory, reopening will fail
        fs::remove_file(&path).unwrap();
        fs::create_dir_all(&path).unwrap();
        file.reopen();

        let dropped = dropped_lines();
        file.write_line(b"lost\n".to_vec());
        file.write_line(b"lost\n".to_vec());
        file.flush();
        assert!(dropped_lines() >= dropped + 2);

        // Recovers once the destination is usable again
        fs::remove_dir_all(&path).unwrap();
        file.write_line(b"recovered\n".to_vec());
        file.flush();
        assert_eq!(fs::read_to_string(&path).unwrap(), "recovered\n");
    }

    #[test]
    fn terminates_partial_line() {
        let path = temp_path("partial");
        fs::write(&path, "incomplete").unwrap();

        let file = LogFile::open(path.clone()).unwrap();
        file.write_line(b"next\n".to_vec());
        file.flush();

        assert_eq!(fs::read_to_string(&path).unwrap(), "incomplete\nnext\n");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn flush_failure_drops_buffered_lines() {
        let path = PathBuf::from("/dev/full");
        let file = LogFile::open(path).unwrap();

        let dropped = dropped_lines();
        for _ in 0..3 {
            file.write_line(b"lost\n".to_vec());
            file.flush();
        }
        assert!(dropped_lines() >= dropped + 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn flush_failure_is_reported_once() {
        let path = PathBuf::from("/dev/full");
        let mut destination = Destination::new(path.clone(), Some(open_file(&path).unwrap()));

        destination.write_line(b"buffered\n");
        destination.write_line(b"buffered\n");
        assert_eq!(destination.pending, 2);
        assert!(!destination.failing);

        destination.flush();
        assert!(destination.failing);
        assert_eq!(destination.pending, 0);
        assert!(destination.writer.is_none());

        // Reopening and buffering succeeds, but the file only recovers once flushing does
        for _ in 0..2 {
            destination.write_line(b"buffered\n");
            assert!(destination.failing);
            destination.flush();
            assert!(destination.failing);
        }
    }

    #[test]
    fn recovers_after_successful_flush() {
        let path = temp_path("recovery");
        fs::create_dir_all(&path).unwrap();
        let mut destination = Destination::new(path.clone(), None);

        destination.write_line(b"lost\n");
        assert!(destination.failing);
        assert_eq!(destination.pending, 0);

        fs::remove_dir_all(&path).unwrap();
        destination.write_line(b"kept\n");
        assert!(destination.failing);
        destination.flush();
        assert!(!destination.failing);

        assert_eq!(fs::read_to_string(&path).unwrap(), "kept\n");
    }

    fn count_lines(path: &Path, expected_line: &str) -> usize {
        let content = fs::read_to_string(path).unwrap();
        for line in content.lines() {
            assert_eq!(line, expected_line);
        }
        content.lines().count()
    }

    #[test]
    fn threads_wait_for_capacity() {
        const LINES: usize = QUEUE_CAPACITY * 2;

        let path = temp_path("threads-capacity");
        let file = LogFile::open(path.clone()).unwrap();
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..LINES {
                        file.write_line(b"queued\n".to_vec());
                    }
                });
            }
        });
        file.flush();

        assert_eq!(count_lines(&path, "queued"), LINES * 4);
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn runtime_threads_wait_for_capacity() {
        const LINES: usize = QUEUE_CAPACITY * 2;

        let path = temp_path("runtime-capacity");
        let file = Arc::new(LogFile::open(path.clone()).unwrap());

        let blocking = {
            let file = file.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..LINES {
                    file.write_line(b"queued\n".to_vec());
                }
            })
        };
        let worker = {
            let file = file.clone();
            tokio::spawn(async move {
                for _ in 0..LINES {
                    file.write_line(b"queued\n".to_vec());
                }
            })
        };
        blocking.await.unwrap();
        worker.await.unwrap();

        let flushed = file.clone();
        tokio::task::spawn_blocking(move || flushed.flush())
            .await
            .unwrap();

        assert_eq!(count_lines(&path, "queued"), LINES * 2);
    }

    #[test(tokio::test)]
    async fn current_thread_runtime_counts_dropped_lines() {
        const LINES: usize = QUEUE_CAPACITY * 2;

        let path = temp_path("current-thread");
        let file = Arc::new(LogFile::open(path.clone()).unwrap());

        let dropped = dropped_lines();
        for _ in 0..LINES {
            file.write_line(b"queued\n".to_vec());
        }

        let flushed = file.clone();
        tokio::task::spawn_blocking(move || flushed.flush())
            .await
            .unwrap();

        // Every line is either written completely or counted as dropped
        let written = count_lines(&path, "queued");
        assert!(written as u64 + (dropped_lines() - dropped) >= LINES as u64);
    }
}
