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

//! Access log writers

use pingora_error::{Error, ErrorType};
use std::path::Path;
use std::sync::Arc;

use crate::configuration::AccessLogConf;
use crate::format::CompiledFormat;
use crate::headers::HeaderProvider;
use crate::registry::AccessLogRegistry;
use crate::request_info::RequestInfo;
use crate::writer::LogFile;

const LINE_CAPACITY: usize = 256;

/// Picks the format for a new access log: a precompiled format if given, otherwise the compiled
/// pattern or the default format if the pattern is empty.
pub(crate) fn resolve_format(
    format: Option<Arc<CompiledFormat>>,
    pattern: &str,
) -> Result<Arc<CompiledFormat>, Box<Error>> {
    if let Some(format) = format {
        return Ok(format);
    }

    if pattern.is_empty() {
        return Ok(CompiledFormat::default_format());
    }

    let format = CompiledFormat::compile(pattern).map_err(|err| {
        Error::because(
            ErrorType::Custom("InvalidLogFormat"),
            "failed compiling log format",
            err,
        )
    })?;
    Ok(Arc::new(format))
}

/// Writes a line per request to a log file
///
/// Lines are rendered on the calling thread, so any number of threads can log concurrently.
/// Only appending the finished line to the file is serialized. Access logs writing to the same
/// file share a single [`LogFile`], even if their formats differ.
#[derive(Debug, Clone)]
pub struct AccessLog {
    format: Arc<CompiledFormat>,
    file: Arc<LogFile>,
}

impl AccessLog {
    /// Creates an access log writing to the given path, registered with the
    /// [process-wide registry](AccessLogRegistry::global).
    ///
    /// A precompiled `format` takes precedence. Otherwise `pattern` is compiled, with an empty
    /// pattern selecting [`DEFAULT_FORMAT`](crate::DEFAULT_FORMAT). Fails if the format is
    /// invalid or the file cannot be opened, nothing is registered in that case.
    pub fn new(
        path: impl AsRef<Path>,
        format: Option<Arc<CompiledFormat>>,
        pattern: &str,
    ) -> Result<Self, Box<Error>> {
        AccessLogRegistry::global().access_log(path, format, pattern)
    }

    pub(crate) fn from_parts(format: Arc<CompiledFormat>, file: Arc<LogFile>) -> Self {
        Self { format, file }
    }

    /// The format lines are rendered in.
    pub fn format(&self) -> &Arc<CompiledFormat> {
        &self.format
    }

    /// The log file lines are written to.
    pub fn file(&self) -> &Arc<LogFile> {
        &self.file
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn render_line<Q, P>(
        &self,
        request_headers: &Q,
        response_headers: &P,
        info: &RequestInfo,
    ) -> Vec<u8>
    where
        Q: HeaderProvider + ?Sized,
        P: HeaderProvider + ?Sized,
    {
        let mut line = Vec::with_capacity(LINE_CAPACITY);
        self.format
            .render_into(&mut line, request_headers, response_headers, info);
        line.push(b'\n');
        line
    }

    /// Logs a request.
    ///
    /// This never fails. Lines that cannot be written are dropped and counted, see
    /// [`dropped_lines`](crate::dropped_lines). If the writer is behind, this waits for it,
    /// except on a current-thread Tokio runtime where the line is dropped. Use
    /// [`AccessLog::log_async`] there.
    pub fn log<Q, P>(&self, request_headers: &Q, response_headers: &P, info: &RequestInfo)
    where
        Q: HeaderProvider + ?Sized,
        P: HeaderProvider + ?Sized,
    {
        let line = self.render_line(request_headers, response_headers, info);
        self.file.write_line(line);
    }

    /// Logs a request, waiting asynchronously for queue capacity if the writer is behind.
    pub async fn log_async<Q, P>(
        &self,
        request_headers: &Q,
        response_headers: &P,
        info: &RequestInfo,
    ) where
        Q: HeaderProvider + ?Sized,
        P: HeaderProvider + ?Sized,
    {
        let line = self.render_line(request_headers, response_headers, info);
        self.file.write_line_async(line).await;
    }

    /// Closes the log file once queued lines are written, it will be opened again for the next
    /// line.
    pub fn reopen(&self) {
        self.file.reopen();
    }

    /// Waits until all lines logged so far are written to the file.
    ///
    /// # Panics
    ///
    /// This function panics if called within an asynchronous execution context.
    pub fn flush(&self) {
        self.file.flush();
    }
}

impl TryFrom<AccessLogConf> for AccessLog {
    type Error = Box<Error>;

    fn try_from(conf: AccessLogConf) -> Result<Self, Self::Error> {
        Self::new(
            &conf.log_file,
            None,
            conf.log_format.as_deref().unwrap_or(""),
        )
    }
}
