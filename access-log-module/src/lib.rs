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

//! # Access Log Module
//!
//! This crate implements access logging for proxies: a line per request or connection, rendered
//! from a configurable format and appended to a log file. A configuration could look like this:
//!
//! ```yaml
//! log_file: /var/log/proxy/access.log
//! log_format: "%START_TIME% %DOWNSTREAM_REMOTE_ADDRESS% %RESPONSE_CODE% %REQ(User-Agent)%"
//! ```
//!
//! The `log_file` and `log_format` fields are also available as `--log-file` and `--log-format`
//! command line options.
//!
//! Placeholders have the form `%NAME%` or `%NAME(ARG)%`, `%%` produces a literal percent sign.
//! Any other text is copied to the log verbatim. The supported placeholders are:
//!
//! * `START_TIME`: local time the request started, e.g. `2024/05/29 09:53:19.123`
//! * `REQUEST_RECEIVED_DURATION`: milliseconds until the request was fully received
//! * `RESPONSE_RECEIVED_DURATION`: milliseconds until the response was fully received
//! * `DURATION`: milliseconds elapsed when the line is logged
//! * `BYTES_SENT`, `BYTES_RECEIVED`: bytes sent to and received from the client
//! * `PROTOCOL`: protocol name, e.g. `HTTP/1.1`
//! * `RESPONSE_CODE`: response status code
//! * `RESPONSE_FLAGS`: codes of all response flags set, e.g. `UF,NR`
//! * `UPSTREAM_HOST`, `UPSTREAM_HOST_ADDRESS`: name and address of the selected upstream host
//! * `UPSTREAM_LOCAL_ADDRESS`: local address of the upstream connection
//! * `DOWNSTREAM_LOCAL_ADDRESS`, `DOWNSTREAM_REMOTE_ADDRESS`: addresses of the client connection
//! * `ROUTE_RULE`: name of the matched routing rule
//! * `HEALTH_CHECK`: `true` for health check requests, `false` otherwise
//! * `REQ(<header>)`: value of a request header, e.g. `REQ(User-Agent)`
//! * `RESP(<header>)`: value of a response header, e.g. `RESP(Content-Type)`
//!
//! Header names are matched case-sensitively. Fields that aren't set, zero values and missing
//! headers are logged as `-`. Bytes outside of printable ASCII are escaped as `\xNN`.
//!
//! Without a format, [`DEFAULT_FORMAT`] is used:
//!
//! ```text
//! %START_TIME% %REQUEST_RECEIVED_DURATION% %RESPONSE_RECEIVED_DURATION% %BYTES_SENT% %BYTES_RECEIVED% %PROTOCOL% %RESPONSE_CODE% %DURATION% %RESPONSE_FLAGS% %UPSTREAM_LOCAL_ADDRESS% %DOWNSTREAM_LOCAL_ADDRESS% %DOWNSTREAM_REMOTE_ADDRESS% %UPSTREAM_HOST%
//! ```
//!
//! A log file will be created if necessary, data in already existing files will be kept. Access
//! logs configured with the same file share a single file handle.
//!
//! Log files are kept open until explicitly reopened. On Unix-based systems, the process can be
//! sent a `HUP` or `USR1` signal to make it reopen log files after calling [`listen_for_signals`].
//! This is useful after the logs have been rotated for example.
//!
//! ## Code example
//!
//! ```rust
//! use access_log_module::{AccessLog, AccessLogConf, RequestInfo};
//! use std::collections::HashMap;
//! use std::time::{Duration, SystemTime};
//!
//! let conf = AccessLogConf {
//!     log_file: std::env::temp_dir().join("access-log-doc").join("access.log"),
//!     log_format: Some("%BYTES_SENT% %RESP(Server)%".to_owned()),
//! };
//! let log = AccessLog::try_from(conf).unwrap();
//!
//! let mut info = RequestInfo::new();
//! info.set_response_received_duration(SystemTime::now() + Duration::from_millis(5));
//! info.set_bytes_sent(2048);
//!
//! let request_headers = HashMap::from([("service".to_owned(), "test".to_owned())]);
//! let response_headers = HashMap::from([("Server".to_owned(), "proxy".to_owned())]);
//! log.log(&request_headers, &response_headers, &info);
//! log.flush();
//! ```

pub mod configuration;
mod access_log;
mod format;
mod headers;
mod registry;
mod render;
mod request_info;
#[cfg(unix)]
mod signal;
mod writer;


pub use access_log::AccessLog;
pub use configuration::{AccessLogConf, AccessLogOpt, FromYaml, LogField};
pub use format::{CompiledFormat, FormatError, FormatErrorReason, DEFAULT_FORMAT};
pub use headers::HeaderProvider;
pub use pingora_error::{Error, ErrorType};
pub use registry::AccessLogRegistry;
pub use render::UNSET_PLACEHOLDER;
pub use request_info::{HostInfo, Protocol, RequestInfo, ResponseFlag, RouteRule};
#[cfg(unix)]
pub use signal::listen as listen_for_signals;
pub use writer::{dropped_lines, LogFile};

/// Set type holding [`ResponseFlag`] values
pub use enumset::EnumSet;
