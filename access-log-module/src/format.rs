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

//! Compiles log format patterns into a list of segments rendered per request

use log::debug;
use once_cell::sync::Lazy;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use crate::configuration::LogField;
use crate::render::{self, FieldWriter};

/// The log format used if none is configured
///
/// Downstream consumers parse logs in this format, changing it breaks them.
pub const DEFAULT_FORMAT: &str = "%START_TIME% %REQUEST_RECEIVED_DURATION% %RESPONSE_RECEIVED_DURATION% %BYTES_SENT% %BYTES_RECEIVED% %PROTOCOL% %RESPONSE_CODE% %DURATION% %RESPONSE_FLAGS% %UPSTREAM_LOCAL_ADDRESS% %DOWNSTREAM_LOCAL_ADDRESS% %DOWNSTREAM_REMOTE_ADDRESS% %UPSTREAM_HOST%";

const DEFAULT_FIELDS: [LogField; 13] = [
    LogField::StartTime,
    LogField::RequestReceivedDuration,
    LogField::ResponseReceivedDuration,
    LogField::BytesSent,
    LogField::BytesReceived,
    LogField::Protocol,
    LogField::ResponseCode,
    LogField::Duration,
    LogField::ResponseFlags,
    LogField::UpstreamLocalAddress,
    LogField::DownstreamLocalAddress,
    LogField::DownstreamRemoteAddress,
    LogField::UpstreamHost,
];

static DEFAULT: Lazy<Arc<CompiledFormat>> = Lazy::new(|| {
    let mut segments = Vec::with_capacity(DEFAULT_FIELDS.len() * 2);
    for field in DEFAULT_FIELDS {
        if !segments.is_empty() {
            segments.push(Segment::Literal(" ".to_owned()));
        }
        segments.push(field.into());
    }
    Arc::new(CompiledFormat { segments })
});

/// Reason a log format failed to compile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatErrorReason {
    /// Placeholder name is not known
    UnknownPlaceholder,
    /// Opening `%` without a closing one
    UnterminatedPlaceholder,
    /// Opening `(` without a closing `)` before the end of the placeholder
    UnterminatedArgument,
    /// Header placeholder without a header name
    MissingArgument,
    /// Argument given to a placeholder that doesn't take one
    UnexpectedArgument,
    /// Header placeholder with an empty header name
    EmptyHeaderName,
}

impl Display for FormatErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(match self {
            Self::UnknownPlaceholder => "unknown placeholder",
            Self::UnterminatedPlaceholder => "unterminated placeholder",
            Self::UnterminatedArgument => "unterminated placeholder argument",
            Self::MissingArgument => "header name missing in placeholder",
            Self::UnexpectedArgument => "placeholder doesn't take an argument",
            Self::EmptyHeaderName => "empty header name in placeholder",
        })
    }
}

/// The error type returned when compiling a log format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    token: String,
    position: usize,
    reason: FormatErrorReason,
}

impl FormatError {
    fn new(token: &str, position: usize, reason: FormatErrorReason) -> Self {
        Self {
            token: token.to_owned(),
            position,
            reason,
        }
    }

    /// The offending placeholder including its `%` delimiters.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Byte offset of the offending placeholder within the format.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Why the placeholder was rejected.
    pub fn reason(&self) -> FormatErrorReason {
        self.reason
    }
}

impl Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{} {} at position {}",
            self.reason, self.token, self.position
        )
    }
}

impl std::error::Error for FormatError {}

#[derive(Clone)]
pub(crate) enum Segment {
    Literal(String),
    Field {
        name: &'static str,
        write: FieldWriter,
    },
    RequestHeader(String),
    ResponseHeader(String),
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Literal(text) => f.debug_tuple("Literal").field(text).finish(),
            Self::Field { name, .. } => f.debug_tuple("Field").field(name).finish(),
            Self::RequestHeader(name) => f.debug_tuple("RequestHeader").field(name).finish(),
            Self::ResponseHeader(name) => f.debug_tuple("ResponseHeader").field(name).finish(),
        }
    }
}

impl Segment {
    fn field(field: &LogField, write: FieldWriter) -> Self {
        Self::Field {
            name: field.name(),
            write,
        }
    }
}

impl From<LogField> for Segment {
    fn from(field: LogField) -> Self {
        let write: FieldWriter = match field {
            LogField::RequestHeader(name) => return Self::RequestHeader(name),
            LogField::ResponseHeader(name) => return Self::ResponseHeader(name),
            LogField::StartTime => render::start_time,
            LogField::RequestReceivedDuration => render::request_received_duration,
            LogField::ResponseReceivedDuration => render::response_received_duration,
            LogField::Duration => render::duration,
            LogField::BytesSent => render::bytes_sent,
            LogField::BytesReceived => render::bytes_received,
            LogField::Protocol => render::protocol,
            LogField::ResponseCode => render::response_code,
            LogField::ResponseFlags => render::response_flags,
            LogField::UpstreamHost => render::upstream_host,
            LogField::UpstreamHostAddress => render::upstream_host_address,
            LogField::UpstreamLocalAddress => render::upstream_local_address,
            LogField::DownstreamLocalAddress => render::downstream_local_address,
            LogField::DownstreamRemoteAddress => render::downstream_remote_address,
            LogField::RouteRule => render::route_rule,
            LogField::HealthCheck => render::health_check,
        };
        Self::field(&field, write)
    }
}

/// A log format compiled into literal text and field renderers
///
/// Compiled formats are immutable, a single instance can be shared by any number of access logs
/// and threads rendering concurrently.
#[derive(Debug, Clone)]
pub struct CompiledFormat {
    segments: Vec<Segment>,
}

impl CompiledFormat {
    /// Compiles a log format.
    ///
    /// Placeholders have the form `%NAME%` or `%NAME(ARG)%`, see [`LogField`] for the supported
    /// ones. `%%` produces a literal percent sign, any other text is copied to the log verbatim.
    pub fn compile(pattern: &str) -> Result<Self, FormatError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = pattern;
        let mut offset = 0;

        while let Some(start) = rest.find('%') {
            literal.push_str(&rest[..start]);
            let position = offset + start;
            let placeholder = &rest[start + 1..];

            if let Some(tail) = placeholder.strip_prefix('%') {
                literal.push('%');
                offset = position + 2;
                rest = tail;
                continue;
            }

            let Some(end) = placeholder.find('%') else {
                return Err(FormatError::new(
                    &rest[start..],
                    position,
                    FormatErrorReason::UnterminatedPlaceholder,
                ));
            };
            let token = &rest[start..start + end + 2];

            let field = LogField::try_from(&placeholder[..end])
                .map_err(|reason| FormatError::new(token, position, reason))?;

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(field.into());

            offset = position + token.len();
            rest = &placeholder[end + 1..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        let format = Self { segments };
        debug!("Compiled log format {pattern:?} into {format:?}");
        Ok(format)
    }

    /// The shared instance of the [default format](DEFAULT_FORMAT).
    pub fn default_format() -> Arc<Self> {
        DEFAULT.clone()
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl FromStr for CompiledFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::compile(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn describe(format: &CompiledFormat) -> Vec<String> {
        format
            .segments()
            .iter()
            .map(|segment| format!("{segment:?}"))
            .collect()
    }

    #[test]
    fn compile() {
        let format = CompiledFormat::compile(
            "[%START_TIME%] %REQ(Host)% -> %RESP(Server)% 100%% %BYTES_SENT%",
        )
        .unwrap();
        assert_eq!(
            describe(&format),
            vec![
                r#"Literal("[")"#,
                r#"Field("START_TIME")"#,
                r#"Literal("] ")"#,
                r#"RequestHeader("Host")"#,
                r#"Literal(" -> ")"#,
                r#"ResponseHeader("Server")"#,
                r#"Literal(" 100% ")"#,
                r#"Field("BYTES_SENT")"#,
            ]
        );

        assert!(CompiledFormat::compile("").unwrap().segments().is_empty());
        assert_eq!(
            describe(&CompiledFormat::compile("plain text").unwrap()),
            vec![r#"Literal("plain text")"#]
        );
        assert_eq!(
            describe(&"%%%%".parse().unwrap()),
            vec![r#"Literal("%%")"#]
        );
    }

    #[test]
    fn default_format() {
        assert_eq!(
            describe(&CompiledFormat::compile(DEFAULT_FORMAT).unwrap()),
            describe(&CompiledFormat::default_format())
        );
    }

    #[test]
    fn errors() {
        let err =
            CompiledFormat::compile("%BYTES_SENT% %BYTES_SEND% %RESPONSE_CODE%").unwrap_err();
        assert_eq!(err.token(), "%BYTES_SEND%");
        assert_eq!(err.position(), 13);
        assert_eq!(err.reason(), FormatErrorReason::UnknownPlaceholder);
        assert_eq!(
            err.to_string(),
            "unknown placeholder %BYTES_SEND% at position 13"
        );

        let err = CompiledFormat::compile("ok %START_TIME").unwrap_err();
        assert_eq!(err.token(), "%START_TIME");
        assert_eq!(err.position(), 3);
        assert_eq!(err.reason(), FormatErrorReason::UnterminatedPlaceholder);

        let err = CompiledFormat::compile("%%%REQ%").unwrap_err();
        assert_eq!(err.token(), "%REQ%");
        assert_eq!(err.position(), 2);
        assert_eq!(err.reason(), FormatErrorReason::MissingArgument);

        let err = CompiledFormat::compile("%REQ(Host%").unwrap_err();
        assert_eq!(err.reason(), FormatErrorReason::UnterminatedArgument);

        let err = CompiledFormat::compile("%PROTOCOL(x)%").unwrap_err();
        assert_eq!(err.reason(), FormatErrorReason::UnexpectedArgument);

        let err = CompiledFormat::compile("100% done").unwrap_err();
        assert_eq!(err.reason(), FormatErrorReason::UnterminatedPlaceholder);
    }
}
