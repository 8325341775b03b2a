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

//! Structures handling command line options and YAML deserialization for access logs

use clap::Args;
use log::trace;
use pingora_error::{Error, ErrorType};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt::{Debug, Display};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::format::FormatErrorReason;

/// Trait for configuration structures that can be loaded from YAML files. This trait has a blanket
/// implementation for any structure implementing [`serde::Deserialize`].
pub trait FromYaml {
    /// Loads configuration from a YAML file.
    fn load_from_yaml<P>(path: P) -> Result<Self, Box<Error>>
    where
        P: AsRef<Path>,
        Self: Sized;
}

impl<D> FromYaml for D
where
    D: DeserializeOwned + Debug + ?Sized,
{
    fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, Box<Error>> {
        let file = File::open(path.as_ref()).map_err(|err| {
            Error::because(
                ErrorType::FileOpenError,
                "failed opening configuration file",
                err,
            )
        })?;
        let reader = BufReader::new(file);

        let conf = serde_yaml::from_reader(reader).map_err(|err| {
            Error::because(
                ErrorType::FileReadError,
                "failed reading configuration file",
                err,
            )
        })?;
        trace!("Loaded configuration file: {conf:#?}");

        Ok(conf)
    }
}

/// Command line options of an access log
#[derive(Debug, Default, Args)]
pub struct AccessLogOpt {
    /// Access log file path
    ///
    /// Special values are an empty string (disable logging) and - (write to standard output).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Access log format, e.g. "%START_TIME% %RESPONSE_CODE% %REQ(Host)%"
    #[arg(long)]
    pub log_format: Option<String>,
}

/// An individual placeholder of a log format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogField {
    /// Local time the request started, `START_TIME` in format
    StartTime,
    /// Milliseconds until the request was received, `REQUEST_RECEIVED_DURATION` in format
    RequestReceivedDuration,
    /// Milliseconds until the response was received, `RESPONSE_RECEIVED_DURATION` in format
    ResponseReceivedDuration,
    /// Milliseconds elapsed at the time of logging, `DURATION` in format
    Duration,
    /// Bytes sent to the client, `BYTES_SENT` in format
    BytesSent,
    /// Bytes received from the client, `BYTES_RECEIVED` in format
    BytesReceived,
    /// Protocol name, `PROTOCOL` in format
    Protocol,
    /// Response status code, `RESPONSE_CODE` in format
    ResponseCode,
    /// Response flag codes like `UF,NR`, `RESPONSE_FLAGS` in format
    ResponseFlags,
    /// Name of the selected upstream host, `UPSTREAM_HOST` in format
    UpstreamHost,
    /// Address of the selected upstream host, `UPSTREAM_HOST_ADDRESS` in format
    UpstreamHostAddress,
    /// Local address of the upstream connection, `UPSTREAM_LOCAL_ADDRESS` in format
    UpstreamLocalAddress,
    /// Local address of the client connection, `DOWNSTREAM_LOCAL_ADDRESS` in format
    DownstreamLocalAddress,
    /// Remote address of the client connection, `DOWNSTREAM_REMOTE_ADDRESS` in format
    DownstreamRemoteAddress,
    /// Name of the matched routing rule, `ROUTE_RULE` in format
    RouteRule,
    /// `true` for health check requests, `HEALTH_CHECK` in format
    HealthCheck,
    /// A request header, `REQ(<header>)` in format
    RequestHeader(String),
    /// A response header, `RESP(<header>)` in format
    ResponseHeader(String),
}

impl LogField {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "START_TIME" => Self::StartTime,
            "REQUEST_RECEIVED_DURATION" => Self::RequestReceivedDuration,
            "RESPONSE_RECEIVED_DURATION" => Self::ResponseReceivedDuration,
            "DURATION" => Self::Duration,
            "BYTES_SENT" => Self::BytesSent,
            "BYTES_RECEIVED" => Self::BytesReceived,
            "PROTOCOL" => Self::Protocol,
            "RESPONSE_CODE" => Self::ResponseCode,
            "RESPONSE_FLAGS" => Self::ResponseFlags,
            "UPSTREAM_HOST" => Self::UpstreamHost,
            "UPSTREAM_HOST_ADDRESS" => Self::UpstreamHostAddress,
            "UPSTREAM_LOCAL_ADDRESS" => Self::UpstreamLocalAddress,
            "DOWNSTREAM_LOCAL_ADDRESS" => Self::DownstreamLocalAddress,
            "DOWNSTREAM_REMOTE_ADDRESS" => Self::DownstreamRemoteAddress,
            "ROUTE_RULE" => Self::RouteRule,
            "HEALTH_CHECK" => Self::HealthCheck,
            _ => return None,
        })
    }

    /// Placeholder name without argument, e.g. `REQ` for request headers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartTime => "START_TIME",
            Self::RequestReceivedDuration => "REQUEST_RECEIVED_DURATION",
            Self::ResponseReceivedDuration => "RESPONSE_RECEIVED_DURATION",
            Self::Duration => "DURATION",
            Self::BytesSent => "BYTES_SENT",
            Self::BytesReceived => "BYTES_RECEIVED",
            Self::Protocol => "PROTOCOL",
            Self::ResponseCode => "RESPONSE_CODE",
            Self::ResponseFlags => "RESPONSE_FLAGS",
            Self::UpstreamHost => "UPSTREAM_HOST",
            Self::UpstreamHostAddress => "UPSTREAM_HOST_ADDRESS",
            Self::UpstreamLocalAddress => "UPSTREAM_LOCAL_ADDRESS",
            Self::DownstreamLocalAddress => "DOWNSTREAM_LOCAL_ADDRESS",
            Self::DownstreamRemoteAddress => "DOWNSTREAM_REMOTE_ADDRESS",
            Self::RouteRule => "ROUTE_RULE",
            Self::HealthCheck => "HEALTH_CHECK",
            Self::RequestHeader(_) => "REQ",
            Self::ResponseHeader(_) => "RESP",
        }
    }
}

impl TryFrom<&str> for LogField {
    type Error = FormatErrorReason;

    /// Parses the text between the `%` delimiters of a placeholder, e.g. `BYTES_SENT` or
    /// `REQ(User-Agent)`.
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let (name, arg) = match s.split_once('(') {
            Some((name, rest)) => {
                let arg = rest
                    .strip_suffix(')')
                    .ok_or(FormatErrorReason::UnterminatedArgument)?;
                (name, Some(arg))
            }
            None => (s, None),
        };

        match (name, arg) {
            ("REQ" | "RESP", Some("")) => Err(FormatErrorReason::EmptyHeaderName),
            ("REQ", Some(header)) => Ok(Self::RequestHeader(header.to_owned())),
            ("RESP", Some(header)) => Ok(Self::ResponseHeader(header.to_owned())),
            ("REQ" | "RESP", None) => Err(FormatErrorReason::MissingArgument),
            (name, None) => Self::from_name(name).ok_or(FormatErrorReason::UnknownPlaceholder),
            (name, Some(_)) => {
                if Self::from_name(name).is_some() {
                    Err(FormatErrorReason::UnexpectedArgument)
                } else {
                    Err(FormatErrorReason::UnknownPlaceholder)
                }
            }
        }
    }
}

impl Display for LogField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::RequestHeader(header) | Self::ResponseHeader(header) => {
                write!(f, "%{}({header})%", self.name())
            }
            _ => write!(f, "%{}%", self.name()),
        }
    }
}

/// Configuration settings of an access log
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AccessLogConf {
    /// Access log file path
    ///
    /// Special values are an empty string (disable logging) and - (write to standard output).
    pub log_file: PathBuf,
    /// Log format, the default format is used if missing
    ///
    /// See [`LogField`] for a list of supported placeholders and
    /// [`DEFAULT_FORMAT`](crate::DEFAULT_FORMAT) for the default.
    pub log_format: Option<String>,
}

impl Default for AccessLogConf {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("-"),
            log_format: None,
        }
    }
}

impl AccessLogConf {
    /// Merges the command line options into the current configuration. Any command line options
    /// present overwrite existing settings.
    pub fn merge_with_opt(&mut self, opt: AccessLogOpt) {
        if let Some(log_file) = opt.log_file {
            self.log_file = log_file;
        }

        if let Some(log_format) = opt.log_format {
            self.log_format = Some(log_format);
        }
    }

    /// Checks whether logging is enabled, i.e. a log file has been configured.
    pub fn is_enabled(&self) -> bool {
        !self.log_file.as_os_str().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn log_field_parsing() {
        let log_fields: Vec<_> = "START_TIME REQUEST_RECEIVED_DURATION RESPONSE_RECEIVED_DURATION DURATION BYTES_SENT BYTES_RECEIVED PROTOCOL RESPONSE_CODE RESPONSE_FLAGS UPSTREAM_HOST UPSTREAM_HOST_ADDRESS UPSTREAM_LOCAL_ADDRESS DOWNSTREAM_LOCAL_ADDRESS DOWNSTREAM_REMOTE_ADDRESS ROUTE_RULE HEALTH_CHECK REQ(User-Agent) RESP(Server)".split_ascii_whitespace().map(|s| {
            LogField::try_from(s).unwrap()
        }).collect();
        assert_eq!(
            log_fields,
            vec![
                LogField::StartTime,
                LogField::RequestReceivedDuration,
                LogField::ResponseReceivedDuration,
                LogField::Duration,
                LogField::BytesSent,
                LogField::BytesReceived,
                LogField::Protocol,
                LogField::ResponseCode,
                LogField::ResponseFlags,
                LogField::UpstreamHost,
                LogField::UpstreamHostAddress,
                LogField::UpstreamLocalAddress,
                LogField::DownstreamLocalAddress,
                LogField::DownstreamRemoteAddress,
                LogField::RouteRule,
                LogField::HealthCheck,
                LogField::RequestHeader("User-Agent".to_owned()),
                LogField::ResponseHeader("Server".to_owned()),
            ]
        );

        for field in &log_fields {
            assert_eq!(
                LogField::try_from(field.to_string().trim_matches('%')).as_ref(),
                Ok(field)
            );
        }
    }

    #[test]
    fn log_field_errors() {
        assert_eq!(
            LogField::try_from("UNSUPPORTED_FIELD"),
            Err(FormatErrorReason::UnknownPlaceholder)
        );
        assert_eq!(
            LogField::try_from("start_time"),
            Err(FormatErrorReason::UnknownPlaceholder)
        );
        assert_eq!(
            LogField::try_from("REQ"),
            Err(FormatErrorReason::MissingArgument)
        );
        assert_eq!(
            LogField::try_from("RESP()"),
            Err(FormatErrorReason::EmptyHeaderName)
        );
        assert_eq!(
            LogField::try_from("REQ(Host"),
            Err(FormatErrorReason::UnterminatedArgument)
        );
        assert_eq!(
            LogField::try_from("BYTES_SENT(x)"),
            Err(FormatErrorReason::UnexpectedArgument)
        );
        assert_eq!(
            LogField::try_from("FOO(x)"),
            Err(FormatErrorReason::UnknownPlaceholder)
        );
    }

    #[test]
    fn conf_merging() {
        let mut conf: AccessLogConf = serde_yaml::from_str(
            r#"
                log_file: /var/log/proxy/access.log
            "#,
        )
        .unwrap();
        assert_eq!(conf.log_file, PathBuf::from("/var/log/proxy/access.log"));
        assert_eq!(conf.log_format, None);
        assert!(conf.is_enabled());

        conf.merge_with_opt(AccessLogOpt {
            log_file: None,
            log_format: Some("%RESPONSE_CODE%".to_owned()),
        });
        assert_eq!(conf.log_file, PathBuf::from("/var/log/proxy/access.log"));
        assert_eq!(conf.log_format.as_deref(), Some("%RESPONSE_CODE%"));

        conf.merge_with_opt(AccessLogOpt {
            log_file: Some(PathBuf::new()),
            log_format: None,
        });
        assert!(!conf.is_enabled());
        assert_eq!(conf.log_format.as_deref(), Some("%RESPONSE_CODE%"));

        let conf: AccessLogConf = serde_yaml::from_str("{}").unwrap();
        assert_eq!(conf, AccessLogConf::default());
        assert_eq!(conf.log_file, PathBuf::from("-"));
    }
}
