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

//! Renders log lines from compiled formats

use chrono::{DateTime, Local};
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use crate::format::{CompiledFormat, Segment};
use crate::headers::HeaderProvider;
use crate::request_info::RequestInfo;

/// Text written for fields that aren't set
pub const UNSET_PLACEHOLDER: &str = "-";

const LINE_CAPACITY: usize = 256;

pub(crate) type FieldWriter = fn(&mut Vec<u8>, &RequestInfo);

fn write_unset(buf: &mut Vec<u8>) {
    buf.extend_from_slice(UNSET_PLACEHOLDER.as_bytes());
}

/// Copies a value, escaping anything that isn't printable ASCII. This makes sure header values
/// cannot inject line breaks into the log.
fn write_escaped(buf: &mut Vec<u8>, data: impl AsRef<[u8]>) {
    fn is_allowed(byte: u8) -> bool {
        (b' '..=b'~').contains(&byte) && byte != b'\\'
    }

    for byte in data.as_ref() {
        if is_allowed(*byte) {
            buf.push(*byte);
        } else {
            let _ = write!(buf, "\\x{byte:02x}");
        }
    }
}

fn write_text(buf: &mut Vec<u8>, text: Option<&str>) {
    match text {
        Some(text) if !text.is_empty() => write_escaped(buf, text),
        _ => write_unset(buf),
    }
}

fn write_counter(buf: &mut Vec<u8>, value: u64) {
    if value == 0 {
        write_unset(buf);
    } else {
        let _ = write!(buf, "{value}");
    }
}

fn write_duration(buf: &mut Vec<u8>, duration: Duration) {
    if duration.is_zero() {
        write_unset(buf);
    } else {
        let _ = write!(buf, "{:.3}", duration.as_secs_f64() * 1000.0);
    }
}

fn write_addr(buf: &mut Vec<u8>, addr: Option<SocketAddr>) {
    if let Some(addr) = addr {
        let _ = write!(buf, "{addr}");
    } else {
        write_unset(buf);
    }
}

pub(crate) fn start_time(buf: &mut Vec<u8>, info: &RequestInfo) {
    let time = DateTime::<Local>::from(info.start_time()).format("%Y/%m/%d %H:%M:%S%.3f");
    let _ = write!(buf, "{time}");
}

pub(crate) fn request_received_duration(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_duration(buf, info.request_received_duration());
}

pub(crate) fn response_received_duration(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_duration(buf, info.response_received_duration());
}

pub(crate) fn duration(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_duration(buf, info.duration());
}

pub(crate) fn bytes_sent(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_counter(buf, info.bytes_sent());
}

pub(crate) fn bytes_received(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_counter(buf, info.bytes_received());
}

pub(crate) fn protocol(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_text(buf, info.protocol().map(|protocol| protocol.name()));
}

pub(crate) fn response_code(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_counter(buf, info.response_code().into());
}

pub(crate) fn response_flags(buf: &mut Vec<u8>, info: &RequestInfo) {
    let flags = info.response_flags();
    if flags.is_empty() {
        write_unset(buf);
        return;
    }

    for (index, flag) in flags.iter().enumerate() {
        if index > 0 {
            buf.push(b',');
        }
        buf.extend_from_slice(flag.short_code().as_bytes());
    }
}

pub(crate) fn upstream_host(buf: &mut Vec<u8>, info: &RequestInfo) {
    let host = info.upstream_host();
    write_text(buf, host.as_ref().map(|host| host.hostname()));
}

pub(crate) fn upstream_host_address(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_addr(buf, info.upstream_host().and_then(|host| host.address()));
}

pub(crate) fn upstream_local_address(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_addr(buf, info.upstream_local_address());
}

pub(crate) fn downstream_local_address(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_addr(buf, info.downstream_local_address());
}

pub(crate) fn downstream_remote_address(buf: &mut Vec<u8>, info: &RequestInfo) {
    write_addr(buf, info.downstream_remote_address());
}

pub(crate) fn route_rule(buf: &mut Vec<u8>, info: &RequestInfo) {
    let rule = info.route_rule();
    write_text(buf, rule.as_ref().map(|rule| rule.name()));
}

pub(crate) fn health_check(buf: &mut Vec<u8>, info: &RequestInfo) {
    let _ = write!(buf, "{}", info.is_health_check());
}

impl CompiledFormat {
    /// Appends the log line for a request to the buffer, without a line terminator.
    ///
    /// Fields that aren't set and missing headers are rendered as [`UNSET_PLACEHOLDER`].
    pub fn render_into<Q, P>(
        &self,
        buf: &mut Vec<u8>,
        request_headers: &Q,
        response_headers: &P,
        info: &RequestInfo,
    ) where
        Q: HeaderProvider + ?Sized,
        P: HeaderProvider + ?Sized,
    {
        for segment in self.segments() {
            match segment {
                Segment::Literal(text) => buf.extend_from_slice(text.as_bytes()),
                Segment::Field { write, .. } => write(buf, info),
                Segment::RequestHeader(name) => write_text(buf, request_headers.header(name)),
                Segment::ResponseHeader(name) => write_text(buf, response_headers.header(name)),
            }
        }
    }

    /// Renders the log line for a request, without a line terminator.
    pub fn render<Q, P>(
        &self,
        request_headers: &Q,
        response_headers: &P,
        info: &RequestInfo,
    ) -> String
    where
        Q: HeaderProvider + ?Sized,
        P: HeaderProvider + ?Sized,
    {
        let mut buf = Vec::with_capacity(LINE_CAPACITY);
        self.render_into(&mut buf, request_headers, response_headers, info);
        match String::from_utf8(buf) {
            Ok(line) => line,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }
}
