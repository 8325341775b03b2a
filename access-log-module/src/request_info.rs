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

//! Telemetry collected for a single request or connection
//!
//! A [`RequestInfo`] is created when processing of a request starts and filled in by the various
//! proxy stages as they complete. It is owned by the request handling context. Once all
//! modifications are done, it is handed over to the access logs for reading. Writes and reads
//! never overlap, so the record itself carries no synchronization.

use enumset::{EnumSet, EnumSetType};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

/// Wire protocol used by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.x
    Http1,
    /// HTTP/2
    Http2,
    /// SOFA RPC (Bolt)
    SofaRpc,
    /// Generic multiplexed RPC protocol
    XProtocol,
}

impl Protocol {
    /// Returns the protocol name as written to access logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Http1 => "HTTP/1.1",
            Self::Http2 => "HTTP/2",
            Self::SofaRpc => "SofaRpc",
            Self::XProtocol => "X",
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.write_str(self.name())
    }
}

/// A fault or condition observed while processing a request
///
/// Flags are independent of each other, any number of them can be set on a request.
#[derive(Debug, EnumSetType)]
pub enum ResponseFlag {
    /// Local health check of the upstream failed
    FailedLocalHealthCheck,
    /// No healthy upstream host available
    NoHealthyUpstream,
    /// Upstream did not respond in time
    UpstreamRequestTimeout,
    /// Connection was reset locally
    LocalReset,
    /// Connection was reset by the upstream
    UpstreamRemoteReset,
    /// Connection to the upstream could not be established
    UpstreamConnectionFailure,
    /// Connection to the upstream was terminated
    UpstreamConnectionTermination,
    /// Upstream circuit breaker tripped
    UpstreamOverflow,
    /// No route matched the request
    NoRouteFound,
    /// Request was delayed by fault injection
    DelayInjected,
    /// Request was aborted by fault injection
    FaultInjected,
    /// Request was rate limited
    RateLimited,
}

impl ResponseFlag {
    /// Returns the two-letter code for this flag as written to access logs.
    pub fn short_code(self) -> &'static str {
        match self {
            Self::FailedLocalHealthCheck => "LH",
            Self::NoHealthyUpstream => "UH",
            Self::UpstreamRequestTimeout => "UT",
            Self::LocalReset => "LR",
            Self::UpstreamRemoteReset => "UR",
            Self::UpstreamConnectionFailure => "UF",
            Self::UpstreamConnectionTermination => "UC",
            Self::UpstreamOverflow => "UO",
            Self::NoRouteFound => "NR",
            Self::DelayInjected => "DI",
            Self::FaultInjected => "FI",
            Self::RateLimited => "RL",
        }
    }
}

/// Upstream host descriptor owned by the backend pool
pub trait HostInfo: Send + Sync {
    /// Name identifying the host, e.g. `backend-1` or a DNS name.
    fn hostname(&self) -> &str;

    /// Address connections to this host go to, if known.
    fn address(&self) -> Option<SocketAddr> {
        None
    }
}

/// Routing rule descriptor owned by the routing table
pub trait RouteRule: Send + Sync {
    /// Name identifying the rule.
    fn name(&self) -> &str;
}

/// Mutable telemetry record of a single request or connection
///
/// Unset fields read as zero values: zero durations and counters, `None` addresses and
/// references. Setters can be called any number of times, later values overwrite earlier ones.
/// The only exception are response flags which accumulate.
///
/// Upstream host and route rule are held as weak references. The request info never keeps them
/// alive, once the backend pool or routing table drops them the corresponding getters return
/// `None`.
///
/// A record belongs to exactly one request. All mutations have to complete before logging starts,
/// after that any number of access logs may read it through shared references.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    start_time: SystemTime,
    request_received_duration: Duration,
    response_received_duration: Duration,
    bytes_sent: u64,
    bytes_received: u64,
    protocol: Option<Protocol>,
    response_code: u32,
    response_flags: EnumSet<ResponseFlag>,
    upstream_host: Option<Weak<dyn HostInfo>>,
    upstream_local_address: Option<SocketAddr>,
    downstream_local_address: Option<SocketAddr>,
    downstream_remote_address: Option<SocketAddr>,
    health_check: bool,
    route_rule: Option<Weak<dyn RouteRule>>,
}

impl Default for RequestInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestInfo {
    /// Creates a record for a request starting now.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a record for a request that started at the given time.
    pub fn with_start_time(start_time: SystemTime) -> Self {
        Self {
            start_time,
            request_received_duration: Duration::ZERO,
            response_received_duration: Duration::ZERO,
            bytes_sent: 0,
            bytes_received: 0,
            protocol: None,
            response_code: 0,
            response_flags: EnumSet::empty(),
            upstream_host: None,
            upstream_local_address: None,
            downstream_local_address: None,
            downstream_remote_address: None,
            health_check: false,
            route_rule: None,
        }
    }

    /// Time processing of the request started.
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    /// Resets the start time to now.
    pub fn set_start_time(&mut self) {
        self.start_time = SystemTime::now();
    }

    /// Time elapsed since the request started.
    pub fn duration(&self) -> Duration {
        elapsed_since(self.start_time, SystemTime::now())
    }

    /// Time from request start until the request was fully received.
    pub fn request_received_duration(&self) -> Duration {
        self.request_received_duration
    }

    /// Records the time the request was fully received.
    ///
    /// The time is expected to be no earlier than the start time, earlier times record a zero
    /// duration.
    pub fn set_request_received_duration(&mut self, time: SystemTime) {
        self.request_received_duration = elapsed_since(self.start_time, time);
    }

    /// Time from request start until the response was fully received.
    pub fn response_received_duration(&self) -> Duration {
        self.response_received_duration
    }

    /// Records the time the response was fully received.
    ///
    /// The time is expected to be no earlier than the start time, earlier times record a zero
    /// duration.
    pub fn set_response_received_duration(&mut self, time: SystemTime) {
        self.response_received_duration = elapsed_since(self.start_time, time);
    }

    /// Number of bytes sent to the client.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Sets the number of bytes sent to the client.
    pub fn set_bytes_sent(&mut self, bytes_sent: u64) {
        self.bytes_sent = bytes_sent;
    }

    /// Number of bytes received from the client.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Sets the number of bytes received from the client.
    pub fn set_bytes_received(&mut self, bytes_received: u64) {
        self.bytes_received = bytes_received;
    }

    /// Protocol of the request, if already known.
    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    /// Sets the protocol of the request.
    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = Some(protocol);
    }

    /// Response status code, `0` if no response yet.
    pub fn response_code(&self) -> u32 {
        self.response_code
    }

    /// Sets the response status code.
    pub fn set_response_code(&mut self, code: u32) {
        self.response_code = code;
    }

    /// Checks whether a particular response flag is set.
    pub fn get_response_flag(&self, flag: ResponseFlag) -> bool {
        self.response_flags.contains(flag)
    }

    /// All response flags set on this request.
    pub fn response_flags(&self) -> EnumSet<ResponseFlag> {
        self.response_flags
    }

    /// Adds a response flag. Flags previously set remain set.
    pub fn set_response_flag(&mut self, flag: ResponseFlag) {
        self.response_flags.insert(flag);
    }

    /// Adds a number of response flags at once. Flags previously set remain set.
    pub fn set_response_flags(&mut self, flags: EnumSet<ResponseFlag>) {
        self.response_flags.insert_all(flags);
    }

    /// The upstream host selected for this request, unless none was selected yet or the host
    /// has been removed since.
    pub fn upstream_host(&self) -> Option<Arc<dyn HostInfo>> {
        self.upstream_host.as_ref().and_then(Weak::upgrade)
    }

    /// Records the upstream host selected by load balancing.
    pub fn on_upstream_host_selected(&mut self, host: Weak<dyn HostInfo>) {
        self.upstream_host = Some(host);
    }

    /// Local address of the upstream connection.
    pub fn upstream_local_address(&self) -> Option<SocketAddr> {
        self.upstream_local_address
    }

    /// Sets the local address of the upstream connection.
    pub fn set_upstream_local_address(&mut self, addr: SocketAddr) {
        self.upstream_local_address = Some(addr);
    }

    /// Local address of the client connection.
    pub fn downstream_local_address(&self) -> Option<SocketAddr> {
        self.downstream_local_address
    }

    /// Sets the local address of the client connection.
    pub fn set_downstream_local_address(&mut self, addr: SocketAddr) {
        self.downstream_local_address = Some(addr);
    }

    /// Remote address of the client connection.
    pub fn downstream_remote_address(&self) -> Option<SocketAddr> {
        self.downstream_remote_address
    }

    /// Sets the remote address of the client connection.
    pub fn set_downstream_remote_address(&mut self, addr: SocketAddr) {
        self.downstream_remote_address = Some(addr);
    }

    /// Checks whether this is synthetic health check traffic.
    pub fn is_health_check(&self) -> bool {
        self.health_check
    }

    /// Marks the request as health check traffic.
    pub fn set_health_check(&mut self, health_check: bool) {
        self.health_check = health_check;
    }

    /// The routing rule matched by this request, unless routing did not complete yet or the
    /// rule has been removed since.
    pub fn route_rule(&self) -> Option<Arc<dyn RouteRule>> {
        self.route_rule.as_ref().and_then(Weak::upgrade)
    }

    /// Records the routing rule matched by this request.
    pub fn set_route_rule(&mut self, rule: Weak<dyn RouteRule>) {
        self.route_rule = Some(rule);
    }
}

fn elapsed_since(start: SystemTime, time: SystemTime) -> Duration {
    time.duration_since(start).unwrap_or_default()
}
