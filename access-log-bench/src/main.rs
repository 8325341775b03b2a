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

//! # Access Log Bench
//!
//! Drives concurrent writes through one or more access logs and reports the throughput. Each
//! request logs a synthetic record resembling a proxied HTTP/1.1 request. A configuration file
//! could look like this:
//!
//! ```yaml
//! requests: 1000000
//! threads: 8
//! access_logs:
//! - log_file: /tmp/access_log_bench/access.log
//! - log_file: /tmp/access_log_bench/access.log
//!   log_format: "%START_TIME% %RESPONSE_CODE% %REQ(service)% %RESP(Server)%"
//! ```
//!
//! The process reopens its log files when receiving `HUP` or `USR1` signals.

use access_log_module::{
    dropped_lines, AccessLog, AccessLogConf, AccessLogOpt, Error, FromYaml, HostInfo, Protocol,
    RequestInfo,
};
use clap::Parser;
use log::{error, info};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::available_parallelism;
use std::time::{Duration, Instant};

const DEFAULT_REQUESTS: usize = 100_000;

/// Run an access log benchmark
#[derive(Debug, Parser)]
struct Opt {
    /// The path to the configuration file. This command line flag can be specified multiple times.
    #[arg(short, long)]
    conf: Option<Vec<PathBuf>>,
    /// Total number of requests to log.
    #[arg(short, long)]
    requests: Option<usize>,
    /// Number of threads logging concurrently, defaults to the number of CPUs.
    #[arg(short, long)]
    threads: Option<usize>,
    #[command(flatten)]
    log: AccessLogOpt,
}

/// The configuration of the benchmark
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Conf {
    requests: Option<usize>,
    threads: Option<usize>,
    access_logs: Vec<AccessLogConf>,
}

impl Conf {
    fn load_from_files(files: &[PathBuf]) -> Result<Self, Box<Error>> {
        let mut merged = Self::default();
        for file in files {
            let conf = Self::load_from_yaml(file)?;
            merged.requests = conf.requests.or(merged.requests);
            merged.threads = conf.threads.or(merged.threads);
            merged.access_logs.extend(conf.access_logs);
        }
        Ok(merged)
    }

    /// Applies command line options. Log options apply to the first configured access log, or
    /// define one if none are configured.
    fn merge_with_opt(&mut self, opt: Opt) {
        if opt.requests.is_some() {
            self.requests = opt.requests;
        }
        if opt.threads.is_some() {
            self.threads = opt.threads;
        }

        if self.access_logs.is_empty() {
            self.access_logs.push(AccessLogConf::default());
        }
        self.access_logs[0].merge_with_opt(opt.log);
    }
}

#[derive(Debug)]
struct BenchHost {
    address: SocketAddr,
}

impl HostInfo for BenchHost {
    fn hostname(&self) -> &str {
        "bench-upstream"
    }

    fn address(&self) -> Option<SocketAddr> {
        Some(self.address)
    }
}

fn sample_request_info(host: &Arc<BenchHost>) -> RequestInfo {
    let mut info = RequestInfo::new();
    let start = info.start_time();
    info.set_request_received_duration(start);
    info.set_response_received_duration(start + Duration::from_secs(2));
    info.set_bytes_sent(2048);
    info.set_bytes_received(2048);
    info.set_protocol(Protocol::Http1);
    info.set_response_code(200);
    info.set_upstream_local_address(SocketAddr::from(([127, 0, 0, 1], 23456)));
    info.set_downstream_local_address(SocketAddr::from(([127, 0, 0, 1], 12200)));
    info.set_downstream_remote_address(SocketAddr::from(([127, 0, 0, 2], 53242)));
    let host: Arc<dyn HostInfo> = host.clone();
    info.on_upstream_host_selected(Arc::downgrade(&host));
    info
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let opt = Opt::parse();

    let mut conf = match Conf::load_from_files(opt.conf.as_deref().unwrap_or(&[])) {
        Ok(conf) => conf,
        Err(err) => {
            error!("{err}");
            Conf::default()
        }
    };
    conf.merge_with_opt(opt);

    let mut logs = Vec::new();
    for log_conf in conf.access_logs.into_iter().filter(AccessLogConf::is_enabled) {
        match AccessLog::try_from(log_conf) {
            Ok(log) => logs.push(log),
            Err(err) => {
                error!("{err}");
                return;
            }
        }
    }
    if logs.is_empty() {
        error!("No access logs configured");
        return;
    }

    #[cfg(unix)]
    access_log_module::listen_for_signals();

    let threads = conf
        .threads
        .or_else(|| available_parallelism().ok().map(usize::from))
        .unwrap_or(1)
        .max(1);
    let requests = conf.requests.unwrap_or(DEFAULT_REQUESTS);

    let host = Arc::new(BenchHost {
        address: SocketAddr::from(([10, 0, 0, 1], 8080)),
    });
    let info = Arc::new(sample_request_info(&host));
    let logs = Arc::new(logs);

    info!(
        "Logging {requests} requests to {} access logs from {threads} threads",
        logs.len()
    );
    let dropped_before = dropped_lines();
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(threads);
    for index in 0..threads {
        // Spread the remainder over the first threads
        let count = requests / threads + usize::from(index < requests % threads);
        let logs = logs.clone();
        let info = info.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let request_headers = HashMap::from([("service".to_owned(), "test".to_owned())]);
            let response_headers =
                HashMap::from([("Server".to_owned(), "access-log-bench".to_owned())]);
            for _ in 0..count {
                for log in logs.iter() {
                    log.log(&request_headers, &response_headers, &info);
                }
            }
        }));
    }
    for task in tasks {
        if let Err(err) = task.await {
            error!("Logging thread failed: {err}");
        }
    }

    let flushed = logs.clone();
    let flush = tokio::task::spawn_blocking(move || flushed.iter().for_each(AccessLog::flush));
    if let Err(err) = flush.await {
        error!("Flushing log files failed: {err}");
    }

    let elapsed = started.elapsed();
    let dropped = dropped_lines().saturating_sub(dropped_before);
    let lines = (requests * logs.len()) as u64;
    let written = lines.saturating_sub(dropped);
    info!(
        "Wrote {written} of {lines} lines in {elapsed:?} ({:.0} lines/s), {dropped} dropped",
        written as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    );
}
