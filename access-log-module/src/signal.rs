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

//! Unix signal processing

use log::{debug, warn};
use tokio::signal::unix::{signal, SignalKind};

use crate::registry::AccessLogRegistry;

fn listen_to_signal(kind: SignalKind, registry: &'static AccessLogRegistry) {
    let mut sig = match signal(kind) {
        Ok(sig) => sig,
        Err(err) => {
            warn!(
                "Failed registering for signal {}: {err}",
                kind.as_raw_value()
            );
            return;
        }
    };

    tokio::spawn(async move {
        while sig.recv().await.is_some() {
            debug!(
                "Received signal {}, reopening log files",
                kind.as_raw_value()
            );
            registry.reopen_all();
        }
    });
}

/// Makes the process reopen all log files of the [process-wide
/// registry](AccessLogRegistry::global) when receiving a `HUP` or `USR1` signal. This is useful
/// after the logs have been rotated for example.
///
/// # Panics
///
/// This function panics if called outside of a Tokio runtime.
pub fn listen() {
    listen_to_signal(SignalKind::hangup(), AccessLogRegistry::global());
    listen_to_signal(SignalKind::user_defined1(), AccessLogRegistry::global());
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::time::Duration;
    use test_log::test;

    use crate::access_log::AccessLog;
    use crate::request_info::RequestInfo;

    #[test(tokio::test(flavor = "multi_thread"))]
    async fn reopen_on_hangup() {
        let dir = std::env::temp_dir().join(format!(
            "access-log-signal-test-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        let path = dir.join("access.log");
        let rotated = dir.join("access.log.1");

        let log = AccessLog::new(&path, None, "%RESPONSE_CODE%").unwrap();
        listen();

        let mut info = RequestInfo::new();
        info.set_response_code(200);
        log.log_async(&(), &(), &info).await;
        let flushed = log.clone();
        tokio::task::spawn_blocking(move || flushed.flush())
            .await
            .unwrap();
        fs::rename(&path, &rotated).unwrap();

        let status = std::process::Command::new("kill")
            .arg("-HUP")
            .arg(std::process::id().to_string())
            .status()
            .unwrap();
        assert!(status.success());
        tokio::time::sleep(Duration::from_millis(200)).await;

        info.set_response_code(404);
        log.log_async(&(), &(), &info).await;
        let flushed = log.clone();
        tokio::task::spawn_blocking(move || flushed.flush())
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&rotated).unwrap(), "200\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "404\n");
    }
}
