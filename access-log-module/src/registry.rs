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

//! Process-wide registry of log files, making sure each file is only opened once

use log::debug;
use once_cell::sync::Lazy;
use pingora_error::{Error, ErrorType};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::access_log::{resolve_format, AccessLog};
use crate::format::CompiledFormat;
use crate::writer::LogFile;

static GLOBAL: Lazy<AccessLogRegistry> = Lazy::new(AccessLogRegistry::new);

fn normalize_path(path: &Path) -> Result<PathBuf, Box<Error>> {
    if path.as_os_str().is_empty() {
        return Err(Error::explain(
            ErrorType::FileOpenError,
            "log file path is empty",
        ));
    }

    if path.as_os_str() == "-" {
        // Don't change special paths
        return Ok(path.to_owned());
    }

    if let Some(parent) = path.parent() {
        let mut parent = if parent.as_os_str().is_empty() {
            PathBuf::from(".").canonicalize()
        } else {
            fs::create_dir_all(parent).and_then(|_| parent.canonicalize())
        }
        .map_err(|err| {
            Error::because(
                ErrorType::FileOpenError,
                "failed resolving log file's parent directory",
                err,
            )
        })?;
        if let Some(name) = path.file_name() {
            parent.push(name);
        }
        Ok(parent)
    } else {
        // Absolute path in the root, leave unchanged
        Ok(path.to_owned())
    }
}

/// Registry of the log files opened by access logs
///
/// Access logs configured with the same file path share a single [`LogFile`] and with it a single
/// file handle. Paths are normalized first, so `./access.log` and `access.log` are considered
/// identical. Entries are never removed.
#[derive(Debug, Default)]
pub struct AccessLogRegistry {
    files: Mutex<HashMap<PathBuf, Arc<LogFile>>>,
}

impl AccessLogRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the entire process.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    fn files(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<LogFile>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an access log, reusing the log file if it is already registered.
    ///
    /// The format is resolved before the log file is touched, so an invalid format leaves the
    /// registry unchanged.
    pub fn access_log(
        &self,
        path: impl AsRef<Path>,
        format: Option<Arc<CompiledFormat>>,
        pattern: &str,
    ) -> Result<AccessLog, Box<Error>> {
        let format = resolve_format(format, pattern)?;
        let file = self.log_file(path.as_ref())?;
        Ok(AccessLog::from_parts(format, file))
    }

    /// Returns the log file registered for the path, opening and registering it if necessary.
    pub fn log_file(&self, path: &Path) -> Result<Arc<LogFile>, Box<Error>> {
        let path = normalize_path(path)?;

        let mut files = self.files();
        if let Some(file) = files.get(&path) {
            return Ok(file.clone());
        }

        let file = Arc::new(LogFile::open(path.clone())?);
        debug!("Registered log file {}", path.display());
        files.insert(path, file.clone());
        Ok(file)
    }

    /// Checks whether a log file is registered for the path.
    pub fn contains(&self, path: &Path) -> bool {
        match normalize_path(path) {
            Ok(path) => self.files().contains_key(&path),
            Err(_) => false,
        }
    }

    /// Number of registered log files.
    pub fn len(&self) -> usize {
        self.files().len()
    }

    /// Checks whether no log files are registered.
    pub fn is_empty(&self) -> bool {
        self.files().is_empty()
    }

    /// Makes all registered log files reopen, e.g. after log rotation.
    pub fn reopen_all(&self) {
        for file in self.files().values() {
            file.reopen();
        }
    }

    /// Waits until all lines logged so far are written to all registered log files.
    ///
    /// # Panics
    ///
    /// This function panics if called within an asynchronous execution context.
    pub fn flush_all(&self) {
        let files: Vec<_> = self.files().values().cloned().collect();
        for file in files {
            file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::env::current_dir;
    use test_log::test;

    #[test]
    fn path_normalization() {
        let cwd = current_dir().unwrap().canonicalize().unwrap();
        let mut root = cwd.clone();
        while let Some(parent) = root.parent() {
            root = parent.into();
        }

        assert!(normalize_path(Path::new("")).is_err());
        assert_eq!(normalize_path(Path::new("-")).unwrap(), PathBuf::from("-"));
        assert_eq!(
            normalize_path(Path::new("file.txt")).unwrap(),
            cwd.join("file.txt")
        );
        assert_eq!(
            normalize_path(Path::new("./file.txt")).unwrap(),
            cwd.join("file.txt")
        );
        assert_eq!(
            normalize_path(Path::new("../file.txt")).unwrap(),
            cwd.parent().unwrap().join("file.txt")
        );
        assert_eq!(
            normalize_path(&cwd.join("file.txt")).unwrap(),
            cwd.join("file.txt")
        );
        assert_eq!(
            normalize_path(&root.join("file.txt")).unwrap(),
            root.join("file.txt")
        );
    }

    #[test]
    fn creates_parent_directories() {
        let dir = std::env::temp_dir().join(format!(
            "access-log-registry-test-{}-parents",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);

        let path = dir.join("deep").join("nested").join("access.log");
        let normalized = normalize_path(&path).unwrap();
        assert!(dir.join("deep").join("nested").is_dir());
        assert_eq!(normalized.file_name(), path.file_name());

        let _ = fs::remove_dir_all(&dir);
    }
}
