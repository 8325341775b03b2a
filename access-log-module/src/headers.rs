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

//! Header lookup for request and response header maps

use std::collections::{BTreeMap, HashMap};
use std::hash::BuildHasher;

/// Read access to the headers of a request or response
///
/// Lookups match header names exactly, including case.
pub trait HeaderProvider {
    /// Returns the value of the header with the given name, if present.
    fn header(&self, name: &str) -> Option<&str>;
}

impl<S: BuildHasher> HeaderProvider for HashMap<String, String, S> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl<'a, S: BuildHasher> HeaderProvider for HashMap<&'a str, &'a str, S> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).copied()
    }
}

impl HeaderProvider for BTreeMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

/// No headers, e.g. for plain TCP connections
impl HeaderProvider for () {
    fn header(&self, _name: &str) -> Option<&str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn case_sensitive_lookup() {
        let headers = HashMap::from([("Server".to_owned(), "proxy".to_owned())]);
        assert_eq!(headers.header("Server"), Some("proxy"));
        assert_eq!(headers.header("server"), None);

        let headers = HashMap::from([("service", "test")]);
        assert_eq!(headers.header("service"), Some("test"));
        assert_eq!(headers.header("Service"), None);

        let headers = BTreeMap::from([("X-Id".to_owned(), "1".to_owned())]);
        assert_eq!(headers.header("X-Id"), Some("1"));
        assert_eq!(headers.header("x-id"), None);

        assert_eq!(().header("Server"), None);
    }
}
