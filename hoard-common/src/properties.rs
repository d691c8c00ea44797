// Copyright 2025 hoard Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

/// Flat string-keyed option map handed to a backend at open time.
///
/// Unrecognized keys are ignored by the consumer. A value that fails to parse is a deployment
/// error and is surfaced at open time rather than tolerated at runtime.
#[derive(Debug, Clone, Default)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    /// Create an empty option map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Set an option.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.insert(key.into(), value.to_string());
    }

    /// Check if an option is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Get the raw string value of an option.
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Get an option parsed as `T`, or `None` if absent.
    pub fn get<T>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.entries.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid value {raw:?} for option {key:?}: {e}")),
        }
    }

    /// Get an option parsed as `T`, falling back to `default` if absent.
    pub fn get_or<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.get(key)?.unwrap_or(default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let props = Properties::new().with("view-size", 4096).with("file-name", "/tmp/arena");
        assert_eq!(props.get::<usize>("view-size").unwrap(), Some(4096));
        assert_eq!(props.get::<usize>("num-views").unwrap(), None);
        assert_eq!(props.get_or::<usize>("num-views", 8).unwrap(), 8);
        assert!(props.get::<usize>("file-name").is_err());
    }
}
