//! # Sidecar List
//!
//! Parses the configured sidecar list into a name → signal mapping.
//!
//! Each entry is either `name` (terminated with SIGTERM) or `name=signal`:
//!
//! ```
//! use sidecar_terminator::config::SidecarSpec;
//!
//! let spec = SidecarSpec::parse(["istio-proxy=9", "cloud-sql-proxy"]).unwrap();
//! assert_eq!(spec.signal("istio-proxy"), Some(9));
//! assert_eq!(spec.signal("cloud-sql-proxy"), Some(15));
//! ```

use crate::constants::{DEFAULT_SIGNAL, MAX_SIGNAL};
use crate::error::ConfigError;
use std::collections::BTreeMap;

/// Sidecar container names and the signal each one receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarSpec {
    signals: BTreeMap<String, u8>,
}

impl SidecarSpec {
    /// Parse sidecar entries, rejecting the whole list on the first bad entry.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for entries with more than one `=`, an empty
    /// name, a signal outside `1..=64`, a repeated name, or an empty list.
    pub fn parse<I, S>(entries: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut signals = BTreeMap::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            let (name, signal) = parse_entry(entry)?;
            if signals.insert(name.to_string(), signal).is_some() {
                return Err(ConfigError::DuplicateSidecar(name.to_string()));
            }
        }

        if signals.is_empty() {
            return Err(ConfigError::NoSidecars);
        }

        Ok(Self { signals })
    }

    /// Membership is exact name equality
    #[must_use]
    pub fn contains(&self, container: &str) -> bool {
        self.signals.contains_key(container)
    }

    #[must_use]
    pub fn signal(&self, container: &str) -> Option<u8> {
        self.signals.get(container).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u8)> {
        self.signals.iter().map(|(name, signal)| (name.as_str(), *signal))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

fn parse_entry(entry: &str) -> Result<(&str, u8), ConfigError> {
    let mut parts = entry.split('=');
    let name = parts.next().unwrap_or_default().trim();
    let signal = parts.next();

    if parts.next().is_some() {
        return Err(ConfigError::MalformedSidecar(entry.to_string()));
    }
    if name.is_empty() {
        return Err(ConfigError::EmptySidecarName(entry.to_string()));
    }

    let Some(raw) = signal else {
        return Ok((name, DEFAULT_SIGNAL));
    };

    let raw = raw.trim();
    match raw.parse::<u8>() {
        Ok(signal) if (1..=MAX_SIGNAL).contains(&signal) => Ok((name, signal)),
        _ => Err(ConfigError::InvalidSignal {
            sidecar: name.to_string(),
            value: raw.to_string(),
            max: MAX_SIGNAL,
        }),
    }
}
