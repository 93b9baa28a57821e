//! In-memory secret store fed from `type:key:password` triples.

use crate::ports::SecretStore;
use crate::{Error, Result};
use std::collections::HashMap;
use std::str::FromStr;

/// One secret as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub kind: String,
    pub key: String,
    pub value: String,
}

impl FromStr for SecretSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.splitn(3, ':').collect();
        match parts.as_slice() {
            [kind, key, value] if !kind.is_empty() && !key.is_empty() => Ok(Self {
                kind: kind.to_string(),
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => Err(Error::Serialization(format!(
                "Secret must be formatted as type:key:password, got {} part(s)",
                parts.len()
            ))),
        }
    }
}

/// Secrets held in process memory for the duration of one build.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<(String, String), String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, spec: SecretSpec) -> Self {
        self.insert(spec);
        self
    }

    pub fn insert(&mut self, spec: SecretSpec) {
        self.secrets.insert((spec.kind, spec.key), spec.value);
    }

    /// Build a store from raw `type:key:password` strings.
    pub fn parse_all<I, S>(raw: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut store = Self::new();
        for item in raw {
            store.insert(item.as_ref().parse()?);
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl SecretStore for StaticSecretStore {
    fn get(&self, kind: &str, key: &str) -> Result<String> {
        self.secrets
            .get(&(kind.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| Error::SecretNotFound(format!("{}:{}", kind, key)))
    }
}
