//! Device twin documents

use crate::error::{HubError, HubResult};
use crate::protocol::{Mapping, Value};
use std::ops::Deref;

/// Key holding the document version
pub const VERSION_KEY: &str = "$version";

/// Immutable snapshot of one half (desired or reported) of a device twin
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinState(Mapping);

impl TwinState {
    pub fn new(properties: Mapping) -> Self {
        Self(properties)
    }

    /// Decode a JSON object
    pub fn from_json(payload: &[u8]) -> HubResult<Self> {
        Value::from_json_slice(payload)?.into_mapping().map(Self)
    }

    /// Version the hub stamped on this snapshot
    pub fn version(&self) -> HubResult<i64> {
        self.0
            .get(VERSION_KEY)
            .ok_or_else(|| HubError::decode("twin state has no $version"))?
            .as_i64()
            .map_err(|e| HubError::decode(format!("$version: {e}")))
    }

    /// Copy with `key` set; a `Value::Null` marks the key for removal on update
    pub fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut properties = self.0.clone();
        properties.insert(key.into(), value.into());
        Self(properties)
    }

    pub fn into_mapping(self) -> Mapping {
        self.0
    }

    pub fn to_json(&self) -> HubResult<Vec<u8>> {
        Value::Mapping(self.0.clone()).to_json_vec()
    }
}

impl Deref for TwinState {
    type Target = Mapping;

    fn deref(&self) -> &Mapping {
        &self.0
    }
}

impl From<Mapping> for TwinState {
    fn from(properties: Mapping) -> Self {
        Self(properties)
    }
}

/// Split a full twin document into its desired and reported halves
pub(crate) fn split_document(document: &[u8]) -> HubResult<(TwinState, TwinState)> {
    let mut root = Value::from_json_slice(document)?.into_mapping()?;
    let mut half = |name: &str| -> HubResult<TwinState> {
        match root.remove(name) {
            Some(value) => value
                .into_mapping()
                .map(TwinState)
                .map_err(|e| HubError::decode(format!("{name}: {e}"))),
            None => Ok(TwinState::default()),
        }
    };
    let desired = half("desired")?;
    let reported = half("reported")?;
    Ok((desired, reported))
}
