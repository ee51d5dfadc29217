//! The durable record of one job: an attribute-addressed mapping with
//! per-attribute dirty tracking. The engine reads identity, destination and
//! state attributes out of it and writes state and diagnostic attributes
//! back; the persistence layer commits whatever is dirty.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::common::ids::JobId;
use crate::{Map, Set};

pub const ATTR_CLUSTER_ID: &str = "ClusterId";
pub const ATTR_PROC_ID: &str = "ProcId";
pub const ATTR_JOB_STATUS: &str = "JobStatus";
pub const ATTR_REMOTE_ENDPOINT: &str = "RemoteEndpoint";
pub const ATTR_REMOTE_JOB_ID: &str = "RemoteJobId";
pub const ATTR_REMOTE_JOB_STATUS: &str = "RemoteJobStatus";
pub const ATTR_CREDENTIAL_FILE: &str = "CredentialFile";
pub const ATTR_HOLD_REASON: &str = "HoldReason";
pub const ATTR_HOLD_REASON_CODE: &str = "HoldReasonCode";
pub const ATTR_REMOTE_WALL_CLOCK: &str = "RemoteWallClockTime";
pub const ATTR_LEASE_DURATION: &str = "JobLeaseDuration";
pub const ATTR_LEASE_SENT_EXPIRATION: &str = "JobLeaseSentExpiration";
pub const ATTR_LEASE_RECEIVED_EXPIRATION: &str = "JobLeaseReceivedExpiration";
pub const ATTR_LEASE_RENEWAL_FAILED: &str = "LastLeaseRenewalFailed";
pub const ATTR_SUBMIT_ATTEMPTS: &str = "NumSubmitAttempts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl AttrValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(v) => Some(*v),
            AttrValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::String(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::String(v)
    }
}

/// One attribute as handed to the persistence layer: `None` marks a deleted
/// attribute.
pub type AttrUpdate = (String, Option<AttrValue>);

#[derive(Debug, Clone, Default)]
pub struct JobDescriptor {
    attrs: Map<String, AttrValue>,
    dirty: Set<String>,
}

impl JobDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a descriptor from already-committed attributes (nothing dirty).
    pub fn from_attrs<I, V>(attrs: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, V)>,
        V: Into<AttrValue>,
    {
        Self {
            attrs: attrs
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.into()))
                .collect(),
            dirty: Set::default(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttrValue::as_int)
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(AttrValue::as_float)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(AttrValue::as_bool)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttrValue::as_str)
    }

    pub fn get_time(&self, name: &str) -> Option<SystemTime> {
        self.get_int(name)
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64))
    }

    /// Sets an attribute, dirtying it only when the value actually changes.
    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) {
        let value = value.into();
        if self.attrs.get(name) == Some(&value) {
            return;
        }
        self.attrs.insert(name.to_string(), value);
        self.dirty.insert(name.to_string());
    }

    pub fn set_time(&mut self, name: &str, value: SystemTime) {
        let secs = value
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64;
        self.set(name, secs);
    }

    /// Deletes an attribute; the deletion itself is a dirty change.
    pub fn clear_attr(&mut self, name: &str) {
        if self.attrs.remove(name).is_some() {
            self.dirty.insert(name.to_string());
        }
    }

    /// Merges committed attributes delivered by the persistence layer.
    /// Attributes the engine itself has dirtied are left alone so a stale
    /// refresh cannot roll back an in-flight change.
    pub fn refresh_from(&mut self, attrs: &Map<String, AttrValue>) {
        for (name, value) in attrs {
            if !self.dirty.contains(name) {
                self.attrs.insert(name.clone(), value.clone());
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_attrs(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Snapshot of the dirty attributes for an update request. The dirty set
    /// is left untouched; it is cleared when the commit is acknowledged.
    pub fn dirty_snapshot(&self) -> Vec<AttrUpdate> {
        self.dirty
            .iter()
            .map(|name| (name.clone(), self.attrs.get(name).cloned()))
            .collect()
    }

    /// Marks the given attributes as committed.
    pub fn clear_dirty<'a>(&mut self, attrs: impl IntoIterator<Item = &'a str>) {
        for name in attrs {
            self.dirty.remove(name);
        }
    }

    /// The (cluster, proc) identity, if both attributes are present.
    pub fn job_id(&self) -> Option<JobId> {
        let cluster = self.get_int(ATTR_CLUSTER_ID)?;
        let proc = self.get_int(ATTR_PROC_ID)?;
        Some(JobId::new(cluster as u32, proc as u32))
    }

    pub fn attrs(&self) -> &Map<String, AttrValue> {
        &self.attrs
    }
}
