use std::{cell::RefCell, collections::HashMap, rc::Rc};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::DeviceError;

/// Logical record groups kept in the persistent store. Each namespace holds a
/// single JSON record so related fields are always replaced together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    NetworkCredentials,
    ScheduleSettings,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkCredentials => "network-credentials",
            Self::ScheduleSettings => "schedule-settings",
        }
    }

    /// Key for backends with short key limits (NVS allows 15 bytes).
    pub fn short_key(self) -> &'static str {
        match self {
            Self::NetworkCredentials => "net_creds",
            Self::ScheduleSettings => "schedule",
        }
    }
}

pub trait KeyValueStore {
    fn read(&self, namespace: Namespace) -> Result<Option<String>, DeviceError>;

    /// Replaces the whole record for `namespace` in one operation.
    fn write(&mut self, namespace: Namespace, record: &str) -> Result<(), DeviceError>;

    fn erase(&mut self, namespace: Namespace) -> Result<(), DeviceError>;
}

pub fn load_record<T: DeserializeOwned>(
    store: &impl KeyValueStore,
    namespace: Namespace,
) -> Result<Option<T>, DeviceError> {
    let Some(raw) = store.read(namespace)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| DeviceError::persistence(namespace.as_str(), err))
}

pub fn save_record<T: Serialize>(
    store: &mut impl KeyValueStore,
    namespace: Namespace,
    record: &T,
) -> Result<(), DeviceError> {
    let raw = serde_json::to_string(record)
        .map_err(|err| DeviceError::persistence(namespace.as_str(), err))?;
    store.write(namespace, &raw)
}

#[derive(Debug, Default)]
struct MemoryRecords {
    records: HashMap<Namespace, String>,
    writes: usize,
    fail_writes: bool,
}

/// In-memory store. Clones share the same records, which lets a test keep a
/// handle while the device components own theirs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Rc<RefCell<MemoryRecords>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, namespace: Namespace, record: &str) -> Self {
        self.inner
            .borrow_mut()
            .records
            .insert(namespace, record.to_string());
        self
    }

    pub fn write_count(&self) -> usize {
        self.inner.borrow().writes
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.borrow_mut().fail_writes = fail;
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, namespace: Namespace) -> Result<Option<String>, DeviceError> {
        Ok(self.inner.borrow().records.get(&namespace).cloned())
    }

    fn write(&mut self, namespace: Namespace, record: &str) -> Result<(), DeviceError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_writes {
            return Err(DeviceError::persistence(namespace.as_str(), "write rejected"));
        }
        inner.records.insert(namespace, record.to_string());
        inner.writes += 1;
        Ok(())
    }

    fn erase(&mut self, namespace: Namespace) -> Result<(), DeviceError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_writes {
            return Err(DeviceError::persistence(namespace.as_str(), "erase rejected"));
        }
        inner.records.remove(&namespace);
        Ok(())
    }
}
