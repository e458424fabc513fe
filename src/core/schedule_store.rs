use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::coordination::CoordinationClient;
use crate::core::schedule::ScheduleEntry;
use crate::error::Result;

/// Read access to per-VM schedules, as consumed by the schedule updater.
pub trait ScheduleSource: Send + Sync {
    /// The full ordered schedule for a VM (empty when none exists).
    fn get(&self, name: &str) -> Result<Vec<ScheduleEntry>>;
}

/// The durable per-VM schedule table, keyed by VM name. Producers replace or
/// append; consumers poll `get` and track their own length cursor.
pub struct ScheduleDb {
    client: Arc<CoordinationClient>,
}

impl ScheduleDb {
    pub fn new(client: Arc<CoordinationClient>) -> ScheduleDb {
        ScheduleDb { client }
    }

    /// Replace a VM's schedule entirely.
    pub fn put(&self, name: &str, entries: &[ScheduleEntry]) -> Result<()> {
        self.client.put_schedule(name, entries)
    }

    /// Append entries to a VM's schedule. Existing positions are never
    /// reordered, so a consumer that saw length `n` reads exactly the new
    /// tail.
    pub fn extend(&self, name: &str, entries: &[ScheduleEntry]) -> Result<()> {
        self.client.extend_schedule(name, entries)
    }
}

impl ScheduleSource for ScheduleDb {
    fn get(&self, name: &str) -> Result<Vec<ScheduleEntry>> {
        self.client.get_schedule(name)
    }
}

/// In-memory schedule table with the same contract, for tests and dry runs.
#[derive(Default)]
pub struct MemoryScheduleDb {
    schedules: Mutex<BTreeMap<String, Vec<ScheduleEntry>>>,
}

impl MemoryScheduleDb {
    pub fn new() -> MemoryScheduleDb {
        MemoryScheduleDb::default()
    }

    pub fn put(&self, name: &str, entries: &[ScheduleEntry]) {
        self.schedules
            .lock()
            .expect("schedule table poisoned")
            .insert(name.to_string(), entries.to_vec());
    }

    pub fn extend(&self, name: &str, entries: &[ScheduleEntry]) {
        self.schedules
            .lock()
            .expect("schedule table poisoned")
            .entry(name.to_string())
            .or_default()
            .extend(entries.iter().cloned());
    }
}

impl ScheduleSource for MemoryScheduleDb {
    fn get(&self, name: &str) -> Result<Vec<ScheduleEntry>> {
        Ok(self
            .schedules
            .lock()
            .expect("schedule table poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::ScheduleEntry;

    #[test]
    fn extend_appends_without_reordering() {
        let db = MemoryScheduleDb::new();
        db.put(
            "vm-1",
            &[
                ScheduleEntry::executable("a.sh", -10),
                ScheduleEntry::executable("b.sh", -5),
            ],
        );
        db.extend("vm-1", &[ScheduleEntry::executable("c.sh", 3)]);

        let full = db.get("vm-1").expect("get");
        let cursor = 2;
        let delta = &full[cursor..];
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].executable.as_deref(), Some("c.sh"));
        assert_eq!(full[0].executable.as_deref(), Some("a.sh"));
    }

    #[test]
    fn missing_vm_reads_empty() {
        let db = MemoryScheduleDb::new();
        assert!(db.get("ghost").expect("get").is_empty());
    }
}
