use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sentinel for a `start_time` of negative infinity (a break marker).
pub const TIME_NEG_INF: i64 = i64::MIN;

/// Priority used for events that must sort before every time-keyed event.
pub const PRIORITY_MIN: i64 = i64::MIN;

/// Guest exit code meaning "reboot required".
pub const REBOOT_EXIT_CODE: i64 = 10;

/// One file or action attached to a schedule entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSpec {
    /// Stage a file from the vm_resources store at `location` in the guest.
    File {
        filename: String,
        location: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        executable: bool,
    },
    /// Write literal content at `location` in the guest.
    Content {
        content: String,
        location: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        executable: bool,
    },
    /// Pull files from `location` in the guest back to the host.
    Transfer {
        location: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destination: Option<String>,
    },
    /// Resume scheduling after a break.
    Resume,
}

/// A pause directive. A missing duration means an infinite pause (a break).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pause {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

impl Pause {
    pub fn is_break(&self) -> bool {
        self.duration.is_none()
    }
}

/// A single time-keyed instruction for one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    /// Seconds relative to experiment start. Negative values run during
    /// configuration; `TIME_NEG_INF` marks a break.
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<Pause>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore_failure: bool,
}

impl ScheduleEntry {
    pub fn executable(name: impl Into<String>, start_time: i64) -> ScheduleEntry {
        ScheduleEntry {
            start_time,
            executable: Some(name.into()),
            arguments: None,
            data: Vec::new(),
            pause: None,
            ignore_failure: false,
        }
    }

    pub fn pause(start_time: i64, duration: Option<u64>) -> ScheduleEntry {
        ScheduleEntry {
            start_time,
            executable: None,
            arguments: None,
            data: Vec::new(),
            pause: Some(Pause { duration }),
            ignore_failure: false,
        }
    }

    pub fn resume(start_time: i64) -> ScheduleEntry {
        ScheduleEntry {
            start_time,
            executable: None,
            arguments: None,
            data: vec![DataSpec::Resume],
            pause: None,
            ignore_failure: false,
        }
    }

    /// Filenames this entry stages from the vm_resources store.
    pub fn referenced_files(&self) -> impl Iterator<Item = &str> {
        self.data.iter().filter_map(|spec| match spec {
            DataSpec::File { filename, .. } => Some(filename.as_str()),
            _ => None,
        })
    }
}

/// Guest-side paths derived for an entry once its driver is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPaths {
    /// Unique working directory for the entry inside the guest.
    pub working_dir: String,
    /// Absolute path of the executable, or the bare name when it must be
    /// resolved from the guest's PATH.
    pub exec_path: String,
    /// Sentinel file whose presence after execution requests a reboot.
    pub reboot_file: String,
    /// Path of the generated call script.
    pub call_script: String,
    /// Body of the call script (shell on POSIX, batch on Windows).
    pub call_arguments: String,
}

/// The classification the schedule updater assigns to a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NewItem,
    Transfer,
    Pause,
    Resume,
}

/// Classify an entry by its pause flag and first data spec.
pub fn classify(entry: &ScheduleEntry) -> EventKind {
    if let Some(DataSpec::Transfer { .. }) = entry.data.first() {
        return EventKind::Transfer;
    }
    if entry.pause.is_some() {
        return EventKind::Pause;
    }
    if let Some(DataSpec::Resume) = entry.data.first() {
        return EventKind::Resume;
    }
    EventKind::NewItem
}

/// A schedule entry plus its supervision-time state.
#[derive(Debug, Clone)]
pub struct ScheduledItem {
    pub entry: ScheduleEntry,
    pub paths: Option<EntryPaths>,
    pub preloaded: bool,
    pub reboot: bool,
}

impl ScheduledItem {
    pub fn new(entry: ScheduleEntry) -> ScheduledItem {
        ScheduledItem {
            entry,
            paths: None,
            preloaded: false,
            reboot: false,
        }
    }
}

/// Events flowing from the schedule updater to the supervisor.
#[derive(Debug, Clone)]
pub enum ScheduleEvent {
    NewItem(ScheduledItem),
    Transfer(ScheduledItem),
    /// Start time has been elected; carries seconds since the Unix epoch.
    ExperimentStartTimeSet(u64),
    /// The first poll returned no entries at all.
    EmptySchedule,
    /// Stop the supervisor with the given exit code (used by tests).
    Exit(i32),
}

#[derive(Debug, Clone)]
struct QueuedEvent {
    priority: i64,
    seq: u64,
    event: ScheduleEvent,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ties are broken by arrival order.
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Priority queue of schedule events shared by the updater thread and the
/// supervisor's dispatch loop, paired with its wakeup condition.
pub struct EventQueue {
    heap: Mutex<QueueState>,
    condvar: Condvar,
}

struct QueueState {
    heap: BinaryHeap<Reverse<QueuedEvent>>,
    next_seq: u64,
}

impl Default for EventQueue {
    fn default() -> Self {
        EventQueue::new()
    }
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue {
            heap: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Push one event and wake a waiting consumer.
    pub fn push(&self, priority: i64, event: ScheduleEvent) {
        let mut state = self.heap.lock().expect("event queue poisoned");
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Reverse(QueuedEvent {
            priority,
            seq,
            event,
        }));
        self.condvar.notify_one();
    }

    /// Push a batch atomically, notifying once after the last event. The
    /// supervisor must observe a full poll's worth of entries together.
    pub fn push_batch(&self, events: Vec<(i64, ScheduleEvent)>) {
        if events.is_empty() {
            return;
        }
        let mut state = self.heap.lock().expect("event queue poisoned");
        for (priority, event) in events {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Reverse(QueuedEvent {
                priority,
                seq,
                event,
            }));
        }
        self.condvar.notify_one();
    }

    /// Run `process` over the queued events under the lock. The closure sees
    /// every pending `(priority, event)` pair in priority order and leaves
    /// behind whatever it does not consume. Returning `None` parks the caller
    /// on the condition variable until the next push (or a short timeout),
    /// after which the pass is retried. Side effects inside the closure run
    /// before the wait, which the readiness barrier depends on.
    pub fn wait_process<R, F>(&self, mut process: F) -> R
    where
        F: FnMut(&mut Vec<(i64, ScheduleEvent)>) -> Option<R>,
    {
        let mut state = self.heap.lock().expect("event queue poisoned");
        loop {
            let mut pending: Vec<(i64, ScheduleEvent)> = Vec::new();
            while let Some(Reverse(queued)) = state.heap.pop() {
                pending.push((queued.priority, queued.event));
            }
            let outcome = process(&mut pending);
            for (priority, event) in pending {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.heap.push(Reverse(QueuedEvent {
                    priority,
                    seq,
                    event,
                }));
            }
            if let Some(result) = outcome {
                return result;
            }
            state = self
                .condvar
                .wait_timeout(state, Duration::from_millis(500))
                .expect("event queue poisoned")
                .0;
        }
    }

    /// Drain every pending event, waiting until at least one is available.
    pub fn drain_eligible<F>(&self, mut drain: F) -> Vec<ScheduleEvent>
    where
        F: FnMut(&mut Vec<(i64, ScheduleEvent)>) -> Vec<ScheduleEvent>,
    {
        self.wait_process(|pending| {
            let selected = drain(pending);
            if selected.is_empty() {
                None
            } else {
                Some(selected)
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().expect("event queue poisoned").heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("event queue poisoned").heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_follows_first_data_spec() {
        let transfer = ScheduleEntry {
            start_time: -10,
            executable: None,
            arguments: None,
            data: vec![DataSpec::Transfer {
                location: "/var/log/app.log".to_string(),
                interval: Some(30),
                destination: None,
            }],
            pause: None,
            ignore_failure: false,
        };
        assert_eq!(classify(&transfer), EventKind::Transfer);

        assert_eq!(
            classify(&ScheduleEntry::pause(0, Some(10))),
            EventKind::Pause
        );
        assert_eq!(classify(&ScheduleEntry::resume(5)), EventKind::Resume);
        assert_eq!(
            classify(&ScheduleEntry::executable("run.sh", -5)),
            EventKind::NewItem
        );
    }

    #[test]
    fn entry_serialization_round_trips_tagged_specs() {
        let entry = ScheduleEntry {
            start_time: -100,
            executable: Some("configure.sh".to_string()),
            arguments: Some("--fast".to_string()),
            data: vec![
                DataSpec::File {
                    filename: "configure.sh".to_string(),
                    location: "configure.sh".to_string(),
                    executable: true,
                },
                DataSpec::Content {
                    content: "hosts=10".to_string(),
                    location: "/etc/app.conf".to_string(),
                    executable: false,
                },
            ],
            pause: None,
            ignore_failure: true,
        };
        let encoded = serde_json::to_string(&entry).expect("encode");
        let decoded: ScheduleEntry = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn queue_orders_by_priority_then_arrival() {
        let queue = EventQueue::new();
        queue.push(5, ScheduleEvent::Exit(1));
        queue.push(-3, ScheduleEvent::Exit(2));
        queue.push(5, ScheduleEvent::Exit(3));
        queue.push(PRIORITY_MIN, ScheduleEvent::EmptySchedule);

        let drained = queue.drain_eligible(|pending| {
            pending
                .drain(..)
                .map(|(_, event)| event)
                .collect::<Vec<_>>()
        });

        let codes: Vec<i32> = drained
            .iter()
            .map(|event| match event {
                ScheduleEvent::EmptySchedule => 0,
                ScheduleEvent::Exit(code) => *code,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(codes, vec![0, 2, 1, 3]);
    }
}
