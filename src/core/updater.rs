use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use crate::core::coordination::Coordination;
use crate::core::logs::LogSink;
use crate::core::schedule::{
    classify, EventKind, EventQueue, Pause, ScheduleEntry, ScheduleEvent, ScheduledItem,
    PRIORITY_MIN, TIME_NEG_INF,
};
use crate::core::schedule_store::ScheduleSource;
use crate::core::store::FileStore;

/// Translates the append-only schedule into time-keyed events, applying
/// pause, break, and resume arithmetic. State persists across polls: an
/// active break keeps buffering entries until a resume arrives.
#[derive(Default)]
pub struct ScheduleTransform {
    saved_len: usize,
    found_break: bool,
    break_start: i64,
    break_items: Vec<ScheduleEntry>,
    schedule_not_received: bool,
}

/// One poll's worth of translated events.
pub struct PollOutput {
    /// `(adjusted_start_time, event)` pairs ready for the shared queue.
    pub events: Vec<(i64, ScheduleEvent)>,
    /// Whether the poll observed any new schedule entries.
    pub received_any: bool,
    /// Set once, on the first poll that returns an entirely empty schedule.
    pub empty_schedule: bool,
}

impl ScheduleTransform {
    pub fn new() -> ScheduleTransform {
        ScheduleTransform {
            schedule_not_received: true,
            ..ScheduleTransform::default()
        }
    }

    /// Number of entries already consumed from the schedule.
    pub fn cursor(&self) -> usize {
        self.saved_len
    }

    /// Process a full schedule snapshot. Only the tail past the cursor is
    /// examined; `elapsed_since_start` is consulted when a resume fires.
    pub fn process_poll(
        &mut self,
        full_schedule: &[ScheduleEntry],
        elapsed_since_start: impl Fn() -> Option<u64>,
    ) -> PollOutput {
        let new_items = if self.saved_len < full_schedule.len() {
            full_schedule[self.saved_len..].to_vec()
        } else {
            Vec::new()
        };
        self.saved_len = full_schedule.len().max(self.saved_len);

        let received_any = !new_items.is_empty();
        let mut empty_schedule = false;
        if received_any {
            self.schedule_not_received = false;
        } else if full_schedule.is_empty() && self.schedule_not_received {
            self.schedule_not_received = false;
            empty_schedule = true;
        }

        // Stable sort keeps arrival order among equal start times.
        let mut pending = new_items;
        pending.sort_by_key(|entry| entry.start_time);

        let mut events: Vec<(i64, ScheduleEvent)> = Vec::new();
        let mut pause_amount: i64 = 0;
        // An active break keeps buffering; a new break in this poll starts
        // buffering from that point.
        let mut buffering = self.found_break;

        for entry in pending {
            match classify(&entry) {
                EventKind::Resume => {
                    let resume_time = elapsed_since_start().unwrap_or(0) as i64;
                    self.found_break = false;
                    buffering = false;
                    // Re-emit everything buffered behind the break as if the
                    // break had taken zero seconds of schedule time.
                    let buffered = std::mem::take(&mut self.break_items);
                    for buffered_entry in buffered {
                        match classify(&buffered_entry) {
                            EventKind::Pause => {
                                self.apply_pause(
                                    &buffered_entry,
                                    &mut pause_amount,
                                    &mut buffering,
                                );
                            }
                            EventKind::Resume => {}
                            kind => {
                                let rewritten = buffered_entry.start_time
                                    - self.break_start
                                    + resume_time
                                    + pause_amount;
                                let mut adjusted = buffered_entry;
                                adjusted.start_time = rewritten;
                                events.push((rewritten, wrap(kind, adjusted)));
                            }
                        }
                    }
                }
                _ if buffering => {
                    self.break_items.push(entry);
                }
                EventKind::Pause => {
                    self.apply_pause(&entry, &mut pause_amount, &mut buffering);
                }
                kind => {
                    let mut adjusted = entry;
                    if pause_amount > 0 {
                        adjusted.start_time += pause_amount;
                    }
                    let start_time = adjusted.start_time;
                    events.push((start_time, wrap(kind, adjusted)));
                }
            }
        }

        PollOutput {
            events,
            received_any,
            empty_schedule,
        }
    }

    fn apply_pause(&mut self, entry: &ScheduleEntry, pause_amount: &mut i64, buffering: &mut bool) {
        let Some(Pause { duration }) = entry.pause else {
            return;
        };
        match duration {
            // An infinite pause is a break.
            None => {
                self.found_break = true;
                *buffering = true;
                self.break_start = if entry.start_time == TIME_NEG_INF {
                    0
                } else {
                    entry.start_time
                };
            }
            Some(duration) => *pause_amount += duration as i64,
        }
    }
}

fn wrap(kind: EventKind, entry: ScheduleEntry) -> ScheduleEvent {
    let item = ScheduledItem::new(entry);
    match kind {
        EventKind::Transfer => ScheduleEvent::Transfer(item),
        _ => ScheduleEvent::NewItem(item),
    }
}

/// Everything the updater thread needs to poll on behalf of one VM.
pub struct UpdaterContext {
    pub vm_name: String,
    pub queue: Arc<EventQueue>,
    pub schedule: Arc<dyn ScheduleSource>,
    pub coordination: Arc<dyn Coordination>,
    /// Resource store used for best-effort warming of referenced files.
    pub store: Option<Arc<FileStore>>,
    pub log: LogSink,
    pub load_balance_factor: f64,
    pub interval: Duration,
}

/// The per-VM updater thread handle.
pub struct ScheduleUpdater {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduleUpdater {
    /// Start the polling thread.
    pub fn spawn(context: UpdaterContext) -> ScheduleUpdater {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            context.log.info("ScheduleUpdater: starting the poll loop");
            run_loop(&context, &stop_flag);
            context.log.info("ScheduleUpdater: exiting");
        });
        ScheduleUpdater {
            stop,
            handle: Some(handle),
        }
    }

    /// Ask the thread to stop and wait for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(context: &UpdaterContext, stop: &AtomicBool) {
    let mut transform = ScheduleTransform::new();
    let mut start_time_seen = false;

    loop {
        if stop.load(Ordering::SeqCst) {
            context.log.debug("updater returning");
            return;
        }

        let full_schedule = match context.schedule.get(&context.vm_name) {
            Ok(schedule) => schedule,
            Err(err) => {
                context.log.debug(&format!(
                    "error while getting schedule ({err}); sleeping a random amount"
                ));
                let jitter = rand::thread_rng().gen_range(2..=15) as f64;
                sleep_scaled(context.load_balance_factor, jitter);
                continue;
            }
        };

        // Warm referenced files into the local cache so they are present
        // when the supervisor needs them. Best effort: a failure here is
        // retried just-in-time at load.
        if let Some(store) = &context.store {
            for entry in full_schedule.iter().skip(transform.cursor()) {
                for filename in entry.referenced_files() {
                    if let Err(err) = store.get_path(filename) {
                        context.log.error(&format!(
                            "Unable to get file: {filename}. Will try again \
                             just-in-time ({err})"
                        ));
                    }
                }
            }
        }

        let coordination = Arc::clone(&context.coordination);
        let output = transform.process_poll(&full_schedule, || {
            coordination.experiment_time_since_start().unwrap_or(None)
        });

        // All of a poll's items enter the queue before the consumer wakes.
        context.queue.push_batch(output.events);

        if output.empty_schedule {
            context
                .queue
                .push(PRIORITY_MIN, ScheduleEvent::EmptySchedule);
        }

        if !start_time_seen {
            match context.coordination.try_experiment_start_time() {
                Ok(Some(timestamp)) => {
                    start_time_seen = true;
                    context
                        .queue
                        .push(PRIORITY_MIN, ScheduleEvent::ExperimentStartTimeSet(timestamp));
                }
                Ok(None) => {}
                Err(err) => {
                    context
                        .log
                        .error(&format!("unable to get experiment start time: {err}"));
                }
            }
        }

        sleep_scaled(
            context.load_balance_factor,
            context.interval.as_secs_f64(),
        );
    }
}

fn sleep_scaled(load_balance_factor: f64, seconds: f64) {
    thread::sleep(Duration::from_secs_f64(
        (load_balance_factor * seconds).max(0.0),
    ));
}

/// Scale factor applied to sleeps so heavily committed hosts poll less
/// aggressively: `1 + committed vcpus / logical cpus`.
pub fn load_balance_factor(vcpu_commit: u32) -> f64 {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    let cpus = system.cpus().len().max(1);
    1.0 + f64::from(vcpu_commit) / cpus as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::DataSpec;

    fn starts(output: &PollOutput) -> Vec<(i64, String)> {
        output
            .events
            .iter()
            .map(|(start, event)| {
                let name = match event {
                    ScheduleEvent::NewItem(item) => item
                        .entry
                        .executable
                        .clone()
                        .unwrap_or_else(|| "<data>".to_string()),
                    ScheduleEvent::Transfer(_) => "<transfer>".to_string(),
                    other => format!("{other:?}"),
                };
                (*start, name)
            })
            .collect()
    }

    #[test]
    fn delta_reads_only_the_tail() {
        let mut transform = ScheduleTransform::new();
        let mut schedule = vec![
            ScheduleEntry::executable("a.sh", -10),
            ScheduleEntry::executable("b.sh", -5),
        ];
        let first = transform.process_poll(&schedule, || None);
        assert_eq!(first.events.len(), 2);

        schedule.push(ScheduleEntry::executable("c.sh", 3));
        let second = transform.process_poll(&schedule, || None);
        assert_eq!(starts(&second), vec![(3, "c.sh".to_string())]);
    }

    #[test]
    fn empty_schedule_emits_sentinel_exactly_once() {
        let mut transform = ScheduleTransform::new();
        let first = transform.process_poll(&[], || None);
        assert!(first.empty_schedule);
        assert!(!first.received_any);

        let second = transform.process_poll(&[], || None);
        assert!(!second.empty_schedule);
    }

    #[test]
    fn finite_pause_shifts_strictly_later_entries() {
        let mut transform = ScheduleTransform::new();
        let schedule = vec![
            ScheduleEntry::pause(0, Some(10)),
            ScheduleEntry::executable("x.sh", 3),
            ScheduleEntry::executable("y.sh", 7),
        ];
        let output = transform.process_poll(&schedule, || None);
        assert_eq!(
            starts(&output),
            vec![(13, "x.sh".to_string()), (17, "y.sh".to_string())]
        );
    }

    #[test]
    fn pause_does_not_shift_concurrent_entries() {
        let mut transform = ScheduleTransform::new();
        // Same start time as the pause, but queued ahead of it by arrival.
        let schedule = vec![
            ScheduleEntry::executable("first.sh", 0),
            ScheduleEntry::pause(0, Some(10)),
            ScheduleEntry::executable("later.sh", 4),
        ];
        let output = transform.process_poll(&schedule, || None);
        assert_eq!(
            starts(&output),
            vec![(0, "first.sh".to_string()), (14, "later.sh".to_string())]
        );
    }

    #[test]
    fn break_buffers_until_resume_rewrites() {
        let mut transform = ScheduleTransform::new();
        let schedule = vec![
            ScheduleEntry::pause(0, None),
            ScheduleEntry::executable("x.sh", 2),
            ScheduleEntry::resume(5),
        ];
        // Elapsed experiment time at resume is 50 seconds.
        let output = transform.process_poll(&schedule, || Some(50));
        assert_eq!(starts(&output), vec![(52, "x.sh".to_string())]);
    }

    #[test]
    fn break_spans_polls_and_buffers_new_entries() {
        let mut transform = ScheduleTransform::new();
        let mut schedule = vec![
            ScheduleEntry::pause(TIME_NEG_INF, None),
            ScheduleEntry::executable("x.sh", 2),
        ];
        let first = transform.process_poll(&schedule, || None);
        assert!(first.events.is_empty());

        // Entries observed during the break are buffered, not emitted.
        schedule.push(ScheduleEntry::executable("y.sh", 4));
        let second = transform.process_poll(&schedule, || None);
        assert!(second.events.is_empty());

        // The resume re-emits everything, rewritten to elapsed time.
        schedule.push(ScheduleEntry::resume(6));
        let third = transform.process_poll(&schedule, || Some(100));
        assert_eq!(
            starts(&third),
            vec![(102, "x.sh".to_string()), (104, "y.sh".to_string())]
        );
    }

    #[test]
    fn resume_without_start_time_defaults_to_zero() {
        let mut transform = ScheduleTransform::new();
        let schedule = vec![
            ScheduleEntry::pause(0, None),
            ScheduleEntry::executable("x.sh", 9),
            ScheduleEntry::resume(10),
        ];
        let output = transform.process_poll(&schedule, || None);
        assert_eq!(starts(&output), vec![(9, "x.sh".to_string())]);
    }

    #[test]
    fn transfers_classify_by_leading_data_spec() {
        let mut transform = ScheduleTransform::new();
        let schedule = vec![ScheduleEntry {
            start_time: -5,
            executable: None,
            arguments: None,
            data: vec![DataSpec::Transfer {
                location: "/var/log/app.log".to_string(),
                interval: Some(60),
                destination: None,
            }],
            pause: None,
            ignore_failure: false,
        }];
        let output = transform.process_poll(&schedule, || None);
        assert!(matches!(
            output.events.as_slice(),
            [(-5, ScheduleEvent::Transfer(_))]
        ));
    }
}
