use std::sync::{Mutex, MutexGuard};

use engine::timeline::TierAttemptResult;

type AttemptObserver = Box<dyn Fn(&TierAttemptResult) + Send + Sync>;

/// Append-only record of every tier attempt in a job. The only mutable
/// state shared between generation workers.
#[derive(Default)]
pub struct AttemptLog {
    entries: Mutex<Vec<TierAttemptResult>>,
    observer: Option<AttemptObserver>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// `observer` sees each entry once, in append order, while the log lock is held.
    pub fn with_observer(observer: impl Fn(&TierAttemptResult) + Send + Sync + 'static) -> Self {
        AttemptLog {
            entries: Mutex::new(Vec::new()),
            observer: Some(Box::new(observer)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<TierAttemptResult>> {
        // Entries are only ever pushed; a poisoned guard still holds a valid log.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn append(&self, entry: TierAttemptResult) {
        let mut entries = self.entries();
        if let Some(observer) = &self.observer {
            observer(&entry);
        }
        entries.push(entry);
    }

    pub fn snapshot(&self) -> Vec<TierAttemptResult> {
        self.entries().clone()
    }

    pub fn for_request(&self, sequence_index: usize) -> Vec<TierAttemptResult> {
        self.entries()
            .iter()
            .filter(|e| e.sequence_index == sequence_index)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::timeline::Tier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn entry(sequence_index: usize, attempt_number: u32) -> TierAttemptResult {
        TierAttemptResult {
            sequence_index,
            tier: Tier::Primary,
            attempt_number,
            success: false,
            produced_artifact_path: None,
            failure_reason: Some("transient".to_string()),
            measured_duration_ticks: None,
        }
    }

    #[test]
    fn entries_are_kept_in_append_order() {
        let log = AttemptLog::new();
        log.append(entry(1, 1));
        log.append(entry(0, 1));
        log.append(entry(1, 2));
        assert_eq!(log.len(), 3);
        let for_one: Vec<u32> = log.for_request(1).iter().map(|e| e.attempt_number).collect();
        assert_eq!(for_one, vec![1, 2]);
        assert_eq!(log.snapshot()[1].sequence_index, 0);
    }

    #[test]
    fn observer_sees_every_append() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let log = AttemptLog::with_observer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        log.append(entry(0, 1));
        log.append(entry(0, 2));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let log = Arc::new(AttemptLog::new());
        let mut handles = Vec::new();
        for idx in 0..8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                for attempt in 1..=10 {
                    log.append(entry(idx, attempt));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(log.len(), 80);
    }
}
