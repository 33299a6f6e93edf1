use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<Mutex<u64>>,
}

impl TlsCounter {
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| Mutex::new(0));
        let mut guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| {
            x + *y.lock().unwrap_or_else(PoisonError::into_inner)
        })
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters of one process, shared by all of its runners
#[derive(Debug)]
pub struct Progress {
    pub folders_created: TlsCounter,
    pub folders_skipped: TlsCounter,
    pub folders_submitted: TlsCounter,
    pub files_submitted: TlsCounter,
    pub large_files_submitted: TlsCounter,
    pub files_copied: TlsCounter,
    pub bytes_copied: TlsCounter,
    pub copies_failed: TlsCounter,
    pub submissions_failed: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    pub fn new() -> Self {
        Self {
            folders_created: Default::default(),
            folders_skipped: Default::default(),
            folders_submitted: Default::default(),
            files_submitted: Default::default(),
            large_files_submitted: Default::default(),
            files_copied: Default::default(),
            bytes_copied: Default::default(),
            copies_failed: Default::default(),
            submissions_failed: Default::default(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn summary(&self) -> Summary {
        Summary {
            folders_created: self.folders_created.get(),
            folders_skipped: self.folders_skipped.get(),
            folders_submitted: self.folders_submitted.get(),
            files_submitted: self.files_submitted.get(),
            large_files_submitted: self.large_files_submitted.get(),
            files_copied: self.files_copied.get(),
            bytes_copied: self.bytes_copied.get(),
            copies_failed: self.copies_failed.get(),
            submissions_failed: self.submissions_failed.get(),
            duration: self.get_duration(),
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub folders_created: u64,
    pub folders_skipped: u64,
    pub folders_submitted: u64,
    pub files_submitted: u64,
    pub large_files_submitted: u64,
    pub files_copied: u64,
    pub bytes_copied: u64,
    pub copies_failed: u64,
    pub submissions_failed: u64,
    pub duration: std::time::Duration,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.duration.as_secs_f64();
        let rate = if secs > 0.0 {
            (self.bytes_copied as f64 / secs) as u64
        } else {
            0
        };
        write!(
            f,
            "-----------------------\n\
            FOLDERS:\n\
            created:     {:>10}\n\
            skipped:     {:>10}\n\
            submitted:   {:>10}\n\
            -----------------------\n\
            FILES:\n\
            submitted:   {:>10}\n\
            large:       {:>10}\n\
            copied:      {:>10}\n\
            failed:      {:>10}\n\
            -----------------------\n\
            COPIED:\n\
            total:       {:>10}\n\
            average:     {:>10}/s\n\
            -----------------------\n\
            failed submissions: {}\n\
            walltime: {}",
            self.folders_created,
            self.folders_skipped,
            self.folders_submitted,
            self.files_submitted,
            self.large_files_submitted,
            self.files_copied,
            self.copies_failed,
            bytesize::ByteSize(self.bytes_copied),
            bytesize::ByteSize(rate),
            self.submissions_failed,
            humantime::format_duration(std::time::Duration::from_millis(
                u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
            )),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn basic_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        for _ in 0..10 {
            tls_counter.inc();
        }
        assert!(tls_counter.get() == 10);
        Ok(())
    }

    #[test]
    fn threaded_counting() -> Result<()> {
        let tls_counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        tls_counter.inc();
                    }
                });
            }
        });
        assert!(tls_counter.get() == 1000);
        Ok(())
    }

    #[test]
    fn summary_reports_counters() {
        let progress = Progress::new();
        progress.files_copied.add(3);
        progress.bytes_copied.add(2048);
        progress.copies_failed.inc();
        let summary = progress.summary();
        assert_eq!(summary.files_copied, 3);
        assert_eq!(summary.copies_failed, 1);
        let text = summary.to_string();
        let copied = text
            .lines()
            .find(|line| line.starts_with("copied:"))
            .unwrap();
        assert_eq!(copied.split_whitespace().last(), Some("3"));
    }
}
