//! Time sources for the decision engine
//!
//! The engine needs two inputs it cannot compute itself: the current time
//! and the instant an object was born. Both sit behind small traits so the
//! overlay can be driven by a manual clock in tests.

use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// The host could not report a birth time for an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unavailable;

/// Answers "when was the object at this path created"
pub trait CreationTimeOracle: Send + Sync {
    /// Birth time of the object at `path`, without following a final symlink
    fn creation_time(&self, path: &Path) -> Result<SystemTime, Unavailable>;
}

/// Birth time as reported by the host.
///
/// On Linux this is `statx(2)`'s `stx_btime`, on the BSDs and macOS
/// `st_birthtime`. Filesystems that do not record a birth time yield
/// [`Unavailable`]; modification and change times are never used instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBirthTime;

impl CreationTimeOracle for HostBirthTime {
    fn creation_time(&self, path: &Path) -> Result<SystemTime, Unavailable> {
        std::fs::symlink_metadata(path)
            .and_then(|meta| meta.created())
            .map_err(|e| {
                debug!("No birth time for {:?}: {}", path, e);
                Unavailable
            })
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic time sources for overlay tests

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    /// Clock that only moves when told to
    #[derive(Clone)]
    pub struct ManualClock {
        now: Arc<Mutex<SystemTime>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                now: Arc::new(Mutex::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))),
            }
        }

        pub fn advance(&self, by: Duration) {
            *self.now.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> SystemTime {
            *self.now.lock()
        }
    }

    /// Reports the clock reading at which a path was first queried.
    ///
    /// The overlay queries the oracle right after it creates an object, so
    /// first sight is the creation instant. Pre-existing backing objects
    /// are seeded explicitly; paths marked unavailable never get one.
    pub struct FirstSightOracle {
        clock: ManualClock,
        seen: Mutex<HashMap<PathBuf, SystemTime>>,
        unavailable: Mutex<Vec<PathBuf>>,
    }

    impl FirstSightOracle {
        pub fn new(clock: ManualClock) -> Self {
            Self {
                clock,
                seen: Mutex::new(HashMap::new()),
                unavailable: Mutex::new(Vec::new()),
            }
        }

        pub fn seed(&self, path: impl Into<PathBuf>, born: SystemTime) {
            self.seen.lock().insert(path.into(), born);
        }

        pub fn mark_unavailable(&self, path: impl Into<PathBuf>) {
            self.unavailable.lock().push(path.into());
        }
    }

    impl CreationTimeOracle for FirstSightOracle {
        fn creation_time(&self, path: &Path) -> Result<SystemTime, Unavailable> {
            if self.unavailable.lock().iter().any(|p| p == path) {
                return Err(Unavailable);
            }
            if std::fs::symlink_metadata(path).is_err() {
                return Err(Unavailable);
            }
            Ok(*self
                .seen
                .lock()
                .entry(path.to_path_buf())
                .or_insert_with(|| self.clock.now()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_path_is_unavailable() {
        let dir = tempdir().unwrap();
        let oracle = HostBirthTime;
        assert_eq!(
            oracle.creation_time(&dir.path().join("missing")),
            Err(Unavailable)
        );
    }

    #[test]
    fn test_birth_time_is_stable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"1").unwrap();

        let oracle = HostBirthTime;
        // Not every filesystem records a birth time; when one is reported
        // it must not move on later writes.
        if let Ok(born) = oracle.creation_time(&path) {
            std::fs::write(&path, b"2").unwrap();
            assert_eq!(oracle.creation_time(&path), Ok(born));
        }
    }

    #[test]
    fn test_first_sight_oracle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, b"1").unwrap();

        let clock = testing::ManualClock::new();
        let oracle = testing::FirstSightOracle::new(clock.clone());
        let first = oracle.creation_time(&path).unwrap();
        clock.advance(std::time::Duration::from_secs(10));
        assert_eq!(oracle.creation_time(&path), Ok(first));

        oracle.mark_unavailable(&path);
        assert_eq!(oracle.creation_time(&path), Err(Unavailable));
    }
}
