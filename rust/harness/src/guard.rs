//! Scoped resource guards held around a benchmark process.
//!
//! [`AccountingSession`] samples device utilization into a CSV file on a
//! background thread. [`CpuQuotaGuard`] limits the cores available to child
//! processes. Both release on drop, so every exit path of the guarded block
//! (including early returns and errors) restores the host.
//!
//! Open accounting first and the quota second; locals drop in reverse
//! declaration order, so the quota is released before sampling stops.

use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        mpsc::{self, RecvTimeoutError},
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::device::{AccountingEntry, DeviceAdapter};

/// Background sampler writing [`AccountingEntry`] rows to a CSV file.
///
/// Each tick writes two rows: the sample itself, then its change since the
/// previous tick. Readers keep only the even rows.
pub struct AccountingSession {
    path: PathBuf,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<usize>>,
}

impl AccountingSession {
    /// Create the accounting file and start sampling every `interval`.
    pub fn start<A>(adapter: Arc<A>, path: &Path, interval: Duration) -> Result<Self, GuardError>
    where
        A: DeviceAdapter + ?Sized + 'static,
    {
        let file = File::create(path).map_err(|e| GuardError::Io(path.to_path_buf(), e))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer
            .write_record(["timestamp_ms", "gpu_util", "mem_util", "max_memory_usage"])
            .and_then(|()| writer.flush().map_err(csv::Error::from))
            .map_err(|e| GuardError::Csv(path.to_path_buf(), e))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let thread_path = path.to_path_buf();
        let handle = std::thread::Builder::new()
            .name("accounting".into())
            .spawn(move || sample_loop(adapter.as_ref(), writer, &stop_rx, interval, &thread_path))
            .map_err(|e| GuardError::Io(path.to_path_buf(), e))?;

        tracing::debug!("Accounting started: {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop sampling and wait for the file to be flushed.
    ///
    /// Returns the number of ticks recorded.
    pub fn close(mut self) -> usize {
        self.stop()
    }

    fn stop(&mut self) -> usize {
        // Dropping the sender wakes the sampler immediately.
        self.stop_tx.take();
        let Some(handle) = self.handle.take() else {
            return 0;
        };
        let ticks = handle.join().unwrap_or_else(|_| {
            tracing::error!("Accounting thread panicked: {}", self.path.display());
            0
        });
        tracing::debug!("Accounting stopped after {ticks} ticks: {}", self.path.display());
        ticks
    }
}

impl Drop for AccountingSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sample_loop<A: DeviceAdapter + ?Sized>(
    adapter: &A,
    mut writer: csv::Writer<File>,
    stop_rx: &mpsc::Receiver<()>,
    interval: Duration,
    path: &Path,
) -> usize {
    let mut previous: Option<AccountingEntry> = None;
    let mut ticks = 0;
    let mut reported_failure = false;

    loop {
        match adapter.sample() {
            Ok(entry) => {
                let delta = entry.delta(previous.as_ref());
                let written = writer
                    .serialize(entry)
                    .and_then(|()| writer.serialize(delta))
                    .and_then(|()| writer.flush().map_err(csv::Error::from));
                if let Err(e) = written {
                    tracing::warn!("Accounting write to {} failed: {e}", path.display());
                    break;
                }
                previous = Some(entry);
                ticks += 1;
            }
            Err(e) if !reported_failure => {
                tracing::warn!("Accounting sample failed: {e}");
                reported_failure = true;
            }
            Err(e) => tracing::trace!("Accounting sample failed: {e}"),
        }

        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    ticks
}

/// Host-wide CPU core restriction.
pub trait CpuQuota {
    /// Logical cores available on the host.
    fn host_cores(&self) -> usize;

    /// Restrict subsequently spawned processes to `cores` logical cores.
    fn restrict(&self, cores: usize) -> Result<(), GuardError>;

    /// Undo the last [`CpuQuota::restrict`].
    fn release(&self) -> Result<(), GuardError>;
}

/// Cores a run gets: the requested count capped at the host, or every core
/// when the request is 0.
#[must_use]
pub fn resolve_cores(requested: usize, host_cores: usize) -> usize {
    let host_cores = host_cores.max(1);
    if requested == 0 {
        host_cores
    } else {
        requested.min(host_cores)
    }
}

/// Scoped CPU restriction; released on drop.
pub struct CpuQuotaGuard<'a, Q: CpuQuota + ?Sized> {
    quota: &'a Q,
    cores: usize,
    restricted: bool,
}

impl<'a, Q: CpuQuota + ?Sized> CpuQuotaGuard<'a, Q> {
    /// Resolve the core count once and apply it.
    ///
    /// A failed restriction is logged and the run proceeds unrestricted.
    pub fn open(quota: &'a Q, requested: usize) -> Self {
        let cores = resolve_cores(requested, quota.host_cores());
        let restricted = match quota.restrict(cores) {
            Ok(()) => {
                tracing::debug!("CPU quota: {cores} cores");
                true
            }
            Err(e) => {
                tracing::warn!("CPU quota of {cores} cores not applied: {e}");
                false
            }
        };
        Self {
            quota,
            cores,
            restricted,
        }
    }

    #[must_use]
    pub fn cores(&self) -> usize {
        self.cores
    }
}

impl<Q: CpuQuota + ?Sized> Drop for CpuQuotaGuard<'_, Q> {
    fn drop(&mut self) {
        if self.restricted
            && let Err(e) = self.quota.release()
        {
            tracing::error!("Failed to release CPU quota: {e}");
        }
    }
}

/// CPU quota backed by the scheduler affinity mask of the calling thread.
///
/// Child processes inherit the mask of the thread that spawns them, so the
/// guard must be opened on the same thread that spawns the benchmark. The
/// binary drives everything from a current-thread runtime for that reason.
#[derive(Default)]
pub struct AffinityQuota {
    #[cfg(target_os = "linux")]
    saved: Mutex<Option<libc::cpu_set_t>>,
    #[cfg(not(target_os = "linux"))]
    saved: Mutex<Option<()>>,
}

impl AffinityQuota {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CpuQuota for AffinityQuota {
    /// Cores the host reports, capped at those the current mask allows.
    fn host_cores(&self) -> usize {
        let system = sysinfo::System::new_with_specifics(
            sysinfo::RefreshKind::new().with_cpu(sysinfo::CpuRefreshKind::new()),
        );
        let reported = system.cpus().len();
        allowed_cores().map_or(reported, |allowed| reported.min(allowed)).max(1)
    }

    #[cfg(target_os = "linux")]
    fn restrict(&self, cores: usize) -> Result<(), GuardError> {
        let set_size = std::mem::size_of::<libc::cpu_set_t>();
        let current = current_affinity()?;

        // SAFETY: cpu_set_t is plain data and the CPU_* helpers stay within CPU_SETSIZE.
        let mut limited: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        let mut picked = 0;
        for cpu in 0..libc::CPU_SETSIZE as usize {
            if picked == cores {
                break;
            }
            if unsafe { libc::CPU_ISSET(cpu, &current) } {
                unsafe { libc::CPU_SET(cpu, &mut limited) };
                picked += 1;
            }
        }

        if unsafe { libc::sched_setaffinity(0, set_size, &limited) } != 0 {
            return Err(GuardError::Affinity(std::io::Error::last_os_error()));
        }

        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        // Nested restrictions keep the outermost mask.
        saved.get_or_insert(current);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn release(&self) -> Result<(), GuardError> {
        let Some(previous) = self
            .saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        let set_size = std::mem::size_of::<libc::cpu_set_t>();
        // SAFETY: `previous` was filled by sched_getaffinity.
        if unsafe { libc::sched_setaffinity(0, set_size, &previous) } != 0 {
            return Err(GuardError::Affinity(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn restrict(&self, _cores: usize) -> Result<(), GuardError> {
        Err(GuardError::Unsupported)
    }

    #[cfg(not(target_os = "linux"))]
    fn release(&self) -> Result<(), GuardError> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn current_affinity() -> Result<libc::cpu_set_t, GuardError> {
    let set_size = std::mem::size_of::<libc::cpu_set_t>();
    // SAFETY: cpu_set_t is plain data; the kernel fills at most `set_size` bytes.
    let mut current: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    if unsafe { libc::sched_getaffinity(0, set_size, &mut current) } != 0 {
        return Err(GuardError::Affinity(std::io::Error::last_os_error()));
    }
    Ok(current)
}

/// CPUs in the calling thread's affinity mask.
#[cfg(target_os = "linux")]
fn allowed_cores() -> Option<usize> {
    let current = current_affinity().ok()?;
    // SAFETY: `current` was filled by sched_getaffinity.
    usize::try_from(unsafe { libc::CPU_COUNT(&current) }).ok()
}

#[cfg(not(target_os = "linux"))]
fn allowed_cores() -> Option<usize> {
    None
}

/// Errors raised while opening or closing a guard.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("accounting file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("accounting file {0}: {1}")]
    Csv(PathBuf, csv::Error),
    #[error("cpu affinity: {0}")]
    Affinity(std::io::Error),
    #[error("cpu quotas are not supported on this platform")]
    Unsupported,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::tempdir;

    use super::*;
    use crate::device::{DeviceError, DeviceHandle, DeviceMode, ModeStatus};

    struct CountingDevices {
        ticks: AtomicUsize,
    }

    impl DeviceAdapter for CountingDevices {
        fn list_devices(&self) -> Result<Vec<DeviceHandle>, DeviceError> {
            Ok(Vec::new())
        }

        fn mode(&self, _: &DeviceHandle, _: DeviceMode) -> Result<ModeStatus, DeviceError> {
            Ok(ModeStatus::Unsupported)
        }

        fn set_mode(&self, _: &DeviceHandle, _: DeviceMode, _: bool) -> Result<(), DeviceError> {
            Ok(())
        }

        fn sample(&self) -> Result<AccountingEntry, DeviceError> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(AccountingEntry {
                timestamp_ms: tick as i64,
                gpu_util: 50.0 + tick as f64,
                mem_util: 10.0,
                max_memory_usage: 1024.0,
            })
        }
    }

    #[derive(Default)]
    struct RecordingQuota {
        restricted: AtomicUsize,
        released: AtomicUsize,
        last: AtomicUsize,
    }

    impl CpuQuota for RecordingQuota {
        fn host_cores(&self) -> usize {
            16
        }

        fn restrict(&self, cores: usize) -> Result<(), GuardError> {
            self.restricted.fetch_add(1, Ordering::SeqCst);
            self.last.store(cores, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self) -> Result<(), GuardError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_resolve_cores() {
        assert_eq!(resolve_cores(0, 16), 16);
        assert_eq!(resolve_cores(4, 16), 4);
        assert_eq!(resolve_cores(64, 16), 16);
        assert_eq!(resolve_cores(0, 0), 1);
    }

    #[test]
    fn test_quota_released_on_drop() {
        let quota = RecordingQuota::default();
        {
            let guard = CpuQuotaGuard::open(&quota, 0);
            assert_eq!(guard.cores(), 16);
            assert_eq!(quota.released.load(Ordering::SeqCst), 0);
        }
        assert_eq!(quota.restricted.load(Ordering::SeqCst), 1);
        assert_eq!(quota.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_quota_released_on_early_return() {
        fn guarded(quota: &RecordingQuota) -> Result<(), String> {
            let _guard = CpuQuotaGuard::open(quota, 2);
            Err::<(), _>("child exited with 1".to_string())?;
            Ok(())
        }

        let quota = RecordingQuota::default();
        assert!(guarded(&quota).is_err());
        assert_eq!(quota.last.load(Ordering::SeqCst), 2);
        assert_eq!(quota.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_accounting_writes_two_rows_per_tick() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gpu-accounting.csv");
        let devices = Arc::new(CountingDevices {
            ticks: AtomicUsize::new(0),
        });

        // A long interval leaves exactly the initial tick.
        let session = devices
            .clone()
            .begin_accounting(&path, Duration::from_secs(60))
            .unwrap();
        let ticks = session.close();
        assert_eq!(ticks, 1);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "timestamp_ms,gpu_util,mem_util,max_memory_usage");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("0,50.0,"));
    }

    #[test]
    fn test_accounting_stops_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gpu-accounting.csv");
        let devices = Arc::new(CountingDevices {
            ticks: AtomicUsize::new(0),
        });

        {
            let _session =
                AccountingSession::start(devices.clone(), &path, Duration::from_millis(5)).unwrap();
            std::thread::sleep(Duration::from_millis(40));
        }
        let after_drop = devices.ticks.load(Ordering::SeqCst);
        assert!(after_drop >= 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(devices.ticks.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn test_accounting_unwritable_path() {
        let dir = tempdir().unwrap();
        let devices = Arc::new(CountingDevices {
            ticks: AtomicUsize::new(0),
        });
        let result = AccountingSession::start(
            devices,
            &dir.path().join("missing/gpu-accounting.csv"),
            Duration::from_millis(5),
        );
        assert!(matches!(result, Err(GuardError::Io(..))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_affinity_quota_restores_mask() {
        let quota = AffinityQuota::new();
        let before = std::thread::available_parallelism().unwrap().get();
        {
            let _guard = CpuQuotaGuard::open(&quota, 1);
            let inside = std::thread::available_parallelism().unwrap().get();
            assert_eq!(inside, 1);
        }
        let after = std::thread::available_parallelism().unwrap().get();
        assert_eq!(before, after);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_all_cores_means_cores_in_mask() {
        let quota = AffinityQuota::new();
        let _outer = CpuQuotaGuard::open(&quota, 1);
        assert_eq!(quota.host_cores(), 1);

        let inner = CpuQuotaGuard::open(&quota, 0);
        assert_eq!(inner.cores(), 1);
    }
}
