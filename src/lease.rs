use crate::error::SpeakError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Contents of the lock file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaseRecord {
    pub owner: String,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LeaseRecord {
    fn new(owner: &str) -> Self {
        let now = Utc::now();
        Self {
            owner: owner.to_string(),
            pid: std::process::id(),
            hostname: local_hostname(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }
}

fn local_hostname() -> String {
    System::host_name().unwrap_or_else(|| "localhost".to_string())
}

fn pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

#[derive(Debug, Clone)]
pub struct LockFileConfig {
    pub path: PathBuf,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

/// What the current lock file says about its holder.
#[derive(Debug, PartialEq)]
enum Holder {
    Live,
    /// `record` is None when the file could not be parsed.
    Stale {
        record: Option<LeaseRecord>,
        reason: String,
    },
    Gone,
}

/// `Ok(None)` means the file exists but does not hold a valid record.
fn read_record(path: &Path) -> io::Result<Option<LeaseRecord>> {
    fs::read_to_string(path).map(|content| serde_json::from_str(&content).ok())
}

fn file_age(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .unwrap_or_default()
}

fn inspect(path: &Path, stale_after: Duration) -> io::Result<Holder> {
    let record = match read_record(path) {
        Ok(record) => record,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Holder::Gone),
        Err(e) => return Err(e),
    };

    let Some(record) = record else {
        // A holder may be halfway through writing; only old garbage is stale.
        let age = file_age(path);
        return Ok(if age > stale_after {
            Holder::Stale {
                record: None,
                reason: format!("unreadable lock file {}s old", age.as_secs()),
            }
        } else {
            Holder::Live
        });
    };

    if record.hostname == local_hostname() && !pid_alive(record.pid) {
        let reason = format!("holder pid {} is not running", record.pid);
        return Ok(Holder::Stale {
            record: Some(record),
            reason,
        });
    }

    let silent_for = Utc::now()
        .signed_duration_since(record.heartbeat_at)
        .to_std()
        .unwrap_or_default();
    if silent_for > stale_after {
        return Ok(Holder::Stale {
            record: Some(record),
            reason: format!("no heartbeat for {}s", silent_for.as_secs()),
        });
    }

    Ok(Holder::Live)
}

/// Marker file that lets one process at a time check and remove a stale lock.
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    fn try_take(lock_path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        let path = lock_path.with_extension("reclaim");
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Left behind by a reclaimer that died mid-way.
                if file_age(&path) > stale_after {
                    warn!(path = %path.display(), "clearing abandoned reclaim marker");
                    match fs::remove_file(&path) {
                        Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                        _ => {}
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove reclaim marker");
        }
    }
}

/// Removes the lock file only if it still holds exactly the `stale` record.
/// Returns false when another reclaimer is busy or the file changed hands.
fn reclaim(path: &Path, stale: Option<&LeaseRecord>, stale_after: Duration) -> io::Result<bool> {
    let Some(_guard) = ReclaimGuard::try_take(path, stale_after)? else {
        return Ok(false);
    };
    // Re-read under the guard: a waiter that saw the same stale record
    // earlier must not delete a lease created since.
    match inspect(path, stale_after)? {
        Holder::Stale { record, .. } if record.as_ref() == stale => {}
        _ => return Ok(false),
    }
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(true),
    }
}

/// Removes the lock file if it still belongs to `owner`.
fn remove_if_owned(path: &Path, owner: &str) -> io::Result<()> {
    let current = match read_record(path) {
        Ok(record) => record,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if current.map(|r| r.owner).as_deref() != Some(owner) {
        return Ok(());
    }
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn try_create(path: &Path, record: &LeaseRecord) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let body = serde_json::to_vec(record).map_err(io::Error::other)?;
    file.write_all(&body)?;
    file.sync_all()
}

fn write_heartbeat(path: &Path, owner: &str) -> io::Result<bool> {
    let Some(mut record) = read_record(path)? else {
        return Ok(false);
    };
    if record.owner != owner {
        return Ok(false);
    }
    record.heartbeat_at = Utc::now();
    let tmp = path.with_extension(format!("hb-{}", owner));
    fs::write(&tmp, serde_json::to_vec(&record).map_err(io::Error::other)?)?;
    fs::rename(&tmp, path)?;
    Ok(true)
}

/// Runs lock file and process table work off the async workers.
async fn blocking<T, F>(work: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(io::Error::other)?
}

/// Process-wide advisory lease backed by the lock file.
#[derive(Debug)]
pub struct FileLease {
    path: PathBuf,
    owner: String,
    stop: CancellationToken,
    // Held for every heartbeat write and for the final removal.
    file_io: Arc<Mutex<()>>,
}

impl FileLease {
    pub async fn acquire(config: &LockFileConfig) -> io::Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let owner = uuid::Uuid::new_v4().simple().to_string();
        loop {
            // Creation stays inline so a dropped waiter never leaves a lock behind.
            match try_create(&config.path, &LeaseRecord::new(&owner)) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }

            let (path, stale_after) = (config.path.clone(), config.stale_after);
            let retry_now = blocking(move || match inspect(&path, stale_after)? {
                Holder::Live => Ok(false),
                Holder::Gone => Ok(true),
                Holder::Stale { record, reason } => {
                    let reclaimed = reclaim(&path, record.as_ref(), stale_after)?;
                    if reclaimed {
                        warn!(path = %path.display(), %reason, "reclaimed stale pipeline lease");
                    }
                    Ok(reclaimed)
                }
            })
            .await?;
            if !retry_now {
                tokio::time::sleep(config.poll_interval).await;
            }
        }
        debug!(path = %config.path.display(), %owner, "lock file lease acquired");

        let stop = CancellationToken::new();
        let file_io = Arc::new(Mutex::new(()));
        tokio::spawn(heartbeat(
            config.path.clone(),
            owner.clone(),
            (config.stale_after / 3).max(Duration::from_millis(10)),
            stop.clone(),
            Arc::clone(&file_io),
        ));

        Ok(Self {
            path: config.path.clone(),
            owner,
            stop,
            file_io,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

async fn heartbeat(
    path: PathBuf,
    owner: String,
    every: Duration,
    stop: CancellationToken,
    file_io: Arc<Mutex<()>>,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }

        let written = {
            let (path, owner, stop, file_io) =
                (path.clone(), owner.clone(), stop.clone(), Arc::clone(&file_io));
            blocking(move || {
                let _io = file_io.lock().unwrap_or_else(PoisonError::into_inner);
                // Checked under the lock: once released, the file is never rewritten.
                if stop.is_cancelled() {
                    return Ok(true);
                }
                write_heartbeat(&path, &owner)
            })
            .await
        };

        match written {
            Ok(true) => {}
            Ok(false) => {
                error!(path = %path.display(), "pipeline lease was taken over by another holder");
                return;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "lease heartbeat failed"),
        }
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        self.stop.cancel();
        let _io = self.file_io.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = remove_if_owned(&self.path, &self.owner) {
            warn!(path = %self.path.display(), error = %e, "failed to release lock file");
        }
    }
}

/// Counts a request from admission until its lease (or rejection) is dropped.
#[derive(Debug)]
struct AdmissionSlot {
    admitted: Arc<AtomicUsize>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive right to run one request through synthesis and playback.
/// Released when dropped.
#[derive(Debug)]
pub struct PipelineLease {
    file: Option<FileLease>,
    _permit: OwnedSemaphorePermit,
    _slot: AdmissionSlot,
}

impl PipelineLease {
    pub fn lock_owner(&self) -> Option<&str> {
        self.file.as_ref().map(FileLease::owner)
    }
}

pub struct Coordinator {
    gate: Arc<Semaphore>,
    admitted: Arc<AtomicUsize>,
    queue_max: usize,
    lock_file: Option<LockFileConfig>,
}

impl Coordinator {
    pub fn new(queue_max: usize, lock_file: Option<LockFileConfig>) -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
            admitted: Arc::new(AtomicUsize::new(0)),
            queue_max,
            lock_file,
        }
    }

    pub fn from_settings(settings: &crate::config_loader::Settings) -> Self {
        Self::new(
            settings.queue_max,
            Some(LockFileConfig {
                path: settings.lock_path.clone(),
                stale_after: settings.lease_stale_after(),
                poll_interval: settings.lease_poll_interval(),
            }),
        )
    }

    /// Requests currently holding or waiting for the lease.
    pub fn pending(&self) -> usize {
        self.admitted.load(Ordering::SeqCst)
    }

    fn admit(&self) -> Result<AdmissionSlot, SpeakError> {
        let capacity = self.queue_max + 1;
        self.admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| SpeakError::Overloaded)?;
        Ok(AdmissionSlot {
            admitted: Arc::clone(&self.admitted),
        })
    }

    /// Waits for the lease in arrival order. Fails fast with `Overloaded`
    /// when `queue_max` requests are already waiting behind the holder.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PipelineLease, SpeakError> {
        let slot = self.admit()?;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SpeakError::Cancelled),
            permit = Arc::clone(&self.gate).acquire_owned() => {
                permit.map_err(|_| io::Error::other("pipeline coordinator closed"))?
            }
        };

        let file = match &self.lock_file {
            Some(config) => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SpeakError::Cancelled),
                lease = FileLease::acquire(config) => Some(lease?),
            },
            None => None,
        };

        Ok(PipelineLease {
            file,
            _permit: permit,
            _slot: slot,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lock_config(path: PathBuf, stale_after: Duration) -> LockFileConfig {
        LockFileConfig {
            path,
            stale_after,
            poll_interval: Duration::from_millis(10),
        }
    }

    async fn wait_for_pending(coordinator: &Coordinator, n: usize) {
        for _ in 0..200 {
            if coordinator.pending() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pending never reached {}", n);
    }

    #[tokio::test]
    async fn at_most_one_lease_under_contention() {
        let coordinator = Arc::new(Coordinator::new(16, None));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _lease = coordinator.acquire(&CancellationToken::new()).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test]
    async fn rejects_beyond_queue_capacity() {
        let coordinator = Arc::new(Coordinator::new(2, None));
        let held = coordinator.acquire(&CancellationToken::new()).await.unwrap();

        let mut waiters = Vec::new();
        for i in 0..2 {
            let waiter = Arc::clone(&coordinator);
            waiters.push(tokio::spawn(async move {
                waiter.acquire(&CancellationToken::new()).await.map(|_| ())
            }));
            wait_for_pending(&coordinator, i + 2).await;
        }

        let rejected = coordinator.acquire(&CancellationToken::new()).await;
        assert!(matches!(rejected, Err(SpeakError::Overloaded)));
        assert_eq!(coordinator.pending(), 3);

        drop(held);
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(coordinator.pending(), 0);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let coordinator = Arc::new(Coordinator::new(8, None));
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = coordinator.acquire(&CancellationToken::new()).await.unwrap();

        let mut handles = Vec::new();
        for id in 0..4 {
            let coordinator_task = Arc::clone(&coordinator);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _lease = coordinator_task
                    .acquire(&CancellationToken::new())
                    .await
                    .unwrap();
                order.lock().unwrap().push(id);
            }));
            wait_for_pending(&coordinator, id + 2).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn cancelled_waiter_frees_its_slot() {
        let coordinator = Arc::new(Coordinator::new(1, None));
        let held = coordinator.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            let cancel = cancel.clone();
            tokio::spawn(async move { coordinator.acquire(&cancel).await.map(|_| ()) })
        };
        wait_for_pending(&coordinator, 2).await;

        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(SpeakError::Cancelled)));
        assert_eq!(coordinator.pending(), 1);

        // The freed slot can be used again.
        drop(held);
        let _again = coordinator.acquire(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn lock_file_is_created_and_released() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speaker.lock");
        let coordinator = Coordinator::new(
            4,
            Some(lock_config(path.clone(), Duration::from_secs(30))),
        );

        let lease = coordinator.acquire(&CancellationToken::new()).await.unwrap();
        let record = read_record(&path).unwrap().unwrap();
        assert_eq!(Some(record.owner.as_str()), lease.lock_owner());
        assert_eq!(record.pid, std::process::id());

        drop(lease);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn live_foreign_holder_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speaker.lock");
        // Our own pid is alive and the heartbeat is fresh.
        try_create(&path, &LeaseRecord::new("someone-else")).unwrap();

        let config = lock_config(path.clone(), Duration::from_secs(30));
        let attempt =
            tokio::time::timeout(Duration::from_millis(200), FileLease::acquire(&config)).await;
        assert!(attempt.is_err(), "lease should still be held");
        assert_eq!(read_record(&path).unwrap().unwrap().owner, "someone-else");
    }

    #[tokio::test]
    async fn expired_heartbeat_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speaker.lock");
        let mut record = LeaseRecord::new("crashed");
        record.heartbeat_at = Utc::now() - chrono::Duration::hours(1);
        try_create(&path, &record).unwrap();

        let config = lock_config(path.clone(), Duration::from_secs(30));
        let lease = tokio::time::timeout(Duration::from_secs(2), FileLease::acquire(&config))
            .await
            .expect("stale lease should be reclaimed")
            .unwrap();
        assert_ne!(lease.owner(), "crashed");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_holder_pid_is_reclaimed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speaker.lock");

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let mut record = LeaseRecord::new("dead");
        record.pid = dead_pid;
        try_create(&path, &record).unwrap();

        let config = lock_config(path.clone(), Duration::from_secs(30));
        let lease = tokio::time::timeout(Duration::from_secs(2), FileLease::acquire(&config))
            .await
            .expect("dead holder should be reclaimed")
            .unwrap();
        assert_ne!(lease.owner(), "dead");
    }

    #[tokio::test]
    async fn heartbeat_keeps_record_fresh() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speaker.lock");
        let config = lock_config(path.clone(), Duration::from_millis(150));

        let lease = FileLease::acquire(&config).await.unwrap();
        let first = read_record(&path).unwrap().unwrap().heartbeat_at;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let later = read_record(&path).unwrap().unwrap().heartbeat_at;
        assert!(later > first);
        assert_eq!(inspect(&path, config.stale_after).unwrap(), Holder::Live);
        drop(lease);
    }

    #[tokio::test]
    async fn released_lease_is_not_rewritten_by_heartbeat() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speaker.lock");
        // Heartbeat every 10ms.
        let config = lock_config(path.clone(), Duration::from_millis(30));

        for _ in 0..20 {
            let lease = FileLease::acquire(&config).await.unwrap();
            tokio::time::sleep(Duration::from_millis(12)).await;
            drop(lease);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn reclaim_leaves_a_replaced_record_alone() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speaker.lock");
        let stale_after = Duration::from_secs(30);

        // Seen stale earlier, but another waiter has since taken over.
        let mut seen = LeaseRecord::new("crashed");
        seen.heartbeat_at = Utc::now() - chrono::Duration::hours(1);
        try_create(&path, &LeaseRecord::new("new-holder")).unwrap();

        assert!(!reclaim(&path, Some(&seen), stale_after).unwrap());
        assert_eq!(read_record(&path).unwrap().unwrap().owner, "new-holder");
        assert!(!path.with_extension("reclaim").exists());
    }

    #[test]
    fn reclaim_waits_for_a_busy_reclaimer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speaker.lock");
        let stale_after = Duration::from_secs(30);

        let mut stale = LeaseRecord::new("crashed");
        stale.heartbeat_at = Utc::now() - chrono::Duration::hours(1);
        try_create(&path, &stale).unwrap();

        let busy = ReclaimGuard::try_take(&path, stale_after).unwrap().unwrap();
        assert!(!reclaim(&path, Some(&stale), stale_after).unwrap());
        assert!(path.exists());

        drop(busy);
        assert!(reclaim(&path, Some(&stale), stale_after).unwrap());
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reclaimers_leave_one_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("speaker.lock");
        let mut record = LeaseRecord::new("crashed");
        record.heartbeat_at = Utc::now() - chrono::Duration::hours(1);
        try_create(&path, &record).unwrap();

        let config = lock_config(path.clone(), Duration::from_secs(30));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let config = config.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let lease = FileLease::acquire(&config).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
            }));
        }
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("every waiter should get the lease")
                .unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(!path.exists());
    }
}
