//! The concrete POSIX transport: a `flock`-guarded file (the lock), a
//! file-backed shared mapping holding both the message queue and the
//! payload store (the "shared-memory" side), keyed by the mediator's
//! guid. A real `shmget`/`msgget` pair isn't reachable without FFI
//! bindings outside the adopted dependency stack (see DESIGN.md); a
//! `memmap2`-backed shared file plus `nix`'s `flock` is the closer match
//! to what the wider example pack reaches for.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memmap2::MmapMut;
use nix::fcntl::{flock, FlockArg};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::call::{Call, CallId};
use crate::error::{DaemonError, ErrorCategory};

use super::{derive_guid, GuidSentinel, Header, HeaderKind, ProtocolHeader, PROTOCOL_VERSION};

/// Default payload store size: 5 MiB, resizable by callers before first
/// use.
pub const DEFAULT_STORE_SIZE: usize = 5 * 1024 * 1024;

/// Retry budget for transient transport errors (lock contention,
/// interrupted syscalls).
const MAX_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(20);

/// A payload-exceeding-2%-of-the-store call should recommend growing the
/// store to at least this multiple of the observed size.
const RECOMMENDED_GROWTH_FACTOR: usize = 60;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct QueueEntry {
    kind: HeaderKind,
    header: Header,
}

#[derive(Default, Serialize, Deserialize)]
struct StoreImage {
    header: Option<ProtocolHeader>,
    queue: VecDeque<QueueEntry>,
    payloads: HashMap<CallId, Call>,
}

/// The three-way IPC contract a mediator drives: lock, typed message
/// queue, payload store.
pub trait Transport {
    fn setup(&mut self) -> Result<(), DaemonError>;
    fn purge(&mut self) -> Result<(), DaemonError>;
    fn put(&mut self, call: &Call) -> Result<(), DaemonError>;
    fn get(&mut self, kind: Option<HeaderKind>, block: bool) -> Result<Option<Call>, DaemonError>;
    fn drop_payload(&mut self, call_id: CallId) -> Result<(), DaemonError>;
    fn pending_messages(&mut self) -> Result<usize, DaemonError>;
    fn store_size(&self) -> usize;

    /// Best-effort recovery after an error of `category` has already been
    /// recorded against the owning mediator. `SysVTransport` reattaches on
    /// `Identity` (handled implicitly: the stale mapping was already
    /// dropped when the identity mismatch was detected) and runs its
    /// corruption self-test on `Corruption`. The default no-op suits
    /// transports, like `FakeTransport`, with nothing to recover.
    fn recover(&mut self, category: ErrorCategory) -> Result<(), DaemonError> {
        let _ = category;
        Ok(())
    }
}

/// Runs `op` up to `MAX_RETRIES + 1` times, backing off
/// `base * 2^min(attempt,8) - base` between transient failures.
fn with_retry<T>(mut op: impl FnMut() -> Result<T, DaemonError>) -> Result<T, DaemonError> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if matches!(e.category(), crate::error::ErrorCategory::Transient) && attempt < MAX_RETRIES => {
                let exp = attempt.min(8);
                let backoff = RETRY_BASE * (1u32 << exp) - RETRY_BASE;
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct SysVTransport {
    guid: String,
    shm_path: PathBuf,
    lock_path: PathBuf,
    store_size: usize,
    mmap: Option<MmapMut>,
    lock_file: Option<File>,
    warned_oversize: bool,
    _sentinel: Option<GuidSentinel>,
    /// The shm file's inode and length as of the last successful
    /// `attach`, used to detect the store being destroyed and recreated
    /// out from under an already-attached transport.
    mapped_identity: Option<(u64, u64)>,
}

impl SysVTransport {
    /// Builds a transport for `alias`, deriving its guid from the
    /// currently running executable's path.
    pub fn new(alias: &str, store_size: usize) -> Result<Self, DaemonError> {
        let exe = std::env::current_exe()
            .map_err(|e| DaemonError::Validation(format!("cannot resolve daemon executable path: {}", e)))?;
        let (guid, sentinel) = derive_guid(&exe, alias)?;
        let dir = std::env::temp_dir();
        Ok(SysVTransport {
            shm_path: dir.join(format!("{}.shm", guid)),
            lock_path: dir.join(format!("{}.lock", guid)),
            guid,
            store_size,
            mmap: None,
            lock_file: None,
            warned_oversize: false,
            _sentinel: Some(sentinel),
            mapped_identity: None,
        })
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    fn lock(&mut self) -> Result<(), DaemonError> {
        let file = self
            .lock_file
            .as_ref()
            .ok_or_else(|| DaemonError::Clean("transport not set up".into()))?;
        flock(file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| DaemonError::Transient(format!("flock failed: {}", e)))
    }

    fn unlock(&mut self) -> Result<(), DaemonError> {
        let file = self
            .lock_file
            .as_ref()
            .ok_or_else(|| DaemonError::Clean("transport not set up".into()))?;
        flock(file.as_raw_fd(), FlockArg::Unlock)
            .map_err(|e| DaemonError::Transient(format!("flock unlock failed: {}", e)))
    }

    fn read_image(&self) -> Result<StoreImage, DaemonError> {
        let mmap = self
            .mmap
            .as_ref()
            .ok_or_else(|| DaemonError::Identity("payload store not attached".into()))?;
        let len = u32::from_le_bytes(mmap[0..4].try_into().unwrap()) as usize;
        if len == 0 {
            return Ok(StoreImage::default());
        }
        if len + 4 > mmap.len() {
            return Err(DaemonError::Corruption("stored image length exceeds store size".into()));
        }
        serde_json::from_slice(&mmap[4..4 + len])
            .map_err(|e| DaemonError::Corruption(format!("payload store decode failed: {}", e)))
    }

    fn write_image(&mut self, image: &StoreImage) -> Result<(), DaemonError> {
        let encoded = serde_json::to_vec(image)
            .map_err(|e| DaemonError::Corruption(format!("payload store encode failed: {}", e)))?;
        let mmap = self
            .mmap
            .as_mut()
            .ok_or_else(|| DaemonError::Identity("payload store not attached".into()))?;
        if encoded.len() + 4 > mmap.len() {
            return Err(DaemonError::Corruption(format!(
                "encoded store image ({} bytes) does not fit the {} byte store",
                encoded.len() + 4,
                mmap.len()
            )));
        }
        mmap[0..4].copy_from_slice(&(encoded.len() as u32).to_le_bytes());
        mmap[4..4 + encoded.len()].copy_from_slice(&encoded);
        mmap.flush()
            .map_err(|e| DaemonError::Transient(format!("mmap flush failed: {}", e)))
    }

    fn warn_if_oversize(&mut self, call: &Call) {
        if !self.warned_oversize && call.size.saturating_mul(50) > self.store_size {
            log::warn!(
                "call {} payload is {} bytes, more than 2% of the {} byte store; recommend growing it to >= {}x that size",
                call.id,
                call.size,
                self.store_size,
                RECOMMENDED_GROWTH_FACTOR
            );
            self.warned_oversize = true;
        }
    }

    /// Re-stats the shm file and compares it against what was mapped at
    /// the last `attach`. A mismatch (or the file having vanished) means
    /// something outside this transport purged or recreated the store
    /// while it was still attached.
    fn identity_holds(&self) -> bool {
        match (self.mapped_identity, std::fs::metadata(&self.shm_path)) {
            (Some((ino, len)), Ok(meta)) => meta.ino() == ino && meta.len() == len,
            _ => false,
        }
    }

    fn ensure_attached(&mut self) -> Result<(), DaemonError> {
        if self.mmap.is_some() && self.lock_file.is_some() {
            if self.identity_holds() {
                return Ok(());
            }
            // The store changed identity out from under us (Testable
            // Scenario 4: purged externally). Drop the stale mapping and
            // report it; the caller's retry/next access re-attaches.
            self.mmap = None;
            self.lock_file = None;
            self.mapped_identity = None;
            return Err(DaemonError::Identity(format!(
                "payload store at {} changed identity since it was mapped",
                self.shm_path.display()
            )));
        }
        self.attach()
    }

    fn attach(&mut self) -> Result<(), DaemonError> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.lock_path)
            .map_err(|e| DaemonError::Identity(format!("cannot open lock file: {}", e)))?;

        let is_new = !self.shm_path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.shm_path)
            .map_err(|e| DaemonError::Identity(format!("cannot open payload store: {}", e)))?;
        file.set_len(self.store_size as u64)
            .map_err(|e| DaemonError::Identity(format!("cannot size payload store: {}", e)))?;
        let meta = file
            .metadata()
            .map_err(|e| DaemonError::Identity(format!("cannot stat payload store: {}", e)))?;

        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| DaemonError::Identity(format!("cannot map payload store: {}", e)))?
        };

        self.lock_file = Some(lock_file);
        self.mmap = Some(mmap);
        self.mapped_identity = Some((meta.ino(), meta.len()));

        if is_new {
            let image = StoreImage {
                header: Some(ProtocolHeader {
                    version: PROTOCOL_VERSION.to_string(),
                    size: self.store_size,
                }),
                queue: VecDeque::new(),
                payloads: HashMap::new(),
            };
            self.write_image(&image)?;
        }
        Ok(())
    }

    /// Writes a random blob into the store's header slot and reads it
    /// straight back, under lock. One pass of the corruption self-test
    /// described in §7.
    fn self_test_pass(&mut self) -> Result<(), DaemonError> {
        self.ensure_attached()?;
        self.lock()?;
        let probe: String = rand::thread_rng().gen::<[u8; 16]>().iter().map(|b| format!("{:02x}", b)).collect();
        let outcome = (|| {
            let mut image = self.read_image().unwrap_or_default();
            image.header = Some(ProtocolHeader {
                version: probe.clone(),
                size: self.store_size,
            });
            self.write_image(&image)?;
            let reread = self.read_image()?;
            match reread.header {
                Some(h) if h.version == probe => Ok(()),
                _ => Err(DaemonError::Corruption("self-test blob did not round-trip".into())),
            }
        })();
        self.unlock()?;
        outcome
    }

    /// Runs the self-test twice, per §7 ("if the self-test passes twice,
    /// continue, otherwise escalate"). Restores `PROTOCOL_VERSION` in the
    /// header slot once both passes succeed, since the probe value left
    /// there by `self_test_pass` is only meaningful mid-test.
    fn recover_from_corruption(&mut self) -> Result<(), DaemonError> {
        for attempt in 1..=2 {
            self.self_test_pass().map_err(|e| {
                DaemonError::Fatal(format!(
                    "payload store failed its corruption self-test on attempt {}: {}",
                    attempt, e
                ))
            })?;
        }
        self.ensure_attached()?;
        self.lock()?;
        let outcome = (|| {
            let mut image = self.read_image()?;
            image.header = Some(ProtocolHeader {
                version: PROTOCOL_VERSION.to_string(),
                size: self.store_size,
            });
            self.write_image(&image)
        })();
        self.unlock()?;
        outcome
    }
}

impl Transport for SysVTransport {
    fn setup(&mut self) -> Result<(), DaemonError> {
        self.attach()
    }

    fn purge(&mut self) -> Result<(), DaemonError> {
        let _ = std::fs::remove_file(&self.shm_path);
        let _ = std::fs::remove_file(&self.lock_path);
        self.mmap = None;
        self.lock_file = None;
        self.mapped_identity = None;
        self.warned_oversize = false;
        self.attach()
    }

    fn put(&mut self, call: &Call) -> Result<(), DaemonError> {
        let kind = HeaderKind::from_status(call.status).ok_or_else(|| {
            DaemonError::Validation(format!("call {} has no header kind for status {:?}", call.id, call.status))
        })?;
        with_retry(|| {
            self.ensure_attached()?;
            self.lock()?;
            let outcome = (|| {
                let mut image = self.read_image()?;
                image.payloads.insert(call.id, call.clone());
                image.queue.push_back(QueueEntry {
                    kind,
                    header: Header {
                        id: call.id,
                        status: call.status,
                        time: now_millis(),
                        pid: call.pid,
                    },
                });
                self.write_image(&image)
            })();
            self.unlock()?;
            outcome
        })
    }

    fn get(&mut self, kind: Option<HeaderKind>, block: bool) -> Result<Option<Call>, DaemonError> {
        loop {
            let dequeued = with_retry(|| {
                self.ensure_attached()?;
                self.lock()?;
                let outcome = (|| {
                    let mut image = self.read_image()?;
                    let idx = image.queue.iter().position(|e| kind.map(|k| k == e.kind).unwrap_or(true));
                    let found = match idx {
                        Some(idx) => {
                            let entry = image.queue.remove(idx).unwrap();
                            // `Return` headers are the last word on a call:
                            // the payload slot is consumed. `Call`/`Running`
                            // headers are read-only peeks — the worker still
                            // needs the payload (method/args) afterwards, and
                            // the parent may still be holding its own copy.
                            let payload = if entry.kind == HeaderKind::Return {
                                image.payloads.remove(&entry.header.id)
                            } else {
                                image.payloads.get(&entry.header.id).cloned()
                            };
                            self.write_image(&image)?;
                            Some((entry, payload))
                        }
                        None => None,
                    };
                    Ok(found)
                })();
                self.unlock()?;
                outcome
            })?;

            match dequeued {
                Some((entry, payload)) => {
                    let call = match entry.kind {
                        HeaderKind::Return => {
                            let mut call = payload.ok_or_else(|| {
                                DaemonError::Corruption(format!("missing payload for returned call {}", entry.header.id))
                            })?;
                            call.pid = entry.header.pid;
                            self.warn_if_oversize(&call);
                            call
                        }
                        HeaderKind::Call | HeaderKind::Running => match payload {
                            Some(mut call) => {
                                call.pid = entry.header.pid;
                                call.status = entry.header.status;
                                call
                            }
                            None => Call::create("", vec![])
                                .tap_header(entry.header.id, entry.header.status, entry.header.pid),
                        },
                    };
                    return Ok(Some(call));
                }
                None => {
                    if block {
                        thread::sleep(Duration::from_millis(20));
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn drop_payload(&mut self, call_id: CallId) -> Result<(), DaemonError> {
        self.ensure_attached()?;
        self.lock()?;
        let outcome = (|| {
            let mut image = self.read_image()?;
            image.payloads.remove(&call_id);
            self.write_image(&image)
        })();
        self.unlock()?;
        outcome
    }

    fn pending_messages(&mut self) -> Result<usize, DaemonError> {
        self.ensure_attached()?;
        self.lock()?;
        let outcome = self.read_image().map(|image| image.queue.len());
        self.unlock()?;
        outcome
    }

    fn store_size(&self) -> usize {
        self.store_size
    }

    fn recover(&mut self, category: ErrorCategory) -> Result<(), DaemonError> {
        if category == ErrorCategory::Corruption {
            self.recover_from_corruption()
        } else {
            Ok(())
        }
    }
}

/// Small helper so `get` can hand back a minimal, non-payload-bearing
/// `Call` for `Call`/`Running` headers without exposing a public
/// constructor that bypasses id minting rules elsewhere.
trait TapHeader {
    fn tap_header(self, id: CallId, status: crate::call::CallStatus, pid: i32) -> Call;
}

impl TapHeader for Call {
    fn tap_header(mut self, id: CallId, status: crate::call::CallStatus, pid: i32) -> Call {
        self.id = id;
        self.status = status;
        self.pid = pid;
        self
    }
}

/// A deterministic, single-process transport used in tests that want to
/// exercise mediator logic without real shared memory or forked children.
#[cfg(test)]
pub struct FakeTransport {
    queue: VecDeque<QueueEntry>,
    payloads: HashMap<CallId, Call>,
    store_size: usize,
    pub warned_oversize: bool,
}

#[cfg(test)]
impl FakeTransport {
    pub fn new(store_size: usize) -> Self {
        FakeTransport {
            queue: VecDeque::new(),
            payloads: HashMap::new(),
            store_size,
            warned_oversize: false,
        }
    }
}

#[cfg(test)]
impl Transport for FakeTransport {
    fn setup(&mut self) -> Result<(), DaemonError> {
        Ok(())
    }

    fn purge(&mut self) -> Result<(), DaemonError> {
        self.queue.clear();
        self.payloads.clear();
        self.warned_oversize = false;
        Ok(())
    }

    fn put(&mut self, call: &Call) -> Result<(), DaemonError> {
        let kind = HeaderKind::from_status(call.status).ok_or_else(|| {
            DaemonError::Validation(format!("call {} has no header kind for status {:?}", call.id, call.status))
        })?;
        self.payloads.insert(call.id, call.clone());
        self.queue.push_back(QueueEntry {
            kind,
            header: Header {
                id: call.id,
                status: call.status,
                time: now_millis(),
                pid: call.pid,
            },
        });
        Ok(())
    }

    fn get(&mut self, kind: Option<HeaderKind>, _block: bool) -> Result<Option<Call>, DaemonError> {
        let idx = self.queue.iter().position(|e| kind.map(|k| k == e.kind).unwrap_or(true));
        let Some(idx) = idx else { return Ok(None) };
        let entry = self.queue.remove(idx).unwrap();
        match entry.kind {
            HeaderKind::Return => {
                let mut call = self.payloads.remove(&entry.header.id).ok_or_else(|| {
                    DaemonError::Corruption(format!("missing payload for returned call {}", entry.header.id))
                })?;
                call.pid = entry.header.pid;
                if !self.warned_oversize && call.size.saturating_mul(50) > self.store_size {
                    self.warned_oversize = true;
                }
                Ok(Some(call))
            }
            HeaderKind::Call | HeaderKind::Running => {
                let call = match self.payloads.get(&entry.header.id).cloned() {
                    Some(mut call) => {
                        call.pid = entry.header.pid;
                        call.status = entry.header.status;
                        call
                    }
                    None => Call::create("", vec![])
                        .tap_header(entry.header.id, entry.header.status, entry.header.pid),
                };
                Ok(Some(call))
            }
        }
    }

    fn drop_payload(&mut self, call_id: CallId) -> Result<(), DaemonError> {
        self.payloads.remove(&call_id);
        Ok(())
    }

    fn pending_messages(&mut self) -> Result<usize, DaemonError> {
        Ok(self.queue.len())
    }

    fn store_size(&self) -> usize {
        self.store_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallResult;

    #[test]
    fn round_trip_preserves_wire_fields_on_return() {
        let mut transport = FakeTransport::new(DEFAULT_STORE_SIZE);
        let mut call = Call::create("echo", vec![serde_json::json!("hi")]);
        call.called().unwrap();
        transport.put(&call).unwrap();

        let got = transport.get(Some(HeaderKind::Call), false).unwrap().unwrap();
        assert_eq!(got.id, call.id);

        call.running(123).unwrap();
        transport.put(&call).unwrap();
        let got = transport.get(Some(HeaderKind::Running), false).unwrap().unwrap();
        assert_eq!(got.pid, 123);

        call.returned(CallResult::Ok(serde_json::json!("hi"))).unwrap();
        transport.put(&call).unwrap();
        let got = transport.get(Some(HeaderKind::Return), false).unwrap().unwrap();
        assert_eq!(got.id, call.id);
        assert_eq!(got.method, call.method);
        assert_eq!(got.outcome(), Some(Ok(serde_json::json!("hi"))));
    }

    #[test]
    fn oversize_payload_warns_exactly_once() {
        let mut transport = FakeTransport::new(1000);
        let mut call = Call::create("big", vec![serde_json::json!("x".repeat(100))]);
        call.size = 30; // > 2% of 1000
        call.called().unwrap();
        call.running(1).unwrap();
        call.returned(CallResult::Ok(serde_json::json!("ok"))).unwrap();
        transport.put(&call).unwrap();
        transport.get(Some(HeaderKind::Return), false).unwrap();
        assert!(transport.warned_oversize);
    }

    #[test]
    fn get_by_kind_ignores_other_kinds() {
        let mut transport = FakeTransport::new(DEFAULT_STORE_SIZE);
        let mut call = Call::create("noop", vec![]);
        call.called().unwrap();
        transport.put(&call).unwrap();
        assert!(transport.get(Some(HeaderKind::Running), false).unwrap().is_none());
        assert!(transport.get(Some(HeaderKind::Call), false).unwrap().is_some());
    }

    #[test]
    fn ensure_attached_detects_a_store_purged_out_from_under_it() {
        let mut transport =
            SysVTransport::new("transport-identity-test", DEFAULT_STORE_SIZE).expect("new");
        transport.setup().expect("setup");
        assert!(transport.identity_holds());

        // Simulate the store being destroyed and recreated by another
        // process while this transport still believes it is attached.
        std::fs::remove_file(&transport.shm_path).expect("remove shm file");
        let recreated = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&transport.shm_path)
            .expect("recreate shm file");
        recreated.set_len(DEFAULT_STORE_SIZE as u64).expect("size recreated file");
        drop(recreated);

        match transport.ensure_attached() {
            Err(DaemonError::Identity(_)) => {}
            other => panic!("expected an Identity error, got {:?}", other.err()),
        }
        // The next access transparently reattaches.
        transport.setup().expect("reattach");
        assert!(transport.identity_holds());

        let _ = transport.purge();
    }

    #[test]
    fn corruption_self_test_round_trips_a_random_blob_twice() {
        let mut transport =
            SysVTransport::new("transport-self-test", DEFAULT_STORE_SIZE).expect("new");
        transport.setup().expect("setup");
        transport.recover_from_corruption().expect("self-test should pass against a healthy store");

        let image = transport.read_image().expect("read back the restored header");
        assert_eq!(image.header.map(|h| h.version), Some(PROTOCOL_VERSION.to_string()));

        let _ = transport.purge();
    }

    #[test]
    fn recover_is_a_noop_for_categories_other_than_corruption() {
        let mut transport =
            SysVTransport::new("transport-recover-noop", DEFAULT_STORE_SIZE).expect("new");
        transport.setup().expect("setup");
        transport.recover(ErrorCategory::Transient).expect("non-corruption recover is a no-op");
        let _ = transport.purge();
    }
}
