//! Fixed worker pool for bulk data-unit transforms and PBKDF2 trials.
//!
//! Work items live in a ring of `2 × threads` slots. Each slot moves
//! Free → Ready (enqueued) → Busy (dequeued) → Free. Producers advance the
//! ring under the enqueue mutex, workers under the dequeue mutex; payloads run
//! without holding either.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use lazy_static::lazy_static;
use zeroize::Zeroizing;

use crate::config::EngineConfig;
use crate::context::CryptoContext;
use crate::error::{CryptoError, Result};
use crate::pkcs5::{derive_key, Prf};
use crate::sync::{lock, Event, Latch, LatchGuard};
use crate::xts::ENCRYPTION_DATA_UNIT_SIZE;

const SLOT_FREE: u8 = 0;
const SLOT_READY: u8 = 1;
const SLOT_BUSY: u8 = 2;

/// A contiguous run of data units handed to one worker.
struct Fragment {
    data: *mut u8,
    len: usize,
    start_unit: u64,
    ctx: *const CryptoContext,
    encrypt: bool,
    latch: Arc<Latch>,
}

// SAFETY: the producer keeps both the buffer and the context borrowed until
// the fragment latch reaches zero, and fragments of one request never overlap.
unsafe impl Send for Fragment {}

impl Fragment {
    fn run(self) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: see the `Send` impl above.
            let data = unsafe { std::slice::from_raw_parts_mut(self.data, self.len) };
            let ctx = unsafe { &*self.ctx };
            if self.encrypt {
                ctx.encrypt_data_units_current_thread(data, self.start_unit);
            } else {
                ctx.decrypt_data_units_current_thread(data, self.start_unit);
            }
        }));
        if result.is_err() {
            log::error!("Panic while transforming data units from {}", self.start_unit);
        }
        self.latch.count_down(result.is_err());
    }
}

struct Derivation {
    batch: Arc<DerivationBatch>,
    index: usize,
    prf: Prf,
    iterations: u32,
    password: Zeroizing<Vec<u8>>,
    salt: Vec<u8>,
    key_len: usize,
}

impl Derivation {
    fn run(self) {
        let mut key = Zeroizing::new(vec![0u8; self.key_len]);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            derive_key(self.prf, &self.password, &self.salt, self.iterations, &mut key)
        }));
        let result = match result {
            Ok(Ok(())) => Ok(key),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                log::error!("Panic in {} key derivation", self.prf.name());
                Err(CryptoError::ParameterIncorrect("key derivation aborted"))
            }
        };
        self.batch.complete(self.index, result);
    }
}

enum Job {
    Transform(Fragment),
    Derive(Derivation),
}

impl Job {
    fn run(self) {
        match self {
            Job::Transform(fragment) => fragment.run(),
            Job::Derive(derivation) => derivation.run(),
        }
    }
}

enum DerivationSlot {
    Idle,
    Pending,
    Ready(Result<Zeroizing<Vec<u8>>>),
    Taken,
}

/// Results of the PBKDF2 trials for one header-open attempt.
///
/// Dropping the batch while derivations are still queued is fine: workers
/// keep it alive and the late keys are wiped when the last handle goes.
pub struct DerivationBatch {
    slots: Mutex<Vec<DerivationSlot>>,
    ready: Condvar,
}

impl DerivationBatch {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(DerivationBatch {
            slots: Mutex::new((0..count).map(|_| DerivationSlot::Idle).collect()),
            ready: Condvar::new(),
        })
    }

    fn mark_pending(&self, index: usize) {
        lock(&self.slots)[index] = DerivationSlot::Pending;
    }

    fn complete(&self, index: usize, result: Result<Zeroizing<Vec<u8>>>) {
        lock(&self.slots)[index] = DerivationSlot::Ready(result);
        self.ready.notify_all();
    }

    /// Derivations submitted but not yet taken by [`wait_next`](Self::wait_next).
    pub fn in_flight(&self) -> usize {
        lock(&self.slots)
            .iter()
            .filter(|s| matches!(s, DerivationSlot::Pending | DerivationSlot::Ready(_)))
            .count()
    }

    /// Blocks until some submitted derivation finishes and takes its result.
    /// Returns `None` once nothing is left to wait for.
    pub fn wait_next(&self) -> Option<(usize, Result<Zeroizing<Vec<u8>>>)> {
        let mut slots = lock(&self.slots);
        loop {
            if let Some(index) = slots.iter().position(|s| matches!(s, DerivationSlot::Ready(_))) {
                if let DerivationSlot::Ready(result) = std::mem::replace(&mut slots[index], DerivationSlot::Taken) {
                    return Some((index, result));
                }
            }
            if !slots.iter().any(|s| matches!(s, DerivationSlot::Pending)) {
                return None;
            }
            slots = match self.ready.wait(slots) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

struct Slot {
    state: AtomicU8,
    job: Mutex<Option<Job>>,
}

impl Slot {
    fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }
}

struct Shared {
    slots: Box<[Slot]>,
    enqueue_position: Mutex<usize>,
    dequeue_position: Mutex<usize>,
    work_ready: Event,
    work_completed: Event,
    stop_pending: AtomicBool,
}

impl Shared {
    fn stopping(&self) -> bool {
        self.stop_pending.load(Ordering::Acquire)
    }

    /// Queues `job`, or runs it on the calling thread once the pool is
    /// stopping so the request still completes.
    fn enqueue(&self, job: Job) {
        let mut position = lock(&self.enqueue_position);
        if self.stopping() {
            drop(position);
            job.run();
            return;
        }

        let slot = &self.slots[*position];
        while slot.state() != SLOT_FREE {
            if self.stopping() {
                drop(position);
                job.run();
                return;
            }
            self.work_completed.wait();
        }

        *lock(&slot.job) = Some(job);
        slot.set_state(SLOT_READY);
        *position = (*position + 1) % self.slots.len();
        self.work_ready.set();
    }

    fn worker_main(&self) {
        while !self.stopping() {
            let index = {
                let mut position = lock(&self.dequeue_position);
                let index = *position;
                *position = (index + 1) % self.slots.len();

                let slot = &self.slots[index];
                while !self.stopping() && slot.state() != SLOT_READY {
                    self.work_ready.wait();
                }
                if self.stopping() {
                    break;
                }
                slot.set_state(SLOT_BUSY);
                index
            };

            let slot = &self.slots[index];
            let job = lock(&slot.job).take();
            if let Some(job) = job {
                job.run();
            }
            slot.set_state(SLOT_FREE);
            self.work_completed.set();
        }
    }

    /// Runs whatever was queued but never picked up by a worker.
    fn drain(&self) {
        let _position = lock(&self.enqueue_position);
        let mut drained = 0;
        for slot in self.slots.iter() {
            if slot.state() == SLOT_READY {
                let job = lock(&slot.job).take();
                if let Some(job) = job {
                    job.run();
                    drained += 1;
                }
                slot.set_state(SLOT_FREE);
            }
        }
        if drained > 0 {
            log::debug!("Ran {} queued work items after stop", drained);
        }
    }
}

pub struct EncryptionThreadPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl EncryptionThreadPool {
    /// Starts a pool sized by `config`. Returns `Ok(None)` when fewer than
    /// two workers would run, in which case all work stays synchronous.
    pub fn start(config: &EngineConfig) -> Result<Option<Self>> {
        let count = config.effective_thread_count();
        if count < 2 {
            log::info!("Encryption thread pool not started ({} usable CPUs)", count);
            return Ok(None);
        }
        Self::with_threads(count).map(Some)
    }

    pub fn with_threads(count: usize) -> Result<Self> {
        if count < 2 {
            return Err(CryptoError::ParameterIncorrect("thread pool needs at least two threads"));
        }

        let slots = (0..count * 2)
            .map(|_| Slot { state: AtomicU8::new(SLOT_FREE), job: Mutex::new(None) })
            .collect();
        let shared = Arc::new(Shared {
            slots,
            enqueue_position: Mutex::new(0),
            dequeue_position: Mutex::new(0),
            work_ready: Event::new(),
            work_completed: Event::new(),
            stop_pending: AtomicBool::new(false),
        });

        let pool = EncryptionThreadPool {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Vec::with_capacity(count)),
            thread_count: count,
        };
        for i in 0..count {
            let shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("encryption-{i}"))
                .spawn(move || shared.worker_main());
            match spawned {
                Ok(handle) => lock(&pool.workers).push(handle),
                Err(e) => {
                    log::error!("Failed to spawn encryption thread: {}", e);
                    pool.stop();
                    return Err(CryptoError::OutOfMemory);
                }
            }
        }

        log::info!("Encryption thread pool started with {} threads", count);
        Ok(pool)
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopping()
    }

    /// Stops all workers. Work that was already queued still runs, on the
    /// calling thread if no worker got to it.
    pub fn stop(&self) {
        if self.shared.stop_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.work_ready.set();
        self.shared.work_completed.set();

        let workers = std::mem::take(&mut *lock(&self.workers));
        for handle in workers {
            if handle.join().is_err() {
                log::error!("Encryption thread panicked");
            }
        }
        self.shared.drain();
        log::info!("Encryption thread pool stopped");
    }

    pub fn encrypt_data_units(&self, data: &mut [u8], start_unit: u64, ctx: &CryptoContext) {
        self.transform(data, start_unit, ctx, true);
    }

    pub fn decrypt_data_units(&self, data: &mut [u8], start_unit: u64, ctx: &CryptoContext) {
        self.transform(data, start_unit, ctx, false);
    }

    fn transform(&self, data: &mut [u8], start_unit: u64, ctx: &CryptoContext, encrypt: bool) {
        assert!(
            data.len() % ENCRYPTION_DATA_UNIT_SIZE == 0,
            "buffer length {} is not a whole number of data units",
            data.len()
        );
        let unit_count = data.len() / ENCRYPTION_DATA_UNIT_SIZE;

        if self.shared.stopping() || unit_count < 2 || unit_count < self.thread_count {
            if encrypt {
                ctx.encrypt_data_units_current_thread(data, start_unit);
            } else {
                ctx.decrypt_data_units_current_thread(data, start_unit);
            }
            return;
        }

        let fragment_count = unit_count.min(self.thread_count);
        let base = unit_count / fragment_count;
        let remainder = unit_count % fragment_count;

        let latch = Arc::new(Latch::new(fragment_count));
        let guard = LatchGuard::new(&latch);
        let mut rest = data;
        let mut unit = start_unit;
        for i in 0..fragment_count {
            let units = base + usize::from(i < remainder);
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(units * ENCRYPTION_DATA_UNIT_SIZE);
            rest = tail;
            self.shared.enqueue(Job::Transform(Fragment {
                data: head.as_mut_ptr(),
                len: head.len(),
                start_unit: unit,
                ctx: ctx as *const CryptoContext,
                encrypt,
                latch: Arc::clone(&latch),
            }));
            unit += units as u64;
        }

        if !guard.finish() {
            panic!("data unit transform failed on a worker thread");
        }
    }

    /// Queues one PBKDF2 derivation whose result is delivered to `batch`
    /// under `index`.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_key_derivation(
        &self,
        batch: &Arc<DerivationBatch>,
        index: usize,
        prf: Prf,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        key_len: usize,
    ) {
        batch.mark_pending(index);
        self.shared.enqueue(Job::Derive(Derivation {
            batch: Arc::clone(batch),
            index,
            prf,
            iterations,
            password: Zeroizing::new(password.to_vec()),
            salt: salt.to_vec(),
            key_len,
        }));
    }
}

impl Drop for EncryptionThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

lazy_static! {
    static ref GLOBAL_POOL: RwLock<Option<Arc<EncryptionThreadPool>>> = RwLock::new(None);
}

/// Starts the process-wide pool if it is not running. Returns whether a pool
/// is running afterwards.
pub fn start_global(config: &EngineConfig) -> Result<bool> {
    let mut global = match GLOBAL_POOL.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("RwLock poisoned, recovering");
            poisoned.into_inner()
        }
    };
    if global.is_none() {
        *global = EncryptionThreadPool::start(config)?.map(Arc::new);
    }
    Ok(global.is_some())
}

pub fn stop_global() {
    let pool = match GLOBAL_POOL.write() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => {
            log::warn!("RwLock poisoned, recovering");
            poisoned.into_inner().take()
        }
    };
    if let Some(pool) = pool {
        pool.stop();
    }
}

/// The process-wide pool, if started.
pub fn global() -> Option<Arc<EncryptionThreadPool>> {
    match GLOBAL_POOL.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Encrypts whole data units, through the global pool when it is running.
pub fn encrypt_data_units(data: &mut [u8], start_unit: u64, ctx: &CryptoContext) {
    match global() {
        Some(pool) => pool.encrypt_data_units(data, start_unit, ctx),
        None => ctx.encrypt_data_units_current_thread(data, start_unit),
    }
}

pub fn decrypt_data_units(data: &mut [u8], start_unit: u64, ctx: &CryptoContext) {
    match global() {
        Some(pool) => pool.decrypt_data_units(data, start_unit, ctx),
        None => ctx.decrypt_data_units_current_thread(data, start_unit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{algorithm_by_name, Mode};

    fn context() -> CryptoContext {
        let keys: Vec<u8> = (0..64u8).collect();
        CryptoContext::new(algorithm_by_name("AES").unwrap(), Mode::Xts, &keys).unwrap()
    }

    fn units(count: usize) -> Vec<u8> {
        (0..count * ENCRYPTION_DATA_UNIT_SIZE).map(|i| (i * 7) as u8).collect()
    }

    #[test]
    fn refuses_single_thread_pool() {
        assert!(EncryptionThreadPool::with_threads(1).is_err());
        let config = EngineConfig::default().with_thread_count(1);
        assert!(EncryptionThreadPool::start(&config).unwrap().is_none());
    }

    #[test]
    fn matches_serial_transform() {
        let pool = EncryptionThreadPool::with_threads(4).unwrap();
        let ctx = context();
        for count in [1, 3, 4, 5, 37] {
            let mut expected = units(count);
            ctx.encrypt_data_units_current_thread(&mut expected, 9);

            let mut data = units(count);
            pool.encrypt_data_units(&mut data, 9, &ctx);
            assert_eq!(data, expected, "{count} units");

            pool.decrypt_data_units(&mut data, 9, &ctx);
            assert_eq!(data, units(count));
        }
    }

    #[test]
    fn stopped_pool_runs_inline() {
        let pool = EncryptionThreadPool::with_threads(2).unwrap();
        pool.stop();
        assert!(!pool.is_running());
        pool.stop();

        let ctx = context();
        let mut expected = units(8);
        ctx.encrypt_data_units_current_thread(&mut expected, 0);
        let mut data = units(8);
        pool.encrypt_data_units(&mut data, 0, &ctx);
        assert_eq!(data, expected);
    }

    #[test]
    fn derivations_complete_in_any_order() {
        let pool = EncryptionThreadPool::with_threads(3).unwrap();
        let batch = DerivationBatch::new(3);
        let prfs = [Prf::Sha256, Prf::Sha512, Prf::Whirlpool];
        for (i, prf) in prfs.iter().enumerate() {
            pool.begin_key_derivation(&batch, i, *prf, b"pw", &[1u8; 64], 2, 64);
        }

        let mut seen = [false; 3];
        while let Some((index, key)) = batch.wait_next() {
            let mut expected = [0u8; 64];
            derive_key(prfs[index], b"pw", &[1u8; 64], 2, &mut expected).unwrap();
            assert_eq!(key.unwrap().as_slice(), &expected[..]);
            seen[index] = true;
        }
        assert_eq!(seen, [true; 3]);
        assert_eq!(batch.in_flight(), 0);
    }

    #[test]
    fn failed_derivation_is_reported() {
        let pool = EncryptionThreadPool::with_threads(2).unwrap();
        let batch = DerivationBatch::new(1);
        pool.begin_key_derivation(&batch, 0, Prf::Sha256, b"pw", b"salt", 0, 32);
        let (index, result) = batch.wait_next().unwrap();
        assert_eq!(index, 0);
        assert!(result.is_err());
        assert!(batch.wait_next().is_none());
    }
}
