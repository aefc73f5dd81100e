//! The kernel cache: deduplicates built programs across BLAS calls and
//! bounds the total bytes they occupy.
//!
//! Records are reference counted through `Arc`; cloning a found record is
//! the `get`, dropping it is the `put`. A record evicted from the cache
//! survives for as long as callers still hold clones, and its destructor
//! callback runs exactly once when the last clone drops.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::compute::{Context, Device, Program};
use crate::granulation::{SubproblemDim, MAX_SUBDIMS};
use crate::program::program_binary_size;
use crate::solver::{KernelExtra, SolverId};

/// Unique kernel characteristics below the solver level.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub device: Device,
    pub context: Context,
    pub nr_dims: u32,
    pub subdims: [SubproblemDim; MAX_SUBDIMS],
}

/// Equivalence predicate over pattern extras within one key bucket.
pub type ExtraCmpFn = fn(&KernelExtra, &KernelExtra) -> bool;

/// The default extras predicate: structural equality.
pub fn extra_cmp_eq(a: &KernelExtra, b: &KernelExtra) -> bool {
    a == b
}

type KernelDtor = Box<dyn FnOnce(&mut KernelEntry) + Send + Sync>;

/// A built kernel program plus the pattern-specific information needed
/// to rebind it on a later call.
pub struct KernelEntry {
    program: Program,
    extra: KernelExtra,
    no_source: bool,
    dtor: Mutex<Option<KernelDtor>>,
}

impl KernelEntry {
    /// Allocates a record with an initial reference count of one.
    pub fn new(program: Program, extra: KernelExtra, no_source: bool) -> Arc<KernelEntry> {
        Arc::new(KernelEntry {
            program,
            extra,
            no_source,
            dtor: Mutex::new(None),
        })
    }

    pub fn with_dtor(
        program: Program,
        extra: KernelExtra,
        no_source: bool,
        dtor: KernelDtor,
    ) -> Arc<KernelEntry> {
        Arc::new(KernelEntry {
            program,
            extra,
            no_source,
            dtor: Mutex::new(Some(dtor)),
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn extra(&self) -> &KernelExtra {
        &self.extra
    }

    /// True when the record was constructed from a saved binary rather
    /// than generated source.
    pub fn no_source(&self) -> bool {
        self.no_source
    }

    /// Bytes this record accounts for against the cache limit.
    fn footprint(&self) -> usize {
        let binary = program_binary_size(&self.program).unwrap_or(0);
        std::mem::size_of::<KernelEntry>() + std::mem::size_of::<KernelExtra>() + binary
    }
}

impl Drop for KernelEntry {
    fn drop(&mut self) {
        let dtor = self.dtor.get_mut().map(|d| d.take()).unwrap_or(None);
        if let Some(dtor) = dtor {
            dtor(self);
        }
    }
}

impl std::fmt::Debug for KernelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("KernelEntry")
            .field("extra", &self.extra)
            .field("no_source", &self.no_source)
            .finish()
    }
}

/// Why an insertion was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheAddError {
    #[error("solver id out of range")]
    InvalidSolver,
    #[error("kernel footprint exceeds the cache size limit")]
    TooLarge,
    #[error("an equivalent kernel is already cached")]
    Duplicate,
}

struct CacheSlot {
    key: KernelKey,
    extra_cmp: ExtraCmpFn,
    kernel: Arc<KernelEntry>,
    footprint: usize,
    seq: u64,
}

struct Inner {
    lists: Vec<VecDeque<CacheSlot>>,
    limit: usize,
    total: usize,
    seq: u64,
}

/// One list of cached kernels per solver id, under a global byte limit.
pub struct KernelCache {
    inner: Mutex<Inner>,
}

impl KernelCache {
    /// `size_limit` of zero leaves the cache unbounded.
    pub fn new(nr_solvers: usize, size_limit: usize) -> KernelCache {
        let limit = if size_limit == 0 { usize::MAX } else { size_limit };
        KernelCache {
            inner: Mutex::new(Inner {
                lists: (0..nr_solvers).map(|_| VecDeque::new()).collect(),
                limit,
                total: 0,
                seq: 0,
            }),
        }
    }

    /// Inserts a record, evicting older ones as needed to respect the
    /// size limit. Records whose only reference is the cache itself are
    /// evicted first, oldest first.
    pub fn add(
        &self,
        sid: SolverId,
        kernel: Arc<KernelEntry>,
        key: KernelKey,
        extra_cmp: ExtraCmpFn,
    ) -> Result<(), CacheAddError> {
        let footprint = kernel.footprint();
        let mut inner = self.inner.lock().unwrap();

        if sid >= inner.lists.len() {
            return Err(CacheAddError::InvalidSolver);
        }
        if footprint > inner.limit {
            return Err(CacheAddError::TooLarge);
        }
        let duplicate = inner.lists[sid]
            .iter()
            .any(|slot| slot.key == key && (slot.extra_cmp)(slot.kernel.extra(), kernel.extra()));
        if duplicate {
            return Err(CacheAddError::Duplicate);
        }

        while inner.total + footprint > inner.limit {
            if !evict_one(&mut inner) {
                break;
            }
        }

        inner.total += footprint;
        let seq = inner.seq;
        inner.seq += 1;
        inner.lists[sid].push_back(CacheSlot {
            key,
            extra_cmp,
            kernel,
            footprint,
            seq,
        });
        Ok(())
    }

    /// Looks a kernel up by (solver, key, extras); a hit returns a new
    /// reference to the stored record.
    pub fn find(
        &self,
        sid: SolverId,
        key: &KernelKey,
        extra: &KernelExtra,
    ) -> Option<Arc<KernelEntry>> {
        let inner = self.inner.lock().unwrap();
        let list = inner.lists.get(sid)?;
        list.iter()
            .find(|slot| slot.key == *key && (slot.extra_cmp)(slot.kernel.extra(), extra))
            .map(|slot| slot.kernel.clone())
    }

    /// Bytes still available under the size limit.
    pub fn avail_size(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.limit - inner.total
    }

    /// Total records currently cached.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.lists.iter().map(|l| l.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every record. Records still referenced by callers stay
    /// alive until those references drop.
    pub fn clean(&self) {
        let mut inner = self.inner.lock().unwrap();
        for list in inner.lists.iter_mut() {
            list.clear();
        }
        inner.total = 0;
    }
}

impl std::fmt::Debug for KernelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("KernelCache")
            .field("limit", &inner.limit)
            .field("total", &inner.total)
            .field("records", &inner.lists.iter().map(|l| l.len()).sum::<usize>())
            .finish()
    }
}

/// Evicts the best candidate record; returns false when the cache is
/// empty.
fn evict_one(inner: &mut Inner) -> bool {
    // Prefer records nothing outside the cache references.
    let pick = |unreferenced_only: bool| -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, u64)> = None;
        for (li, list) in inner.lists.iter().enumerate() {
            for (si, slot) in list.iter().enumerate() {
                if unreferenced_only && Arc::strong_count(&slot.kernel) != 1 {
                    continue;
                }
                if best.map_or(true, |(_, _, seq)| slot.seq < seq) {
                    best = Some((li, si, slot.seq));
                }
            }
        }
        best.map(|(li, si, _)| (li, si))
    };

    let target = pick(true).or_else(|| pick(false));
    match target {
        Some((li, si)) => {
            let slot = inner.lists[li].remove(si).expect("eviction index");
            inner.total -= slot.footprint;
            trace!("evicted kernel record (solver {}, {} bytes)", li, slot.footprint);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{
        ApiError, ApiResult, ContextApi, DeviceApi, ImageFormat, Kernel, Mem, ProgramApi,
    };
    use crate::solver::KernelExtraFlags;
    use crate::types::DataType;

    #[derive(Debug)]
    struct StubProgram {
        binary: Vec<u8>,
    }

    impl ProgramApi for StubProgram {
        fn build(&self, _device: &Device, _options: &str) -> ApiResult<()> {
            Ok(())
        }

        fn build_log(&self, _device: &Device) -> ApiResult<String> {
            Ok(String::new())
        }

        fn binary_sizes(&self) -> ApiResult<Vec<usize>> {
            Ok(vec![self.binary.len()])
        }

        fn binaries(&self) -> ApiResult<Vec<Vec<u8>>> {
            Ok(vec![self.binary.clone()])
        }

        fn create_kernel(&self, name: &str) -> ApiResult<Kernel> {
            Err(ApiError::InvalidKernelName(name.into()))
        }
    }

    #[derive(Debug)]
    struct StubContext;

    impl ContextApi for StubContext {
        fn create_buffer(&self, _len: usize) -> ApiResult<Mem> {
            Err(ApiError::OutOfResources)
        }

        fn create_image_2d(
            &self,
            _format: ImageFormat,
            _width: usize,
            _height: usize,
        ) -> ApiResult<Mem> {
            Err(ApiError::OutOfResources)
        }

        fn create_program_with_source(&self, _source: &str) -> ApiResult<Program> {
            Err(ApiError::OutOfResources)
        }

        fn create_program_with_binary(
            &self,
            _device: &Device,
            _binary: &[u8],
        ) -> ApiResult<Program> {
            Err(ApiError::OutOfResources)
        }
    }

    #[derive(Debug)]
    struct StubDevice;

    impl DeviceApi for StubDevice {
        fn vendor(&self) -> ApiResult<String> {
            Ok("stub".into())
        }
        fn name(&self) -> ApiResult<String> {
            Ok("stub".into())
        }
        fn max_compute_units(&self) -> ApiResult<u32> {
            Ok(1)
        }
        fn max_work_group_size(&self) -> ApiResult<usize> {
            Ok(256)
        }
        fn local_mem_size(&self) -> ApiResult<u64> {
            Ok(32 * 1024)
        }
        fn min_data_type_align(&self) -> ApiResult<u32> {
            Ok(128)
        }
        fn address_bits(&self) -> ApiResult<u32> {
            Ok(32)
        }
        fn preferred_vector_width_double(&self) -> ApiResult<u32> {
            Ok(0)
        }
        fn extensions(&self) -> ApiResult<String> {
            Ok(String::new())
        }
    }

    lazy_static::lazy_static! {
        static ref DEV: Device = Device::new(std::sync::Arc::new(StubDevice));
        static ref CTX: Context = Context::new(std::sync::Arc::new(StubContext));
    }

    fn program(binary_len: usize) -> Program {
        Program::new(std::sync::Arc::new(StubProgram {
            binary: vec![0xAB; binary_len],
        }))
    }

    fn key(nr_dims: u32) -> KernelKey {
        KernelKey {
            device: DEV.clone(),
            context: CTX.clone(),
            nr_dims,
            subdims: [SubproblemDim::default(); MAX_SUBDIMS],
        }
    }

    fn extra(priv_id: u64) -> KernelExtra {
        KernelExtra {
            dtype: DataType::Float,
            flags: KernelExtraFlags::empty(),
            vec_len: 1,
            solver_priv: priv_id,
        }
    }

    fn entry_footprint(binary_len: usize) -> usize {
        std::mem::size_of::<KernelEntry>() + std::mem::size_of::<KernelExtra>() + binary_len
    }

    #[test]
    fn find_hits_matching_key_and_extras() {
        let cache = KernelCache::new(2, 0);
        let kern = KernelEntry::new(program(64), extra(7), false);
        let k = key(2);

        cache.add(0, kern, k.clone(), extra_cmp_eq).unwrap();

        assert!(cache.find(0, &k, &extra(7)).is_some());
        assert!(cache.find(0, &k, &extra(8)).is_none());
        assert!(cache.find(1, &k, &extra(7)).is_none());
        assert!(cache.find(0, &key(3), &extra(7)).is_none());
    }

    #[test]
    fn oversized_record_is_rejected_unchanged() {
        let limit = entry_footprint(64);
        let cache = KernelCache::new(1, limit);
        let small = KernelEntry::new(program(64), extra(1), false);
        cache.add(0, small, key(1), extra_cmp_eq).unwrap();
        let avail = cache.avail_size();

        let huge = KernelEntry::new(program(limit + 1), extra(2), false);
        assert_eq!(
            cache.add(0, huge, key(2), extra_cmp_eq),
            Err(CacheAddError::TooLarge)
        );
        assert_eq!(cache.avail_size(), avail);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn size_limit_is_never_exceeded() {
        let limit = entry_footprint(100) * 2;
        let cache = KernelCache::new(1, limit);

        for i in 0..5u64 {
            let kern = KernelEntry::new(program(100), extra(i), false);
            cache.add(0, kern, key(1), extra_cmp_eq).unwrap();
            assert!(cache.avail_size() <= limit);
        }
        // Two fit at a time; the oldest three were evicted.
        assert_eq!(cache.len(), 2);
        assert!(cache.find(0, &key(1), &extra(0)).is_none());
        assert!(cache.find(0, &key(1), &extra(4)).is_some());
    }

    #[test]
    fn externally_referenced_records_evict_last() {
        let limit = entry_footprint(100) * 2;
        let cache = KernelCache::new(1, limit);

        let pinned = KernelEntry::new(program(100), extra(0), false);
        cache.add(0, pinned.clone(), key(1), extra_cmp_eq).unwrap();
        cache
            .add(0, KernelEntry::new(program(100), extra(1), false), key(1), extra_cmp_eq)
            .unwrap();

        // Inserting a third must evict the unreferenced record even
        // though the pinned one is older.
        cache
            .add(0, KernelEntry::new(program(100), extra(2), false), key(1), extra_cmp_eq)
            .unwrap();
        assert!(cache.find(0, &key(1), &extra(0)).is_some());
        assert!(cache.find(0, &key(1), &extra(1)).is_none());
    }

    #[test]
    fn duplicate_insertion_is_refused() {
        let cache = KernelCache::new(1, 0);
        cache
            .add(0, KernelEntry::new(program(16), extra(1), false), key(1), extra_cmp_eq)
            .unwrap();
        assert_eq!(
            cache.add(0, KernelEntry::new(program(16), extra(1), false), key(1), extra_cmp_eq),
            Err(CacheAddError::Duplicate)
        );
    }

    #[test]
    fn invalid_solver_id() {
        let cache = KernelCache::new(1, 0);
        assert_eq!(
            cache.add(3, KernelEntry::new(program(16), extra(1), false), key(1), extra_cmp_eq),
            Err(CacheAddError::InvalidSolver)
        );
    }

    #[test]
    fn dtor_runs_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let drops = std::sync::Arc::new(AtomicUsize::new(0));
        let drops2 = drops.clone();

        let cache = KernelCache::new(1, 0);
        let kern = KernelEntry::with_dtor(
            program(16),
            extra(1),
            false,
            Box::new(move |_| {
                drops2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        cache.add(0, kern, key(1), extra_cmp_eq).unwrap();

        let found = cache.find(0, &key(1), &extra(1)).unwrap();
        cache.clean();
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(found);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clean_empties_the_cache() {
        let cache = KernelCache::new(2, 0);
        cache
            .add(0, KernelEntry::new(program(16), extra(1), false), key(1), extra_cmp_eq)
            .unwrap();
        cache
            .add(1, KernelEntry::new(program(16), extra(2), false), key(1), extra_cmp_eq)
            .unwrap();
        cache.clean();
        assert!(cache.is_empty());
        assert!(cache.find(0, &key(1), &extra(1)).is_none());
    }

    #[test]
    fn custom_extras_predicate() {
        fn ignore_priv(a: &KernelExtra, b: &KernelExtra) -> bool {
            a.dtype == b.dtype && a.flags == b.flags && a.vec_len == b.vec_len
        }

        let cache = KernelCache::new(1, 0);
        cache
            .add(0, KernelEntry::new(program(16), extra(1), false), key(1), ignore_priv)
            .unwrap();
        assert!(cache.find(0, &key(1), &extra(99)).is_some());
    }
}
