//! 对齐原生内存的分配与回收。
//!
//! 每个分配都在登记表中留有一条记录，记录只弱引用宿主可见的包装对象。
//! 包装对象的最后一个引用释放时，按 [`Reclaim`] 立即释放原生内存，或者登记到回收通道等待 [`Tracker::sweep`]。
//! 无论由哪条路径触发，一块原生内存至多释放一次。

mod alloc;
mod sweeper;

pub use alloc::{NativeAlloc, SystemAlloc};
pub use sweeper::Sweeper;

use crate::{allocation_tracking_failure, invalid_argument, BindError, Reclaim, TrackerConfig};
use log::{debug, error, trace};
use std::{
    collections::HashMap,
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice::{from_raw_parts, from_raw_parts_mut},
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex, Weak,
    },
};

/// 对齐分配的追踪器，克隆得到的追踪器共享同一张登记表。
#[derive(Clone)]
pub struct Tracker(Arc<Shared>);

/// 分配记录的编号，在一个追踪器内唯一且不复用。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RecordId(u64);

/// 分配记录的状态，只能从 `Pending` 变为 `Freed`。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    Pending,
    Freed,
}

struct Shared {
    alloc: Box<dyn NativeAlloc>,
    config: TrackerConfig,
    registry: Mutex<Registry>,
    collected: Mutex<Receiver<u64>>,
    notifier: Mutex<Sender<u64>>,
}

#[derive(Default)]
struct Registry {
    records: HashMap<u64, Record>,
    retry: Vec<u64>,
    next_id: u64,
}

struct Record {
    watch: Weak<RegionInner>,
    block: Block,
}

#[derive(Clone, Copy)]
struct Block {
    ptr: NonNull<u8>,
    size: usize,
    alignment: usize,
}

unsafe impl Send for Block {}

struct RegionInner {
    id: u64,
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
    tracker: Arc<Shared>,
}

unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}

/// 对齐分配的共享引用，只要还有一个存活，原生内存就不会被释放。
#[derive(Clone)]
pub struct Region(Arc<RegionInner>);

/// 追踪器交给宿主的对齐缓冲区。
///
/// 缓冲区和由它派生的 [`Region`] 全部释放后，原生内存才进入回收流程。
pub struct AlignedBuffer {
    inner: Arc<RegionInner>,
}

impl Default for Tracker {
    #[inline]
    fn default() -> Self {
        Self::new(SystemAlloc, TrackerConfig::default())
    }
}

impl Tracker {
    pub fn new(alloc: impl NativeAlloc + 'static, config: TrackerConfig) -> Self {
        let (notifier, collected) = channel();
        Self(Arc::new(Shared {
            alloc: Box::new(alloc),
            config,
            registry: Mutex::new(Registry::default()),
            collected: Mutex::new(collected),
            notifier: Mutex::new(notifier),
        }))
    }

    #[inline]
    pub fn config(&self) -> &TrackerConfig {
        &self.0.config
    }

    /// 分配 `size` 字节、按 `alignment` 对齐且清零的缓冲区。
    ///
    /// 对齐不是 2 的幂时返回错误；原生分配失败时返回 `Ok(None)`。
    pub fn allocate(&self, size: usize, alignment: usize) -> Result<Option<AlignedBuffer>, BindError> {
        if !alignment.is_power_of_two() {
            return Err(invalid_argument(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        let Some(ptr) = self.0.alloc.alloc_aligned(size, alignment) else {
            debug!("aligned allocation of {size} bytes / {alignment} unavailable");
            return Ok(None);
        };

        let mut registry = self.0.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        let inner = Arc::new(RegionInner {
            id,
            ptr,
            len: size,
            alignment,
            tracker: self.0.clone(),
        });
        let record = Record {
            watch: Arc::downgrade(&inner),
            block: Block {
                ptr,
                size,
                alignment,
            },
        };
        debug_assert!(registry.records.values().all(|r| r.block.ptr != ptr));
        registry.records.insert(id, record);
        drop(registry);

        trace!("allocated #{id}: {size} bytes at {ptr:p} / {alignment}");
        Ok(Some(AlignedBuffer { inner }))
    }

    /// 释放所有已不可达的分配，返回本次释放的数量。
    ///
    /// 释放失败的记录保持 `Pending`，留到下一次回收重试。
    #[inline]
    pub fn sweep(&self) -> usize {
        self.0.sweep()
    }

    /// 立即释放缓冲区。
    ///
    /// 缓冲区仍被其他 [`Region`] 共享（例如在途的传输），或者不属于这个追踪器时，原样退回。
    pub fn free_manually(&self, buf: AlignedBuffer) -> Result<(), AlignedBuffer> {
        if !Arc::ptr_eq(&buf.inner.tracker, &self.0) {
            return Err(buf);
        }
        let inner = match Arc::try_unwrap(buf.inner) {
            Ok(inner) => inner,
            Err(inner) => return Err(AlignedBuffer { inner }),
        };

        let mut registry = self.0.registry.lock().unwrap();
        match registry.free(inner.id, &*self.0.alloc) {
            Ok(_) => {}
            Err(e) => {
                error!("{e}");
                registry.retry.push(inner.id);
            }
        }
        drop(registry);
        // 记录已不在登记表中，包装对象析构时的回收是空操作
        drop(inner);
        Ok(())
    }

    /// 尚未释放的分配数量。
    #[inline]
    pub fn pending(&self) -> usize {
        self.0.registry.lock().unwrap().records.len()
    }

    /// 查询记录状态，编号不属于这个追踪器时返回 `None`。
    pub fn state(&self, id: RecordId) -> Option<State> {
        let registry = self.0.registry.lock().unwrap();
        if registry.records.contains_key(&id.0) {
            Some(State::Pending)
        } else if id.0 < registry.next_id {
            Some(State::Freed)
        } else {
            None
        }
    }

    /// 启动后台回收线程，按 [`TrackerConfig::sweep_interval`] 轮询回收通道。
    ///
    /// 返回的守卫析构时停止线程。
    pub fn spawn_sweeper(&self) -> Result<Sweeper, BindError> {
        Sweeper::spawn(Arc::downgrade(&self.0), self.0.config.sweep_interval)
    }
}

impl Shared {
    fn sweep(&self) -> usize {
        let mut registry = self.registry.lock().unwrap();
        let mut ids = std::mem::take(&mut registry.retry);
        ids.extend(self.collected.lock().unwrap().try_iter());

        let mut freed = 0;
        for id in ids {
            match registry.free(id, &*self.alloc) {
                Ok(true) => freed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!("{e}");
                    registry.retry.push(id);
                }
            }
        }
        if freed > 0 {
            debug!("swept {freed} aligned allocations, {} pending", registry.records.len());
        }
        freed
    }

    fn unreachable(&self, id: u64) {
        match self.config.reclaim {
            Reclaim::Eager => {
                let mut registry = self.registry.lock().unwrap();
                if let Err(e) = registry.free(id, &*self.alloc) {
                    error!("{e}");
                    registry.retry.push(id);
                }
            }
            Reclaim::Deferred => {
                // 接收端与发送端同属一个追踪器，不会断开
                let _ = self.notifier.lock().unwrap().send(id);
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // 所有包装对象都持有追踪器，此时剩下的记录都已不可达
        let registry = self.registry.get_mut().unwrap();
        for (id, record) in registry.records.drain() {
            let Block {
                ptr,
                size,
                alignment,
            } = record.block;
            if let Err(e) = unsafe { self.alloc.free_aligned(ptr, size, alignment) } {
                error!("leaking aligned allocation #{id}: {e}");
            }
        }
    }
}

impl Registry {
    /// 释放不可达的记录。记录不存在或仍可达时返回 `Ok(false)`。
    fn free(&mut self, id: u64, alloc: &dyn NativeAlloc) -> Result<bool, BindError> {
        let Some(record) = self.records.get(&id) else {
            return Ok(false);
        };
        if record.watch.strong_count() > 0 {
            return Ok(false);
        }
        let Block {
            ptr,
            size,
            alignment,
        } = record.block;
        unsafe { alloc.free_aligned(ptr, size, alignment) }.map_err(|e| {
            allocation_tracking_failure(format!("failed to free #{id} at {ptr:p}: {}", e.info))
        })?;
        self.records.remove(&id);
        trace!("freed #{id}: {size} bytes at {ptr:p}");
        Ok(true)
    }
}

impl Drop for RegionInner {
    #[inline]
    fn drop(&mut self) {
        self.tracker.unreachable(self.id)
    }
}

impl Region {
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.ptr.as_ptr()
    }

    #[inline]
    pub fn id(&self) -> RecordId {
        RecordId(self.0.id)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Region#{}[{:p}; {}]", self.0.id, self.0.ptr, self.0.len)
    }
}

impl AlignedBuffer {
    #[inline]
    pub fn id(&self) -> RecordId {
        RecordId(self.inner.id)
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.inner.alignment
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.inner.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.inner.ptr.as_ptr()
    }

    /// 共享这块内存的区域引用，用于把内存交给原生代码。
    #[inline]
    pub fn region(&self) -> Region {
        Region(self.inner.clone())
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        unsafe { from_raw_parts(self.inner.ptr.as_ptr(), self.inner.len) }
    }
}

impl DerefMut for AlignedBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.inner.ptr.as_ptr(), self.inner.len) }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "AlignedBuffer#{}[{:p}; {} / {}]",
            self.inner.id, self.inner.ptr, self.inner.len, self.inner.alignment
        )
    }
}
