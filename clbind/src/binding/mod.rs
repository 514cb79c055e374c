//! 调用边界。
//!
//! 进程内所有原生调用在同一把锁下串行执行，与绑定层实例和 API 实例无关。参数校验在加锁之前完成，
//! 不合法的参数以 [`InvalidArgument`](crate::ErrorKind::InvalidArgument) 拒绝，不会到达原生代码。
//! 原生结果码按 [`Config::exceptions`] 原样返回或者转换为错误。

mod properties;
mod transfer;

pub use properties::ContextProperties;

use crate::{
    bindings::*,
    handle::kind,
    invalid_argument, native_call_failed,
    pointer::{Access, Pointer},
    BindError, ClContext, ClDevice, ClEvent, ClKernel, ClMem, ClPlatform, ClProgram, ClQueue,
    ClSampler, Code, Config, Handle, Kind, NativeApi, RefCounted, Region,
};
use log::{debug, error, trace};
use std::{
    any::TypeId,
    collections::{HashMap, HashSet},
    ffi::{c_char, CString},
    mem::size_of,
    ptr::{null, null_mut},
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

/// 原生调用锁，整个进程只有一把。
static NATIVE: Mutex<()> = Mutex::new(());

/// 原生 API 的调用边界。
pub struct Binding<A> {
    api: Arc<A>,
    exceptions: AtomicBool,
    anchors: Mutex<Anchors>,
}

/// 原生代码在调用返回后仍会访问的主机区域。
#[derive(Default)]
struct Anchors {
    /// 非阻塞传输的区域，按命令队列分组，直到队列完成或事件被等待。
    transfers: HashMap<ClQueue, Vec<(ClEvent, Region)>>,
    /// `CL_MEM_USE_HOST_PTR` 内存对象引用的区域。
    host_ptrs: HashMap<ClMem, HostPin>,
    /// 参数里有 `host_ptrs` 中内存对象的内核。
    kernel_mems: HashMap<ClKernel, HashSet<ClMem>>,
    /// 顺序执行的队列，其上的阻塞命令返回时之前的命令都已完成。
    in_order: HashSet<ClQueue>,
    /// 无法确认原生代码已经不再访问的区域，随绑定层一起释放。
    retired: Vec<Region>,
}

struct HostPin {
    /// 绑定层所见的原生引用计数。
    refs: usize,
    region: Region,
    /// 可能还有命令在使用这个内存对象的队列。
    queues: HashSet<ClQueue>,
}

impl Anchors {
    /// 队列上的命令已全部完成。
    fn settle(&mut self, queue: ClQueue) -> Vec<Region> {
        for pin in self.host_ptrs.values_mut() {
            pin.queues.remove(&queue);
        }
        self.transfers
            .remove(&queue)
            .unwrap_or_default()
            .into_iter()
            .map(|(_, region)| region)
            .collect()
    }

    /// 队列上有命令在使用内存对象。
    fn touch(&mut self, queue: ClQueue, mem: ClMem) {
        if let Some(pin) = self.host_ptrs.get_mut(&mem) {
            pin.queues.insert(queue);
        }
    }

    fn touch_kernel(&mut self, queue: ClQueue, kernel: ClKernel) {
        if let Some(mems) = self.kernel_mems.get(&kernel) {
            for mem in mems {
                if let Some(pin) = self.host_ptrs.get_mut(mem) {
                    pin.queues.insert(queue);
                }
            }
        }
    }

    fn busy(&self, queue: ClQueue) -> bool {
        self.transfers.contains_key(&queue)
            || self.host_ptrs.values().any(|pin| pin.queues.contains(&queue))
    }

    /// 阻塞命令在顺序队列上完成时，之前的命令也都已完成。
    fn blocked(&mut self, queue: ClQueue) -> Vec<Region> {
        if self.in_order.contains(&queue) {
            self.settle(queue)
        } else {
            vec![]
        }
    }

    /// 在原生锁内等待队列完成。
    fn drain(&mut self, api: &impl NativeApi, queue: ClQueue) -> (cl_int, Vec<Region>) {
        trace!("Executing clFinish");
        let code = unsafe { api.finish(queue.as_raw()) };
        let settled = if code == CL_SUCCESS {
            self.settle(queue)
        } else {
            vec![]
        };
        (code, settled)
    }

    /// 内存对象的一个引用已释放。最后一个引用释放时，
    /// 先等待使用过它的队列完成，再交还主机区域。
    fn unpin(&mut self, api: &impl NativeApi, mem: ClMem) -> Vec<Region> {
        match self.host_ptrs.get_mut(&mem) {
            Some(pin) if pin.refs > 1 => {
                pin.refs -= 1;
                return vec![];
            }
            Some(_) => {}
            None => return vec![],
        }
        let Some(pin) = self.host_ptrs.remove(&mem) else {
            return vec![];
        };
        for mems in self.kernel_mems.values_mut() {
            mems.remove(&mem);
        }
        self.kernel_mems.retain(|_, mems| !mems.is_empty());

        let mut settled = Vec::new();
        let mut unsure = false;
        for queue in pin.queues {
            match self.drain(api, queue) {
                (CL_SUCCESS, regions) => settled.extend(regions),
                (code, _) => {
                    error!("{mem} released but {queue} failed to finish: {}", Code(code));
                    unsure = true
                }
            }
        }
        if unsure {
            self.retired.push(pin.region)
        } else {
            settled.push(pin.region)
        }
        settled
    }
}

impl<A: NativeApi> Binding<A> {
    pub fn new(api: Arc<A>, config: Config) -> Self {
        Self {
            api,
            exceptions: AtomicBool::new(config.exceptions),
            anchors: Mutex::new(Anchors::default()),
        }
    }

    #[inline]
    pub fn api(&self) -> &A {
        &self.api
    }

    #[inline]
    pub fn set_exceptions_enabled(&self, enabled: bool) {
        self.exceptions.store(enabled, Relaxed)
    }

    #[inline]
    pub fn exceptions_enabled(&self) -> bool {
        self.exceptions.load(Relaxed)
    }

    /// 原生代码仍可能访问的主机区域数量。
    pub fn in_flight(&self) -> usize {
        let anchors = self.anchors.lock().unwrap();
        anchors.transfers.values().map(Vec::len).sum::<usize>()
            + anchors.host_ptrs.len()
            + anchors.retired.len()
    }

    pub fn platform_ids(&self) -> Result<(Vec<ClPlatform>, Code), BindError> {
        const NAME: &str = "clGetPlatformIDs";
        let (ids, code) = self.invoke(NAME, |api| {
            let mut n = 0;
            let code = unsafe { api.get_platform_ids(0, null_mut(), &mut n) };
            if code != CL_SUCCESS || n == 0 {
                return (vec![], code);
            }
            let mut ids = vec![ClPlatform::null(); n as usize];
            let code = unsafe { api.get_platform_ids(n, ids.as_mut_ptr().cast(), &mut n) };
            ids.truncate(n as usize);
            (ids, code)
        });
        let code = self.check(NAME, code)?;
        Ok((if code.is_success() { ids } else { vec![] }, code))
    }

    pub fn device_ids(
        &self,
        platform: ClPlatform,
        device_type: cl_device_type,
    ) -> Result<(Vec<ClDevice>, Code), BindError> {
        const NAME: &str = "clGetDeviceIDs";
        let platform = platform.as_raw();
        let (ids, code) = self.invoke(NAME, |api| {
            let mut n = 0;
            let code = unsafe { api.get_device_ids(platform, device_type, 0, null_mut(), &mut n) };
            if code != CL_SUCCESS || n == 0 {
                return (vec![], code);
            }
            let mut ids = vec![ClDevice::null(); n as usize];
            let code = unsafe {
                api.get_device_ids(platform, device_type, n, ids.as_mut_ptr().cast(), &mut n)
            };
            ids.truncate(n as usize);
            (ids, code)
        });
        let code = self.check(NAME, code)?;
        Ok((if code.is_success() { ids } else { vec![] }, code))
    }

    pub fn create_context(
        &self,
        properties: Option<&ContextProperties>,
        devices: &[ClDevice],
    ) -> Result<(ClContext, Code), BindError> {
        let (num_devices, devices) = handle_list("device", devices)?;
        let properties = properties.map_or(null(), |p| p.as_slice().as_ptr());
        self.created("clCreateContext", |api, err| unsafe {
            api.create_context(properties, num_devices, devices, err)
        })
    }

    pub fn create_command_queue(
        &self,
        context: ClContext,
        device: ClDevice,
        properties: cl_command_queue_properties,
    ) -> Result<(ClQueue, Code), BindError> {
        let (queue, code) = self.created("clCreateCommandQueue", |api, err| unsafe {
            api.create_command_queue(context.as_raw(), device.as_raw(), properties, err)
        })?;
        if !queue.is_null() {
            let mut anchors = self.anchors.lock().unwrap();
            if properties & CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE == 0 {
                anchors.in_order.insert(queue);
            } else {
                anchors.in_order.remove(&queue);
            }
        }
        Ok((queue, code))
    }

    /// 创建内存对象。
    ///
    /// `CL_MEM_USE_HOST_PTR` 要求主机区域地址稳定。内存对象的最后一个引用释放之后，
    /// 绑定层等待使用过它的队列完成，区域才可以回收。
    pub fn create_buffer(
        &self,
        context: ClContext,
        flags: cl_mem_flags,
        size: usize,
        host: &Pointer,
    ) -> Result<(ClMem, Code), BindError> {
        const NAME: &str = "clCreateBuffer";
        let uses_host = flags & CL_MEM_USE_HOST_PTR != 0;
        if !host.is_null() {
            if uses_host && !host.is_stable() {
                return Err(invalid_argument(format!(
                    "{NAME}: CL_MEM_USE_HOST_PTR requires a direct buffer, got {host}"
                )));
            }
            host.check_span(size, if uses_host { Access::Write } else { Access::Read })?;
        }
        let pin = if uses_host { host.region() } else { None };

        let mut err = CL_SUCCESS;
        let mem = self.invoke(NAME, |api| {
            let raw = unsafe { api.create_buffer(context.as_raw(), flags, size, host.resolve(), &mut err) };
            let mem = ClMem::from_raw(raw);
            if let (false, Some(region)) = (mem.is_null(), pin) {
                let pin = HostPin {
                    refs: 1,
                    region: region.clone(),
                    queues: HashSet::new(),
                };
                self.anchors.lock().unwrap().host_ptrs.insert(mem, pin);
            }
            mem
        });
        let code = self.check(NAME, err)?;
        trace!("{NAME} -> {mem}");
        Ok((mem, code))
    }

    pub fn create_program_with_source(
        &self,
        context: ClContext,
        sources: &[&str],
    ) -> Result<(ClProgram, Code), BindError> {
        let count = count("source", sources.len())?;
        let strings = sources.iter().map(|s| s.as_ptr().cast::<c_char>()).collect::<Vec<_>>();
        let lengths = sources.iter().map(|s| s.len()).collect::<Vec<_>>();
        self.created("clCreateProgramWithSource", |api, err| unsafe {
            api.create_program_with_source(
                context.as_raw(),
                count,
                strings.as_ptr(),
                lengths.as_ptr(),
                err,
            )
        })
    }

    /// 构建程序，`devices` 为空时面向程序关联的所有设备。
    pub fn build_program(
        &self,
        program: ClProgram,
        devices: &[ClDevice],
        options: &str,
    ) -> Result<Code, BindError> {
        const NAME: &str = "clBuildProgram";
        let (num_devices, devices) = handle_list("device", devices)?;
        let options = c_string(options)?;
        let code = self.invoke(NAME, |api| unsafe {
            api.build_program(program.as_raw(), num_devices, devices, options.as_ptr())
        });
        self.check(NAME, code)
    }

    pub fn create_kernel(&self, program: ClProgram, name: &str) -> Result<(ClKernel, Code), BindError> {
        let name = c_string(name)?;
        self.created("clCreateKernel", |api, err| unsafe {
            api.create_kernel(program.as_raw(), name.as_ptr(), err)
        })
    }

    /// 设置内核参数。`value` 为空指针时声明 `size` 字节的局部内存。
    pub fn set_kernel_arg(
        &self,
        kernel: ClKernel,
        index: cl_uint,
        size: usize,
        value: &Pointer,
    ) -> Result<Code, BindError> {
        const NAME: &str = "clSetKernelArg";
        value.check_span(size, Access::Read)?;
        let bound = value
            .handle_value()
            .filter(|_| size == size_of::<usize>())
            .map(|addr| ClMem::from_raw(addr as RawHandle));
        let code = self.invoke(NAME, |api| {
            let code = unsafe { api.set_kernel_arg(kernel.as_raw(), index, size, value.resolve()) };
            if let (CL_SUCCESS, Some(mem)) = (code, bound) {
                let mut anchors = self.anchors.lock().unwrap();
                if anchors.host_ptrs.contains_key(&mem) {
                    anchors.kernel_mems.entry(kernel).or_default().insert(mem);
                }
            }
            code
        });
        self.check(NAME, code)
    }

    pub fn enqueue_nd_range_kernel(
        &self,
        queue: ClQueue,
        kernel: ClKernel,
        global_offset: Option<&[usize]>,
        global_size: &[usize],
        local_size: Option<&[usize]>,
        wait: &[ClEvent],
    ) -> Result<(ClEvent, Code), BindError> {
        const NAME: &str = "clEnqueueNDRangeKernel";
        let dims = global_size.len();
        if !(1..=3).contains(&dims) {
            return Err(invalid_argument(format!("{NAME}: {dims} work dimensions")));
        }
        for (what, sizes) in [("offset", global_offset), ("local size", local_size)] {
            if let Some(sizes) = sizes.filter(|s| s.len() != dims) {
                return Err(invalid_argument(format!(
                    "{NAME}: {what} has {} dimensions, expected {dims}",
                    sizes.len()
                )));
            }
        }
        let (num_wait, wait) = wait_list(wait)?;
        let offset = global_offset.map_or(null(), <[usize]>::as_ptr);
        let local = local_size.map_or(null(), <[usize]>::as_ptr);

        let mut event = ClEvent::null();
        let code = self.invoke(NAME, |api| {
            let code = unsafe {
                api.enqueue_nd_range_kernel(
                    queue.as_raw(),
                    kernel.as_raw(),
                    dims as _,
                    offset,
                    global_size.as_ptr(),
                    local,
                    num_wait,
                    wait,
                    (&mut event as *mut ClEvent).cast(),
                )
            };
            if code == CL_SUCCESS {
                self.anchors.lock().unwrap().touch_kernel(queue, kernel)
            }
            code
        });
        let code = self.check(NAME, code)?;
        Ok((event, code))
    }

    pub fn create_sampler(
        &self,
        context: ClContext,
        normalized_coords: bool,
        addressing_mode: cl_addressing_mode,
        filter_mode: cl_filter_mode,
    ) -> Result<(ClSampler, Code), BindError> {
        self.created("clCreateSampler", |api, err| unsafe {
            api.create_sampler(
                context.as_raw(),
                cl_bool(normalized_coords),
                addressing_mode,
                filter_mode,
                err,
            )
        })
    }

    /// 查询内存对象信息，结果写入 `value` 指向的 `size` 字节，返回实际需要的字节数。
    pub fn mem_object_info(
        &self,
        mem: ClMem,
        param: cl_mem_info,
        size: usize,
        value: &Pointer,
    ) -> Result<(usize, Code), BindError> {
        const NAME: &str = "clGetMemObjectInfo";
        value.check_span(size, Access::Write)?;
        let mut size_ret = 0;
        let code = self.invoke(NAME, |api| unsafe {
            api.get_mem_object_info(mem.as_raw(), param, size, value.resolve(), &mut size_ret)
        });
        let code = self.check(NAME, code)?;
        Ok((size_ret, code))
    }

    pub fn flush(&self, queue: ClQueue) -> Result<Code, BindError> {
        const NAME: &str = "clFlush";
        let code = self.invoke(NAME, |api| unsafe { api.flush(queue.as_raw()) });
        self.check(NAME, code)
    }

    /// 等待队列中的命令全部完成，之后队列上的命令不再持有主机区域。
    pub fn finish(&self, queue: ClQueue) -> Result<Code, BindError> {
        const NAME: &str = "clFinish";
        let (code, settled) = {
            let _guard = native();
            let drained = self.anchors.lock().unwrap().drain(&*self.api, queue);
            drained
        };
        if !settled.is_empty() {
            debug!("{queue} finished, {} regions settled", settled.len());
        }
        self.check(NAME, code)
    }

    /// 等待事件完成，之后这些事件对应的非阻塞传输不再持有主机区域。
    pub fn wait_for_events(&self, events: &[ClEvent]) -> Result<Code, BindError> {
        const NAME: &str = "clWaitForEvents";
        let (num_events, list) = wait_list(events)?;
        let (code, settled) = self.invoke(NAME, |api| {
            let code = unsafe { api.wait_for_events(num_events, list) };
            let mut settled = Vec::new();
            if code == CL_SUCCESS {
                let mut anchors = self.anchors.lock().unwrap();
                for transfers in anchors.transfers.values_mut() {
                    let (done, rest): (Vec<_>, Vec<_>) =
                        transfers.drain(..).partition(|(e, _)| events.contains(e));
                    *transfers = rest;
                    settled.extend(done);
                }
                anchors.transfers.retain(|_, transfers| !transfers.is_empty());
            }
            (code, settled)
        });
        if !settled.is_empty() {
            debug!("{} transfers settled", settled.len());
        }
        self.check(NAME, code)
    }

    /// 增加原生引用计数。
    pub fn retain<K: RefCounted>(&self, handle: Handle<K>) -> Result<Code, BindError> {
        let name = format!("clRetain({})", K::NAME);
        let code = self.invoke(&name, |api| {
            let code = unsafe { K::retain(api, handle.as_raw()) };
            if code == CL_SUCCESS && is::<K, kind::Mem>() {
                let mem = ClMem::from_raw(handle.as_raw());
                if let Some(pin) = self.anchors.lock().unwrap().host_ptrs.get_mut(&mem) {
                    pin.refs += 1;
                }
            }
            code
        });
        self.check(&name, code)
    }

    /// 减少原生引用计数。
    ///
    /// 释放命令队列之前先等待仍持有主机区域的命令完成；
    /// 内存对象的最后一个引用释放后，等待使用过它的队列完成再交还主机区域。
    pub fn release<K: RefCounted>(&self, handle: Handle<K>) -> Result<Code, BindError> {
        let name = format!("clRelease({})", K::NAME);
        let (code, settled) = self.invoke(&name, |api| {
            let mut anchors = self.anchors.lock().unwrap();
            let mut settled = Vec::new();
            if is::<K, kind::Queue>() {
                let queue = ClQueue::from_raw(handle.as_raw());
                if anchors.busy(queue) {
                    settled = anchors.drain(api, queue).1;
                }
            }
            let code = unsafe { K::release(api, handle.as_raw()) };
            if code == CL_SUCCESS && is::<K, kind::Mem>() {
                settled.extend(anchors.unpin(api, ClMem::from_raw(handle.as_raw())));
            }
            (code, settled)
        });
        if !settled.is_empty() {
            debug!("{handle} released, {} regions settled", settled.len());
        }
        self.check(&name, code)
    }

    fn invoke<T>(&self, name: &str, f: impl FnOnce(&A) -> T) -> T {
        let _guard = native();
        trace!("Executing {name}");
        f(&self.api)
    }

    fn check(&self, name: &str, code: cl_int) -> Result<Code, BindError> {
        let code = Code(code);
        if !code.is_success() {
            debug!("{name} returned {code}");
            if self.exceptions_enabled() {
                return Err(native_call_failed(name, code));
            }
        }
        Ok(code)
    }

    fn created<K: Kind>(
        &self,
        name: &str,
        f: impl FnOnce(&A, *mut cl_int) -> RawHandle,
    ) -> Result<(Handle<K>, Code), BindError> {
        let mut err = CL_SUCCESS;
        let handle = Handle::from_raw(self.invoke(name, |api| f(api, &mut err)));
        let code = self.check(name, err)?;
        trace!("{name} -> {handle}");
        Ok((handle, code))
    }
}

/// 锁内只有 `()`，持锁线程 panic 之后锁仍然可用。
#[inline]
fn native() -> MutexGuard<'static, ()> {
    NATIVE.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
fn is<K: Kind, T: Kind>() -> bool {
    TypeId::of::<K>() == TypeId::of::<T>()
}

fn count(what: &str, len: usize) -> Result<cl_uint, BindError> {
    cl_uint::try_from(len).map_err(|_| invalid_argument(format!("too many {what}s: {len}")))
}

fn c_string(s: &str) -> Result<CString, BindError> {
    CString::new(s).map_err(|e| invalid_argument(format!("{s:?} contains a nul byte: {e}")))
}

/// 原生句柄列表，不允许出现空句柄。空列表以 `(0, NULL)` 传递。
fn handle_list<K: Kind>(what: &str, handles: &[Handle<K>]) -> Result<(cl_uint, *const RawHandle), BindError> {
    if let Some(i) = handles.iter().position(Handle::is_null) {
        return Err(invalid_argument(format!("{what} {i} of the list is null")));
    }
    let n = count(what, handles.len())?;
    Ok((n, if n == 0 { null() } else { handles.as_ptr().cast() }))
}

#[inline]
fn wait_list(events: &[ClEvent]) -> Result<(cl_uint, *const RawHandle), BindError> {
    handle_list("event", events)
}
