use crate::{
    allocation_tracking_failure,
    bindings::*,
    tracker::{NativeAlloc, SystemAlloc},
    BindError, Handle, Kind, NativeApi,
};
use std::{
    collections::{HashMap, HashSet},
    ffi::{c_char, c_void, CStr},
    ptr::{copy_nonoverlapping, null_mut, NonNull},
    slice::from_raw_parts,
    sync::{
        atomic::{
            AtomicBool, AtomicUsize,
            Ordering::{Relaxed, SeqCst},
        },
        Mutex,
    },
    thread,
};

/// 统计次数并检查重复释放的分配器。
#[derive(Default)]
pub struct CountingAlloc {
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
    /// 为真时释放失败且不释放内存。
    pub fail_frees: AtomicBool,
    /// 为真时拒绝分配。
    pub refuse: AtomicBool,
    live: Mutex<HashSet<usize>>,
}

impl NativeAlloc for CountingAlloc {
    fn alloc_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        if self.refuse.load(SeqCst) {
            return None;
        }
        let ptr = SystemAlloc.alloc_aligned(size, alignment)?;
        assert!(self.live.lock().unwrap().insert(ptr.as_ptr() as usize));
        self.allocs.fetch_add(1, SeqCst);
        Some(ptr)
    }

    unsafe fn free_aligned(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> Result<(), BindError> {
        if self.fail_frees.load(SeqCst) {
            return Err(allocation_tracking_failure("injected failure"));
        }
        assert!(
            self.live.lock().unwrap().remove(&(ptr.as_ptr() as usize)),
            "double free of {ptr:p}"
        );
        SystemAlloc.free_aligned(ptr, size, alignment)?;
        self.frees.fetch_add(1, SeqCst);
        Ok(())
    }
}

/// 在内存中模拟原生 API 的后端。
///
/// 两个平台，每个平台一个 GPU 设备。所有传输立即完成。
pub struct MockApi {
    state: Mutex<State>,
    active: AtomicUsize,
    overlaps: AtomicUsize,
}

#[derive(Default)]
struct State {
    next: usize,
    objects: HashMap<usize, Object>,
    devices: Vec<(usize, usize)>,
    mems: HashMap<usize, MemObject>,
    sources: HashMap<usize, String>,
    kernel_args: HashMap<(usize, cl_uint), Vec<u8>>,
    mapped: HashMap<usize, Mapping>,
    calls: Vec<&'static str>,
}

struct Object {
    kind: &'static str,
    refs: usize,
}

struct MemObject {
    context: usize,
    data: Vec<u8>,
    flags: cl_mem_flags,
    host_ptr: usize,
}

struct Mapping {
    mem: usize,
    offset: usize,
    data: Box<[u8]>,
}

struct Busy<'a>(&'a AtomicUsize);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, SeqCst);
    }
}

impl State {
    fn insert(&mut self, kind: &'static str) -> usize {
        self.next += 0x10;
        let addr = 0x1000 + self.next;
        self.objects.insert(addr, Object { kind, refs: 1 });
        addr
    }

    fn is(&self, addr: RawHandle, kind: &str) -> bool {
        self.objects.get(&(addr as usize)).is_some_and(|o| o.kind == kind)
    }

    unsafe fn wait_list(&self, num: cl_uint, list: *const RawHandle) -> bool {
        match (num, list.is_null()) {
            (0, true) => true,
            (0, false) | (_, true) => false,
            (n, false) => from_raw_parts(list, n as _).iter().all(|&e| self.is(e, "event")),
        }
    }

    unsafe fn event(&mut self, event: *mut RawHandle) {
        if !event.is_null() {
            *event = self.insert("event") as RawHandle;
        }
    }

    fn retain(&mut self, addr: RawHandle, kind: &str, invalid: cl_int) -> cl_int {
        match self.objects.get_mut(&(addr as usize)) {
            Some(o) if o.kind == kind => {
                o.refs += 1;
                CL_SUCCESS
            }
            _ => invalid,
        }
    }

    fn release(&mut self, addr: RawHandle, kind: &str, invalid: cl_int) -> cl_int {
        let addr = addr as usize;
        match self.objects.get_mut(&addr) {
            Some(o) if o.kind == kind => {
                o.refs -= 1;
                if o.refs == 0 {
                    self.objects.remove(&addr);
                    self.mems.remove(&addr);
                    self.sources.remove(&addr);
                }
                CL_SUCCESS
            }
            _ => invalid,
        }
    }
}

#[inline]
unsafe fn set<T>(ptr: *mut T, value: T) {
    if !ptr.is_null() {
        *ptr = value
    }
}

impl MockApi {
    pub fn new() -> Self {
        let mut state = State::default();
        for _ in 0..2 {
            let platform = state.insert("platform");
            let device = state.insert("device");
            state.devices.push((platform, device));
        }
        Self {
            state: Mutex::new(state),
            active: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
        }
    }

    /// 按顺序记录的原生入口调用。
    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    /// 检测到的并发原生调用次数。
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(SeqCst)
    }

    pub fn refs<K: Kind>(&self, handle: Handle<K>) -> Option<usize> {
        let state = self.state.lock().unwrap();
        state.objects.get(&handle.addr()).map(|o| o.refs)
    }

    pub fn mem_data<K: Kind>(&self, mem: Handle<K>) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.mems.get(&mem.addr()).map(|m| m.data.clone())
    }

    pub fn kernel_arg<K: Kind>(&self, kernel: Handle<K>, index: cl_uint) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.kernel_args.get(&(kernel.addr(), index)).cloned()
    }

    fn enter(&self, name: &'static str) -> Busy {
        if self.active.fetch_add(1, SeqCst) > 0 {
            self.overlaps.fetch_add(1, Relaxed);
        }
        self.state.lock().unwrap().calls.push(name);
        thread::yield_now();
        Busy(&self.active)
    }
}

macro_rules! refcount {
    ($( $retain:ident $release:ident $kind:literal $invalid:ident; )+) => {
        $(
            unsafe fn $retain(&self, raw: RawHandle) -> cl_int {
                let _busy = self.enter(stringify!($retain));
                self.state.lock().unwrap().retain(raw, $kind, $invalid)
            }

            unsafe fn $release(&self, raw: RawHandle) -> cl_int {
                let _busy = self.enter(stringify!($release));
                self.state.lock().unwrap().release(raw, $kind, $invalid)
            }
        )+
    };
}

impl NativeApi for MockApi {
    unsafe fn get_platform_ids(
        &self,
        num_entries: cl_uint,
        platforms: *mut RawHandle,
        num_platforms: *mut cl_uint,
    ) -> cl_int {
        let _busy = self.enter("clGetPlatformIDs");
        let state = self.state.lock().unwrap();
        if platforms.is_null() == (num_entries > 0) {
            return CL_INVALID_VALUE;
        }
        for (i, &(platform, _)) in state.devices.iter().take(num_entries as _).enumerate() {
            *platforms.add(i) = platform as RawHandle;
        }
        set(num_platforms, state.devices.len() as _);
        CL_SUCCESS
    }

    unsafe fn get_device_ids(
        &self,
        platform: RawHandle,
        device_type: cl_device_type,
        num_entries: cl_uint,
        devices: *mut RawHandle,
        num_devices: *mut cl_uint,
    ) -> cl_int {
        let _busy = self.enter("clGetDeviceIDs");
        let state = self.state.lock().unwrap();
        if !state.is(platform, "platform") {
            return CL_INVALID_PLATFORM;
        }
        if devices.is_null() == (num_entries > 0) {
            return CL_INVALID_VALUE;
        }
        if device_type & (CL_DEVICE_TYPE_GPU | CL_DEVICE_TYPE_DEFAULT) == 0 {
            return CL_DEVICE_NOT_FOUND;
        }
        let found = state
            .devices
            .iter()
            .filter(|&&(p, _)| p == platform as usize)
            .map(|&(_, d)| d)
            .collect::<Vec<_>>();
        for (i, &device) in found.iter().take(num_entries as _).enumerate() {
            *devices.add(i) = device as RawHandle;
        }
        set(num_devices, found.len() as _);
        CL_SUCCESS
    }

    unsafe fn create_context(
        &self,
        properties: *const cl_context_properties,
        num_devices: cl_uint,
        devices: *const RawHandle,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        let _busy = self.enter("clCreateContext");
        let mut state = self.state.lock().unwrap();
        if !properties.is_null() {
            let mut p = properties;
            while *p != 0 {
                if *p == CL_CONTEXT_PLATFORM && !state.is(*p.add(1) as RawHandle, "platform") {
                    set(errcode_ret, CL_INVALID_PLATFORM);
                    return null_mut();
                }
                p = p.add(2);
            }
        }
        if num_devices == 0 || devices.is_null() {
            set(errcode_ret, CL_INVALID_VALUE);
            return null_mut();
        }
        if !from_raw_parts(devices, num_devices as _).iter().all(|&d| state.is(d, "device")) {
            set(errcode_ret, CL_INVALID_DEVICE);
            return null_mut();
        }
        set(errcode_ret, CL_SUCCESS);
        state.insert("context") as RawHandle
    }

    unsafe fn create_command_queue(
        &self,
        context: RawHandle,
        device: RawHandle,
        _properties: cl_command_queue_properties,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        let _busy = self.enter("clCreateCommandQueue");
        let mut state = self.state.lock().unwrap();
        let code = if !state.is(context, "context") {
            CL_INVALID_CONTEXT
        } else if !state.is(device, "device") {
            CL_INVALID_DEVICE
        } else {
            set(errcode_ret, CL_SUCCESS);
            return state.insert("queue") as RawHandle;
        };
        set(errcode_ret, code);
        null_mut()
    }

    unsafe fn create_buffer(
        &self,
        context: RawHandle,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        let _busy = self.enter("clCreateBuffer");
        let mut state = self.state.lock().unwrap();
        let wants_host = flags & (CL_MEM_USE_HOST_PTR | CL_MEM_COPY_HOST_PTR) != 0;
        let code = if !state.is(context, "context") {
            CL_INVALID_CONTEXT
        } else if size == 0 {
            CL_INVALID_BUFFER_SIZE
        } else if wants_host == host_ptr.is_null() {
            CL_INVALID_HOST_PTR
        } else {
            CL_SUCCESS
        };
        set(errcode_ret, code);
        if code != CL_SUCCESS {
            return null_mut();
        }
        let data = if wants_host {
            from_raw_parts(host_ptr.cast::<u8>(), size).to_vec()
        } else {
            vec![0; size]
        };
        let mem = state.insert("mem");
        state.mems.insert(
            mem,
            MemObject {
                context: context as usize,
                data,
                flags,
                host_ptr: host_ptr as usize,
            },
        );
        mem as RawHandle
    }

    unsafe fn create_program_with_source(
        &self,
        context: RawHandle,
        count: cl_uint,
        strings: *const *const c_char,
        lengths: *const usize,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        let _busy = self.enter("clCreateProgramWithSource");
        let mut state = self.state.lock().unwrap();
        if !state.is(context, "context") {
            set(errcode_ret, CL_INVALID_CONTEXT);
            return null_mut();
        }
        if count == 0 || strings.is_null() {
            set(errcode_ret, CL_INVALID_VALUE);
            return null_mut();
        }
        let mut source = String::new();
        for i in 0..count as usize {
            let s = *strings.add(i);
            let bytes = if lengths.is_null() || *lengths.add(i) == 0 {
                CStr::from_ptr(s).to_bytes()
            } else {
                from_raw_parts(s.cast::<u8>(), *lengths.add(i))
            };
            source.push_str(&String::from_utf8_lossy(bytes));
        }
        let program = state.insert("program");
        state.sources.insert(program, source);
        set(errcode_ret, CL_SUCCESS);
        program as RawHandle
    }

    unsafe fn build_program(
        &self,
        program: RawHandle,
        num_devices: cl_uint,
        device_list: *const RawHandle,
        _options: *const c_char,
    ) -> cl_int {
        let _busy = self.enter("clBuildProgram");
        let state = self.state.lock().unwrap();
        if !state.is(program, "program") {
            return CL_INVALID_PROGRAM;
        }
        if (num_devices == 0) != device_list.is_null() {
            return CL_INVALID_VALUE;
        }
        if state.sources[&(program as usize)].contains("#error") {
            return CL_BUILD_PROGRAM_FAILURE;
        }
        CL_SUCCESS
    }

    unsafe fn create_kernel(
        &self,
        program: RawHandle,
        kernel_name: *const c_char,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        let _busy = self.enter("clCreateKernel");
        let mut state = self.state.lock().unwrap();
        if !state.is(program, "program") {
            set(errcode_ret, CL_INVALID_PROGRAM);
            return null_mut();
        }
        let name = CStr::from_ptr(kernel_name).to_string_lossy();
        let pattern = format!("kernel void {name}(");
        if name.is_empty() || !state.sources[&(program as usize)].contains(&pattern) {
            set(errcode_ret, CL_INVALID_KERNEL_NAME);
            return null_mut();
        }
        set(errcode_ret, CL_SUCCESS);
        state.insert("kernel") as RawHandle
    }

    unsafe fn set_kernel_arg(
        &self,
        kernel: RawHandle,
        arg_index: cl_uint,
        arg_size: usize,
        arg_value: *const c_void,
    ) -> cl_int {
        let _busy = self.enter("clSetKernelArg");
        let mut state = self.state.lock().unwrap();
        if !state.is(kernel, "kernel") {
            return CL_INVALID_KERNEL;
        }
        if arg_size == 0 {
            return CL_INVALID_ARG_SIZE;
        }
        let value = if arg_value.is_null() {
            vec![]
        } else {
            from_raw_parts(arg_value.cast::<u8>(), arg_size).to_vec()
        };
        state.kernel_args.insert((kernel as usize, arg_index), value);
        CL_SUCCESS
    }

    unsafe fn enqueue_nd_range_kernel(
        &self,
        queue: RawHandle,
        kernel: RawHandle,
        work_dim: cl_uint,
        _global_work_offset: *const usize,
        global_work_size: *const usize,
        _local_work_size: *const usize,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
    ) -> cl_int {
        let _busy = self.enter("clEnqueueNDRangeKernel");
        let mut state = self.state.lock().unwrap();
        if !state.is(queue, "queue") {
            return CL_INVALID_COMMAND_QUEUE;
        }
        if !state.is(kernel, "kernel") {
            return CL_INVALID_KERNEL;
        }
        if !(1..=3).contains(&work_dim) {
            return CL_INVALID_WORK_DIMENSION;
        }
        if global_work_size.is_null() {
            return CL_INVALID_GLOBAL_WORK_SIZE;
        }
        if !state.wait_list(num_events_in_wait_list, event_wait_list) {
            return CL_INVALID_EVENT_WAIT_LIST;
        }
        state.event(event);
        CL_SUCCESS
    }

    unsafe fn create_sampler(
        &self,
        context: RawHandle,
        _normalized_coords: cl_bool,
        addressing_mode: cl_addressing_mode,
        filter_mode: cl_filter_mode,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        let _busy = self.enter("clCreateSampler");
        let mut state = self.state.lock().unwrap();
        let code = if !state.is(context, "context") {
            CL_INVALID_CONTEXT
        } else if !(CL_ADDRESS_NONE..=CL_ADDRESS_REPEAT).contains(&addressing_mode)
            || !(CL_FILTER_NEAREST..=CL_FILTER_LINEAR).contains(&filter_mode)
        {
            CL_INVALID_VALUE
        } else {
            set(errcode_ret, CL_SUCCESS);
            return state.insert("sampler") as RawHandle;
        };
        set(errcode_ret, code);
        null_mut()
    }

    unsafe fn enqueue_read_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        _blocking_read: cl_bool,
        offset: usize,
        size: usize,
        ptr: *mut c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
    ) -> cl_int {
        let _busy = self.enter("clEnqueueReadBuffer");
        let mut state = self.state.lock().unwrap();
        if !state.is(queue, "queue") {
            return CL_INVALID_COMMAND_QUEUE;
        }
        let Some(mem) = state.mems.get(&(buffer as usize)) else {
            return CL_INVALID_MEM_OBJECT;
        };
        if ptr.is_null() || offset + size > mem.data.len() {
            return CL_INVALID_VALUE;
        }
        if !state.wait_list(num_events_in_wait_list, event_wait_list) {
            return CL_INVALID_EVENT_WAIT_LIST;
        }
        copy_nonoverlapping(mem.data[offset..].as_ptr(), ptr.cast::<u8>(), size);
        state.event(event);
        CL_SUCCESS
    }

    unsafe fn enqueue_write_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        _blocking_write: cl_bool,
        offset: usize,
        size: usize,
        ptr: *const c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
    ) -> cl_int {
        let _busy = self.enter("clEnqueueWriteBuffer");
        let mut state = self.state.lock().unwrap();
        if !state.is(queue, "queue") {
            return CL_INVALID_COMMAND_QUEUE;
        }
        if !state.wait_list(num_events_in_wait_list, event_wait_list) {
            return CL_INVALID_EVENT_WAIT_LIST;
        }
        let Some(mem) = state.mems.get_mut(&(buffer as usize)) else {
            return CL_INVALID_MEM_OBJECT;
        };
        if ptr.is_null() || offset + size > mem.data.len() {
            return CL_INVALID_VALUE;
        }
        copy_nonoverlapping(ptr.cast::<u8>(), mem.data[offset..].as_mut_ptr(), size);
        state.event(event);
        CL_SUCCESS
    }

    unsafe fn enqueue_map_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        _blocking_map: cl_bool,
        _map_flags: cl_map_flags,
        offset: usize,
        size: usize,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
        errcode_ret: *mut cl_int,
    ) -> *mut c_void {
        let _busy = self.enter("clEnqueueMapBuffer");
        let mut state = self.state.lock().unwrap();
        let code = if !state.is(queue, "queue") {
            CL_INVALID_COMMAND_QUEUE
        } else if !state.wait_list(num_events_in_wait_list, event_wait_list) {
            CL_INVALID_EVENT_WAIT_LIST
        } else {
            match state.mems.get(&(buffer as usize)) {
                None => CL_INVALID_MEM_OBJECT,
                Some(mem) if size == 0 || offset + size > mem.data.len() => CL_INVALID_VALUE,
                Some(_) => CL_SUCCESS,
            }
        };
        set(errcode_ret, code);
        if code != CL_SUCCESS {
            return null_mut();
        }
        let data: Box<[u8]> = state.mems[&(buffer as usize)].data[offset..][..size].into();
        let ptr = data.as_ptr() as *mut c_void;
        state.mapped.insert(
            ptr as usize,
            Mapping {
                mem: buffer as usize,
                offset,
                data,
            },
        );
        state.event(event);
        ptr
    }

    unsafe fn enqueue_unmap_mem_object(
        &self,
        queue: RawHandle,
        memobj: RawHandle,
        mapped_ptr: *mut c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
    ) -> cl_int {
        let _busy = self.enter("clEnqueueUnmapMemObject");
        let mut state = self.state.lock().unwrap();
        if !state.is(queue, "queue") {
            return CL_INVALID_COMMAND_QUEUE;
        }
        if !state.mems.contains_key(&(memobj as usize)) {
            return CL_INVALID_MEM_OBJECT;
        }
        if !state.wait_list(num_events_in_wait_list, event_wait_list) {
            return CL_INVALID_EVENT_WAIT_LIST;
        }
        match state.mapped.remove(&(mapped_ptr as usize)) {
            Some(Mapping { mem, offset, data }) if mem == memobj as usize => {
                let target = state.mems.get_mut(&mem).unwrap();
                target.data[offset..][..data.len()].copy_from_slice(&data);
                state.event(event);
                CL_SUCCESS
            }
            Some(mapping) => {
                state.mapped.insert(mapped_ptr as usize, mapping);
                CL_INVALID_VALUE
            }
            None => CL_INVALID_VALUE,
        }
    }

    unsafe fn get_mem_object_info(
        &self,
        memobj: RawHandle,
        param_name: cl_mem_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int {
        let _busy = self.enter("clGetMemObjectInfo");
        let state = self.state.lock().unwrap();
        let Some(mem) = state.mems.get(&(memobj as usize)) else {
            return CL_INVALID_MEM_OBJECT;
        };
        let refs = state.objects[&(memobj as usize)].refs as cl_uint;
        let value: Vec<u8> = match param_name {
            CL_MEM_FLAGS => mem.flags.to_ne_bytes().into(),
            CL_MEM_SIZE => mem.data.len().to_ne_bytes().into(),
            CL_MEM_HOST_PTR => mem.host_ptr.to_ne_bytes().into(),
            CL_MEM_CONTEXT => mem.context.to_ne_bytes().into(),
            CL_MEM_REFERENCE_COUNT => refs.to_ne_bytes().into(),
            _ => return CL_INVALID_VALUE,
        };
        if !param_value.is_null() {
            if param_value_size < value.len() {
                return CL_INVALID_VALUE;
            }
            copy_nonoverlapping(value.as_ptr(), param_value.cast::<u8>(), value.len());
        }
        set(param_value_size_ret, value.len());
        CL_SUCCESS
    }

    unsafe fn flush(&self, queue: RawHandle) -> cl_int {
        let _busy = self.enter("clFlush");
        if self.state.lock().unwrap().is(queue, "queue") {
            CL_SUCCESS
        } else {
            CL_INVALID_COMMAND_QUEUE
        }
    }

    unsafe fn finish(&self, queue: RawHandle) -> cl_int {
        let _busy = self.enter("clFinish");
        if self.state.lock().unwrap().is(queue, "queue") {
            CL_SUCCESS
        } else {
            CL_INVALID_COMMAND_QUEUE
        }
    }

    unsafe fn wait_for_events(&self, num_events: cl_uint, event_list: *const RawHandle) -> cl_int {
        let _busy = self.enter("clWaitForEvents");
        let state = self.state.lock().unwrap();
        if num_events == 0 || event_list.is_null() {
            CL_INVALID_VALUE
        } else if state.wait_list(num_events, event_list) {
            CL_SUCCESS
        } else {
            CL_INVALID_EVENT
        }
    }

    refcount! {
        retain_device        release_device        "device"  CL_INVALID_DEVICE;
        retain_context       release_context       "context" CL_INVALID_CONTEXT;
        retain_command_queue release_command_queue "queue"   CL_INVALID_COMMAND_QUEUE;
        retain_mem_object    release_mem_object    "mem"     CL_INVALID_MEM_OBJECT;
        retain_program       release_program       "program" CL_INVALID_PROGRAM;
        retain_kernel        release_kernel        "kernel"  CL_INVALID_KERNEL;
        retain_event         release_event         "event"   CL_INVALID_EVENT;
        retain_sampler       release_sampler       "sampler" CL_INVALID_SAMPLER;
    }
}
