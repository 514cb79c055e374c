use crate::{bindings::*, resource_unavailable, BindError, NativeApi};
use libloading::Library;
use log::{info, warn};
use std::{
    ffi::{c_char, c_void, OsStr},
    ptr::null,
    sync::{Arc, OnceLock},
};

macro_rules! entries {
    ($( $field:ident: fn($($arg:ty),*) -> $ret:ty; )+) => {
        #[allow(non_snake_case)]
        struct Entries {
            $( $field: unsafe extern "system" fn($($arg),*) -> $ret, )+
        }

        impl Entries {
            unsafe fn load(lib: &Library) -> Result<Self, libloading::Error> {
                Ok(Self {
                    $( $field: *lib.get(concat!(stringify!($field), "\0").as_bytes())?, )+
                })
            }
        }
    };
}

type Notify = *const c_void;

entries! {
    clGetPlatformIDs: fn(cl_uint, *mut RawHandle, *mut cl_uint) -> cl_int;
    clGetDeviceIDs: fn(RawHandle, cl_device_type, cl_uint, *mut RawHandle, *mut cl_uint) -> cl_int;
    clCreateContext: fn(*const cl_context_properties, cl_uint, *const RawHandle, Notify, *mut c_void, *mut cl_int) -> RawHandle;
    clCreateCommandQueue: fn(RawHandle, RawHandle, cl_command_queue_properties, *mut cl_int) -> RawHandle;
    clCreateBuffer: fn(RawHandle, cl_mem_flags, usize, *mut c_void, *mut cl_int) -> RawHandle;
    clCreateProgramWithSource: fn(RawHandle, cl_uint, *const *const c_char, *const usize, *mut cl_int) -> RawHandle;
    clBuildProgram: fn(RawHandle, cl_uint, *const RawHandle, *const c_char, Notify, *mut c_void) -> cl_int;
    clCreateKernel: fn(RawHandle, *const c_char, *mut cl_int) -> RawHandle;
    clSetKernelArg: fn(RawHandle, cl_uint, usize, *const c_void) -> cl_int;
    clEnqueueNDRangeKernel: fn(RawHandle, RawHandle, cl_uint, *const usize, *const usize, *const usize, cl_uint, *const RawHandle, *mut RawHandle) -> cl_int;
    clCreateSampler: fn(RawHandle, cl_bool, cl_addressing_mode, cl_filter_mode, *mut cl_int) -> RawHandle;
    clEnqueueReadBuffer: fn(RawHandle, RawHandle, cl_bool, usize, usize, *mut c_void, cl_uint, *const RawHandle, *mut RawHandle) -> cl_int;
    clEnqueueWriteBuffer: fn(RawHandle, RawHandle, cl_bool, usize, usize, *const c_void, cl_uint, *const RawHandle, *mut RawHandle) -> cl_int;
    clEnqueueMapBuffer: fn(RawHandle, RawHandle, cl_bool, cl_map_flags, usize, usize, cl_uint, *const RawHandle, *mut RawHandle, *mut cl_int) -> *mut c_void;
    clEnqueueUnmapMemObject: fn(RawHandle, RawHandle, *mut c_void, cl_uint, *const RawHandle, *mut RawHandle) -> cl_int;
    clGetMemObjectInfo: fn(RawHandle, cl_mem_info, usize, *mut c_void, *mut usize) -> cl_int;
    clFlush: fn(RawHandle) -> cl_int;
    clFinish: fn(RawHandle) -> cl_int;
    clWaitForEvents: fn(cl_uint, *const RawHandle) -> cl_int;
    clRetainDevice: fn(RawHandle) -> cl_int;
    clReleaseDevice: fn(RawHandle) -> cl_int;
    clRetainContext: fn(RawHandle) -> cl_int;
    clReleaseContext: fn(RawHandle) -> cl_int;
    clRetainCommandQueue: fn(RawHandle) -> cl_int;
    clReleaseCommandQueue: fn(RawHandle) -> cl_int;
    clRetainMemObject: fn(RawHandle) -> cl_int;
    clReleaseMemObject: fn(RawHandle) -> cl_int;
    clRetainProgram: fn(RawHandle) -> cl_int;
    clReleaseProgram: fn(RawHandle) -> cl_int;
    clRetainKernel: fn(RawHandle) -> cl_int;
    clReleaseKernel: fn(RawHandle) -> cl_int;
    clRetainEvent: fn(RawHandle) -> cl_int;
    clReleaseEvent: fn(RawHandle) -> cl_int;
    clRetainSampler: fn(RawHandle) -> cl_int;
    clReleaseSampler: fn(RawHandle) -> cl_int;
}

/// 动态加载的原生 OpenCL 库。
pub struct Dylib {
    entries: Entries,
    _lib: Library,
}

impl Dylib {
    /// 按平台的库命名规则加载 `OpenCL`。
    #[inline]
    pub fn open() -> Result<Self, BindError> {
        Self::open_path(libloading::library_filename("OpenCL"))
    }

    pub fn open_path(path: impl AsRef<OsStr>) -> Result<Self, BindError> {
        let path = path.as_ref();
        let lib = unsafe { Library::new(path) }
            .map_err(|e| resource_unavailable(format!("failed to load {path:?}: {e}")))?;
        let entries = unsafe { Entries::load(&lib) }
            .map_err(|e| resource_unavailable(format!("{path:?} is incomplete: {e}")))?;
        info!("loaded native library {path:?}");
        Ok(Self { entries, _lib: lib })
    }

    /// 进程共享的实例，只在第一次调用时加载。
    pub fn shared() -> Option<Arc<Self>> {
        static SHARED: OnceLock<Option<Arc<Dylib>>> = OnceLock::new();
        SHARED
            .get_or_init(|| match Self::open() {
                Ok(lib) => Some(Arc::new(lib)),
                Err(e) => {
                    warn!("{e}");
                    None
                }
            })
            .clone()
    }
}

impl NativeApi for Dylib {
    unsafe fn get_platform_ids(
        &self,
        num_entries: cl_uint,
        platforms: *mut RawHandle,
        num_platforms: *mut cl_uint,
    ) -> cl_int {
        (self.entries.clGetPlatformIDs)(num_entries, platforms, num_platforms)
    }

    unsafe fn get_device_ids(
        &self,
        platform: RawHandle,
        device_type: cl_device_type,
        num_entries: cl_uint,
        devices: *mut RawHandle,
        num_devices: *mut cl_uint,
    ) -> cl_int {
        (self.entries.clGetDeviceIDs)(platform, device_type, num_entries, devices, num_devices)
    }

    unsafe fn create_context(
        &self,
        properties: *const cl_context_properties,
        num_devices: cl_uint,
        devices: *const RawHandle,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        (self.entries.clCreateContext)(
            properties,
            num_devices,
            devices,
            null(),
            null_handle(),
            errcode_ret,
        )
    }

    unsafe fn create_command_queue(
        &self,
        context: RawHandle,
        device: RawHandle,
        properties: cl_command_queue_properties,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        (self.entries.clCreateCommandQueue)(context, device, properties, errcode_ret)
    }

    unsafe fn create_buffer(
        &self,
        context: RawHandle,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        (self.entries.clCreateBuffer)(context, flags, size, host_ptr, errcode_ret)
    }

    unsafe fn create_program_with_source(
        &self,
        context: RawHandle,
        count: cl_uint,
        strings: *const *const c_char,
        lengths: *const usize,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        (self.entries.clCreateProgramWithSource)(context, count, strings, lengths, errcode_ret)
    }

    unsafe fn build_program(
        &self,
        program: RawHandle,
        num_devices: cl_uint,
        device_list: *const RawHandle,
        options: *const c_char,
    ) -> cl_int {
        (self.entries.clBuildProgram)(
            program,
            num_devices,
            device_list,
            options,
            null(),
            null_handle(),
        )
    }

    unsafe fn create_kernel(
        &self,
        program: RawHandle,
        kernel_name: *const c_char,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        (self.entries.clCreateKernel)(program, kernel_name, errcode_ret)
    }

    unsafe fn set_kernel_arg(
        &self,
        kernel: RawHandle,
        arg_index: cl_uint,
        arg_size: usize,
        arg_value: *const c_void,
    ) -> cl_int {
        (self.entries.clSetKernelArg)(kernel, arg_index, arg_size, arg_value)
    }

    unsafe fn enqueue_nd_range_kernel(
        &self,
        queue: RawHandle,
        kernel: RawHandle,
        work_dim: cl_uint,
        global_work_offset: *const usize,
        global_work_size: *const usize,
        local_work_size: *const usize,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
    ) -> cl_int {
        (self.entries.clEnqueueNDRangeKernel)(
            queue,
            kernel,
            work_dim,
            global_work_offset,
            global_work_size,
            local_work_size,
            num_events_in_wait_list,
            event_wait_list,
            event,
        )
    }

    unsafe fn create_sampler(
        &self,
        context: RawHandle,
        normalized_coords: cl_bool,
        addressing_mode: cl_addressing_mode,
        filter_mode: cl_filter_mode,
        errcode_ret: *mut cl_int,
    ) -> RawHandle {
        (self.entries.clCreateSampler)(
            context,
            normalized_coords,
            addressing_mode,
            filter_mode,
            errcode_ret,
        )
    }

    unsafe fn enqueue_read_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        blocking_read: cl_bool,
        offset: usize,
        size: usize,
        ptr: *mut c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
    ) -> cl_int {
        (self.entries.clEnqueueReadBuffer)(
            queue,
            buffer,
            blocking_read,
            offset,
            size,
            ptr,
            num_events_in_wait_list,
            event_wait_list,
            event,
        )
    }

    unsafe fn enqueue_write_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        blocking_write: cl_bool,
        offset: usize,
        size: usize,
        ptr: *const c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
    ) -> cl_int {
        (self.entries.clEnqueueWriteBuffer)(
            queue,
            buffer,
            blocking_write,
            offset,
            size,
            ptr,
            num_events_in_wait_list,
            event_wait_list,
            event,
        )
    }

    unsafe fn enqueue_map_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        blocking_map: cl_bool,
        map_flags: cl_map_flags,
        offset: usize,
        size: usize,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
        errcode_ret: *mut cl_int,
    ) -> *mut c_void {
        (self.entries.clEnqueueMapBuffer)(
            queue,
            buffer,
            blocking_map,
            map_flags,
            offset,
            size,
            num_events_in_wait_list,
            event_wait_list,
            event,
            errcode_ret,
        )
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
        (self.entries.clEnqueueUnmapMemObject)(
            queue,
            memobj,
            mapped_ptr,
            num_events_in_wait_list,
            event_wait_list,
            event,
        )
    }

    unsafe fn get_mem_object_info(
        &self,
        memobj: RawHandle,
        param_name: cl_mem_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int {
        (self.entries.clGetMemObjectInfo)(
            memobj,
            param_name,
            param_value_size,
            param_value,
            param_value_size_ret,
        )
    }

    unsafe fn flush(&self, queue: RawHandle) -> cl_int {
        (self.entries.clFlush)(queue)
    }

    unsafe fn finish(&self, queue: RawHandle) -> cl_int {
        (self.entries.clFinish)(queue)
    }

    unsafe fn wait_for_events(&self, num_events: cl_uint, event_list: *const RawHandle) -> cl_int {
        (self.entries.clWaitForEvents)(num_events, event_list)
    }

    unsafe fn retain_device(&self, device: RawHandle) -> cl_int {
        (self.entries.clRetainDevice)(device)
    }

    unsafe fn release_device(&self, device: RawHandle) -> cl_int {
        (self.entries.clReleaseDevice)(device)
    }

    unsafe fn retain_context(&self, context: RawHandle) -> cl_int {
        (self.entries.clRetainContext)(context)
    }

    unsafe fn release_context(&self, context: RawHandle) -> cl_int {
        (self.entries.clReleaseContext)(context)
    }

    unsafe fn retain_command_queue(&self, queue: RawHandle) -> cl_int {
        (self.entries.clRetainCommandQueue)(queue)
    }

    unsafe fn release_command_queue(&self, queue: RawHandle) -> cl_int {
        (self.entries.clReleaseCommandQueue)(queue)
    }

    unsafe fn retain_mem_object(&self, memobj: RawHandle) -> cl_int {
        (self.entries.clRetainMemObject)(memobj)
    }

    unsafe fn release_mem_object(&self, memobj: RawHandle) -> cl_int {
        (self.entries.clReleaseMemObject)(memobj)
    }

    unsafe fn retain_program(&self, program: RawHandle) -> cl_int {
        (self.entries.clRetainProgram)(program)
    }

    unsafe fn release_program(&self, program: RawHandle) -> cl_int {
        (self.entries.clReleaseProgram)(program)
    }

    unsafe fn retain_kernel(&self, kernel: RawHandle) -> cl_int {
        (self.entries.clRetainKernel)(kernel)
    }

    unsafe fn release_kernel(&self, kernel: RawHandle) -> cl_int {
        (self.entries.clReleaseKernel)(kernel)
    }

    unsafe fn retain_event(&self, event: RawHandle) -> cl_int {
        (self.entries.clRetainEvent)(event)
    }

    unsafe fn release_event(&self, event: RawHandle) -> cl_int {
        (self.entries.clReleaseEvent)(event)
    }

    unsafe fn retain_sampler(&self, sampler: RawHandle) -> cl_int {
        (self.entries.clRetainSampler)(sampler)
    }

    unsafe fn release_sampler(&self, sampler: RawHandle) -> cl_int {
        (self.entries.clReleaseSampler)(sampler)
    }
}

#[test]
fn test_missing_library() {
    let e = Dylib::open_path("definitely-not-an-opencl-library.so").err().unwrap();
    assert_eq!(e.kind, crate::ErrorKind::ResourceUnavailable);
}
