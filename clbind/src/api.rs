use crate::bindings::*;
use std::ffi::{c_char, c_void};

/// 原生 API 的入口点。
///
/// 每个方法对应一个原生函数，参数与返回值保持 C 接口的形态，
/// 校验、加锁和错误转换都由 [`Binding`](crate::Binding) 完成。
/// 回调形参一律省略，调用时传空。
///
/// # Safety
///
/// 所有方法都直接转发给原生代码，调用者负责保证指针参数的有效性。
#[allow(clippy::too_many_arguments, clippy::missing_safety_doc)]
pub trait NativeApi: Send + Sync {
    unsafe fn get_platform_ids(
        &self,
        num_entries: cl_uint,
        platforms: *mut RawHandle,
        num_platforms: *mut cl_uint,
    ) -> cl_int;

    unsafe fn get_device_ids(
        &self,
        platform: RawHandle,
        device_type: cl_device_type,
        num_entries: cl_uint,
        devices: *mut RawHandle,
        num_devices: *mut cl_uint,
    ) -> cl_int;

    unsafe fn create_context(
        &self,
        properties: *const cl_context_properties,
        num_devices: cl_uint,
        devices: *const RawHandle,
        errcode_ret: *mut cl_int,
    ) -> RawHandle;

    unsafe fn create_command_queue(
        &self,
        context: RawHandle,
        device: RawHandle,
        properties: cl_command_queue_properties,
        errcode_ret: *mut cl_int,
    ) -> RawHandle;

    unsafe fn create_buffer(
        &self,
        context: RawHandle,
        flags: cl_mem_flags,
        size: usize,
        host_ptr: *mut c_void,
        errcode_ret: *mut cl_int,
    ) -> RawHandle;

    unsafe fn create_program_with_source(
        &self,
        context: RawHandle,
        count: cl_uint,
        strings: *const *const c_char,
        lengths: *const usize,
        errcode_ret: *mut cl_int,
    ) -> RawHandle;

    unsafe fn build_program(
        &self,
        program: RawHandle,
        num_devices: cl_uint,
        device_list: *const RawHandle,
        options: *const c_char,
    ) -> cl_int;

    unsafe fn create_kernel(
        &self,
        program: RawHandle,
        kernel_name: *const c_char,
        errcode_ret: *mut cl_int,
    ) -> RawHandle;

    unsafe fn set_kernel_arg(
        &self,
        kernel: RawHandle,
        arg_index: cl_uint,
        arg_size: usize,
        arg_value: *const c_void,
    ) -> cl_int;

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
    ) -> cl_int;

    unsafe fn create_sampler(
        &self,
        context: RawHandle,
        normalized_coords: cl_bool,
        addressing_mode: cl_addressing_mode,
        filter_mode: cl_filter_mode,
        errcode_ret: *mut cl_int,
    ) -> RawHandle;

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
    ) -> cl_int;

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
    ) -> cl_int;

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
    ) -> *mut c_void;

    unsafe fn enqueue_unmap_mem_object(
        &self,
        queue: RawHandle,
        memobj: RawHandle,
        mapped_ptr: *mut c_void,
        num_events_in_wait_list: cl_uint,
        event_wait_list: *const RawHandle,
        event: *mut RawHandle,
    ) -> cl_int;

    unsafe fn get_mem_object_info(
        &self,
        memobj: RawHandle,
        param_name: cl_mem_info,
        param_value_size: usize,
        param_value: *mut c_void,
        param_value_size_ret: *mut usize,
    ) -> cl_int;

    unsafe fn flush(&self, queue: RawHandle) -> cl_int;
    unsafe fn finish(&self, queue: RawHandle) -> cl_int;
    unsafe fn wait_for_events(&self, num_events: cl_uint, event_list: *const RawHandle) -> cl_int;

    unsafe fn retain_device(&self, device: RawHandle) -> cl_int;
    unsafe fn release_device(&self, device: RawHandle) -> cl_int;
    unsafe fn retain_context(&self, context: RawHandle) -> cl_int;
    unsafe fn release_context(&self, context: RawHandle) -> cl_int;
    unsafe fn retain_command_queue(&self, queue: RawHandle) -> cl_int;
    unsafe fn release_command_queue(&self, queue: RawHandle) -> cl_int;
    unsafe fn retain_mem_object(&self, memobj: RawHandle) -> cl_int;
    unsafe fn release_mem_object(&self, memobj: RawHandle) -> cl_int;
    unsafe fn retain_program(&self, program: RawHandle) -> cl_int;
    unsafe fn release_program(&self, program: RawHandle) -> cl_int;
    unsafe fn retain_kernel(&self, kernel: RawHandle) -> cl_int;
    unsafe fn release_kernel(&self, kernel: RawHandle) -> cl_int;
    unsafe fn retain_event(&self, event: RawHandle) -> cl_int;
    unsafe fn release_event(&self, event: RawHandle) -> cl_int;
    unsafe fn retain_sampler(&self, sampler: RawHandle) -> cl_int;
    unsafe fn release_sampler(&self, sampler: RawHandle) -> cl_int;
}
