use super::{wait_list, Binding};
use crate::{
    bindings::*,
    invalid_argument,
    pointer::{Access, Pointer, Variant},
    BindError, ClEvent, ClMem, ClQueue, Code, NativeApi, Region,
};
use log::{debug, trace};

impl<A: NativeApi> Binding<A> {
    /// 把内存对象 `[offset, offset + size)` 读入 `dst`。
    ///
    /// 非阻塞读取要求 `dst` 地址稳定，否则以 [`InvalidArgument`](crate::ErrorKind::InvalidArgument) 拒绝。
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_read_buffer(
        &self,
        queue: ClQueue,
        mem: ClMem,
        blocking: bool,
        offset: usize,
        size: usize,
        dst: &Pointer,
        wait: &[ClEvent],
    ) -> Result<(ClEvent, Code), BindError> {
        const NAME: &str = "clEnqueueReadBuffer";
        transfer_target(NAME, blocking, dst, size, Access::Write)?;
        let (num_wait, wait) = wait_list(wait)?;

        let mut event = ClEvent::null();
        let (code, settled) = self.invoke(NAME, |api| {
            let code = unsafe {
                api.enqueue_read_buffer(
                    queue.as_raw(),
                    mem.as_raw(),
                    cl_bool(blocking),
                    offset,
                    size,
                    dst.resolve(),
                    num_wait,
                    wait,
                    (&mut event as *mut ClEvent).cast(),
                )
            };
            let settled = if code == CL_SUCCESS {
                self.enqueued(queue, mem, blocking, event, Some(dst))
            } else {
                vec![]
            };
            (code, settled)
        });
        settle(NAME, settled);
        let code = self.check(NAME, code)?;
        Ok((event, code))
    }

    /// 把 `src` 写入内存对象 `[offset, offset + size)`。
    ///
    /// 非阻塞写入要求 `src` 地址稳定，否则以 [`InvalidArgument`](crate::ErrorKind::InvalidArgument) 拒绝。
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_write_buffer(
        &self,
        queue: ClQueue,
        mem: ClMem,
        blocking: bool,
        offset: usize,
        size: usize,
        src: &Pointer,
        wait: &[ClEvent],
    ) -> Result<(ClEvent, Code), BindError> {
        const NAME: &str = "clEnqueueWriteBuffer";
        transfer_target(NAME, blocking, src, size, Access::Read)?;
        let (num_wait, wait) = wait_list(wait)?;

        let mut event = ClEvent::null();
        let (code, settled) = self.invoke(NAME, |api| {
            let code = unsafe {
                api.enqueue_write_buffer(
                    queue.as_raw(),
                    mem.as_raw(),
                    cl_bool(blocking),
                    offset,
                    size,
                    src.resolve(),
                    num_wait,
                    wait,
                    (&mut event as *mut ClEvent).cast(),
                )
            };
            let settled = if code == CL_SUCCESS {
                self.enqueued(queue, mem, blocking, event, Some(src))
            } else {
                vec![]
            };
            (code, settled)
        });
        settle(NAME, settled);
        let code = self.check(NAME, code)?;
        Ok((event, code))
    }

    /// 映射内存对象的一段，返回指向映射区域的原生地址。
    ///
    /// 调用失败时返回空指针。
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_map_buffer(
        &self,
        queue: ClQueue,
        mem: ClMem,
        blocking: bool,
        flags: cl_map_flags,
        offset: usize,
        size: usize,
        wait: &[ClEvent],
    ) -> Result<(Pointer<'static>, ClEvent, Code), BindError> {
        const NAME: &str = "clEnqueueMapBuffer";
        let (num_wait, wait) = wait_list(wait)?;

        let mut event = ClEvent::null();
        let mut err = CL_SUCCESS;
        let (mapped, settled) = self.invoke(NAME, |api| {
            let mapped = unsafe {
                api.enqueue_map_buffer(
                    queue.as_raw(),
                    mem.as_raw(),
                    cl_bool(blocking),
                    flags,
                    offset,
                    size,
                    num_wait,
                    wait,
                    (&mut event as *mut ClEvent).cast(),
                    &mut err,
                )
            };
            let settled = if err == CL_SUCCESS {
                self.enqueued(queue, mem, blocking, event, None)
            } else {
                vec![]
            };
            (mapped, settled)
        });
        settle(NAME, settled);
        let code = self.check(NAME, err)?;
        let mapped = Pointer::raw(mapped);
        trace!("{NAME} -> {mapped}");
        Ok((mapped, event, code))
    }

    /// 解除映射，`mapped` 必须是 [`enqueue_map_buffer`](Self::enqueue_map_buffer) 返回的地址。
    pub fn enqueue_unmap_mem_object(
        &self,
        queue: ClQueue,
        mem: ClMem,
        mapped: &Pointer,
        wait: &[ClEvent],
    ) -> Result<(ClEvent, Code), BindError> {
        const NAME: &str = "clEnqueueUnmapMemObject";
        if mapped.variant() != Variant::RawAddress {
            return Err(invalid_argument(format!(
                "{NAME}: {mapped} is not a mapped native address"
            )));
        }
        let (num_wait, wait) = wait_list(wait)?;

        let mut event = ClEvent::null();
        let code = self.invoke(NAME, |api| {
            let code = unsafe {
                api.enqueue_unmap_mem_object(
                    queue.as_raw(),
                    mem.as_raw(),
                    mapped.resolve(),
                    num_wait,
                    wait,
                    (&mut event as *mut ClEvent).cast(),
                )
            };
            if code == CL_SUCCESS {
                self.anchors.lock().unwrap().touch(queue, mem)
            }
            code
        });
        let code = self.check(NAME, code)?;
        Ok((event, code))
    }

    /// 登记成功入队的传输。
    ///
    /// 非阻塞传输的主机区域保持存活，直到队列完成或事件被等待。
    /// 顺序队列上的阻塞传输返回时，队列之前的命令都已完成。
    fn enqueued(
        &self,
        queue: ClQueue,
        mem: ClMem,
        blocking: bool,
        event: ClEvent,
        ptr: Option<&Pointer>,
    ) -> Vec<Region> {
        let mut anchors = self.anchors.lock().unwrap();
        if blocking {
            return anchors.blocked(queue);
        }
        anchors.touch(queue, mem);
        if let Some(region) = ptr.and_then(Pointer::region) {
            anchors
                .transfers
                .entry(queue)
                .or_default()
                .push((event, region.clone()));
        }
        vec![]
    }
}

/// 在原生锁之外交还区域。
fn settle(name: &str, settled: Vec<Region>) {
    if !settled.is_empty() {
        debug!("{name} settled {} regions", settled.len())
    }
}

/// 阻塞传输接受任何主机指针；非阻塞传输在调用返回后仍会访问主机内存，只接受地址稳定的区域。
fn transfer_target(
    name: &str,
    blocking: bool,
    ptr: &Pointer,
    size: usize,
    access: Access,
) -> Result<(), BindError> {
    if !blocking && !ptr.is_null() && !ptr.is_stable() {
        return Err(invalid_argument(format!(
            "{name}: non-blocking transfers require a direct buffer, got {ptr}"
        )));
    }
    ptr.check_span(size, access)
}
