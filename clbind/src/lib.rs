//! 原生计算 API 的绑定层。
//!
//! 原生资源以不透明的 [`Handle`] 表示，`void*` 形参以 [`Pointer`] 表示，
//! 所有原生调用都经过 [`Binding`] 串行执行。
//! 对齐的原生内存由 [`Tracker`] 分配，并保证恰好释放一次。

mod api;
mod binding;
mod common;
mod handle;
mod pointer;
mod tracker;

#[cfg(use_cl)]
mod dylib;

pub mod bindings;

pub use api::NativeApi;
pub use binding::{Binding, ContextProperties};
pub use common::*;
pub use handle::{
    kind, ClContext, ClDevice, ClEvent, ClKernel, ClMem, ClPlatform, ClProgram, ClQueue, ClSampler,
    Handle, Kind, RefCounted,
};
pub use pointer::{BufferAccess, Element, ElementKind, HostBuffer, Pointer, PointerList, Variant};
pub use tracker::{
    AlignedBuffer, NativeAlloc, RecordId, Region, State, Sweeper, SystemAlloc, Tracker,
};

#[cfg(use_cl)]
pub use dylib::Dylib;

pub extern crate half;
pub extern crate log;

/// 设置进程的最高日志级别。安装日志实现由宿主程序负责。
#[inline]
pub fn set_log_level(level: log::LevelFilter) {
    log::set_max_level(level)
}

#[cfg(test)]
mod test_utils;
