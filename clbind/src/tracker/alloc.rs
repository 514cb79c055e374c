use crate::{invalid_argument, BindError};
use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    ptr::NonNull,
    sync::Arc,
};

/// 对齐的原生内存分配器。
pub trait NativeAlloc: Send + Sync {
    /// 分配 `size` 字节、按 `alignment` 对齐且清零的内存，失败时返回 `None`。
    fn alloc_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` 必须由同一分配器以相同的 `size` 和 `alignment` 分配，且尚未释放。
    unsafe fn free_aligned(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> Result<(), BindError>;
}

/// 使用进程全局分配器。
#[derive(Clone, Copy, Default, Debug)]
pub struct SystemAlloc;

#[inline]
fn layout(size: usize, alignment: usize) -> Option<Layout> {
    // 零字节的分配也要得到一个独立的地址
    Layout::from_size_align(size.max(1), alignment).ok()
}

impl NativeAlloc for SystemAlloc {
    #[inline]
    fn alloc_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { alloc_zeroed(layout(size, alignment)?) })
    }

    #[inline]
    unsafe fn free_aligned(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> Result<(), BindError> {
        let layout = layout(size, alignment)
            .ok_or_else(|| invalid_argument(format!("invalid layout {size} bytes / {alignment}")))?;
        dealloc(ptr.as_ptr(), layout);
        Ok(())
    }
}

impl<T: NativeAlloc + ?Sized> NativeAlloc for Arc<T> {
    #[inline]
    fn alloc_aligned(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        (**self).alloc_aligned(size, alignment)
    }

    #[inline]
    unsafe fn free_aligned(&self, ptr: NonNull<u8>, size: usize, alignment: usize) -> Result<(), BindError> {
        (**self).free_aligned(ptr, size, alignment)
    }
}

#[test]
fn test_system_alloc() {
    for alignment in [1, 8, 64, 4096] {
        let ptr = SystemAlloc.alloc_aligned(100, alignment).unwrap();
        assert_eq!(ptr.as_ptr() as usize % alignment, 0);
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { SystemAlloc.free_aligned(ptr, 100, alignment) }.unwrap();
    }
    assert!(SystemAlloc.alloc_aligned(16, 3).is_none());
}
