use super::{
    element::{bytes_of_mut, Element},
    ElementKind,
};
use crate::{AlignedBuffer, Region};
use std::collections::VecDeque;

/// 主机缓冲区当前能以何种方式交给原生代码。
pub enum BufferAccess<'a> {
    /// 由主机数组支持，地址只在借用期间有效。
    Array(&'a mut [u8]),
    /// 可直接寻址且地址稳定的区域。
    Direct(Region),
    /// 既不可直接寻址，也没有连续的后备数组。
    Indirect,
}

/// 可以构造指针的主机缓冲区。
pub trait HostBuffer {
    fn element_kind(&self) -> ElementKind;
    fn access(&mut self) -> BufferAccess<'_>;
}

impl<T: Element> HostBuffer for [T] {
    #[inline]
    fn element_kind(&self) -> ElementKind {
        T::KIND
    }
    #[inline]
    fn access(&mut self) -> BufferAccess<'_> {
        BufferAccess::Array(bytes_of_mut(self))
    }
}

impl<T: Element> HostBuffer for Vec<T> {
    #[inline]
    fn element_kind(&self) -> ElementKind {
        T::KIND
    }
    #[inline]
    fn access(&mut self) -> BufferAccess<'_> {
        BufferAccess::Array(bytes_of_mut(self))
    }
}

impl<T: Element> HostBuffer for Box<[T]> {
    #[inline]
    fn element_kind(&self) -> ElementKind {
        T::KIND
    }
    #[inline]
    fn access(&mut self) -> BufferAccess<'_> {
        BufferAccess::Array(bytes_of_mut(self))
    }
}

impl<T: Element> HostBuffer for VecDeque<T> {
    #[inline]
    fn element_kind(&self) -> ElementKind {
        T::KIND
    }
    fn access(&mut self) -> BufferAccess<'_> {
        // 环形缓冲区绕回后没有连续的后备数组
        match self.as_mut_slices() {
            (head, []) => BufferAccess::Array(bytes_of_mut(head)),
            _ => BufferAccess::Indirect,
        }
    }
}

impl HostBuffer for AlignedBuffer {
    #[inline]
    fn element_kind(&self) -> ElementKind {
        ElementKind::Byte
    }
    #[inline]
    fn access(&mut self) -> BufferAccess<'_> {
        BufferAccess::Direct(self.region())
    }
}
