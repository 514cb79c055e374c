use half::f16;
use std::{
    mem::size_of_val,
    slice::{from_raw_parts, from_raw_parts_mut},
};

/// 原生 API 接受的主机数组元素种类。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ElementKind {
    Byte,
    Short,
    Int,
    Long,
    Half,
    Float,
    Double,
}

impl ElementKind {
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Short | Self::Half => 2,
            Self::Int | Self::Float => 4,
            Self::Long | Self::Double => 8,
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// 可以放进主机数组交给原生代码的基本类型。
pub trait Element: Copy + sealed::Sealed + 'static {
    const KIND: ElementKind;
}

macro_rules! element {
    ($( $kind:ident: $($ty:ty)+; )+) => {
        $(
            $(
                impl sealed::Sealed for $ty {}
                impl Element for $ty {
                    const KIND: ElementKind = ElementKind::$kind;
                }
            )+
        )+
    };
}

element! {
    Byte  : i8  u8 ;
    Short : i16 u16;
    Int   : i32 u32;
    Long  : i64 u64;
    Half  : f16    ;
    Float : f32    ;
    Double: f64    ;
}

#[inline]
pub(crate) fn bytes_of<T: Element>(values: &[T]) -> &[u8] {
    unsafe { from_raw_parts(values.as_ptr().cast(), size_of_val(values)) }
}

#[inline]
pub(crate) fn bytes_of_mut<T: Element>(values: &mut [T]) -> &mut [u8] {
    let len = size_of_val(values);
    unsafe { from_raw_parts_mut(values.as_mut_ptr().cast(), len) }
}

#[test]
fn test_size() {
    fn check<T: Element>() {
        assert_eq!(T::KIND.size(), std::mem::size_of::<T>());
    }
    check::<i8>();
    check::<u16>();
    check::<i32>();
    check::<u64>();
    check::<f16>();
    check::<f32>();
    check::<f64>();

    assert_eq!(bytes_of(&[1.0f32, 2.0]).len(), 8);
    assert_eq!(bytes_of_mut(&mut [0u16; 3]).len(), 6);
}
