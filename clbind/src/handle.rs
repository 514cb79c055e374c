use crate::{
    bindings::{cl_int, RawHandle},
    NativeApi,
};
use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
};

/// 原生资源的种类。
pub trait Kind: 'static {
    /// 资源在原生 API 中的类型名。
    const NAME: &'static str;
}

/// 由原生 API 引用计数的资源种类。
pub trait RefCounted: Kind {
    #[doc(hidden)]
    unsafe fn retain<A: NativeApi + ?Sized>(api: &A, raw: RawHandle) -> cl_int;
    #[doc(hidden)]
    unsafe fn release<A: NativeApi + ?Sized>(api: &A, raw: RawHandle) -> cl_int;
}

pub mod kind {
    use super::{Kind, RefCounted};
    use crate::{
        bindings::{cl_int, RawHandle},
        NativeApi,
    };

    macro_rules! kind {
        ($ty:ident $name:literal) => {
            pub enum $ty {}
            impl Kind for $ty {
                const NAME: &'static str = $name;
            }
        };
        ($ty:ident $name:literal $retain:ident $release:ident) => {
            kind!($ty $name);
            impl RefCounted for $ty {
                #[inline]
                unsafe fn retain<A: NativeApi + ?Sized>(api: &A, raw: RawHandle) -> cl_int {
                    api.$retain(raw)
                }
                #[inline]
                unsafe fn release<A: NativeApi + ?Sized>(api: &A, raw: RawHandle) -> cl_int {
                    api.$release(raw)
                }
            }
        };
    }

    kind!(Platform "cl_platform_id"                                              );
    kind!(Device   "cl_device_id"     retain_device        release_device       );
    kind!(Context  "cl_context"       retain_context       release_context      );
    kind!(Queue    "cl_command_queue" retain_command_queue release_command_queue);
    kind!(Mem      "cl_mem"           retain_mem_object    release_mem_object   );
    kind!(Program  "cl_program"       retain_program       release_program      );
    kind!(Kernel   "cl_kernel"        retain_kernel        release_kernel       );
    kind!(Event    "cl_event"         retain_event         release_event        );
    kind!(Sampler  "cl_sampler"       retain_sampler       release_sampler      );
}

/// 原生资源的非拥有引用。
///
/// 句柄只是地址，复制句柄不会增加原生引用计数。
/// 与 C 数组中的原生句柄布局相同，句柄切片可以直接交给原生代码。
#[repr(transparent)]
pub struct Handle<K: Kind> {
    addr: usize,
    _kind: PhantomData<fn() -> K>,
}

pub type ClPlatform = Handle<kind::Platform>;
pub type ClDevice = Handle<kind::Device>;
pub type ClContext = Handle<kind::Context>;
pub type ClQueue = Handle<kind::Queue>;
pub type ClMem = Handle<kind::Mem>;
pub type ClProgram = Handle<kind::Program>;
pub type ClKernel = Handle<kind::Kernel>;
pub type ClEvent = Handle<kind::Event>;
pub type ClSampler = Handle<kind::Sampler>;

impl<K: Kind> Handle<K> {
    /// 空句柄，不指向任何资源。
    #[inline]
    pub const fn null() -> Self {
        Self {
            addr: 0,
            _kind: PhantomData,
        }
    }

    /// 只有原生调用的返回值可以成为句柄。
    #[inline]
    pub(crate) fn from_raw(raw: RawHandle) -> Self {
        Self {
            addr: raw as usize,
            _kind: PhantomData,
        }
    }

    #[inline]
    pub fn as_raw(&self) -> RawHandle {
        self.addr as RawHandle
    }

    #[inline]
    pub const fn addr(&self) -> usize {
        self.addr
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.addr == 0
    }
}

impl<K: Kind> Clone for Handle<K> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: Kind> Copy for Handle<K> {}

impl<K: Kind> Default for Handle<K> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<K: Kind> PartialEq for Handle<K> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}

impl<K: Kind> Eq for Handle<K> {}

impl<K: Kind> Hash for Handle<K> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state)
    }
}

impl<K: Kind> fmt::Display for Handle<K> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}[0x{:x}]", K::NAME, self.addr)
    }
}

impl<K: Kind> fmt::Debug for Handle<K> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
