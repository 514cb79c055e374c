mod buffer;
mod element;

pub use buffer::{BufferAccess, HostBuffer};
pub use element::{Element, ElementKind};

use crate::{invalid_argument, BindError, Handle, Kind, Region};
use element::{bytes_of, bytes_of_mut};
use log::trace;
use std::{
    ffi::c_void,
    fmt,
    marker::PhantomData,
    mem::size_of,
    ptr::{null_mut, NonNull},
    slice::{from_mut, from_ref},
};

/// 指针当前的形态。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Variant {
    Null,
    HostBuffer,
    HandleArray,
    RawAddress,
}

/// 原生调用对指针所指内存的访问方向。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Access {
    /// 原生代码只读取。
    Read,
    /// 原生代码会写入。
    Write,
}

/// 传给原生 `void*` 形参的值。
///
/// 指针别名它所来自的主机存储：构造之后、调用完成之前对存储的修改对原生代码可见，
/// 原生代码写入的结果也直接落在主机存储上。
/// 字节偏移总是相对于存储的起点。
#[derive(Clone)]
pub struct Pointer<'a> {
    target: Target<'a>,
    offset: isize,
}

#[derive(Clone)]
enum Target<'a> {
    Null,
    Host {
        kind: ElementKind,
        storage: Storage<'a>,
    },
    Handles {
        base: NonNull<usize>,
        count: usize,
        writable: bool,
        _borrow: PhantomData<&'a mut [usize]>,
    },
    Raw(NonNull<c_void>),
}

#[derive(Clone)]
enum Storage<'a> {
    Array {
        base: NonNull<u8>,
        len: usize,
        writable: bool,
        _borrow: PhantomData<&'a mut [u8]>,
    },
    Direct(Region),
}

impl Default for Pointer<'_> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<'a> Pointer<'a> {
    #[inline]
    pub const fn null() -> Self {
        Self {
            target: Target::Null,
            offset: 0,
        }
    }

    /// 指向可写主机数组的指针。
    ///
    /// 元素种类由类型决定，不同种类的元素无法混在一个数组里：
    ///
    /// ```compile_fail
    /// use clbind::Pointer;
    ///
    /// let mut mixed = [1, 2, 3, 4.5];
    /// let _ = Pointer::from_array(Some(&mut mixed[..]));
    /// ```
    pub fn from_array<T: Element>(values: Option<&'a mut [T]>) -> Result<Self, BindError> {
        let values = values.ok_or_else(|| invalid_argument("array may not be null"))?;
        Ok(Self::array(T::KIND, bytes_of_mut(values), true))
    }

    /// 指向只读主机数组的指针，不能作为原生写入的目标。
    pub fn from_slice<T: Element>(values: Option<&'a [T]>) -> Result<Self, BindError> {
        let values = values.ok_or_else(|| invalid_argument("array may not be null"))?;
        let bytes = bytes_of(values);
        Ok(Self::host(
            T::KIND,
            Storage::Array {
                base: NonNull::from(bytes).cast(),
                len: bytes.len(),
                writable: false,
                _borrow: PhantomData,
            },
        ))
    }

    /// 指向主机缓冲区的指针。
    ///
    /// 缓冲区必须可直接寻址或者有后备数组。
    pub fn from_buffer<B: HostBuffer + ?Sized>(buffer: Option<&'a mut B>) -> Result<Self, BindError> {
        let buffer = buffer.ok_or_else(|| invalid_argument("buffer may not be null"))?;
        let kind = buffer.element_kind();
        match buffer.access() {
            BufferAccess::Array(bytes) => Ok(Self::array(kind, bytes, true)),
            BufferAccess::Direct(region) => Ok(Self::host(kind, Storage::Direct(region))),
            BufferAccess::Indirect => Err(invalid_argument(
                "buffer must have an array or be direct",
            )),
        }
    }

    /// 指向原生句柄数组的指针，原生代码只读取。
    ///
    /// 数组中的空句柄原样传递，由具体调用决定是否接受。
    pub fn from_handles<K: Kind>(handles: Option<&'a [Handle<K>]>) -> Result<Self, BindError> {
        let handles = handles.ok_or_else(|| invalid_argument("handle list may not be null"))?;
        Ok(Self::handles(NonNull::from(handles).cast(), handles.len(), false))
    }

    /// 指向可写原生句柄数组的指针，原生代码可以把句柄填入数组。
    pub fn from_handles_mut<K: Kind>(handles: Option<&'a mut [Handle<K>]>) -> Result<Self, BindError> {
        let handles = handles.ok_or_else(|| invalid_argument("handle list may not be null"))?;
        let count = handles.len();
        Ok(Self::handles(NonNull::from(handles).cast(), count, true))
    }

    /// 指向单个句柄的指针，例如作为内核参数的存储对象。
    #[inline]
    pub fn to_handle<K: Kind>(handle: &'a Handle<K>) -> Self {
        Self::handles(NonNull::from(from_ref(handle)).cast(), 1, false)
    }

    /// 指向单个可写句柄的指针，用于接收原生调用返回的句柄。
    #[inline]
    pub fn to_handle_mut<K: Kind>(handle: &'a mut Handle<K>) -> Self {
        Self::handles(NonNull::from(from_mut(handle)).cast(), 1, true)
    }

    /// 指向指针表的指针。原生代码看到一个 `void*` 数组，可以改写其中的项。
    #[inline]
    pub fn from_list(list: &'a mut PointerList<'_>) -> Self {
        let count = list.slots.len();
        Self::handles(NonNull::from(&mut *list.slots).cast(), count, true)
    }

    /// 原生调用返回的地址。
    #[inline]
    pub(crate) fn raw(addr: *mut c_void) -> Self {
        match NonNull::new(addr) {
            Some(addr) => Self {
                target: Target::Raw(addr),
                offset: 0,
            },
            None => Self::null(),
        }
    }

    /// 在同一存储上再叠加 `delta` 字节的偏移。
    ///
    /// 不复制数据，也不检查边界；空指针不能偏移。
    pub fn with_byte_offset(&self, delta: isize) -> Result<Self, BindError> {
        if let Target::Null = self.target {
            return Err(invalid_argument("a null pointer cannot carry a byte offset"));
        }
        let offset = self
            .offset
            .checked_add(delta)
            .ok_or_else(|| invalid_argument(format!("byte offset {} + {delta} overflows", self.offset)))?;
        Ok(Self {
            target: self.target.clone(),
            offset,
        })
    }

    pub fn variant(&self) -> Variant {
        match self.target {
            Target::Null => Variant::Null,
            Target::Host { .. } => Variant::HostBuffer,
            Target::Handles { .. } => Variant::HandleArray,
            Target::Raw(_) => Variant::RawAddress,
        }
    }

    #[inline]
    pub const fn byte_offset(&self) -> isize {
        self.offset
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self.target, Target::Null)
    }

    pub fn element_kind(&self) -> Option<ElementKind> {
        match self.target {
            Target::Host { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// 是否指向可直接寻址、地址稳定的主机区域。
    #[inline]
    pub fn is_direct(&self) -> bool {
        matches!(
            self.target,
            Target::Host {
                storage: Storage::Direct(_),
                ..
            }
        )
    }

    /// 指针在调用边界上解析出的地址，即存储起点加偏移。
    #[inline]
    pub fn address(&self) -> usize {
        self.start() as usize
    }

    /// 原生调用返回之后地址仍然有效。
    #[inline]
    pub(crate) fn is_stable(&self) -> bool {
        self.is_direct() || matches!(self.target, Target::Raw(_))
    }

    #[inline]
    pub(crate) fn region(&self) -> Option<&Region> {
        match &self.target {
            Target::Host {
                storage: Storage::Direct(region),
                ..
            } => Some(region),
            _ => None,
        }
    }

    pub(crate) fn resolve(&self) -> *mut c_void {
        trace!("resolve {self}");
        self.start()
    }

    /// 单个句柄指针所指的句柄地址。
    pub(crate) fn handle_value(&self) -> Option<usize> {
        match self.target {
            Target::Handles { base, count: 1, .. } if self.offset == 0 => {
                Some(unsafe { *base.as_ptr() })
            }
            _ => None,
        }
    }

    fn start(&self) -> *mut c_void {
        let base: *mut u8 = match &self.target {
            Target::Null => return null_mut(),
            Target::Host { storage, .. } => match storage {
                Storage::Array { base, .. } => base.as_ptr(),
                Storage::Direct(region) => region.as_ptr(),
            },
            Target::Handles { base, .. } => base.as_ptr().cast(),
            Target::Raw(addr) => addr.as_ptr().cast(),
        };
        base.wrapping_offset(self.offset).cast()
    }

    /// 检查从当前偏移开始的 `size` 字节落在主机存储之内，且满足访问方向。
    ///
    /// 空指针和原生地址的范围由原生代码检查。
    pub(crate) fn check_span(&self, size: usize, access: Access) -> Result<(), BindError> {
        let (len, writable) = match &self.target {
            Target::Null | Target::Raw(_) => return Ok(()),
            Target::Host { storage, .. } => match storage {
                &Storage::Array { len, writable, .. } => (len, writable),
                Storage::Direct(region) => (region.len(), true),
            },
            &Target::Handles {
                count, writable, ..
            } => (count * size_of::<usize>(), writable),
        };
        if access == Access::Write && !writable {
            return Err(invalid_argument(format!("{self} is read-only")));
        }
        let Ok(start) = usize::try_from(self.offset) else {
            return Err(invalid_argument(format!("{self} has a negative byte offset")));
        };
        match start.checked_add(size) {
            Some(end) if end <= len => Ok(()),
            _ => Err(invalid_argument(format!(
                "{size} bytes at {self} exceed the {len} bytes of storage"
            ))),
        }
    }

    #[inline]
    fn host(kind: ElementKind, storage: Storage<'a>) -> Self {
        Self {
            target: Target::Host { kind, storage },
            offset: 0,
        }
    }

    #[inline]
    fn handles(base: NonNull<usize>, count: usize, writable: bool) -> Self {
        Self {
            target: Target::Handles {
                base,
                count,
                writable,
                _borrow: PhantomData,
            },
            offset: 0,
        }
    }

    #[inline]
    fn array(kind: ElementKind, bytes: &'a mut [u8], writable: bool) -> Self {
        let len = bytes.len();
        Self::host(
            kind,
            Storage::Array {
                base: NonNull::from(bytes).cast(),
                len,
                writable,
                _borrow: PhantomData,
            },
        )
    }

    fn extent(&self) -> usize {
        match &self.target {
            Target::Null | Target::Raw(_) => 0,
            Target::Host { storage, .. } => match storage {
                &Storage::Array { len, .. } => len,
                Storage::Direct(region) => region.len(),
            },
            &Target::Handles { count, .. } => count * size_of::<usize>(),
        }
    }
}

impl<'a, T: Element> From<&'a mut [T]> for Pointer<'a> {
    #[inline]
    fn from(values: &'a mut [T]) -> Self {
        Self::array(T::KIND, bytes_of_mut(values), true)
    }
}

impl<'a, T: Element> From<&'a [T]> for Pointer<'a> {
    #[inline]
    fn from(values: &'a [T]) -> Self {
        let bytes = bytes_of(values);
        Self::host(
            T::KIND,
            Storage::Array {
                base: NonNull::from(bytes).cast(),
                len: bytes.len(),
                writable: false,
                _borrow: PhantomData,
            },
        )
    }
}

/// 形态、存储和偏移都相同的两个指针相等。
impl PartialEq for Pointer<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.variant() == other.variant()
            && self.element_kind() == other.element_kind()
            && self.extent() == other.extent()
            && self.offset == other.offset
            && self.start() == other.start()
    }
}

impl fmt::Display for Pointer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let offset = self.offset;
        match &self.target {
            Target::Null => write!(f, "Pointer[null]"),
            Target::Host { kind, storage } => match storage {
                Storage::Array { len, writable, .. } => {
                    let access = if *writable { "array" } else { "readonly" };
                    write!(f, "Pointer[{access}={kind:?}x{},byteOffset={offset}]", len / kind.size())
                }
                Storage::Direct(region) => write!(
                    f,
                    "Pointer[direct={:p},len={},byteOffset={offset}]",
                    region.as_ptr(),
                    region.len()
                ),
            },
            Target::Handles { count, writable, .. } => {
                let what = if *writable { "slots" } else { "handles" };
                write!(f, "Pointer[{what}={count},byteOffset={offset}]")
            }
            Target::Raw(addr) => write!(f, "Pointer[nativePointer={:p},byteOffset={offset}]", addr.as_ptr()),
        }
    }
}

impl fmt::Debug for Pointer<'_> {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// 指针表。
///
/// 每一项保存一个内层指针解析出的地址。原生代码可以改写表项，
/// 调用返回后 [`get`](Self::get) 对被改写的项给出新的原生地址。
pub struct PointerList<'a> {
    inner: Vec<Pointer<'a>>,
    slots: Box<[usize]>,
}

impl<'a> PointerList<'a> {
    pub fn new(pointers: impl IntoIterator<Item = Pointer<'a>>) -> Self {
        let inner = pointers.into_iter().collect::<Vec<_>>();
        let slots = inner.iter().map(Pointer::address).collect();
        Self { inner, slots }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// 表中当前的原生地址。
    #[inline]
    pub fn addresses(&self) -> &[usize] {
        &self.slots
    }

    /// 第 `i` 项。未被原生代码改写时是原来的内层指针，否则是新的原生地址。
    pub fn get(&self, i: usize) -> Option<Pointer<'a>> {
        let (inner, &slot) = self.inner.get(i).zip(self.slots.get(i))?;
        Some(if slot == inner.address() {
            inner.clone()
        } else {
            Pointer::raw(slot as *mut c_void)
        })
    }
}

impl fmt::Debug for PointerList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(&self.inner).finish()
    }
}
