use crate::{bindings::*, ClPlatform};
use std::fmt;

/// 以 0 结尾的 `(属性, 值)` 列表，用于创建上下文。
///
/// 每一项都是原生 `cl_context_properties`，可以直接交给原生代码。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ContextProperties(Vec<cl_context_properties>);

impl Default for ContextProperties {
    #[inline]
    fn default() -> Self {
        Self(vec![0])
    }
}

impl ContextProperties {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一对属性，保持结尾的 0。
    pub fn add(&mut self, id: cl_context_properties, value: cl_context_properties) -> &mut Self {
        let end = self.0.len() - 1;
        self.0.splice(end..end, [id, value]);
        self
    }

    #[inline]
    pub fn add_platform(&mut self, platform: ClPlatform) -> &mut Self {
        self.add(CL_CONTEXT_PLATFORM, platform.addr() as _)
    }

    /// 属性对的数量。
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len() / 2
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.len() == 1
    }

    #[inline]
    pub fn get(&self, id: cl_context_properties) -> Option<cl_context_properties> {
        self.pairs().find(|&(k, _)| k == id).map(|(_, v)| v)
    }

    #[inline]
    pub fn as_slice(&self) -> &[cl_context_properties] {
        &self.0
    }

    fn pairs(&self) -> impl Iterator<Item = (cl_context_properties, cl_context_properties)> + '_ {
        self.0.chunks_exact(2).map(|pair| (pair[0], pair[1]))
    }
}

impl fmt::Display for ContextProperties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "cl_context_properties[")?;
        for (i, (id, value)) in self.pairs().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match id {
                CL_CONTEXT_PLATFORM => write!(f, "CL_CONTEXT_PLATFORM=0x{value:x}")?,
                CL_CONTEXT_INTEROP_USER_SYNC => write!(f, "CL_CONTEXT_INTEROP_USER_SYNC={value}")?,
                _ => write!(f, "0x{id:x}=0x{value:x}")?,
            }
        }
        write!(f, "]")
    }
}
