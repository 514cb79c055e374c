use super::Code;
use std::{error::Error, fmt};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    /// 参数在到达原生调用之前就被拒绝。
    InvalidArgument,
    /// 原生资源或内存不可用。
    ResourceUnavailable,
    /// 原生入口返回了非成功的结果码。
    NativeCallFailure,
    /// 回收对齐分配时原生释放失败。
    AllocationTrackingFailure,
}

#[derive(Clone, Debug)]
pub struct BindError {
    pub kind: ErrorKind,
    pub info: String,
    /// 仅 [`ErrorKind::NativeCallFailure`] 携带原生结果码。
    pub code: Option<Code>,
}

impl Error for BindError {}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.info)
    }
}

pub(super) mod functions {
    use super::{super::Code, BindError, ErrorKind::*};

    macro_rules! builder {
        ($ty:ident: $name:ident $kind:expr) => {
            #[inline]
            pub fn $name(info: impl Into<String>) -> $ty {
                $ty {
                    kind: $kind,
                    info: info.into(),
                    code: None,
                }
            }
        };
    }

    builder!(BindError: invalid_argument            InvalidArgument          );
    builder!(BindError: resource_unavailable        ResourceUnavailable      );
    builder!(BindError: allocation_tracking_failure AllocationTrackingFailure);

    #[inline]
    pub fn native_call_failed(call: &str, code: Code) -> BindError {
        BindError {
            kind: NativeCallFailure,
            info: format!("{call} returned {code}"),
            code: Some(code),
        }
    }
}

#[test]
fn test_display() {
    use crate::bindings::CL_INVALID_VALUE;

    let e = functions::invalid_argument("buffer may not be null");
    assert_eq!(e.to_string(), "InvalidArgument: buffer may not be null");
    assert!(e.code.is_none());

    let e = functions::native_call_failed("clFinish", Code(CL_INVALID_VALUE));
    assert_eq!(e.kind, ErrorKind::NativeCallFailure);
    assert_eq!(e.code, Some(Code(CL_INVALID_VALUE)));
    assert_eq!(
        e.to_string(),
        "NativeCallFailure: clFinish returned CL_INVALID_VALUE (-30)"
    );
}
