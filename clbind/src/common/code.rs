use crate::bindings::*;
use std::fmt;

/// 原生入口返回的结果码。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct Code(pub cl_int);

impl Code {
    pub const SUCCESS: Self = Self(CL_SUCCESS);

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == CL_SUCCESS
    }

    /// 结果码对应的常量名，未知的值返回 `"INVALID_ERROR_CODE"`。
    pub fn name(self) -> &'static str {
        macro_rules! names {
            ($code:expr => $($name:ident)+) => {
                match $code {
                    $( $name => stringify!($name), )+
                    _ => "INVALID_ERROR_CODE",
                }
            };
        }

        names! {
            self.0 =>
            CL_SUCCESS
            CL_DEVICE_NOT_FOUND
            CL_DEVICE_NOT_AVAILABLE
            CL_COMPILER_NOT_AVAILABLE
            CL_MEM_OBJECT_ALLOCATION_FAILURE
            CL_OUT_OF_RESOURCES
            CL_OUT_OF_HOST_MEMORY
            CL_PROFILING_INFO_NOT_AVAILABLE
            CL_MEM_COPY_OVERLAP
            CL_IMAGE_FORMAT_MISMATCH
            CL_IMAGE_FORMAT_NOT_SUPPORTED
            CL_BUILD_PROGRAM_FAILURE
            CL_MAP_FAILURE
            CL_MISALIGNED_SUB_BUFFER_OFFSET
            CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
            CL_COMPILE_PROGRAM_FAILURE
            CL_LINKER_NOT_AVAILABLE
            CL_LINK_PROGRAM_FAILURE
            CL_DEVICE_PARTITION_FAILED
            CL_KERNEL_ARG_INFO_NOT_AVAILABLE
            CL_INVALID_VALUE
            CL_INVALID_DEVICE_TYPE
            CL_INVALID_PLATFORM
            CL_INVALID_DEVICE
            CL_INVALID_CONTEXT
            CL_INVALID_QUEUE_PROPERTIES
            CL_INVALID_COMMAND_QUEUE
            CL_INVALID_HOST_PTR
            CL_INVALID_MEM_OBJECT
            CL_INVALID_IMAGE_FORMAT_DESCRIPTOR
            CL_INVALID_IMAGE_SIZE
            CL_INVALID_SAMPLER
            CL_INVALID_BINARY
            CL_INVALID_BUILD_OPTIONS
            CL_INVALID_PROGRAM
            CL_INVALID_PROGRAM_EXECUTABLE
            CL_INVALID_KERNEL_NAME
            CL_INVALID_KERNEL_DEFINITION
            CL_INVALID_KERNEL
            CL_INVALID_ARG_INDEX
            CL_INVALID_ARG_VALUE
            CL_INVALID_ARG_SIZE
            CL_INVALID_KERNEL_ARGS
            CL_INVALID_WORK_DIMENSION
            CL_INVALID_WORK_GROUP_SIZE
            CL_INVALID_WORK_ITEM_SIZE
            CL_INVALID_GLOBAL_OFFSET
            CL_INVALID_EVENT_WAIT_LIST
            CL_INVALID_EVENT
            CL_INVALID_OPERATION
            CL_INVALID_GL_OBJECT
            CL_INVALID_BUFFER_SIZE
            CL_INVALID_MIP_LEVEL
            CL_INVALID_GLOBAL_WORK_SIZE
            CL_INVALID_PROPERTY
            CL_INVALID_IMAGE_DESCRIPTOR
            CL_INVALID_COMPILER_OPTIONS
            CL_INVALID_LINKER_OPTIONS
            CL_INVALID_DEVICE_PARTITION_COUNT
        }
    }
}

impl From<cl_int> for Code {
    #[inline]
    fn from(value: cl_int) -> Self {
        Self(value)
    }
}

impl fmt::Display for Code {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

#[test]
fn test_name() {
    assert!(Code::SUCCESS.is_success());
    assert_eq!(Code(CL_INVALID_COMMAND_QUEUE).name(), "CL_INVALID_COMMAND_QUEUE");
    assert_eq!(Code(CL_DEVICE_NOT_FOUND).to_string(), "CL_DEVICE_NOT_FOUND (-1)");
    // 正值没有定义
    assert!(!Code(1).is_success());
    assert_eq!(Code(1).name(), "INVALID_ERROR_CODE");
}
