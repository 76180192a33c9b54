//! Memory-management error type and its errno mapping.

use ferrite_abi::errno;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmError {
    NoMemory,
    InvalidAddress,
    InvalidArgument,
    AlreadyMapped,
    NotMapped,
    NotCowPage,
    NoSuchProcess,
    NoSuchSegment,
    SegmentExists,
    PermissionDenied,
    RegionTableFull,
    BadExecutable,
}

impl MmError {
    pub const fn to_errno(self) -> i32 {
        match self {
            MmError::NoMemory => errno::ENOMEM,
            MmError::InvalidAddress => errno::EFAULT,
            MmError::InvalidArgument => errno::EINVAL,
            MmError::AlreadyMapped => errno::EEXIST,
            MmError::NotMapped => errno::EINVAL,
            MmError::NotCowPage => errno::EFAULT,
            MmError::NoSuchProcess => errno::ESRCH,
            MmError::NoSuchSegment => errno::EINVAL,
            MmError::SegmentExists => errno::EEXIST,
            MmError::PermissionDenied => errno::EACCES,
            MmError::RegionTableFull => errno::ENOMEM,
            MmError::BadExecutable => errno::ENOEXEC,
        }
    }
}

pub type MmResult<T> = Result<T, MmError>;
