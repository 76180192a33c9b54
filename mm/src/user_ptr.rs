//! Validated user-space pointer types.
//!
//! The kernel never dereferences a raw user address. Every crossing is
//! wrapped in one of these types, whose constructors enforce the range
//! rules of `user_range_ok`: non-null, canonical, non-wrapping, entirely
//! below the kernel base. Page-table validation happens separately in
//! `user_copy`.

use core::marker::PhantomData;

use ferrite_abi::addr::VirtAddr;

use crate::layout::{USER_SPACE_END_VA, USER_SPACE_START_VA};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UserPtrError {
    Null = 1,
    NonCanonical = 2,
    OutOfUserRange = 3,
    Overflow = 4,
    /// Page not mapped or not USER/WRITABLE in the page tables.
    NotMapped = 5,
    /// The copy itself faulted (racing unmap).
    CopyFailed = 6,
}

/// A range-checked user-space virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct UserVirtAddr(VirtAddr);

impl UserVirtAddr {
    pub fn try_new(addr: u64, len: usize) -> Result<Self, UserPtrError> {
        if addr == 0 {
            return Err(UserPtrError::Null);
        }
        if !VirtAddr::is_canonical(addr) {
            return Err(UserPtrError::NonCanonical);
        }
        if addr < USER_SPACE_START_VA || addr >= USER_SPACE_END_VA {
            return Err(UserPtrError::OutOfUserRange);
        }
        let end = addr.checked_add(len as u64).ok_or(UserPtrError::Overflow)?;
        if end > USER_SPACE_END_VA {
            return Err(UserPtrError::Overflow);
        }
        Ok(Self(VirtAddr(addr)))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0.as_ptr()
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0.as_mut_ptr()
    }
}

/// A typed user pointer, validated to cover `size_of::<T>()` bytes.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct UserPtr<T> {
    addr: UserVirtAddr,
    _marker: PhantomData<*const T>,
}

impl<T> UserPtr<T> {
    pub fn try_new(addr: u64) -> Result<Self, UserPtrError> {
        let validated = UserVirtAddr::try_new(addr, core::mem::size_of::<T>())?;
        Ok(Self {
            addr: validated,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub const fn addr(self) -> UserVirtAddr {
        self.addr
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.addr.as_u64()
    }

    #[inline]
    pub const fn as_ptr(self) -> *const T {
        self.addr.as_ptr()
    }

    #[inline]
    pub const fn as_mut_ptr(self) -> *mut T {
        self.addr.as_mut_ptr()
    }
}

/// A validated user buffer with an element count.
#[derive(Copy, Clone, Debug)]
pub struct UserSlice<T> {
    base: UserVirtAddr,
    len: usize,
    _marker: PhantomData<*const T>,
}

impl<T> UserSlice<T> {
    pub fn try_new(addr: u64, count: usize) -> Result<Self, UserPtrError> {
        let byte_len = count
            .checked_mul(core::mem::size_of::<T>())
            .ok_or(UserPtrError::Overflow)?;
        let validated = UserVirtAddr::try_new(addr, byte_len)?;
        Ok(Self {
            base: validated,
            len: count,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub const fn base(&self) -> UserVirtAddr {
        self.base
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub type UserBytes = UserSlice<u8>;
