//! **Secure memory**: Keep key material and decrypted plaintext locked in RAM so the OS never
//! swaps it to disk, and wipe it when the owner goes away.
//!
//! Uses `mlock`/`munlock` on Unix and `VirtualLock`/`VirtualUnlock` on Windows. Wiping goes
//! through `zeroize`, which the compiler is not allowed to elide.

use zeroize::Zeroize;

#[cfg(unix)]
mod sys {
    use libc::c_void;

    pub(super) fn pin(region: &mut [u8]) -> bool {
        unsafe { libc::mlock(region.as_mut_ptr() as *const c_void, region.len()) == 0 }
    }

    pub(super) fn unpin(region: &mut [u8]) {
        unsafe {
            libc::munlock(region.as_mut_ptr() as *const c_void, region.len());
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::ffi::c_void;
    use windows_sys::Win32::System::Memory::{VirtualLock, VirtualUnlock};

    pub(super) fn pin(region: &mut [u8]) -> bool {
        unsafe { VirtualLock(region.as_mut_ptr() as *const c_void, region.len()) != 0 }
    }

    pub(super) fn unpin(region: &mut [u8]) {
        unsafe {
            VirtualUnlock(region.as_mut_ptr() as *const c_void, region.len());
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    pub(super) fn pin(_region: &mut [u8]) -> bool {
        true
    }

    pub(super) fn unpin(_region: &mut [u8]) {}
}

/// Pin `region` in RAM. An empty region counts as pinned. Failure is logged, not fatal:
/// the buffer still gets wiped on drop.
fn pin(region: &mut [u8], what: &str) -> bool {
    if region.is_empty() {
        return true;
    }
    let pinned = sys::pin(region);
    if !pinned {
        tracing::warn!(
            target: "phait::secure_memory",
            what,
            len = region.len(),
            "could not pin buffer in RAM; it may be swapped to disk"
        );
    }
    pinned
}

/// Wipe `region`, then release its pin if it held one.
fn wipe_and_unpin(region: &mut [u8], pinned: bool) {
    region.zeroize();
    if pinned && !region.is_empty() {
        sys::unpin(region);
    }
}

/// A plaintext buffer that is locked in RAM and zeroed on drop.
/// Every decrypted record and attachment passes through one of these.
pub struct LockedVec {
    inner: Vec<u8>,
    locked: bool,
}

impl LockedVec {
    /// Takes ownership of `data`, locks it in RAM, and returns a wrapper that will zero and
    /// unlock on drop.
    pub fn new(mut data: Vec<u8>) -> Self {
        let locked = pin(&mut data, "plaintext");
        Self {
            inner: data,
            locked,
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Copy the plaintext out of the locked region. The copy is ordinary heap memory;
    /// use only when handing content back to the application.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.clone()
    }
}

impl AsRef<[u8]> for LockedVec {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for LockedVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedVec")
            .field("len", &self.inner.len())
            .finish_non_exhaustive()
    }
}

impl Drop for LockedVec {
    fn drop(&mut self) {
        wipe_and_unpin(&mut self.inner, self.locked);
    }
}

/// Fixed-size secret (key material) pinned on the heap, locked in RAM, zeroed on drop.
pub struct LockedKey<const N: usize> {
    bytes: Box<[u8; N]>,
    locked: bool,
}

impl<const N: usize> LockedKey<N> {
    /// Moves `bytes` into a locked heap allocation and wipes the caller's copy.
    pub fn new(bytes: &mut [u8; N]) -> Self {
        let mut boxed = Box::new([0u8; N]);
        boxed.copy_from_slice(bytes);
        bytes.zeroize();
        let locked = pin(&mut boxed[..], "key material");
        Self {
            bytes: boxed,
            locked,
        }
    }

    #[inline]
    pub fn expose(&self) -> &[u8; N] {
        &self.bytes
    }

    pub fn is_memory_locked(&self) -> bool {
        self.locked
    }
}

impl<const N: usize> Drop for LockedKey<N> {
    fn drop(&mut self) {
        wipe_and_unpin(&mut self.bytes[..], self.locked);
    }
}
