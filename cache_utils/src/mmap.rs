use core::ffi::c_void;
use core::mem::size_of;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::ptr::null_mut;
use core::ptr::NonNull;
use core::slice::{from_raw_parts, from_raw_parts_mut};
use log::{error, trace};
use nix::errno::Errno::EINVAL;
use nix::sys::mman;

/* from linux kernel headers.
#define HUGETLB_FLAG_ENCODE_SHIFT       26
#define HUGETLB_FLAG_ENCODE_2MB         (21 << HUGETLB_FLAG_ENCODE_SHIFT)
*/

/// Anonymous private mapping holding `size` elements of `T`.
///
/// Every element is written by the initializer, so all pages are faulted in
/// before `try_new` returns.
///
/// Safety issue : if T is non triviably constructable and destructable this is dangerous
pub struct MMappedMemory<T> {
    pointer: NonNull<T>,
    size: usize,
}

impl<T> MMappedMemory<T> {
    pub fn try_new(
        size: usize,
        huge: bool,
        initializer: impl Fn(usize) -> T,
    ) -> Result<MMappedMemory<T>, nix::Error> {
        assert_ne!(size_of::<T>(), 0);
        if size == 0 {
            return Err(nix::Error::Sys(EINVAL));
        }
        let p = unsafe {
            mman::mmap(
                null_mut(),
                size * size_of::<T>(),
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_PRIVATE
                    | mman::MapFlags::MAP_ANONYMOUS
                    | if huge {
                        mman::MapFlags::MAP_HUGETLB
                    } else {
                        mman::MapFlags::MAP_ANONYMOUS
                    },
                -1,
                0,
            )?
        };
        let pointer = NonNull::new(p as *mut T).ok_or(nix::Error::Sys(EINVAL))?;
        trace!(
            "mapped {} bytes at {:p} (huge: {})",
            size * size_of::<T>(),
            pointer.as_ptr(),
            huge
        );
        let s = MMappedMemory { pointer, size };
        for i in 0..s.size {
            unsafe { ptr::write(s.pointer.as_ptr().add(i), initializer(i)) };
        }
        Ok(s)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_ptr(&self) -> *const T {
        self.pointer.as_ptr()
    }

    pub fn slice(&self) -> &[T] {
        unsafe { from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn slice_mut(&mut self) -> &mut [T] {
        unsafe { from_raw_parts_mut(self.pointer.as_ptr(), self.size) }
    }
}

impl<T> Drop for MMappedMemory<T> {
    fn drop(&mut self) {
        for i in 0..self.size {
            unsafe { ptr::drop_in_place(self.pointer.as_ptr().add(i)) };
        }
        let r = unsafe {
            mman::munmap(
                self.pointer.as_ptr() as *mut c_void,
                self.size * size_of::<T>(),
            )
        };
        if let Err(e) = r {
            error!("munmap failed: {}", e);
        }
    }
}

impl<T> Deref for MMappedMemory<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        self.slice()
    }
}

impl<T> DerefMut for MMappedMemory<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slice_mut()
    }
}

impl<T> AsRef<[T]> for MMappedMemory<T> {
    fn as_ref(&self) -> &[T] {
        self.slice()
    }
}

// The mapping is exclusively owned, like a Box<[T]>.
unsafe impl<T: Send> Send for MMappedMemory<T> {}
unsafe impl<T: Sync> Sync for MMappedMemory<T> {}
