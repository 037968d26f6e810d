//! A Vulkan handle wrapper with linear-ownership semantics: it must be
//! explicitly destroyed (`take`/`into_inner`) before being dropped, so a
//! leaked or double-destroyed handle panics loudly in debug builds instead
//! of silently leaking or double-freeing on the driver side.

use ash::vk::Handle;
use std::fmt;
use std::ops::Deref;

#[repr(transparent)]
pub(crate) struct UniqueHandle<T: Handle + Copy>(T);

impl<T: Handle + Copy> Drop for UniqueHandle<T> {
    fn drop(&mut self) {
        if self.0.as_raw() != 0 && !std::thread::panicking() {
            panic!("non-null UniqueHandle<{}> dropped without being destroyed", T::TYPE.as_raw());
        }
    }
}

impl<T: Handle + Copy + fmt::Debug> fmt::Debug for UniqueHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T: Handle + Copy> Default for UniqueHandle<T> {
    fn default() -> Self {
        UniqueHandle::null()
    }
}

impl<T: Handle + Copy> UniqueHandle<T> {
    pub fn null() -> UniqueHandle<T> {
        UniqueHandle(T::from_raw(0))
    }

    pub fn new(inner: T) -> UniqueHandle<T> {
        UniqueHandle(inner)
    }

    pub fn get(&self) -> T {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.as_raw() == 0
    }

    /// Releases the handle, leaving this wrapper null so `Drop` doesn't
    /// panic. The caller takes responsibility for destroying it.
    pub fn take(&mut self) -> T {
        std::mem::replace(&mut self.0, T::from_raw(0))
    }

    pub fn into_inner(mut self) -> T {
        self.take()
    }
}

impl<T: Handle + Copy> Deref for UniqueHandle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}
