use crate::irq::{IrqGuard, IrqLocked};
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

/// Set while a writer holds the lock.
const WRITER: u32 = 1 << 31;

/// Set while a writer is waiting; blocks new readers.
const WRITER_WAITING: u32 = 1 << 30;

/// Reader count occupies the remaining bits.
const READERS: u32 = WRITER_WAITING - 1;

/// Reader/writer spinlock with writer preference.
///
/// Any number of readers may hold the lock at once; a writer excludes
/// everybody. A spinning writer stops new readers from entering so lookups
/// cannot starve mutation.
pub struct RwSpinLock<T> {
    state: AtomicU32,
    inner: UnsafeCell<T>,
}

// Safety: readers share &T across threads (T: Sync), writers move &mut T (T: Send).
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}
unsafe impl<T: Send> Send for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    pub fn try_read(&self) -> Option<RwSpinReadGuard<'_, T>> {
        let s = self.state.load(Ordering::Relaxed);
        if s & (WRITER | WRITER_WAITING) != 0 || s & READERS == READERS {
            return None;
        }
        self.state
            .compare_exchange(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinReadGuard { lock: self })
    }

    /// Spin until no writer holds or awaits the lock.
    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        loop {
            if let Some(g) = self.try_read() {
                return g;
            }
            spin_loop();
        }
    }

    #[inline]
    pub fn try_write(&self) -> Option<RwSpinWriteGuard<'_, T>> {
        let s = self.state.load(Ordering::Relaxed);
        if s & !WRITER_WAITING != 0 {
            return None;
        }
        self.state
            .compare_exchange(s, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinWriteGuard { lock: self })
    }

    /// Announce the writer, then spin until readers drained.
    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        loop {
            if let Some(g) = self.try_write() {
                return g;
            }
            let s = self.state.load(Ordering::Relaxed);
            if s & WRITER_WAITING == 0 {
                self.state.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            }
            spin_loop();
        }
    }

    #[inline]
    pub fn read_irq(&self) -> IrqLocked<RwSpinReadGuard<'_, T>> {
        let irq = IrqGuard::new();
        IrqLocked::new(irq, self.read())
    }

    #[inline]
    pub fn write_irq(&self) -> IrqLocked<RwSpinWriteGuard<'_, T>> {
        let irq = IrqGuard::new();
        IrqLocked::new(irq, self.write())
    }

    /// Number of readers currently inside.
    #[inline]
    pub fn reader_count(&self) -> u32 {
        self.state.load(Ordering::Relaxed) & READERS
    }

    #[inline]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for RwSpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        // Keep WRITER_WAITING if another writer announced itself meanwhile.
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}
