//! Asymmetric memory barriers.
//!
//! Both reclamation schemes have a hot reader side (publishing a hazard pointer, entering a
//! critical zone) and a cold scanner side (collecting every hazard, snapshotting every epoch).
//! The reader must not have its announcement reordered after its next load of a shared
//! pointer, and the scanner must see every announcement made before its own unlink.
//!
//! A `light_barrier` goes on the reader side and a `strong_barrier` on the scanner side.
//! Where the OS offers a process-wide barrier the light one shrinks to a compiler fence and
//! the strong one forces every running thread through a full fence. Without OS support, or
//! with the `fast-barrier` feature disabled, both are sequentially consistent fences.

#[cfg(all(feature = "fast-barrier", target_os = "linux"))]
pub use self::linux::{light_barrier, strong_barrier};

#[cfg(all(feature = "fast-barrier", target_os = "windows"))]
pub use self::windows::{light_barrier, strong_barrier};

#[cfg(all(feature = "fast-barrier", target_os = "macos"))]
pub use self::macos::{light_barrier, strong_barrier};

#[cfg(not(all(
    feature = "fast-barrier",
    any(target_os = "linux", target_os = "windows", target_os = "macos")
)))]
pub use self::fallback::{light_barrier, strong_barrier};

#[cfg(all(feature = "fast-barrier", target_os = "linux"))]
mod linux {
    use core::sync::atomic::{compiler_fence, fence, Ordering};
    use once_cell::sync::Lazy;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Strategy {
        Membarrier,
        Fence,
    }

    static STRATEGY: Lazy<Strategy> = Lazy::new(|| {
        if membarrier::register() {
            tracing::debug!("using private expedited membarrier");
            Strategy::Membarrier
        } else {
            tracing::debug!("membarrier unavailable, falling back to fences");
            Strategy::Fence
        }
    });

    pub fn light_barrier() {
        match *STRATEGY {
            Strategy::Membarrier => compiler_fence(Ordering::SeqCst),
            Strategy::Fence => fence(Ordering::SeqCst),
        }
    }

    pub fn strong_barrier() {
        match *STRATEGY {
            Strategy::Membarrier => membarrier::barrier(),
            Strategy::Fence => fence(Ordering::SeqCst),
        }
    }

    mod membarrier {
        const CMD_QUERY: libc::c_int = 0;
        const CMD_PRIVATE_EXPEDITED: libc::c_int = 1 << 3;
        const CMD_REGISTER_PRIVATE_EXPEDITED: libc::c_int = 1 << 4;

        fn call(cmd: libc::c_int) -> libc::c_long {
            unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0 as libc::c_int) }
        }

        /// Checks that private expedited membarrier is supported and registers the process.
        pub fn register() -> bool {
            let supported = call(CMD_QUERY);
            let needed = (CMD_PRIVATE_EXPEDITED | CMD_REGISTER_PRIVATE_EXPEDITED) as libc::c_long;

            supported >= 0
                && supported & needed == needed
                && call(CMD_REGISTER_PRIVATE_EXPEDITED) >= 0
        }

        pub fn barrier() {
            // Registration succeeded, so failure here means the kernel state is corrupt.
            if call(CMD_PRIVATE_EXPEDITED) < 0 {
                std::process::abort();
            }
        }
    }
}

#[cfg(all(feature = "fast-barrier", target_os = "windows"))]
mod windows {
    use core::sync::atomic::{compiler_fence, Ordering};
    use winapi::um::processthreadsapi;

    pub fn light_barrier() {
        compiler_fence(Ordering::SeqCst);
    }

    pub fn strong_barrier() {
        unsafe {
            processthreadsapi::FlushProcessWriteBuffers();
        }
    }
}

#[cfg(all(feature = "fast-barrier", target_os = "macos"))]
mod macos {
    use core::ptr;
    use core::sync::atomic::{compiler_fence, fence, Ordering};
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    /// A locked page whose protection change forces a TLB shootdown, and with it
    /// a full barrier, on every core running a thread of this process.
    struct Page(*mut libc::c_void);

    unsafe impl Send for Page {}

    static PAGE: Lazy<Option<Mutex<Page>>> = Lazy::new(|| unsafe {
        let page = libc::mmap(
            ptr::null_mut(),
            1,
            libc::PROT_READ,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );

        if page == libc::MAP_FAILED || libc::mlock(page, 1) < 0 {
            tracing::debug!("could not lock a barrier page, falling back to fences");
            None
        } else {
            Some(Mutex::new(Page(page)))
        }
    });

    pub fn light_barrier() {
        match &*PAGE {
            Some(_) => compiler_fence(Ordering::SeqCst),
            None => fence(Ordering::SeqCst),
        }
    }

    pub fn strong_barrier() {
        let page = match &*PAGE {
            Some(page) => page,
            None => return fence(Ordering::SeqCst),
        };

        let guard = match page.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        unsafe {
            if libc::mprotect(guard.0, 1, libc::PROT_READ | libc::PROT_WRITE) < 0
                || libc::mprotect(guard.0, 1, libc::PROT_READ) < 0
            {
                std::process::abort();
            }
        }
    }
}

#[cfg(not(all(
    feature = "fast-barrier",
    any(target_os = "linux", target_os = "windows", target_os = "macos")
)))]
mod fallback {
    use core::sync::atomic::{fence, Ordering};

    pub fn light_barrier() {
        fence(Ordering::SeqCst);
    }

    pub fn strong_barrier() {
        fence(Ordering::SeqCst);
    }
}
