use std::io::Error;
use std::ptr;
use std::sync::OnceLock;

use lazy_static::lazy_static;

const DEFAULT_STACK_SIZE: usize = 128 * 1024;

// Floor under which entry frames and shallow call chains do not fit.
const MIN_STACK_SIZE: usize = 32 * 1024;

lazy_static! {
    static ref PAGE_SIZE: usize = unsafe {
        let rc = libc::sysconf(libc::_SC_PAGESIZE);
        if rc == -1 {
            panic!("fail to evaluate sysconf(_SC_PAGESIZE), got errno {}", errno::errno());
        }
        rc as usize
    };
}

pub(crate) fn page_size() -> usize {
    *PAGE_SIZE
}

/// StackSize specifies desired stack size for new fiber.
///
/// It defaults to what environment variable `STRAND_STACK_SIZE` specifies and
/// 128KiB in case of absent.
#[derive(Copy, Clone, Default, Debug)]
pub struct StackSize {
    size: usize,
}

impl StackSize {
    fn global_size() -> usize {
        static STACK_SIZE: OnceLock<usize> = OnceLock::new();
        *STACK_SIZE.get_or_init(|| match std::env::var("STRAND_STACK_SIZE") {
            Err(_) => DEFAULT_STACK_SIZE,
            Ok(val) => match val.parse::<usize>() {
                Err(_) | Ok(0) => DEFAULT_STACK_SIZE,
                Ok(n) => n,
            },
        })
    }

    fn align_to_page_size(size: usize) -> usize {
        let mask = page_size() - 1;
        (size + mask) & !mask
    }

    fn aligned_size(&self) -> usize {
        let size = match self.size {
            0 => Self::global_size(),
            n => n,
        };
        Self::align_to_page_size(size.max(MIN_STACK_SIZE).max(libc::MINSIGSTKSZ))
    }

    /// Specifies desired stack size. The size is aligned up to whole pages
    /// and clamped to a small floor.
    pub fn with_size(size: usize) -> StackSize {
        assert!(size <= isize::MAX as usize, "stack size is too large");
        StackSize { size }
    }
}

pub(crate) struct Stack {
    base: *mut u8,
    size: libc::size_t,
}

impl Stack {
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[allow(clippy::unnecessary_cast)]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn alloc(size: StackSize) -> Stack {
        let page_size = page_size();
        let stack_size = size.aligned_size();
        let alloc_size = stack_size + 2 * page_size;

        let flags = libc::MAP_STACK | libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
        let low = unsafe { libc::mmap(ptr::null_mut(), alloc_size, libc::PROT_NONE, flags, -1, 0) as *mut u8 };
        if low as *mut libc::c_void == libc::MAP_FAILED {
            panic!("failed to alloc stack with mmap: {:?}", Error::last_os_error())
        }

        // Pages below and above the usable range stay PROT_NONE to trap
        // overflow and underflow.
        let base = unsafe { low.add(page_size) };
        if unsafe { libc::mprotect(base as *mut libc::c_void, stack_size, libc::PROT_READ | libc::PROT_WRITE) } != 0 {
            panic!("failed to make stack read and write: {:?}", Error::last_os_error())
        }
        Stack { base, size: stack_size }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }
        let page_size = page_size();
        let alloc_size = self.size() + 2 * page_size;
        let low = unsafe { self.base.sub(page_size) };
        if unsafe { libc::munmap(low as *mut libc::c_void, alloc_size) } != 0 {
            panic!("failed to drop stack with munmap: {:?}", Error::last_os_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;

    use pretty_assertions::{assert_eq, assert_ne};

    use super::*;

    fn read_stack(stack: &Stack) {
        let _ = *unsafe { stack.base().as_ref().unwrap() };
        let _ = *unsafe { stack.base().add(stack.size() - 1).as_ref().unwrap() };
    }

    fn write_stack(stack: &Stack) {
        *unsafe { stack.base().as_mut().unwrap() } = 0x11;
        *unsafe { stack.base().add(stack.size() - 1).as_mut().unwrap() } = 0x11;
    }

    #[test]
    fn page_size_probed() {
        let n = page_size();
        assert_ne!(n, 0);
        assert_eq!(n & (n - 1), 0);
    }

    #[test]
    fn stack_zeroed() {
        let _stack: Stack = unsafe { mem::zeroed() };
    }

    #[test]
    fn stack_default() {
        let stack = Stack::alloc(StackSize::default());
        assert_eq!(stack.size(), 128 * 1024);
        assert_eq!(stack.size() % page_size(), 0);

        read_stack(&stack);
        write_stack(&stack);
    }

    #[test]
    fn stack_custom() {
        let stack = Stack::alloc(StackSize::with_size(20));
        assert!(stack.size() >= 20);
        assert_eq!(stack.size() % page_size(), 0);

        read_stack(&stack);
        write_stack(&stack);
    }
}
