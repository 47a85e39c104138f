//! The request memory pool.
//!
//! Fixed-size elements: a request header plus the context-configured
//! trailer, rounded up to cache-line alignment. Memory grows in chunks of
//! 128 elements and is never returned until the pool drops; a free list
//! recycles released elements. The pool is worker-local and only touched
//! under the worker lock.

use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};

use crate::status::{Result, Status};
use crate::worker::EpHandle;

const CACHE_LINE: usize = 64;
const GROW_ELEMS: usize = 128;

/// Fixed header at the start of every pooled request.
#[repr(C)]
pub(crate) struct RequestHeader {
    pub peer: u64,
    pub ep: u32,
    pub flags: u32,
}

pub(crate) struct RequestPool {
    elem_layout: Layout,
    trailer: usize,
    chunks: Vec<(NonNull<u8>, Layout)>,
    free: Vec<NonNull<u8>>,
}

// Safety: the pool exclusively owns its chunks; the raw pointers are plain
// heap memory with no thread affinity.
unsafe impl Send for RequestPool {}

impl RequestPool {
    pub fn new(trailer: usize) -> Result<Self> {
        let size = core::mem::size_of::<RequestHeader>() + trailer;
        let elem_layout = Layout::from_size_align(size, CACHE_LINE)
            .map_err(|_| Status::InvalidParam)?
            .pad_to_align();
        let mut pool = RequestPool {
            elem_layout,
            trailer,
            chunks: Vec::new(),
            free: Vec::new(),
        };
        // Start with one chunk of elements ready to hand out.
        pool.grow();
        Ok(pool)
    }

    pub fn elem_size(&self) -> usize {
        self.elem_layout.size()
    }

    fn grow(&mut self) {
        let chunk_layout = match Layout::from_size_align(
            self.elem_layout.size() * GROW_ELEMS,
            self.elem_layout.align(),
        ) {
            Ok(layout) => layout,
            // Only reachable through an absurd trailer size; treated the
            // same as allocator failure below.
            Err(_) => panic!("request pool: element size overflow"),
        };
        // Safety: the layout has non-zero size.
        let base = unsafe { alloc_zeroed(chunk_layout) };
        let Some(base) = NonNull::new(base) else {
            handle_alloc_error(chunk_layout)
        };
        self.chunks.push((base, chunk_layout));
        for index in 0..GROW_ELEMS {
            // Safety: stepping inside the freshly allocated chunk; the
            // element size is a multiple of the alignment.
            let elem = unsafe { base.as_ptr().add(index * self.elem_layout.size()) };
            self.free.push(unsafe { NonNull::new_unchecked(elem) });
        }
    }

    /// Take one element. The pool is unbounded; failure to grow it is a
    /// process-allocator failure and aborts via `handle_alloc_error`.
    pub fn get(&mut self) -> NonNull<u8> {
        if self.free.is_empty() {
            self.grow();
        }
        match self.free.pop() {
            Some(elem) => elem,
            // grow() pushed GROW_ELEMS entries or diverged.
            None => unreachable!("request pool grew without producing elements"),
        }
    }

    /// Return an element previously obtained from [`RequestPool::get`].
    pub fn put(&mut self, elem: NonNull<u8>) {
        self.free.push(elem);
    }

    pub fn trailer(&self) -> usize {
        self.trailer
    }
}

impl Drop for RequestPool {
    fn drop(&mut self) {
        for (base, layout) in self.chunks.drain(..) {
            // Safety: allocated in grow() with exactly this layout.
            unsafe { dealloc(base.as_ptr(), layout) };
        }
    }
}

/// An application-visible request from the pool, e.g. the reply request of
/// `allocate_reply`.
///
/// The handle must be returned to the worker it came from (via
/// `release_request`) before that worker is destroyed.
pub struct RequestHandle {
    pub(crate) ptr: NonNull<u8>,
    pub(crate) trailer: usize,
}

// Safety: the handle exclusively owns its pool element until released; the
// element is plain memory.
unsafe impl Send for RequestHandle {}

impl RequestHandle {
    fn header(&self) -> &RequestHeader {
        // Safety: the element starts with a RequestHeader, initialized at
        // allocation time.
        unsafe { self.ptr.cast::<RequestHeader>().as_ref() }
    }

    /// Uuid of the peer the reply is addressed to.
    pub fn peer(&self) -> u64 {
        self.header().peer
    }

    /// The reply endpoint the request is bound to.
    pub fn ep(&self) -> EpHandle {
        EpHandle(self.header().ep)
    }

    /// The context-configured trailer bytes after the header.
    pub fn trailer_mut(&mut self) -> &mut [u8] {
        // Safety: the element is elem_size() bytes long, trailer bytes of
        // which follow the header; the handle owns them exclusively.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.ptr.as_ptr().add(core::mem::size_of::<RequestHeader>()),
                self.trailer,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elements_are_cache_line_aligned() {
        let mut pool = RequestPool::new(24).unwrap();
        assert_eq!(pool.elem_size() % CACHE_LINE, 0);
        for _ in 0..4 {
            let elem = pool.get();
            assert_eq!(elem.as_ptr() as usize % CACHE_LINE, 0);
        }
    }

    #[test]
    fn grows_past_the_initial_chunk_and_recycles() {
        let mut pool = RequestPool::new(0).unwrap();
        let mut elems: Vec<_> = (0..GROW_ELEMS + 1).map(|_| pool.get()).collect();
        assert_eq!(pool.chunks.len(), 2);
        let recycled = elems.pop().map(|elem| {
            pool.put(elem);
            elem
        });
        assert_eq!(Some(pool.get()), recycled, "free list must recycle");
        assert_eq!(pool.chunks.len(), 2);
    }

    #[test]
    fn zero_trailer_is_valid() {
        let mut pool = RequestPool::new(0).unwrap();
        let elem = pool.get();
        let mut handle = RequestHandle {
            ptr: elem,
            trailer: 0,
        };
        assert!(handle.trailer_mut().is_empty());
        pool.put(elem);
    }
}
