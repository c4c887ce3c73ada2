/*
 * This file is part of Anillo OS
 * Copyright (C) 2023 Anillo OS Developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Lesser General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU Lesser General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The buddy pool: the allocator's core state machine.

use core::marker::PhantomPinned;
use core::mem::MaybeUninit;
use core::pin::Pin;
use core::ptr::NonNull;

use crate::backing::BackingSource;
use crate::error::{self, Error};
use crate::header::{self, Header, Tag};
use crate::order::{order_for_payload, DEFAULT_K, H, MAX_K, MIN_K};

/// A fixed-arena binary buddy allocator.
///
/// A `Pool` must be placed in its final memory location before [`init`] is
/// called and must not move until after [`destroy`] — its free lists
/// contain real addresses taken of the pool's own `avail` array, and
/// moving the pool would leave those addresses dangling. Callers express
/// this with [`Pin`].
///
/// [`init`]: Pool::init
/// [`destroy`]: Pool::destroy
pub struct Pool<B: BackingSource> {
	base: Option<NonNull<u8>>,
	kval_m: usize,
	avail: [MaybeUninit<Header>; MAX_K],
	backing: B,
	_pin: PhantomPinned,
}

// SAFETY: a `Pool` owns its arena outright and is only ever mutated
// through `&mut`/`Pin<&mut _>`; it carries no thread-local state. Sharing
// it across threads still requires external serialization (see
// `crate::lock::LockedPool`), which is a `Sync` concern for the wrapper,
// not this type.
unsafe impl<B: BackingSource + Send> Send for Pool<B> {}

impl<B: BackingSource> Pool<B> {
	/// Creates an uninitialized pool that will acquire its arena from
	/// `backing` once [`init`](Pool::init) is called.
	pub const fn new(backing: B) -> Self {
		Pool {
			base: None,
			kval_m: 0,
			avail: [const { MaybeUninit::uninit() }; MAX_K],
			backing,
			_pin: PhantomPinned,
		}
	}

	/// Acquires an arena of the smallest power-of-two size covering `size`
	/// bytes (clamped to `[2^MIN_K, 2^(MAX_K-1)]`), or `DEFAULT_K` bytes if
	/// `size == 0`, and seeds it as one whole-arena free block.
	///
	/// # Panics
	/// Panics if the backing source fails to supply the arena; there is no
	/// recoverable path once the backing allocator itself is broken.
	pub fn init(self: Pin<&mut Self>, size: usize) -> crate::Result<()> {
		// SAFETY: we never move `*self` out from under the pin; we only
		// write through its fields, which is exactly what pinning a
		// self-referential struct permits.
		let this = unsafe { self.get_unchecked_mut() };
		this.init_impl(size)
	}

	/// Releases the arena back to the backing source and resets the pool
	/// so it may be reused by a later `init` call.
	pub fn destroy(self: Pin<&mut Self>) {
		let this = unsafe { self.get_unchecked_mut() };
		this.destroy_impl();
	}

	/// Allocates `nbytes` of payload, returning the smallest sufficient
	/// block found by scanning free lists upward from the required order.
	pub fn alloc(self: Pin<&mut Self>, nbytes: usize) -> Option<NonNull<u8>> {
		let this = unsafe { self.get_unchecked_mut() };
		this.alloc_impl(nbytes)
	}

	/// Returns `payload` to the pool, coalescing with free buddies as far
	/// as possible.
	///
	/// # Safety
	/// `payload` must have been returned by `alloc` or `realloc` on this
	/// same pool and must not already have been freed.
	pub unsafe fn free(self: Pin<&mut Self>, payload: NonNull<u8>) {
		let this = self.get_unchecked_mut();
		this.free_impl(payload);
	}

	/// Resizes the block backing `payload` to hold `nbytes`, growing or
	/// shrinking in place when possible and falling back to
	/// allocate-copy-free otherwise.
	///
	/// # Safety
	/// `payload` must have been returned by `alloc` or `realloc` on this
	/// same pool and must not already have been freed.
	pub unsafe fn realloc(self: Pin<&mut Self>, payload: NonNull<u8>, nbytes: usize) -> Option<NonNull<u8>> {
		let this = self.get_unchecked_mut();
		this.realloc_impl(payload, nbytes)
	}

	/// The order of the whole arena, or `None` if the pool is not
	/// currently initialized.
	pub fn arena_order(&self) -> Option<usize> {
		self.base.map(|_| self.kval_m)
	}

	fn base_addr(&self) -> usize {
		self.base.expect("pool is not initialized").as_ptr() as usize
	}

	fn avail_ptr(&mut self, order: usize) -> *mut Header {
		self.avail[order].as_mut_ptr()
	}

	fn init_impl(&mut self, size: usize) -> crate::Result<()> {
		let kval_m = if size == 0 {
			DEFAULT_K
		} else {
			crate::order::order_of(size).clamp(MIN_K, MAX_K - 1)
		};

		let length = 1usize << kval_m;
		let base = match self.backing.map(length) {
			Ok(base) => base,
			Err(_) => {
				log::error!("fatal: failed to acquire a {length}-byte arena");
				panic!("buddy_pool: failed to acquire backing arena");
			}
		};

		self.base = Some(base);
		self.kval_m = kval_m;

		for order in 0..=kval_m {
			// SAFETY: `order` is in range for `avail`, and the slot is not
			// currently aliased by anyone else.
			unsafe { Header::init_sentinel(self.avail[order].as_mut_ptr(), order as u8) };
		}

		// SAFETY: `base` was just acquired fresh from the backing source
		// and is valid for `length` bytes; writing the whole-arena header
		// at its very start is in bounds.
		unsafe {
			let block_ptr = base.as_ptr() as *mut Header;
			block_ptr.write(Header {
				tag: Tag::Free,
				order: kval_m as u8,
				next: block_ptr,
				prev: block_ptr,
			});
			header::push_front(self.avail_ptr(kval_m), block_ptr);
		}

		log::debug!("init: arena order {kval_m} ({length} bytes)");
		error::clear_error();
		Ok(())
	}

	fn destroy_impl(&mut self) {
		if let Some(base) = self.base.take() {
			let length = 1usize << self.kval_m;
			// SAFETY: `base`/`length` are exactly the pair this pool
			// received from `map` during `init`.
			unsafe { self.backing.unmap(base, length) };
			log::debug!("destroy: released {length}-byte arena");
		}
		self.kval_m = 0;
		self.avail = [const { MaybeUninit::uninit() }; MAX_K];
	}

	fn alloc_impl(&mut self, nbytes: usize) -> Option<NonNull<u8>> {
		if nbytes == 0 {
			error::set_error(Error::InvalidArgument);
			log::debug!("alloc: rejected a zero-byte request");
			return None;
		}

		let want = order_for_payload(nbytes);
		if want > self.kval_m {
			error::set_error(Error::OutOfMemory);
			log::debug!("alloc: order {want} exceeds arena order {}", self.kval_m);
			return None;
		}

		// R1: scan upward for the smallest non-empty free list.
		let mut found = None;
		for order in want..=self.kval_m {
			// SAFETY: `order` is in range and the sentinel was initialized
			// by `init`.
			if unsafe { header::front(self.avail_ptr(order)) }.is_some() {
				found = Some(order);
				break;
			}
		}

		let Some(mut order) = found else {
			error::set_error(Error::OutOfMemory);
			log::debug!("alloc: no free block of order >= {want}");
			return None;
		};

		// R2: detach the head and reserve it.
		// SAFETY: `order` was just confirmed non-empty above.
		let block_ptr = unsafe { header::front(self.avail_ptr(order)).unwrap().as_ptr() };
		unsafe {
			header::unlink(block_ptr);
			(*block_ptr).tag = Tag::Reserved;
		}

		// R3/R4: split down to the target order, publishing each right half.
		while order > want {
			order -= 1;
			// SAFETY: `block_ptr` is at least `1 << (order + 1)` bytes
			// long, so its right half at `+ (1 << order)` is fully inside
			// the block and does not overlap the left half.
			unsafe {
				let right_ptr = (block_ptr as *mut u8).add(1usize << order) as *mut Header;
				right_ptr.write(Header {
					tag: Tag::Free,
					order: order as u8,
					next: right_ptr,
					prev: right_ptr,
				});
				header::push_front(self.avail_ptr(order), right_ptr);
			}
		}

		// SAFETY: `block_ptr` is a live header we just reserved above.
		unsafe { (*block_ptr).order = want as u8 };

		log::trace!("alloc: order {want} block at offset {}", block_ptr as usize - self.base_addr());
		error::clear_error();

		// SAFETY: `block_ptr` is a valid header at least `H` bytes long;
		// its payload starts immediately after it.
		let payload = unsafe { (block_ptr as *mut u8).add(H) };
		Some(unsafe { NonNull::new_unchecked(payload) })
	}

	/// Recovers the block address of `buddy_ptr` relative to `block_ptr`
	/// at `order`, the XOR identity from SPEC_FULL.md §4.1.
	fn buddy_of(&self, block_ptr: *mut Header, order: usize) -> *mut Header {
		let base = self.base_addr();
		let offset = block_ptr as usize - base;
		let buddy_offset = offset ^ (1usize << order);
		(base + buddy_offset) as *mut Header
	}

	unsafe fn free_impl(&mut self, payload: NonNull<u8>) {
		// SAFETY: the header sits exactly `H` bytes before the payload the
		// caller handed back to us, per the contract of `alloc`/`realloc`.
		let mut block_ptr = (payload.as_ptr() as usize - H) as *mut Header;
		debug_assert_eq!((*block_ptr).tag, Tag::Reserved, "free: block was not reserved");

		loop {
			let order = (*block_ptr).order as usize;
			if order == self.kval_m {
				// the whole-arena block has no buddy.
				break;
			}

			let buddy_ptr = self.buddy_of(block_ptr, order);
			match (*buddy_ptr).tag {
				Tag::Reserved => break,
				Tag::Free if (*buddy_ptr).order as usize != order => break,
				Tag::Free => {
					header::unlink(buddy_ptr);
					if (buddy_ptr as usize) < (block_ptr as usize) {
						block_ptr = buddy_ptr;
					}
					(*block_ptr).order = (order + 1) as u8;
				}
				Tag::UnusedSentinel => {
					unreachable!("an in-bounds buddy address must house a live block header")
				}
			}
		}

		(*block_ptr).tag = Tag::Free;
		let order = (*block_ptr).order as usize;
		header::push_front(self.avail_ptr(order), block_ptr);

		log::trace!("free: order {order} block at offset {}", block_ptr as usize - self.base_addr());
		error::clear_error();
	}

	unsafe fn realloc_impl(&mut self, payload: NonNull<u8>, nbytes: usize) -> Option<NonNull<u8>> {
		if nbytes == 0 {
			self.free_impl(payload);
			return None;
		}

		let block_ptr = (payload.as_ptr() as usize - H) as *mut Header;
		let cur = (*block_ptr).order as usize;
		let want = order_for_payload(nbytes);

		if cur == want {
			error::clear_error();
			return Some(payload);
		}

		if cur > want {
			let mut order = cur;
			while order > want {
				order -= 1;
				let right_ptr = (block_ptr as *mut u8).add(1usize << order) as *mut Header;
				right_ptr.write(Header {
					tag: Tag::Free,
					order: order as u8,
					next: right_ptr,
					prev: right_ptr,
				});
				header::push_front(self.avail_ptr(order), right_ptr);
			}
			(*block_ptr).order = want as u8;
			log::trace!("realloc: shrank block to order {want}");
			error::clear_error();
			return Some(payload);
		}

		// Grow. The source this crate is descended from coalesces greedily
		// and, on a short chain, falls through to allocate-copy-free
		// having already mutated the pool, and also gets confused about
		// which direction it just grew in (see SPEC_FULL.md §9). Neither
		// is acceptable here: realloc must be strongly failure-atomic, so
		// the right-hand-buddy chain is checked in a dry run before
		// anything is unlinked. Only a chain that reaches `want` commits;
		// otherwise the block is left completely untouched and the
		// allocate-copy-free fallback starts from a pristine state.
		let mut probe_order = cur;
		let chain_reaches_target = loop {
			if probe_order == want {
				break true;
			}
			if probe_order >= self.kval_m {
				break false;
			}

			let buddy_ptr = self.buddy_of(block_ptr, probe_order);
			if (buddy_ptr as usize) <= (block_ptr as usize) {
				// only a right-hand buddy may be absorbed: absorbing one
				// to the left would move the payload pointer.
				break false;
			}
			if (*buddy_ptr).tag != Tag::Free || (*buddy_ptr).order as usize != probe_order {
				break false;
			}

			probe_order += 1;
		};

		if chain_reaches_target {
			let mut order = cur;
			while order < want {
				let buddy_ptr = self.buddy_of(block_ptr, order);
				header::unlink(buddy_ptr);
				order += 1;
			}
			(*block_ptr).order = want as u8;
			log::trace!("realloc: grew block in place to order {want}");
			error::clear_error();
			return Some(payload);
		}

		let new_payload = match self.alloc_impl(nbytes) {
			Some(p) => p,
			None => {
				error::set_error(Error::OutOfMemory);
				log::debug!("realloc: allocate-copy-free fallback failed for order {want}");
				return None;
			}
		};

		let old_payload_len = (1usize << cur) - H;
		core::ptr::copy_nonoverlapping(payload.as_ptr(), new_payload.as_ptr(), old_payload_len);
		self.free_impl(payload);

		log::trace!("realloc: grew by allocate-copy-free to order {want}");
		error::clear_error();
		Some(new_payload)
	}
}

impl<B: BackingSource> Drop for Pool<B> {
	fn drop(&mut self) {
		self.destroy_impl();
	}
}

#[cfg(all(test, feature = "mmap-backing"))]
mod tests {
	use super::*;
	use crate::backing::MmapSource;
	use core::pin::pin;
	use std::vec::Vec;

	fn offset_of<B: BackingSource>(pool: &Pool<B>, payload: NonNull<u8>) -> usize {
		payload.as_ptr() as usize - H - pool.base_addr()
	}

	#[test]
	fn s1_init_and_full_allocate() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(0).expect("init should succeed");
		assert_eq!(pool.arena_order(), Some(DEFAULT_K));

		let payload = pool.as_mut().alloc(1).expect("alloc should succeed");
		assert_eq!(offset_of(&pool, payload), 0);

		for order in MIN_K..DEFAULT_K {
			assert!(unsafe { header::front(pool.avail_ptr(order)) }.is_some(), "order {order} should hold a right half");
		}

		unsafe { pool.as_mut().free(payload) };
		assert!(unsafe { header::front(pool.avail_ptr(DEFAULT_K)) }.is_some());
		for order in MIN_K..DEFAULT_K {
			assert!(unsafe { header::front(pool.avail_ptr(order)) }.is_none());
		}
	}

	#[test]
	fn s2_fill_and_refuse() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(1 << 10).expect("init should succeed");
		assert_eq!(pool.arena_order(), Some(10));

		let payload_len = (1usize << 7) - H;
		let mut payloads = alloc_vec();
		for _ in 0..8 {
			let p = pool.as_mut().alloc(payload_len).expect("alloc should succeed within capacity");
			payloads.push(p);
		}

		assert!(pool.as_mut().alloc(payload_len).is_none());
		assert_eq!(crate::last_error(), Some(Error::OutOfMemory));
	}

	#[test]
	fn s3_buddy_coalescing() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(1 << 10).expect("init should succeed");

		let a = pool.as_mut().alloc(1).expect("alloc a");
		let b = pool.as_mut().alloc(1).expect("alloc b");

		unsafe { pool.as_mut().free(a) };
		assert!(unsafe { header::front(pool.avail_ptr(MIN_K)) }.is_some());

		unsafe { pool.as_mut().free(b) };
		assert!(unsafe { header::front(pool.avail_ptr(10)) }.is_some());
		for order in 0..10 {
			assert!(unsafe { header::front(pool.avail_ptr(order)) }.is_none());
		}
	}

	#[test]
	fn s4_left_right_split_policy() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(1 << 10).expect("init should succeed");

		let payload = pool.as_mut().alloc((1usize << 7) - H).expect("alloc should succeed");
		assert_eq!(offset_of(&pool, payload), 0);

		for (order, expected_offset) in [(9usize, 512usize), (8, 256), (7, 128)] {
			let head = unsafe { header::front(pool.avail_ptr(order)) }.expect("order should hold exactly one right half");
			let head_offset = head.as_ptr() as usize - pool.base_addr();
			assert_eq!(head_offset, expected_offset);
			unsafe { assert_eq!((*head.as_ptr()).next, pool.avail_ptr(order)) };
		}
	}

	#[test]
	fn s5_realloc_grow_in_place() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(1 << 12).expect("init should succeed");

		let first = pool.as_mut().alloc(1).expect("alloc first");
		let second = pool.as_mut().alloc(1).expect("alloc second");
		unsafe { pool.as_mut().free(second) };

		let grown_len = (1usize << MIN_K) - H + 1;
		let grown = unsafe { pool.as_mut().realloc(first, grown_len) }.expect("realloc should grow in place");
		assert_eq!(grown, first);
		assert!(unsafe { header::front(pool.avail_ptr(MIN_K)) }.is_none());

		unsafe { pool.as_mut().free(grown) };
	}

	#[test]
	fn s6_realloc_grow_by_copy() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(1 << 12).expect("init should succeed");

		let first = pool.as_mut().alloc(1).expect("alloc first");
		let _second = pool.as_mut().alloc(1).expect("alloc second");
		let _third = pool.as_mut().alloc(1).expect("alloc third");

		let grown_len = (1usize << MIN_K) - H + 1;
		let grown = unsafe { pool.as_mut().realloc(first, grown_len) }.expect("realloc should fall back to copy");
		assert_ne!(grown, first);

		unsafe { pool.as_mut().free(grown) };
	}

	#[test]
	fn property_buddy_involution() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(1 << 12).expect("init should succeed");

		let a = pool.as_mut().alloc(1).expect("alloc a");
		let block_ptr = (a.as_ptr() as usize - H) as *mut Header;
		let order = unsafe { (*block_ptr).order as usize };

		let buddy = pool.buddy_of(block_ptr, order);
		let back = pool.buddy_of(buddy, order);
		assert_eq!(back, block_ptr);

		unsafe { pool.as_mut().free(a) };
	}

	#[test]
	fn property_alignment() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(1 << 12).expect("init should succeed");

		let mut payloads = alloc_vec();
		for n in [1, 7, 63, 200, 1000] {
			if let Some(p) = pool.as_mut().alloc(n) {
				let block_ptr = (p.as_ptr() as usize - H) as *mut Header;
				let order = unsafe { (*block_ptr).order as usize };
				let offset = p.as_ptr() as usize - H - pool.base_addr();
				assert_eq!(offset % (1usize << order), 0);
				payloads.push(p);
			}
		}
		for p in payloads {
			unsafe { pool.as_mut().free(p) };
		}
	}

	#[test]
	fn property_capacity() {
		let mut pool = pin!(Pool::new(MmapSource));
		let kval_m = 12;
		pool.as_mut().init(1 << kval_m).expect("init should succeed");

		let exact = (1usize << kval_m) - H;
		let p = pool.as_mut().alloc(exact).expect("exact-fit allocation should succeed");
		unsafe { pool.as_mut().free(p) };

		assert!(pool.as_mut().alloc(exact + 1).is_none());
		assert_eq!(crate::last_error(), Some(Error::OutOfMemory));
	}

	#[test]
	fn property_idempotent_resize() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(1 << 12).expect("init should succeed");

		let p = pool.as_mut().alloc(10).expect("alloc should succeed");
		let same = unsafe { pool.as_mut().realloc(p, 11) }.expect("realloc within the same order should succeed");
		assert_eq!(p, same);

		unsafe { pool.as_mut().free(same) };
	}

	#[test]
	fn property_content_preservation() {
		let mut pool = pin!(Pool::new(MmapSource));
		pool.as_mut().init(1 << 12).expect("init should succeed");

		let first = pool.as_mut().alloc(1).expect("alloc first");
		let _second = pool.as_mut().alloc(1).expect("alloc second");
		let _third = pool.as_mut().alloc(1).expect("alloc third");

		unsafe {
			core::ptr::write_bytes(first.as_ptr(), 0x42, (1usize << MIN_K) - H);
		}

		let grown_len = (1usize << MIN_K) - H + 1;
		let grown = unsafe { pool.as_mut().realloc(first, grown_len) }.expect("realloc should succeed");

		let preserved = unsafe { core::slice::from_raw_parts(grown.as_ptr(), (1usize << MIN_K) - H) };
		assert!(preserved.iter().all(|&b| b == 0x42));

		unsafe { pool.as_mut().free(grown) };
	}

	extern crate alloc;

	fn alloc_vec() -> alloc::vec::Vec<NonNull<u8>> {
		alloc::vec::Vec::new()
	}
}
