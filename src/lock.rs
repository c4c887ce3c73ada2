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

//! An optional spinlock-wrapped [`Pool`], for callers who need to share a
//! pool across threads instead of enforcing sole-writer discipline
//! themselves.
//!
//! This wrapper lives strictly outside the core: `Pool`'s own methods
//! never take a lock, and nothing in `pool.rs` knows this type exists.

use core::pin::Pin;

use spin::mutex::SpinMutex;

use crate::backing::BackingSource;
use crate::error::{Error, Result};
use crate::pool::Pool;

/// A [`Pool`] paired with a spinlock, so it can be shared behind a shared
/// reference (e.g. a `static`) instead of requiring external callers to
/// serialize access by some other means.
///
/// Because a [`Pool`] must never move once initialized (its free-list
/// pointers are real addresses taken of its own sentinel array), a
/// `LockedPool` is meant to be placed in its final location — a `static`,
/// or a `Box` that is never relocated — before `init` is called, and left
/// there until `destroy`.
pub struct LockedPool<B: BackingSource> {
	inner: SpinMutex<Pool<B>>,
}

impl<B: BackingSource> LockedPool<B> {
	/// Creates an uninitialized, lockable pool wrapping `backing`.
	pub const fn new(backing: B) -> Self {
		LockedPool {
			inner: SpinMutex::new(Pool::new(backing)),
		}
	}

	/// See [`Pool::init`].
	pub fn init(&self, size: usize) -> Result<()> {
		let mut guard = self.inner.lock();
		// SAFETY: `self` is never moved after this point by contract of
		// this type's construction discipline (documented above), so the
		// pool it wraps is pinned in practice for as long as `self` is.
		let pinned = unsafe { Pin::new_unchecked(&mut *guard) };
		pinned.init(size)
	}

	/// See [`Pool::destroy`].
	pub fn destroy(&self) {
		let mut guard = self.inner.lock();
		let pinned = unsafe { Pin::new_unchecked(&mut *guard) };
		pinned.destroy();
	}

	/// See [`Pool::alloc`].
	pub fn alloc(&self, nbytes: usize) -> Result<core::ptr::NonNull<u8>> {
		let mut guard = self.inner.lock();
		let pinned = unsafe { Pin::new_unchecked(&mut *guard) };
		pinned.alloc(nbytes).ok_or_else(|| crate::error::last_error().unwrap_or(Error::OutOfMemory))
	}

	/// See [`Pool::free`].
	///
	/// # Safety
	/// `payload` must be a pointer previously returned by `alloc` or
	/// `realloc` on this same pool and not already freed.
	pub unsafe fn free(&self, payload: core::ptr::NonNull<u8>) {
		let mut guard = self.inner.lock();
		let pinned = Pin::new_unchecked(&mut *guard);
		pinned.free(payload);
	}

	/// See [`Pool::realloc`].
	///
	/// # Safety
	/// `payload` must be a pointer previously returned by `alloc` or
	/// `realloc` on this same pool and not already freed.
	pub unsafe fn realloc(
		&self,
		payload: core::ptr::NonNull<u8>,
		nbytes: usize,
	) -> Result<core::ptr::NonNull<u8>> {
		let mut guard = self.inner.lock();
		let pinned = Pin::new_unchecked(&mut *guard);
		pinned.realloc(payload, nbytes).ok_or_else(|| crate::error::last_error().unwrap_or(Error::OutOfMemory))
	}
}
