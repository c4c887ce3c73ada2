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

//! The recoverable error taxonomy and the process-wide error indicator.
//!
//! Fatal conditions (failure to acquire or release the backing arena) are
//! not represented here; the core panics for those, since there is no
//! sensible recovery once the backing source itself is broken.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

const NONE: u8 = 0;
const OUT_OF_MEMORY: u8 = 1;
const INVALID_ARGUMENT: u8 = 2;

static LAST_ERROR: AtomicU8 = AtomicU8::new(NONE);

/// A recoverable allocator error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Error {
	/// No free block large enough exists, even after coalescing.
	OutOfMemory = OUT_OF_MEMORY,
	/// A null pool/payload, or a zero-byte allocation request.
	InvalidArgument = INVALID_ARGUMENT,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let message = match self {
			Error::OutOfMemory => "no free block of sufficient order is available",
			Error::InvalidArgument => "invalid argument to allocator operation",
		};
		f.write_str(message)
	}
}

impl core::error::Error for Error {}

pub(crate) fn set_error(error: Error) {
	LAST_ERROR.store(error as u8, Ordering::Relaxed);
}

pub(crate) fn clear_error() {
	LAST_ERROR.store(NONE, Ordering::Relaxed);
}

/// Returns the most recently reported error on this process, if any.
///
/// Every recoverable-failing call sets this; every successful call clears
/// it. Mirrors the Unix `errno` convention the spec this crate implements
/// mandates for behavioral compatibility with callers that poll it instead
/// of consuming a typed `Result`.
pub fn last_error() -> Option<Error> {
	match LAST_ERROR.load(Ordering::Relaxed) {
		OUT_OF_MEMORY => Some(Error::OutOfMemory),
		INVALID_ARGUMENT => Some(Error::InvalidArgument),
		_ => None,
	}
}

/// Resets the process-wide error indicator to "no error".
pub fn clear_last_error() {
	clear_error();
}
