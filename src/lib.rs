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

//! A fixed-arena binary buddy allocator.
//!
//! [`Pool`] carves one power-of-two-sized arena into power-of-two blocks,
//! satisfies allocations by splitting the smallest sufficient free block,
//! and reclaims them by coalescing with same-order buddies. Block headers
//! live inside the arena itself; the only bookkeeping memory outside the
//! arena is the pool's fixed sentinel array.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

mod backing;
mod error;
mod header;
mod lock;
mod order;
mod pool;

pub use backing::BackingSource;
#[cfg(feature = "mmap-backing")]
pub use backing::MmapSource;
pub use error::{clear_last_error, last_error, Error, Result};
pub use lock::LockedPool;
pub use order::{order_of, DEFAULT_K, H, MAX_K, MIN_K, SMALLEST_K};
pub use pool::Pool;
