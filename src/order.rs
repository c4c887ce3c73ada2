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

//! Byte-size <-> order conversions.
//!
//! An order `k` denotes a block of size `1 << k` bytes. All arithmetic here
//! is in bytes, unlike the page-count-indexed order arithmetic elsewhere in
//! this codebase's ancestry; this allocator has no notion of a page.

use crate::header::Header;

/// Smallest permitted order: a 64-byte block, enough to hold a [`Header`]
/// with room to spare on every supported target.
pub const MIN_K: usize = 6;

/// Largest permitted order. An arena this large will never actually be
/// requested in practice, but it bounds the fixed sentinel array.
pub const MAX_K: usize = 48;

/// Order used by `init` when the caller asks for a zero-sized arena.
pub const DEFAULT_K: usize = 30;

/// Alias kept for readers of the source this allocator is descended from,
/// where `SMALLEST_K` and `MIN_K` name the same constant.
pub const SMALLEST_K: usize = MIN_K;

/// Size in bytes of the embedded block header. Every block's usable
/// payload capacity is `(1 << order) - H`.
pub const H: usize = core::mem::size_of::<Header>();

static_assertions::const_assert!(MIN_K < MAX_K);
static_assertions::const_assert!(DEFAULT_K >= MIN_K && DEFAULT_K < MAX_K);
static_assertions::const_assert!((1usize << MIN_K) > H);

/// Returns the smallest `k` such that `1 << k >= bytes`.
///
/// Defined only for `bytes >= 1`; the source this is descended from
/// underflows computing `order_of(0)`, and this reimplementation instead
/// makes the precondition explicit and asserts it in debug builds rather
/// than silently wrapping.
pub fn order_of(bytes: usize) -> usize {
	debug_assert!(bytes >= 1, "order_of is undefined for zero bytes");
	(usize::BITS - (bytes - 1).leading_zeros()) as usize
}

/// The order needed to satisfy a payload request of `payload_bytes`,
/// clamped up to `MIN_K`.
pub(crate) fn order_for_payload(payload_bytes: usize) -> usize {
	core::cmp::max(MIN_K, order_of(payload_bytes + H))
}
