/*
 * SPDX-FileCopyrightText: 2024 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The external-memory layer: block identifiers ([`Bid`]), per-disk
//! free-space management ([`DiskAllocator`]), an asynchronous disk request
//! pool ([`IoPool`]), and page-aligned [`TypedBlock`]s of POD items.

mod bid;
pub use bid::*;

mod disk_allocator;
pub use disk_allocator::*;

mod request;
pub use request::*;

mod typed_block;
pub use typed_block::*;
