/*
 * SPDX-FileCopyrightText: 2024 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Low-level memory facilities: aligned raw buffers and the process-wide
//! arena [`Pool`] for small control-plane allocations.

mod aligned;
pub use aligned::*;

mod pool;
pub use pool::*;
