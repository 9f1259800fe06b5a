/*
 * SPDX-FileCopyrightText: 2024 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The user-facing layer: per-host and per-worker execution contexts, the
//! in-process [`run_local`] launcher, and the [`Dia`] collection handle
//! with its operators (`map`, `filter`, `reduce_by_key`, `reduce_to_index`,
//! `sort`, `all_gather`).

mod context;
pub use context::*;

mod dia;
pub use dia::*;

mod reduce;
pub use reduce::*;

mod sort;
pub use sort::*;
