/*
 * SPDX-FileCopyrightText: 2024 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The block data plane and the multi-way exchange layer.
//!
//! Items of arbitrary serializable types ([`Item`]) are appended by
//! [`BlockWriter`]s into reference-counted [`Block`]s allocated from a
//! quota-accounted [`BlockPool`], flow through [`File`]s, [`BlockQueue`]s
//! and all-to-all [`CatStream`]s/[`MixStream`]s, and are read back by
//! [`BlockReader`]s that reassemble items straddling block boundaries.

mod block;
pub use block::*;

mod block_pool;
pub use block_pool::*;

mod serialization;
pub use serialization::*;

mod writer;
pub use writer::*;

mod reader;
pub use reader::*;

mod file;
pub use file::*;

mod block_queue;
pub use block_queue::*;

mod mix_queue;
pub use mix_queue::*;

mod stream;
pub use stream::*;

mod multiplexer;
pub use multiplexer::*;

mod cat_stream;
pub use cat_stream::*;

mod mix_stream;
pub use mix_stream::*;
