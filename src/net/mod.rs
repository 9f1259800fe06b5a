/*
 * SPDX-FileCopyrightText: 2024 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Point-to-point transports, the asynchronous [`Dispatcher`], and
//! synchronous collectives ([`FlowControlChannel`]).
//!
//! A [`Group`] is a numbered set of bidirectional [`Connection`]s, one per
//! peer. Two implementations are provided: an in-process
//! [mesh](make_mesh) of channels and a [TCP full mesh](connect_mesh).

mod group;
pub use group::*;

mod mesh;
pub use mesh::*;

mod tcp;
pub use tcp::*;

mod dispatcher;
pub use dispatcher::*;

mod flow_control;
pub use flow_control::*;
