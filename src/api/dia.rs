/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::Context;
use crate::core::IndexRange;
use crate::data::{File, Item};
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

/// Graph identity of a [`Dia`]: operator label and weak edges to the
/// parents it was derived from. Back edges never own their target; a
/// disposed parent simply disappears from the lineage.
pub struct DiaNode {
    id: usize,
    label: &'static str,
    parents: Vec<Weak<DiaNode>>,
}

impl DiaNode {
    fn new(label: &'static str, parents: Vec<Weak<DiaNode>>) -> Arc<Self> {
        Arc::new(DiaNode {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            label,
            parents,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Labels of the still-alive parents, for diagnostics.
    pub fn parent_labels(&self) -> Vec<&'static str> {
        self.parents
            .iter()
            .filter_map(|parent| parent.upgrade().map(|node| node.label))
            .collect()
    }
}

struct DiaState {
    file: Option<File>,
    /// Reads this handle still serves; the last one consumes the data.
    reads_remaining: usize,
}

/// A distributed immutable array: a handle to the locally materialized
/// slice of a distributed collection, plus its node in the dataflow graph.
///
/// Handles are cheap to clone (clones share the same state and consume
/// counter). By default a collection may be read *once*, and that read
/// consumes the local data block by block; each call to [`keep`](Dia::keep)
/// declares one additional read, served from the shared blocks without
/// freeing them. Reading more often than declared panics.
pub struct Dia<T: Item> {
    ctx: Context,
    node: Arc<DiaNode>,
    state: Arc<Mutex<DiaState>>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Item> Clone for Dia<T> {
    fn clone(&self) -> Self {
        Dia {
            ctx: self.ctx.clone(),
            node: self.node.clone(),
            state: self.state.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Item> Dia<T> {
    /// Wraps a worker's local slice of a collection.
    pub fn from_file(ctx: Context, label: &'static str, file: File) -> Self {
        Dia {
            ctx,
            node: DiaNode::new(label, Vec::new()),
            state: Arc::new(Mutex::new(DiaState {
                file: Some(file),
                reads_remaining: 1,
            })),
            _marker: std::marker::PhantomData,
        }
    }

    /// Materializes the given items as this worker's local slice.
    pub fn from_vec(ctx: Context, items: Vec<T>) -> Result<Self> {
        let mut writer = File::writer(ctx.pool().clone());
        for item in &items {
            writer.put(item)?;
        }
        let file = writer.into_sink()?;
        Ok(Self::from_file(ctx, "from_vec", file))
    }

    /// Generates the distributed collection `[0, total)` mapped through
    /// `generator`; worker `k` materializes the `k`-th proportional range.
    pub fn generate<G: Fn(u64) -> T>(ctx: Context, total: u64, generator: G) -> Result<Self> {
        let range =
            IndexRange::new(0, total).partition(ctx.my_rank(), ctx.num_workers());
        let mut writer = File::writer(ctx.pool().clone());
        for index in range.begin..range.end {
            writer.put(&generator(index))?;
        }
        let file = writer.into_sink()?;
        Ok(Self::from_file(ctx, "generate", file))
    }

    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn node(&self) -> &Arc<DiaNode> {
        &self.node
    }

    /// Declares one additional future read of this collection; data read
    /// that often is cached rather than consumed.
    pub fn keep(&self) -> &Self {
        self.state.lock().unwrap().reads_remaining += 1;
        self
    }

    /// Takes the local file for the next read: the last declared read
    /// consumes it, earlier ones share its blocks.
    pub(crate) fn fetch_file(&self) -> File {
        let mut state = self.state.lock().unwrap();
        if state.file.is_none() {
            panic!(
                "Dia[{}] read after its data was consumed: call keep() before the first read",
                self.node.label
            );
        }
        state.reads_remaining -= 1;
        if state.reads_remaining == 0 {
            state.file.take().unwrap()
        } else {
            state.file.as_ref().unwrap().clone()
        }
    }

    /// Builds a child collection of this node.
    pub(crate) fn derive<U: Item>(&self, label: &'static str, file: File) -> Dia<U> {
        Dia {
            ctx: self.ctx.clone(),
            node: DiaNode::new(label, vec![Arc::downgrade(&self.node)]),
            state: Arc::new(Mutex::new(DiaState {
                file: Some(file),
                reads_remaining: 1,
            })),
            _marker: std::marker::PhantomData,
        }
    }

    /// Number of items of this worker's local slice.
    pub fn local_size(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .file
            .as_ref()
            .map_or(0, File::num_items)
    }

    /// Global number of items; a synchronous collective.
    pub fn size(&self) -> Result<usize> {
        self.ctx
            .flow()
            .all_reduce(self.local_size(), |a, b| a + b)
    }

    /// Element-wise transform.
    pub fn map<U: Item, F: Fn(T) -> U>(&self, map: F) -> Result<Dia<U>> {
        let file = self.fetch_file();
        let mut writer = File::writer(self.ctx.pool().clone());
        let mut reader = file.into_consume_reader();
        while reader.has_next() {
            writer.put(&map(reader.next::<T>()?))?;
        }
        Ok(self.derive("map", writer.into_sink()?))
    }

    /// Element-wise selection.
    pub fn filter<F: Fn(&T) -> bool>(&self, keep_item: F) -> Result<Dia<T>> {
        let file = self.fetch_file();
        let mut writer = File::writer(self.ctx.pool().clone());
        let mut reader = file.into_consume_reader();
        while reader.has_next() {
            let item = reader.next::<T>()?;
            if keep_item(&item) {
                writer.put(&item)?;
            }
        }
        Ok(self.derive("filter", writer.into_sink()?))
    }

    /// Gathers the whole collection, in global item order, on every worker.
    /// Only meant for small results and tests.
    pub fn all_gather(&self) -> Result<Vec<T>> {
        let file = self.fetch_file();
        let stream = self.ctx.new_cat_stream();
        {
            let mut writers = stream.open_writers();
            let mut reader = file.into_consume_reader();
            while reader.has_next() {
                let item = reader.next::<T>()?;
                for writer in writers.iter_mut() {
                    writer.put(&item)?;
                }
            }
            for mut writer in writers {
                writer.close()?;
            }
        }
        let result = stream.open_cat_reader(true).read_complete::<T>();
        stream.close();
        result
    }
}

impl<T: Item> core::fmt::Debug for Dia<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dia")
            .field("node", &self.node.label)
            .field("id", &self.node.id)
            .field("local_size", &self.local_size())
            .finish()
    }
}
