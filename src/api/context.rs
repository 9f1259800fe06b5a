/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use crate::data::{BlockPool, CatStream, File, MixStream, Multiplexer};
use crate::net::{make_mesh, FlowControlChannel, Group};
use anyhow::Result;
use std::sync::Arc;

/// Block pool quota of [`run_local`] hosts.
const LOCAL_QUOTA: usize = 1 << 30;

/// Block size of [`run_local`] hosts; small, so that tests exercise block
/// boundaries and spills without gigabytes of data.
const LOCAL_BLOCK_SIZE: usize = 64 * 1024;

/// Per-host state shared by its worker threads: the block pool, the stream
/// multiplexer over the host-level data group, and the per-worker flat
/// groups backing the flow-control collectives.
pub struct HostContext {
    pool: Arc<BlockPool>,
    multiplexer: Arc<Multiplexer>,
    flow_groups: Vec<Arc<dyn Group>>,
    workers_per_host: usize,
}

impl HostContext {
    /// `data_group` connects the hosts (`None` for a single host);
    /// `flow_groups` holds one *worker-rank* group per local worker, used
    /// for collectives.
    pub fn new(
        data_group: Option<Arc<dyn Group>>,
        flow_groups: Vec<Arc<dyn Group>>,
        quota: usize,
        default_block_size: usize,
    ) -> Arc<Self> {
        let workers_per_host = flow_groups.len();
        assert!(workers_per_host > 0);
        let pool = BlockPool::new(quota, default_block_size);
        let multiplexer = Multiplexer::new(pool.clone(), data_group, workers_per_host);
        Arc::new(HostContext {
            pool,
            multiplexer,
            flow_groups,
            workers_per_host,
        })
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        &self.pool
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    pub fn workers_per_host(&self) -> usize {
        self.workers_per_host
    }

    /// Tears down the host's dispatcher. Call after all worker threads of
    /// the job have finished.
    pub fn shutdown(&self) {
        self.multiplexer.terminate();
    }
}

/// The per-worker-thread execution context: topology accessors and
/// factories for files, streams and collectives.
#[derive(Clone)]
pub struct Context {
    host: Arc<HostContext>,
    local_worker_id: usize,
    flow: FlowControlChannel,
}

impl Context {
    pub fn new(host: Arc<HostContext>, local_worker_id: usize) -> Self {
        let flow = FlowControlChannel::new(host.flow_groups[local_worker_id].clone());
        Context {
            host,
            local_worker_id,
            flow,
        }
    }

    pub fn num_hosts(&self) -> usize {
        self.host.multiplexer.num_hosts()
    }

    pub fn host_rank(&self) -> usize {
        self.host.multiplexer.my_host_rank()
    }

    pub fn workers_per_host(&self) -> usize {
        self.host.workers_per_host
    }

    pub fn local_worker_id(&self) -> usize {
        self.local_worker_id
    }

    /// Total number of workers of the job.
    pub fn num_workers(&self) -> usize {
        self.num_hosts() * self.workers_per_host()
    }

    /// Global rank of this worker.
    pub fn my_rank(&self) -> usize {
        self.host_rank() * self.workers_per_host() + self.local_worker_id
    }

    pub fn pool(&self) -> &Arc<BlockPool> {
        self.host.pool()
    }

    /// The collectives channel of this worker.
    pub fn flow(&self) -> &FlowControlChannel {
        &self.flow
    }

    pub fn new_file(&self) -> File {
        File::new(self.host.pool().clone())
    }

    /// Creates the next cat stream; every worker must create the streams of
    /// a job in the same order.
    pub fn new_cat_stream(&self) -> CatStream {
        CatStream::new(self.host.multiplexer.clone(), self.local_worker_id)
    }

    /// Creates the next mix stream; same lockstep contract as
    /// [`new_cat_stream`](Context::new_cat_stream).
    pub fn new_mix_stream(&self) -> MixStream {
        MixStream::new(self.host.multiplexer.clone(), self.local_worker_id)
    }
}

/// Runs `worker` on `num_hosts × workers_per_host` threads over the
/// in-process mesh transport, one [`Context`] each, and propagates the
/// first failure.
pub fn run_local<F>(num_hosts: usize, workers_per_host: usize, worker: F) -> Result<()>
where
    F: Fn(Context) -> Result<()> + Send + Sync,
{
    let num_workers = num_hosts * workers_per_host;
    log::debug!(
        "run_local: {} hosts x {} workers",
        num_hosts,
        workers_per_host
    );

    let data_groups: Vec<Option<Arc<dyn Group>>> = if num_hosts > 1 {
        make_mesh(num_hosts)
            .into_iter()
            .map(|group| -> Option<Arc<dyn Group>> { Some(group) })
            .collect()
    } else {
        vec![None]
    };
    let mut flow_groups: Vec<Arc<dyn Group>> = make_mesh(num_workers)
        .into_iter()
        .map(|group| -> Arc<dyn Group> { group })
        .collect();

    let hosts: Vec<Arc<HostContext>> = data_groups
        .into_iter()
        .map(|data_group| {
            let host_flow = flow_groups.drain(..workers_per_host).collect();
            HostContext::new(data_group, host_flow, LOCAL_QUOTA, LOCAL_BLOCK_SIZE)
        })
        .collect();

    let result = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for host in &hosts {
            for local_worker_id in 0..workers_per_host {
                let host = host.clone();
                let worker = &worker;
                handles.push(
                    std::thread::Builder::new()
                        .name(format!(
                            "worker-{}",
                            host.multiplexer().my_host_rank() * workers_per_host
                                + local_worker_id
                        ))
                        .spawn_scoped(scope, move || {
                            worker(Context::new(host, local_worker_id))
                        })
                        .unwrap(),
                );
            }
        }
        let mut result = Ok(());
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    if result.is_ok() {
                        result = Err(error);
                    }
                }
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        result
    });

    for host in &hosts {
        host.shutdown();
    }
    result
}

/// Runs a test body over a spread of topologies covering one worker, one
/// host with several workers, several hosts with several workers, and
/// several single-worker hosts.
pub fn run_local_tests<F>(worker: F) -> Result<()>
where
    F: Fn(Context) -> Result<()> + Send + Sync,
{
    for (num_hosts, workers_per_host) in [(1, 1), (1, 3), (2, 2), (4, 1)] {
        log::info!(
            "run_local_tests: topology {} x {}",
            num_hosts,
            workers_per_host
        );
        run_local(num_hosts, workers_per_host, &worker)?;
    }
    Ok(())
}
