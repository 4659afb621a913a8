// Copyright (c) 2023 Huawei Technologies Co.,Ltd. All rights reserved.
//
// StratoVirt is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Low-level queue interface consumed by the driver.
//!
//! The driver is a consumer of a fixed virtio queue API, not an implementer
//! of ring mechanics. Queue allocation, descriptor-chain enqueue/dequeue,
//! feature negotiation, config-space access and interrupt registration are
//! provided by the platform behind the [`ScsiTransport`] trait.

use std::sync::{Arc, Mutex};

use anyhow::Result;

/// IO vector element which describes one DMA-visible buffer fragment of a
/// descriptor chain.
#[derive(Debug, Clone, Copy)]
pub struct ElemIovec {
    /// Bus address of the fragment.
    pub addr: u64,
    /// Length of the fragment in bytes.
    pub len: u32,
}

/// A completion callback wired to one virtqueue. Runs in the transport's
/// interrupt context and may race with submitter threads.
pub type QueueCallback = Arc<dyn Fn() + Send + Sync>;

/// One virtqueue as seen by the driver.
pub trait VirtQueue: Send {
    /// Post a descriptor chain. `out_iov` holds the device-readable
    /// fragments, `in_iov` the device-writable ones. `token` is returned
    /// verbatim by `dequeue` when the chain completes.
    fn enqueue(&mut self, out_iov: &[ElemIovec], in_iov: &[ElemIovec], token: u64) -> Result<()>;

    /// Non-blocking reap of one completed chain; `None` when the used ring
    /// is empty.
    fn dequeue(&mut self) -> Option<u64>;
}

/// The virtio device the driver is bound to.
pub trait ScsiTransport: Send + Sync {
    /// Offer a feature bitmask; the returned mask is the negotiated subset.
    fn negotiate_features(&self, request: u64) -> u64;

    /// Read `data.len()` bytes of device config space starting at `offset`.
    fn read_device_config(&self, offset: u64, data: &mut [u8]) -> Result<()>;

    /// Write `data` into device config space starting at `offset`.
    fn write_device_config(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Allocate exactly `count` virtqueues, in queue-index order.
    fn alloc_queues(&self, count: usize) -> Result<Vec<Arc<Mutex<dyn VirtQueue>>>>;

    /// Register the device-wide interrupt handler (config changes and other
    /// non-queue interrupts).
    fn register_device_handler(&self, handler: QueueCallback) -> Result<()>;

    /// Register the completion callback for one virtqueue.
    fn register_queue_callback(&self, queue: usize, cb: QueueCallback) -> Result<()>;

    /// Kick the device after enqueueing on `queue`.
    fn notify(&self, queue: usize) -> Result<()>;
}
