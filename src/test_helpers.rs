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

//! In-memory doubles for the transport, bus and topology seams.
//!
//! `MockTransport` emulates the device side of the queue contract: it holds
//! submitted descriptor chains, and its `complete_*`/`inject_*` helpers play
//! the device by writing wire bytes through the chain's input descriptors
//! before posting the completion.

use std::collections::{HashMap, VecDeque};
use std::mem::size_of;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};

use crate::bus::{ScsiBusOps, ScsiCcb};
use crate::byte_code::ByteCode;
use crate::codec::{VirtioScsiCmdResp, VirtioScsiConfig};
use crate::controller::SCSI_CMD_QUEUE;
use crate::event::{TopologyOps, VirtioScsiEvent, SCSI_EVENT_QUEUE};
use crate::transport::{ElemIovec, QueueCallback, ScsiTransport, VirtQueue};

const FAKE_SEG_MAX: u32 = 126;
const FAKE_MAX_TARGET: u16 = 255;

/// One submitted descriptor chain, held until the "device" completes it.
struct Chain {
    in_iov: Vec<ElemIovec>,
    token: u64,
}

#[derive(Default)]
pub struct MockQueue {
    pending: VecDeque<Chain>,
    completed: VecDeque<u64>,
}

impl VirtQueue for MockQueue {
    fn enqueue(&mut self, _out_iov: &[ElemIovec], in_iov: &[ElemIovec], token: u64) -> Result<()> {
        self.pending.push_back(Chain {
            in_iov: in_iov.to_vec(),
            token,
        });
        Ok(())
    }

    fn dequeue(&mut self) -> Option<u64> {
        self.completed.pop_front()
    }
}

impl MockQueue {
    fn in_flight(&self) -> usize {
        self.pending.len() + self.completed.len()
    }

    /// Complete the oldest pending chain, first writing `bytes` through its
    /// leading input descriptor.
    fn complete_front(&mut self, bytes: &[u8]) -> bool {
        let Some(chain) = self.pending.pop_front() else {
            return false;
        };
        let iov = chain.in_iov[0];
        assert!(bytes.len() <= iov.len as usize);
        // SAFETY: the descriptor points into a live buffer owned by the
        // driver side of the test.
        unsafe {
            std::slice::from_raw_parts_mut(iov.addr as *mut u8, bytes.len())
                .copy_from_slice(bytes);
        }
        self.completed.push_back(chain.token);
        true
    }
}

#[derive(Default)]
struct TransportState {
    config: Vec<u8>,
    queues: Vec<Arc<Mutex<MockQueue>>>,
    callbacks: HashMap<usize, QueueCallback>,
    device_handler: Option<QueueCallback>,
    notified: Vec<usize>,
}

pub struct MockTransport {
    state: Mutex<TransportState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        let config = VirtioScsiConfig {
            num_queues: 1,
            seg_max: FAKE_SEG_MAX,
            max_sectors: 0xffff,
            cmd_per_lun: 128,
            event_info_size: size_of::<VirtioScsiEvent>() as u32,
            sense_size: 96,
            cdb_size: 32,
            max_channel: 0,
            max_target: FAKE_MAX_TARGET,
            max_lun: 16383,
        };
        MockTransport {
            state: Mutex::new(TransportState {
                config: config.as_bytes().to_vec(),
                ..Default::default()
            }),
        }
    }
}

impl ScsiTransport for MockTransport {
    fn negotiate_features(&self, requested: u64) -> u64 {
        requested
    }

    fn read_device_config(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        let state = self.state.lock().unwrap();
        let offset = offset as usize;
        data.copy_from_slice(&state.config[offset..offset + data.len()]);
        Ok(())
    }

    fn write_device_config(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let offset = offset as usize;
        state.config[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn alloc_queues(&self, count: usize) -> Result<Vec<Arc<Mutex<dyn VirtQueue>>>> {
        let mut state = self.state.lock().unwrap();
        state.queues = (0..count)
            .map(|_| Arc::new(Mutex::new(MockQueue::default())))
            .collect();
        Ok(state
            .queues
            .iter()
            .map(|q| q.clone() as Arc<Mutex<dyn VirtQueue>>)
            .collect())
    }

    fn register_device_handler(&self, callback: QueueCallback) -> Result<()> {
        self.state.lock().unwrap().device_handler = Some(callback);
        Ok(())
    }

    fn register_queue_callback(&self, queue: usize, callback: QueueCallback) -> Result<()> {
        self.state.lock().unwrap().callbacks.insert(queue, callback);
        Ok(())
    }

    fn notify(&self, queue: usize) -> Result<()> {
        self.state.lock().unwrap().notified.push(queue);
        Ok(())
    }
}

impl MockTransport {
    /// Chains currently owned by the "device" on one queue.
    pub fn in_flight(&self, queue: usize) -> usize {
        let q = self.state.lock().unwrap().queues[queue].clone();
        let in_flight = q.lock().unwrap().in_flight();
        in_flight
    }

    /// Doorbell rings observed for one queue.
    pub fn notify_count(&self, queue: usize) -> usize {
        let state = self.state.lock().unwrap();
        state.notified.iter().filter(|q| **q == queue).count()
    }

    /// Invoke the registered device-level handler, as a transport with no
    /// per-queue interrupt routing would.
    pub fn fire_device_handler(&self) {
        let handler = self.state.lock().unwrap().device_handler.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn config_read_u32(&self, offset: u64) -> u32 {
        let state = self.state.lock().unwrap();
        LittleEndian::read_u32(&state.config[offset as usize..])
    }

    pub fn fake_seg_max(&self) -> u32 {
        FAKE_SEG_MAX
    }

    pub fn fake_max_target(&self) -> u16 {
        FAKE_MAX_TARGET
    }

    fn callback(&self, queue: usize) -> Option<QueueCallback> {
        self.state.lock().unwrap().callbacks.get(&queue).cloned()
    }

    /// Complete the oldest request on the command queue with `resp`, then
    /// fire the registered completion callback.
    pub fn complete_next_command(&self, resp: VirtioScsiCmdResp) {
        let q = self.state.lock().unwrap().queues[SCSI_CMD_QUEUE].clone();
        assert!(q.lock().unwrap().complete_front(resp.as_bytes()));
        if let Some(cb) = self.callback(SCSI_CMD_QUEUE) {
            cb();
        }
    }

    /// Like `complete_next_command`, but from a helper thread that waits
    /// for the request to arrive first; lets the test thread block inside
    /// a synchronous submit.
    pub fn complete_next_command_async(&self, resp: VirtioScsiCmdResp) {
        let q = self.state.lock().unwrap().queues[SCSI_CMD_QUEUE].clone();
        let cb = self.callback(SCSI_CMD_QUEUE);
        thread::spawn(move || {
            loop {
                if q.lock().unwrap().complete_front(resp.as_bytes()) {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            if let Some(cb) = cb {
                cb();
            }
        });
    }

    /// Post one event report into the oldest event buffer. The completion
    /// is left for the caller to collect via the channel's interrupt
    /// handler.
    pub fn inject_event(&self, event: VirtioScsiEvent) {
        let q = self.state.lock().unwrap().queues[SCSI_EVENT_QUEUE].clone();
        assert!(q.lock().unwrap().complete_front(event.as_bytes()));
    }
}

#[derive(Default)]
pub struct MockBusOps {
    done: Mutex<Vec<Arc<Mutex<ScsiCcb>>>>,
    requeued: Mutex<Vec<Arc<Mutex<ScsiCcb>>>>,
}

impl ScsiBusOps for MockBusOps {
    fn done(&self, ccb: Arc<Mutex<ScsiCcb>>) {
        self.done.lock().unwrap().push(ccb);
    }

    fn requeue(&self, ccb: Arc<Mutex<ScsiCcb>>) {
        self.requeued.lock().unwrap().push(ccb);
    }
}

impl MockBusOps {
    pub fn done_count(&self) -> usize {
        self.done.lock().unwrap().len()
    }

    pub fn requeue_count(&self) -> usize {
        self.requeued.lock().unwrap().len()
    }
}

#[derive(Default)]
pub struct MockTopology {
    rescans: Mutex<Vec<(u16, u16)>>,
}

impl TopologyOps for MockTopology {
    fn schedule_rescan(&self, target_id: u16, lun: u16) {
        self.rescans.lock().unwrap().push((target_id, lun));
    }
}

impl MockTopology {
    pub fn rescans(&self) -> Vec<(u16, u16)> {
        self.rescans.lock().unwrap().clone()
    }
}
