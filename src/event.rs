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

//! Asynchronous topology notifications.
//!
//! The channel owns a fixed pool of recyclable event buffers, all submitted
//! into the event queue. Each completion is decoded, dispatched and the
//! buffer resubmitted before the callback returns, so the pipeline stays at
//! its full depth except during the decode window. Events carry no waiting
//! caller; the pipeline is continuously replenished, never serialized like
//! the command path.

use std::ptr::read_volatile;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::byte_code::ByteCode;
use crate::codec::parse_lun_addr;
use crate::transport::{ElemIovec, ScsiTransport, VirtQueue};
use crate::{
    VIRTIO_SCSI_T_ASYNC_NOTIFY, VIRTIO_SCSI_T_EVENTS_MISSED, VIRTIO_SCSI_T_PARAM_CHANGE,
    VIRTIO_SCSI_T_TRANSPORT_RESET,
};

/// Depth of the event pipeline.
pub const EVENT_BUFFER_COUNT: usize = 4;

/// The event queue index within the controller's queue set.
pub const SCSI_EVENT_QUEUE: usize = 1;

/// Reason value of a PARAM_CHANGE event when the capacity data of a LUN
/// changed: additional sense code 0x2a, qualifier 0x09.
pub const VIRTIO_SCSI_EVT_REASON_CAPACITY_CHANGED: u32 = 0x2a | (0x09 << 8);

/// Event report written by the device into one event buffer.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VirtioScsiEvent {
    pub event: u32,
    pub lun: [u8; 8],
    pub reason: u32,
}

impl ByteCode for VirtioScsiEvent {}

/// Device-framework hook for topology changes. The implementor performs the
/// rescan asynchronously, decoupled from the interrupt context that
/// triggered it.
pub trait TopologyOps: Send + Sync {
    /// Request a deferred re-enumeration of one logical unit's subtree.
    fn schedule_rescan(&self, target_id: u16, lun: u16);
}

pub struct EventChannel {
    queue: Arc<Mutex<dyn VirtQueue>>,
    transport: Arc<dyn ScsiTransport>,
    topology: Arc<dyn TopologyOps>,
    /// Recyclable buffers; boxed so their device-visible addresses stay
    /// stable for the channel's lifetime.
    buffers: Vec<Box<VirtioScsiEvent>>,
}

impl EventChannel {
    pub fn new(
        queue: Arc<Mutex<dyn VirtQueue>>,
        transport: Arc<dyn ScsiTransport>,
        topology: Arc<dyn TopologyOps>,
    ) -> Self {
        let buffers = (0..EVENT_BUFFER_COUNT)
            .map(|_| Box::new(VirtioScsiEvent::default()))
            .collect();
        EventChannel {
            queue,
            transport,
            topology,
            buffers,
        }
    }

    /// Submit every buffer into the event queue; done once at attach time.
    pub fn submit_all(&self) -> Result<()> {
        for index in 0..self.buffers.len() {
            self.submit(index)
                .with_context(|| format!("Failed to submit event buffer {}", index))?;
        }
        self.transport.notify(SCSI_EVENT_QUEUE)
    }

    /// Resubmit one buffer; its content is irrelevant once decoded. The
    /// buffer index doubles as the completion token.
    fn submit(&self, index: usize) -> Result<()> {
        let in_iov = [ElemIovec {
            addr: &*self.buffers[index] as *const VirtioScsiEvent as u64,
            len: std::mem::size_of::<VirtioScsiEvent>() as u32,
        }];
        self.queue
            .lock()
            .unwrap()
            .enqueue(&[], &in_iov, index as u64)
    }

    /// Event-queue completion callback: drain, decode, dispatch, resubmit.
    pub fn handle_event_interrupt(&self) {
        loop {
            let token = self.queue.lock().unwrap().dequeue();
            let Some(token) = token else {
                break;
            };
            let index = token as usize;
            if index >= self.buffers.len() {
                warn!("Dropping event completion with bogus token {}", token);
                continue;
            }

            // SAFETY: the buffer is boxed, alive, and was written by the
            // device before the completion was posted.
            let event = unsafe { read_volatile(&*self.buffers[index]) };
            self.dispatch(&event);

            if let Err(e) = self
                .submit(index)
                .and_then(|_| self.transport.notify(SCSI_EVENT_QUEUE))
            {
                warn!("Failed to resubmit event buffer {}: {:?}", index, e);
            }
        }
    }

    fn dispatch(&self, event: &VirtioScsiEvent) {
        let event_type = event.event;
        let reason = event.reason;

        if event_type & VIRTIO_SCSI_T_EVENTS_MISSED != 0 {
            warn!("The device dropped scsi events; topology may be stale");
            return;
        }

        match event_type {
            VIRTIO_SCSI_T_TRANSPORT_RESET => {
                info!("Scsi transport reset reported, reason {}", reason);
            }
            VIRTIO_SCSI_T_ASYNC_NOTIFY => {
                info!("Scsi asynchronous notification, reason {}", reason);
            }
            VIRTIO_SCSI_T_PARAM_CHANGE => {
                let (target_id, lun) = parse_lun_addr(event.lun);
                if reason == VIRTIO_SCSI_EVT_REASON_CAPACITY_CHANGED {
                    info!(
                        "Capacity data changed for target {} lun {}, scheduling rescan",
                        target_id, lun
                    );
                    self.topology.schedule_rescan(target_id, lun);
                } else {
                    info!(
                        "Parameter change for target {} lun {}, reason 0x{:x}",
                        target_id, lun, reason
                    );
                }
            }
            _ => {
                warn!("Unrecognized scsi event type 0x{:x}", event_type);
            }
        }
    }
}
