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

//! # Virtio Scsi Driver
//!
//! The host-bus-adapter half of a virtio-scsi driver. It bridges a generic
//! SCSI bus-management layer to a virtio queue transport.
//!
//! ## Design
//!
//! This crate offers support for:
//! 1. Wire encoding of SCSI commands and responses over virtio descriptor
//!    chains, and translation of virtio-scsi response codes into the SCSI
//!    status taxonomy.
//! 2. A depth-1 command pipeline: one reusable command slot, admission by
//!    try-acquire, completion correlated through a monotonic tag.
//! 3. A four-buffer event channel that consumes and immediately resubmits
//!    asynchronous topology notifications (hot-plug, capacity change).
//!
//! The virtio queue primitives, the bus-management layer and the device
//! framework are consumed through traits; see the `transport`, `bus` and
//! `event` modules.

pub mod adapter;
pub mod bus;
pub mod byte_code;
pub mod codec;
pub mod command;
pub mod controller;
pub mod error;
pub mod event;
pub mod transport;

#[cfg(feature = "test")]
pub mod test_helpers;
#[cfg(not(feature = "test"))]
mod test_helpers;

pub use adapter::{DeviceRestrictions, PathInquiry, ScsiSimOps, VirtioScsiAdapter};
pub use bus::{CcbStatus, ScsiBusOps, ScsiCcb, ScsiSgElem, ScsiXferMode};
pub use codec::{VirtioScsiCmdReq, VirtioScsiCmdResp, VirtioScsiConfig};
pub use command::CommandContext;
pub use controller::{ExecuteOutcome, ScsiController};
pub use error::VirtioScsiError;
pub use event::{EventChannel, TopologyOps, VirtioScsiEvent};
pub use transport::{ElemIovec, QueueCallback, ScsiTransport, VirtQueue};

/// Check if the bit of features is configured.
pub fn virtio_has_feature(feature: u64, fbit: u32) -> bool {
    feature & (1 << fbit) != 0
}

/// Feature Bits of the virtio scsi device, refer to Virtio Spec.
/// A single request can include both device-readable and device-writable data
/// buffers. Reserved for bidirectional transfers, never negotiated here.
pub const VIRTIO_SCSI_F_INOUT: u32 = 0;
/// The host SHOULD enable reporting of hot-plug and hot-unplug events for LUNs
/// and targets on the SCSI bus.
pub const VIRTIO_SCSI_F_HOTPLUG: u32 = 1;
/// The host will report changes to LUN parameters via a
/// VIRTIO_SCSI_T_PARAM_CHANGE event.
pub const VIRTIO_SCSI_F_CHANGE: u32 = 2;
/// The extended fields for T10 protection information are included in the
/// request header.
pub const VIRTIO_SCSI_F_T10_PI: u32 = 3;

/// Command-specific response values.
/// The request was completed and the status byte is filled with a SCSI status
/// code.
pub const VIRTIO_SCSI_S_OK: u8 = 0;
/// The content of the CDB requires more data than is available in the datain
/// and dataout buffers.
pub const VIRTIO_SCSI_S_OVERRUN: u8 = 1;
/// The request was cancelled.
pub const VIRTIO_SCSI_S_ABORTED: u8 = 2;
/// The request was never processed because the target indicated by lun does
/// not exist.
pub const VIRTIO_SCSI_S_BAD_TARGET: u8 = 3;
/// The request was cancelled by a bus or device reset.
pub const VIRTIO_SCSI_S_RESET: u8 = 4;
/// The device is busy; retrying later may succeed.
pub const VIRTIO_SCSI_S_BUSY: u8 = 5;
/// The transport between the HBA and the target failed.
pub const VIRTIO_SCSI_S_TRANSPORT_FAILURE: u8 = 6;
/// The target failed.
pub const VIRTIO_SCSI_S_TARGET_FAILURE: u8 = 7;
/// The nexus between the initiator and the target failed.
pub const VIRTIO_SCSI_S_NEXUS_FAILURE: u8 = 8;
/// Other host or driver error.
pub const VIRTIO_SCSI_S_FAILURE: u8 = 9;

/// Event types delivered on the event queue.
/// No event.
pub const VIRTIO_SCSI_T_NO_EVENT: u32 = 0;
/// A LUN appeared or disappeared (transport reset / hot-plug).
pub const VIRTIO_SCSI_T_TRANSPORT_RESET: u32 = 1;
/// An asynchronous notification the driver subscribed to.
pub const VIRTIO_SCSI_T_ASYNC_NOTIFY: u32 = 2;
/// A LUN parameter (e.g. its capacity) changed.
pub const VIRTIO_SCSI_T_PARAM_CHANGE: u32 = 3;
/// The device failed to allocate an event buffer and has dropped events; the
/// flag is OR-ed into the event type.
pub const VIRTIO_SCSI_T_EVENTS_MISSED: u32 = 0x4000_0000;

/// SIMPLE task attribute for the request header.
pub const VIRTIO_SCSI_S_SIMPLE: u8 = 0;
