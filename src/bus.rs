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

//! Vocabulary shared with the SCSI bus-management layer.
//!
//! The bus-management layer owns command-control blocks ([`ScsiCcb`]) and
//! hands them to the adapter for execution; the driver fills in the outcome
//! fields and routes each CCB back through [`ScsiBusOps`], either as
//! completed or for a later retry (admission backpressure).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::VIRTIO_SCSI_CDB_DEFAULT_SIZE;

/// Scsi Operation codes used by the driver itself.
pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2a;

/// SAM Status codes.
pub const GOOD: u8 = 0x00;
pub const CHECK_CONDITION: u8 = 0x02;
pub const BUSY: u8 = 0x08;

/// Upper bound a bus layer may use for CCB sense buffers.
pub const SCSI_SENSE_BUF_SIZE: usize = 252;

/// Outcome of one CCB, reported exactly once to the bus-management layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcbStatus {
    /// Accepted, not yet finished.
    RequestInProgress,
    /// Finished without transport-level error.
    RequestComplete,
    /// Cancelled locally (timeout or explicit abort).
    RequestAborted,
    /// Finished with a generic completion error.
    RequestCompleteErr,
    /// Data overrun or underrun on the wire.
    DataRunErr,
    /// The target id does not exist behind this adapter.
    TidInvalid,
    /// The logical unit number is out of the adapter's range.
    LunInvalid,
    /// The CDB was rejected before submission.
    CdbInvalid,
    /// A bus reset cancelled the request.
    ScsiBusReset,
    /// The device reported busy; distinct from admission backpressure.
    ScsiBusy,
    /// Transport, target or nexus failure: the initiator-target nexus is
    /// gone.
    NoNexus,
    /// The device status carried a check condition; sense data describes it.
    CheckCondition,
}

/// Data-transfer direction of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiXferMode {
    /// TEST_UNIT_READY, ...
    ScsiXferNone,
    /// READ, INQUIRY, MODE_SENSE, ...
    ScsiXferFromDev,
    /// WRITE, MODE_SELECT, ...
    ScsiXferToDev,
}

/// One scatter/gather fragment of a CCB data buffer.
#[derive(Debug, Clone, Copy)]
pub struct ScsiSgElem {
    /// Bus address of the fragment.
    pub address: u64,
    /// Length of the fragment in bytes.
    pub len: u32,
}

/// Command-control block: externally owned description of one SCSI command
/// plus its outcome fields.
pub struct ScsiCcb {
    /// Target id behind the adapter.
    pub target_id: u16,
    /// Logical unit number behind the target.
    pub lun: u16,
    /// CDB bytes, sized to the largest command the wire header carries;
    /// only the first `cdb_len` are meaningful.
    pub cdb: [u8; VIRTIO_SCSI_CDB_DEFAULT_SIZE],
    pub cdb_len: usize,
    /// Direction of the data phase.
    pub xfer_mode: ScsiXferMode,
    /// Scatter/gather list describing `data_buf` as bus-visible fragments.
    pub sg_list: Vec<ScsiSgElem>,
    /// Virtually mapped data buffer backing `sg_list`.
    pub data_buf: Vec<u8>,
    /// Per-command timeout hint; the driver falls back to its default when
    /// unset.
    pub timeout: Option<Duration>,
    /// Sense destination and the capacity the peripheral driver asked for.
    pub sense: [u8; SCSI_SENSE_BUF_SIZE],
    pub sense_cap: usize,
    /// The caller handles sense retrieval itself; do not copy sense bytes.
    pub disable_autosense: bool,

    /// Outcome fields, valid once the CCB is routed back.
    pub ccb_status: CcbStatus,
    /// SAM status byte reported by the device.
    pub device_status: u8,
    /// Bytes of the data buffer the device did not transfer.
    pub resid: u32,
    /// Sense bytes that did not fit into `sense` (truncation remainder).
    pub sense_resid: u32,
}

impl ScsiCcb {
    pub fn new(target_id: u16, lun: u16) -> Self {
        ScsiCcb {
            target_id,
            lun,
            cdb: [0; VIRTIO_SCSI_CDB_DEFAULT_SIZE],
            cdb_len: 0,
            xfer_mode: ScsiXferMode::ScsiXferNone,
            sg_list: Vec::new(),
            data_buf: Vec::new(),
            timeout: None,
            sense: [0; SCSI_SENSE_BUF_SIZE],
            sense_cap: SCSI_SENSE_BUF_SIZE,
            disable_autosense: false,
            ccb_status: CcbStatus::RequestInProgress,
            device_status: GOOD,
            resid: 0,
            sense_resid: 0,
        }
    }

    /// The SCSI operation code of this command.
    pub fn opcode(&self) -> u8 {
        self.cdb[0]
    }
}

/// Routing back into the bus-management layer.
pub trait ScsiBusOps: Send + Sync {
    /// The CCB is finished; its outcome fields are final.
    fn done(&self, ccb: Arc<Mutex<ScsiCcb>>);

    /// The CCB was not admitted (or must be retried); redeliver it later.
    fn requeue(&self, ccb: Arc<Mutex<ScsiCcb>>);
}
