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

//! Wire encoding and response translation.
//!
//! Pure code: builds the virtio-scsi request header, lays out descriptor
//! chains in the order the device expects, and maps the transport's response
//! vocabulary onto [`CcbStatus`].

use std::mem::size_of;

use anyhow::Result;

use crate::bus::{CcbStatus, ScsiSgElem, ScsiXferMode};
use crate::byte_code::ByteCode;
use crate::error::VirtioScsiError;
use crate::transport::ElemIovec;
use crate::{
    VIRTIO_SCSI_S_ABORTED, VIRTIO_SCSI_S_BAD_TARGET, VIRTIO_SCSI_S_BUSY,
    VIRTIO_SCSI_S_NEXUS_FAILURE, VIRTIO_SCSI_S_OK, VIRTIO_SCSI_S_OVERRUN, VIRTIO_SCSI_S_RESET,
    VIRTIO_SCSI_S_SIMPLE, VIRTIO_SCSI_S_TARGET_FAILURE, VIRTIO_SCSI_S_TRANSPORT_FAILURE,
};

/// Fixed wire sizes dictated by the driver, written back into the device
/// config space at attach time.
pub const VIRTIO_SCSI_CDB_DEFAULT_SIZE: usize = 32;
pub const VIRTIO_SCSI_SENSE_DEFAULT_SIZE: usize = 96;

/// Config space of the virtio scsi device.
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default)]
pub struct VirtioScsiConfig {
    pub num_queues: u32,
    pub seg_max: u32,
    pub max_sectors: u32,
    pub cmd_per_lun: u32,
    pub event_info_size: u32,
    pub sense_size: u32,
    pub cdb_size: u32,
    pub max_channel: u16,
    pub max_target: u16,
    pub max_lun: u32,
}

impl ByteCode for VirtioScsiConfig {}

/// Byte offsets of the two fields the driver dictates to the device.
pub const CONFIG_SENSE_SIZE_OFFSET: u64 = 20;
pub const CONFIG_CDB_SIZE_OFFSET: u64 = 24;

/// Request header placed in the first device-readable descriptor.
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct VirtioScsiCmdReq {
    /// Logical Unit Number address bytes.
    pub lun: [u8; 8],
    /// Command identifier, returned verbatim in the completion.
    pub tag: u64,
    /// Task attribute.
    pub task_attr: u8,
    /// SAM command priority field.
    pub prio: u8,
    pub crn: u8,
    pub cdb: [u8; VIRTIO_SCSI_CDB_DEFAULT_SIZE],
}

impl ByteCode for VirtioScsiCmdReq {}

impl VirtioScsiCmdReq {
    /// Build a request header. The CDB is copied into the fixed wire field
    /// and zero-padded; an oversized CDB is a caller error, reported rather
    /// than truncated silently.
    pub fn new(target_id: u16, lun: u16, tag: u64, cdb: &[u8]) -> Result<Self> {
        if cdb.len() > VIRTIO_SCSI_CDB_DEFAULT_SIZE {
            return Err(VirtioScsiError::CdbOverflow(cdb.len(), VIRTIO_SCSI_CDB_DEFAULT_SIZE).into());
        }

        let mut req = VirtioScsiCmdReq {
            lun: build_lun_addr(target_id, lun),
            tag,
            task_attr: VIRTIO_SCSI_S_SIMPLE,
            ..Default::default()
        };
        req.cdb[..cdb.len()].copy_from_slice(cdb);
        Ok(req)
    }
}

/// Response block written by the device into the first device-writable
/// descriptor.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct VirtioScsiCmdResp {
    /// Sense data length.
    pub sense_len: u32,
    /// Residual bytes in the data buffer.
    pub resid: u32,
    /// Status qualifier.
    pub status_qualifier: u16,
    /// SAM command completion status.
    pub status: u8,
    /// Transport response value.
    pub response: u8,
    /// Sense buffer data.
    pub sense: [u8; VIRTIO_SCSI_SENSE_DEFAULT_SIZE],
}

impl Default for VirtioScsiCmdResp {
    fn default() -> Self {
        VirtioScsiCmdResp {
            sense_len: 0,
            resid: 0,
            status_qualifier: 0,
            status: 0,
            response: 0,
            sense: [0; VIRTIO_SCSI_SENSE_DEFAULT_SIZE],
        }
    }
}

impl ByteCode for VirtioScsiCmdResp {}

/// Backing storage for one in-flight command: the request header and the
/// response block share a single allocation, response immediately after
/// request, so the first input descriptor needs no allocation of its own.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct VirtioScsiIoBuffer {
    pub req: VirtioScsiCmdReq,
    pub resp: VirtioScsiCmdResp,
}

impl ByteCode for VirtioScsiIoBuffer {}

//   lun: [u8; 8]
//   | Byte 0 | Byte 1 |     Byte 2      | Byte 3 | Bytes 4-7 |
//   |    1   | target | 0x40 \| lun_hi  | lun_lo |     0     |
pub fn build_lun_addr(target_id: u16, lun: u16) -> [u8; 8] {
    let mut addr = [0_u8; 8];
    addr[0] = 1;
    addr[1] = target_id as u8;
    addr[2] = 0x40 | ((lun >> 8) as u8 & 0x3f);
    addr[3] = lun as u8;
    addr
}

/// Inverse of `build_lun_addr`, used when decoding event reports.
pub fn parse_lun_addr(lun: [u8; 8]) -> (u16, u16) {
    let target_id = lun[1] as u16;
    let lun_id = (((lun[2] as u16) << 8) | (lun[3] as u16)) & 0x3fff;
    (target_id, lun_id)
}

/// Map a transport response code onto the CCB outcome. Total: codes outside
/// the vocabulary collapse into a generic completion error, never an
/// unmapped outcome.
pub fn response_to_ccb_status(response: u8) -> CcbStatus {
    match response {
        VIRTIO_SCSI_S_OK => CcbStatus::RequestComplete,
        VIRTIO_SCSI_S_OVERRUN => CcbStatus::DataRunErr,
        VIRTIO_SCSI_S_ABORTED => CcbStatus::RequestAborted,
        VIRTIO_SCSI_S_BAD_TARGET => CcbStatus::TidInvalid,
        VIRTIO_SCSI_S_RESET => CcbStatus::ScsiBusReset,
        VIRTIO_SCSI_S_BUSY => CcbStatus::ScsiBusy,
        VIRTIO_SCSI_S_TRANSPORT_FAILURE
        | VIRTIO_SCSI_S_TARGET_FAILURE
        | VIRTIO_SCSI_S_NEXUS_FAILURE => CcbStatus::NoNexus,
        _ => CcbStatus::RequestCompleteErr,
    }
}

/// Lay out the descriptor chain for one command.
///
/// Ordering is load-bearing: out[0] is always the request header block; a
/// data-out SG list follows in CCB order. in[0] is always the response
/// block, located `size_of::<VirtioScsiCmdReq>()` past `buffer_addr`; a
/// data-in SG list follows in CCB order. The xfer mode enum makes a
/// simultaneous in+out transfer unrepresentable (VIRTIO_SCSI_F_INOUT stays
/// reserved).
pub fn build_desc_chain(
    buffer_addr: u64,
    sg_list: &[ScsiSgElem],
    mode: ScsiXferMode,
) -> (Vec<ElemIovec>, Vec<ElemIovec>) {
    let mut out_iov = vec![ElemIovec {
        addr: buffer_addr,
        len: size_of::<VirtioScsiCmdReq>() as u32,
    }];
    let mut in_iov = vec![ElemIovec {
        addr: buffer_addr + size_of::<VirtioScsiCmdReq>() as u64,
        len: size_of::<VirtioScsiCmdResp>() as u32,
    }];

    let data_iov = sg_list.iter().map(|sg| ElemIovec {
        addr: sg.address,
        len: sg.len,
    });
    match mode {
        ScsiXferMode::ScsiXferToDev => out_iov.extend(data_iov),
        ScsiXferMode::ScsiXferFromDev => in_iov.extend(data_iov),
        ScsiXferMode::ScsiXferNone => {}
    }

    (out_iov, in_iov)
}
