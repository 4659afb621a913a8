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

//! The host-bus-adapter face of the controller.
//!
//! Translates between the bus framework's view (path capabilities, queue
//! depth restrictions, CCB submission) and the controller's single-slot
//! execution model.

use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::bus::{ScsiBusOps, ScsiCcb};
use crate::controller::{ExecuteOutcome, ScsiController};
use crate::error::VirtioScsiError;

/// Capabilities of the path behind this adapter, filled from the device
/// configuration at bring-up.
#[derive(Clone, Copy, Debug)]
pub struct PathInquiry {
    pub max_target: u16,
    pub max_lun: u32,
    pub max_sg_count: u32,
    pub cmd_per_lun: u32,
    pub max_sectors: u32,
    pub hotplug: bool,
}

/// Per-device submission restrictions handed to the bus framework.
#[derive(Clone, Copy, Debug)]
pub struct DeviceRestrictions {
    /// Commands the framework may keep in flight against one device. The
    /// request pipeline is a single slot; the bus framework rotates service
    /// between devices at this depth.
    pub queue_depth: u32,
}

/// Operations the bus framework invokes on a host bus adapter.
pub trait ScsiSimOps: Send + Sync {
    /// Submit one CCB. On return the CCB is either completed (routed
    /// through `done`) or requeued for a later attempt.
    fn execute(&self, ccb: Arc<Mutex<ScsiCcb>>) -> Result<()>;

    /// Abort a previously submitted CCB.
    fn abort(&self, ccb: Arc<Mutex<ScsiCcb>>) -> Result<()>;

    /// Reset one device behind the adapter.
    fn reset_device(&self, target_id: u16, lun: u16) -> Result<()>;

    /// Report the capabilities of the path.
    fn path_inquiry(&self) -> PathInquiry;

    /// Report per-device submission restrictions.
    fn get_restrictions(&self) -> DeviceRestrictions;

    /// Adapter-specific control operations.
    fn control(&self, op: u32) -> Result<()>;
}

pub struct VirtioScsiAdapter {
    controller: Arc<ScsiController>,
    bus_ops: Arc<dyn ScsiBusOps>,
}

impl VirtioScsiAdapter {
    pub fn new(controller: Arc<ScsiController>, bus_ops: Arc<dyn ScsiBusOps>) -> Self {
        VirtioScsiAdapter {
            controller,
            bus_ops,
        }
    }
}

impl ScsiSimOps for VirtioScsiAdapter {
    fn execute(&self, ccb: Arc<Mutex<ScsiCcb>>) -> Result<()> {
        match self.controller.execute(ccb.clone())? {
            ExecuteOutcome::Done => Ok(()),
            ExecuteOutcome::Retry => {
                self.bus_ops.requeue(ccb);
                Ok(())
            }
        }
    }

    // Task management (abort/reset) needs the control queue; with a
    // single-slot synchronous pipeline there is never a second command to
    // abort, so these report unsupported and the bus falls back to its
    // generic recovery.
    fn abort(&self, _ccb: Arc<Mutex<ScsiCcb>>) -> Result<()> {
        Err(VirtioScsiError::Unsupported.into())
    }

    fn reset_device(&self, _target_id: u16, _lun: u16) -> Result<()> {
        Err(VirtioScsiError::Unsupported.into())
    }

    fn path_inquiry(&self) -> PathInquiry {
        let config = self.controller.device_config();
        PathInquiry {
            max_target: config.max_target,
            max_lun: config.max_lun,
            max_sg_count: config.seg_max,
            cmd_per_lun: config.cmd_per_lun,
            max_sectors: config.max_sectors,
            hotplug: crate::virtio_has_feature(
                self.controller.features(),
                crate::VIRTIO_SCSI_F_HOTPLUG,
            ),
        }
    }

    fn get_restrictions(&self) -> DeviceRestrictions {
        DeviceRestrictions { queue_depth: 1 }
    }

    fn control(&self, _op: u32) -> Result<()> {
        Err(VirtioScsiError::Unsupported.into())
    }
}
