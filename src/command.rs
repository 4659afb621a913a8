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

//! The state machine for exactly one in-flight SCSI command.
//!
//! One `CommandContext` exists per controller and is reused across commands;
//! its request/response wire blocks live in a single boxed allocation for
//! the controller's lifetime, so command submission never allocates
//! DMA-visible memory. Admission is a non-blocking try-acquire: a second
//! `try_start` while a command is active reports busy immediately instead of
//! stalling the submission path.

use std::cmp;
use std::ptr::{addr_of, read_volatile};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{debug, error};

use crate::bus::{CcbStatus, ScsiBusOps, ScsiCcb, GOOD, REQUEST_SENSE};
use crate::codec::{
    build_desc_chain, VirtioScsiCmdReq, VirtioScsiIoBuffer, VIRTIO_SCSI_SENSE_DEFAULT_SIZE,
};
use crate::transport::ElemIovec;

/// Transient per-command state, touched only by the admitted submitter
/// thread while the context is active.
struct CommandInner {
    /// Request header and response block, contiguous, device-visible.
    wire_buf: Box<VirtioScsiIoBuffer>,
    /// The command being serviced, if any.
    ccb: Option<Arc<Mutex<ScsiCcb>>>,
    /// Sense bytes captured from the last check condition; consumed by a
    /// subsequent REQUEST SENSE without a wire round trip.
    cached_sense: Vec<u8>,
}

pub struct CommandContext {
    /// Admission slot: held from `try_start` until `finish`/`abort`.
    active: AtomicBool,
    inner: Mutex<CommandInner>,
    bus_ops: Arc<dyn ScsiBusOps>,
}

impl CommandContext {
    pub fn new(bus_ops: Arc<dyn ScsiBusOps>) -> Self {
        CommandContext {
            active: AtomicBool::new(false),
            inner: Mutex::new(CommandInner {
                wire_buf: Box::new(VirtioScsiIoBuffer::default()),
                ccb: None,
                cached_sense: Vec::new(),
            }),
            bus_ops,
        }
    }

    /// Try to admit one command. Fails fast with `false` when another
    /// command is active; the already-active command's state is untouched.
    pub fn try_start(&self, ccb: Arc<Mutex<ScsiCcb>>) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.wire_buf.resp = Default::default();
        inner.ccb = Some(ccb);
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The timeout to wait for this command, from the CCB hint or the
    /// controller default.
    pub fn timeout(&self, default: Duration) -> Duration {
        let inner = self.inner.lock().unwrap();
        inner
            .ccb
            .as_ref()
            .and_then(|ccb| ccb.lock().unwrap().timeout)
            .unwrap_or(default)
    }

    /// Encode the admitted command and lay out its descriptor chain.
    pub fn fill_request(&self, tag: u64) -> Result<(Vec<ElemIovec>, Vec<ElemIovec>)> {
        let mut inner = self.inner.lock().unwrap();
        let ccb_ref = inner.ccb.clone().ok_or(crate::error::VirtioScsiError::NoRequest)?;
        let ccb = ccb_ref.lock().unwrap();

        inner.wire_buf.req =
            VirtioScsiCmdReq::new(ccb.target_id, ccb.lun, tag, &ccb.cdb[..ccb.cdb_len])?;
        let buffer_addr = &*inner.wire_buf as *const VirtioScsiIoBuffer as u64;
        Ok(build_desc_chain(buffer_addr, &ccb.sg_list, ccb.xfer_mode))
    }

    /// Decode the completed response and route the CCB back to the bus.
    pub fn finish(&self) {
        let mut inner = self.inner.lock().unwrap();
        let Some(ccb_ref) = inner.ccb.take() else {
            error!("Command slot finished with no request attached");
            self.active.store(false, Ordering::Release);
            return;
        };

        // SAFETY: the response block was written by the device; the boxed
        // buffer is alive and packed, so any address is sufficiently
        // aligned for a volatile read.
        let resp = unsafe { read_volatile(addr_of!(inner.wire_buf.resp)) };

        {
            let mut ccb = ccb_ref.lock().unwrap();
            let mut status = crate::codec::response_to_ccb_status(resp.response);
            ccb.device_status = resp.status;
            ccb.resid = resp.resid;

            let sense_len = cmp::min(resp.sense_len as usize, VIRTIO_SCSI_SENSE_DEFAULT_SIZE);
            // REQUEST SENSE reports sense as payload; never reinterpret its
            // own response as a check condition.
            if ccb.opcode() != REQUEST_SENSE && resp.status != GOOD && sense_len > 0 {
                status = CcbStatus::CheckCondition;
                if !ccb.disable_autosense {
                    let copied = cmp::min(sense_len, ccb.sense_cap);
                    ccb.sense[..copied].copy_from_slice(&resp.sense[..copied]);
                    ccb.sense_resid = (sense_len - copied) as u32;
                }
                // Sense survives into the next command's REQUEST SENSE.
                inner.cached_sense = resp.sense[..sense_len].to_vec();
            }
            ccb.ccb_status = status;
        }

        drop(inner);
        self.active.store(false, Ordering::Release);
        self.bus_ops.done(ccb_ref);
    }

    /// Terminate the admitted command locally with `status`; no wire
    /// interaction took place.
    pub fn fail(&self, status: CcbStatus) {
        let mut inner = self.inner.lock().unwrap();
        let Some(ccb_ref) = inner.ccb.take() else {
            error!("Command slot failed with no request attached");
            self.active.store(false, Ordering::Release);
            return;
        };
        ccb_ref.lock().unwrap().ccb_status = status;
        drop(inner);
        self.active.store(false, Ordering::Release);
        self.bus_ops.done(ccb_ref);
    }

    /// Release the slot and report the command aborted. Local bookkeeping
    /// only: a request the device already accepted cannot be recalled.
    pub fn abort(&self) {
        debug!("Aborting the in-flight scsi command");
        self.fail(CcbStatus::RequestAborted);
    }

    /// Serve a REQUEST SENSE from the sense captured by the previous
    /// command, if any. Any other opcode leaves the cache alone and goes to
    /// the wire. Returns false when the command was not served locally.
    pub fn try_complete_cached_sense(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.cached_sense.is_empty() {
            return false;
        }

        let Some(ccb_ref) = inner.ccb.clone() else {
            return false;
        };
        if ccb_ref.lock().unwrap().opcode() != REQUEST_SENSE {
            return false;
        }
        inner.ccb = None;
        {
            let mut ccb = ccb_ref.lock().unwrap();
            let copied = cmp::min(inner.cached_sense.len(), ccb.data_buf.len());
            let sense = inner.cached_sense[..copied].to_vec();
            ccb.data_buf[..copied].copy_from_slice(&sense);
            ccb.resid = (ccb.data_buf.len() - copied) as u32;
            ccb.device_status = GOOD;
            ccb.ccb_status = CcbStatus::RequestComplete;
        }
        inner.cached_sense.clear();

        drop(inner);
        self.active.store(false, Ordering::Release);
        self.bus_ops.done(ccb_ref);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ScsiXferMode, CHECK_CONDITION};
    use crate::codec::VirtioScsiCmdResp;
    use crate::test_helpers::MockBusOps;

    fn new_context() -> (CommandContext, Arc<MockBusOps>) {
        let bus_ops = Arc::new(MockBusOps::default());
        (CommandContext::new(bus_ops.clone()), bus_ops)
    }

    fn new_ccb(opcode: u8) -> Arc<Mutex<ScsiCcb>> {
        let mut ccb = ScsiCcb::new(0, 0);
        ccb.cdb[0] = opcode;
        ccb.cdb_len = 6;
        Arc::new(Mutex::new(ccb))
    }

    // A second try_start while a command is active must fail fast and leave
    // the active command untouched.
    #[test]
    fn test_admission_is_depth_one() {
        let (ctx, bus_ops) = new_context();
        let first = new_ccb(crate::bus::INQUIRY);
        let second = new_ccb(crate::bus::INQUIRY);

        assert!(ctx.try_start(first.clone()));
        assert!(ctx.is_active());
        assert!(!ctx.try_start(second.clone()));
        assert_eq!(
            second.lock().unwrap().ccb_status,
            CcbStatus::RequestInProgress
        );

        ctx.fail(CcbStatus::RequestComplete);
        assert!(!ctx.is_active());
        assert_eq!(bus_ops.done_count(), 1);

        // The slot is free again.
        assert!(ctx.try_start(second));
    }

    // A check-condition response copies min(sense_len, ccb capacity) bytes
    // and records the truncation remainder.
    #[test]
    fn test_finish_propagates_sense() {
        let (ctx, bus_ops) = new_context();
        let ccb_ref = new_ccb(crate::bus::READ_10);
        ccb_ref.lock().unwrap().sense_cap = 8;
        assert!(ctx.try_start(ccb_ref.clone()));

        let mut resp = VirtioScsiCmdResp {
            sense_len: 18,
            resid: 512,
            status: CHECK_CONDITION,
            response: crate::VIRTIO_SCSI_S_OK,
            ..Default::default()
        };
        resp.sense[..4].copy_from_slice(&[0x70, 0, 0x05, 0x20]);
        ctx.inner.lock().unwrap().wire_buf.resp = resp;

        ctx.finish();

        let ccb = ccb_ref.lock().unwrap();
        assert_eq!(ccb.ccb_status, CcbStatus::CheckCondition);
        assert_eq!(ccb.device_status, CHECK_CONDITION);
        assert_eq!(ccb.resid, 512);
        assert_eq!(&ccb.sense[..4], &[0x70, 0, 0x05, 0x20]);
        assert_eq!(ccb.sense_resid, 10);
        assert_eq!(bus_ops.done_count(), 1);
    }

    // With autosense disabled the outcome still flips to check condition
    // but the CCB sense buffer stays untouched.
    #[test]
    fn test_finish_honors_autosense_disable() {
        let (ctx, _bus_ops) = new_context();
        let ccb_ref = new_ccb(crate::bus::READ_10);
        ccb_ref.lock().unwrap().disable_autosense = true;
        assert!(ctx.try_start(ccb_ref.clone()));

        let mut resp = VirtioScsiCmdResp {
            sense_len: 18,
            status: CHECK_CONDITION,
            ..Default::default()
        };
        resp.sense[0] = 0x70;
        ctx.inner.lock().unwrap().wire_buf.resp = resp;

        ctx.finish();

        let ccb = ccb_ref.lock().unwrap();
        assert_eq!(ccb.ccb_status, CcbStatus::CheckCondition);
        assert_eq!(ccb.sense[0], 0);
        assert_eq!(ccb.sense_resid, 0);
    }

    // Sense captured by one command is served to the next REQUEST SENSE
    // without a wire round trip, then dropped.
    #[test]
    fn test_request_sense_short_circuit() {
        let (ctx, bus_ops) = new_context();
        let reader = new_ccb(crate::bus::READ_10);
        assert!(ctx.try_start(reader));
        let mut resp = VirtioScsiCmdResp {
            sense_len: 18,
            status: CHECK_CONDITION,
            ..Default::default()
        };
        resp.sense[..3].copy_from_slice(&[0x70, 0, 0x03]);
        ctx.inner.lock().unwrap().wire_buf.resp = resp;
        ctx.finish();

        let sense_cmd = new_ccb(REQUEST_SENSE);
        sense_cmd.lock().unwrap().data_buf = vec![0; 32];
        assert!(ctx.try_start(sense_cmd.clone()));
        assert!(ctx.try_complete_cached_sense());

        let ccb = sense_cmd.lock().unwrap();
        assert_eq!(ccb.ccb_status, CcbStatus::RequestComplete);
        assert_eq!(&ccb.data_buf[..3], &[0x70, 0, 0x03]);
        assert_eq!(ccb.resid, 32 - 18);
        assert_eq!(bus_ops.done_count(), 2);

        // The cache is consumed; the next REQUEST SENSE goes to the wire.
        let again = new_ccb(REQUEST_SENSE);
        assert!(ctx.try_start(again));
        assert!(!ctx.try_complete_cached_sense());
    }

    // Only REQUEST SENSE is served from the cache. Any other command after
    // a check condition must go to the wire, with its data buffer and the
    // cache both untouched.
    #[test]
    fn test_cached_sense_ignored_for_other_opcodes() {
        let (ctx, _bus_ops) = new_context();
        let reader = new_ccb(crate::bus::READ_10);
        assert!(ctx.try_start(reader));
        let mut resp = VirtioScsiCmdResp {
            sense_len: 3,
            status: CHECK_CONDITION,
            ..Default::default()
        };
        resp.sense[..3].copy_from_slice(&[0x70, 0, 0x03]);
        ctx.inner.lock().unwrap().wire_buf.resp = resp;
        ctx.finish();

        let inquiry = new_ccb(crate::bus::INQUIRY);
        inquiry.lock().unwrap().data_buf = vec![0; 36];
        assert!(ctx.try_start(inquiry.clone()));
        assert!(!ctx.try_complete_cached_sense());
        // The command is still admitted and owed a wire round trip.
        assert!(ctx.is_active());
        assert!(inquiry.lock().unwrap().data_buf.iter().all(|b| *b == 0));
        ctx.fail(CcbStatus::RequestComplete);

        // The cache survived for the actual REQUEST SENSE.
        let sense_cmd = new_ccb(REQUEST_SENSE);
        sense_cmd.lock().unwrap().data_buf = vec![0; 18];
        assert!(ctx.try_start(sense_cmd.clone()));
        assert!(ctx.try_complete_cached_sense());
        assert_eq!(&sense_cmd.lock().unwrap().data_buf[..3], &[0x70, 0, 0x03]);
    }

    #[test]
    fn test_abort_reports_aborted() {
        let (ctx, bus_ops) = new_context();
        let ccb_ref = new_ccb(crate::bus::WRITE_10);
        assert!(ctx.try_start(ccb_ref.clone()));

        ctx.abort();

        assert!(!ctx.is_active());
        assert_eq!(ccb_ref.lock().unwrap().ccb_status, CcbStatus::RequestAborted);
        assert_eq!(bus_ops.done_count(), 1);
        assert_eq!(bus_ops.requeue_count(), 0);
    }
}
