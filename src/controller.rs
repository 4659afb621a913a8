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

//! Controller bring-up and the synchronous command round trip.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, error, warn};

use crate::bus::{CcbStatus, ScsiBusOps, ScsiCcb};
use crate::byte_code::ByteCode;
use crate::codec::{
    VirtioScsiConfig, CONFIG_CDB_SIZE_OFFSET, CONFIG_SENSE_SIZE_OFFSET,
    VIRTIO_SCSI_CDB_DEFAULT_SIZE, VIRTIO_SCSI_SENSE_DEFAULT_SIZE,
};
use crate::command::CommandContext;
use crate::error::VirtioScsiError;
use crate::event::{EventChannel, TopologyOps, SCSI_EVENT_QUEUE};
use crate::transport::{ScsiTransport, VirtQueue};
use crate::{VIRTIO_SCSI_F_CHANGE, VIRTIO_SCSI_F_HOTPLUG};

/// Queue layout mandated by the device: control, event, then request
/// queues.
pub const SCSI_CTRL_QUEUE: usize = 0;
pub const SCSI_CMD_QUEUE: usize = 2;
pub const SCSI_QUEUE_NUM: usize = 3;

/// Applied when the caller leaves the per-request timeout unset.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of an admission attempt on the request queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The request ran to completion (successfully or not); its CCB has
    /// been routed back through the bus.
    Done,
    /// The single request slot was busy; nothing was touched and the CCB
    /// should be requeued for a later attempt.
    Retry,
}

/// Pairs a submitted tag with its completion flag under the wait mutex.
#[derive(Default)]
struct CompletionState {
    outstanding: Option<u32>,
    completed: bool,
}

pub struct ScsiController {
    transport: Arc<dyn ScsiTransport>,
    features: u64,
    config: VirtioScsiConfig,
    queues: Vec<Arc<Mutex<dyn VirtQueue>>>,
    cmd_ctx: Arc<CommandContext>,
    event_chan: Arc<EventChannel>,
    /// Monotonic correlation tag; wraps harmlessly since at most one
    /// request is ever outstanding.
    current_tag: AtomicU32,
    completion: Mutex<CompletionState>,
    completion_cond: Condvar,
}

impl ScsiController {
    /// All-or-nothing bring-up. Negotiates features, reconciles the wire
    /// geometry, allocates the three queues, primes the event pipeline and
    /// wires up the completion callbacks. Any failure leaves nothing
    /// half-attached.
    pub fn new(
        transport: Arc<dyn ScsiTransport>,
        bus_ops: Arc<dyn ScsiBusOps>,
        topology: Arc<dyn TopologyOps>,
    ) -> Result<Arc<Self>> {
        let requested = (1_u64 << VIRTIO_SCSI_F_HOTPLUG) | (1_u64 << VIRTIO_SCSI_F_CHANGE);
        let features = transport.negotiate_features(requested);

        let mut config = VirtioScsiConfig::default();
        transport
            .read_device_config(0, config.as_mut_bytes())
            .with_context(|| "Failed to read scsi device configuration")?;

        // The driver only speaks the default wire geometry; write it back
        // so both sides agree on the framing.
        config.sense_size = VIRTIO_SCSI_SENSE_DEFAULT_SIZE as u32;
        config.cdb_size = VIRTIO_SCSI_CDB_DEFAULT_SIZE as u32;
        let sense_size = config.sense_size;
        let cdb_size = config.cdb_size;
        transport
            .write_device_config(CONFIG_SENSE_SIZE_OFFSET, sense_size.as_bytes())
            .with_context(|| "Failed to set sense size")?;
        transport
            .write_device_config(CONFIG_CDB_SIZE_OFFSET, cdb_size.as_bytes())
            .with_context(|| "Failed to set cdb size")?;

        let queues = transport.alloc_queues(SCSI_QUEUE_NUM)?;
        if queues.len() != SCSI_QUEUE_NUM {
            bail!(VirtioScsiError::IncorrectQueueNum(
                SCSI_QUEUE_NUM,
                queues.len()
            ));
        }

        let cmd_ctx = Arc::new(CommandContext::new(bus_ops));
        let event_chan = Arc::new(EventChannel::new(
            queues[SCSI_EVENT_QUEUE].clone(),
            transport.clone(),
            topology,
        ));
        event_chan
            .submit_all()
            .with_context(|| "Failed to prime the event queue")?;

        let cntlr = Arc::new(ScsiController {
            transport,
            features,
            config,
            queues,
            cmd_ctx,
            event_chan,
            current_tag: AtomicU32::new(0),
            completion: Mutex::new(CompletionState::default()),
            completion_cond: Condvar::new(),
        });

        Self::register_callbacks(&cntlr)?;
        Ok(cntlr)
    }

    fn register_callbacks(cntlr: &Arc<Self>) -> Result<()> {
        // Weak closures so the transport's callback registry never keeps
        // a torn-down controller alive.
        let weak_cmd = Arc::downgrade(cntlr);
        cntlr.transport.register_queue_callback(
            SCSI_CMD_QUEUE,
            Arc::new(weak_callback(weak_cmd, |cntlr| {
                cntlr.handle_cmd_completion();
            })),
        )?;

        let weak_event = Arc::downgrade(cntlr);
        cntlr.transport.register_queue_callback(
            SCSI_EVENT_QUEUE,
            Arc::new(weak_callback(weak_event, |cntlr| {
                cntlr.event_chan.handle_event_interrupt();
            })),
        )?;

        // Task management is not in use; completions on the control queue
        // are drained and dropped.
        let weak_ctrl = Arc::downgrade(cntlr);
        cntlr.transport.register_queue_callback(
            SCSI_CTRL_QUEUE,
            Arc::new(weak_callback(weak_ctrl, |cntlr| {
                while cntlr.queues[SCSI_CTRL_QUEUE]
                    .lock()
                    .unwrap()
                    .dequeue()
                    .is_some()
                {}
            })),
        )?;

        let weak_dev = Arc::downgrade(cntlr);
        cntlr.transport
            .register_device_handler(Arc::new(weak_callback(weak_dev, |cntlr| {
                cntlr.handle_cmd_completion();
                cntlr.event_chan.handle_event_interrupt();
            })))
    }

    /// Negotiated feature bits.
    pub fn features(&self) -> u64 {
        self.features
    }

    /// Snapshot of the device configuration taken at bring-up.
    pub fn device_config(&self) -> VirtioScsiConfig {
        self.config
    }

    #[cfg(test)]
    pub(crate) fn command_slot(&self) -> &CommandContext {
        &self.cmd_ctx
    }

    /// Run one CCB through the device, blocking until completion or
    /// timeout. At most one request is in flight; a second caller gets
    /// `Retry` without side effects.
    pub fn execute(&self, ccb: Arc<Mutex<ScsiCcb>>) -> Result<ExecuteOutcome> {
        if !self.cmd_ctx.try_start(ccb.clone()) {
            return Ok(ExecuteOutcome::Retry);
        }

        if let Some(status) = self.validate(&ccb) {
            self.cmd_ctx.fail(status);
            return Ok(ExecuteOutcome::Done);
        }

        // A REQUEST SENSE directly after a CHECK CONDITION is answered
        // from the cached sense without a device round trip.
        if self.cmd_ctx.try_complete_cached_sense() {
            return Ok(ExecuteOutcome::Done);
        }

        let tag = self.current_tag.fetch_add(1, Ordering::SeqCst);
        let timeout = self.cmd_ctx.timeout(DEFAULT_COMMAND_TIMEOUT);

        {
            let mut state = self.completion.lock().unwrap();
            state.outstanding = Some(tag);
            state.completed = false;
        }

        if let Err(e) = self.submit(tag) {
            error!("Failed to submit scsi request with tag {}: {:?}", tag, e);
            self.completion.lock().unwrap().outstanding = None;
            self.cmd_ctx.fail(CcbStatus::RequestCompleteErr);
            return Ok(ExecuteOutcome::Done);
        }

        let state = self.completion.lock().unwrap();
        let (mut state, wait) = self
            .completion_cond
            .wait_timeout_while(state, timeout, |s| !s.completed)
            .unwrap();
        state.outstanding = None;
        let timed_out = wait.timed_out() && !state.completed;
        drop(state);

        if timed_out {
            warn!("Scsi request with tag {} timed out, aborting", tag);
            self.cmd_ctx.abort();
        } else {
            self.cmd_ctx.finish();
        }
        Ok(ExecuteOutcome::Done)
    }

    /// Reject CCBs that address past the device limits or carry a CDB the
    /// wire header cannot hold. Nothing reaches the queue.
    fn validate(&self, ccb: &Arc<Mutex<ScsiCcb>>) -> Option<CcbStatus> {
        let locked = ccb.lock().unwrap();
        let max_target = self.config.max_target;
        let max_lun = self.config.max_lun;
        if locked.target_id > max_target {
            return Some(CcbStatus::TidInvalid);
        }
        if u32::from(locked.lun) > max_lun {
            return Some(CcbStatus::LunInvalid);
        }
        if locked.cdb_len > VIRTIO_SCSI_CDB_DEFAULT_SIZE {
            return Some(CcbStatus::CdbInvalid);
        }
        None
    }

    fn submit(&self, tag: u32) -> Result<()> {
        let (out_iov, in_iov) = self.cmd_ctx.fill_request(u64::from(tag))?;
        self.queues[SCSI_CMD_QUEUE]
            .lock()
            .unwrap()
            .enqueue(&out_iov, &in_iov, u64::from(tag))?;
        self.transport.notify(SCSI_CMD_QUEUE)
    }

    /// Request-queue completion callback. Wakes the waiter only for the
    /// tag it is parked on; anything else is a stale completion from an
    /// already-aborted request and is drained.
    fn handle_cmd_completion(&self) {
        loop {
            let token = self.queues[SCSI_CMD_QUEUE].lock().unwrap().dequeue();
            let Some(token) = token else {
                break;
            };
            let mut state = self.completion.lock().unwrap();
            match state.outstanding {
                Some(tag) if u64::from(tag) == token => {
                    state.completed = true;
                    self.completion_cond.notify_all();
                }
                _ => {
                    debug!("Dropping stale scsi completion with tag {}", token);
                }
            }
        }
    }
}

/// Adapts a `Weak<ScsiController>` method into a transport callback.
fn weak_callback(
    weak: Weak<ScsiController>,
    f: impl Fn(&ScsiController) + Send + Sync + 'static,
) -> impl Fn() + Send + Sync + 'static {
    move || {
        if let Some(cntlr) = Weak::upgrade(&weak) {
            f(&cntlr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{
        ScsiXferMode, CHECK_CONDITION, GOOD, INQUIRY, READ_10, REQUEST_SENSE, TEST_UNIT_READY,
    };
    use crate::codec::VirtioScsiCmdResp;
    use crate::test_helpers::{MockBusOps, MockTopology, MockTransport};
    use crate::VIRTIO_SCSI_S_OK;
    use std::thread;

    fn new_controller() -> (Arc<ScsiController>, Arc<MockTransport>, Arc<MockBusOps>) {
        let transport = Arc::new(MockTransport::default());
        let bus_ops = Arc::new(MockBusOps::default());
        let topology = Arc::new(MockTopology::default());
        let cntlr = ScsiController::new(transport.clone(), bus_ops.clone(), topology).unwrap();
        (cntlr, transport, bus_ops)
    }

    fn new_ccb(opcode: u8) -> Arc<Mutex<ScsiCcb>> {
        let mut ccb = ScsiCcb::new(1, 0);
        ccb.cdb[0] = opcode;
        ccb.cdb_len = 6;
        ccb.xfer_mode = ScsiXferMode::ScsiXferNone;
        Arc::new(Mutex::new(ccb))
    }

    fn ok_resp() -> VirtioScsiCmdResp {
        VirtioScsiCmdResp {
            response: VIRTIO_SCSI_S_OK,
            status: GOOD,
            ..Default::default()
        }
    }

    // Bring-up forces the default sense and cdb sizes back into the
    // device configuration so both sides frame requests identically.
    #[test]
    fn test_new_reconciles_wire_geometry() {
        let (cntlr, transport, _) = new_controller();
        let config = cntlr.device_config();
        let sense_size = config.sense_size;
        let cdb_size = config.cdb_size;
        assert_eq!(sense_size as usize, VIRTIO_SCSI_SENSE_DEFAULT_SIZE);
        assert_eq!(cdb_size as usize, VIRTIO_SCSI_CDB_DEFAULT_SIZE);
        assert_eq!(
            transport.config_read_u32(CONFIG_SENSE_SIZE_OFFSET) as usize,
            VIRTIO_SCSI_SENSE_DEFAULT_SIZE
        );
        assert_eq!(
            transport.config_read_u32(CONFIG_CDB_SIZE_OFFSET) as usize,
            VIRTIO_SCSI_CDB_DEFAULT_SIZE
        );
        // Event pipeline is primed during bring-up and the device was
        // kicked for it.
        assert_eq!(
            transport.in_flight(SCSI_EVENT_QUEUE),
            crate::event::EVENT_BUFFER_COUNT
        );
        assert!(transport.notify_count(SCSI_EVENT_QUEUE) > 0);
    }

    // A transport without per-queue interrupt routing delivers everything
    // through the device-level handler, which drains both directions.
    #[test]
    fn test_device_handler_drains_event_queue() {
        let transport = Arc::new(MockTransport::default());
        let bus_ops = Arc::new(MockBusOps::default());
        let topology = Arc::new(MockTopology::default());
        let _cntlr =
            ScsiController::new(transport.clone(), bus_ops, topology.clone()).unwrap();

        let event = crate::event::VirtioScsiEvent {
            event: crate::VIRTIO_SCSI_T_PARAM_CHANGE,
            lun: crate::codec::build_lun_addr(0, 1),
            reason: crate::event::VIRTIO_SCSI_EVT_REASON_CAPACITY_CHANGED,
        };
        transport.inject_event(event);
        transport.fire_device_handler();

        assert_eq!(topology.rescans(), vec![(0, 1)]);
        assert_eq!(
            transport.in_flight(SCSI_EVENT_QUEUE),
            crate::event::EVENT_BUFFER_COUNT
        );
    }

    // Out-of-range addressing fails the CCB locally; the request queue
    // never sees a descriptor and the slot frees immediately.
    #[test]
    fn test_validation_rejects_locally() {
        let (cntlr, transport, bus_ops) = new_controller();

        let ccb = new_ccb(TEST_UNIT_READY);
        ccb.lock().unwrap().target_id = 9999;
        assert_eq!(cntlr.execute(ccb.clone()).unwrap(), ExecuteOutcome::Done);
        assert_eq!(transport.in_flight(SCSI_CMD_QUEUE), 0);
        assert_eq!(bus_ops.done_count(), 1);
        assert_eq!(ccb.lock().unwrap().ccb_status, CcbStatus::TidInvalid);

        let ccb = new_ccb(TEST_UNIT_READY);
        ccb.lock().unwrap().cdb_len = 33;
        assert_eq!(cntlr.execute(ccb.clone()).unwrap(), ExecuteOutcome::Done);
        assert_eq!(ccb.lock().unwrap().ccb_status, CcbStatus::CdbInvalid);
        assert_eq!(bus_ops.done_count(), 2);

        // The slot is free again: a valid request is admitted.
        let ccb = new_ccb(TEST_UNIT_READY);
        transport.complete_next_command_async(ok_resp());
        assert_eq!(cntlr.execute(ccb.clone()).unwrap(), ExecuteOutcome::Done);
        assert_eq!(ccb.lock().unwrap().ccb_status, CcbStatus::RequestComplete);
    }

    // Every CDB length the wire header can carry is submittable; the
    // validation boundary sits exactly at the wire field size.
    #[test]
    fn test_cdb_length_boundary() {
        let (cntlr, transport, bus_ops) = new_controller();

        for cdb_len in [17, 20, VIRTIO_SCSI_CDB_DEFAULT_SIZE] {
            let ccb = new_ccb(TEST_UNIT_READY);
            ccb.lock().unwrap().cdb_len = cdb_len;
            transport.complete_next_command_async(ok_resp());
            assert_eq!(cntlr.execute(ccb.clone()).unwrap(), ExecuteOutcome::Done);
            assert_eq!(ccb.lock().unwrap().ccb_status, CcbStatus::RequestComplete);
        }
        assert_eq!(bus_ops.done_count(), 3);

        let ccb = new_ccb(TEST_UNIT_READY);
        ccb.lock().unwrap().cdb_len = VIRTIO_SCSI_CDB_DEFAULT_SIZE + 1;
        assert_eq!(cntlr.execute(ccb.clone()).unwrap(), ExecuteOutcome::Done);
        assert_eq!(ccb.lock().unwrap().ccb_status, CcbStatus::CdbInvalid);
    }

    // One full round trip: submit, device completion, status mapping,
    // bus delivery.
    #[test]
    fn test_execute_round_trip() {
        let (cntlr, transport, bus_ops) = new_controller();
        let ccb = new_ccb(INQUIRY);
        transport.complete_next_command_async(ok_resp());

        assert_eq!(cntlr.execute(ccb.clone()).unwrap(), ExecuteOutcome::Done);
        let locked = ccb.lock().unwrap();
        assert_eq!(locked.ccb_status, CcbStatus::RequestComplete);
        assert_eq!(locked.device_status, GOOD);
        assert_eq!(bus_ops.done_count(), 1);
    }

    // After a check condition, an ordinary command still goes to the wire;
    // only a REQUEST SENSE is answered from the cached sense.
    #[test]
    fn test_check_condition_does_not_capture_next_command() {
        let (cntlr, transport, bus_ops) = new_controller();

        let reader = new_ccb(READ_10);
        let mut check = VirtioScsiCmdResp {
            sense_len: 3,
            status: CHECK_CONDITION,
            response: VIRTIO_SCSI_S_OK,
            ..Default::default()
        };
        check.sense[..3].copy_from_slice(&[0x70, 0, 0x03]);
        transport.complete_next_command_async(check);
        assert_eq!(cntlr.execute(reader.clone()).unwrap(), ExecuteOutcome::Done);
        assert_eq!(reader.lock().unwrap().ccb_status, CcbStatus::CheckCondition);

        let inquiry = new_ccb(INQUIRY);
        inquiry.lock().unwrap().data_buf = vec![0; 36];
        let kicks = transport.notify_count(SCSI_CMD_QUEUE);
        transport.complete_next_command_async(ok_resp());
        assert_eq!(cntlr.execute(inquiry.clone()).unwrap(), ExecuteOutcome::Done);
        // A wire round trip happened and no sense bytes leaked into the
        // data buffer.
        assert_eq!(transport.notify_count(SCSI_CMD_QUEUE), kicks + 1);
        let locked = inquiry.lock().unwrap();
        assert_eq!(locked.ccb_status, CcbStatus::RequestComplete);
        assert!(locked.data_buf.iter().all(|b| *b == 0));
        drop(locked);
        assert_eq!(bus_ops.done_count(), 2);

        // The cached sense is still owed to the actual REQUEST SENSE, with
        // no further device kick.
        let sense_cmd = new_ccb(REQUEST_SENSE);
        sense_cmd.lock().unwrap().data_buf = vec![0; 18];
        assert_eq!(
            cntlr.execute(sense_cmd.clone()).unwrap(),
            ExecuteOutcome::Done
        );
        assert_eq!(transport.notify_count(SCSI_CMD_QUEUE), kicks + 1);
        let locked = sense_cmd.lock().unwrap();
        assert_eq!(locked.ccb_status, CcbStatus::RequestComplete);
        assert_eq!(&locked.data_buf[..3], &[0x70, 0, 0x03]);
    }

    // While one request occupies the slot, a competitor gets Retry with
    // no side effects; once the first completes, the competitor is
    // admitted.
    #[test]
    fn test_second_caller_retries_until_slot_frees() {
        let (cntlr, transport, bus_ops) = new_controller();

        let first = new_ccb(TEST_UNIT_READY);
        let cntlr2 = cntlr.clone();
        let first2 = first.clone();
        let waiter = thread::spawn(move || cntlr2.execute(first2).unwrap());

        // Wait until the first request is actually on the wire.
        while transport.in_flight(SCSI_CMD_QUEUE) == 0 {
            thread::yield_now();
        }

        let second = new_ccb(TEST_UNIT_READY);
        assert_eq!(cntlr.execute(second.clone()).unwrap(), ExecuteOutcome::Retry);
        assert_eq!(bus_ops.done_count(), 0);

        transport.complete_next_command(ok_resp());
        assert_eq!(waiter.join().unwrap(), ExecuteOutcome::Done);
        assert_eq!(first.lock().unwrap().ccb_status, CcbStatus::RequestComplete);

        transport.complete_next_command_async(ok_resp());
        assert_eq!(cntlr.execute(second.clone()).unwrap(), ExecuteOutcome::Done);
        assert_eq!(
            second.lock().unwrap().ccb_status,
            CcbStatus::RequestComplete
        );
        assert_eq!(bus_ops.done_count(), 2);
    }

    // A device that never answers trips the per-request timeout and the
    // CCB comes back aborted.
    #[test]
    fn test_timeout_aborts() {
        let (cntlr, transport, bus_ops) = new_controller();
        let ccb = new_ccb(TEST_UNIT_READY);
        ccb.lock().unwrap().timeout = Some(Duration::from_millis(20));

        assert_eq!(cntlr.execute(ccb.clone()).unwrap(), ExecuteOutcome::Done);
        assert_eq!(ccb.lock().unwrap().ccb_status, CcbStatus::RequestAborted);
        assert_eq!(bus_ops.done_count(), 1);
        assert_eq!(transport.in_flight(SCSI_CMD_QUEUE), 1);

        // The stale completion arriving later is drained harmlessly and
        // the next request still runs.
        transport.complete_next_command(ok_resp());
        let next = new_ccb(TEST_UNIT_READY);
        transport.complete_next_command_async(ok_resp());
        assert_eq!(cntlr.execute(next.clone()).unwrap(), ExecuteOutcome::Done);
        assert_eq!(next.lock().unwrap().ccb_status, CcbStatus::RequestComplete);
    }
}
