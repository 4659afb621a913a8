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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VirtioScsiError {
    #[error("Cannot perform queue setup. Expected {0} queue(s), got {1}")]
    IncorrectQueueNum(usize, usize),
    #[error("Command slot has no request attached")]
    NoRequest,
    #[error("CDB length {0} exceeds the negotiated maximum {1}")]
    CdbOverflow(usize, usize),
    #[error("Operation is not supported by the virtio scsi adapter")]
    Unsupported,
}
