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

use std::mem::size_of;
use std::slice::{from_raw_parts, from_raw_parts_mut};

/// A trait bound for plain-data wire structures which are safe to view as a
/// byte slice and to reconstruct from one.
pub trait ByteCode: Default + Copy + Send + Sync {
    /// View the object as a slice of bytes.
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: The object is an initialized plain-data structure.
        unsafe { from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }

    /// View the object as a mutable slice of bytes.
    fn as_mut_bytes(&mut self) -> &mut [u8] {
        // SAFETY: The object is an initialized plain-data structure.
        unsafe { from_raw_parts_mut(self as *mut Self as *mut u8, size_of::<Self>()) }
    }

    /// Reinterpret a byte slice as an object. Fails if the slice length does
    /// not match the object size exactly.
    fn from_bytes(data: &[u8]) -> Option<&Self> {
        if data.len() != size_of::<Self>() {
            return None;
        }

        // SAFETY: Length was checked and Self has no alignment requirement
        // beyond the one the cast enforces.
        unsafe { data.as_ptr().cast::<Self>().as_ref() }
    }
}

impl ByteCode for u8 {}
impl ByteCode for u16 {}
impl ByteCode for u32 {}
impl ByteCode for u64 {}
