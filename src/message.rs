// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::pool::MAX_MESSAGE_BPAGES;
use arrayvec::ArrayVec;

/// Buffer map for one incoming message
///
/// The pool fills `bpage_offsets` when the message is admitted; every entry
/// is a byte offset into the pool's region. All entries except the last
/// address the start of a full bpage; the last entry may point into the
/// middle of a bpage shared with other messages.
///
/// The message never holds pointers back into the pool, only offsets. The
/// caller hands the offsets back through
/// [`release_buffers`](crate::pool::Pool::release_buffers) once the message
/// has been consumed.
#[derive(Debug)]
pub struct Message {
    length: usize,
    bpage_offsets: ArrayVec<u32, MAX_MESSAGE_BPAGES>,
}

impl Message {
    /// Creates an unallocated message of `length` bytes
    #[inline]
    pub fn new(length: usize) -> Self {
        Self {
            length,
            bpage_offsets: ArrayVec::new(),
        }
    }

    /// Total number of message bytes the buffers must cover
    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Number of bpages currently backing the message
    ///
    /// Zero until [`allocate`](crate::pool::Pool::allocate) succeeds, and
    /// zero again if it fails.
    #[inline]
    pub fn num_bpages(&self) -> usize {
        self.bpage_offsets.len()
    }

    /// The region offsets backing the message, in message order
    #[inline]
    pub fn bpage_offsets(&self) -> &[u32] {
        &self.bpage_offsets
    }

    #[inline]
    pub(crate) fn push_offset(&mut self, offset: u32) {
        self.bpage_offsets.push(offset);
    }

    #[inline]
    pub(crate) fn clear_offsets(&mut self) {
        self.bpage_offsets.clear();
    }
}
