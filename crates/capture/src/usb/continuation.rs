//! Bulk transfers and continuation groups
//!
//! A logical bulk transfer larger than [`MAX_TRANSFER`] on a controller
//! without scatter-gather is split into chained member URBs. The group owns
//! the destination buffer; members point into it at `index * MAX_TRANSFER`.
//!
//! The group's result is only known once the last member completes or any
//! member fails. A failure cancels every sibling, and the group is resubmitted
//! as a whole once every member has been reaped. A transfer that fits in one
//! URB is simply a group of one.

use crate::usb::transfers::UrbStatus;
use crate::usb::urb::{UrbBuffer, UrbKey};
use crate::usb::usbfs::{MAX_TRANSFER, URB_BULK_CONTINUATION, URB_SHORT_NOT_OK};
use std::fmt;

/// Handle for a submitted bulk transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub(crate) u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bulk#{}", self.0)
    }
}

/// Returned by a bulk callback to keep or end its transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferControl {
    /// Resubmit the transfer
    Continue,
    /// Free the transfer
    Stop,
}

/// Outcome of one logical bulk transfer
#[derive(Debug)]
pub struct BulkCompletion<'a> {
    pub transfer: TransferId,
    pub endpoint: u8,
    /// Bytes received, or the negative errno that ended the transfer
    pub result: Result<usize, i32>,
    /// Received bytes (empty on error)
    pub data: &'a [u8],
}

/// Bulk completion callback, run on the reap thread
///
/// It must not call back into the transport; return
/// [`TransferControl::Stop`] to end the transfer instead.
pub type BulkCallback = Box<dyn FnMut(&BulkCompletion<'_>) -> TransferControl + Send>;

/// URB flags for member `index` of a `count`-member chain
pub(crate) fn member_flags(index: usize, count: usize) -> u32 {
    if count <= 1 {
        0
    } else if index == 0 {
        URB_SHORT_NOT_OK
    } else if index + 1 == count {
        URB_BULK_CONTINUATION
    } else {
        URB_BULK_CONTINUATION | URB_SHORT_NOT_OK
    }
}

/// (offset, length) of every member of a `count`-member chain over `size` bytes
pub(crate) fn member_spans(size: usize, count: usize) -> Vec<(usize, usize)> {
    if count <= 1 {
        return vec![(0, size)];
    }
    (0..count)
        .map(|i| {
            let offset = i * MAX_TRANSFER;
            (offset, (size - offset).min(MAX_TRANSFER))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupState {
    /// Members in flight, nothing decided
    Active,
    /// Result decided, waiting for cancelled siblings to be reaped
    Completing(Result<usize, i32>),
    /// Killed by the owner or a failed submit; free once drained
    Killed,
    /// The device went away; free once drained
    Dead,
}

/// What the transport must do after a member was reaped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupStep {
    /// More members outstanding
    Wait,
    /// Cancel every sibling still in flight
    DiscardSiblings,
    /// Every member is back: report this result
    Finalize(Result<usize, i32>),
    /// Every member is back and nobody wants the result
    Free,
    /// Report the fatal status once
    Fatal(i32),
}

pub(crate) struct ContinuationGroup {
    pub(crate) id: TransferId,
    pub(crate) endpoint: u8,
    pub(crate) buffer: UrbBuffer,
    pub(crate) members: Vec<UrbKey>,
    pub(crate) outstanding: usize,
    pub(crate) accumulated: usize,
    pub(crate) state: GroupState,
    pub(crate) callback: BulkCallback,
}

impl ContinuationGroup {
    pub(crate) fn new(id: TransferId, endpoint: u8, buffer: UrbBuffer, callback: BulkCallback) -> Self {
        Self {
            id,
            endpoint,
            buffer,
            members: Vec::new(),
            outstanding: 0,
            accumulated: 0,
            state: GroupState::Active,
            callback,
        }
    }

    pub(crate) fn is_chained(&self) -> bool {
        self.members.len() > 1
    }

    /// Prepare for a fresh round of submissions
    pub(crate) fn rearm(&mut self) {
        self.state = GroupState::Active;
        self.accumulated = 0;
    }

    pub(crate) fn member_submitted(&mut self) {
        self.outstanding += 1;
    }

    /// Advance the group after member `index` was reaped
    pub(crate) fn member_reaped(
        &mut self,
        index: usize,
        class: UrbStatus,
        status: i32,
        actual: usize,
    ) -> GroupStep {
        self.outstanding = self.outstanding.saturating_sub(1);
        let drained = self.outstanding == 0;

        match self.state {
            GroupState::Killed | GroupState::Dead => {
                if drained {
                    GroupStep::Free
                } else {
                    GroupStep::Wait
                }
            }
            GroupState::Completing(result) => {
                if drained {
                    GroupStep::Finalize(result)
                } else {
                    GroupStep::Wait
                }
            }
            GroupState::Active => match class {
                UrbStatus::Success => {
                    self.accumulated += actual;
                    if index + 1 < self.members.len() {
                        GroupStep::Wait
                    } else if drained {
                        GroupStep::Finalize(Ok(self.accumulated))
                    } else {
                        self.state = GroupState::Completing(Ok(self.accumulated));
                        GroupStep::Wait
                    }
                }
                UrbStatus::Short => {
                    self.accumulated += actual;
                    self.decide(Ok(self.accumulated), drained)
                }
                UrbStatus::Fatal => {
                    self.state = GroupState::Dead;
                    GroupStep::Fatal(status)
                }
                UrbStatus::Stall | UrbStatus::Transient | UrbStatus::Cancelled => {
                    self.decide(Err(status), drained)
                }
            },
        }
    }

    fn decide(&mut self, result: Result<usize, i32>, drained: bool) -> GroupStep {
        if drained {
            GroupStep::Finalize(result)
        } else {
            self.state = GroupState::Completing(result);
            GroupStep::DiscardSiblings
        }
    }

    /// Run the owner's callback with the group's final result
    pub(crate) fn report(&mut self, result: Result<usize, i32>) -> TransferControl {
        let data = match result {
            // SAFETY: only called once every member has been reaped
            Ok(n) => unsafe { &self.buffer.as_slice()[..n.min(self.buffer.len())] },
            Err(_) => &[],
        };
        let completion = BulkCompletion {
            transfer: self.id,
            endpoint: self.endpoint,
            result,
            data,
        };
        (self.callback)(&completion)
    }
}

impl fmt::Debug for ContinuationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationGroup")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("members", &self.members.len())
            .field("outstanding", &self.outstanding)
            .field("state", &self.state)
            .finish()
    }
}
