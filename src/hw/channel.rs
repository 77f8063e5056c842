use super::SubmissionChannel;
use crate::error::MmResult;
use std::sync::atomic::{AtomicU32, Ordering};

/// Software submission channel.
///
/// Emitted fences are not executed by anything: the owner advances the
/// completion counter explicitly, which lets tests and demos play the GPU.
#[derive(Debug, Default)]
pub struct SoftChannel {
    emitted: AtomicU32,
    completed: AtomicU32,
}

impl SoftChannel {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            emitted: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        }
    }

    /// Last fence written into the command stream.
    #[inline]
    pub fn last_emitted(&self) -> u32 {
        self.emitted.load(Ordering::Acquire)
    }

    /// Pretend the hardware finished everything up to and including `seqno`.
    #[inline]
    pub fn complete_up_to(&self, seqno: u32) {
        self.completed.store(seqno, Ordering::Release);
    }

    /// Pretend the hardware drained the channel.
    pub fn complete_all(&self) {
        self.complete_up_to(self.last_emitted());
    }
}

impl SubmissionChannel for SoftChannel {
    fn emit_fence(&self, seqno: u32) -> MmResult<()> {
        self.emitted.store(seqno, Ordering::Release);
        Ok(())
    }

    fn completed_seqno(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_follows_explicit_completion() {
        let chan = SoftChannel::new();
        chan.emit_fence(1).unwrap();
        chan.emit_fence(2).unwrap();
        assert_eq!(chan.completed_seqno(), 0);

        chan.complete_up_to(1);
        assert_eq!(chan.completed_seqno(), 1);

        chan.complete_all();
        assert_eq!(chan.completed_seqno(), 2);
    }
}
