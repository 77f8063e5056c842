//! Fence sequence numbers and retirement of GPU-held references.

use crate::error::{MmError, MmResult};
use crate::hw::SubmissionChannel;
use crate::mm::bo::BoId;
use crate::mm::cache::CacheDirectory;
use crate::mm::gem::GemObject;
use crate::utils::seqno_passed;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

#[derive(Debug)]
struct Request {
    seqno: u32,
    emitted: Instant,
}

struct ActiveEntry {
    seqno: u32,
    object: Arc<GemObject>,
}

struct Channel {
    hw: Arc<dyn SubmissionChannel>,
    next_seqno: u32,
    requests: VecDeque<Request>,
    // Ordered by seqno, so retirement pops a prefix.
    active: VecDeque<ActiveEntry>,
    poll_deadline: Option<Instant>,
}

impl Channel {
    fn new(hw: Arc<dyn SubmissionChannel>) -> Self {
        Self {
            hw,
            next_seqno: 1,
            requests: VecDeque::new(),
            active: VecDeque::new(),
            poll_deadline: None,
        }
    }

    fn take_seqno(&mut self) -> u32 {
        let seqno = self.next_seqno;
        self.next_seqno = match self.next_seqno.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        seqno
    }
}

/// What a retirement pass freed.
///
/// `objects` must be dropped only after the fence and cache locks are released:
/// the last reference to an object destroys it, which takes the cache lock.
#[must_use]
pub struct Retired {
    pub requests: usize,
    pub objects: Vec<Arc<GemObject>>,
}

/// Per-channel request queues and active lists.
///
/// Always locked before the cache directory when both are needed.
pub struct FenceTracker {
    channels: BTreeMap<ChannelId, Channel>,
    next_channel: u32,
    retire_interval: Duration,
}

impl FenceTracker {
    #[must_use]
    pub const fn new(retire_interval: Duration) -> Self {
        Self {
            channels: BTreeMap::new(),
            next_channel: 0,
            retire_interval,
        }
    }

    fn channel(&self, id: ChannelId) -> MmResult<&Channel> {
        self.channels
            .get(&id)
            .ok_or_else(|| MmError::NotFound(format!("channel {}", id.0)))
    }

    fn channel_mut(&mut self, id: ChannelId) -> MmResult<&mut Channel> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| MmError::NotFound(format!("channel {}", id.0)))
    }

    pub fn create_channel(&mut self, hw: Arc<dyn SubmissionChannel>) -> ChannelId {
        let id = ChannelId(self.next_channel);
        self.next_channel = self.next_channel.wrapping_add(1);
        self.channels.insert(id, Channel::new(hw));
        id
    }

    #[must_use]
    pub fn contains(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    /// Outstanding requests on `id`.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel.
    pub fn pending(&self, id: ChannelId) -> MmResult<usize> {
        Ok(self.channel(id)?.requests.len())
    }

    /// # Errors
    /// `NotFound` for an unknown channel.
    pub fn poll_deadline(&self, id: ChannelId) -> MmResult<Option<Instant>> {
        Ok(self.channel(id)?.poll_deadline)
    }

    /// Allocates the next seqno on `id`, emits its fence and queues a request.
    /// Arms polling when the queue was idle.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel; errors from the channel's fence emission.
    pub fn submit(&mut self, id: ChannelId, now: Instant) -> MmResult<u32> {
        let interval = self.retire_interval;
        let channel = self.channel_mut(id)?;

        let seqno = channel.take_seqno();
        channel.hw.emit_fence(seqno)?;

        let was_idle = channel.requests.is_empty();
        channel.requests.push_back(Request {
            seqno,
            emitted: now,
        });
        if was_idle {
            channel.poll_deadline = Some(now + interval);
            log::debug!("Channel {}: polling armed at seqno {seqno}", id.0);
        }
        Ok(seqno)
    }

    /// Records that `object` is referenced by submission `seqno` on `id`.
    ///
    /// # Errors
    /// `Busy` if the object already belongs to outstanding work.
    pub fn mark_active(
        &mut self,
        id: ChannelId,
        seqno: u32,
        object: Arc<GemObject>,
        cache: &mut CacheDirectory,
    ) -> MmResult<()> {
        let channel = self.channel_mut(id)?;
        cache.mark_active(object.bo(), seqno)?;
        channel.active.push_back(ActiveEntry { seqno, object });
        Ok(())
    }

    /// Retires every request on `id` the hardware has passed.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel.
    pub fn retire(
        &mut self,
        id: ChannelId,
        cache: &mut CacheDirectory,
        now: Instant,
    ) -> MmResult<Retired> {
        let interval = self.retire_interval;
        let channel = self.channel_mut(id)?;
        let completed = channel.hw.completed_seqno();

        let mut retired = Retired {
            requests: 0,
            objects: Vec::new(),
        };

        while let Some(head) = channel.requests.front() {
            if !seqno_passed(completed, head.seqno) {
                break;
            }
            let seqno = head.seqno;
            log::trace!(
                "Channel {}: seqno {seqno} retired after {:?}",
                id.0,
                now.saturating_duration_since(head.emitted)
            );
            channel.requests.pop_front();
            retired.requests += 1;

            while channel.active.front().is_some_and(|e| e.seqno == seqno) {
                let Some(entry) = channel.active.pop_front() else {
                    break;
                };
                release_gpu_hold(cache, entry.object.bo());
                retired.objects.push(entry.object);
            }
        }

        channel.poll_deadline = if channel.requests.is_empty() {
            None
        } else {
            Some(now + interval)
        };

        if retired.requests > 0 {
            log::debug!(
                "Channel {}: retired {} requests up to seqno {completed}, {} still queued",
                id.0,
                retired.requests,
                channel.requests.len()
            );
        }
        Ok(retired)
    }

    /// Drops `id`, abandoning its queued requests and releasing every GPU hold it had.
    ///
    /// # Errors
    /// `NotFound` for an unknown channel.
    pub fn destroy_channel(
        &mut self,
        id: ChannelId,
        cache: &mut CacheDirectory,
    ) -> MmResult<Retired> {
        let channel = self
            .channels
            .remove(&id)
            .ok_or_else(|| MmError::NotFound(format!("channel {}", id.0)))?;

        if !channel.requests.is_empty() {
            log::debug!(
                "Channel {}: abandoning {} requests",
                id.0,
                channel.requests.len()
            );
        }

        let objects: Vec<_> = channel
            .active
            .into_iter()
            .map(|entry| {
                release_gpu_hold(cache, entry.object.bo());
                entry.object
            })
            .collect();

        Ok(Retired {
            requests: channel.requests.len(),
            objects,
        })
    }

    /// Channels whose poll deadline has passed at `now`.
    #[must_use]
    pub fn due_channels(&self, now: Instant) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|(_, c)| c.poll_deadline.is_some_and(|d| d <= now))
            .map(|(&id, _)| id)
            .collect()
    }
}

fn release_gpu_hold(cache: &mut CacheDirectory, bo: BoId) {
    if let Err(e) = cache.retire(bo) {
        log::warn!("Retiring buffer object {}: {e}", bo.raw());
    }
}

// ===============================================================================================
// Background retirement
// ===============================================================================================

/// A thread that runs a poll callback every `period` until dropped, or until
/// the callback returns `false`.
#[derive(Debug)]
pub struct RetireWorker {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl RetireWorker {
    /// # Errors
    /// `Io` if the thread cannot be spawned.
    pub fn spawn<F>(period: Duration, mut tick: F) -> MmResult<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop, rx) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("gpumm-retire".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            if !tick() {
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

impl Drop for RetireWorker {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The thread may already have exited on its own.
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("Retire worker panicked");
        }
    }
}
