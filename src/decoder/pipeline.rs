// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The ring of in-flight jobs between the front-end and the worker thread.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::epoll::EpollTimeout;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::buffer::BufferHold;
use crate::buffer::BufferId;
use crate::buffer::CodedBuffer;
use crate::decoder::mvc::ReleaseTarget;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no free job slot")]
    Full,
    #[error("job slot {0} is not in use")]
    NotInUse(usize),
    #[error("failed to create EventFd: {0}")]
    EventFd(Errno),
    #[error("failed to create Epoll: {0}")]
    Epoll(Errno),
    #[error("failed to add poll FDs to Epoll: {0}")]
    EpollAdd(Errno),
    #[error("failed to signal event: {0}")]
    Signal(Errno),
    #[error("failed to wait for event: {0}")]
    Wait(Errno),
    #[error("wait timeout out of range: {0:?}")]
    Timeout(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Drop the job without side effects.
    Null,
    /// Hand the unit to the decode path as is.
    Forward,
    /// Collect the accelerator output, then forward.
    ForwardPreprocessed,
    ReleaseReference(ReleaseTarget),
    DiscardQueued,
    OutputPartial,
}

impl Action {
    pub fn carries_frame(&self) -> bool {
        matches!(self, Action::Forward | Action::ForwardPreprocessed)
    }
}

#[derive(Debug)]
pub struct FrameJob {
    pub action: Action,
    /// Position in submission order, assigned when the job is queued.
    pub sequence: u64,
    /// The pipeline's hold on the coded buffer, for jobs that carry one.
    pub hold: Option<BufferHold>,
    pub preprocessor_buffer: Option<BufferId>,
    pub decode_index: Option<u32>,
}

impl FrameJob {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            sequence: 0,
            hold: None,
            preprocessor_buffer: None,
            decode_index: None,
        }
    }

    pub fn with_buffer(action: Action, hold: BufferHold) -> Self {
        let decode_index = hold.buffer().frame_parameters().decode_index;
        Self { hold: Some(hold), decode_index, ..Self::new(action) }
    }

    pub fn coded_buffer(&self) -> Option<&CodedBuffer> {
        self.hold.as_ref().map(|h| h.buffer())
    }
}

/// Fixed capacity arena of jobs plus the FIFO of queued slots.
#[derive(Debug)]
pub struct JobRing {
    slots: Vec<Option<FrameJob>>,
    free: Vec<usize>,
    queue: VecDeque<usize>,
    next_sequence: u64,
}

impl JobRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity).rev().collect(),
            queue: VecDeque::with_capacity(capacity),
            next_sequence: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_used(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Takes a free slot for `job` without queuing it.
    pub fn allocate(&mut self, job: FrameJob) -> Result<usize, PipelineError> {
        let index = self.free.pop().ok_or(PipelineError::Full)?;
        self.slots[index] = Some(job);
        Ok(index)
    }

    pub fn enqueue(&mut self, index: usize) -> Result<(), PipelineError> {
        let sequence = self.next_sequence;
        let job = self.get_mut(index).ok_or(PipelineError::NotInUse(index))?;
        job.sequence = sequence;
        self.next_sequence += 1;
        self.queue.push_back(index);
        Ok(())
    }

    /// Allocates and queues `job`.
    pub fn insert(&mut self, job: FrameJob) -> Result<usize, PipelineError> {
        let index = self.allocate(job)?;
        self.enqueue(index)?;
        Ok(index)
    }

    /// Next queued slot. The job stays allocated until released.
    pub fn pop(&mut self) -> Option<usize> {
        self.queue.pop_front()
    }

    pub fn get(&self, index: usize) -> Option<&FrameJob> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut FrameJob> {
        self.slots.get_mut(index)?.as_mut()
    }

    /// Frees slot `index` and returns its job.
    pub fn release(&mut self, index: usize) -> Result<FrameJob, PipelineError> {
        let job = self
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(PipelineError::NotInUse(index))?;

        self.queue.retain(|&i| i != index);
        self.free.push(index);
        Ok(job)
    }

    /// Whether a frame with `decode_index` is still waiting to be forwarded.
    pub fn pending(&self, decode_index: u32) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|job| job.action.carries_frame() && job.decode_index == Some(decode_index))
    }

    /// Releases every job, queued ones first in queue order.
    pub fn drain(&mut self) -> Vec<FrameJob> {
        let mut jobs = vec![];

        while let Some(index) = self.queue.pop_front() {
            jobs.extend(self.slots[index].take());
        }
        jobs.extend(self.slots.iter_mut().filter_map(Option::take));

        self.free = (0..self.slots.len()).rev().collect();
        jobs
    }
}

/// Counting event a thread can block on with a timeout.
pub struct WakeEvent {
    event: EventFd,
    epoll: Epoll,
}

impl WakeEvent {
    pub fn new() -> Result<Self, PipelineError> {
        let event = EventFd::from_flags(EfdFlags::EFD_SEMAPHORE).map_err(PipelineError::EventFd)?;
        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(PipelineError::Epoll)?;
        epoll
            .add(event.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1))
            .map_err(PipelineError::EpollAdd)?;

        Ok(Self { event, epoll })
    }

    pub fn signal(&self) -> Result<(), PipelineError> {
        self.event.write(1).map_err(PipelineError::Signal)?;
        Ok(())
    }

    /// Waits for one signal. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> Result<bool, PipelineError> {
        let mut events = [EpollEvent::empty()];
        let epoll_timeout =
            EpollTimeout::try_from(timeout).map_err(|_| PipelineError::Timeout(timeout))?;

        match self.epoll.wait(&mut events, epoll_timeout) {
            Ok(0) | Err(Errno::EINTR) => return Ok(false),
            Ok(_) => (),
            Err(e) => return Err(PipelineError::Wait(e)),
        }

        self.event.read().map_err(PipelineError::Wait)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::Action;
    use super::FrameJob;
    use super::JobRing;
    use super::PipelineError;
    use super::WakeEvent;
    use crate::buffer::BufferId;
    use crate::buffer::CodedBuffer;
    use crate::buffer::HolderTag;
    use crate::codec::h264::slice::FrameParameters;

    fn frame_job(decode_index: u32) -> (CodedBuffer, FrameJob) {
        let parameters = FrameParameters { decode_index: Some(decode_index), ..Default::default() };
        let buffer = CodedBuffer::new(BufferId(decode_index), Bytes::new(), parameters);
        let job = FrameJob::with_buffer(Action::Forward, buffer.hold(HolderTag::Pipeline));
        (buffer, job)
    }

    #[test]
    fn jobs_come_out_in_submission_order() {
        let mut ring = JobRing::new(4);

        for i in 0..3 {
            ring.insert(frame_job(i).1).unwrap();
        }

        let mut sequences = vec![];
        while let Some(index) = ring.pop() {
            let job = ring.release(index).unwrap();
            sequences.push((job.sequence, job.decode_index));
            // Freed slots are reused without disturbing the order.
            if job.sequence == 0 {
                ring.insert(frame_job(3).1).unwrap();
            }
        }

        assert_eq!(sequences, vec![(0, Some(0)), (1, Some(1)), (2, Some(2)), (3, Some(3))]);
    }

    #[test]
    fn full_ring_rejects_jobs() {
        let mut ring = JobRing::new(2);

        ring.insert(FrameJob::new(Action::OutputPartial)).unwrap();
        let index = ring.allocate(FrameJob::new(Action::DiscardQueued)).unwrap();
        assert_eq!(
            ring.insert(FrameJob::new(Action::OutputPartial)).unwrap_err(),
            PipelineError::Full
        );

        ring.release(index).unwrap();
        assert_eq!(ring.release(index).unwrap_err(), PipelineError::NotInUse(index));
        assert_eq!(ring.num_used(), 1);
    }

    #[test]
    fn released_job_drops_its_hold() {
        let mut ring = JobRing::new(1);
        let (buffer, job) = frame_job(0);

        let index = ring.insert(job).unwrap();
        assert_eq!(buffer.hold_count(HolderTag::Pipeline), 1);
        assert!(ring.pending(0));
        assert!(!ring.pending(1));

        drop(ring.release(index).unwrap());
        assert_eq!(buffer.hold_count(HolderTag::Pipeline), 0);
        assert!(!ring.pending(0));
    }

    #[test]
    fn drain_empties_the_ring() {
        let mut ring = JobRing::new(3);
        let (buffer, job) = frame_job(5);

        ring.insert(job).unwrap();
        ring.allocate(FrameJob::new(Action::OutputPartial)).unwrap();

        let jobs = ring.drain();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].decode_index, Some(5));
        drop(jobs);

        assert_eq!(buffer.hold_count(HolderTag::Pipeline), 0);
        assert_eq!(ring.num_used(), 0);
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn wake_event_counts_signals() {
        let event = WakeEvent::new().unwrap();

        assert!(!event.wait(Duration::from_millis(1)).unwrap());

        event.signal().unwrap();
        event.signal().unwrap();
        assert!(event.wait(Duration::from_millis(10)).unwrap());
        assert!(event.wait(Duration::from_millis(10)).unwrap());
        assert!(!event.wait(Duration::from_millis(1)).unwrap());
    }
}
