// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Buffer handles shared between the caller, the pipeline and the decode core.
//!
//! A [`CodedBuffer`] is a clone-counted handle to one access unit. Subsystems that keep it alive
//! across an asynchronous boundary take a tagged [`BufferHold`], which is released when dropped.
//! [`PreprocessorBuffer`]s come from a fixed [`PreprocessorBufferPool`] and go back to it once the
//! last handle is gone.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use bytes::Bytes;
use thiserror::Error;

use crate::codec::h264::slice::FrameParameters;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("no pre-processing buffer available")]
    PoolExhausted,
    #[error("{len} bytes do not fit in a buffer of {capacity} bytes")]
    Overflow { len: usize, capacity: usize },
}

/// Who holds a reference on a coded buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HolderTag {
    /// The pre-processing pipeline, between submission and forwarding.
    Pipeline,
    /// The decode core, while the frame is being decoded.
    DecodeContext,
    /// The buffer pool the coded buffer came from.
    Pool,
}

impl HolderTag {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            HolderTag::Pipeline => 0,
            HolderTag::DecodeContext => 1,
            HolderTag::Pool => 2,
        }
    }
}

struct CodedBufferInner {
    id: BufferId,
    data: Bytes,
    used: AtomicUsize,
    holds: [AtomicUsize; HolderTag::COUNT],
    attached: Mutex<Vec<PreprocessorBuffer>>,
    parameters: Mutex<FrameParameters>,
}

/// One access unit of coded data plus what the parser found out about it.
#[derive(Clone)]
pub struct CodedBuffer(Arc<CodedBufferInner>);

impl CodedBuffer {
    pub fn new(id: BufferId, data: Bytes, parameters: FrameParameters) -> Self {
        let used = data.len();

        Self(Arc::new(CodedBufferInner {
            id,
            data,
            used: AtomicUsize::new(used),
            holds: Default::default(),
            attached: Mutex::new(Vec::new()),
            parameters: Mutex::new(parameters),
        }))
    }

    pub fn id(&self) -> BufferId {
        self.0.id
    }

    pub fn data(&self) -> Bytes {
        self.0.data.clone()
    }

    /// Length of the coded data.
    pub fn len(&self) -> usize {
        self.0.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    /// Number of bytes still to be consumed. Zero once the data has been pre-processed.
    pub fn used(&self) -> usize {
        self.0.used.load(Ordering::Acquire)
    }

    pub fn set_used(&self, used: usize) {
        self.0.used.store(used, Ordering::Release);
    }

    pub fn frame_parameters(&self) -> FrameParameters {
        self.0.parameters.lock().unwrap().clone()
    }

    pub fn update_frame_parameters(&self, f: impl FnOnce(&mut FrameParameters)) {
        f(&mut self.0.parameters.lock().unwrap())
    }

    /// Takes a reference on behalf of `tag`. Dropping the returned hold releases it.
    pub fn hold(&self, tag: HolderTag) -> BufferHold {
        self.0.holds[tag.index()].fetch_add(1, Ordering::AcqRel);
        BufferHold { buffer: self.clone(), tag }
    }

    /// Number of live holds taken by `tag`.
    pub fn hold_count(&self, tag: HolderTag) -> usize {
        self.0.holds[tag.index()].load(Ordering::Acquire)
    }

    pub fn attach(&self, buffer: PreprocessorBuffer) {
        self.0.attached.lock().unwrap().push(buffer);
    }

    /// Removes the attached buffer `id`, returning it.
    pub fn detach(&self, id: BufferId) -> Option<PreprocessorBuffer> {
        let mut attached = self.0.attached.lock().unwrap();
        let position = attached.iter().position(|b| b.id() == id)?;
        Some(attached.remove(position))
    }

    pub fn attached(&self, id: BufferId) -> Option<PreprocessorBuffer> {
        self.0.attached.lock().unwrap().iter().find(|b| b.id() == id).cloned()
    }

    pub fn attached_ids(&self) -> Vec<BufferId> {
        self.0.attached.lock().unwrap().iter().map(|b| b.id()).collect()
    }
}

impl fmt::Debug for CodedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodedBuffer")
            .field("id", &self.0.id)
            .field("len", &self.0.data.len())
            .field("used", &self.used())
            .field("attached", &self.attached_ids())
            .finish()
    }
}

/// A tagged reference on a [`CodedBuffer`].
#[derive(Debug)]
pub struct BufferHold {
    buffer: CodedBuffer,
    tag: HolderTag,
}

impl BufferHold {
    pub fn buffer(&self) -> &CodedBuffer {
        &self.buffer
    }

    pub fn tag(&self) -> HolderTag {
        self.tag
    }
}

impl Drop for BufferHold {
    fn drop(&mut self) {
        self.buffer.0.holds[self.tag.index()].fetch_sub(1, Ordering::AcqRel);
    }
}

struct Slab {
    id: BufferId,
    data: Vec<u8>,
}

type SlabQueue = Mutex<VecDeque<Slab>>;

struct PreprocessorBufferInner {
    id: BufferId,
    data: Mutex<Vec<u8>>,
    used: AtomicUsize,
    pool: Weak<SlabQueue>,
}

impl Drop for PreprocessorBufferInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let data = std::mem::take(&mut *self.data.lock().unwrap());
            pool.lock().unwrap().push_back(Slab { id: self.id, data });
        }
    }
}

/// Output buffer of the accelerator. Cloning shares the same storage.
#[derive(Clone)]
pub struct PreprocessorBuffer(Arc<PreprocessorBufferInner>);

impl PreprocessorBuffer {
    pub fn id(&self) -> BufferId {
        self.0.id
    }

    pub fn capacity(&self) -> usize {
        self.0.data.lock().unwrap().len()
    }

    /// Number of valid bytes.
    pub fn used(&self) -> usize {
        self.0.used.load(Ordering::Acquire)
    }

    pub fn set_used(&self, used: usize) {
        self.0.used.store(used, Ordering::Release);
    }

    /// Copies `bytes` to the start of the buffer and returns the new used size.
    pub fn fill(&self, bytes: &[u8]) -> Result<usize, BufferError> {
        let mut data = self.0.data.lock().unwrap();
        if bytes.len() > data.len() {
            return Err(BufferError::Overflow { len: bytes.len(), capacity: data.len() });
        }

        data[..bytes.len()].copy_from_slice(bytes);
        self.set_used(bytes.len());
        Ok(bytes.len())
    }

    /// The valid part of the buffer.
    pub fn contents(&self) -> Vec<u8> {
        let data = self.0.data.lock().unwrap();
        data[..self.used().min(data.len())].to_vec()
    }
}

impl fmt::Debug for PreprocessorBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreprocessorBuffer")
            .field("id", &self.0.id)
            .field("used", &self.used())
            .finish()
    }
}

/// Fixed set of pre-processing buffers.
pub struct PreprocessorBufferPool {
    pool: Arc<SlabQueue>,
    size: usize,
}

impl PreprocessorBufferPool {
    pub fn new(count: usize, size: usize) -> Self {
        let slabs = (0..count)
            .map(|i| Slab { id: BufferId(i as u32), data: vec![0; size] })
            .collect();

        Self { pool: Arc::new(Mutex::new(slabs)), size }
    }

    /// Size of every buffer in the pool.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    pub fn get_buffer(&self) -> Result<PreprocessorBuffer, BufferError> {
        let slab = self.pool.lock().unwrap().pop_front().ok_or(BufferError::PoolExhausted)?;

        Ok(PreprocessorBuffer(Arc::new(PreprocessorBufferInner {
            id: slab.id,
            data: Mutex::new(slab.data),
            used: AtomicUsize::new(0),
            pool: Arc::downgrade(&self.pool),
        })))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::BufferError;
    use super::BufferId;
    use super::CodedBuffer;
    use super::HolderTag;
    use super::PreprocessorBufferPool;

    #[test]
    fn holds_are_counted_per_tag() {
        let buffer = CodedBuffer::new(BufferId(1), Bytes::from_static(b"abc"), Default::default());

        let pipeline = buffer.hold(HolderTag::Pipeline);
        let context = buffer.hold(HolderTag::DecodeContext);
        let _context2 = buffer.hold(HolderTag::DecodeContext);
        assert_eq!(buffer.hold_count(HolderTag::Pipeline), 1);
        assert_eq!(buffer.hold_count(HolderTag::DecodeContext), 2);

        drop(pipeline);
        drop(context);
        assert_eq!(buffer.hold_count(HolderTag::Pipeline), 0);
        assert_eq!(buffer.hold_count(HolderTag::DecodeContext), 1);
        assert_eq!(buffer.hold_count(HolderTag::Pool), 0);
    }

    #[test]
    fn pool_buffers_come_back_on_drop() {
        let pool = PreprocessorBufferPool::new(2, 8);

        let a = pool.get_buffer().unwrap();
        let b = pool.get_buffer().unwrap();
        assert_eq!(pool.get_buffer().unwrap_err(), BufferError::PoolExhausted);

        let coded = CodedBuffer::new(BufferId(0), Bytes::new(), Default::default());
        coded.attach(a.clone());
        drop(a);
        // Still attached.
        assert_eq!(pool.available(), 0);

        let id = b.id();
        drop(b);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.get_buffer().unwrap().id(), id);

        let attached = coded.attached_ids()[0];
        drop(coded.detach(attached));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn fill_checks_capacity() {
        let pool = PreprocessorBufferPool::new(1, 4);
        let buffer = pool.get_buffer().unwrap();

        assert_eq!(buffer.fill(b"abc"), Ok(3));
        assert_eq!(buffer.contents(), b"abc");
        assert_eq!(buffer.fill(b"abcde"), Err(BufferError::Overflow { len: 5, capacity: 4 }));
    }
}
