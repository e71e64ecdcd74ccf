// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A recording core and a scripted accelerator whose only purpose is to let the decoder run so we
//! can test it in isolation.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::buffer::BufferId;
use crate::buffer::CodedBuffer;
use crate::codec::h264::ref_lists::ReferenceLists;
use crate::codec::h264::slice::FrameParameters;
use crate::decoder::core::BufferPurpose;
use crate::decoder::core::DecodeCommand;
use crate::decoder::core::DecodeCore;
use crate::decoder::core::UnplayableReason;
use crate::decoder::descriptors::DescriptorSet;
use crate::decoder::mvc::View;
use crate::decoder::preprocessor::PpStatus;
use crate::decoder::preprocessor::PreprocessRequest;
use crate::decoder::preprocessor::PreprocessedBuffer;
use crate::decoder::preprocessor::Preprocessor;
use crate::decoder::preprocessor::PreprocessorError;
use crate::decoder::slots::BufferIndex;
use crate::decoder::slots::Slot;

/// What the core saw of a decode command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodeRecord {
    pub view: View,
    pub decode_index: u32,
    pub buffer: BufferIndex,
    pub slot: Option<Slot>,
    pub lists: ReferenceLists,
    pub references: DescriptorSet,
    /// Pre-processed bytes handed along with the command.
    pub preprocessed: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreEvent {
    Decode(DecodeRecord),
    PassOn(BufferId),
    NonDecoded(Option<u32>),
    OutputPartial,
    DiscardQueued,
    ReleaseReference(BufferIndex),
    CheckReferenceFrameList(Vec<Vec<u32>>),
    Unplayable(UnplayableReason),
}

/// Core that hands out fresh buffer indices and records every call.
#[derive(Debug)]
pub struct RecordingCore {
    events: Mutex<Vec<CoreEvent>>,
    next_buffer: AtomicUsize,
    fail_next_submit: AtomicBool,
    manifestation_buffers: usize,
    reference_buffers: usize,
}

impl Default for RecordingCore {
    fn default() -> Self {
        Self::new(32, 16)
    }
}

impl RecordingCore {
    pub fn new(manifestation_buffers: usize, reference_buffers: usize) -> Self {
        Self {
            events: Default::default(),
            next_buffer: AtomicUsize::new(0),
            fail_next_submit: AtomicBool::new(false),
            manifestation_buffers,
            reference_buffers,
        }
    }

    /// Rejects the next decode command.
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::Relaxed);
    }

    pub fn events(&self) -> Vec<CoreEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn decodes(&self) -> Vec<DecodeRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CoreEvent::Decode(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    /// Buffers given back through `release_reference_buffer`, in order.
    pub fn released(&self) -> Vec<BufferIndex> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CoreEvent::ReleaseReference(buffer) => Some(buffer),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: CoreEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl DecodeCore for RecordingCore {
    fn acquire_decode_buffer(&self) -> anyhow::Result<BufferIndex> {
        Ok(self.next_buffer.fetch_add(1, Ordering::Relaxed))
    }

    fn submit_decode(&self, command: DecodeCommand) -> anyhow::Result<()> {
        if self.fail_next_submit.swap(false, Ordering::Relaxed) {
            anyhow::bail!("decode of frame {} rejected", command.decode_index);
        }

        self.record(CoreEvent::Decode(DecodeRecord {
            view: command.view,
            decode_index: command.decode_index,
            buffer: command.buffer,
            slot: command.slot,
            lists: command.lists,
            references: command.references,
            preprocessed: command.preprocessed.map(|b| b.contents()).unwrap_or_default(),
        }));
        Ok(())
    }

    fn pass_on(&self, buffer: &CodedBuffer) -> anyhow::Result<()> {
        self.record(CoreEvent::PassOn(buffer.id()));
        Ok(())
    }

    fn record_non_decoded(&self, _: &CodedBuffer, parameters: &FrameParameters) {
        self.record(CoreEvent::NonDecoded(parameters.decode_index));
    }

    fn output_partial_decode_buffers(&self) {
        self.record(CoreEvent::OutputPartial);
    }

    fn discard_queued_decodes(&self) {
        self.record(CoreEvent::DiscardQueued);
    }

    fn release_reference_buffer(&self, buffer: BufferIndex) {
        self.record(CoreEvent::ReleaseReference(buffer));
    }

    fn check_reference_frame_list(&self, lists: &[Vec<u32>]) -> anyhow::Result<()> {
        self.record(CoreEvent::CheckReferenceFrameList(lists.to_vec()));
        Ok(())
    }

    fn estimated_buffer_count(&self, purpose: BufferPurpose) -> usize {
        match purpose {
            BufferPurpose::Manifestation => self.manifestation_buffers,
            BufferPurpose::Reference => self.reference_buffers,
        }
    }

    fn signal_stream_unplayable(&self, reason: UnplayableReason) {
        self.record(CoreEvent::Unplayable(reason));
    }
}

#[derive(Debug, Default)]
struct Script {
    completed: VecDeque<PreprocessedBuffer>,
    /// Statuses of the next jobs, `OK` once exhausted.
    statuses: VecDeque<PpStatus>,
    reject_next: bool,
    submitted: usize,
}

/// Accelerator that copies its input to the output buffer and completes jobs immediately.
///
/// Clones share the same script, so a test can keep one to steer the decoder's copy.
#[derive(Clone, Debug, Default)]
pub struct ScriptedPreprocessor(Arc<Mutex<Script>>);

impl ScriptedPreprocessor {
    pub fn new() -> Self {
        Default::default()
    }

    /// Completes the next jobs with `statuses`.
    pub fn push_statuses(&self, statuses: impl IntoIterator<Item = PpStatus>) {
        self.0.lock().unwrap().statuses.extend(statuses);
    }

    /// Rejects the next submitted job.
    pub fn reject_next(&self) {
        self.0.lock().unwrap().reject_next = true;
    }

    pub fn submitted(&self) -> usize {
        self.0.lock().unwrap().submitted
    }
}

impl Preprocessor for ScriptedPreprocessor {
    fn process_buffer(&mut self, request: PreprocessRequest) -> Result<(), PreprocessorError> {
        let mut script = self.0.lock().unwrap();

        if script.reject_next {
            script.reject_next = false;
            return Err(PreprocessorError::Rejected(format!("job {}", request.job)));
        }

        let len = request.input.len().min(request.max_output_size);
        let size = request
            .output
            .fill(&request.input[..len])
            .map_err(|e| PreprocessorError::Other(e.into()))?;
        let status = script.statuses.pop_front().unwrap_or(PpStatus::OK);

        script.submitted += 1;
        script.completed.push_back(PreprocessedBuffer { job: request.job, size, status });
        Ok(())
    }

    fn get_preprocessed_buffer(&mut self) -> Result<PreprocessedBuffer, PreprocessorError> {
        self.0.lock().unwrap().completed.pop_front().ok_or(PreprocessorError::NothingPending)
    }
}
