// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 (and MVC) decode submission.
//!
//! The front-end runs on the caller's thread: it validates access units, attaches a pre-processing
//! buffer and queues a job. A single worker thread pops jobs in submission order, collects the
//! accelerator output and turns every picture into a decode command, maintaining the reference
//! state of both views on the way.
//!
//! Lock order is pipeline, then decode state. The front-end only ever takes the pipeline lock.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::error;
use log::warn;

use crate::buffer::BufferId;
use crate::buffer::CodedBuffer;
use crate::buffer::HolderTag;
use crate::buffer::PreprocessorBuffer;
use crate::buffer::PreprocessorBufferPool;
use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::dpb::Released;
use crate::codec::h264::picture::Parity;
use crate::codec::h264::ref_lists::ReferenceFrameList;
use crate::codec::h264::slice::FrameParameters;
use crate::codec::h264::slice::SliceHeader;
use crate::codec::h264::H264_MAX_REFERENCE_FRAMES;
use crate::codec::h264::H264_NUM_REF_FRAME_LISTS;
use crate::decoder::core::BufferPurpose;
use crate::decoder::core::DecodeCommand;
use crate::decoder::core::DecodeCore;
use crate::decoder::core::UnplayableReason;
use crate::decoder::descriptors::DescriptorSet;
use crate::decoder::descriptors::ReferenceDescriptor;
use crate::decoder::descriptors::TranslatedReference;
use crate::decoder::mvc::BufferIndexMap;
use crate::decoder::mvc::ReleaseTarget;
use crate::decoder::mvc::View;
use crate::decoder::pipeline::Action;
use crate::decoder::pipeline::FrameJob;
use crate::decoder::pipeline::JobRing;
use crate::decoder::pipeline::PipelineError;
use crate::decoder::pipeline::WakeEvent;
use crate::decoder::preprocessor::PreprocessRequest;
use crate::decoder::preprocessor::Preprocessor;
use crate::decoder::preprocessor::Statistics;
use crate::decoder::preprocessor::StatisticsSnapshot;
use crate::decoder::slots::Allocation;
use crate::decoder::slots::BufferIndex;
use crate::decoder::slots::SlotAllocator;
use crate::decoder::DecodeError;
use crate::decoder::DecoderConfig;
use crate::decoder::Result;

/// Display buffers the core keeps for itself and never lends to the reference set.
const DISPLAY_RESERVED_BUFFERS: usize = 3;

/// State guarded by the pipeline lock.
pub(crate) struct PipelineState<P> {
    ring: JobRing,
    preprocessor: P,
    pool: PreprocessorBufferPool,
    /// Set by `discard_queued_decodes` until its job reaches the worker.
    discard_frames_in_chain: bool,
    /// A discarded frame carried new stream parameters that still need to reach the core.
    promote_stream_parameters: bool,
    /// Drop frames until the next one starting an output frame.
    discard_until_new_frame: bool,
}

/// The first field of the frame being decoded. Its buffer receives the second field too.
#[derive(Clone, Copy, Debug)]
struct FirstField {
    buffer: BufferIndex,
    frame_num: u32,
    parity: Parity,
}

impl FirstField {
    fn pairs_with(&self, header: &SliceHeader) -> bool {
        header.parity() == Some(self.parity.opposite()) && header.frame_num == self.frame_num
    }
}

#[derive(Debug)]
struct ViewState {
    dpb: Dpb,
    map: BufferIndexMap,
    first_field: Option<FirstField>,
}

/// What a decode attempt took hold of, so a failed attempt gives back exactly that.
#[derive(Debug, Default)]
struct Taken {
    /// The buffer was acquired for this picture rather than shared with its first field.
    fresh_buffer: bool,
    slot: bool,
    host_data: bool,
    mapped: bool,
}

/// One picture on its way to the core.
struct Picture<'a> {
    view: View,
    decode_index: u32,
    header: &'a SliceHeader,
    /// Header of the base view picture of the same access unit.
    base_header: &'a SliceHeader,
    /// The lists end with the base view picture of the same access unit.
    interview: bool,
    /// The buffer stays referenced once decoded.
    keep: bool,
    target: BufferIndex,
    coded_buffer: &'a CodedBuffer,
    preprocessed: Option<PreprocessorBuffer>,
}

/// State guarded by the decode state lock.
struct DecodeState {
    slots: SlotAllocator,
    /// Number of decode indices referencing each buffer.
    ref_counts: HashMap<BufferIndex, usize>,
    /// Descriptor templates of reference buffers.
    host_data: HashMap<BufferIndex, ReferenceDescriptor>,
    views: [ViewState; 2],
}

impl DecodeState {
    fn new(config: &DecoderConfig) -> Self {
        let view = || ViewState {
            dpb: Dpb::new(),
            map: BufferIndexMap::new(config.decode_buffer_count),
            first_field: None,
        };

        // The field bitfield of a decode command has one bit per slot.
        let num_slots = config.reference_slot_count.min(H264_MAX_REFERENCE_FRAMES);
        if num_slots < config.reference_slot_count {
            warn!(
                "Only {} of {} reference slots are usable",
                num_slots, config.reference_slot_count
            );
        }

        Self {
            slots: SlotAllocator::new(num_slots),
            ref_counts: HashMap::new(),
            host_data: HashMap::new(),
            views: [view(), view()],
        }
    }

    fn view(&mut self, view: View) -> &mut ViewState {
        &mut self.views[view.index()]
    }

    fn add_reference(&mut self, view: View, decode_index: u32, buffer: BufferIndex) -> Result<()> {
        self.view(view).map.insert(decode_index, buffer)?;
        *self.ref_counts.entry(buffer).or_default() += 1;
        Ok(())
    }

    /// Drops the reference `decode_index` of `view` has on its buffer. The buffer goes back to
    /// the core once nothing references it anymore.
    fn release_decode_index(&mut self, core: &impl DecodeCore, view: View, decode_index: u32) {
        let Some(buffer) = self.view(view).map.remove(decode_index) else {
            warn!("{}", DecodeError::UnknownDecodeIndex(decode_index));
            return;
        };

        let count = self.ref_counts.entry(buffer).or_default();
        *count = count.saturating_sub(1);
        if *count > 0 {
            return;
        }

        debug!(
            "Releasing reference buffer {} ({:?} view decode index {})",
            buffer, view, decode_index
        );
        self.ref_counts.remove(&buffer);
        self.host_data.remove(&buffer);
        for view in self.views.iter_mut() {
            view.map.remove_buffer(buffer);
            if view.first_field.map_or(false, |f| f.buffer == buffer) {
                view.first_field = None;
            }
        }
        self.release_slot(buffer);

        core.release_reference_buffer(buffer);
    }

    fn release_slot(&mut self, buffer: BufferIndex) {
        if let Some((granted, slot)) = self.slots.release(buffer) {
            debug!("Deferred buffer {} got slot {}", granted, slot);
            if let Some(host) = self.host_data.get_mut(&granted) {
                host.slot = slot;
            }
        }
    }

    /// Gives back what a failed decode of `decode_index` took.
    fn undo(
        &mut self,
        core: &impl DecodeCore,
        view: View,
        decode_index: u32,
        buffer: BufferIndex,
        taken: Taken,
    ) {
        debug!("Undoing decode of frame {} ({:?} view): {:?}", decode_index, view, taken);

        if taken.mapped {
            self.view(view).map.remove(decode_index);
            if let Some(count) = self.ref_counts.get_mut(&buffer) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.ref_counts.remove(&buffer);
                }
            }
        }
        if taken.host_data {
            self.host_data.remove(&buffer);
        }
        if taken.slot {
            self.release_slot(buffer);
        }
        if taken.fresh_buffer {
            core.release_reference_buffer(buffer);
        }
    }

    /// Drops the hold a non-reference base picture keeps for the dependent view of its access
    /// unit, once that view is decoded or dropped.
    fn release_interview_base(&mut self, core: &impl DecodeCore, parameters: &FrameParameters) {
        let Some(decode_index) = parameters.decode_index else {
            return;
        };
        let interview = parameters.mvc.as_ref().map_or(false, |m| m.is_interview);
        if !interview || parameters.slice_header.is_reference() {
            return;
        }

        if self.view(View::Base).map.get(decode_index).is_some() {
            self.release_decode_index(core, View::Base, decode_index);
        }
    }

    fn release_all(&mut self, view: View, released: Released, core: &impl DecodeCore) {
        for decode_index in released {
            self.release_decode_index(core, view, decode_index);
        }
    }

    fn reset(&mut self, core: &impl DecodeCore) {
        for buffer in self.ref_counts.keys() {
            core.release_reference_buffer(*buffer);
        }

        self.ref_counts.clear();
        self.host_data.clear();
        self.slots.release_all();
        for view in self.views.iter_mut() {
            view.dpb.reset();
            view.map.clear();
            view.first_field = None;
        }
    }
}

pub(crate) struct Shared<C, P> {
    config: DecoderConfig,
    core: C,
    pipeline: Mutex<PipelineState<P>>,
    decode_state: Mutex<DecodeState>,
    wake: WakeEvent,
    stopped: WakeEvent,
    terminating: AtomicBool,
    low_power: AtomicBool,
    statistics: Statistics,
}

impl<C: DecodeCore, P: Preprocessor> Shared<C, P> {
    fn new(config: DecoderConfig, core: C, preprocessor: P) -> Result<Self> {
        let pipeline = PipelineState {
            ring: JobRing::new(config.coded_frame_count),
            preprocessor,
            pool: PreprocessorBufferPool::new(
                config.preprocessor_buffer_count,
                config.preprocessor_buffer_size,
            ),
            discard_frames_in_chain: false,
            promote_stream_parameters: false,
            discard_until_new_frame: false,
        };

        Ok(Self {
            decode_state: Mutex::new(DecodeState::new(&config)),
            config,
            core,
            pipeline: Mutex::new(pipeline),
            wake: WakeEvent::new()?,
            stopped: WakeEvent::new()?,
            terminating: AtomicBool::new(false),
            low_power: AtomicBool::new(false),
            statistics: Default::default(),
        })
    }

    fn signal_worker(&self) {
        if let Err(e) = self.wake.signal() {
            error!("Failed to wake the worker: {}", e);
        }
    }

    fn insert_job(&self, job: FrameJob) -> Result<()> {
        self.pipeline.lock().unwrap().ring.insert(job).map_err(|e| match e {
            PipelineError::Full => DecodeError::RingFull,
            e => e.into(),
        })?;

        self.signal_worker();
        Ok(())
    }

    /// Attaches a pre-processing buffer to `buffer` and submits the slice data described by
    /// `header`, `data_offset` and `slices_length` to the accelerator. The job is queued on
    /// success.
    pub(super) fn submit_preprocess(
        &self,
        pipeline: &mut PipelineState<P>,
        buffer: &CodedBuffer,
        header: &SliceHeader,
        data_offset: usize,
        slices_length: usize,
    ) -> Result<BufferId> {
        let output = pipeline.pool.get_buffer().map_err(|_| DecodeError::NoPreprocessorBuffer)?;
        let id = output.id();
        buffer.attach(output.clone());

        let job = FrameJob {
            preprocessor_buffer: Some(id),
            decode_index: buffer.frame_parameters().decode_index,
            ..FrameJob::new(Action::ForwardPreprocessed)
        };

        let index = match pipeline.ring.allocate(job) {
            Ok(index) => index,
            Err(_) => {
                buffer.detach(id);
                return Err(DecodeError::RingFull);
            }
        };

        let end = data_offset.saturating_add(slices_length);
        if buffer.len() < end {
            error!("Corrupted stream: coded length {} < slice data end {}", buffer.len(), end);
            let _ = pipeline.ring.release(index);
            buffer.detach(id);
            return Err(DecodeError::CorruptedLength { len: buffer.len(), end });
        }

        if let Some(job) = pipeline.ring.get_mut(index) {
            job.hold = Some(buffer.hold(HolderTag::Pipeline));
        }

        let request = PreprocessRequest {
            job: index,
            header: header.clone(),
            max_output_size: pipeline.pool.buffer_size(),
            slices_length,
            input: buffer.data().slice(data_offset..end),
            output,
        };

        if let Err(e) = pipeline.preprocessor.process_buffer(request) {
            error!("Pre-processing job {} rejected: {}", index, e);
            let _ = pipeline.ring.release(index);
            buffer.detach(id);
            return Err(DecodeError::PreprocessorRejected(e));
        }

        pipeline.ring.enqueue(index)?;
        Ok(id)
    }

    fn input(&self, buffer: &CodedBuffer) -> Result<()> {
        let parameters = buffer.frame_parameters();

        if !parameters.new_frame || parameters.decode_index.is_none() {
            let hold = buffer.hold(HolderTag::Pipeline);
            return self.insert_job(FrameJob::with_buffer(Action::Forward, hold));
        }

        if !parameters.first_slice {
            error!("Frame {:?} does not start with its first slice", parameters.decode_index);
            return Err(DecodeError::NotFirstSlice);
        }

        let mut result = Ok(());
        {
            let mut pipeline = self.pipeline.lock().unwrap();

            let id = self.submit_preprocess(
                &mut pipeline,
                buffer,
                &parameters.slice_header,
                parameters.data_offset,
                parameters.slices_length,
            )?;

            buffer.update_frame_parameters(|p| {
                if let Some(mvc) = p.mvc.as_mut() {
                    mvc.base_preprocessor_buffer = Some(id);
                }
            });

            if self.config.mvc && parameters.mvc.is_some() {
                let parameters = buffer.frame_parameters();
                if let Err(e) = self.input_dependent(&mut pipeline, buffer, &parameters) {
                    // The base view is with the accelerator already and decodes on its own.
                    error!("Dropping dependent view of {:?}: {}", parameters.decode_index, e);
                    buffer.update_frame_parameters(|p| p.mvc = None);
                    result = Err(e);
                }
            }
        }

        self.signal_worker();
        result
    }

    fn process_loop(&self) {
        debug!("Decode worker started");

        while !self.terminating.load(Ordering::Acquire) {
            if let Err(e) = self.wake.wait(self.config.max_event_wait) {
                error!("Decode worker failed to wait for jobs: {}", e);
                break;
            }

            self.process_queued();
        }

        // Whatever is left is dropped, which releases the coded buffers.
        let residual = self.pipeline.lock().unwrap().ring.drain();
        for job in &residual {
            Self::detach_preprocessor_buffer(job);
        }
        debug!("Decode worker stopped, dropped {} jobs", residual.len());
        drop(residual);

        if let Err(e) = self.stopped.signal() {
            error!("Failed to signal worker stop: {}", e);
        }
    }

    fn process_queued(&self) {
        loop {
            let mut pipeline = self.pipeline.lock().unwrap();
            let Some(index) = pipeline.ring.pop() else {
                break;
            };

            self.process_job(&mut pipeline, index);

            if let Err(e) = pipeline.ring.release(index) {
                error!("Failed to release job {}: {}", index, e);
            }
        }
    }

    fn detach_preprocessor_buffer(job: &FrameJob) {
        if let (Some(buffer), Some(id)) = (job.coded_buffer(), job.preprocessor_buffer) {
            buffer.detach(id);
        }
    }

    /// A dependent view picture that will not be decoded no longer needs its base picture.
    fn dependent_view_dropped(&self, buffer: &CodedBuffer, id: Option<BufferId>) {
        let parameters = buffer.frame_parameters();
        if View::of_preprocessor_buffer(&parameters, id) == View::Dependent {
            self.decode_state.lock().unwrap().release_interview_base(&self.core, &parameters);
        }
    }

    fn process_job(&self, pipeline: &mut PipelineState<P>, index: usize) {
        let Some(job) = pipeline.ring.get_mut(index) else {
            return;
        };

        let queued = job.action;
        if self.low_power.load(Ordering::Acquire) || self.terminating.load(Ordering::Acquire) {
            job.action = Action::Null;
        }
        let action = job.action;

        match action {
            Action::Null => {
                debug!("Dropping job {} (sequence {})", index, job.sequence);
                Self::detach_preprocessor_buffer(job);
                if let Some(buffer) = job.coded_buffer() {
                    self.dependent_view_dropped(buffer, job.preprocessor_buffer);
                }
                // Keep the accelerator completions in step with the ring.
                if queued == Action::ForwardPreprocessed {
                    let _ = pipeline.preprocessor.get_preprocessed_buffer();
                }
            }
            Action::OutputPartial => self.core.output_partial_decode_buffers(),
            Action::DiscardQueued => {
                pipeline.discard_frames_in_chain = false;
                self.core.discard_queued_decodes();
            }
            Action::ReleaseReference(target) => self.release_reference(target),
            Action::ForwardPreprocessed => {
                if self.collect_preprocessed(pipeline, index) {
                    self.forward(pipeline, index);
                }
            }
            Action::Forward => self.forward(pipeline, index),
        }
    }

    /// Retrieves the accelerator output of job `index`. Returns whether the frame should be
    /// forwarded.
    fn collect_preprocessed(&self, pipeline: &mut PipelineState<P>, index: usize) -> bool {
        let result = pipeline.preprocessor.get_preprocessed_buffer();

        let Some(job) = pipeline.ring.get(index) else {
            return false;
        };
        let (Some(buffer), id) = (job.coded_buffer().cloned(), job.preprocessor_buffer) else {
            return false;
        };

        let done = match result {
            Ok(done) => done,
            Err(e) => {
                error!("Failed to get pre-processed buffer for job {}: {}", index, e);
                if let Some(id) = id {
                    buffer.detach(id);
                }
                self.dependent_view_dropped(&buffer, id);
                return false;
            }
        };

        self.statistics.record(done.status);

        let parameters = buffer.frame_parameters();
        let view = View::of_preprocessor_buffer(&parameters, id);
        // With a dependent view, the coded data is consumed once both views are.
        let has_dependent = self.config.mvc && parameters.mvc.is_some();
        if !has_dependent || view == View::Dependent {
            buffer.set_used(0);
        }

        let mut moving = false;
        if done.status.has_errors() && !self.config.allow_bad_preprocessed_frames {
            warn!("Pre-processing of job {} failed with status {:#x}", index, done.status.0);
            moving = true;
        }
        if done.job != index {
            error!("Pre-processed job {} does not match queued job {}", done.job, index);
            moving = true;
        }

        if parameters.first_parsed_parameters_for_output_frame {
            pipeline.discard_until_new_frame = false;
        }

        if pipeline.discard_frames_in_chain || moving || pipeline.discard_until_new_frame {
            debug!("Discarding frame {:?} ({:?} view)", parameters.decode_index, view);

            if parameters.new_stream_parameters {
                pipeline.promote_stream_parameters = true;
            }

            if parameters.first_parsed_parameters_for_output_frame {
                self.core.record_non_decoded(&buffer, &parameters);
            } else {
                self.core.output_partial_decode_buffers();
            }

            if let Some(id) = id {
                buffer.detach(id);
            }
            if view == View::Dependent {
                self.dependent_view_dropped(&buffer, id);
            }

            if moving {
                pipeline.discard_until_new_frame = true;
            }

            return false;
        }

        if let Some(output) = id.and_then(|id| buffer.attached(id)) {
            output.set_used(done.size);
        }

        true
    }

    fn forward(&self, pipeline: &mut PipelineState<P>, index: usize) {
        if self.terminating.load(Ordering::Acquire) {
            return;
        }

        let Some(job) = pipeline.ring.get(index) else {
            return;
        };
        let (Some(buffer), id) = (job.coded_buffer().cloned(), job.preprocessor_buffer) else {
            return;
        };

        if pipeline.promote_stream_parameters && buffer.frame_parameters().stream_parameters_present
        {
            buffer.update_frame_parameters(|p| p.new_stream_parameters = true);
            pipeline.promote_stream_parameters = false;
        }
        let parameters = buffer.frame_parameters();

        if !parameters.new_frame || parameters.decode_index.is_none() {
            if let Err(e) = self.core.pass_on(&buffer) {
                error!("Core failed to handle unit {}: {}", buffer.id(), e);
            }
            return;
        }

        let view = View::of_preprocessor_buffer(&parameters, id);
        let result = self.decode_frame(view, &buffer, &parameters, id);

        // The decode command carries its own reference to the pre-processed data.
        if let Some(id) = id {
            buffer.detach(id);
        }

        if let Err(e) = result {
            error!("Failed to decode frame {:?} ({:?} view): {}", parameters.decode_index, view, e);

            if parameters.new_stream_parameters {
                pipeline.promote_stream_parameters = true;
            }

            if parameters.first_parsed_parameters_for_output_frame {
                self.core.record_non_decoded(&buffer, &parameters);
                self.core.output_partial_decode_buffers();
            }

            pipeline.discard_until_new_frame = true;
        }
    }

    fn check_playable(&self, header: &SliceHeader) -> Result<()> {
        let manifestation = self.core.estimated_buffer_count(BufferPurpose::Manifestation);
        let reference = self.core.estimated_buffer_count(BufferPurpose::Reference);
        let num_ref_frames = header.num_ref_frames as usize;

        if num_ref_frames > manifestation.saturating_sub(DISPLAY_RESERVED_BUFFERS)
            || num_ref_frames > reference
        {
            error!(
                "Stream needs {} reference frames, only {} display and {} reference buffers",
                num_ref_frames, manifestation, reference
            );
            self.core.signal_stream_unplayable(UnplayableReason::InsufficientMemory);
            return Err(DecodeError::InsufficientMemory { num_ref_frames: header.num_ref_frames });
        }

        Ok(())
    }

    fn decode_frame(
        &self,
        view: View,
        buffer: &CodedBuffer,
        parameters: &FrameParameters,
        preprocessor_buffer: Option<BufferId>,
    ) -> Result<()> {
        let mut state = self.decode_state.lock().unwrap();

        let result = self.decode_picture(&mut state, view, buffer, parameters, preprocessor_buffer);

        if view == View::Dependent {
            state.release_interview_base(&self.core, parameters);
        }

        result
    }

    /// Builds and submits the decode command of one picture, then runs reference marking.
    fn decode_picture(
        &self,
        state: &mut DecodeState,
        view: View,
        buffer: &CodedBuffer,
        parameters: &FrameParameters,
        preprocessor_buffer: Option<BufferId>,
    ) -> Result<()> {
        let decode_index = parameters.decode_index.ok_or(DecodeError::NotFirstSlice)?;
        let (header, interview) = match view {
            View::Base => (&parameters.slice_header, false),
            View::Dependent => {
                let mvc = parameters.mvc.as_ref().ok_or(DecodeError::MissingMvcParameters)?;
                (&mvc.dep_slice_header, mvc.is_interview)
            }
        };
        // The base picture of an inter-view reference stays mapped until the dependent view is
        // decoded.
        let interview_base = view == View::Base
            && parameters.mvc.as_ref().map_or(false, |m| m.is_interview)
            && self.config.mvc;
        let first_parsed = parameters.first_parsed_parameters_for_output_frame;

        let first_field = state.view(view).first_field.take();
        let second_field = first_field.filter(|f| !first_parsed && f.pairs_with(header));

        let mut taken = Taken::default();
        let target = match second_field {
            Some(first) => {
                debug!("Field {} completes the frame in buffer {}", decode_index, first.buffer);
                first.buffer
            }
            None => {
                if header.field_pic_flag && !first_parsed {
                    warn!("Field {} has no first field to pair with", decode_index);
                }
                taken.fresh_buffer = true;
                self.core.acquire_decode_buffer()?
            }
        };

        let picture = Picture {
            view,
            decode_index,
            header,
            base_header: &parameters.slice_header,
            interview,
            keep: header.is_reference() || interview_base,
            target,
            coded_buffer: buffer,
            preprocessed: preprocessor_buffer.and_then(|id| buffer.attached(id)),
        };

        if let Err(e) = self.submit_picture(state, &picture, &mut taken) {
            state.undo(&self.core, view, decode_index, target, taken);
            return Err(e);
        }

        if let (None, true, Some(parity)) = (second_field, first_parsed, header.parity()) {
            state.view(view).first_field =
                Some(FirstField { buffer: target, frame_num: header.frame_num, parity });
        }

        if header.is_reference() {
            // An IDR in the base view starts over in both views.
            let flush = header.idr || (view == View::Dependent && parameters.slice_header.idr);

            let mut released = vec![];
            let marking =
                state.view(view).dpb.mark_into(header, decode_index, flush, &mut released);
            state.release_all(view, released, &self.core);
            marking?;
        }

        Ok(())
    }

    /// Claims a slot and a mapping for `picture` if it stays referenced, then hands its decode
    /// command to the core. Everything claimed is recorded in `taken`.
    fn submit_picture(
        &self,
        state: &mut DecodeState,
        picture: &Picture<'_>,
        taken: &mut Taken,
    ) -> Result<()> {
        let Picture { view, decode_index, header, target, .. } = *picture;

        let mut lists = state.view(view).dpb.build_ref_lists(header);
        if picture.interview {
            lists.append_interview(decode_index, picture.base_header);
        }

        // A second field shares the slot of its first field.
        let mut slot = state.slots.slot_of(target);
        if picture.keep {
            if header.is_reference() {
                self.check_playable(header)?;
            }

            if slot.is_none() {
                let waiting = state.slots.outstanding() == Some(target);
                slot = match state.slots.allocate(target)? {
                    Allocation::Granted(slot) => Some(slot),
                    Allocation::Deferred => None,
                };
                taken.slot = !waiting;
            }

            state.add_reference(view, decode_index, target)?;
            taken.mapped = true;

            if !state.host_data.contains_key(&target) {
                let host =
                    ReferenceDescriptor::for_picture(header, target, slot.unwrap_or_default());
                state.host_data.insert(target, host);
                taken.host_data = true;
            }
        }

        let translate = |list: &ReferenceFrameList| -> Vec<TranslatedReference> {
            list.iter()
                .enumerate()
                .filter_map(|(i, detail)| {
                    // The inter-view reference is always last and lives in the base view.
                    let last = i + 1 == list.len();
                    let map_view = if picture.interview && last { View::Base } else { view };
                    let map = &state.views[map_view.index()].map;
                    let Some(buffer) = map.get(detail.decode_index) else {
                        warn!(
                            "Reference {} of frame {} is not mapped",
                            detail.decode_index, decode_index
                        );
                        return None;
                    };
                    let Some(slot) = state.slots.slot_of(buffer) else {
                        warn!("Reference buffer {} has no slot, skipping", buffer);
                        return None;
                    };

                    Some(TranslatedReference { detail: *detail, buffer, slot })
                })
                .collect()
        };

        let translated: [Vec<TranslatedReference>; H264_NUM_REF_FRAME_LISTS] =
            [translate(&lists.p), translate(&lists.b0), translate(&lists.b1)];
        let references = DescriptorSet::build(&translated, &state.host_data);

        log::trace!("Frame {} ({:?} view) references: {:#?}", decode_index, view, references);

        self.core.submit_decode(DecodeCommand {
            view,
            decode_index,
            buffer: target,
            slot,
            slice_header: header.clone(),
            coded_buffer: picture.coded_buffer.clone(),
            preprocessed: picture.preprocessed.clone(),
            lists,
            references,
        })?;

        Ok(())
    }

    fn release_reference(&self, target: ReleaseTarget) {
        let mut state = self.decode_state.lock().unwrap();

        match target {
            ReleaseTarget::All => {
                debug!("Releasing all reference frames");
                state.reset(&self.core);
            }
            ReleaseTarget::Frame { view, decode_index } => {
                state.release_decode_index(&self.core, view, decode_index);
            }
        }
    }

    fn discard_queued_decodes(&self) -> Result<()> {
        let mut pipeline = self.pipeline.lock().unwrap();
        pipeline
            .ring
            .insert(FrameJob::new(Action::DiscardQueued))
            .map_err(|_| DecodeError::RingFull)?;
        pipeline.discard_frames_in_chain = true;
        drop(pipeline);

        self.signal_worker();
        Ok(())
    }

    fn check_reference_frame_list(&self, lists: &[Vec<u32>]) -> Result<()> {
        if lists.len() > H264_NUM_REF_FRAME_LISTS {
            error!("Got {} reference lists", lists.len());
            return Err(DecodeError::TooManyReferenceLists(lists.len()));
        }

        let pipeline = self.pipeline.lock().unwrap();
        // Frames still in the pipeline are not known to the core yet.
        let lists: Vec<Vec<u32>> = lists
            .iter()
            .map(|list| list.iter().copied().filter(|&i| !pipeline.ring.pending(i)).collect())
            .collect();

        Ok(self.core.check_reference_frame_list(&lists)?)
    }
}

/// H.264 decode submission front-end.
///
/// Dropping the decoder stops the worker thread and releases every queued job.
pub struct H264Decoder<C: DecodeCore, P: Preprocessor> {
    shared: Arc<Shared<C, P>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl<C: DecodeCore, P: Preprocessor> H264Decoder<C, P> {
    pub fn new(config: DecoderConfig, core: C, preprocessor: P) -> Result<Self> {
        let shared = Arc::new(Shared::new(config, core, preprocessor)?);

        let worker = shared.clone();
        let worker_thread = Some(thread::spawn(move || worker.process_loop()));

        Ok(Self { shared, worker_thread })
    }

    pub fn core(&self) -> &C {
        &self.shared.core
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.shared.config
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        match &self.worker_thread {
            Some(worker_thread) => !worker_thread.is_finished(),
            None => false,
        }
    }

    /// Whether no job is queued or being processed.
    pub fn is_idle(&self) -> bool {
        self.shared.pipeline.lock().unwrap().ring.num_used() == 0
    }

    /// Submits one coded access unit.
    ///
    /// Units without picture data are forwarded in order with the pictures around them. Pictures
    /// are sent to the accelerator right away and decoded once it is done with them.
    ///
    /// When the dependent view of an MVC unit cannot be submitted, the error is returned but the
    /// base view is still decoded on its own.
    pub fn input(&self, buffer: &CodedBuffer) -> Result<()> {
        self.shared.input(buffer)
    }

    /// Releases the reference the decoder holds through an externally visible decode index. See
    /// [`crate::decoder::mvc::encode_dependent_index`] for dependent view indices.
    pub fn release_reference_frame(&self, decode_index: i64) -> Result<()> {
        let Some(target) = ReleaseTarget::from_encoded(decode_index) else {
            warn!("Ignoring release of invalid decode index {}", decode_index);
            return Ok(());
        };

        self.shared.insert_job(FrameJob::new(Action::ReleaseReference(target)))
    }

    pub fn release_all_reference_frames(&self) -> Result<()> {
        self.shared.insert_job(FrameJob::new(Action::ReleaseReference(ReleaseTarget::All)))
    }

    /// Validates reference lists against the core, ignoring frames that are still queued.
    pub fn check_reference_frame_list(&self, lists: &[Vec<u32>]) -> Result<()> {
        self.shared.check_reference_frame_list(lists)
    }

    /// Drops every frame currently queued, then asks the core to drop its queue too.
    pub fn discard_queued_decodes(&self) -> Result<()> {
        self.shared.discard_queued_decodes()
    }

    pub fn output_partial_decode_buffers(&self) -> Result<()> {
        self.shared.insert_job(FrameJob::new(Action::OutputPartial))
    }

    /// While set, queued jobs are dropped instead of processed.
    pub fn set_low_power(&self, low_power: bool) {
        self.shared.low_power.store(low_power, Ordering::Release);
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.statistics.snapshot()
    }

    fn stop(&mut self) {
        self.shared.terminating.store(true, Ordering::Release);
        self.shared.signal_worker();

        if let Some(worker_thread) = self.worker_thread.take() {
            match self.shared.stopped.wait(self.shared.config.shutdown_timeout) {
                Ok(true) => {
                    let _ = worker_thread.join();
                }
                Ok(false) => error!("Decode worker did not stop in time"),
                Err(e) => error!("Failed to wait for the decode worker: {}", e),
            }
        }

        for job in self.shared.pipeline.lock().unwrap().ring.drain() {
            Shared::<C, P>::detach_preprocessor_buffer(&job);
        }
    }
}

impl<C: DecodeCore, P: Preprocessor> Drop for H264Decoder<C, P> {
    fn drop(&mut self) {
        self.stop();
    }
}
