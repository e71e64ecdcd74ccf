// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contract of the decode-command core that owns decode buffers and talks to the hardware.

use std::sync::Arc;

use crate::buffer::CodedBuffer;
use crate::buffer::PreprocessorBuffer;
use crate::codec::h264::ref_lists::ReferenceLists;
use crate::codec::h264::slice::FrameParameters;
use crate::codec::h264::slice::SliceHeader;
use crate::decoder::descriptors::DescriptorSet;
use crate::decoder::mvc::View;
use crate::decoder::slots::BufferIndex;
use crate::decoder::slots::Slot;

/// What an estimated buffer count is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferPurpose {
    /// Buffers that can be displayed.
    Manifestation,
    /// Buffers that can be kept as reference pictures.
    Reference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnplayableReason {
    /// The stream needs more reference frames than there is memory for.
    InsufficientMemory,
}

/// Everything the core needs to decode one picture.
#[derive(Debug)]
pub struct DecodeCommand {
    pub view: View,
    pub decode_index: u32,
    /// Decode buffer the picture is decoded into.
    pub buffer: BufferIndex,
    /// Reference slot of the picture, if it is a reference picture and got one.
    pub slot: Option<Slot>,
    pub slice_header: SliceHeader,
    pub coded_buffer: CodedBuffer,
    pub preprocessed: Option<PreprocessorBuffer>,
    /// Reference lists in decode indices, before translation.
    pub lists: ReferenceLists,
    pub references: DescriptorSet,
}

/// The decode-command core.
///
/// Implementations must not call back into the decoder from these methods: they run on the
/// worker thread with decoder locks held.
pub trait DecodeCore: Send + Sync + 'static {
    fn acquire_decode_buffer(&self) -> anyhow::Result<BufferIndex>;

    fn submit_decode(&self, command: DecodeCommand) -> anyhow::Result<()>;

    /// Handles a unit without picture data.
    fn pass_on(&self, buffer: &CodedBuffer) -> anyhow::Result<()>;

    /// Accounts for a frame that will never be decoded.
    fn record_non_decoded(&self, buffer: &CodedBuffer, parameters: &FrameParameters);

    fn output_partial_decode_buffers(&self);

    fn discard_queued_decodes(&self);

    /// The decoder no longer references `buffer`.
    fn release_reference_buffer(&self, buffer: BufferIndex);

    /// Validates reference lists given as decode indices.
    fn check_reference_frame_list(&self, lists: &[Vec<u32>]) -> anyhow::Result<()>;

    fn estimated_buffer_count(&self, purpose: BufferPurpose) -> usize;

    fn signal_stream_unplayable(&self, reason: UnplayableReason);
}

impl<T: DecodeCore> DecodeCore for Arc<T> {
    fn acquire_decode_buffer(&self) -> anyhow::Result<BufferIndex> {
        self.as_ref().acquire_decode_buffer()
    }

    fn submit_decode(&self, command: DecodeCommand) -> anyhow::Result<()> {
        self.as_ref().submit_decode(command)
    }

    fn pass_on(&self, buffer: &CodedBuffer) -> anyhow::Result<()> {
        self.as_ref().pass_on(buffer)
    }

    fn record_non_decoded(&self, buffer: &CodedBuffer, parameters: &FrameParameters) {
        self.as_ref().record_non_decoded(buffer, parameters)
    }

    fn output_partial_decode_buffers(&self) {
        self.as_ref().output_partial_decode_buffers()
    }

    fn discard_queued_decodes(&self) {
        self.as_ref().discard_queued_decodes()
    }

    fn release_reference_buffer(&self, buffer: BufferIndex) {
        self.as_ref().release_reference_buffer(buffer)
    }

    fn check_reference_frame_list(&self, lists: &[Vec<u32>]) -> anyhow::Result<()> {
        self.as_ref().check_reference_frame_list(lists)
    }

    fn estimated_buffer_count(&self, purpose: BufferPurpose) -> usize {
        self.as_ref().estimated_buffer_count(purpose)
    }

    fn signal_stream_unplayable(&self, reason: UnplayableReason) {
        self.as_ref().signal_stream_unplayable(reason)
    }
}
