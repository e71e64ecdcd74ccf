// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The H.264 decode submission pipeline.
//!
//! [`h264::H264Decoder`] accepts coded access units, runs them through the bitstream
//! pre-processing accelerator on a worker thread, and turns each picture into a
//! [`core::DecodeCommand`] carrying its reference descriptors.

pub mod core;
pub mod descriptors;
pub mod dummy;
pub mod h264;
pub mod mvc;
pub mod pipeline;
pub mod preprocessor;
pub mod slots;

use std::time::Duration;

use thiserror::Error;

use crate::codec::h264::dpb::MarkingError;
use crate::decoder::mvc::MapFull;
use crate::decoder::pipeline::PipelineError;
use crate::decoder::preprocessor::PreprocessorError;
use crate::decoder::slots::SlotError;

pub type Result<T> = std::result::Result<T, DecodeError>;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no free job slot in the pipeline")]
    RingFull,
    #[error("no pre-processing buffer available")]
    NoPreprocessorBuffer,
    #[error("not enough memory for {num_ref_frames} reference frames")]
    InsufficientMemory { num_ref_frames: u32 },
    #[error("coded length {len} is shorter than the end of slice data at {end}")]
    CorruptedLength { len: usize, end: usize },
    #[error("got {0} reference lists, at most 3 are supported")]
    TooManyReferenceLists(usize),
    #[error("frame data does not start with its first slice")]
    NotFirstSlice,
    #[error("accelerator rejected the job: {0}")]
    PreprocessorRejected(#[source] PreprocessorError),
    #[error("access unit has no MVC parameters")]
    MissingMvcParameters,
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Marking(#[from] MarkingError),
    #[error("decode index {0} is not mapped to a buffer")]
    UnknownDecodeIndex(u32),
    #[error(transparent)]
    BufferIndexMapFull(#[from] MapFull),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Core(#[from] anyhow::Error),
}

/// Decoder tunables.
#[derive(Clone, Debug)]
pub struct DecoderConfig {
    /// Capacity of the job ring.
    pub coded_frame_count: usize,
    /// Number of decode buffers the core can hand out.
    pub decode_buffer_count: usize,
    /// Number of hardware reference slots.
    pub reference_slot_count: usize,
    pub preprocessor_buffer_count: usize,
    /// Size of each pre-processing buffer, also the largest output the accelerator may produce.
    pub preprocessor_buffer_size: usize,
    /// How long the worker sleeps before checking for termination.
    pub max_event_wait: Duration,
    /// How long shutdown waits for the worker to stop.
    pub shutdown_timeout: Duration,
    /// Forward frames the accelerator flagged with errors instead of discarding them.
    pub allow_bad_preprocessed_frames: bool,
    /// Decode the dependent view of MVC streams.
    pub mvc: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            coded_frame_count: 1024,
            decode_buffer_count: 32,
            reference_slot_count: crate::codec::h264::H264_MAX_REFERENCE_FRAMES,
            preprocessor_buffer_count: 8,
            preprocessor_buffer_size: 1 << 20,
            max_event_wait: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            allow_bad_preprocessed_frames: false,
            mvc: false,
        }
    }
}
