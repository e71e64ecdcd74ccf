// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Contract of the bitstream pre-processing accelerator.

use std::ops::BitOr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use thiserror::Error;

use crate::buffer::PreprocessorBuffer;
use crate::codec::h264::slice::SliceHeader;

/// Completion status reported by the accelerator for one job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PpStatus(pub u32);

impl PpStatus {
    pub const OK: PpStatus = PpStatus(0);
    pub const ERROR_SC_DETECTED: PpStatus = PpStatus(1 << 0);
    pub const ERROR_BIT_INSERTED: PpStatus = PpStatus(1 << 1);
    pub const INT_BUFFER_OVERFLOW: PpStatus = PpStatus(1 << 2);
    pub const BIT_BUFFER_UNDERFLOW: PpStatus = PpStatus(1 << 3);
    pub const BIT_BUFFER_OVERFLOW: PpStatus = PpStatus(1 << 4);
    pub const READ_ERROR: PpStatus = PpStatus(1 << 5);
    pub const WRITE_ERROR: PpStatus = PpStatus(1 << 6);

    const ERRORS: u32 = (1 << 7) - 1;

    pub fn contains(self, other: PpStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn has_errors(self) -> bool {
        self.0 & Self::ERRORS != 0
    }
}

impl BitOr for PpStatus {
    type Output = PpStatus;

    fn bitor(self, rhs: PpStatus) -> PpStatus {
        PpStatus(self.0 | rhs.0)
    }
}

#[derive(Debug, Error)]
pub enum PreprocessorError {
    #[error("accelerator rejected the job: {0}")]
    Rejected(String),
    #[error("no pre-processed buffer is pending")]
    NothingPending,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One pre-processing job.
#[derive(Debug)]
pub struct PreprocessRequest {
    /// Ring slot of the job. The completed buffer carries it back.
    pub job: usize,
    pub header: SliceHeader,
    pub max_output_size: usize,
    pub slices_length: usize,
    /// Slice data of the picture.
    pub input: Bytes,
    pub output: PreprocessorBuffer,
}

/// A completed job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreprocessedBuffer {
    pub job: usize,
    /// Bytes written to the output buffer.
    pub size: usize,
    pub status: PpStatus,
}

/// The accelerator. Jobs complete in submission order.
pub trait Preprocessor: Send + 'static {
    fn process_buffer(&mut self, request: PreprocessRequest) -> Result<(), PreprocessorError>;

    /// Returns the oldest completed job.
    fn get_preprocessed_buffer(&mut self) -> Result<PreprocessedBuffer, PreprocessorError>;
}

/// Per error class counters of accelerator failures.
#[derive(Debug, Default)]
pub struct Statistics {
    sc_detected: AtomicU64,
    bit_inserted: AtomicU64,
    int_buffer_overflow: AtomicU64,
    bit_buffer_underflow: AtomicU64,
    bit_buffer_overflow: AtomicU64,
    read_error: AtomicU64,
    write_error: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub sc_detected: u64,
    pub bit_inserted: u64,
    pub int_buffer_overflow: u64,
    pub bit_buffer_underflow: u64,
    pub bit_buffer_overflow: u64,
    pub read_error: u64,
    pub write_error: u64,
}

impl Statistics {
    fn counters(&self) -> [(PpStatus, &AtomicU64); 7] {
        [
            (PpStatus::ERROR_SC_DETECTED, &self.sc_detected),
            (PpStatus::ERROR_BIT_INSERTED, &self.bit_inserted),
            (PpStatus::INT_BUFFER_OVERFLOW, &self.int_buffer_overflow),
            (PpStatus::BIT_BUFFER_UNDERFLOW, &self.bit_buffer_underflow),
            (PpStatus::BIT_BUFFER_OVERFLOW, &self.bit_buffer_overflow),
            (PpStatus::READ_ERROR, &self.read_error),
            (PpStatus::WRITE_ERROR, &self.write_error),
        ]
    }

    pub fn record(&self, status: PpStatus) {
        for (flag, counter) in self.counters() {
            if status.contains(flag) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            sc_detected: self.sc_detected.load(Ordering::Relaxed),
            bit_inserted: self.bit_inserted.load(Ordering::Relaxed),
            int_buffer_overflow: self.int_buffer_overflow.load(Ordering::Relaxed),
            bit_buffer_underflow: self.bit_buffer_underflow.load(Ordering::Relaxed),
            bit_buffer_overflow: self.bit_buffer_overflow.load(Ordering::Relaxed),
            read_error: self.read_error.load(Ordering::Relaxed),
            write_error: self.write_error.load(Ordering::Relaxed),
        }
    }
}
