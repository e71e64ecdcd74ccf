// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Asynchronous H.264 (and MVC) decode submission.
//!
//! Coded access units go through a bitstream pre-processing accelerator on a worker thread, in
//! submission order. For every picture the decoder maintains the decoded picture buffer, builds
//! the initial reference lists and hands a [`decoder::core::DecodeCommand`] with its reference
//! descriptors to a [`decoder::core::DecodeCore`].
//!
//! The [`codec`] module holds the codec-level logic (DPB marking, list building) and does not
//! depend on the pipeline.

pub mod buffer;
pub mod codec;
pub mod decoder;
