// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod dpb;
pub mod picture;
pub mod ref_lists;
pub mod slice;

/// Maximum number of reference frames a stream may declare in `num_ref_frames`.
pub const H264_MAX_REFERENCE_FRAMES: usize = 16;

/// Number of reference lists built per picture: P, B0 and B1.
pub const H264_NUM_REF_FRAME_LISTS: usize = 3;
