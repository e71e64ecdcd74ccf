// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Slice-level records handed over by the bitstream parsing layer.
//!
//! Nothing in this crate parses NAL units. The parser fills in a
//! [`SliceHeader`] per picture (or per field) and the DPB and reference list
//! machinery only ever reads from it.

use enumn::N;

use crate::buffer::BufferId;

/// Representation of `MaxLongTermFrameIdx`.
///
/// `MaxLongTermFrameIdx` is derived from `max_long_term_frame_idx_plus1`, an unsigned integer with
/// a special value indicating "no long-term frame indices". This type allows easy conversion
/// between the actual and "plus1" representation, while ensuring that the special value is always
/// handled by the code.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxLongTermFrameIdx {
    #[default]
    NoLongTermFrameIndices,
    Idx(u32),
}

impl MaxLongTermFrameIdx {
    /// Create a value from `max_long_term_frame_idx_plus1`.
    pub fn from_value_plus1(max_long_term_frame_idx_plus1: u32) -> Self {
        match max_long_term_frame_idx_plus1 {
            0 => Self::NoLongTermFrameIndices,
            i @ 1.. => Self::Idx(i - 1),
        }
    }

    /// Convert this value to the representation used by `max_long_term_frame_idx_plus1`.
    pub fn to_value_plus1(self) -> u32 {
        match self {
            Self::NoLongTermFrameIndices => 0,
            Self::Idx(i) => i + 1,
        }
    }

    /// Whether a long-term frame index `idx` lies above this ceiling and must be dropped.
    pub fn excludes(self, idx: u32) -> bool {
        match self {
            Self::NoLongTermFrameIndices => true,
            Self::Idx(max) => idx > max,
        }
    }
}

/// Memory management control operations, see table 7-9.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MmcoKind {
    End = 0,
    MarkShortTermUnused = 1,
    MarkLongTermUnused = 2,
    AssignLongTermToShortTerm = 3,
    SpecifyMaxLongTermIdx = 4,
    Clear = 5,
    AssignLongTermToCurrent = 6,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarkingInner {
    /// Raw `memory_management_control_operation`, see [`MmcoKind`].
    pub memory_management_control_operation: u8,

    /// Used (with memory_management_control_operation equal to 3 or 1) to
    /// assign a long-term frame index to a short-term reference picture or to
    /// mark a short-term reference picture as "unused for reference".
    pub difference_of_pic_nums_minus1: u32,

    /// Used (with memory_management_control_operation equal to 2) to mark a
    /// long-term reference picture as "unused for reference".
    pub long_term_pic_num: u32,

    /// Used (with memory_management_control_operation equal to 3 or 6) to
    /// assign a long-term frame index to a picture.
    pub long_term_frame_idx: u32,

    /// Specifies the maximum value of long-term frame index allowed for
    /// long-term reference pictures (until receipt of another value of
    /// `max_long_term_frame_idx_plus1`).
    pub max_long_term_frame_idx: MaxLongTermFrameIdx,
}

impl RefPicMarkingInner {
    pub fn kind(&self) -> Option<MmcoKind> {
        MmcoKind::n(self.memory_management_control_operation)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicMarking {
    /// Specifies how the previously-decoded pictures in the decoded picture
    /// buffer are treated after decoding of an IDR picture.
    pub no_output_of_prior_pics_flag: bool,

    /// If set on an IDR, the IDR picture is marked "used for long-term
    /// reference". Outside IDRs the current picture is inserted as long-term
    /// when this is set.
    pub long_term_reference_flag: bool,

    /// Selects adaptive (MMCO driven) marking instead of the sliding window.
    pub adaptive_ref_pic_marking_mode_flag: bool,

    /// Operations applied in order when `adaptive_ref_pic_marking_mode_flag` is set.
    pub inner: Vec<RefPicMarkingInner>,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
/// See table 7-6 in the H.264 specification.
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

impl SliceType {
    /// Maps a raw `slice_type` (0..=9) to its type, folding the "all slices" range.
    pub fn from_raw(slice_type: u8) -> Option<Self> {
        Self::n(slice_type % 5)
    }

    pub fn is_intra(&self) -> bool {
        matches!(self, SliceType::I | SliceType::Si)
    }
}

/// Parsed header of the first slice of a picture, with the sequence values the
/// marking and list processes need folded in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceHeader {
    pub slice_type: SliceType,
    /// Non-zero when the picture is used for reference.
    pub nal_ref_idc: u8,
    /// Set for IDR NAL units.
    pub idr: bool,

    pub frame_num: u32,
    /// `log2_max_frame_num_minus4 + 4` from the active SPS.
    pub log2_max_frame_num: u32,
    /// `num_ref_frames` from the active SPS.
    pub num_ref_frames: u32,

    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    /// `MbaffFrameFlag`: a frame coded with macroblock-adaptive frame/field decoding.
    pub mbaff_frame: bool,

    pub pic_order_cnt: i32,
    pub pic_order_cnt_top: i32,
    pub pic_order_cnt_bottom: i32,

    /// Active reference index counts after any slice-level override.
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,

    pub dec_ref_pic_marking: RefPicMarking,
}

impl Default for SliceHeader {
    fn default() -> Self {
        Self {
            slice_type: SliceType::P,
            nal_ref_idc: 1,
            idr: false,
            frame_num: 0,
            log2_max_frame_num: 4,
            num_ref_frames: 1,
            field_pic_flag: false,
            bottom_field_flag: false,
            mbaff_frame: false,
            pic_order_cnt: 0,
            pic_order_cnt_top: 0,
            pic_order_cnt_bottom: 0,
            num_ref_idx_l0_active_minus1: 0,
            num_ref_idx_l1_active_minus1: 0,
            dec_ref_pic_marking: Default::default(),
        }
    }
}

impl SliceHeader {
    pub fn max_frame_num(&self) -> u32 {
        1u32.checked_shl(self.log2_max_frame_num).unwrap_or(u32::MAX)
    }

    pub fn is_reference(&self) -> bool {
        self.nal_ref_idc != 0
    }

    /// The parity of this picture, or `None` for a frame.
    pub fn parity(&self) -> Option<super::picture::Parity> {
        use super::picture::Parity;

        if !self.field_pic_flag {
            None
        } else if self.bottom_field_flag {
            Some(Parity::Bottom)
        } else {
            Some(Parity::Top)
        }
    }

    /// `FrameNumWrap` of a reference picture with `frame_num`, relative to this slice.
    /// Saturates for values out of `i32` range, which no conforming stream produces.
    pub fn frame_num_wrap(&self, frame_num: u32) -> i32 {
        let wrap = if frame_num > self.frame_num {
            i64::from(frame_num) - i64::from(self.max_frame_num())
        } else {
            i64::from(frame_num)
        };

        wrap.clamp(i32::MIN.into(), i32::MAX.into()) as i32
    }

    pub fn num_ref_idx_l0_active(&self) -> usize {
        usize::from(self.num_ref_idx_l0_active_minus1) + 1
    }

    pub fn num_ref_idx_l1_active(&self) -> usize {
        usize::from(self.num_ref_idx_l1_active_minus1) + 1
    }
}

/// Dependent view part of an MVC access unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MvcFrameParameters {
    pub dep_slice_header: SliceHeader,
    /// Offset and length of the dependent view slices within the coded buffer.
    pub dep_data_offset: usize,
    pub dep_slices_length: usize,
    /// Whether the base view picture is an inter-view reference for the dependent view.
    pub is_interview: bool,
    /// Pre-processing buffers of both views, filled in on submission.
    pub base_preprocessor_buffer: Option<BufferId>,
    pub dep_preprocessor_buffer: Option<BufferId>,
}

/// Per access unit record filled in by the parser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameParameters {
    /// Decode order index of the picture, if the unit carries one.
    pub decode_index: Option<u32>,
    /// Set when the unit carries picture data rather than only parameter sets or SEI.
    pub new_frame: bool,
    pub first_slice: bool,
    /// Set on the first unit contributing to an output frame. Discard mode ends there.
    pub first_parsed_parameters_for_output_frame: bool,
    pub new_stream_parameters: bool,
    pub stream_parameters_present: bool,

    /// Offset and length of the slice data within the coded buffer.
    pub data_offset: usize,
    pub slices_length: usize,

    pub slice_header: SliceHeader,
    pub mvc: Option<MvcFrameParameters>,
}

#[cfg(test)]
mod tests {
    use super::MaxLongTermFrameIdx;
    use super::SliceHeader;
    use super::SliceType;

    #[test]
    fn max_long_term_frame_idx_plus1() {
        assert_eq!(
            MaxLongTermFrameIdx::from_value_plus1(0),
            MaxLongTermFrameIdx::NoLongTermFrameIndices
        );
        assert_eq!(MaxLongTermFrameIdx::from_value_plus1(3), MaxLongTermFrameIdx::Idx(2));
        assert_eq!(MaxLongTermFrameIdx::Idx(2).to_value_plus1(), 3);

        assert!(MaxLongTermFrameIdx::NoLongTermFrameIndices.excludes(0));
        assert!(!MaxLongTermFrameIdx::Idx(2).excludes(2));
        assert!(MaxLongTermFrameIdx::Idx(2).excludes(3));
    }

    #[test]
    fn frame_num_wraps_around_max_frame_num() {
        let header = SliceHeader { frame_num: 2, log2_max_frame_num: 4, ..Default::default() };

        assert_eq!(header.frame_num_wrap(1), 1);
        assert_eq!(header.frame_num_wrap(2), 2);
        assert_eq!(header.frame_num_wrap(15), -1);

        // Garbage from a corrupted header saturates.
        let header = SliceHeader { frame_num: u32::MAX, log2_max_frame_num: 40, ..header };
        assert_eq!(header.max_frame_num(), u32::MAX);
        assert_eq!(header.frame_num_wrap(u32::MAX), i32::MAX);
    }

    #[test]
    fn raw_slice_types_fold() {
        assert_eq!(SliceType::from_raw(7), Some(SliceType::I));
        assert_eq!(SliceType::from_raw(5), Some(SliceType::P));
        assert!(SliceType::from_raw(2).unwrap().is_intra());
    }
}
