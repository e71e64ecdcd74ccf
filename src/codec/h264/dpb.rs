// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use log::debug;
use thiserror::Error;

use crate::codec::h264::picture::Fields;
use crate::codec::h264::picture::Parity;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::picture::ReferenceFrame;
use crate::codec::h264::slice::MaxLongTermFrameIdx;
use crate::codec::h264::slice::MmcoKind;
use crate::codec::h264::slice::RefPicMarkingInner;
use crate::codec::h264::slice::SliceHeader;
use crate::codec::h264::H264_MAX_REFERENCE_FRAMES;

/// Decode indices of pictures that stopped being referenced, in release order.
pub type Released = Vec<u32>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarkingError {
    #[error("no free DPB entry for decode index {0}")]
    NoFreeEntry(u32),
    #[error("duplicate reference field, or invalid reference list entry (decode index {0})")]
    DuplicateField(u32),
    #[error("unknown memory management control operation {0}")]
    UnknownMmco(u8),
}

/// The reference frames of one view.
///
/// The table always holds `H264_MAX_REFERENCE_FRAMES + 1` entries, of which only the first
/// `max_num_ref_frames + 1` are in use. The extra entry gives the marking process room to insert
/// the current picture before evicting.
pub struct Dpb {
    entries: Vec<ReferenceFrame>,
    max_num_ref_frames: usize,
    max_long_term_frame_idx: MaxLongTermFrameIdx,
    /// Whether an IDR has been marked since the last reset.
    seen_idr: bool,
    /// Decode index of the last reference I picture marked in adaptive mode before any IDR.
    last_reference_iframe_decode_index: u32,
}

/// Where the current picture landed during marking.
struct Current {
    entry: usize,
    second_field: bool,
    fields: Fields,
    parity: Option<Parity>,
}

impl Dpb {
    pub fn new() -> Self {
        Self {
            entries: vec![Default::default(); H264_MAX_REFERENCE_FRAMES + 1],
            max_num_ref_frames: 0,
            max_long_term_frame_idx: Default::default(),
            seen_idr: false,
            last_reference_iframe_decode_index: 0,
        }
    }

    /// The active part of the table.
    pub fn entries(&self) -> &[ReferenceFrame] {
        &self.entries[..=self.max_num_ref_frames]
    }

    fn entries_mut(&mut self) -> &mut [ReferenceFrame] {
        &mut self.entries[..=self.max_num_ref_frames]
    }

    pub fn max_num_ref_frames(&self) -> usize {
        self.max_num_ref_frames
    }

    pub fn max_long_term_frame_idx(&self) -> MaxLongTermFrameIdx {
        self.max_long_term_frame_idx
    }

    /// Number of entries with at least one short-term field.
    pub fn num_short_term(&self) -> usize {
        self.entries().iter().filter(|e| e.usage.any_short_term()).count()
    }

    /// Number of entries with at least one long-term field.
    pub fn num_long_term(&self) -> usize {
        self.entries().iter().filter(|e| e.usage.any_long_term()).count()
    }

    /// Number of entries used for reference in any way.
    pub fn num_active(&self) -> usize {
        self.entries().iter().filter(|e| !e.is_unused()).count()
    }

    /// Drops every entry and reports the ones that were still referenced.
    pub fn reset(&mut self) -> Released {
        let released = self
            .entries
            .iter()
            .filter(|e| !e.is_unused())
            .map(|e| e.decode_index)
            .collect();

        self.entries.iter_mut().for_each(|e| *e = Default::default());
        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
        self.seen_idr = false;
        self.last_reference_iframe_decode_index = 0;

        released
    }

    /// Sets the reference budget from the stream's `num_ref_frames`. A shrinking budget resets
    /// the table since entries beyond the new window would be lost.
    pub fn set_max_num_ref_frames(&mut self, num_ref_frames: u32) -> Released {
        let num_ref_frames =
            usize::try_from(num_ref_frames).unwrap_or(usize::MAX).min(H264_MAX_REFERENCE_FRAMES);

        let released = if self.max_num_ref_frames > num_ref_frames {
            log::error!(
                "num_ref_frames changed {} -> {}, resetting reference frame list",
                self.max_num_ref_frames,
                num_ref_frames
            );
            self.reset()
        } else {
            vec![]
        };

        self.max_num_ref_frames = num_ref_frames;
        released
    }

    /// Recomputes `FrameNumWrap`, `PicNum` and `LongTermPicNum` relative to `header`.
    pub fn update_pic_nums(&mut self, header: &SliceHeader) {
        let field = header.field_pic_flag;

        for entry in self.entries_mut().iter_mut().filter(|e| !e.is_unused()) {
            let frame_num_wrap = header.frame_num_wrap(entry.frame_num);
            let long_term_frame_idx = i32::try_from(entry.long_term_frame_idx).unwrap_or(i32::MAX);

            entry.frame_num_wrap = frame_num_wrap;
            if field {
                entry.pic_num = frame_num_wrap.saturating_mul(2);
                entry.long_term_pic_num = long_term_frame_idx.saturating_mul(2);
            } else {
                entry.pic_num = frame_num_wrap;
                entry.long_term_pic_num = long_term_frame_idx;
            }
        }
    }

    /// Clears the given marking of entry `index`, reporting it if it ends up unused.
    fn release(
        &mut self,
        index: usize,
        fields: Fields,
        reference: Option<Reference>,
        released: &mut Released,
    ) {
        let entry = &mut self.entries[index];
        if entry.is_unused() {
            return;
        }

        entry.usage.clear(fields, reference);
        if entry.is_unused() {
            debug!("Releasing reference frame {} (entry {})", entry.decode_index, index);
            released.push(entry.decode_index);
        }
    }

    fn find(&self, predicate: impl Fn(&ReferenceFrame) -> bool) -> Option<usize> {
        self.entries().iter().position(|e| !e.is_unused() && predicate(e))
    }

    /// Runs the decoded reference picture marking process for the reference picture `header`,
    /// decoded with `decode_index`.
    ///
    /// `flush` requests that every entry be released first, which is what an IDR in the base
    /// view does for both views. Returns the decode indices whose reference hold must be dropped.
    pub fn mark(
        &mut self,
        header: &SliceHeader,
        decode_index: u32,
        flush: bool,
    ) -> Result<Released, MarkingError> {
        let mut released = vec![];
        self.mark_into(header, decode_index, flush, &mut released)?;
        Ok(released)
    }

    /// Like [`Dpb::mark`], but appends to `released`, which keeps what has been released even
    /// when marking fails. A picture that could not be marked is itself released.
    pub fn mark_into(
        &mut self,
        header: &SliceHeader,
        decode_index: u32,
        flush: bool,
        released: &mut Released,
    ) -> Result<(), MarkingError> {
        let result = self.mark_picture(header, decode_index, flush, released);
        if let Err(MarkingError::NoFreeEntry(_) | MarkingError::DuplicateField(_)) = result {
            released.push(decode_index);
        }
        result
    }

    fn mark_picture(
        &mut self,
        header: &SliceHeader,
        decode_index: u32,
        flush: bool,
        released: &mut Released,
    ) -> Result<(), MarkingError> {
        released.extend(self.set_max_num_ref_frames(header.num_ref_frames));

        let parity = header.parity();
        let fields = Fields::from(parity);
        let long_term = header.dec_ref_pic_marking.long_term_reference_flag;
        let reference = if long_term { Reference::LongTerm } else { Reference::ShortTerm };

        if header.idr || flush {
            self.seen_idr = true;
        }

        let mut current = match self.mark_second_field(header, decode_index, released)? {
            Some(entry) => Current { entry, second_field: true, fields, parity },
            None => Current { entry: 0, second_field: false, fields, parity },
        };

        if !current.second_field && flush {
            for i in 0..self.entries().len() {
                self.release(i, Fields::Both, None, released);
            }
        }

        if !current.second_field {
            let Some(entry) = self.entries().iter().position(|e| e.is_unused()) else {
                log::error!("No place for frame {} - implementation error", decode_index);
                released.extend(self.reset());
                return Err(MarkingError::NoFreeEntry(decode_index));
            };

            let frame = &mut self.entries[entry];
            *frame = ReferenceFrame {
                field: header.field_pic_flag,
                decode_index,
                frame_num: header.frame_num,
                pic_order_cnt: header.pic_order_cnt,
                pic_order_cnt_top: header.pic_order_cnt_top,
                pic_order_cnt_bottom: header.pic_order_cnt_bottom,
                ..Default::default()
            };
            frame.usage.set(fields, reference);
            if long_term {
                frame.long_term_frame_idx = header.frame_num;
            }

            if header.idr {
                self.max_long_term_frame_idx = if long_term {
                    MaxLongTermFrameIdx::Idx(0)
                } else {
                    MaxLongTermFrameIdx::NoLongTermFrameIndices
                };
            }

            current.entry = entry;
        }

        if header.idr {
            return Ok(());
        }

        if header.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            self.update_pic_nums(header);
            for marking in &header.dec_ref_pic_marking.inner {
                let kind = marking
                    .kind()
                    .ok_or(MarkingError::UnknownMmco(marking.memory_management_control_operation))?;

                match kind {
                    MmcoKind::End => break,
                    MmcoKind::MarkShortTermUnused => {
                        self.mmco_op_1(header, &current, marking, released)
                    }
                    MmcoKind::MarkLongTermUnused => {
                        self.mmco_op_2(&current, marking, released)
                    }
                    MmcoKind::AssignLongTermToShortTerm => {
                        self.mmco_op_3(header, &current, marking, released)
                    }
                    MmcoKind::SpecifyMaxLongTermIdx => self.mmco_op_4(marking, released),
                    MmcoKind::Clear => self.mmco_op_5(header, &current, released),
                    MmcoKind::AssignLongTermToCurrent => {
                        self.mmco_op_6(&current, marking, released)
                    }
                }

                // Later operations address pictures by the numbers left by the earlier ones.
                self.update_pic_nums(header);
            }
        } else {
            self.sliding_window_marking(header, &current, released);
        }

        self.recover(header, &current, released);

        log::trace!("DPB after marking {}: {:#?}", decode_index, self);

        Ok(())
    }

    /// Updates the entry holding the first field of the current picture, if any. Returns its
    /// index.
    fn mark_second_field(
        &mut self,
        header: &SliceHeader,
        decode_index: u32,
        released: &mut Released,
    ) -> Result<Option<usize>, MarkingError> {
        let Some(parity) = header.parity() else {
            return Ok(None);
        };

        let Some(index) = self.find(|e| {
            e.field
                && e.frame_num == header.frame_num
                && e.decode_index.checked_add(1) == Some(decode_index)
        }) else {
            return Ok(None);
        };

        let entry = &mut self.entries[index];
        if entry.usage.covers_any(parity.into())
            || !entry.usage.covers_any(parity.opposite().into())
        {
            log::error!("Duplicate reference field, or invalid reference list entry");
            return Err(MarkingError::DuplicateField(decode_index));
        }

        match parity {
            Parity::Top => entry.pic_order_cnt_top = header.pic_order_cnt_top,
            Parity::Bottom => entry.pic_order_cnt_bottom = header.pic_order_cnt_bottom,
        }
        entry.pic_order_cnt = entry.pic_order_cnt_top.min(entry.pic_order_cnt_bottom);

        if header.dec_ref_pic_marking.long_term_reference_flag {
            entry.usage.set(parity.into(), Reference::LongTerm);
            entry.long_term_frame_idx = header.frame_num;
        } else {
            entry.usage.set(parity.into(), Reference::ShortTerm);
            entry.frame_num = header.frame_num;
        }

        // The buffer is held through the first field's decode index.
        released.push(decode_index);

        Ok(Some(index))
    }

    /// Sliding window decoded reference picture marking process. Evicts the short-term entry
    /// with the lowest `FrameNumWrap`, first found in table order on ties.
    fn sliding_window_marking(
        &mut self,
        header: &SliceHeader,
        current: &Current,
        released: &mut Released,
    ) {
        if self.num_short_term() + self.num_long_term() <= self.max_num_ref_frames {
            return;
        }

        let mut lowest: Option<(usize, i32)> = None;
        for (i, entry) in self.entries().iter().enumerate() {
            if i == current.entry || !entry.usage.any_short_term() {
                continue;
            }

            let frame_num_wrap = header.frame_num_wrap(entry.frame_num);
            if lowest.map_or(true, |(_, lowest)| frame_num_wrap < lowest) {
                lowest = Some((i, frame_num_wrap));
            }
        }

        if let Some((i, _)) = lowest {
            self.release(i, Fields::Both, Some(Reference::ShortTerm), released);
        }
    }

    /// `CurrPicNum` minus the signalled difference. Widened so that corrupted differences only
    /// fail to match.
    fn pic_num_x(header: &SliceHeader, marking: &RefPicMarkingInner) -> i64 {
        let frame_num = i64::from(header.frame_num);
        let curr_pic_num = if header.field_pic_flag { 2 * frame_num + 1 } else { frame_num };

        curr_pic_num - (i64::from(marking.difference_of_pic_nums_minus1) + 1)
    }

    /// Whether `number` addresses a picture numbered `pic_num`, or for fields, its complementary
    /// field.
    fn addresses(pic_num: i32, number: i64, field: bool) -> bool {
        let pic_num = i64::from(pic_num);
        pic_num == number || (field && pic_num + 1 == number)
    }

    /// Field variants address a picture number of either parity: an even number is the field
    /// of opposite parity, the odd one is the field of the current parity.
    fn field_of(current: &Current, matches_even: bool) -> Fields {
        match current.parity {
            None => Fields::Both,
            Some(parity) if matches_even => parity.opposite().into(),
            Some(parity) => parity.into(),
        }
    }

    fn mmco_op_1(
        &mut self,
        header: &SliceHeader,
        current: &Current,
        marking: &RefPicMarkingInner,
        released: &mut Released,
    ) {
        let pic_num_x = Self::pic_num_x(header, marking);
        debug!("MMCO op 1 for pic_num_x {}", pic_num_x);

        let field = current.parity.is_some();
        let Some(i) =
            self.find(|e| e.usage.any_short_term() && Self::addresses(e.pic_num, pic_num_x, field))
        else {
            return;
        };

        let fields = Self::field_of(current, i64::from(self.entries[i].pic_num) == pic_num_x);
        self.release(i, fields, Some(Reference::ShortTerm), released);
    }

    fn mmco_op_2(
        &mut self,
        current: &Current,
        marking: &RefPicMarkingInner,
        released: &mut Released,
    ) {
        let long_term_pic_num = i64::from(marking.long_term_pic_num);
        debug!("MMCO op 2 for long_term_pic_num {}", long_term_pic_num);

        let field = current.parity.is_some();
        let Some(i) = self.find(|e| {
            e.usage.any_long_term()
                && Self::addresses(e.long_term_pic_num, long_term_pic_num, field)
        }) else {
            return;
        };

        let fields = Self::field_of(
            current,
            i64::from(self.entries[i].long_term_pic_num) == long_term_pic_num,
        );
        self.release(i, fields, Some(Reference::LongTerm), released);
    }

    fn mmco_op_3(
        &mut self,
        header: &SliceHeader,
        current: &Current,
        marking: &RefPicMarkingInner,
        released: &mut Released,
    ) {
        let pic_num_x = Self::pic_num_x(header, marking);
        let long_term_frame_idx = marking.long_term_frame_idx;
        debug!(
            "MMCO op 3 for pic_num_x {} -> long_term_frame_idx {}",
            pic_num_x, long_term_frame_idx
        );

        if current.parity.is_none() {
            if let Some(i) =
                self.find(|e| {
                    e.usage.any_long_term() && e.long_term_frame_idx == long_term_frame_idx
                })
            {
                self.release(i, Fields::Both, Some(Reference::LongTerm), released);
            }

            if let Some(i) =
                self.find(|e| e.usage.any_short_term() && i64::from(e.pic_num) == pic_num_x)
            {
                let entry = &mut self.entries[i];
                entry.long_term_frame_idx = long_term_frame_idx;
                entry.usage.set(Fields::Both, Reference::LongTerm);
            }

            return;
        }

        // Assign before releasing, so the complementary field of the target is not released.
        let assigned =
            self.find(|e| e.usage.any_short_term() && Self::addresses(e.pic_num, pic_num_x, true));

        if let Some(i) = assigned {
            let fields = Self::field_of(current, i64::from(self.entries[i].pic_num) == pic_num_x);
            let entry = &mut self.entries[i];
            entry.long_term_frame_idx = long_term_frame_idx;
            entry.usage.clear(fields, Some(Reference::ShortTerm));
            entry.usage.set(fields, Reference::LongTerm);
        }

        let other = self.entries().iter().enumerate().position(|(j, e)| {
            Some(j) != assigned
                && e.usage.any_long_term()
                && e.long_term_frame_idx == long_term_frame_idx
        });
        if let Some(j) = other {
            self.release(j, Fields::Both, Some(Reference::LongTerm), released);
        }
    }

    fn mmco_op_4(&mut self, marking: &RefPicMarkingInner, released: &mut Released) {
        let max = marking.max_long_term_frame_idx;
        debug!("MMCO op 4, max_long_term_frame_idx: {:?}", max);

        for i in 0..self.entries().len() {
            let entry = &self.entries[i];
            if entry.usage.any_long_term() && max.excludes(entry.long_term_frame_idx) {
                self.release(i, Fields::Both, Some(Reference::LongTerm), released);
            }
        }

        self.max_long_term_frame_idx = max;
    }

    fn mmco_op_5(&mut self, header: &SliceHeader, current: &Current, released: &mut Released) {
        debug!("MMCO op 5, clearing all references but the current picture");

        for i in 0..self.entries().len() {
            if i != current.entry {
                self.release(i, Fields::Both, None, released);
            }
        }

        let entry = &mut self.entries[current.entry];
        entry.pic_order_cnt = 0;
        entry.pic_order_cnt_top = entry.pic_order_cnt_top.saturating_sub(header.pic_order_cnt);
        entry.pic_order_cnt_bottom =
            entry.pic_order_cnt_bottom.saturating_sub(header.pic_order_cnt);
        entry.frame_num = 0;

        self.max_long_term_frame_idx = MaxLongTermFrameIdx::NoLongTermFrameIndices;
    }

    fn mmco_op_6(
        &mut self,
        current: &Current,
        marking: &RefPicMarkingInner,
        released: &mut Released,
    ) {
        let long_term_frame_idx = marking.long_term_frame_idx;
        debug!("MMCO op 6, long_term_frame_idx: {}", long_term_frame_idx);

        let other = self.entries().iter().enumerate().position(|(j, e)| {
            j != current.entry
                && e.usage.any_long_term()
                && e.long_term_frame_idx == long_term_frame_idx
        });
        if let Some(j) = other {
            self.release(j, Fields::Both, Some(Reference::LongTerm), released);
        }

        let entry = &mut self.entries[current.entry];
        entry.long_term_frame_idx = long_term_frame_idx;
        entry.usage.clear(current.fields, Some(Reference::ShortTerm));
        entry.usage.set(current.fields, Reference::LongTerm);
    }

    /// Error recovery for streams whose marking went stale or overflowed the budget.
    fn recover(&mut self, header: &SliceHeader, current: &Current, released: &mut Released) {
        let adaptive = header.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag;

        // Broadcast streams may never send an IDR. Expire everything older than the previous
        // reference I picture.
        if !current.second_field && adaptive && !self.seen_idr && header.slice_type.is_intra() {
            let last = self.last_reference_iframe_decode_index;
            for i in 0..self.entries().len() {
                if self.entries[i].decode_index < last {
                    self.release(i, Fields::Both, None, released);
                }
            }

            self.last_reference_iframe_decode_index = self.entries[current.entry].decode_index;
        }

        let num_refs = self.num_short_term() + self.num_long_term();
        if num_refs > self.max_num_ref_frames + 1 {
            log::error!(
                "There are {} ref frames, allowed is {} - resetting list of reference frames",
                num_refs,
                self.max_num_ref_frames
            );
            released.extend(self.reset());
        } else if num_refs > self.max_num_ref_frames {
            log::error!("More than the allowed number of reference frames, discarding the oldest");

            let oldest = self
                .entries()
                .iter()
                .enumerate()
                .filter(|(_, e)| !e.is_unused())
                .min_by_key(|(_, e)| e.decode_index)
                .map(|(i, _)| i);

            if let Some(i) = oldest {
                self.release(i, Fields::Both, None, released);
            }
        }
    }
}

impl Default for Dpb {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dpb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used = self.entries().iter().filter(|e| !e.is_unused()).collect::<Vec<_>>();

        f.debug_struct("Dpb")
            .field("entries", &used)
            .field("max_num_ref_frames", &self.max_num_ref_frames)
            .field("max_long_term_frame_idx", &self.max_long_term_frame_idx)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Dpb;
    use super::MarkingError;
    use crate::codec::h264::picture::Reference;
    use crate::codec::h264::slice::MaxLongTermFrameIdx;
    use crate::codec::h264::slice::RefPicMarking;
    use crate::codec::h264::slice::RefPicMarkingInner;
    use crate::codec::h264::slice::SliceHeader;
    use crate::codec::h264::slice::SliceType;

    fn frame(frame_num: u32, num_ref_frames: u32) -> SliceHeader {
        SliceHeader {
            frame_num,
            num_ref_frames,
            pic_order_cnt: 2 * frame_num as i32,
            pic_order_cnt_top: 2 * frame_num as i32,
            pic_order_cnt_bottom: 2 * frame_num as i32,
            ..Default::default()
        }
    }

    fn idr(num_ref_frames: u32) -> SliceHeader {
        SliceHeader { idr: true, slice_type: SliceType::I, ..frame(0, num_ref_frames) }
    }

    fn field(frame_num: u32, bottom: bool) -> SliceHeader {
        let poc = 2 * frame_num as i32 + i32::from(bottom);
        SliceHeader {
            field_pic_flag: true,
            bottom_field_flag: bottom,
            pic_order_cnt: poc,
            pic_order_cnt_top: poc,
            pic_order_cnt_bottom: poc,
            ..frame(frame_num, 2)
        }
    }

    fn with_mmco(mut header: SliceHeader, ops: Vec<RefPicMarkingInner>) -> SliceHeader {
        header.dec_ref_pic_marking = RefPicMarking {
            adaptive_ref_pic_marking_mode_flag: true,
            inner: ops,
            ..Default::default()
        };
        header
    }

    fn frame_nums(dpb: &Dpb) -> Vec<u32> {
        let mut nums: Vec<_> =
            dpb.entries().iter().filter(|e| !e.is_unused()).map(|e| e.frame_num).collect();
        nums.sort();
        nums
    }

    #[test]
    fn sliding_window_evicts_lowest_frame_num() {
        let mut dpb = Dpb::new();

        assert_eq!(dpb.mark(&frame(0, 2), 0, false).unwrap(), Vec::<u32>::new());
        assert_eq!(dpb.mark(&frame(1, 2), 1, false).unwrap(), Vec::<u32>::new());

        assert_eq!(dpb.mark(&frame(2, 2), 2, false).unwrap(), vec![0]);
        assert_eq!(frame_nums(&dpb), vec![1, 2]);

        assert_eq!(dpb.mark(&frame(3, 2), 3, false).unwrap(), vec![1]);
        assert_eq!(frame_nums(&dpb), vec![2, 3]);
        assert!(dpb.num_active() <= dpb.max_num_ref_frames());
    }

    #[test]
    fn sliding_window_never_evicts_long_term() {
        let mut dpb = Dpb::new();

        let mut long_term = idr(2);
        long_term.dec_ref_pic_marking.long_term_reference_flag = true;
        dpb.mark(&long_term, 0, true).unwrap();
        dpb.mark(&frame(1, 2), 1, false).unwrap();

        assert_eq!(dpb.mark(&frame(2, 2), 2, false).unwrap(), vec![1]);
        assert_eq!(dpb.num_long_term(), 1);
        assert_eq!(dpb.num_short_term(), 1);
    }

    #[test]
    fn sliding_window_handles_frame_num_wrap() {
        let mut dpb = Dpb::new();

        // max_frame_num is 16: 14 and 15 come before 0 in decode order.
        dpb.mark(&frame(14, 2), 0, false).unwrap();
        dpb.mark(&frame(15, 2), 1, false).unwrap();
        assert_eq!(dpb.mark(&frame(0, 2), 2, false).unwrap(), vec![0]);
    }

    #[test]
    fn idr_releases_everything() {
        let mut dpb = Dpb::new();

        dpb.mark(&frame(0, 4), 0, false).unwrap();
        dpb.mark(&frame(1, 4), 1, false).unwrap();
        dpb.mark(&frame(2, 4), 2, false).unwrap();

        let released = dpb.mark(&idr(4), 3, true).unwrap();
        assert_eq!(released, vec![0, 1, 2]);
        assert_eq!(dpb.num_active(), 1);
        assert_eq!(dpb.max_long_term_frame_idx(), MaxLongTermFrameIdx::NoLongTermFrameIndices);
    }

    #[test]
    fn second_field_updates_in_place() {
        let mut dpb = Dpb::new();

        assert!(dpb.mark(&field(0, false), 10, false).unwrap().is_empty());
        assert_eq!(dpb.mark(&field(0, true), 11, false).unwrap(), vec![11]);

        let entries: Vec<_> = dpb.entries().iter().filter(|e| !e.is_unused()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decode_index, 10);
        assert!(entries[0].usage.is_complementary_pair());
        assert_eq!(entries[0].pic_order_cnt, 0);
        assert_eq!(entries[0].pic_order_cnt_bottom, 1);
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let mut dpb = Dpb::new();

        dpb.mark(&field(0, false), 10, false).unwrap();
        assert_eq!(dpb.mark(&field(0, false), 11, false), Err(MarkingError::DuplicateField(11)));

        // The rejected field gives its hold back.
        let mut released = vec![];
        let result = dpb.mark_into(&field(0, false), 11, false, &mut released);
        assert_eq!(result, Err(MarkingError::DuplicateField(11)));
        assert_eq!(released, vec![11]);
    }

    #[test]
    fn mmco_1_releases_short_term_frame() {
        let mut dpb = Dpb::new();

        dpb.mark(&frame(0, 4), 0, false).unwrap();
        dpb.mark(&frame(1, 4), 1, false).unwrap();

        // pic_num_x = 2 - (1 + 1) = 0
        let header = with_mmco(
            frame(2, 4),
            vec![RefPicMarkingInner {
                memory_management_control_operation: 1,
                difference_of_pic_nums_minus1: 1,
                ..Default::default()
            }],
        );

        assert_eq!(dpb.mark(&header, 2, false).unwrap(), vec![0]);
        assert_eq!(frame_nums(&dpb), vec![1, 2]);
    }

    #[test]
    fn mmco_1_field_keeps_complementary_field() {
        let mut dpb = Dpb::new();

        dpb.mark(&field(0, false), 0, false).unwrap();
        dpb.mark(&field(0, true), 1, false).unwrap();

        // Top field of frame 1: CurrPicNum = 3. pic_num_x = 3 - 2 = 1, the top field of frame 0.
        let header = with_mmco(
            field(1, false),
            vec![RefPicMarkingInner {
                memory_management_control_operation: 1,
                difference_of_pic_nums_minus1: 1,
                ..Default::default()
            }],
        );

        assert_eq!(dpb.mark(&header, 2, false).unwrap(), Vec::<u32>::new());
        let first = dpb.entries().iter().find(|e| e.decode_index == 0).unwrap();
        assert_eq!(first.usage.top, Reference::None);
        assert_eq!(first.usage.bottom, Reference::ShortTerm);
    }

    #[test]
    fn mmco_3_and_6_assign_long_term_indices() {
        let mut dpb = Dpb::new();

        dpb.mark(&frame(0, 4), 0, false).unwrap();
        dpb.mark(&frame(1, 4), 1, false).unwrap();

        let header = with_mmco(
            frame(2, 4),
            vec![
                RefPicMarkingInner {
                    memory_management_control_operation: 4,
                    max_long_term_frame_idx: MaxLongTermFrameIdx::Idx(3),
                    ..Default::default()
                },
                RefPicMarkingInner {
                    memory_management_control_operation: 3,
                    difference_of_pic_nums_minus1: 0,
                    long_term_frame_idx: 1,
                    ..Default::default()
                },
                RefPicMarkingInner {
                    memory_management_control_operation: 6,
                    long_term_frame_idx: 2,
                    ..Default::default()
                },
            ],
        );

        assert!(dpb.mark(&header, 2, false).unwrap().is_empty());
        assert_eq!(dpb.num_long_term(), 2);
        assert_eq!(dpb.num_short_term(), 1);

        let frame_1 = dpb.entries().iter().find(|e| e.decode_index == 1).unwrap();
        assert!(frame_1.usage.all(Reference::LongTerm));
        assert_eq!(frame_1.long_term_frame_idx, 1);

        // Lowering the ceiling drops the index 2 picture.
        let header = with_mmco(
            frame(3, 4),
            vec![RefPicMarkingInner {
                memory_management_control_operation: 4,
                max_long_term_frame_idx: MaxLongTermFrameIdx::Idx(1),
                ..Default::default()
            }],
        );
        assert_eq!(dpb.mark(&header, 3, false).unwrap(), vec![2]);
    }

    #[test]
    fn mmco_5_clears_and_rebases_poc() {
        let mut dpb = Dpb::new();

        dpb.mark(&frame(0, 4), 0, false).unwrap();
        dpb.mark(&frame(1, 4), 1, false).unwrap();

        let header = with_mmco(
            frame(2, 4),
            vec![RefPicMarkingInner {
                memory_management_control_operation: 5,
                ..Default::default()
            }],
        );

        assert_eq!(dpb.mark(&header, 2, false).unwrap(), vec![0, 1]);
        let current = dpb.entries().iter().find(|e| !e.is_unused()).unwrap();
        assert_eq!(current.decode_index, 2);
        assert_eq!(current.frame_num, 0);
        assert_eq!(current.pic_order_cnt, 0);
        assert_eq!(current.pic_order_cnt_top, 0);
    }

    #[test]
    fn unknown_mmco_is_an_error() {
        let mut dpb = Dpb::new();

        let header = with_mmco(
            frame(0, 4),
            vec![RefPicMarkingInner {
                memory_management_control_operation: 9,
                ..Default::default()
            }],
        );
        assert_eq!(dpb.mark(&header, 0, false), Err(MarkingError::UnknownMmco(9)));
    }

    #[test]
    fn corrupted_mmco_values_match_nothing() {
        let mut dpb = Dpb::new();

        dpb.mark(&field(0, false), 0, false).unwrap();
        dpb.mark(&field(0, true), 1, false).unwrap();

        let mut header = with_mmco(
            field(1, false),
            vec![
                RefPicMarkingInner {
                    memory_management_control_operation: 1,
                    difference_of_pic_nums_minus1: u32::MAX,
                    ..Default::default()
                },
                RefPicMarkingInner {
                    memory_management_control_operation: 1,
                    difference_of_pic_nums_minus1: i32::MAX as u32,
                    ..Default::default()
                },
                RefPicMarkingInner {
                    memory_management_control_operation: 2,
                    long_term_pic_num: u32::MAX,
                    ..Default::default()
                },
                RefPicMarkingInner {
                    memory_management_control_operation: 3,
                    difference_of_pic_nums_minus1: u32::MAX,
                    long_term_frame_idx: u32::MAX,
                    ..Default::default()
                },
            ],
        );
        header.num_ref_frames = 4;
        header.frame_num = u32::MAX;
        header.log2_max_frame_num = 32;

        assert!(dpb.mark(&header, 2, false).unwrap().is_empty());
        assert_eq!(dpb.num_short_term(), 2);

        // Rebasing the current picture on an extreme count saturates.
        let mut header = with_mmco(
            frame(2, 4),
            vec![RefPicMarkingInner {
                memory_management_control_operation: 5,
                ..Default::default()
            }],
        );
        header.pic_order_cnt = i32::MIN;
        header.pic_order_cnt_top = i32::MAX;
        dpb.mark(&header, u32::MAX, false).unwrap();
        let current = dpb.entries().iter().find(|e| e.decode_index == u32::MAX).unwrap();
        assert_eq!(current.pic_order_cnt_top, i32::MAX);
    }

    #[test]
    fn overflow_after_mmco_evicts_oldest() {
        let mut dpb = Dpb::new();

        dpb.mark(&frame(0, 2), 0, false).unwrap();
        dpb.mark(&frame(1, 2), 1, false).unwrap();

        // An MMCO list that releases nothing leaves three references for a budget of two.
        let header = with_mmco(
            frame(2, 2),
            vec![RefPicMarkingInner {
                memory_management_control_operation: 0,
                ..Default::default()
            }],
        );
        assert_eq!(dpb.mark(&header, 2, false).unwrap(), vec![0]);
        assert_eq!(dpb.num_active(), 2);
    }

    #[test]
    fn shrinking_budget_resets() {
        let mut dpb = Dpb::new();

        dpb.mark(&frame(0, 4), 0, false).unwrap();
        dpb.mark(&frame(1, 4), 1, false).unwrap();

        let released = dpb.mark(&frame(2, 1), 2, false).unwrap();
        assert_eq!(released, vec![0, 1]);
        assert_eq!(frame_nums(&dpb), vec![2]);
    }

    #[test]
    fn broadcast_iframes_expire_older_references() {
        let mut dpb = Dpb::new();

        let intra = |frame_num, num_ref_frames| {
            with_mmco(
                SliceHeader { slice_type: SliceType::I, ..frame(frame_num, num_ref_frames) },
                vec![],
            )
        };

        dpb.mark(&frame(0, 8), 0, false).unwrap();
        dpb.mark(&intra(1, 8), 1, false).unwrap();
        dpb.mark(&frame(2, 8), 2, false).unwrap();

        // Everything decoded before the previous reference I picture goes.
        assert_eq!(dpb.mark(&intra(3, 8), 3, false).unwrap(), vec![0]);
        assert_eq!(frame_nums(&dpb), vec![1, 2, 3]);
    }
}
