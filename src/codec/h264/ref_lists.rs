// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Initial reference picture lists, built from a view's DPB for every picture.

use log::debug;

use crate::codec::h264::dpb::Dpb;
use crate::codec::h264::picture::Parity;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::picture::ReferenceFrame;
use crate::codec::h264::picture::UsageCode;
use crate::codec::h264::slice::SliceHeader;
use crate::codec::h264::slice::SliceType;

/// One entry of a reference list, resolved to the values the decode command needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReferenceDetail {
    /// Decode index of the referenced picture.
    pub decode_index: u32,
    pub long_term: bool,
    pub usage: UsageCode,
    /// `PicNum` or `LongTermPicNum`, depending on `long_term`.
    pub picture_number: i32,
    /// POC of the referenced frame or field.
    pub pic_order_cnt: i32,
    pub pic_order_cnt_top: i32,
    pub pic_order_cnt_bottom: i32,
}

impl ReferenceDetail {
    fn frame(frame: &ReferenceFrame, long_term: bool) -> Self {
        Self {
            decode_index: frame.decode_index,
            long_term,
            usage: UsageCode::Frame,
            picture_number: if long_term { frame.long_term_pic_num } else { frame.pic_num },
            pic_order_cnt: frame.pic_order_cnt,
            pic_order_cnt_top: frame.pic_order_cnt_top,
            pic_order_cnt_bottom: frame.pic_order_cnt_bottom,
        }
    }

    fn field(frame: &ReferenceFrame, long_term: bool, parity: Parity, current: Parity) -> Self {
        let picture_number = if long_term { frame.long_term_pic_num } else { frame.pic_num };
        // Fields of the same parity as the current picture are numbered 2 * n + 1.
        let picture_number = picture_number.saturating_add(i32::from(parity == current));

        let pic_order_cnt = match parity {
            Parity::Top => frame.pic_order_cnt_top,
            Parity::Bottom => frame.pic_order_cnt_bottom,
        };

        Self {
            decode_index: frame.decode_index,
            long_term,
            usage: parity.into(),
            picture_number,
            pic_order_cnt,
            pic_order_cnt_top: frame.pic_order_cnt_top,
            pic_order_cnt_bottom: frame.pic_order_cnt_bottom,
        }
    }
}

pub type ReferenceFrameList = Vec<ReferenceDetail>;

/// The initial P, B0 and B1 lists of a picture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceLists {
    pub p: ReferenceFrameList,
    pub b0: ReferenceFrameList,
    pub b1: ReferenceFrameList,
}

impl ReferenceLists {
    pub fn iter(&self) -> impl Iterator<Item = &ReferenceFrameList> {
        [&self.p, &self.b0, &self.b1].into_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().all(|l| l.is_empty())
    }

    /// Appends the inter-view reference to the base view picture of the same access unit to every
    /// list. The entry does not live in any DPB.
    pub fn append_interview(&mut self, base_decode_index: u32, base_header: &SliceHeader) {
        let detail = ReferenceDetail {
            decode_index: base_decode_index,
            long_term: false,
            usage: UsageCode::Frame,
            picture_number: base_header.frame_num as i32,
            pic_order_cnt: base_header.pic_order_cnt,
            pic_order_cnt_top: base_header.pic_order_cnt_top,
            pic_order_cnt_bottom: base_header.pic_order_cnt_bottom,
        };

        for list in [&mut self.p, &mut self.b0, &mut self.b1] {
            list.push(detail);
        }
    }
}

/// Ordered DPB entry indices.
type FrameList = Vec<usize>;

impl Dpb {
    fn refs(&self, predicate: impl Fn(&ReferenceFrame) -> bool) -> FrameList {
        self.entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| predicate(e))
            .map(|(i, _)| i)
            .collect()
    }

    fn sort_pic_num_descending(&self, frames: &mut FrameList) {
        frames.sort_by_key(|&i| std::cmp::Reverse(self.entries()[i].pic_num));
    }

    fn sort_frame_num_wrap_descending(&self, frames: &mut FrameList) {
        frames.sort_by_key(|&i| std::cmp::Reverse(self.entries()[i].frame_num_wrap));
    }

    fn sort_long_term_pic_num_ascending(&self, frames: &mut FrameList) {
        frames.sort_by_key(|&i| self.entries()[i].long_term_pic_num);
    }

    fn sort_long_term_frame_idx_ascending(&self, frames: &mut FrameList) {
        frames.sort_by_key(|&i| self.entries()[i].long_term_frame_idx);
    }

    fn sort_poc_descending(&self, frames: &mut FrameList) {
        frames.sort_by_key(|&i| std::cmp::Reverse(self.entries()[i].pic_order_cnt));
    }

    fn sort_poc_ascending(&self, frames: &mut FrameList) {
        frames.sort_by_key(|&i| self.entries()[i].pic_order_cnt);
    }

    /// Short-term frames split around `pic_order_cnt`: the ones at or before it by descending
    /// POC, then the ones after it by ascending POC. `after_first` swaps the two blocks.
    fn short_term_by_poc(
        &self,
        short_term: &FrameList,
        pic_order_cnt: i32,
        after_first: bool,
    ) -> FrameList {
        let (mut before, mut after): (FrameList, FrameList) = short_term
            .iter()
            .partition(|&&i| self.entries()[i].pic_order_cnt <= pic_order_cnt);

        self.sort_poc_descending(&mut before);
        self.sort_poc_ascending(&mut after);

        if after_first {
            after.append(&mut before);
            after
        } else {
            before.append(&mut after);
            before
        }
    }

    fn frame_details(
        &self,
        frames: &FrameList,
        long_term: bool,
    ) -> impl Iterator<Item = ReferenceDetail> + '_ {
        frames
            .clone()
            .into_iter()
            .map(move |i| ReferenceDetail::frame(&self.entries()[i], long_term))
    }

    /// 8.2.4.2.5: alternates fields of the current parity and the opposite one, starting with
    /// the current parity. Fields not marked as `reference` are skipped, and once one parity
    /// runs out the remaining fields of the other follow in order.
    fn expand_fields(
        &self,
        current: Parity,
        reference: Reference,
        frames: &FrameList,
        list: &mut ReferenceFrameList,
    ) {
        let long_term = reference == Reference::LongTerm;
        let fields_of = |parity: Parity| {
            frames
                .iter()
                .filter(move |&&i| self.entries()[i].usage.get(parity) == reference)
                .map(move |&i| {
                    ReferenceDetail::field(&self.entries()[i], long_term, parity, current)
                })
        };

        let mut same = fields_of(current);
        let mut opposite = fields_of(current.opposite());

        loop {
            match (same.next(), opposite.next()) {
                (None, None) => break,
                (a, b) => list.extend(a.into_iter().chain(b)),
            }
        }
    }

    /// 8.2.4.2.1 Initialization process for the reference picture list for P
    /// and SP slices in frames
    fn build_ref_pic_list_p(&self) -> ReferenceFrameList {
        let mut short_term = self.refs(|e| e.usage.all(Reference::ShortTerm));
        self.sort_pic_num_descending(&mut short_term);

        let mut long_term = self.refs(|e| e.usage.all(Reference::LongTerm));
        self.sort_long_term_pic_num_ascending(&mut long_term);

        self.frame_details(&short_term, false)
            .chain(self.frame_details(&long_term, true))
            .collect()
    }

    /// 8.2.4.2.2 Initialization process for the reference picture list for P
    /// and SP slices in fields
    fn build_ref_field_pic_list_p(&self, current: Parity) -> ReferenceFrameList {
        let mut short_term = self.refs(|e| e.usage.any_short_term());
        self.sort_frame_num_wrap_descending(&mut short_term);

        let mut long_term = self.refs(|e| e.usage.any_long_term());
        self.sort_long_term_pic_num_ascending(&mut long_term);

        let mut list = vec![];
        self.expand_fields(current, Reference::ShortTerm, &short_term, &mut list);
        self.expand_fields(current, Reference::LongTerm, &long_term, &mut list);

        list
    }

    /// 8.2.4.2.3 Initialization process for reference picture lists for B slices
    /// in frames
    fn build_ref_pic_list_b(
        &self,
        header: &SliceHeader,
    ) -> (ReferenceFrameList, ReferenceFrameList) {
        let short_term = self.refs(|e| e.usage.all(Reference::ShortTerm));

        let mut long_term = self.refs(|e| e.usage.all(Reference::LongTerm));
        self.sort_long_term_pic_num_ascending(&mut long_term);

        let b0 = self.short_term_by_poc(&short_term, header.pic_order_cnt, false);
        let b1 = self.short_term_by_poc(&short_term, header.pic_order_cnt, true);

        let b0 =
            self.frame_details(&b0, false).chain(self.frame_details(&long_term, true)).collect();
        let b1 =
            self.frame_details(&b1, false).chain(self.frame_details(&long_term, true)).collect();

        (b0, b1)
    }

    /// 8.2.4.2.4 Initialization process for reference picture lists for B
    /// slices in fields
    fn build_ref_field_pic_list_b(
        &self,
        header: &SliceHeader,
        current: Parity,
    ) -> (ReferenceFrameList, ReferenceFrameList) {
        let short_term = self.refs(|e| e.usage.any_short_term());

        let mut long_term = self.refs(|e| e.usage.any_long_term());
        self.sort_long_term_frame_idx_ascending(&mut long_term);

        let list_0_short_term = self.short_term_by_poc(&short_term, header.pic_order_cnt, false);
        let list_1_short_term = self.short_term_by_poc(&short_term, header.pic_order_cnt, true);

        let mut b0 = vec![];
        self.expand_fields(current, Reference::ShortTerm, &list_0_short_term, &mut b0);
        self.expand_fields(current, Reference::LongTerm, &long_term, &mut b0);

        let mut b1 = vec![];
        self.expand_fields(current, Reference::ShortTerm, &list_1_short_term, &mut b1);
        self.expand_fields(current, Reference::LongTerm, &long_term, &mut b1);

        (b0, b1)
    }

    // When the reference picture list RefPicList1 has more than one entry
    // and RefPicList1 is identical to the reference picture list
    // RefPicList0, the first two entries RefPicList1[0] and RefPicList1[1]
    // are switched.
    fn swap_b1_if_needed(b0: &ReferenceFrameList, b1: &mut ReferenceFrameList) {
        if b1.len() > 1 && b0 == b1 {
            b1.swap(0, 1);
        }
    }

    /// Returns the initial reference lists for the picture described by `header`.
    ///
    /// Picture numbers are refreshed against `header` first, so the lists always reflect the
    /// current DPB state.
    pub fn build_ref_lists(&mut self, header: &SliceHeader) -> ReferenceLists {
        self.update_pic_nums(header);

        if self.num_active() == 0 {
            return Default::default();
        }

        let (p, (b0, mut b1)) = match header.parity() {
            None => (self.build_ref_pic_list_p(), self.build_ref_pic_list_b(header)),
            Some(parity) => (
                self.build_ref_field_pic_list_p(parity),
                self.build_ref_field_pic_list_b(header, parity),
            ),
        };

        Self::swap_b1_if_needed(&b0, &mut b1);

        let mut lists = ReferenceLists { p, b0, b1 };
        lists.p.truncate(header.num_ref_idx_l0_active());
        lists.b0.truncate(header.num_ref_idx_l0_active());
        lists.b1.truncate(header.num_ref_idx_l1_active());

        let by_poc = |list: &ReferenceFrameList| {
            list.iter().map(|d| (d.decode_index, d.usage, d.pic_order_cnt)).collect::<Vec<_>>()
        };
        if header.slice_type == SliceType::B {
            debug!("ref_list_b0: {:?}, ref_list_b1: {:?}", by_poc(&lists.b0), by_poc(&lists.b1));
        } else {
            debug!(
                "ref_list_p0: {:?}",
                lists.p.iter().map(|d| (d.decode_index, d.picture_number)).collect::<Vec<_>>()
            );
        }

        lists
    }
}

#[cfg(test)]
mod tests {
    use super::ReferenceDetail;
    use crate::codec::h264::dpb::Dpb;
    use crate::codec::h264::picture::UsageCode;
    use crate::codec::h264::slice::SliceHeader;
    use crate::codec::h264::slice::SliceType;

    fn frame(frame_num: u32, poc: i32) -> SliceHeader {
        SliceHeader {
            frame_num,
            num_ref_frames: 4,
            pic_order_cnt: poc,
            pic_order_cnt_top: poc,
            pic_order_cnt_bottom: poc,
            num_ref_idx_l0_active_minus1: 3,
            num_ref_idx_l1_active_minus1: 3,
            ..Default::default()
        }
    }

    fn field(frame_num: u32, bottom: bool) -> SliceHeader {
        let poc = 4 * frame_num as i32 + i32::from(bottom);
        SliceHeader { field_pic_flag: true, bottom_field_flag: bottom, ..frame(frame_num, poc) }
    }

    fn decode_indices(list: &[ReferenceDetail]) -> Vec<u32> {
        list.iter().map(|d| d.decode_index).collect()
    }

    #[test]
    fn p_frame_list_orders_by_descending_pic_num() {
        let mut dpb = Dpb::new();
        dpb.mark(&frame(0, 0), 0, false).unwrap();
        dpb.mark(&frame(1, 2), 1, false).unwrap();
        dpb.mark(&frame(2, 4), 2, false).unwrap();

        let lists = dpb.build_ref_lists(&frame(3, 6));
        assert_eq!(decode_indices(&lists.p), vec![2, 1, 0]);
        assert_eq!(lists.p[0].picture_number, 2);
        assert_eq!(lists.p[0].usage, UsageCode::Frame);
        assert!(!lists.p[0].long_term);
    }

    #[test]
    fn p_frame_list_puts_long_term_last() {
        let mut dpb = Dpb::new();

        let mut long_term = frame(0, 0);
        long_term.idr = true;
        long_term.dec_ref_pic_marking.long_term_reference_flag = true;
        dpb.mark(&long_term, 0, true).unwrap();
        dpb.mark(&frame(1, 2), 1, false).unwrap();

        let lists = dpb.build_ref_lists(&frame(2, 4));
        assert_eq!(decode_indices(&lists.p), vec![1, 0]);
        assert!(lists.p[1].long_term);
    }

    #[test]
    fn p_list_is_truncated_to_active_count() {
        let mut dpb = Dpb::new();
        dpb.mark(&frame(0, 0), 0, false).unwrap();
        dpb.mark(&frame(1, 2), 1, false).unwrap();

        let header = SliceHeader { num_ref_idx_l0_active_minus1: 0, ..frame(2, 4) };
        assert_eq!(decode_indices(&dpb.build_ref_lists(&header).p), vec![1]);
    }

    #[test]
    fn b_frame_lists_split_around_current_poc() {
        let mut dpb = Dpb::new();
        dpb.mark(&frame(0, 0), 0, false).unwrap();
        dpb.mark(&frame(1, 8), 1, false).unwrap();
        dpb.mark(&frame(2, 2), 2, false).unwrap();

        let header = SliceHeader { slice_type: SliceType::B, nal_ref_idc: 0, ..frame(3, 4) };
        let lists = dpb.build_ref_lists(&header);

        assert_eq!(decode_indices(&lists.b0), vec![2, 0, 1]);
        assert_eq!(decode_indices(&lists.b1), vec![1, 2, 0]);
    }

    #[test]
    fn identical_b_lists_swap_first_entries() {
        let mut dpb = Dpb::new();
        dpb.mark(&frame(0, 0), 0, false).unwrap();
        dpb.mark(&frame(1, 2), 1, false).unwrap();

        // Every reference precedes the current picture, so both lists start out identical.
        let header = SliceHeader { slice_type: SliceType::B, ..frame(2, 8) };
        let lists = dpb.build_ref_lists(&header);

        assert_eq!(decode_indices(&lists.b0), vec![1, 0]);
        assert_eq!(decode_indices(&lists.b1), vec![0, 1]);
    }

    #[test]
    fn p_field_list_alternates_parities() {
        let mut dpb = Dpb::new();
        dpb.mark(&field(0, false), 0, false).unwrap();
        dpb.mark(&field(0, true), 1, false).unwrap();
        dpb.mark(&field(1, false), 2, false).unwrap();
        dpb.mark(&field(1, true), 3, false).unwrap();

        // Bottom field of frame 2: same parity (bottom) fields come first.
        let lists = dpb.build_ref_lists(&field(2, true));
        let fields: Vec<_> = lists.p.iter().map(|d| (d.decode_index, d.usage)).collect();
        assert_eq!(
            fields,
            vec![
                (2, UsageCode::FieldBottom),
                (2, UsageCode::FieldTop),
                (0, UsageCode::FieldBottom),
                (0, UsageCode::FieldTop),
            ]
        );

        // Same parity fields have the odd picture number.
        assert_eq!(lists.p[0].picture_number, 3);
        assert_eq!(lists.p[1].picture_number, 2);
        assert_eq!(lists.p[0].pic_order_cnt, 5);
    }

    #[test]
    fn b_field_lists_split_frames_then_alternate_parities() {
        let mut dpb = Dpb::new();
        for (decode_index, frame_num) in [(0, 0), (2, 1), (4, 2)] {
            dpb.mark(&field(frame_num, false), decode_index, false).unwrap();
            dpb.mark(&field(frame_num, true), decode_index + 1, false).unwrap();
        }

        // Top field between frames 1 and 2 in output order.
        let header = SliceHeader {
            slice_type: SliceType::B,
            nal_ref_idc: 0,
            pic_order_cnt: 6,
            num_ref_idx_l0_active_minus1: 5,
            num_ref_idx_l1_active_minus1: 5,
            ..field(3, false)
        };
        let lists = dpb.build_ref_lists(&header);
        let fields = |list: &[ReferenceDetail]| -> Vec<(u32, UsageCode)> {
            list.iter().map(|d| (d.decode_index, d.usage)).collect()
        };

        let b0 = fields(&lists.b0);
        assert_eq!(
            b0,
            vec![
                (2, UsageCode::FieldTop),
                (2, UsageCode::FieldBottom),
                (0, UsageCode::FieldTop),
                (0, UsageCode::FieldBottom),
                (4, UsageCode::FieldTop),
                (4, UsageCode::FieldBottom),
            ]
        );

        let b1 = fields(&lists.b1);
        assert_eq!(
            b1,
            vec![
                (4, UsageCode::FieldTop),
                (4, UsageCode::FieldBottom),
                (2, UsageCode::FieldTop),
                (2, UsageCode::FieldBottom),
                (0, UsageCode::FieldTop),
                (0, UsageCode::FieldBottom),
            ]
        );
    }

    #[test]
    fn second_field_references_its_first_field() {
        let mut dpb = Dpb::new();
        dpb.mark(&field(0, false), 0, false).unwrap();

        let lists = dpb.build_ref_lists(&field(0, true));
        let fields: Vec<_> = lists.p.iter().map(|d| (d.decode_index, d.usage)).collect();
        assert_eq!(fields, vec![(0, UsageCode::FieldTop)]);
    }

    #[test]
    fn interview_entry_is_appended_last() {
        let mut dpb = Dpb::new();
        dpb.mark(&frame(0, 0), 0, false).unwrap();

        let base = frame(1, 2);
        let mut lists = dpb.build_ref_lists(&frame(1, 2));
        lists.append_interview(7, &base);

        for list in lists.iter() {
            let last = list.last().unwrap();
            assert_eq!(last.decode_index, 7);
            assert_eq!(last.usage, UsageCode::Frame);
            assert_eq!(last.pic_order_cnt, 2);
            assert_eq!(list.iter().filter(|d| d.decode_index == 7).count(), 1);
        }
    }

    #[test]
    fn empty_dpb_has_empty_lists() {
        let mut dpb = Dpb::new();
        assert!(dpb.build_ref_lists(&frame(0, 0)).is_empty());
    }
}
