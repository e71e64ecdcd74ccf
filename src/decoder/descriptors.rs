// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference descriptors handed to the accelerator with every decode command.
//!
//! Every reference picture of a view gets a descriptor template ("host data") when it is decoded.
//! When a picture is referenced, the template is copied and specialized for the way the current
//! picture uses it. Each (slot, usage) pair is emitted at most once per picture, however many
//! lists it appears in.

use std::collections::HashMap;

use crate::codec::h264::picture::UsageCode;
use crate::codec::h264::ref_lists::ReferenceDetail;
use crate::codec::h264::slice::SliceHeader;
use crate::codec::h264::H264_NUM_REF_FRAME_LISTS;
use crate::decoder::slots::BufferIndex;
use crate::decoder::slots::Slot;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DescriptorType {
    #[default]
    Frame,
    /// Macroblock-adaptive frame/field frame.
    AFrame,
    FieldTop,
    FieldBottom,
}

impl DescriptorType {
    pub fn is_frame(&self) -> bool {
        matches!(self, DescriptorType::Frame | DescriptorType::AFrame)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceDescriptor {
    pub buffer: BufferIndex,
    pub slot: Slot,
    pub descriptor_type: DescriptorType,
    pub long_term: bool,
    pub frame_num: u32,
    pub picture_number: i32,
    pub pic_order_cnt_top: i32,
    pub pic_order_cnt_bottom: i32,
}

impl ReferenceDescriptor {
    /// Template recorded for the picture `header` decoded into `buffer`.
    pub fn for_picture(header: &SliceHeader, buffer: BufferIndex, slot: Slot) -> Self {
        let descriptor_type = match (header.field_pic_flag, header.bottom_field_flag) {
            (true, false) => DescriptorType::FieldTop,
            (true, true) => DescriptorType::FieldBottom,
            (false, _) if header.mbaff_frame => DescriptorType::AFrame,
            (false, _) => DescriptorType::Frame,
        };

        Self {
            buffer,
            slot,
            descriptor_type,
            long_term: header.dec_ref_pic_marking.long_term_reference_flag,
            frame_num: header.frame_num,
            picture_number: header.frame_num as i32,
            pic_order_cnt_top: header.pic_order_cnt_top,
            pic_order_cnt_bottom: header.pic_order_cnt_bottom,
        }
    }

    /// Copy of the template, specialized for `detail`.
    fn specialize(&self, reference: &TranslatedReference) -> Self {
        let detail = &reference.detail;

        let descriptor_type = match detail.usage {
            UsageCode::Frame if self.descriptor_type == DescriptorType::AFrame => {
                DescriptorType::AFrame
            }
            UsageCode::Frame => DescriptorType::Frame,
            UsageCode::FieldTop => DescriptorType::FieldTop,
            UsageCode::FieldBottom => DescriptorType::FieldBottom,
        };

        Self {
            buffer: reference.buffer,
            slot: reference.slot,
            descriptor_type,
            long_term: detail.long_term,
            picture_number: detail.picture_number,
            pic_order_cnt_top: detail.pic_order_cnt_top,
            pic_order_cnt_bottom: detail.pic_order_cnt_bottom,
            ..self.clone()
        }
    }
}

/// A reference list entry resolved to the buffer and slot holding the picture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslatedReference {
    pub detail: ReferenceDetail,
    pub buffer: BufferIndex,
    pub slot: Slot,
}

impl TranslatedReference {
    /// Accelerator-side identity of the reference: one per slot and usage.
    pub fn reference_id(&self) -> u32 {
        3 * self.slot as u32 + self.detail.usage as u32
    }
}

/// Reference descriptors of one decode command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorSet {
    pub descriptors: Vec<ReferenceDescriptor>,
    /// P, B0 and B1 lists, as indices into `descriptors`.
    pub lists: [Vec<usize>; H264_NUM_REF_FRAME_LISTS],
    /// Bit `slot` is set when the picture in that slot was decoded as a field.
    pub field_bitfield: u32,
}

impl DescriptorSet {
    /// Emits descriptors for `lists`, using `host_data` as the per-buffer templates. References
    /// without a template are skipped.
    pub fn build(
        lists: &[Vec<TranslatedReference>; H264_NUM_REF_FRAME_LISTS],
        host_data: &HashMap<BufferIndex, ReferenceDescriptor>,
    ) -> Self {
        let mut set = DescriptorSet::default();
        let mut cache: HashMap<u32, usize> = HashMap::new();

        for (list, out) in lists.iter().zip(set.lists.iter_mut()) {
            for reference in list {
                let Some(host) = host_data.get(&reference.buffer) else {
                    log::warn!("No descriptor recorded for buffer {}", reference.buffer);
                    continue;
                };

                let index = *cache.entry(reference.reference_id()).or_insert_with(|| {
                    set.descriptors.push(host.specialize(reference));
                    set.descriptors.len() - 1
                });

                if !host.descriptor_type.is_frame() {
                    match u32::try_from(reference.slot).ok().and_then(|s| 1u32.checked_shl(s)) {
                        Some(bit) => set.field_bitfield |= bit,
                        None => log::warn!("Slot {} is out of the field bitfield", reference.slot),
                    }
                }

                out.push(index);
            }
        }

        set
    }

    pub fn list(&self, list: usize) -> impl Iterator<Item = &ReferenceDescriptor> {
        self.lists[list].iter().map(|&i| &self.descriptors[i])
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::DescriptorSet;
    use super::DescriptorType;
    use super::ReferenceDescriptor;
    use super::TranslatedReference;
    use crate::codec::h264::picture::UsageCode;
    use crate::codec::h264::ref_lists::ReferenceDetail;
    use crate::codec::h264::slice::SliceHeader;

    fn reference(
        buffer: usize,
        slot: usize,
        usage: UsageCode,
        picture_number: i32,
    ) -> TranslatedReference {
        TranslatedReference {
            detail: ReferenceDetail {
                decode_index: buffer as u32,
                long_term: false,
                usage,
                picture_number,
                pic_order_cnt: picture_number * 2,
                pic_order_cnt_top: picture_number * 2,
                pic_order_cnt_bottom: picture_number * 2 + 1,
            },
            buffer,
            slot,
        }
    }

    fn host(buffer: usize, slot: usize, field: bool) -> (usize, ReferenceDescriptor) {
        let header = SliceHeader { field_pic_flag: field, ..Default::default() };
        (buffer, ReferenceDescriptor::for_picture(&header, buffer, slot))
    }

    #[test]
    fn same_reference_is_emitted_once() {
        let host_data: HashMap<_, _> = [host(0, 2, false), host(1, 0, false)].into_iter().collect();

        let a = reference(0, 2, UsageCode::Frame, 5);
        let b = reference(1, 0, UsageCode::Frame, 4);
        let set = DescriptorSet::build(&[vec![a, b], vec![b, a], vec![a]], &host_data);

        assert_eq!(set.descriptors.len(), 2);
        assert_eq!(set.lists, [vec![0, 1], vec![1, 0], vec![0]]);
        assert_eq!(set.descriptors[0].picture_number, 5);
        assert_eq!(set.descriptors[0].slot, 2);
        assert_eq!(set.field_bitfield, 0);
    }

    #[test]
    fn fields_of_one_slot_get_their_own_descriptors() {
        let host_data: HashMap<_, _> = [host(3, 1, true)].into_iter().collect();

        let top = reference(3, 1, UsageCode::FieldTop, 1);
        let bottom = reference(3, 1, UsageCode::FieldBottom, 0);
        assert_eq!(top.reference_id(), 4);
        assert_eq!(bottom.reference_id(), 5);

        let set = DescriptorSet::build(&[vec![top, bottom], vec![], vec![]], &host_data);
        assert_eq!(set.descriptors.len(), 2);
        assert_eq!(set.descriptors[0].descriptor_type, DescriptorType::FieldTop);
        assert_eq!(set.descriptors[1].descriptor_type, DescriptorType::FieldBottom);
        assert_eq!(set.field_bitfield, 1 << 1);
    }

    #[test]
    fn aframe_template_is_kept_for_frame_usage() {
        let header = SliceHeader { mbaff_frame: true, ..Default::default() };
        let host_data: HashMap<_, _> =
            [(0, ReferenceDescriptor::for_picture(&header, 0, 0))].into_iter().collect();

        let set = DescriptorSet::build(
            &[vec![reference(0, 0, UsageCode::Frame, 0)], vec![], vec![]],
            &host_data,
        );
        assert_eq!(set.descriptors[0].descriptor_type, DescriptorType::AFrame);
    }

    #[test]
    fn references_without_template_are_skipped() {
        let set = DescriptorSet::build(
            &[vec![reference(9, 0, UsageCode::Frame, 0)], vec![], vec![]],
            &HashMap::new(),
        );
        assert!(set.descriptors.is_empty());
        assert!(set.lists[0].is_empty());
    }

    #[test]
    fn field_bitfield_ignores_slots_it_cannot_hold() {
        let host_data: HashMap<_, _> = [host(0, 40, true), host(1, 31, true)].into_iter().collect();

        let set = DescriptorSet::build(
            &[
                vec![reference(0, 40, UsageCode::FieldTop, 0)],
                vec![reference(1, 31, UsageCode::FieldBottom, 0)],
                vec![],
            ],
            &host_data,
        );
        assert_eq!(set.descriptors.len(), 2);
        assert_eq!(set.field_bitfield, 1 << 31);
    }
}
