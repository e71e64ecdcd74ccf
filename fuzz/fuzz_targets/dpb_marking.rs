#![no_main]

use h264_pipeline::codec::h264::dpb::Dpb;
use h264_pipeline::codec::h264::slice::MaxLongTermFrameIdx;
use h264_pipeline::codec::h264::slice::RefPicMarkingInner;
use h264_pipeline::codec::h264::slice::SliceHeader;
use h264_pipeline::codec::h264::slice::SliceType;
use libfuzzer_sys::fuzz_target;

/// Builds one slice header out of a 6 byte chunk, plus one MMCO per further 4 byte chunk.
fn header(chunk: &[u8]) -> SliceHeader {
    let flags = chunk[0];
    let mut header = SliceHeader {
        slice_type: SliceType::from_raw(chunk[1]).unwrap_or_default(),
        nal_ref_idc: 1,
        idr: flags & 0x1 != 0,
        frame_num: u32::from(chunk[2] & 0xf),
        num_ref_frames: u32::from(chunk[3] % 17),
        field_pic_flag: flags & 0x2 != 0,
        bottom_field_flag: flags & 0x4 != 0,
        pic_order_cnt: i32::from(chunk[4]),
        pic_order_cnt_top: i32::from(chunk[4]),
        pic_order_cnt_bottom: i32::from(chunk[4]) + 1,
        num_ref_idx_l0_active_minus1: chunk[5] & 0xf,
        num_ref_idx_l1_active_minus1: chunk[5] >> 4,
        ..Default::default()
    };

    header.dec_ref_pic_marking.long_term_reference_flag = flags & 0x8 != 0;
    header.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag = flags & 0x10 != 0;
    header
}

fn mmco(chunk: &[u8]) -> RefPicMarkingInner {
    RefPicMarkingInner {
        memory_management_control_operation: chunk[0] % 7,
        difference_of_pic_nums_minus1: u32::from(chunk[1]),
        long_term_pic_num: u32::from(chunk[2]),
        long_term_frame_idx: u32::from(chunk[3] & 0xf),
        max_long_term_frame_idx: MaxLongTermFrameIdx::from_value_plus1(u32::from(chunk[3] >> 4)),
    }
}

fuzz_target!(|data: &[u8]| {
    let mut dpb = Dpb::new();

    for (decode_index, picture) in data.split(|&b| b == 0xff).enumerate() {
        if picture.len() < 6 {
            continue;
        }

        let mut header = header(&picture[..6]);
        if header.dec_ref_pic_marking.adaptive_ref_pic_marking_mode_flag {
            header.dec_ref_pic_marking.inner = picture[6..].chunks_exact(4).map(mmco).collect();
        }

        let _ = dpb.build_ref_lists(&header);

        if dpb.mark(&header, decode_index as u32, header.idr).is_ok() {
            assert!(dpb.num_active() <= dpb.max_num_ref_frames().max(1));
        }
    }
});
