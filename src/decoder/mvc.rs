// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Multi-view (MVC) support: a dependent view decoded next to the base view.
//!
//! Both views share one pipeline and one slot allocator, but keep their own DPB and their own
//! decode-index to buffer-index table. Dependent view decode indices are handed out of the decoder
//! negatively encoded, so [`ReleaseTarget::from_encoded`] can tell both views apart.

use log::debug;
use thiserror::Error;

use crate::buffer::BufferId;
use crate::buffer::CodedBuffer;
use crate::codec::h264::slice::FrameParameters;
use crate::decoder::h264::PipelineState;
use crate::decoder::h264::Shared;
use crate::decoder::core::DecodeCore;
use crate::decoder::preprocessor::Preprocessor;
use crate::decoder::slots::BufferIndex;
use crate::decoder::DecodeError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum View {
    #[default]
    Base,
    Dependent,
}

impl View {
    pub(crate) fn index(self) -> usize {
        match self {
            View::Base => 0,
            View::Dependent => 1,
        }
    }

    /// The view a pre-processed buffer belongs to.
    pub fn of_preprocessor_buffer(parameters: &FrameParameters, id: Option<BufferId>) -> View {
        match (&parameters.mvc, id) {
            (Some(mvc), Some(id)) if mvc.dep_preprocessor_buffer == Some(id) => View::Dependent,
            _ => View::Base,
        }
    }
}

const DEPENDENT_INDEX_OFFSET: i64 = 10;

/// Encodes a dependent view decode index for the outside world.
pub fn encode_dependent_index(decode_index: u32) -> i64 {
    -(i64::from(decode_index) + DEPENDENT_INDEX_OFFSET)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseTarget {
    /// Every reference held by the decoder.
    All,
    Frame { view: View, decode_index: u32 },
}

impl ReleaseTarget {
    /// Decodes an externally visible decode index. Returns `None` for values no view can produce.
    pub fn from_encoded(index: i64) -> Option<Self> {
        let (view, decode_index) = if index >= 0 {
            (View::Base, index)
        } else {
            (View::Dependent, -index - DEPENDENT_INDEX_OFFSET)
        };

        let decode_index = u32::try_from(decode_index).ok()?;
        Some(ReleaseTarget::Frame { view, decode_index })
    }

    pub fn encoded(&self) -> Option<i64> {
        match *self {
            ReleaseTarget::All => None,
            ReleaseTarget::Frame { view: View::Base, decode_index } => {
                Some(i64::from(decode_index))
            }
            ReleaseTarget::Frame { view: View::Dependent, decode_index } => {
                Some(encode_dependent_index(decode_index))
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("buffer index map is full ({0} entries)")]
pub struct MapFull(pub usize);

/// Fixed capacity `decode index -> buffer index` table of one view.
#[derive(Debug)]
pub struct BufferIndexMap {
    entries: Vec<Option<(u32, BufferIndex)>>,
}

impl BufferIndexMap {
    pub fn new(capacity: usize) -> Self {
        Self { entries: vec![None; capacity] }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps `decode_index` to `buffer`, replacing any previous mapping of `decode_index`.
    pub fn insert(&mut self, decode_index: u32, buffer: BufferIndex) -> Result<(), MapFull> {
        let position = self
            .entries
            .iter()
            .position(|e| matches!(e, Some((i, _)) if *i == decode_index))
            .or_else(|| self.entries.iter().position(Option::is_none))
            .ok_or(MapFull(self.entries.len()))?;

        self.entries[position] = Some((decode_index, buffer));
        Ok(())
    }

    pub fn get(&self, decode_index: u32) -> Option<BufferIndex> {
        self.entries.iter().flatten().find(|(i, _)| *i == decode_index).map(|(_, b)| *b)
    }

    pub fn remove(&mut self, decode_index: u32) -> Option<BufferIndex> {
        let entry =
            self.entries.iter_mut().find(|e| matches!(e, Some((i, _)) if *i == decode_index))?;
        entry.take().map(|(_, b)| b)
    }

    /// Drops every mapping to `buffer`.
    pub fn remove_buffer(&mut self, buffer: BufferIndex) {
        for entry in self.entries.iter_mut() {
            if matches!(entry, Some((_, b)) if *b == buffer) {
                *entry = None;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|e| *e = None);
    }
}

impl<C: DecodeCore, P: Preprocessor> Shared<C, P> {
    /// Submits the dependent view of an access unit whose base view was just submitted.
    pub(super) fn input_dependent(
        &self,
        pipeline: &mut PipelineState<P>,
        buffer: &CodedBuffer,
        parameters: &FrameParameters,
    ) -> Result<(), DecodeError> {
        let mvc = parameters.mvc.as_ref().ok_or(DecodeError::MissingMvcParameters)?;
        debug!(
            "Submitting dependent view of {:?} (base pre-processing buffer {:?})",
            parameters.decode_index, mvc.base_preprocessor_buffer
        );

        let id = self.submit_preprocess(
            pipeline,
            buffer,
            &mvc.dep_slice_header,
            mvc.dep_data_offset,
            mvc.dep_slices_length,
        )?;

        buffer.update_frame_parameters(|p| {
            if let Some(mvc) = p.mvc.as_mut() {
                mvc.dep_preprocessor_buffer = Some(id);
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::encode_dependent_index;
    use super::BufferIndexMap;
    use super::MapFull;
    use super::ReleaseTarget;
    use super::View;
    use crate::buffer::BufferId;
    use crate::codec::h264::slice::FrameParameters;
    use crate::codec::h264::slice::MvcFrameParameters;

    #[test]
    fn dependent_indices_are_negative() {
        assert_eq!(encode_dependent_index(0), -10);
        assert_eq!(encode_dependent_index(5), -15);

        assert_eq!(
            ReleaseTarget::from_encoded(-15),
            Some(ReleaseTarget::Frame { view: View::Dependent, decode_index: 5 })
        );
        assert_eq!(
            ReleaseTarget::from_encoded(3),
            Some(ReleaseTarget::Frame { view: View::Base, decode_index: 3 })
        );
        // Between the two ranges.
        assert_eq!(ReleaseTarget::from_encoded(-3), None);

        let target = ReleaseTarget::Frame { view: View::Dependent, decode_index: 7 };
        assert_eq!(ReleaseTarget::from_encoded(target.encoded().unwrap()), Some(target));
        assert_eq!(ReleaseTarget::All.encoded(), None);
    }

    #[test]
    fn map_has_fixed_capacity() {
        let mut map = BufferIndexMap::new(2);

        map.insert(10, 1).unwrap();
        map.insert(11, 2).unwrap();
        assert_eq!(map.insert(12, 3), Err(MapFull(2)));

        // Remapping an index does not need room.
        map.insert(10, 4).unwrap();
        assert_eq!(map.get(10), Some(4));

        assert_eq!(map.remove(10), Some(4));
        map.insert(12, 3).unwrap();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn remove_buffer_drops_all_mappings() {
        let mut map = BufferIndexMap::new(4);

        map.insert(0, 7).unwrap();
        map.insert(1, 7).unwrap();
        map.insert(2, 8).unwrap();
        map.remove_buffer(7);

        assert_eq!(map.get(0), None);
        assert_eq!(map.get(1), None);
        assert_eq!(map.get(2), Some(8));
    }

    #[test]
    fn view_follows_preprocessor_buffer() {
        let parameters = FrameParameters {
            mvc: Some(MvcFrameParameters {
                base_preprocessor_buffer: Some(BufferId(1)),
                dep_preprocessor_buffer: Some(BufferId(2)),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(View::of_preprocessor_buffer(&parameters, Some(BufferId(1))), View::Base);
        assert_eq!(View::of_preprocessor_buffer(&parameters, Some(BufferId(2))), View::Dependent);
        assert_eq!(View::of_preprocessor_buffer(&FrameParameters::default(), None), View::Base);
    }
}
