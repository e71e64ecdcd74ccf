// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use enumn::N;

/// Parity of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    Top,
    Bottom,
}

impl Parity {
    pub fn opposite(self) -> Self {
        match self {
            Parity::Top => Parity::Bottom,
            Parity::Bottom => Parity::Top,
        }
    }
}

/// Which fields of a reference frame an operation applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fields {
    Top,
    Bottom,
    Both,
}

impl Fields {
    fn covers(self, parity: Parity) -> bool {
        matches!(
            (self, parity),
            (Fields::Both, _) | (Fields::Top, Parity::Top) | (Fields::Bottom, Parity::Bottom)
        )
    }
}

impl From<Option<Parity>> for Fields {
    fn from(parity: Option<Parity>) -> Self {
        match parity {
            None => Fields::Both,
            Some(Parity::Top) => Fields::Top,
            Some(Parity::Bottom) => Fields::Bottom,
        }
    }
}

impl From<Parity> for Fields {
    fn from(parity: Parity) -> Self {
        Some(parity).into()
    }
}

/// Reference marking of a single field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

/// Reference marking of both fields of a DPB entry.
///
/// A frame reference has both fields marked the same way. Field pictures can
/// leave one parity unused, or mix short and long-term marking while an MMCO
/// sequence converts a pair one field at a time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub top: Reference,
    pub bottom: Reference,
}

impl Usage {
    pub const UNUSED: Usage = Usage { top: Reference::None, bottom: Reference::None };

    pub fn get(&self, parity: Parity) -> Reference {
        match parity {
            Parity::Top => self.top,
            Parity::Bottom => self.bottom,
        }
    }

    fn field_mut(&mut self, parity: Parity) -> &mut Reference {
        match parity {
            Parity::Top => &mut self.top,
            Parity::Bottom => &mut self.bottom,
        }
    }

    fn parities() -> [Parity; 2] {
        [Parity::Top, Parity::Bottom]
    }

    /// Marks the covered fields with `reference`.
    pub fn set(&mut self, fields: Fields, reference: Reference) {
        for parity in Self::parities() {
            if fields.covers(parity) {
                *self.field_mut(parity) = reference;
            }
        }
    }

    /// Clears the covered fields currently marked as `reference`. `None` clears any marking.
    pub fn clear(&mut self, fields: Fields, reference: Option<Reference>) {
        for parity in Self::parities() {
            let field = self.field_mut(parity);
            if fields.covers(parity) && reference.map_or(true, |r| *field == r) {
                *field = Reference::None;
            }
        }
    }

    pub fn is_unused(&self) -> bool {
        *self == Self::UNUSED
    }

    pub fn any(&self, reference: Reference) -> bool {
        self.top == reference || self.bottom == reference
    }

    pub fn all(&self, reference: Reference) -> bool {
        self.top == reference && self.bottom == reference
    }

    pub fn any_short_term(&self) -> bool {
        self.any(Reference::ShortTerm)
    }

    pub fn any_long_term(&self) -> bool {
        self.any(Reference::LongTerm)
    }

    /// Whether both fields are used for reference, i.e. the entry can be referenced as a frame.
    pub fn is_complementary_pair(&self) -> bool {
        self.top != Reference::None && self.bottom != Reference::None
    }

    /// Whether any of the covered fields is marked at all.
    pub fn covers_any(&self, fields: Fields) -> bool {
        Self::parities().into_iter().any(|p| fields.covers(p) && self.get(p) != Reference::None)
    }
}

/// How a reference list entry uses its frame. The values are the ones the
/// accelerator descriptor addressing (`3 * slot + code`) is built on.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UsageCode {
    #[default]
    Frame = 0,
    FieldTop = 1,
    FieldBottom = 2,
}

impl From<Parity> for UsageCode {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::Top => UsageCode::FieldTop,
            Parity::Bottom => UsageCode::FieldBottom,
        }
    }
}

/// One DPB entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferenceFrame {
    pub usage: Usage,
    /// Whether the entry was decoded as field pictures.
    pub field: bool,
    pub decode_index: u32,

    pub frame_num: u32,
    pub frame_num_wrap: i32,
    pub pic_num: i32,
    pub long_term_frame_idx: u32,
    pub long_term_pic_num: i32,

    pub pic_order_cnt: i32,
    pub pic_order_cnt_top: i32,
    pub pic_order_cnt_bottom: i32,
}

impl ReferenceFrame {
    pub fn is_unused(&self) -> bool {
        self.usage.is_unused()
    }
}

#[cfg(test)]
mod tests {
    use super::Fields;
    use super::Reference;
    use super::Usage;

    #[test]
    fn clear_keeps_complementary_field() {
        let mut usage = Usage::default();
        usage.set(Fields::Both, Reference::ShortTerm);
        assert!(usage.is_complementary_pair());

        usage.clear(Fields::Top, Some(Reference::ShortTerm));
        assert_eq!(usage.top, Reference::None);
        assert_eq!(usage.bottom, Reference::ShortTerm);
        assert!(!usage.is_complementary_pair());
        assert!(usage.any_short_term());
    }

    #[test]
    fn clear_only_matching_marking() {
        let mut usage = Usage { top: Reference::LongTerm, bottom: Reference::ShortTerm };

        usage.clear(Fields::Both, Some(Reference::ShortTerm));
        assert_eq!(usage, Usage { top: Reference::LongTerm, bottom: Reference::None });

        usage.clear(Fields::Both, None);
        assert!(usage.is_unused());
    }
}
