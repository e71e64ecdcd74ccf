// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec-level models that do not depend on how pictures are actually decoded.

pub mod h264;
