/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Geometry in the coordinate system of the GPU device.

use euclid::{Point2D, Rect, Size2D};

/// One hardware pixel of the target surface, after any scaling.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DevicePixel;

pub type DeviceIntPoint = Point2D<i32, DevicePixel>;
pub type DeviceIntSize = Size2D<i32, DevicePixel>;
pub type DeviceIntRect = Rect<i32, DevicePixel>;
