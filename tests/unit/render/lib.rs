/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Integration tests that drive the real render thread, bridge, and GPU
//! process together.

#[cfg(test)]
mod common;
#[cfg(test)]
mod render_thread;
#[cfg(test)]
mod scenario;
