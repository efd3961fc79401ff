// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio server control for the daemon.

#[cfg(test)]
pub mod fake;
pub mod pactl;
pub mod parse;
pub mod server;
pub mod subscribe;
pub mod types;

pub use pactl::PactlClient;
pub use server::{AudioServer, ServerCapabilities, ServerError, ServerResult};
pub use types::*;
