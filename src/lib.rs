// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

#![cfg_attr(not(test), no_std)]
#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod fsm;
pub mod orchestrator;
pub mod provisioning;
pub mod settings;
pub mod store;
pub mod wifi;

pub use errors::{FotaError, FotaResult};
pub use orchestrator::{Orchestrator, Outcome};
