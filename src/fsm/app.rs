// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

// Originally described in https://hoverbear.org/blog/rust-state-machine-pattern/

// Tenets:
//  1. Lightweight and easy to understand/change.
//  2. Only "big" transitions are tracked, never progress within a download.
//  3. Non intrusive in application code.

#[allow(unused_imports)]
use log::{debug, error, info, warn};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum State {
    #[default]
    Boot,
    Provisioning,
    UpgradeConnectWifi,
    UpgradeDownloading,
    UpgradeVerifying,
    UpgradeCommitting,
    Done,
    Error,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// Job file says provisioning is needed
    Provision,
    /// Job file holds an upgrade
    Upgrade,
    Ok,
    Fail,
}

impl State {
    pub fn next(self, event: Event) -> State {
        let next = match (self, event) {
            (State::Boot, Event::Provision) => State::Provisioning,
            (State::Boot, Event::Upgrade) => State::UpgradeConnectWifi,
            (State::Provisioning, Event::Ok) => State::Done,
            (State::UpgradeConnectWifi, Event::Ok) => State::UpgradeDownloading,
            (State::UpgradeDownloading, Event::Ok) => State::UpgradeVerifying,
            (State::UpgradeVerifying, Event::Ok) => State::UpgradeCommitting,
            (State::UpgradeCommitting, Event::Ok) => State::Done,
            (s, Event::Fail) if !s.is_terminal() => State::Error,
            (s, e) => {
                error!("Wrong state, event combination: {:?} {:?}", s, e);
                State::Error
            }
        };
        debug!("{:?} --{:?}--> {:?}", self, event, next);
        next
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::Error)
    }
}
