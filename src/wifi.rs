// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Station mode bring-up and tear-down.
//!
//! The supplicant reports progress as [`WifiEvent`]s over a channel; these
//! helpers wait for the event that completes each step.

use hal::{EventSource, WifiControl, WifiEvent};
#[allow(unused_imports)]
use log::{debug, error, info, warn};

use crate::errors::{FotaError, FotaResult};

/// Joins `ssid` and waits until the interface has an address.
pub async fn if_up<W, E>(
    wifi: &mut W,
    events: &mut E,
    ssid: &str,
    passphrase: &str,
) -> FotaResult<()>
where
    W: WifiControl,
    E: EventSource<WifiEvent>,
{
    info!("Connecting to WiFi network {}", ssid);
    wifi.add_network(ssid, passphrase).map_err(|e| {
        error!("Adding network failed: {:?}", e);
        FotaError::Wifi {
            reason: "add network",
        }
    })?;
    wifi.set_auto_connect(true).map_err(|e| {
        error!("Enabling auto connect failed: {:?}", e);
        FotaError::Wifi {
            reason: "auto connect",
        }
    })?;

    loop {
        match events.next_event().await {
            WifiEvent::AddressAssigned => {
                info!("WiFi link up, address assigned");
                return Ok(());
            }
            WifiEvent::LinkUp => debug!("Link up, waiting for an address..."),
            WifiEvent::LinkDown => warn!("Link down, supplicant keeps retrying"),
            WifiEvent::DisconnectDone => debug!("Stale disconnect event"),
        }
    }
}

/// Drops the connection and waits for the supplicant to confirm.
pub async fn if_down<W, E>(wifi: &mut W, events: &mut E) -> FotaResult<()>
where
    W: WifiControl,
    E: EventSource<WifiEvent>,
{
    wifi.set_auto_connect(false).map_err(|e| {
        error!("Disabling auto connect failed: {:?}", e);
        FotaError::Wifi {
            reason: "auto connect",
        }
    })?;

    while events.next_event().await != WifiEvent::DisconnectDone {}
    info!("WiFi disconnected");
    Ok(())
}
