// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! BLE provisioning: a GATT service with one write-only characteristic per
//! OTA job field. Writing the OTA flag characteristic completes provisioning.

use hal::{AttStatus, CharacteristicWrite, ProvisioningLink};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use ota::job::{OtaJobConfig, OtaPhase, utf8_prefix};
use storage::kv;

use crate::errors::{FotaError, FotaResult};

/// 128-bit UUID of the provisioning service
pub const SERVICE_UUID: [u8; 16] = [0x11; 16];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum Characteristic {
    Ssid = 0xAB31,
    Passphrase = 0xAB32,
    OtaFlag = 0x0131,
    Server1 = 0x0231,
    Server2 = 0x0232,
    Server3 = 0x0233,
    ServerPort = 0x0239,
    Name = 0x0331,
    Version = 0x0332,
    Filename = 0x0431,
    Filesize = 0x0432,
    Username = 0x0531,
    Password = 0x0532,
}

impl Characteristic {
    pub const ALL: [Characteristic; 13] = [
        Characteristic::Ssid,
        Characteristic::Passphrase,
        Characteristic::OtaFlag,
        Characteristic::Server1,
        Characteristic::Server2,
        Characteristic::Server3,
        Characteristic::ServerPort,
        Characteristic::Name,
        Characteristic::Version,
        Characteristic::Filename,
        Characteristic::Filesize,
        Characteristic::Username,
        Characteristic::Password,
    ];

    pub fn uuid(self) -> u16 {
        self as u16
    }

    pub fn from_uuid(uuid: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    pub fn uuids() -> [u16; 13] {
        Self::ALL.map(Characteristic::uuid)
    }
}

fn text<const N: usize>(data: &[u8]) -> heapless::String<N> {
    kv::truncated(utf8_prefix(data))
}

/// Applies one characteristic write to `job`.
///
/// Values longer than the field are truncated. Only writes at offset zero are
/// accepted. Returns true when the write completes provisioning.
pub fn apply_write(
    job: &mut OtaJobConfig,
    characteristic: Characteristic,
    offset: u16,
    data: &[u8],
) -> Result<bool, AttStatus> {
    if offset != 0 {
        return Err(AttStatus::InvalidOffset);
    }

    match characteristic {
        Characteristic::Ssid => job.ssid = text(data),
        Characteristic::Passphrase => job.passphrase = text(data),
        Characteristic::OtaFlag => {
            let flag = data.first().copied().unwrap_or(OtaPhase::PROVISIONING_FLAG);
            job.phase = OtaPhase::from_flag(flag);
            info!("OTA flag written: {}", flag);
            return Ok(true);
        }
        Characteristic::Server1 => job.set_server_segment(0, data),
        Characteristic::Server2 => job.set_server_segment(1, data),
        Characteristic::Server3 => job.set_server_segment(2, data),
        Characteristic::ServerPort => job.server_port = text(data),
        Characteristic::Name => job.name = text(data),
        Characteristic::Version => job.version = text(data),
        Characteristic::Filename => job.filename = text(data),
        Characteristic::Filesize => {
            job.filesize = match <[u8; 4]>::try_from(data) {
                Ok(le) => u32::from_le_bytes(le),
                Err(_) => {
                    warn!("Filesize must be 4 bytes, got {}", data.len());
                    0
                }
            }
        }
        Characteristic::Username => job.username = text(data),
        Characteristic::Password => job.password = text(data),
    }
    Ok(false)
}

/// Starts the provisioning service and serves writes into `job` until the
/// OTA flag characteristic is written.
pub async fn provision<L: ProvisioningLink>(
    link: &mut L,
    job: &mut OtaJobConfig,
) -> FotaResult<()> {
    link.start(&SERVICE_UUID, &Characteristic::uuids())
        .map_err(|e| {
            error!("Starting the provisioning service failed: {:?}", e);
            FotaError::Provisioning {
                reason: "service start",
            }
        })?;
    info!("Advertising provisioning service, waiting for a client");

    loop {
        let CharacteristicWrite { uuid, offset, data } = link.next_write().await;
        let Some(characteristic) = Characteristic::from_uuid(uuid) else {
            warn!("Write to unknown characteristic 0x{:04x}", uuid);
            link.respond(AttStatus::AttributeNotFound);
            continue;
        };
        debug!("{:?} write, {} bytes", characteristic, data.len());

        match apply_write(job, characteristic, offset, &data) {
            Ok(done) => {
                link.respond(AttStatus::Success);
                if done {
                    info!("Provisioned");
                    return Ok(());
                }
            }
            Err(status) => {
                warn!("{:?} write rejected: {:?}", characteristic, status);
                link.respond(status);
            }
        }
    }
}

#[cfg(test)]
mod provisioning_tests {
    use super::*;
    use embassy_futures::block_on;
    use hal::mock::ScriptedBle;

    #[test]
    fn nonzero_offset_is_rejected() {
        let mut job = OtaJobConfig::blank();
        assert_eq!(
            apply_write(&mut job, Characteristic::Ssid, 1, b"lab"),
            Err(AttStatus::InvalidOffset)
        );
        assert!(job.ssid.is_empty());
    }

    #[test]
    fn long_values_are_truncated() {
        let mut job = OtaJobConfig::blank();
        apply_write(&mut job, Characteristic::Version, 0, b"1.2.3-rc1+build.20250101").unwrap();
        assert_eq!(job.version.as_str(), "1.2.3-rc1+build.");
        apply_write(&mut job, Characteristic::ServerPort, 0, b"4430000").unwrap();
        assert_eq!(job.server_port.as_str(), "443000");
    }

    #[test]
    fn filesize_is_little_endian_and_exactly_four_bytes() {
        let mut job = OtaJobConfig::blank();
        apply_write(&mut job, Characteristic::Filesize, 0, &[0x00, 0x20, 0x00, 0x00]).unwrap();
        assert_eq!(job.filesize, 8192);
        apply_write(&mut job, Characteristic::Filesize, 0, &[0x00, 0x20]).unwrap();
        assert_eq!(job.filesize, 0);
    }

    #[test]
    fn uuids_are_unique() {
        let uuids = Characteristic::uuids();
        for (i, a) in uuids.iter().enumerate() {
            assert!(!uuids[i + 1..].contains(a));
            assert_eq!(Characteristic::from_uuid(*a).map(Characteristic::uuid), Some(*a));
        }
        assert_eq!(Characteristic::from_uuid(0x1234), None);
    }

    #[test]
    fn session_ends_on_flag_write() {
        let mut ble = ScriptedBle::new();
        ble.push_write(0xAB31, 0, b"lab");
        ble.push_write(0xAB32, 0, b"hunter22");
        ble.push_write(0x0231, 0, b"updates.example.com");
        ble.push_write(0x0239, 3, b"443");
        ble.push_write(0x0239, 0, b"443");
        ble.push_write(0x0431, 0, b"/fw/app.bin");
        ble.push_write(0x7777, 0, b"?");
        ble.push_write(0x0131, 0, &[2]);
        // Never consumed
        ble.push_write(0x0331, 0, b"late");

        let mut job = OtaJobConfig::blank();
        block_on(provision(&mut ble, &mut job)).unwrap();

        assert_eq!(ble.registered().unwrap().len(), 13);
        assert_eq!(job.ssid.as_str(), "lab");
        assert_eq!(job.passphrase.as_str(), "hunter22");
        assert_eq!(job.server.as_str(), "updates.example.com");
        assert_eq!(job.server_port.as_str(), "443");
        assert_eq!(job.filename.as_str(), "/fw/app.bin");
        assert_eq!(job.phase, OtaPhase::Upgrade);
        assert!(job.name.is_empty());

        let responses = ble.responses();
        assert_eq!(responses[3], (0x0239, AttStatus::InvalidOffset));
        assert_eq!(responses[6], (0x7777, AttStatus::AttributeNotFound));
        assert_eq!(responses.len(), 8);
    }
}
