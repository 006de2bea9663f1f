// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

// Static settings

use ota::CertVerification;

// Config files
pub const PART_FILE: &str = "/root/part.json";
pub const FOTA_FILE: &str = "/root/fota.json";
pub const BOOT_FILE: &str = "/root/boot.json";
pub const BOOTFAIL_FILE: &str = "/root/bootfail";
pub const LASTBOOT_FILE: &str = "/root/lastboot";
pub const ROOT_CA_FILE: &str = "/root/root_ca_pem";

/// Largest CA certificate accepted
pub const ROOT_CA_MAX_LEN: usize = 1800;
/// Read buffer for the config files
pub const CONFIG_FILE_MAX_LEN: usize = 4096;

// Flash layout
/// Bytes of flash available to images, starting at offset zero
pub const FLASH_IMAGE_AREA: u32 = 0x1F0000;
pub const TOTAL_SECTORS: u32 = FLASH_IMAGE_AREA / storage::SECTOR_SIZE as u32;
/// Sector cache slots used while writing an image
pub const CACHE_SLOTS: usize = 2;

// Partition table
pub const MAX_IMAGES: usize = 8;
pub const MAX_IMAGE_ARGS: usize = 8;
pub const MAX_COMMON_ARGS: usize = 8;

/// What happens to the OTA job after a downloaded image fails verification.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum MismatchPolicy {
    /// Keep the job so the next boot downloads again
    #[default]
    RetryNextBoot,
    /// Clear the job and go back to BLE provisioning
    ReturnToProvisioning,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub cert_verification: CertVerification,
    pub on_mismatch: MismatchPolicy,
}
