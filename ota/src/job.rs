// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! The OTA job record persisted as `fota.json`: network credentials, where to
//! fetch the image from and what to expect of it.

use core::fmt::Write;

use heapless::String;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use storage::kv::{self, KvError, Quoted, Value, Visitor};

pub const SSID_LEN: usize = 32;
pub const PASSPHRASE_LEN: usize = 32;
pub const SERVER_LEN: usize = 128;
pub const SERVER_PORT_LEN: usize = 6;
pub const NAME_LEN: usize = 32;
pub const VERSION_LEN: usize = 16;
pub const FILENAME_LEN: usize = 32;
/// Hex encoded SHA-256
pub const HASH_LEN: usize = 64;
pub const USERNAME_LEN: usize = 32;
pub const PASSWORD_LEN: usize = 32;
pub const ARGS_LEN: usize = 128;

/// Bytes covered by one server name segment written over BLE
pub const SERVER_SEGMENT_LEN: usize = 20;

/// Upper bound of a serialized job
pub const JOB_FILE_LEN: usize = 1024;

/// What the updater does on its next boot.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum OtaPhase {
    /// Wait for a BLE client to provide a job
    #[default]
    Provisioning,
    /// Download and install the image described by the job
    Upgrade,
}

impl OtaPhase {
    pub const PROVISIONING_FLAG: u8 = 0;
    pub const UPGRADE_FLAG: u8 = 2;

    /// Anything other than the upgrade flag means provisioning.
    pub fn from_flag(flag: u8) -> Self {
        match flag {
            Self::UPGRADE_FLAG => OtaPhase::Upgrade,
            _ => OtaPhase::Provisioning,
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            OtaPhase::Provisioning => Self::PROVISIONING_FLAG,
            OtaPhase::Upgrade => Self::UPGRADE_FLAG,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OtaJobConfig {
    pub ssid: String<SSID_LEN>,
    pub passphrase: String<PASSPHRASE_LEN>,
    pub phase: OtaPhase,
    pub server: String<SERVER_LEN>,
    pub server_port: String<SERVER_PORT_LEN>,
    pub name: String<NAME_LEN>,
    pub version: String<VERSION_LEN>,
    /// Path of the image on the server
    pub filename: String<FILENAME_LEN>,
    pub filesize: u32,
    pub hash: String<HASH_LEN>,
    pub username: String<USERNAME_LEN>,
    pub password: String<PASSWORD_LEN>,
    pub param_count: u32,
    /// Boot arguments recorded with the installed image
    pub args: String<ARGS_LEN>,
}

impl OtaJobConfig {
    /// A job with every field cleared, in the provisioning phase.
    pub fn blank() -> Self {
        Self::default()
    }

    /// The expected image digest, if `hash` holds 64 hex digits.
    pub fn expected_digest(&self) -> Option<[u8; 32]> {
        let mut digest = [0u8; 32];
        hex::decode_to_slice(self.hash.as_str(), &mut digest).ok()?;
        Some(digest)
    }

    pub fn set_expected_digest(&mut self, digest: &[u8; 32]) {
        let mut text = [0u8; HASH_LEN];
        // Both sizes are fixed, encoding cannot fail
        if hex::encode_to_slice(digest, &mut text).is_ok() {
            self.hash = kv::truncated(core::str::from_utf8(&text).unwrap_or_default());
        }
    }

    /// Overwrites segment `index` of the server name. Segments are
    /// [`SERVER_SEGMENT_LEN`] bytes apart; a name longer than one segment is
    /// written in several pieces and a short piece ends the name.
    pub fn set_server_segment(&mut self, index: usize, data: &[u8]) {
        let mut raw = [0u8; SERVER_LEN];
        raw[..self.server.len()].copy_from_slice(self.server.as_bytes());

        let start = (index * SERVER_SEGMENT_LEN).min(SERVER_LEN);
        let end = (start + data.len()).min(SERVER_LEN);
        raw[start..end].copy_from_slice(&data[..end - start]);
        if end < SERVER_LEN {
            raw[end] = 0;
        }

        let len = raw.iter().position(|&b| b == 0).unwrap_or(SERVER_LEN);
        self.server = kv::truncated(utf8_prefix(&raw[..len]));
    }

    /// Serializes the job in the config file dialect.
    pub fn to_file(&self) -> Result<String<JOB_FILE_LEN>, core::fmt::Error> {
        let mut out = String::new();
        write!(
            out,
            "{{\n    ssid        : {},\n    passphrase  : {},\n    ota_flag    : {},\n    server      : {},\n    server_port : {},\n",
            Quoted(&self.ssid),
            Quoted(&self.passphrase),
            self.phase.flag(),
            Quoted(&self.server),
            Quoted(&self.server_port),
        )?;
        write!(
            out,
            "    name        : {},\n    version     : {},\n    filename    : {},\n    filesize    : {},\n    hash        : {},\n",
            Quoted(&self.name),
            Quoted(&self.version),
            Quoted(&self.filename),
            self.filesize,
            Quoted(&self.hash),
        )?;
        write!(
            out,
            "    username    : {},\n    password    : {},\n    param_count : \"{}\",\n    args        : {}\n}}\n",
            Quoted(&self.username),
            Quoted(&self.password),
            self.param_count,
            Quoted(&self.args),
        )?;
        Ok(out)
    }

    /// Parses `fota.json`. Unknown keys are ignored, missing ones stay blank.
    pub fn parse(src: &str) -> Result<Self, KvError> {
        let mut job = Self::blank();
        kv::parse(src, &mut job)?;
        Ok(job)
    }
}

impl<'a> Visitor<'a> for OtaJobConfig {
    fn value(&mut self, path: &[&'a str], value: Value<'a>) -> Result<(), KvError> {
        let [key] = path else {
            return Ok(());
        };
        match (*key, value) {
            ("ssid", Value::Str(s)) => self.ssid = kv::unescape(s),
            ("passphrase", Value::Str(s)) => self.passphrase = kv::unescape(s),
            ("server", Value::Str(s)) => self.server = kv::unescape(s),
            ("server_port", Value::Str(s)) => self.server_port = kv::unescape(s),
            ("name", Value::Str(s)) => self.name = kv::unescape(s),
            ("version", Value::Str(s)) => self.version = kv::unescape(s),
            ("filename", Value::Str(s)) => self.filename = kv::unescape(s),
            ("hash", Value::Str(s)) => self.hash = kv::unescape(s),
            ("username", Value::Str(s)) => self.username = kv::unescape(s),
            ("password", Value::Str(s)) => self.password = kv::unescape(s),
            ("args", Value::Str(s)) => self.args = kv::unescape(s),
            ("ota_flag", v) => {
                self.phase = OtaPhase::from_flag(v.as_number().unwrap_or(0) as u8)
            }
            ("filesize", v) => self.filesize = v.as_number().unwrap_or(0) as u32,
            ("param_count", v) => self.param_count = v.as_number().unwrap_or(0) as u32,
            (other, _) => debug!("fota.json: ignoring {}", other),
        }
        Ok(())
    }
}

/// Longest valid UTF-8 prefix of `bytes`.
pub fn utf8_prefix(bytes: &[u8]) -> &str {
    match core::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
    }
}

#[cfg(test)]
mod job_tests {
    use super::*;

    const PROVISIONED: &str = r#"{
    ssid        : "lab",
    passphrase  : "hunter22",
    ota_flag    : 2,
    server      : "updates.example.com",
    server_port : "443",
    name        : "app",
    version     : "1.2.0",
    filename    : "/fw/app.bin",
    filesize    : 8192,
    hash        : "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
    username    : "",
    password    : "",
    param_count    : "1",
    args    : "console=ttyS0"
}
"#;

    #[test]
    fn parses_the_provisioned_layout() {
        let job = OtaJobConfig::parse(PROVISIONED).unwrap();
        assert_eq!(job.ssid.as_str(), "lab");
        assert_eq!(job.phase, OtaPhase::Upgrade);
        assert_eq!(job.server.as_str(), "updates.example.com");
        assert_eq!(job.server_port.as_str(), "443");
        assert_eq!(job.filesize, 8192);
        assert_eq!(job.param_count, 1);
        assert_eq!(job.args.as_str(), "console=ttyS0");
        assert_eq!(job.expected_digest().unwrap()[..2], [0x9f, 0x86]);
    }

    #[test]
    fn serialized_job_reads_back() {
        let mut job = OtaJobConfig::parse(PROVISIONED).unwrap();
        job.password = kv::truncated("p\"w");
        let text = job.to_file().unwrap();
        assert_eq!(OtaJobConfig::parse(&text).unwrap(), job);
    }

    #[test]
    fn unknown_flags_mean_provisioning() {
        assert_eq!(OtaPhase::from_flag(0), OtaPhase::Provisioning);
        assert_eq!(OtaPhase::from_flag(1), OtaPhase::Provisioning);
        assert_eq!(OtaPhase::from_flag(2), OtaPhase::Upgrade);
    }

    #[test]
    fn blank_job_has_no_digest() {
        assert_eq!(OtaJobConfig::blank().expected_digest(), None);
        let mut job = OtaJobConfig::blank();
        job.hash = kv::truncated("zz");
        assert_eq!(job.expected_digest(), None);
    }

    #[test]
    fn digest_round_trips_through_hex() {
        let mut job = OtaJobConfig::blank();
        let digest = [0xABu8; 32];
        job.set_expected_digest(&digest);
        assert_eq!(job.hash.len(), 64);
        assert_eq!(job.expected_digest(), Some(digest));
    }

    #[test]
    fn server_name_is_assembled_from_segments() {
        let mut job = OtaJobConfig::blank();
        job.set_server_segment(0, b"aaaaaaaaaaaaaaaaaaaa");
        job.set_server_segment(1, b"bbbbbbbbbbbbbbbbbbbb");
        job.set_server_segment(2, b".example.com");
        assert_eq!(
            job.server.as_str(),
            "aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbb.example.com"
        );

        // Rewriting the first segment with a short name ends the string there
        job.set_server_segment(0, b"short");
        assert_eq!(job.server.as_str(), "short");
    }
}
