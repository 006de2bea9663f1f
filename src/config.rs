// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Partition table (`part.json`) and boot pointer (`boot.json`).

use core::fmt::Write;

use heapless::{String, Vec};
#[allow(unused_imports)]
use log::{debug, error, info, warn};

use storage::kv::{self, KvError, Quoted, Value, Visitor};
use storage::sectors_for;

use crate::settings::{MAX_COMMON_ARGS, MAX_IMAGE_ARGS, MAX_IMAGES, TOTAL_SECTORS};

pub const IMAGE_NAME_LEN: usize = 32;
pub const IMAGE_VERSION_LEN: usize = 16;
pub const ARG_LEN: usize = 128;
pub const COMMON_ARG_LEN: usize = 64;
/// Raw P-256 public key, X then Y
pub const ECDSA_PUB_LEN: usize = 64;

/// Upper bound of a serialized partition table
pub const PART_FILE_LEN: usize = 4096;

pub type ImageArg = String<ARG_LEN>;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub name: String<IMAGE_NAME_LEN>,
    pub version: String<IMAGE_VERSION_LEN>,
    pub status: u32,
    /// First flash sector of the image
    pub sector: u32,
    /// Image length in bytes
    pub size: u32,
    pub sector_count: u32,
    pub ecdsa_pub: Option<[u8; ECDSA_PUB_LEN]>,
    pub args: Vec<ImageArg, MAX_IMAGE_ARGS>,
}

impl ImageEntry {
    /// One past the last sector used by this image. Saturates on a corrupt table.
    pub fn end_sector(&self) -> u32 {
        self.sector.saturating_add(self.sector_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartConfig {
    pub baud: u32,
    pub timeout: u32,
    pub common: Vec<String<COMMON_ARG_LEN>, MAX_COMMON_ARGS>,
    pub verbose: u32,
    pub insecure: u32,
    pub fail_check: u32,
    /// Image the bootloader falls back to, if the table names one
    pub rollback_image: Option<u32>,
    pub images: Vec<ImageEntry, MAX_IMAGES>,
}

impl Default for PartConfig {
    fn default() -> Self {
        Self {
            baud: 115200,
            timeout: 0,
            common: Vec::new(),
            verbose: 0,
            insecure: 0,
            fail_check: 0,
            rollback_image: None,
            images: Vec::new(),
        }
    }
}

impl PartConfig {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// First sector after every installed image, zero for an empty table.
    pub fn next_free_sector(&self) -> u32 {
        self.images
            .iter()
            .map(ImageEntry::end_sector)
            .max()
            .unwrap_or(0)
    }

    /// Sectors left between the end of the last image and the end of the image area.
    pub fn avail_sectors(&self) -> u32 {
        TOTAL_SECTORS.saturating_sub(self.next_free_sector())
    }

    pub fn image_status(&self, index: usize) -> Option<u32> {
        self.images.get(index).map(|i| i.status)
    }

    pub fn image_version(&self, index: usize) -> Option<&str> {
        self.images.get(index).map(|i| i.version.as_str())
    }

    /// Appends `entry` and returns its index.
    pub fn push_image(&mut self, entry: ImageEntry) -> Result<usize, ImageEntry> {
        self.images.push(entry)?;
        Ok(self.images.len() - 1)
    }

    pub fn parse(src: &str) -> Result<Self, KvError> {
        let mut parser = PartParser {
            config: PartConfig::default(),
            ecdsa_fill: 0,
            overflow: false,
        };
        kv::parse(src, &mut parser)?;
        if parser.overflow {
            warn!(
                "part.json lists more than {} images, extra entries ignored",
                MAX_IMAGES
            );
        }
        Ok(parser.config)
    }

    /// Serializes the table in the layout the bootloader reads.
    pub fn to_file(&self) -> Result<String<PART_FILE_LEN>, core::fmt::Error> {
        let mut out = String::new();
        write!(
            out,
            "{{\n  baud    : {},\n  timeout : {},\n  common  : [",
            self.baud, self.timeout
        )?;
        for (i, arg) in self.common.iter().enumerate() {
            if i > 0 {
                out.write_str(", ")?;
            }
            write!(out, "{}", Quoted(arg))?;
        }
        write!(
            out,
            "],\n  verbose : {},\n  image_count : {}\n  image   :\n    [\n",
            self.verbose,
            self.images.len()
        )?;
        for image in &self.images {
            write!(
                out,
                "    {{\n    name    : {},\n    version    : {},\n    status : {},\n    sector : {},\n    size : {},\n    sector_count : {},\n",
                Quoted(&image.name),
                Quoted(&image.version),
                image.status,
                image.sector,
                image.size,
                image.sector_count
            )?;
            if let Some(key) = &image.ecdsa_pub {
                out.write_str("    ecdsa_pub : [")?;
                for (i, b) in key.iter().enumerate() {
                    if i > 0 {
                        out.write_str(", ")?;
                    }
                    write!(out, "0x{:02x}", b)?;
                }
                out.write_str("],\n")?;
            }
            for arg in &image.args {
                write!(out, "    param : {}\n", Quoted(arg))?;
            }
            out.write_str("    },\n")?;
        }
        write!(
            out,
            "    ],\n  insecure    : {},\n  fail_check  : {},\n",
            self.insecure, self.fail_check
        )?;
        if let Some(index) = self.rollback_image {
            write!(out, "  rollback_image : {},\n", index)?;
        }
        out.write_str("}\n")?;
        Ok(out)
    }
}

struct PartParser {
    config: PartConfig,
    ecdsa_fill: usize,
    overflow: bool,
}

impl PartParser {
    fn current(&mut self) -> Option<&mut ImageEntry> {
        if self.overflow {
            return None;
        }
        self.config.images.last_mut()
    }
}

fn number(value: Value<'_>) -> u32 {
    value.as_number().unwrap_or(0) as u32
}

impl<'a> Visitor<'a> for PartParser {
    fn begin_object(&mut self, path: &[&'a str]) -> Result<(), KvError> {
        if path == ["image"] {
            self.ecdsa_fill = 0;
            self.overflow = self.config.images.push(ImageEntry::default()).is_err();
        }
        Ok(())
    }

    fn value(&mut self, path: &[&'a str], value: Value<'a>) -> Result<(), KvError> {
        match (path, value) {
            (["baud"], v) => self.config.baud = number(v),
            (["timeout"], v) => self.config.timeout = number(v),
            (["verbose"], v) => self.config.verbose = number(v),
            (["insecure"], v) => self.config.insecure = number(v),
            (["fail_check"], v) => self.config.fail_check = number(v),
            (["rollback_image"], v) => {
                self.config.rollback_image = v.as_number().and_then(|n| u32::try_from(n).ok())
            }
            (["common"], Value::Str(s)) => {
                if self.config.common.push(kv::unescape(s)).is_err() {
                    warn!("part.json: too many common args, dropping {}", s);
                }
            }
            // Derived from the image list
            (["image_count"], _) => {}
            (["image", key], v) => {
                let fill = self.ecdsa_fill;
                let Some(image) = self.current() else {
                    return Ok(());
                };
                match (*key, v) {
                    ("name", Value::Str(s)) => image.name = kv::unescape(s),
                    ("version", Value::Str(s)) => image.version = kv::unescape(s),
                    ("status", v) => image.status = number(v),
                    ("sector", v) => image.sector = number(v),
                    ("size", v) => image.size = number(v),
                    ("sector_count", v) => image.sector_count = number(v),
                    ("param", Value::Str(s)) => {
                        if image.args.push(kv::unescape(s)).is_err() {
                            warn!("part.json: too many params for {}", image.name);
                        }
                    }
                    ("ecdsa_pub", v) => {
                        if fill < ECDSA_PUB_LEN {
                            let key = image.ecdsa_pub.get_or_insert([0; ECDSA_PUB_LEN]);
                            key[fill] = number(v) as u8;
                            self.ecdsa_fill += 1;
                        }
                    }
                    (other, _) => debug!("part.json: ignoring image key {}", other),
                }
            }
            (other, _) => debug!("part.json: ignoring {:?}", other),
        }
        Ok(())
    }
}

/// Number of sectors an image of `size` bytes occupies.
pub fn image_sectors(size: u32) -> u32 {
    sectors_for(size)
}

/// Boot pointer, `{image : N}`.
pub fn parse_boot_file(src: &str) -> Result<Option<u32>, KvError> {
    struct Boot(Option<u32>);

    impl<'a> Visitor<'a> for Boot {
        fn value(&mut self, path: &[&'a str], value: Value<'a>) -> Result<(), KvError> {
            if path == ["image"] {
                self.0 = value.as_number().and_then(|n| u32::try_from(n).ok());
            }
            Ok(())
        }
    }

    let mut boot = Boot(None);
    kv::parse(src, &mut boot)?;
    Ok(boot.0)
}

pub fn boot_file(index: u32) -> String<32> {
    let mut out = String::new();
    // 32 bytes always hold "{image : <u32>}\n"
    let _ = write!(out, "{{image : {}}}\n", index);
    out
}

#[cfg(test)]
mod config_tests {
    use super::*;

    fn entry(name: &str, sector: u32, sector_count: u32) -> ImageEntry {
        ImageEntry {
            name: kv::truncated(name),
            version: kv::truncated("1.0"),
            sector,
            size: sector_count * 4096,
            sector_count,
            ..Default::default()
        }
    }

    const SAMPLE: &str = r#"{
  baud    : 115200,
  timeout : 3,
  common  : ["console=ttyS0", "quiet"],
  verbose : 2,
  image_count : 2
  image   :
    [
    {
    name    : "boot",
    version    : "0.9",
    sector : 0,
    size : 40000,
    sector_count : 10,
    param : "root=/dev/a"
    param : "ro"
    },
    {
    name    : "app",
    version    : "1.1",
    sector : 10,
    size : 20000,
    sector_count : 5,
    },
    ],
  insecure    : 0,
  fail_check  : 1,
}
"#;

    #[test]
    fn parses_the_bootloader_layout() {
        let part = PartConfig::parse(SAMPLE).unwrap();
        assert_eq!(part.baud, 115200);
        assert_eq!(part.timeout, 3);
        assert_eq!(part.common.len(), 2);
        assert_eq!(part.fail_check, 1);
        assert_eq!(part.image_count(), 2);
        assert_eq!(part.images[0].name.as_str(), "boot");
        assert_eq!(part.images[0].args.len(), 2);
        assert_eq!(part.images[0].args[1].as_str(), "ro");
        assert_eq!(part.images[1].sector, 10);
        assert_eq!(part.image_version(1), Some("1.1"));
        assert_eq!(part.image_status(0), Some(0));
        assert_eq!(part.image_version(2), None);
    }

    #[test]
    fn next_free_sector_follows_the_highest_image() {
        let mut part = PartConfig::default();
        assert_eq!(part.next_free_sector(), 0);
        assert_eq!(part.avail_sectors(), TOTAL_SECTORS);

        part.push_image(entry("a", 0, 10)).unwrap();
        part.push_image(entry("b", 10, 5)).unwrap();
        assert_eq!(part.next_free_sector(), 15);
        assert_eq!(part.avail_sectors(), 0x1F0 - 15);
    }

    #[test]
    fn single_image_at_sector_zero_is_not_overwritten() {
        let mut part = PartConfig::default();
        part.push_image(entry("a", 0, 10)).unwrap();
        assert_eq!(part.next_free_sector(), 10);
    }

    #[test]
    fn unordered_entries_use_the_furthest_end() {
        let mut part = PartConfig::default();
        part.push_image(entry("late", 100, 4)).unwrap();
        part.push_image(entry("early", 0, 10)).unwrap();
        assert_eq!(part.next_free_sector(), 104);
    }

    #[test]
    fn avail_never_underflows() {
        let mut part = PartConfig::default();
        part.push_image(entry("huge", 0, TOTAL_SECTORS + 3)).unwrap();
        assert_eq!(part.avail_sectors(), 0);
    }

    #[test]
    fn corrupt_sector_numbers_do_not_overflow() {
        let part = PartConfig::parse(
            "{ image : [ { name : \"x\", sector : 0xFFFFFFFF, sector_count : 1 } ] }",
        )
        .unwrap();
        assert_eq!(part.next_free_sector(), u32::MAX);
        assert_eq!(part.avail_sectors(), 0);
    }

    #[test]
    fn rollback_image_is_optional() {
        let mut part = PartConfig::parse(SAMPLE).unwrap();
        assert_eq!(part.rollback_image, None);
        assert!(!part.to_file().unwrap().contains("rollback_image"));

        part.rollback_image = Some(0);
        let text = part.to_file().unwrap();
        assert!(text.ends_with("fail_check  : 1,\n  rollback_image : 0,\n}\n"));
        assert_eq!(PartConfig::parse(&text).unwrap(), part);
    }

    #[test]
    fn serialized_table_reads_back() {
        let mut part = PartConfig::parse(SAMPLE).unwrap();
        let mut signed = entry("signed", 15, 2);
        signed.ecdsa_pub = Some(core::array::from_fn(|i| i as u8));
        signed.status = 1;
        part.push_image(signed).unwrap();

        let text = part.to_file().unwrap();
        assert_eq!(PartConfig::parse(&text).unwrap(), part);
        assert!(text.contains("image_count : 3\n"));
    }

    #[test]
    fn table_capacity_is_enforced() {
        let mut part = PartConfig::default();
        for i in 0..MAX_IMAGES as u32 {
            assert_eq!(part.push_image(entry("x", i, 1)), Ok(i as usize));
        }
        assert!(part.push_image(entry("y", 99, 1)).is_err());
    }

    #[test]
    fn boot_pointer_round_trip() {
        assert_eq!(parse_boot_file(&boot_file(3)).unwrap(), Some(3));
        assert_eq!(parse_boot_file("{\n    image : 0\n}\n").unwrap(), Some(0));
        assert_eq!(parse_boot_file("{ other : 1 }").unwrap(), None);
    }

    #[test]
    fn image_sectors_round_up() {
        assert_eq!(image_sectors(0), 0);
        assert_eq!(image_sectors(1), 1);
        assert_eq!(image_sectors(8192), 2);
        assert_eq!(image_sectors(8193), 3);
    }
}
