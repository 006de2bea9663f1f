// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Drives one boot of the updater: either collect a job over BLE, or download,
//! verify and register the image the job describes. Every path ends in a reset.

use embedded_storage::nor_flash::NorFlash;
use hal::{EventSource, FileStore, ProvisioningLink, Reset, TlsConnector, WifiControl, WifiEvent};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use ota::job::{OtaJobConfig, OtaPhase};
use ota::otatraits::ImageSink;
use ota::target::OtaWriter;
use ota::{DownloadSession, DownloadSummary, Remote};
use snafu::ensure;
use storage::SECTOR_SIZE;
use storage::cache::SectorCache;
use storage::kv;

use crate::config::{self, ImageEntry, PartConfig};
use crate::errors::{FotaError, FotaResult, OutOfSpaceSnafu};
use crate::fsm::{Event, State};
use crate::settings::{MismatchPolicy, ROOT_CA_MAX_LEN, UpdatePolicy};
use crate::{provisioning, store, wifi};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A job was received and saved, the next boot runs the upgrade
    Provisioned,
    /// A new image was installed at this partition table index
    Updated { index: usize },
}

pub struct Orchestrator<FS, F, C, W, E, L, const N: usize> {
    files: FS,
    cache: SectorCache<F, N>,
    tls: C,
    wifi: W,
    wifi_events: E,
    ble: L,
    policy: UpdatePolicy,
    state: State,
    part: PartConfig,
    job: OtaJobConfig,
    session: DownloadSession,
}

impl<FS, F, C, W, E, L, const N: usize> Orchestrator<FS, F, C, W, E, L, N>
where
    FS: FileStore,
    F: NorFlash,
    C: TlsConnector,
    W: WifiControl,
    E: EventSource<WifiEvent>,
    L: ProvisioningLink,
{
    pub fn new(
        files: FS,
        cache: SectorCache<F, N>,
        tls: C,
        wifi: W,
        wifi_events: E,
        ble: L,
        policy: UpdatePolicy,
    ) -> Self {
        Self {
            files,
            cache,
            tls,
            wifi,
            wifi_events,
            ble,
            policy,
            state: State::default(),
            part: PartConfig::default(),
            job: OtaJobConfig::blank(),
            session: DownloadSession::new(policy.cert_verification),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn part(&self) -> &PartConfig {
        &self.part
    }

    pub fn job(&self) -> &OtaJobConfig {
        &self.job
    }

    fn advance(&mut self, event: Event) {
        self.state = self.state.next(event);
    }

    /// Runs to completion and reports what happened. Errors are logged here.
    pub async fn run(&mut self) -> FotaResult<Outcome> {
        let result = self.run_inner().await;
        match &result {
            Ok(outcome) => info!("FOTA finished: {:?}", outcome),
            Err(e) => {
                error!("***FOTA ERROR*** {}", e);
                if !self.state.is_terminal() {
                    self.advance(Event::Fail);
                }
            }
        }
        result
    }

    /// Runs, then resets the device whatever the outcome. Does not return.
    pub async fn run_and_reset<R: Reset>(&mut self, reset: &mut R) {
        // Already logged by run()
        let _ = self.run().await;
        info!("Resetting device");
        reset.reset_device()
    }

    async fn run_inner(&mut self) -> FotaResult<Outcome> {
        self.boot()?;
        match self.job.phase {
            OtaPhase::Provisioning => self.provision().await,
            OtaPhase::Upgrade => self.upgrade().await,
        }
    }

    fn boot(&mut self) -> FotaResult<()> {
        if let Err(e) = store::bootpass(&mut self.files) {
            warn!("Could not record boot pass: {}", e);
        }
        self.part = store::load_part_config(&mut self.files)?;
        debug!("{} images installed", self.part.image_count());
        self.job = store::load_job_or_blank(&mut self.files);
        info!("OTA phase: {:?}", self.job.phase);
        Ok(())
    }

    async fn provision(&mut self) -> FotaResult<Outcome> {
        self.advance(Event::Provision);
        provisioning::provision(&mut self.ble, &mut self.job).await?;
        self.job.phase = OtaPhase::Upgrade;
        store::save_job(&mut self.files, &self.job)?;
        self.advance(Event::Ok);
        Ok(Outcome::Provisioned)
    }

    async fn upgrade(&mut self) -> FotaResult<Outcome> {
        self.advance(Event::Upgrade);

        let needed = config::image_sectors(self.job.filesize);
        let available = self.part.avail_sectors();
        ensure!(available >= needed, OutOfSpaceSnafu { needed, available });

        let sector = self.part.next_free_sector();
        info!(
            "Installing {} {} at sector {}, {} sectors free",
            self.job.name, self.job.version, sector, available
        );

        wifi::if_up(
            &mut self.wifi,
            &mut self.wifi_events,
            &self.job.ssid,
            &self.job.passphrase,
        )
        .await?;
        self.advance(Event::Ok);

        let summary = self.download(sector, available).await;
        if let Err(e) = wifi::if_down(&mut self.wifi, &mut self.wifi_events).await {
            warn!("WiFi tear-down failed: {}", e);
        }
        let summary = summary?;
        self.advance(Event::Ok);

        self.verify(sector, needed, &summary)?;
        self.advance(Event::Ok);

        let index = self.commit(sector, &summary)?;
        self.advance(Event::Ok);
        Ok(Outcome::Updated { index })
    }

    async fn download(&mut self, sector: u32, available: u32) -> FotaResult<DownloadSummary> {
        let mut ca = [0u8; ROOT_CA_MAX_LEN];
        let ca_pem = store::load_root_ca(&mut self.files, &mut ca)?;

        let remote = Remote {
            host: &self.job.server,
            port: &self.job.server_port,
            path: &self.job.filename,
        };
        let base = sector * SECTOR_SIZE as u32;
        let capacity = available.saturating_mul(SECTOR_SIZE as u32);

        let mut writer = OtaWriter::new(&mut self.cache, base);
        let summary = self
            .session
            .run(&mut self.tls, &remote, ca_pem, capacity, &mut writer)
            .await?;
        Ok(summary)
    }

    fn verify(&mut self, sector: u32, planned: u32, summary: &DownloadSummary) -> FotaResult<()> {
        let expected = self.job.expected_digest();
        if summary.received > 0 && expected == Some(summary.digest) {
            info!("sha256 validation OK");
            return Ok(());
        }

        if expected.is_none() {
            error!("Job hash {:?} is not a sha256 digest", self.job.hash.as_str());
        }
        error!("sha256 validation failed, {} bytes received", summary.received);

        let sectors = planned.max(config::image_sectors(summary.total));
        let mut writer = OtaWriter::new(&mut self.cache, sector * SECTOR_SIZE as u32);
        writer.invalidate_image(sectors * SECTOR_SIZE as u32)?;

        match self.policy.on_mismatch {
            MismatchPolicy::RetryNextBoot => {
                info!("Keeping the OTA job, the download is retried on next boot")
            }
            MismatchPolicy::ReturnToProvisioning => {
                info!("Clearing the OTA job, back to provisioning");
                self.job = OtaJobConfig::blank();
                store::save_job(&mut self.files, &self.job)?;
            }
        }
        Err(FotaError::VerificationFailed)
    }

    fn commit(&mut self, sector: u32, summary: &DownloadSummary) -> FotaResult<usize> {
        OtaWriter::new(&mut self.cache, sector * SECTOR_SIZE as u32).finalize_image()?;

        let mut part = store::load_part_config(&mut self.files)?;
        let mut entry = ImageEntry {
            name: kv::truncated(&self.job.name),
            version: kv::truncated(&self.job.version),
            sector,
            size: summary.total,
            sector_count: config::image_sectors(summary.total),
            ..Default::default()
        };
        if !self.job.args.is_empty() {
            // Capacity is at least one
            let _ = entry.args.push(kv::truncated(&self.job.args));
        }
        let index = part.push_image(entry).map_err(|_| FotaError::TableFull)?;
        store::save_part_config(&mut self.files, &part)?;
        self.part = part;

        self.job = OtaJobConfig::blank();
        store::save_job(&mut self.files, &self.job)?;
        store::write_boot_index(&mut self.files, index as u32)?;
        info!("Image {} registered, boot pointer updated", index);
        Ok(index)
    }
}
