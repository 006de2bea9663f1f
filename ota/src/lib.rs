#![cfg_attr(not(test), no_std)]
// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chunked HTTPS download of a firmware image.
//!
//! The image size is learnt with a `HEAD` request, then the body is fetched
//! in [`CHUNK_SIZE`] ranges over a single keep-alive TLS session. A chunk that
//! fails is requested again on a fresh connection, up to [`MAX_RETRIES`]
//! attempts. Only complete chunks are hashed and handed to the [`ImageSink`],
//! so the digest of a retried download matches that of a clean one.

pub mod http;
pub mod job;
pub mod otatraits;
pub mod target;

use hal::{Connection, ConnectError, TlsConnector, TlsError, TlsSession};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};

use crate::http::{HttpError, MAX_HEAD_LEN, Request, ResponseHead};
use crate::otatraits::{ImageSink, StorageError};

/// Bytes requested per range GET
pub const CHUNK_SIZE: usize = 4096;
/// Attempts per chunk before the download is abandoned
pub const MAX_RETRIES: u8 = 5;

/// What to do when the server certificate does not verify against the CA.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum CertVerification {
    /// Abort the download
    #[default]
    Required,
    /// Log the verification flags and carry on
    Optional,
}

/// Where the image lives.
#[derive(Debug, Copy, Clone)]
pub struct Remote<'a> {
    pub host: &'a str,
    pub port: &'a str,
    pub path: &'a str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DownloadError {
    Connect(ConnectError),
    /// The server certificate failed verification
    CertificateRejected { flags: u32 },
    Http(HttpError),
    /// The size probe failed on the wire
    Probe(TlsError),
    /// The server answered the size probe with a non success status
    Status(u16),
    /// The size probe response carried no Content-Length
    MissingContentLength,
    /// The image does not fit the space left on flash
    ImageTooLarge { size: u32, capacity: u32 },
    /// A chunk failed [`MAX_RETRIES`] times
    RetriesExhausted { offset: u32 },
    Storage(StorageError),
}

impl From<HttpError> for DownloadError {
    fn from(e: HttpError) -> Self {
        DownloadError::Http(e)
    }
}

impl From<StorageError> for DownloadError {
    fn from(e: StorageError) -> Self {
        DownloadError::Storage(e)
    }
}

/// DownloadState for the download session
///
/// Tracks how far the session got, mostly for logging and for callers
/// inspecting a failed session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DownloadState {
    Init,
    Connecting,
    /// Size probe sent, waiting for the response head
    HeadRequested,
    SizeKnown { total: u32 },
    /// Range request for the chunk at `offset` sent
    GetRequested { offset: u32 },
    ChunkReceiving { offset: u32, received: u32 },
    ChunkDone { offset: u32 },
    Complete { received: u32 },
    Failed,
}

/// Outcome of a finished download.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    /// Bytes accepted and written to the sink
    pub received: u32,
    /// Size announced by the server
    pub total: u32,
    pub digest: [u8; 32],
}

/// How a single chunk attempt ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ChunkOutcome {
    Complete,
    /// The peer closed the session after sending this many body bytes
    Closed(usize),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ChunkError {
    Tls(TlsError),
    Http(HttpError),
    Status(u16),
    /// The session ended before a complete response head arrived
    Closed,
}

impl From<TlsError> for ChunkError {
    fn from(e: TlsError) -> Self {
        match e {
            TlsError::PeerCloseNotify => ChunkError::Closed,
            e => ChunkError::Tls(e),
        }
    }
}

impl From<HttpError> for ChunkError {
    fn from(e: HttpError) -> Self {
        ChunkError::Http(e)
    }
}

/// # DownloadSession
///
/// Owns every buffer the download needs so nothing lives in globals.
/// The running hasher is fed exactly once per accepted chunk, in order.
pub struct DownloadSession {
    state: DownloadState,
    verification: CertVerification,
    hasher: Sha256,
    request: Request,
    head: [u8; MAX_HEAD_LEN],
    chunk: [u8; CHUNK_SIZE],
}

impl DownloadSession {
    pub fn new(verification: CertVerification) -> Self {
        Self {
            state: DownloadState::Init,
            verification,
            hasher: Sha256::new(),
            request: Request::new(),
            head: [0; MAX_HEAD_LEN],
            chunk: [0; CHUNK_SIZE],
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Downloads `remote` into `sink`, refusing images larger than `capacity`.
    ///
    /// Returns the number of bytes accepted and the SHA-256 over them.
    pub async fn run<C, S>(
        &mut self,
        connector: &mut C,
        remote: &Remote<'_>,
        ca_pem: &[u8],
        capacity: u32,
        sink: &mut S,
    ) -> Result<DownloadSummary, DownloadError>
    where
        C: TlsConnector,
        S: ImageSink,
    {
        self.hasher = Sha256::new();
        let result = self.download(connector, remote, ca_pem, capacity, sink).await;
        match &result {
            Ok(summary) => {
                info!(
                    "Download finished: {} of {} bytes",
                    summary.received, summary.total
                );
                self.state = DownloadState::Complete {
                    received: summary.received,
                };
            }
            Err(e) => {
                error!("Download failed in state {:?}: {:?}", self.state, e);
                self.state = DownloadState::Failed;
            }
        }
        result
    }

    async fn download<C, S>(
        &mut self,
        connector: &mut C,
        remote: &Remote<'_>,
        ca_pem: &[u8],
        capacity: u32,
        sink: &mut S,
    ) -> Result<DownloadSummary, DownloadError>
    where
        C: TlsConnector,
        S: ImageSink,
    {
        let mut session = self.connect(connector, remote, ca_pem).await?;

        let total = match self.probe_size(&mut session, remote).await {
            Ok(total) => total,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };
        self.state = DownloadState::SizeKnown { total };
        info!("Image size: {} bytes", total);

        if total > capacity {
            session.close().await;
            return Err(DownloadError::ImageTooLarge {
                size: total,
                capacity,
            });
        }

        let mut offset = 0u32;
        while offset < total {
            let len = (total - offset).min(CHUNK_SIZE as u32);
            let last = offset + len == total;

            let mut attempts = 0u8;
            let accepted = loop {
                attempts += 1;
                match self.fetch_chunk(&mut session, remote, offset, len, last).await {
                    Ok(ChunkOutcome::Complete) => break len as usize,
                    // A close after the final request is the server honouring Connection: close
                    Ok(ChunkOutcome::Closed(n)) if last => {
                        warn!(
                            "Server closed during final chunk, {} of {} bytes received",
                            n, len
                        );
                        break n;
                    }
                    Ok(ChunkOutcome::Closed(n)) => {
                        warn!(
                            "Server closed mid chunk at offset {} after {} bytes",
                            offset, n
                        );
                    }
                    Err(e) => {
                        warn!(
                            "Chunk at offset {} failed (attempt {}/{}): {:?}",
                            offset, attempts, MAX_RETRIES, e
                        );
                    }
                }

                session.close().await;
                if attempts >= MAX_RETRIES {
                    return Err(DownloadError::RetriesExhausted { offset });
                }
                session = self.connect(connector, remote, ca_pem).await?;
            };

            let data = &self.chunk[..accepted];
            self.hasher.update(data);
            if let Err(e) = sink.write_image_data(offset, data) {
                session.close().await;
                return Err(e.into());
            }
            self.state = DownloadState::ChunkDone { offset };
            debug!("Chunk at offset {} accepted, {} bytes", offset, accepted);

            offset += accepted as u32;
            if accepted < len as usize {
                // Only reachable on the final chunk
                break;
            }
        }

        session.close().await;

        let mut digest = [0u8; 32];
        digest.copy_from_slice(&core::mem::take(&mut self.hasher).finalize());
        Ok(DownloadSummary {
            received: offset,
            total,
            digest,
        })
    }

    async fn connect<C: TlsConnector>(
        &mut self,
        connector: &mut C,
        remote: &Remote<'_>,
        ca_pem: &[u8],
    ) -> Result<C::Session, DownloadError> {
        self.state = DownloadState::Connecting;
        info!("Connecting to {}:{}", remote.host, remote.port);

        let Connection {
            mut session,
            verify_flags,
        } = connector
            .connect(remote.host, remote.port, ca_pem)
            .await
            .map_err(|e| {
                error!("Connection to {} failed: {:?}", remote.host, e);
                DownloadError::Connect(e)
            })?;

        if verify_flags != 0 {
            match self.verification {
                CertVerification::Required => {
                    error!(
                        "Server certificate verification failed, flags 0x{:x}",
                        verify_flags
                    );
                    session.close().await;
                    return Err(DownloadError::CertificateRejected {
                        flags: verify_flags,
                    });
                }
                CertVerification::Optional => warn!(
                    "Server certificate verification failed, flags 0x{:x}. Continuing",
                    verify_flags
                ),
            }
        }
        Ok(session)
    }

    async fn probe_size<T: TlsSession>(
        &mut self,
        session: &mut T,
        remote: &Remote<'_>,
    ) -> Result<u32, DownloadError> {
        http::head_request(&mut self.request, remote.path, remote.host)?;
        debug!("Request:\n{}", self.request);
        send(session, self.request.as_bytes())
            .await
            .map_err(DownloadError::Probe)?;
        self.state = DownloadState::HeadRequested;

        let (head, _, _) = match read_head(session, &mut self.head).await {
            Ok(h) => h,
            Err(ChunkError::Tls(e)) => return Err(DownloadError::Probe(e)),
            Err(ChunkError::Closed) => return Err(DownloadError::Probe(TlsError::PeerCloseNotify)),
            Err(ChunkError::Http(e)) => return Err(DownloadError::Http(e)),
            Err(ChunkError::Status(s)) => return Err(DownloadError::Status(s)),
        };

        if !head.is_success() {
            return Err(DownloadError::Status(head.status));
        }
        head.content_length
            .ok_or(DownloadError::MissingContentLength)
    }

    /// One attempt at fetching `len` bytes at `offset` into the chunk buffer.
    async fn fetch_chunk<T: TlsSession>(
        &mut self,
        session: &mut T,
        remote: &Remote<'_>,
        offset: u32,
        len: u32,
        last: bool,
    ) -> Result<ChunkOutcome, ChunkError> {
        let len = len as usize;
        http::range_request(
            &mut self.request,
            remote.path,
            remote.host,
            offset,
            offset + len as u32 - 1,
            last,
        )?;
        debug!("Request:\n{}", self.request);
        send(session, self.request.as_bytes()).await?;
        self.state = DownloadState::GetRequested { offset };

        let (head, head_len, filled) = read_head(session, &mut self.head).await?;
        match head.status {
            206 => {}
            // Only a whole image that is exactly this chunk can stand in for a range
            200 if offset == 0 && head.content_length == Some(len as u32) => {
                warn!("Range ignored, server sent the whole {} byte image", len)
            }
            status => return Err(ChunkError::Status(status)),
        }

        // Body bytes that arrived together with the head
        let mut received = (filled - head_len).min(len);
        self.chunk[..received].copy_from_slice(&self.head[head_len..head_len + received]);
        if filled - head_len > len {
            warn!("Server sent {} bytes past the requested range", filled - head_len - len);
        }

        while received < len {
            self.state = DownloadState::ChunkReceiving {
                offset,
                received: received as u32,
            };
            match session.read(&mut self.chunk[received..len]).await {
                Ok(0) | Err(TlsError::PeerCloseNotify) => return Ok(ChunkOutcome::Closed(received)),
                Ok(n) => received += n,
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(ChunkError::Tls(e)),
            }
        }
        Ok(ChunkOutcome::Complete)
    }
}

/// Writes all of `data`, repeating calls the engine asks to repeat.
async fn send<T: TlsSession>(session: &mut T, mut data: &[u8]) -> Result<(), TlsError> {
    while !data.is_empty() {
        match session.write(data).await {
            Ok(0) => return Err(TlsError::PeerCloseNotify),
            Ok(n) => data = &data[n..],
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads until the blank line ending the response head. Returns the parsed
/// head, its length and how many bytes of `buf` were filled, which may
/// include the start of the body.
async fn read_head<T: TlsSession>(
    session: &mut T,
    buf: &mut [u8; MAX_HEAD_LEN],
) -> Result<(ResponseHead, usize, usize), ChunkError> {
    let mut filled = 0;
    loop {
        if let Some((head, end)) = http::parse_head(&buf[..filled])? {
            debug!("Response head: {:?}", head);
            return Ok((head, end, filled));
        }
        if filled == buf.len() {
            return Err(HttpError::HeadTooLong.into());
        }
        match session.read(&mut buf[filled..]).await {
            Ok(0) => return Err(ChunkError::Closed),
            Ok(n) => filled += n,
            Err(e) if e.is_transient() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod download_tests {
    use super::*;
    use embassy_futures::block_on;
    use hal::mock::{MockTls, TlsScript};
    use std::collections::HashMap;

    /// Sink recording every write, in order.
    #[derive(Default)]
    struct VecSink {
        image: Vec<u8>,
        writes: Vec<(u32, usize)>,
    }

    impl ImageSink for VecSink {
        fn write_image_data(&mut self, offset: u32, data: &[u8]) -> otatraits::StorageResult<()> {
            let end = offset as usize + data.len();
            if self.image.len() < end {
                self.image.resize(end, 0xFF);
            }
            self.image[offset as usize..end].copy_from_slice(data);
            self.writes.push((offset, data.len()));
            Ok(())
        }

        fn finalize_image(&mut self) -> otatraits::StorageResult<()> {
            Ok(())
        }

        fn invalidate_image(&mut self, _len: u32) -> otatraits::StorageResult<()> {
            self.image.clear();
            Ok(())
        }
    }

    const REMOTE: Remote<'static> = Remote {
        host: "updates.example.com",
        port: "443",
        path: "/fw/app.bin",
    };

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    fn sha(data: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(data));
        out
    }

    fn download(
        tls: &mut MockTls,
        verification: CertVerification,
        capacity: u32,
    ) -> (Result<DownloadSummary, DownloadError>, VecSink, DownloadState) {
        let mut session = DownloadSession::new(verification);
        let mut sink = VecSink::default();
        let result = block_on(session.run(tls, &REMOTE, b"ca", capacity, &mut sink));
        (result, sink, session.state())
    }

    #[test]
    fn chunked_digest_matches_whole_image() {
        for len in [1usize, 4096, 8192, 10000] {
            let data = image(len);
            let mut tls = MockTls::new(TlsScript {
                image: data.clone(),
                ..Default::default()
            });

            let (result, sink, state) = download(&mut tls, CertVerification::Required, 1 << 20);
            let summary = result.unwrap();

            assert_eq!(summary.received as usize, len);
            assert_eq!(summary.total as usize, len);
            assert_eq!(summary.digest, sha(&data));
            assert_eq!(sink.image, data);
            assert_eq!(state, DownloadState::Complete { received: len as u32 });
            assert_eq!(tls.log().connects, 1);
        }
    }

    #[test]
    fn ranges_cover_the_image_and_last_request_closes() {
        let mut tls = MockTls::new(TlsScript {
            image: image(10000),
            ..Default::default()
        });
        download(&mut tls, CertVerification::Required, 1 << 20)
            .0
            .unwrap();

        let heads = tls.requests("HEAD ");
        assert_eq!(heads.len(), 1);
        assert!(heads[0].starts_with("HEAD /fw/app.bin HTTP/1.0\r\nHost: updates.example.com\r\n"));

        let gets = tls.requests("GET ");
        let ranges: Vec<_> = gets
            .iter()
            .map(|r| r.lines().find(|l| l.starts_with("Range:")).unwrap().to_string())
            .collect();
        assert_eq!(
            ranges,
            [
                "Range: bytes=0-4095",
                "Range: bytes=4096-8191",
                "Range: bytes=8192-9999"
            ]
        );
        assert!(gets[0].contains("Connection: keep-alive"));
        assert!(gets[2].contains("Connection: close"));
    }

    #[test]
    fn heads_split_across_records_and_want_read() {
        let data = image(9000);
        let mut tls = MockTls::new(TlsScript {
            image: data.clone(),
            record_size: 7,
            interleave_want_read: true,
            ..Default::default()
        });

        let summary = download(&mut tls, CertVerification::Required, 1 << 20)
            .0
            .unwrap();
        assert_eq!(summary.digest, sha(&data));
    }

    #[test]
    fn four_failures_then_success_hashes_the_chunk_once() {
        let data = image(3 * 4096);
        let mut tls = MockTls::new(TlsScript {
            image: data.clone(),
            get_failures: HashMap::from([(4096, 4)]),
            ..Default::default()
        });

        let (result, sink, _) = download(&mut tls, CertVerification::Required, 1 << 20);
        let summary = result.unwrap();

        assert_eq!(summary.digest, sha(&data));
        assert_eq!(sink.image, data);
        // Each chunk reaches the sink exactly once
        assert_eq!(sink.writes, [(0, 4096), (4096, 4096), (8192, 4096)]);
        assert_eq!(tls.log().connects, 5);
        assert_eq!(tls.requests("GET ").len(), 3 + 4);
    }

    #[test]
    fn fifth_failure_abandons_the_download() {
        let mut tls = MockTls::new(TlsScript {
            image: image(8192),
            get_failures: HashMap::from([(4096, 5)]),
            ..Default::default()
        });

        let (result, sink, state) = download(&mut tls, CertVerification::Required, 1 << 20);

        assert_eq!(result, Err(DownloadError::RetriesExhausted { offset: 4096 }));
        assert_eq!(state, DownloadState::Failed);
        assert_eq!(sink.writes, [(0, 4096)]);
        assert_eq!(tls.log().connects, 5);
    }

    #[test]
    fn reconnect_failure_is_fatal() {
        let tls = MockTls::new(TlsScript {
            image: image(8192),
            get_failures: HashMap::from([(0, 1)]),
            ..Default::default()
        });
        let mut session = DownloadSession::new(CertVerification::Required);
        let mut sink = VecSink::default();

        // First connect succeeds, the second one is refused
        let mut connector = RefuseAfter {
            inner: tls.clone(),
            allowed: 1,
        };
        let result = block_on(session.run(&mut connector, &REMOTE, b"ca", 1 << 20, &mut sink));

        assert!(matches!(result, Err(DownloadError::Connect(_))));
        assert_eq!(tls.log().connects, 1);
    }

    struct RefuseAfter {
        inner: MockTls,
        allowed: u32,
    }

    impl TlsConnector for RefuseAfter {
        type Session = <MockTls as TlsConnector>::Session;

        async fn connect(
            &mut self,
            host: &str,
            port: &str,
            ca_pem: &[u8],
        ) -> Result<Connection<Self::Session>, ConnectError> {
            if self.allowed == 0 {
                return Err(ConnectError::Tcp(-1));
            }
            self.allowed -= 1;
            self.inner.connect(host, port, ca_pem).await
        }
    }

    #[test]
    fn missing_content_length_is_fatal() {
        let mut tls = MockTls::new(TlsScript {
            image: image(100),
            omit_content_length: true,
            ..Default::default()
        });
        let (result, sink, _) = download(&mut tls, CertVerification::Required, 1 << 20);
        assert_eq!(result, Err(DownloadError::MissingContentLength));
        assert!(sink.writes.is_empty());
        assert!(tls.requests("GET ").is_empty());
    }

    #[test]
    fn image_larger_than_capacity_is_refused() {
        let mut tls = MockTls::new(TlsScript {
            image: image(8193),
            ..Default::default()
        });
        let (result, _, _) = download(&mut tls, CertVerification::Required, 8192);
        assert_eq!(
            result,
            Err(DownloadError::ImageTooLarge {
                size: 8193,
                capacity: 8192
            })
        );
    }

    #[test]
    fn unverified_certificate_depends_on_policy() {
        let script = TlsScript {
            image: image(500),
            verify_flags: 0x08,
            ..Default::default()
        };

        let mut tls = MockTls::new(script.clone());
        let (result, _, _) = download(&mut tls, CertVerification::Required, 1 << 20);
        assert_eq!(result, Err(DownloadError::CertificateRejected { flags: 0x08 }));

        let mut tls = MockTls::new(script);
        let (result, _, _) = download(&mut tls, CertVerification::Optional, 1 << 20);
        assert_eq!(result.unwrap().received, 500);
    }

    #[test]
    fn whole_image_answers_to_range_requests_are_refused() {
        let mut tls = MockTls::new(TlsScript {
            image: image(8192),
            ignore_range: true,
            ..Default::default()
        });

        let (result, sink, _) = download(&mut tls, CertVerification::Required, 1 << 20);

        assert_eq!(result, Err(DownloadError::RetriesExhausted { offset: 0 }));
        assert!(sink.writes.is_empty());
        assert_eq!(tls.log().connects, 5);
    }

    #[test]
    fn whole_image_answer_is_fine_for_a_single_chunk() {
        let data = image(1000);
        let mut tls = MockTls::new(TlsScript {
            image: data.clone(),
            ignore_range: true,
            ..Default::default()
        });

        let (result, sink, _) = download(&mut tls, CertVerification::Required, 1 << 20);

        assert_eq!(result.unwrap().digest, sha(&data));
        assert_eq!(sink.writes, [(0, 1000)]);
    }

    #[test]
    fn close_during_final_chunk_completes_short() {
        let data = image(6000);
        let mut tls = MockTls::new(TlsScript {
            image: data.clone(),
            truncate_final: 100,
            ..Default::default()
        });

        let summary = download(&mut tls, CertVerification::Required, 1 << 20)
            .0
            .unwrap();

        assert_eq!(summary.received, 5900);
        assert_eq!(summary.total, 6000);
        assert_eq!(summary.digest, sha(&data[..5900]));
        assert_eq!(tls.log().connects, 1);
    }
}
