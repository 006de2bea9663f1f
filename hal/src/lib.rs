// SPDX-FileCopyrightText: 2025 Roman Valls, 2025
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Platform seams for the fota updater.
//!
//! Every SoC that runs the updater provides an implementation of these traits:
//! a TLS client, a small filesystem holding the config files, the WiFi
//! supplicant, the BLE GATT server used for provisioning and a way to reset.
#![cfg_attr(not(feature = "mock"), no_std)]

#[cfg(feature = "mock")]
pub mod mock;

use core::fmt::Debug;
use core::future::Future;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Receiver;

pub use embedded_io_async::{ErrorKind, ErrorType, Read, Write};

/// Errors surfaced by a TLS session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TlsError {
    /// The engine needs more transport input, repeat the same call
    WantRead,
    /// The engine needs to flush transport output, repeat the same call
    WantWrite,
    /// The peer sent close_notify
    PeerCloseNotify,
    /// Hard failure with the platform's error code
    Io(i32),
}

impl TlsError {
    /// True for conditions that are resolved by calling again on the same session.
    pub fn is_transient(&self) -> bool {
        matches!(self, TlsError::WantRead | TlsError::WantWrite)
    }
}

impl embedded_io_async::Error for TlsError {
    fn kind(&self) -> ErrorKind {
        match self {
            TlsError::WantRead | TlsError::WantWrite => ErrorKind::Interrupted,
            TlsError::PeerCloseNotify => ErrorKind::ConnectionReset,
            TlsError::Io(_) => ErrorKind::Other,
        }
    }
}

/// A connected, handshaken TLS stream.
pub trait TlsSession: Read + Write + ErrorType<Error = TlsError> {
    /// Sends close_notify and releases the transport.
    fn close(&mut self) -> impl Future<Output = ()>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// TCP connect to the host failed
    Tcp(i32),
    /// The CA certificate could not be parsed
    CaCertificate(i32),
    /// TLS handshake failed
    Handshake(i32),
}

/// Result of a successful handshake.
///
/// `verify_flags` carries the peer certificate verification result, zero meaning
/// the chain was verified against the supplied CA.
pub struct Connection<S> {
    pub session: S,
    pub verify_flags: u32,
}

pub trait TlsConnector {
    type Session: TlsSession;

    /// Opens a TCP connection to `host:port` and performs the TLS handshake,
    /// trusting the PEM encoded `ca_pem`.
    fn connect(
        &mut self,
        host: &str,
        port: &str,
        ca_pem: &[u8],
    ) -> impl Future<Output = Result<Connection<Self::Session>, ConnectError>>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FileError {
    NotFound,
    /// The file does not fit the caller's buffer
    TooLarge,
    Io,
}

pub type FileResult<T> = Result<T, FileError>;

/// Flat filesystem holding the updater's config files.
pub trait FileStore {
    /// Reads the whole of `path` into `buf` and returns its length.
    fn read(&mut self, path: &str, buf: &mut [u8]) -> FileResult<usize>;

    /// Creates or truncates `path` and writes `data` to it.
    fn write(&mut self, path: &str, data: &[u8]) -> FileResult<()>;
}

/// Supplicant events, delivered through an [`EventSource`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    LinkUp,
    LinkDown,
    AddressAssigned,
    DisconnectDone,
}

pub trait WifiControl {
    type Error: Debug;

    fn add_network(&mut self, ssid: &str, passphrase: &str) -> Result<(), Self::Error>;

    /// Enables or disables auto-connect. Disabling tears the link down and is
    /// acknowledged with [`WifiEvent::DisconnectDone`].
    fn set_auto_connect(&mut self, enabled: bool) -> Result<(), Self::Error>;
}

/// Something the orchestrator can wait on for the next event.
pub trait EventSource<E> {
    fn next_event(&mut self) -> impl Future<Output = E>;
}

impl<M: RawMutex, E, const N: usize> EventSource<E> for Receiver<'_, M, E, N> {
    fn next_event(&mut self) -> impl Future<Output = E> {
        self.receive()
    }
}

/// Largest attribute value accepted from a BLE write.
pub const ATT_MAX_VALUE: usize = 255;

/// A write request against one of the provisioning characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicWrite {
    pub uuid: u16,
    pub offset: u16,
    pub data: heapless::Vec<u8, ATT_MAX_VALUE>,
}

/// ATT status returned to the client for a write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttStatus {
    Success,
    InvalidOffset,
    AttributeNotFound,
}

/// GATT server exposing the provisioning service.
pub trait ProvisioningLink {
    type Error: Debug;

    /// Registers the service with one write-only characteristic per entry
    /// of `characteristics` and starts advertising.
    fn start(&mut self, service: &[u8; 16], characteristics: &[u16]) -> Result<(), Self::Error>;

    fn next_write(&mut self) -> impl Future<Output = CharacteristicWrite>;

    /// Completes the pending write with `status`.
    fn respond(&mut self, status: AttStatus);
}

pub trait Reset {
    /// Resets the device. Does not return.
    fn reset_device(&mut self) -> !;
}
