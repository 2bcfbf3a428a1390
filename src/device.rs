//! Device façade: discovery, connect/disconnect, model and capability
//! detection, and the higher-level operations the command layer is
//! composed into. Redesigned from
//! `examples/original_source/hidock-desktop-app/device_interface.py`'s
//! abstract-base-class + dynamic-dictionary style into a closed enum plus
//! typed structs.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, warn};
use rusb::UsbContext;

use crate::cache::{Cache, CacheEntry};
use crate::commands;
use crate::constants::{self, FILE_BODY_OVERALL_TIMEOUT, FILE_BODY_READ_TIMEOUT};
use crate::error::{HiDockError, Result};
use crate::file_list::Recording;
use crate::session::{ConnectionStats, JensenSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceModel {
    H1,
    H1E,
    P1,
    Unknown,
}

impl DeviceModel {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceModel::H1 => "hidock-h1",
            DeviceModel::H1E => "hidock-h1e",
            DeviceModel::P1 => "hidock-p1",
            DeviceModel::Unknown => "unknown",
        }
    }
}

/// Deterministic product-ID to model map.
pub fn detect_device_model(product_id: u16) -> DeviceModel {
    match product_id {
        constants::PID_H1 => DeviceModel::H1,
        constants::PID_H1E | constants::PID_H1E_ALT => DeviceModel::H1E,
        constants::PID_P1 => DeviceModel::P1,
        _ => DeviceModel::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCapability {
    FileList,
    FileDownload,
    FileDelete,
    TimeSync,
    FormatStorage,
    SettingsManagement,
    HealthMonitoring,
    RealTimeRecording,
    AudioPlayback,
}

/// Fixed capability set per model.
pub fn get_model_capabilities(model: DeviceModel) -> Vec<DeviceCapability> {
    use DeviceCapability::*;
    let mut caps = vec![FileList, FileDownload, FileDelete, TimeSync];
    match model {
        DeviceModel::H1 => caps.push(FormatStorage),
        DeviceModel::H1E => caps.extend([FormatStorage, SettingsManagement, HealthMonitoring]),
        DeviceModel::P1 => caps.extend([
            FormatStorage,
            SettingsManagement,
            HealthMonitoring,
            RealTimeRecording,
            AudioPlayback,
        ]),
        DeviceModel::Unknown => {}
    }
    caps
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub model: DeviceModel,
    pub serial_number: String,
    pub firmware_version: String,
    pub firmware_version_number: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub used_mb: u32,
    pub total_mb: u32,
    pub status_raw: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceHealth {
    pub connected: bool,
    pub stats: ConnectionStats,
}

/// Enumerate every HiDock-vendor USB device currently attached, without
/// opening or claiming any of them.
pub fn discover() -> Result<Vec<DeviceInfo>> {
    let context = rusb::Context::new()?;
    let mut found = Vec::new();
    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(err) => {
                warn!("skipping device, could not read descriptor: {err}");
                continue;
            }
        };
        if descriptor.vendor_id() != constants::DEFAULT_VENDOR_ID {
            continue;
        }
        let model = detect_device_model(descriptor.product_id());
        found.push(DeviceInfo {
            id: format!("{:04x}:{:04x}", descriptor.vendor_id(), descriptor.product_id()),
            name: model.name().to_string(),
            model,
            serial_number: String::new(),
            firmware_version: String::new(),
            firmware_version_number: 0,
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            connected: false,
        });
    }
    Ok(found)
}

/// The subset of the façade the operations manager (`src/operations.rs`)
/// drives. Exists as a trait, not a concrete dependency on `Device`, so the
/// worker loop can be exercised against an in-process fake the same way
/// `session.rs` tests against a fake transport.
pub trait DeviceOps: Send {
    fn download_recording(
        &mut self,
        filename: &str,
        dest_dir: &Path,
        expected_size: Option<u32>,
        on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
    ) -> Result<PathBuf>;

    fn delete_recording(&mut self, filename: &str) -> Result<commands::DeleteOutcome>;
}

/// Owns the session, the detected model, and the metadata cache for one
/// connected device. This is the object user code drives directly or
/// through the operations manager.
pub struct Device {
    session: JensenSession,
    info: Option<DeviceInfo>,
    cache: Cache,
}

impl Device {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            session: JensenSession::new(),
            info: None,
            cache: Cache::new(cache_dir),
        }
    }

    /// Connect to `vid:pid`, or the first discovered device if `None`.
    pub fn connect(&mut self, vid_pid: Option<(u16, u16)>) -> Result<&DeviceInfo> {
        let (vid, pid) = match vid_pid {
            Some(pair) => pair,
            None => {
                let devices = discover()?;
                let first = devices
                    .into_iter()
                    .next()
                    .ok_or(HiDockError::NotFound {
                        vendor_id: constants::DEFAULT_VENDOR_ID,
                        product_id: 0,
                    })?;
                (first.vendor_id, first.product_id)
            }
        };

        self.session.connect(vid, pid, constants::DEFAULT_INTERFACE)?;
        let raw_info = commands::device_info(&mut self.session)?;
        let model = detect_device_model(pid);
        info!("connected to {} ({:#06x}:{:#06x})", model.name(), vid, pid);

        self.info = Some(DeviceInfo {
            id: format!("{vid:04x}:{pid:04x}"),
            name: model.name().to_string(),
            model,
            serial_number: raw_info.serial_number,
            firmware_version: raw_info.version_code,
            firmware_version_number: raw_info.version_number,
            vendor_id: vid,
            product_id: pid,
            connected: true,
        });
        Ok(self.info.as_ref().expect("just populated"))
    }

    pub fn disconnect(&mut self) {
        self.session.disconnect();
        self.info = None;
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn get_device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn get_capabilities(&self) -> Vec<DeviceCapability> {
        match &self.info {
            Some(info) => get_model_capabilities(info.model),
            None => Vec::new(),
        }
    }

    fn require_capability(&self, capability: DeviceCapability) -> Result<()> {
        if self.get_capabilities().contains(&capability) {
            Ok(())
        } else {
            Err(HiDockError::NotSupported)
        }
    }

    pub fn get_storage_info(&mut self) -> Result<StorageInfo> {
        let card = commands::card_info(&mut self.session)?;
        Ok(StorageInfo {
            used_mb: card.used_mb,
            total_mb: card.total_mb,
            status_raw: card.status_raw,
        })
    }

    /// Stream the file list and reconcile it against the metadata cache,
    /// returning the reconciled entries.
    pub fn get_recordings(&mut self) -> Result<Vec<CacheEntry>> {
        self.require_capability(DeviceCapability::FileList)?;

        let mut aggregator = crate::file_list::FileListAggregator::new();
        self.session.stream(
            constants::CMD_GET_FILE_LIST,
            &[],
            constants::FILE_LIST_CHUNK_TIMEOUT * constants::FILE_LIST_MAX_CONSECUTIVE_TIMEOUTS,
            |frame| !aggregator.feed(&frame.body),
        )?;

        let recordings = aggregator.into_recordings();
        self.cache.reconcile(&recordings);
        Ok(self.cache.get_all())
    }

    pub fn get_current_recording_filename(&mut self) -> Result<Option<String>> {
        commands::current_recording(&mut self.session)
    }

    /// Download `filename` into `dest_dir`, writing to a `.tmp` sibling and
    /// renaming atomically on success. `on_progress(bytes_received, total)`
    /// is invoked after each chunk; returning `false` cancels the transfer
    /// and removes the partial file.
    pub fn download_recording(
        &mut self,
        filename: &str,
        dest_dir: &Path,
        expected_size: Option<u32>,
        mut on_progress: impl FnMut(u64, Option<u64>) -> bool,
    ) -> Result<PathBuf> {
        self.require_capability(DeviceCapability::FileDownload)?;

        let sanitized = sanitize_filename(filename);
        let final_path = dest_dir.join(&sanitized);
        let tmp_path = dest_dir.join(format!("{sanitized}.tmp"));

        let mut file = std::fs::File::create(&tmp_path)?;
        let mut received: u64 = 0;
        let total = expected_size.map(u64::from);
        let started = Instant::now();
        let mut cancelled = false;

        let stream_result = self.session.stream(
            constants::CMD_TRANSFER_FILE,
            filename.as_bytes(),
            FILE_BODY_READ_TIMEOUT,
            |frame| {
                if frame.body.is_empty() {
                    return false;
                }
                if file.write_all(&frame.body).is_err() {
                    cancelled = true;
                    return false;
                }
                received += frame.body.len() as u64;
                if !on_progress(received, total) {
                    cancelled = true;
                    return false;
                }
                if started.elapsed() > FILE_BODY_OVERALL_TIMEOUT {
                    cancelled = true;
                    return false;
                }
                if let Some(total) = total {
                    if received >= total {
                        return false;
                    }
                }
                true
            },
        );

        drop(file);

        if stream_result.is_err() || cancelled {
            let _ = std::fs::remove_file(&tmp_path);
            return match stream_result {
                Err(err) => Err(err),
                Ok(()) => Err(HiDockError::OperationCancelled),
            };
        }

        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }

    pub fn delete_recording(&mut self, filename: &str) -> Result<commands::DeleteOutcome> {
        self.require_capability(DeviceCapability::FileDelete)?;
        let outcome = commands::delete_file(&mut self.session, filename)?;
        if matches!(outcome, commands::DeleteOutcome::Deleted) {
            self.cache.remove(filename);
        }
        Ok(outcome)
    }

    pub fn format_storage(&mut self) -> Result<()> {
        self.require_capability(DeviceCapability::FormatStorage)?;
        commands::format_card(&mut self.session)?;
        self.cache.clear();
        Ok(())
    }

    pub fn sync_time(&mut self, time: commands::DeviceTime) -> Result<()> {
        self.require_capability(DeviceCapability::TimeSync)?;
        commands::device_time_set(&mut self.session, time)
    }

    pub fn get_settings(&mut self) -> Result<commands::DeviceSettings> {
        self.require_capability(DeviceCapability::SettingsManagement)?;
        commands::settings_get(&mut self.session)
    }

    pub fn set_settings(&mut self, settings: commands::DeviceSettings) -> Result<()> {
        self.require_capability(DeviceCapability::SettingsManagement)?;
        commands::settings_set(&mut self.session, settings)
    }

    pub fn get_connection_stats(&self) -> ConnectionStats {
        self.session.get_connection_stats()
    }

    pub fn get_device_health(&self) -> DeviceHealth {
        DeviceHealth {
            connected: self.session.is_connected(),
            stats: self.session.get_connection_stats(),
        }
    }

    /// A lightweight round-trip used by callers that just want to know
    /// "is the device still there" without pulling a full `DeviceInfo`.
    pub fn test_connection(&mut self) -> bool {
        commands::device_info(&mut self.session).is_ok()
    }
}

impl DeviceOps for Device {
    fn download_recording(
        &mut self,
        filename: &str,
        dest_dir: &Path,
        expected_size: Option<u32>,
        on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
    ) -> Result<PathBuf> {
        Device::download_recording(self, filename, dest_dir, expected_size, on_progress)
    }

    fn delete_recording(&mut self, filename: &str) -> Result<commands::DeleteOutcome> {
        Device::delete_recording(self, filename)
    }
}

/// Replace characters the filesystem (or the device) can't carry in a
/// download's on-disk name.
fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            ':' => '-',
            '\\' | '/' | ' ' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{build, SequenceCounter};
    use crate::transport::Transport;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct FakeTransport {
        chunks: Arc<Mutex<VecDeque<u8>>>,
    }

    impl Transport for FakeTransport {
        fn write(&self, bytes: &[u8], _timeout: Duration) -> Result<usize> {
            Ok(bytes.len())
        }

        fn read(&self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>> {
            let mut queue = self.chunks.lock().unwrap();
            if queue.is_empty() {
                return Err(HiDockError::UsbTimeout);
            }
            let n = max_len.min(queue.len());
            Ok(queue.drain(..n).collect())
        }

        fn clear_halt(&self, _endpoint: u8) -> Result<()> {
            Ok(())
        }

        fn in_max_packet_size(&self) -> u16 {
            64
        }

        fn release_and_close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    /// Builds a session whose transport delivers two `CMD_TRANSFER_FILE`
    /// frames of `chunk` bytes each, enough for a cancel-on-second-chunk test.
    fn session_streaming_two_chunks(chunk: &[u8]) -> JensenSession {
        let mut counter = SequenceCounter::new();
        let mut wire = Vec::new();
        wire.extend(build(&mut counter, constants::CMD_TRANSFER_FILE, chunk));
        wire.extend(build(&mut counter, constants::CMD_TRANSFER_FILE, chunk));

        let mut session = JensenSession::new();
        session.adopt_transport(Box::new(FakeTransport {
            chunks: Arc::new(Mutex::new(wire.into_iter().collect())),
        }));
        session
    }

    #[test]
    fn cancelling_download_mid_stream_removes_tmp_file_and_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = Device::new(dir.path());
        device.session = session_streaming_two_chunks(b"abcd");
        device.info = Some(DeviceInfo {
            id: "10d6:af0d".into(),
            name: DeviceModel::H1E.name().into(),
            model: DeviceModel::H1E,
            serial_number: String::new(),
            firmware_version: String::new(),
            firmware_version_number: 0,
            vendor_id: constants::PID_H1E,
            product_id: constants::PID_H1E,
            connected: true,
        });

        let mut chunks_seen = 0;
        let err = device
            .download_recording("rec.wav", dir.path(), None, |_received, _total| {
                chunks_seen += 1;
                chunks_seen < 2
            })
            .unwrap_err();

        assert!(matches!(err, HiDockError::OperationCancelled));
        assert_eq!(chunks_seen, 2);
        assert!(!dir.path().join("rec.wav.tmp").exists());
        assert!(!dir.path().join("rec.wav").exists());
    }

    #[test]
    fn model_detection_maps_known_product_ids() {
        assert_eq!(detect_device_model(constants::PID_H1), DeviceModel::H1);
        assert_eq!(detect_device_model(constants::PID_H1E), DeviceModel::H1E);
        assert_eq!(detect_device_model(constants::PID_H1E_ALT), DeviceModel::H1E);
        assert_eq!(detect_device_model(constants::PID_P1), DeviceModel::P1);
        assert_eq!(detect_device_model(0x9999), DeviceModel::Unknown);
    }

    #[test]
    fn capability_sets_are_strictly_additive_by_model() {
        let base = get_model_capabilities(DeviceModel::H1);
        let h1e = get_model_capabilities(DeviceModel::H1E);
        let p1 = get_model_capabilities(DeviceModel::P1);
        for cap in &base {
            assert!(h1e.contains(cap));
            assert!(p1.contains(cap));
        }
        assert!(p1.contains(&DeviceCapability::RealTimeRecording));
        assert!(!h1e.contains(&DeviceCapability::RealTimeRecording));
    }

    #[test]
    fn sanitize_filename_replaces_reserved_characters() {
        assert_eq!(sanitize_filename("a:b c/d\\e"), "a-b_c_d_e");
    }
}
