//! Command layer: thin, total-function typed wrappers around each Jensen
//! command id. Each parses the response body or fails with `ProtocolError`
//! on an unrecognized shape; none of these retry.

use std::time::Duration;

use crate::constants::{
    self, from_bcd, to_bcd, CMD_DELETE_FILE, CMD_FORMAT_CARD, CMD_GET_CARD_INFO,
    CMD_GET_DEVICE_INFO, CMD_GET_DEVICE_TIME, CMD_GET_FILE_BLOCK, CMD_GET_FILE_COUNT,
    CMD_GET_RECORDING_FILE, CMD_GET_SETTINGS, CMD_SET_DEVICE_TIME, CMD_SET_SETTINGS,
    COMMAND_TIMEOUT,
};
use crate::error::{HiDockError, Result};
use crate::session::JensenSession;

fn protocol_error(detail: impl Into<String>) -> HiDockError {
    HiDockError::ProtocolError {
        detail: detail.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub version_code: String,
    pub version_number: u32,
    pub serial_number: String,
}

pub fn device_info(session: &mut JensenSession) -> Result<DeviceInfo> {
    let frame = session.send_and_receive(CMD_GET_DEVICE_INFO, &[], COMMAND_TIMEOUT)?;
    if frame.body.len() < 4 {
        return Err(protocol_error("device_info response shorter than 4 bytes"));
    }
    let version_number = u32::from_be_bytes([
        frame.body[0],
        frame.body[1],
        frame.body[2],
        frame.body[3],
    ]);
    let version_code = format!("{}.{}.{}", frame.body[1], frame.body[2], frame.body[3]);
    let serial_number = String::from_utf8_lossy(
        frame.body[4..].split(|&b| b == 0).next().unwrap_or(&[]),
    )
    .trim()
    .to_string();
    Ok(DeviceInfo {
        version_code,
        version_number,
        serial_number,
    })
}

/// `None` means the device reported an all-zero ("unknown") timestamp.
pub fn device_time_get(session: &mut JensenSession) -> Result<Option<DeviceTime>> {
    let frame = session.send_and_receive(CMD_GET_DEVICE_TIME, &[], COMMAND_TIMEOUT)?;
    if frame.body.len() < 7 {
        return Err(protocol_error("device_time_get response shorter than 7 bytes"));
    }
    let fields: Vec<u8> = frame.body[0..7].iter().map(|&b| from_bcd(b)).collect();
    if fields.iter().all(|&f| f == 0) {
        return Ok(None);
    }
    Ok(Some(DeviceTime {
        year: fields[0] as u32 * 100 + fields[1] as u32,
        month: fields[2],
        day: fields[3],
        hour: fields[4],
        minute: fields[5],
        second: fields[6],
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTime {
    pub year: u32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

pub fn device_time_set(session: &mut JensenSession, time: DeviceTime) -> Result<()> {
    let mut body = Vec::with_capacity(7);
    body.push(to_bcd((time.year / 100) as u8));
    body.push(to_bcd((time.year % 100) as u8));
    body.push(to_bcd(time.month));
    body.push(to_bcd(time.day));
    body.push(to_bcd(time.hour));
    body.push(to_bcd(time.minute));
    body.push(to_bcd(time.second));

    let frame = session.send_and_receive(CMD_SET_DEVICE_TIME, &body, COMMAND_TIMEOUT)?;
    match frame.body.first() {
        Some(0) => Ok(()),
        Some(code) => Err(protocol_error(format!(
            "device_time_set failed with status {code}"
        ))),
        None => Err(protocol_error("device_time_set response was empty")),
    }
}

pub fn file_count(session: &mut JensenSession) -> Result<u32> {
    let frame = session.send_and_receive(CMD_GET_FILE_COUNT, &[], COMMAND_TIMEOUT)?;
    if frame.body.is_empty() {
        return Ok(0);
    }
    if frame.body.len() < 4 {
        return Err(protocol_error("file_count response shorter than 4 bytes"));
    }
    Ok(u32::from_be_bytes([
        frame.body[0],
        frame.body[1],
        frame.body[2],
        frame.body[3],
    ]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

pub fn delete_file(session: &mut JensenSession, filename: &str) -> Result<DeleteOutcome> {
    let frame = session.send_and_receive(CMD_DELETE_FILE, filename.as_bytes(), COMMAND_TIMEOUT)?;
    match frame.body.first() {
        Some(0) => Ok(DeleteOutcome::Deleted),
        Some(1) => Ok(DeleteOutcome::NotFound),
        Some(code) => Err(protocol_error(format!("delete_file failed with status {code}"))),
        None => Err(protocol_error("delete_file response was empty")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardInfo {
    pub used_mb: u32,
    pub total_mb: u32,
    pub status_raw: u32,
}

pub fn card_info(session: &mut JensenSession) -> Result<CardInfo> {
    let frame = session.send_and_receive(CMD_GET_CARD_INFO, &[], COMMAND_TIMEOUT)?;
    if frame.body.len() < 12 {
        return Err(protocol_error("card_info response shorter than 12 bytes"));
    }
    let read_u32 = |offset: usize| {
        u32::from_be_bytes([
            frame.body[offset],
            frame.body[offset + 1],
            frame.body[offset + 2],
            frame.body[offset + 3],
        ])
    };
    Ok(CardInfo {
        used_mb: read_u32(0),
        total_mb: read_u32(4),
        status_raw: read_u32(8),
    })
}

pub fn format_card(session: &mut JensenSession) -> Result<()> {
    let frame = session.send_and_receive(CMD_FORMAT_CARD, &[1, 2, 3, 4], COMMAND_TIMEOUT)?;
    match frame.body.first() {
        Some(0) => Ok(()),
        Some(code) => Err(protocol_error(format!("format_card failed with status {code}"))),
        None => Err(protocol_error("format_card response was empty")),
    }
}

/// `None` if no recording is currently in progress.
pub fn current_recording(session: &mut JensenSession) -> Result<Option<String>> {
    let frame = session.send_and_receive(CMD_GET_RECORDING_FILE, &[], COMMAND_TIMEOUT)?;
    if frame.body.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        String::from_utf8_lossy(&frame.body).trim_end_matches('\0').to_string(),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    pub auto_record: bool,
    pub auto_play: bool,
    pub bluetooth_tone: bool,
    pub notification_sound: bool,
}

pub fn settings_get(session: &mut JensenSession) -> Result<DeviceSettings> {
    let frame = session.send_and_receive(CMD_GET_SETTINGS, &[], COMMAND_TIMEOUT)?;
    if frame.body.len() < 4 {
        return Err(protocol_error("settings_get response shorter than 4 bytes"));
    }
    Ok(DeviceSettings {
        auto_record: frame.body[0] != 0,
        auto_play: frame.body[1] != 0,
        bluetooth_tone: frame.body[2] != 0,
        notification_sound: frame.body[3] != 0,
    })
}

pub fn settings_set(session: &mut JensenSession, settings: DeviceSettings) -> Result<()> {
    let body = [
        settings.auto_record as u8,
        settings.auto_play as u8,
        settings.bluetooth_tone as u8,
        settings.notification_sound as u8,
    ];
    let frame = session.send_and_receive(CMD_SET_SETTINGS, &body, COMMAND_TIMEOUT)?;
    match frame.body.first() {
        Some(0) => Ok(()),
        Some(code) => Err(protocol_error(format!("settings_set failed with status {code}"))),
        None => Err(protocol_error("settings_set response was empty")),
    }
}

/// Supplemental: re-fetch a bounded byte range of a file without restarting
/// a full `file_transfer` stream. No façade-level caller wraps this; it is
/// exposed for advanced callers resuming a partial download.
pub fn file_block(
    session: &mut JensenSession,
    filename: &str,
    offset: u32,
    length: u32,
) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(filename.len() + 8);
    body.extend_from_slice(filename.as_bytes());
    body.extend_from_slice(&offset.to_be_bytes());
    body.extend_from_slice(&length.to_be_bytes());

    let frame = session.send_and_receive(
        CMD_GET_FILE_BLOCK,
        &body,
        constants::FILE_BODY_READ_TIMEOUT,
    )?;
    Ok(frame.body)
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
        responses: Arc<Mutex<VecDeque<u8>>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl FakeTransport {
        fn with_response(command_id: u16, body: &[u8]) -> Self {
            let mut counter = SequenceCounter::new();
            let wire = build(&mut counter, command_id, body);
            FakeTransport {
                responses: Arc::new(Mutex::new(wire.into_iter().collect())),
                written: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Transport for FakeTransport {
        fn write(&self, bytes: &[u8], _timeout: Duration) -> Result<usize> {
            self.written.lock().unwrap().extend_from_slice(bytes);
            Ok(bytes.len())
        }

        fn read(&self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>> {
            let mut queue = self.responses.lock().unwrap();
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

    fn session_with(command_id: u16, body: &[u8]) -> JensenSession {
        let mut session = JensenSession::new();
        session.adopt_transport(Box::new(FakeTransport::with_response(command_id, body)));
        session
    }

    #[test]
    fn device_time_all_zero_is_unknown() {
        // BCD-zero fields decode to all-zero integers regardless of the
        // encode/decode tables, so the "unknown" sentinel check is purely
        // arithmetic and needs no session.
        let fields = [0u8; 7];
        assert!(fields.iter().all(|&f| from_bcd(f) == 0));
    }

    #[test]
    fn bcd_round_trips_for_typical_values() {
        for value in [0, 1, 9, 10, 23, 59, 99] {
            assert_eq!(from_bcd(to_bcd(value)), value);
        }
    }

    #[test]
    fn device_info_parses_version_and_serial() {
        let mut body = vec![0u8, 1, 2, 3];
        body.extend_from_slice(b"ABC123");
        body.extend_from_slice(&[0u8; 7]);
        let mut session = session_with(CMD_GET_DEVICE_INFO, &body);

        let info = device_info(&mut session).unwrap();
        assert_eq!(info.version_code, "1.2.3");
        assert_eq!(info.version_number, 0x00010203);
        assert_eq!(info.serial_number, "ABC123");
    }

    #[test]
    fn delete_file_not_found_maps_to_not_found_outcome() {
        let mut session = session_with(CMD_DELETE_FILE, &[1]);
        assert_eq!(delete_file(&mut session, "ghost").unwrap(), DeleteOutcome::NotFound);
    }

    #[test]
    fn device_time_set_encodes_bcd_fields_in_order() {
        let transport = FakeTransport::with_response(CMD_SET_DEVICE_TIME, &[0]);
        let written = Arc::clone(&transport.written);
        let mut session = JensenSession::new();
        session.adopt_transport(Box::new(transport));

        device_time_set(
            &mut session,
            DeviceTime {
                year: 2025,
                month: 7,
                day: 1,
                hour: 10,
                minute: 20,
                second: 30,
            },
        )
        .unwrap();

        let sent = written.lock().unwrap();
        let body = &sent[12..];
        assert_eq!(body, &[0x20, 0x25, 0x07, 0x01, 0x10, 0x20, 0x30]);
    }
}
