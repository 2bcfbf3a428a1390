//! USB identifiers, command IDs, endpoint addresses and timeouts for the
//! Jensen protocol. Mirrors `examples/original_source/hidock-desktop-app/constants.py`.

use std::time::Duration;

pub const DEFAULT_VENDOR_ID: u16 = 0x10D6; // Actions Semiconductor
pub const DEFAULT_PRODUCT_ID: u16 = 0xB00D; // H1E, the common default

pub const PID_H1: u16 = 0xAF0C;
pub const PID_H1E: u16 = 0xAF0D;
pub const PID_H1E_ALT: u16 = 0xB00D;
pub const PID_P1: u16 = 0xAF0E;

pub const EP_OUT_ADDR: u8 = 0x01;
pub const EP_IN_ADDR: u8 = 0x82;

pub const DEFAULT_INTERFACE: u8 = 0;

// --- Command IDs ---
pub const CMD_GET_DEVICE_INFO: u16 = 1;
pub const CMD_GET_DEVICE_TIME: u16 = 2;
pub const CMD_SET_DEVICE_TIME: u16 = 3;
pub const CMD_GET_FILE_LIST: u16 = 4;
pub const CMD_TRANSFER_FILE: u16 = 5;
pub const CMD_GET_FILE_COUNT: u16 = 6;
pub const CMD_DELETE_FILE: u16 = 7;
pub const CMD_GET_SETTINGS: u16 = 11;
pub const CMD_SET_SETTINGS: u16 = 12;
pub const CMD_GET_FILE_BLOCK: u16 = 13;
pub const CMD_GET_CARD_INFO: u16 = 16;
pub const CMD_FORMAT_CARD: u16 = 17;
pub const CMD_GET_RECORDING_FILE: u16 = 18;

// --- Frame constants ---
pub const SYNC_MARKER: [u8; 2] = [0x12, 0x34];
pub const HEADER_LEN: usize = 12;

// --- Timeouts ---
pub const USB_READ_TIMEOUT: Duration = Duration::from_millis(200);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const FILE_LIST_CHUNK_TIMEOUT: Duration = Duration::from_secs(2);
pub const FILE_LIST_MAX_CONSECUTIVE_TIMEOUTS: u32 = 5;
pub const FILE_BODY_READ_TIMEOUT: Duration = Duration::from_secs(15);
pub const FILE_BODY_OVERALL_TIMEOUT: Duration = Duration::from_secs(180);
pub const CONNECT_RETRY_COUNT: u32 = 3;
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default read chunk size: `max(wMaxPacketSize * 64, 4096)`.
pub fn read_chunk_size(w_max_packet_size: u16) -> usize {
    (w_max_packet_size as usize * 64).max(4096)
}

/// Encode an integer 0..=99 as a single packed-BCD byte.
pub fn to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// Decode a packed-BCD byte back to an integer 0..=99.
pub fn from_bcd(byte: u8) -> u8 {
    (byte >> 4) * 10 + (byte & 0x0F)
}
