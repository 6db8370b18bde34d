//! Wire protocol spoken over each viewer WebSocket.
//!
//! Every frame is a single ASCII tag byte followed by the body. Output
//! bodies are standard base64 of raw PTY bytes; resize, window-title and
//! buffer-size bodies are UTF-8 JSON. Frames travel as WebSocket text
//! messages in both directions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

// client -> server
pub const MSG_INPUT: u8 = b'0';
pub const MSG_PING: u8 = b'2';
pub const MSG_RESIZE: u8 = b'4';

// server -> client
pub const MSG_OUTPUT: u8 = b'1';
pub const MSG_PONG: u8 = b'3';
pub const MSG_SET_WINDOW_TITLE: u8 = b'5';
pub const MSG_SET_BUFFER_SIZE: u8 = b'6';

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeMessage {
    pub cols: u16,
    pub rows: u16,
}

/// Largest raw PTY read that still fits a frame buffer of `buffer_size`
/// bytes once base64-expanded and tagged.
pub fn max_raw_frame_len(buffer_size: usize) -> usize {
    (buffer_size - 1) / 4 * 3
}

/// Frame raw PTY bytes as an Output message.
pub fn output_frame(raw: &[u8]) -> String {
    let mut frame = String::with_capacity(1 + (raw.len() + 2) / 3 * 4);
    frame.push(MSG_OUTPUT as char);
    BASE64.encode_string(raw, &mut frame);
    frame
}

/// Frame raw keystrokes as an Input message. Used by clients and tests.
pub fn input_frame(raw: &[u8]) -> String {
    let mut frame = String::with_capacity(1 + (raw.len() + 2) / 3 * 4);
    frame.push(MSG_INPUT as char);
    BASE64.encode_string(raw, &mut frame);
    frame
}

/// Decode an Input body. The original protocol tolerates clients that skip
/// base64 and send raw bytes, so decode failure falls back to the payload.
pub fn decode_input(payload: &[u8]) -> Vec<u8> {
    BASE64.decode(payload).unwrap_or_else(|_| payload.to_vec())
}

pub fn window_title_frame(vars: &serde_json::Value) -> String {
    let mut frame = String::from(MSG_SET_WINDOW_TITLE as char);
    frame.push_str(&vars.to_string());
    frame
}

pub fn buffer_size_frame(buffer_size: usize) -> String {
    format!("{}{}", MSG_SET_BUFFER_SIZE as char, buffer_size)
}

pub fn pong_frame() -> String {
    String::from(MSG_PONG as char)
}
