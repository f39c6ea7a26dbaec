//! Utility Module
//!
//! Helpers shared across the stack:
//! - `generate_custom_enum!` for BACnet enumerations with proprietary ranges
//! - Frame formatting for trace logging

mod enum_macros;

/// Render a frame as lowercase hex for trace output, truncated to `limit` bytes
pub fn frame_hex(data: &[u8], limit: usize) -> String {
    if data.len() <= limit {
        hex::encode(data)
    } else {
        format!("{}..(+{} bytes)", hex::encode(&data[..limit]), data.len() - limit)
    }
}
