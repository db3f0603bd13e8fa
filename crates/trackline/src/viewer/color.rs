//! Stable per-device colours.

/// Derive a `#rrggbb` colour from a device id.
///
/// The same id always yields the same colour. Channels are kept in
/// `0x30..=0xcf` so markers stay visible on light and dark tiles.
#[must_use]
pub fn device_color(device_id: &str) -> String {
    let hash = blake3::hash(device_id.as_bytes());
    let bytes = hash.as_bytes();
    let channel = |b: u8| 0x30 + b % 0xa0;
    format!(
        "#{:02x}{:02x}{:02x}",
        channel(bytes[0]),
        channel(bytes[1]),
        channel(bytes[2])
    )
}
