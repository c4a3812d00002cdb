/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    const KIB: f32 = 1024.0;
    const MIB: f32 = KIB * 1024.0;

    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

/// Byte-weighted progress: `initial` plus the share of the remaining range
/// that `downloaded` covers out of `total`. Clamped to 100.
#[must_use]
pub fn weighted_progress(initial: u8, downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return initial;
    }
    let span = u64::from(100 - initial.min(100));
    let gained = downloaded.min(total) * span / total;
    (u64::from(initial) + gained).min(100) as u8
}
