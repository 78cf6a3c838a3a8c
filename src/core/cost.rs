//! Resource cost weights for media jobs.
//!
//! Costs are expressed in scheduler units (roughly one unit per worker
//! thread the encoder will use). Probe backends use these tables to turn
//! a source resolution, or the rendition ladder they plan to produce, into
//! a single peak cost for admission.

/// Cost of a rendition that is not in the table.
pub const UNKNOWN_RESOLUTION_COST: u32 = 6;

/// Largest weight any single rendition can carry.
pub const MAX_RESOLUTION_COST: u32 = 64;

/// Cost weight for a rendition label such as `720p`, `4k` or `original`.
/// Matching is case-insensitive; unknown labels cost
/// [`UNKNOWN_RESOLUTION_COST`].
#[must_use]
pub fn cost_for_label(label: &str) -> u32 {
    match label.trim().to_ascii_lowercase().as_str() {
        "144p" => 1,
        "240p" => 2,
        "360p" => 4,
        "480p" => 8,
        "720p" => 16,
        "1080p" => 32,
        "2160p" | "4080p" | "4k" => MAX_RESOLUTION_COST,
        "original" => 12,
        _ => UNKNOWN_RESOLUTION_COST,
    }
}

/// Cost weight for a source of the given pixel height.
#[must_use]
pub const fn cost_for_height(height: u32) -> u32 {
    match height {
        h if h >= 2160 => MAX_RESOLUTION_COST,
        h if h >= 1080 => 32,
        h if h >= 720 => 16,
        h if h >= 480 => 8,
        h if h >= 360 => 4,
        h if h >= 240 => 2,
        _ => 1,
    }
}

/// Peak cost of a rendition ladder: the heaviest single rendition, since
/// renditions are encoded one after another. An empty ladder costs 1.
#[must_use]
pub fn peak_cost<'a, I>(labels: I) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    labels.into_iter().map(cost_for_label).max().unwrap_or(1)
}
