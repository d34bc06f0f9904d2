//! Quality ladder layout on disk

use roomcast_core::QualityTier;
use std::path::{Path, PathBuf};

/// Playlist name inside every tier directory
pub(crate) const TIER_PLAYLIST: &str = "index.m3u8";

/// Segment file pattern inside every tier directory
pub(crate) const SEGMENT_PATTERN: &str = "segment-%03d.ts";

/// Tier directory as a muxer pattern, `%v` being the variant index
pub(crate) const TIER_DIR_PATTERN: &str = "v%v";

/// Directory of tier `index`, relative to the room output directory
pub(crate) fn tier_dir(index: usize) -> String {
    format!("v{index}")
}

/// Absolute tier directories of a room
pub(crate) fn tier_dirs(output_dir: &Path, tiers: usize) -> Vec<PathBuf> {
    (0..tiers).map(|i| output_dir.join(tier_dir(i))).collect()
}

/// Multi-variant manifest listing one playlist per tier
#[must_use]
pub fn master_manifest(tiers: &[QualityTier]) -> String {
    let mut manifest = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for (index, tier) in tiers.iter().enumerate() {
        manifest.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={},NAME=\"{}\"\n{}/{TIER_PLAYLIST}\n",
            tier.bandwidth_bps(),
            tier.resolution(),
            tier.name,
            tier_dir(index),
        ));
    }
    manifest
}
