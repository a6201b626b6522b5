//! Channel roles, channel masks and speaker mix layouts.
//!
//! Roles map bitwise onto a WAVEFORMATEXTENSIBLE-style mask in a fixed
//! canonical order. A [`SpeakerLayout`] is an 8x8 mix matrix (rows index
//! output channels, columns input channels) with an auto mode that derives
//! the matrix from the channel counts using canonical downmix/upmix rules.

use serde::{Deserialize, Serialize};

use crate::MAX_CHANNELS;

/// Speaker positions, in canonical mask order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ChannelRole {
    FrontLeft = 0x1,
    FrontRight = 0x2,
    FrontCenter = 0x4,
    LowFrequency = 0x8,
    BackLeft = 0x10,
    BackRight = 0x20,
    FrontLeftOfCenter = 0x40,
    FrontRightOfCenter = 0x80,
    BackCenter = 0x100,
    SideLeft = 0x200,
    SideRight = 0x400,
}

use ChannelRole::*;

/// All roles in ascending mask-bit order.
pub const CHANNEL_ROLE_ORDER: [ChannelRole; 11] = [
    FrontLeft,
    FrontRight,
    FrontCenter,
    LowFrequency,
    BackLeft,
    BackRight,
    FrontLeftOfCenter,
    FrontRightOfCenter,
    BackCenter,
    SideLeft,
    SideRight,
];

impl ChannelRole {
    #[inline]
    pub fn mask_bit(self) -> u32 {
        self as u32
    }
}

/// Expand a channel mask into roles, in canonical order.
pub fn roles_from_mask(mask: u32) -> Vec<ChannelRole> {
    CHANNEL_ROLE_ORDER
        .iter()
        .copied()
        .filter(|r| mask & r.mask_bit() != 0)
        .collect()
}

/// Collapse a role list back into a channel mask.
pub fn mask_from_roles(roles: &[ChannelRole]) -> u32 {
    roles.iter().fold(0, |m, r| m | r.mask_bit())
}

/// Speaker order used by Opus channel mapping family 1 for 1..=8 channels.
pub fn opus_channel_order(channels: usize) -> Option<&'static [ChannelRole]> {
    const ORDERS: [&[ChannelRole]; 8] = [
        &[FrontCenter],
        &[FrontLeft, FrontRight],
        &[FrontLeft, FrontCenter, FrontRight],
        &[FrontLeft, FrontRight, BackLeft, BackRight],
        &[FrontLeft, FrontCenter, FrontRight, BackLeft, BackRight],
        &[FrontLeft, FrontCenter, FrontRight, BackLeft, BackRight, LowFrequency],
        &[FrontLeft, FrontCenter, FrontRight, SideLeft, SideRight, BackCenter, LowFrequency],
        &[FrontLeft, FrontCenter, FrontRight, SideLeft, SideRight, BackLeft, BackRight, LowFrequency],
    ];
    ORDERS.get(channels.wrapping_sub(1)).copied()
}

/// Conventional channel mask for a bare channel count.
pub fn default_mask_for_channels(channels: usize) -> u16 {
    match channels {
        1 => 0x0004,          // FC
        2 => 0x0003,          // FL FR
        3 => 0x0007,          // FL FR FC
        4 => 0x0033,          // quad
        5 => 0x0037,          // FL FR FC BL BR
        6 => 0x003F,          // 5.1
        7 => 0x013F,          // 6.1
        8 => 0x063F,          // 7.1
        _ => 0,
    }
}

/// Speaker positions assumed for `channels` interleaved channels.
pub fn roles_for_channel_count(channels: usize) -> Vec<ChannelRole> {
    roles_from_mask(default_mask_for_channels(channels) as u32)
}

/// 8x8 speaker mix matrix with an auto mode.
///
/// When `auto_mode` is set the effective matrix is derived from the input
/// and output channel counts; otherwise the explicit matrix applies. Rows
/// index output channels, columns input channels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpeakerLayout {
    pub auto_mode: bool,
    pub matrix: [[f32; MAX_CHANNELS]; MAX_CHANNELS],
}

impl Default for SpeakerLayout {
    fn default() -> Self {
        Self::auto()
    }
}

impl PartialEq for SpeakerLayout {
    fn eq(&self, other: &Self) -> bool {
        if self.auto_mode && other.auto_mode {
            return true;
        }
        if self.auto_mode != other.auto_mode {
            return false;
        }
        self.matrix == other.matrix
    }
}

impl SpeakerLayout {
    /// Layout that derives its matrix from the channel counts.
    pub fn auto() -> Self {
        Self {
            auto_mode: true,
            matrix: [[0.0; MAX_CHANNELS]; MAX_CHANNELS],
        }
    }

    /// Explicit identity mapping.
    pub fn identity() -> Self {
        let mut matrix = [[0.0; MAX_CHANNELS]; MAX_CHANNELS];
        for (i, row) in matrix.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            auto_mode: false,
            matrix,
        }
    }

    /// Explicit matrix layout.
    pub fn with_matrix(matrix: [[f32; MAX_CHANNELS]; MAX_CHANNELS]) -> Self {
        Self {
            auto_mode: false,
            matrix,
        }
    }

    /// The matrix this layout resolves to for the given channel counts.
    pub fn effective_matrix(
        &self,
        input_channels: usize,
        output_channels: usize,
    ) -> [[f32; MAX_CHANNELS]; MAX_CHANNELS] {
        if self.auto_mode {
            auto_matrix(input_channels, output_channels)
        } else {
            self.matrix
        }
    }

    /// True when the effective matrix is the identity over `channels`.
    pub fn is_identity_for(&self, channels: usize) -> bool {
        let m = self.effective_matrix(channels, channels);
        for (r, row) in m.iter().enumerate().take(channels) {
            for (c, &v) in row.iter().enumerate().take(channels) {
                let want = if r == c { 1.0 } else { 0.0 };
                if (v - want).abs() > 1e-6 {
                    return false;
                }
            }
        }
        true
    }
}

/// Where a source role folds down when the output set lacks it, as ordered
/// alternative groups. The first group whose targets are all present is
/// applied in full. Coefficients follow the usual -3 dB center/surround
/// conventions.
fn fold_targets(role: ChannelRole) -> &'static [&'static [(ChannelRole, f32)]] {
    match role {
        FrontCenter => &[&[(FrontLeft, 0.707), (FrontRight, 0.707)]],
        LowFrequency => &[
            &[(FrontLeft, 0.5), (FrontRight, 0.5)],
            &[(FrontCenter, 0.5)],
        ],
        BackLeft => &[
            &[(SideLeft, 0.707)],
            &[(FrontLeft, 0.707)],
            &[(FrontCenter, 0.5)],
        ],
        BackRight => &[
            &[(SideRight, 0.707)],
            &[(FrontRight, 0.707)],
            &[(FrontCenter, 0.5)],
        ],
        SideLeft => &[
            &[(BackLeft, 0.707)],
            &[(FrontLeft, 0.707)],
            &[(FrontCenter, 0.5)],
        ],
        SideRight => &[
            &[(BackRight, 0.707)],
            &[(FrontRight, 0.707)],
            &[(FrontCenter, 0.5)],
        ],
        BackCenter => &[
            &[(BackLeft, 0.707), (BackRight, 0.707)],
            &[(FrontLeft, 0.5), (FrontRight, 0.5)],
            &[(FrontCenter, 0.5)],
        ],
        FrontLeftOfCenter => &[&[(FrontLeft, 0.707)], &[(FrontCenter, 0.5)]],
        FrontRightOfCenter => &[&[(FrontRight, 0.707)], &[(FrontCenter, 0.5)]],
        FrontLeft => &[&[(FrontCenter, 1.0)]],
        FrontRight => &[&[(FrontCenter, 1.0)]],
    }
}

/// How an output role is synthesized when the input set lacks it (upmix).
fn fill_sources(role: ChannelRole) -> &'static [(ChannelRole, f32)] {
    match role {
        FrontCenter => &[(FrontLeft, 0.5), (FrontRight, 0.5)],
        BackLeft => &[(FrontLeft, 0.707)],
        BackRight => &[(FrontRight, 0.707)],
        SideLeft => &[(FrontLeft, 0.707)],
        SideRight => &[(FrontRight, 0.707)],
        BackCenter => &[(FrontLeft, 0.5), (FrontRight, 0.5)],
        FrontLeftOfCenter => &[(FrontLeft, 0.707)],
        FrontRightOfCenter => &[(FrontRight, 0.707)],
        // No bass synthesis; LFE stays silent on upmix.
        LowFrequency => &[],
        FrontLeft => &[(FrontCenter, 0.707)],
        FrontRight => &[(FrontCenter, 0.707)],
    }
}

/// Canonical downmix/upmix matrix for the given channel counts.
///
/// Every row is normalized so its coefficients sum to at most one.
pub fn auto_matrix(
    input_channels: usize,
    output_channels: usize,
) -> [[f32; MAX_CHANNELS]; MAX_CHANNELS] {
    let mut matrix = [[0.0f32; MAX_CHANNELS]; MAX_CHANNELS];
    if input_channels == 0 || output_channels == 0 {
        return matrix;
    }
    if input_channels == output_channels {
        for (i, row) in matrix.iter_mut().enumerate().take(input_channels) {
            row[i] = 1.0;
        }
        return matrix;
    }

    let in_roles = roles_for_channel_count(input_channels);
    let out_roles = roles_for_channel_count(output_channels);
    let out_index = |role: ChannelRole| out_roles.iter().position(|&r| r == role);
    let in_index = |role: ChannelRole| in_roles.iter().position(|&r| r == role);

    // Route every input channel to its own role, or to the first fold group
    // whose targets all exist in the output set.
    for (col, &role) in in_roles.iter().enumerate() {
        if let Some(row) = out_index(role) {
            matrix[row][col] = 1.0;
            continue;
        }
        for group in fold_targets(role) {
            if group.iter().all(|&(t, _)| out_index(t).is_some()) {
                for &(target, coeff) in *group {
                    if let Some(row) = out_index(target) {
                        matrix[row][col] = coeff;
                    }
                }
                break;
            }
        }
    }

    // Synthesize output channels nothing routed into.
    for (row, &role) in out_roles.iter().enumerate() {
        if matrix[row][..input_channels].iter().all(|&v| v == 0.0) {
            for &(source, coeff) in fill_sources(role) {
                if let Some(col) = in_index(source) {
                    matrix[row][col] = coeff;
                }
            }
        }
    }

    // Keep rows from clipping.
    for row in matrix.iter_mut().take(output_channels) {
        let sum: f32 = row[..input_channels].iter().sum();
        if sum > 1.0 {
            for v in row[..input_channels].iter_mut() {
                *v /= sum;
            }
        }
    }

    matrix
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_role_roundtrip() {
        // Every subset of defined bits survives the roundtrip.
        for mask in 0u32..0x800 {
            let roles = roles_from_mask(mask);
            assert_eq!(mask_from_roles(&roles), mask & 0x7FF);
        }
    }

    #[test]
    fn opus_orders_cover_one_to_eight() {
        for n in 1..=8 {
            let order = opus_channel_order(n).unwrap();
            assert_eq!(order.len(), n);
        }
        assert!(opus_channel_order(0).is_none());
        assert!(opus_channel_order(9).is_none());
    }

    #[test]
    fn auto_same_count_is_identity() {
        for n in 1..=MAX_CHANNELS {
            let m = auto_matrix(n, n);
            for r in 0..n {
                for c in 0..n {
                    assert_eq!(m[r][c], if r == c { 1.0 } else { 0.0 });
                }
            }
        }
    }

    #[test]
    fn stereo_to_mono_halves() {
        let m = auto_matrix(2, 1);
        assert!((m[0][0] - 0.5).abs() < 1e-6);
        assert!((m[0][1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn mono_to_stereo_spreads() {
        let m = auto_matrix(1, 2);
        assert!((m[0][0] - 0.707).abs() < 1e-3);
        assert!((m[1][0] - 0.707).abs() < 1e-3);
    }

    #[test]
    fn five_one_downmix_rows_bounded() {
        let m = auto_matrix(6, 2);
        for row in m.iter().take(2) {
            let sum: f32 = row[..6].iter().sum();
            assert!(sum <= 1.0 + 1e-6, "row sums to {sum}");
        }
        // Center contributes to both fronts.
        assert!(m[0][2] > 0.0);
        assert!(m[1][2] > 0.0);
    }

    #[test]
    fn layout_equality_rules() {
        assert_eq!(SpeakerLayout::auto(), SpeakerLayout::auto());
        assert_ne!(SpeakerLayout::auto(), SpeakerLayout::identity());
        assert_eq!(SpeakerLayout::identity(), SpeakerLayout::identity());

        let mut m = SpeakerLayout::identity();
        m.matrix[0][1] = 0.5;
        assert_ne!(m, SpeakerLayout::identity());
    }

    #[test]
    fn identity_detection() {
        assert!(SpeakerLayout::identity().is_identity_for(2));
        assert!(SpeakerLayout::auto().is_identity_for(2));
        let mut m = SpeakerLayout::identity();
        m.matrix[1][1] = 0.9;
        assert!(!m.is_identity_for(2));
    }
}
