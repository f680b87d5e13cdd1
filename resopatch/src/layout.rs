//! Viewport geometry derived from a requested screen size.
//!
//! The renderer sizes the city view in whole tiles, expressed as two signed-byte
//! multipliers. Everything else drawn around the view (sidebar, menubar, the filler strips
//! covering what the tiles leave uncovered) is positioned from the pixel size the clamped
//! multipliers actually produce, never from the request itself.

use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const MIN_WIDTH: u16 = 1024;
pub const MIN_HEIGHT: u16 = 768;
pub const MAX_WIDTH: u16 = 7680;
pub const MAX_HEIGHT: u16 = 4320;
/// Both dimensions must be a multiple of this
pub const ALIGNMENT: u16 = 4;
/// Largest multiplier the renderer accepts (signed byte)
pub const MAX_MULTIPLIER: u8 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Resolution {
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RangeViolation {
    #[strum(serialize = "width below minimum")]
    WidthTooSmall,
    #[strum(serialize = "width above maximum")]
    WidthTooLarge,
    #[strum(serialize = "height below minimum")]
    HeightTooSmall,
    #[strum(serialize = "height above maximum")]
    HeightTooLarge,
    #[strum(serialize = "width not a multiple of 4")]
    WidthUnaligned,
    #[strum(serialize = "height not a multiple of 4")]
    HeightUnaligned,
}

impl Resolution {
    pub const fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }

    /// Check the request against the global limits. Nothing downstream re-checks.
    pub fn validate(self) -> Result<Self, RangeViolation> {
        use RangeViolation::*;
        let Self { width, height } = self;
        if width < MIN_WIDTH {
            Err(WidthTooSmall)
        } else if width > MAX_WIDTH {
            Err(WidthTooLarge)
        } else if height < MIN_HEIGHT {
            Err(HeightTooSmall)
        } else if height > MAX_HEIGHT {
            Err(HeightTooLarge)
        } else if width % ALIGNMENT != 0 {
            Err(WidthUnaligned)
        } else if height % ALIGNMENT != 0 {
            Err(HeightUnaligned)
        } else {
            Ok(self)
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, found {s:?}"))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid dimension {v:?}: {e}"))
        };
        Ok(Self::new(parse(w)?, parse(h)?))
    }
}

/// Per-game constants of the tile renderer and the chrome drawn around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ViewportMetrics {
    pub menubar_height: u16,
    pub sidebar_width: u16,
    pub tile_width: u16,
    pub tile_height: u16,
    /// Pixels the renderer trims from (and the formula adds back to) the width
    pub width_slack: u16,
    /// Extra row added to the height multiplier
    pub height_bias: u16,
    /// Size of the centred main menu panel
    pub menu_width: u16,
    pub menu_height: u16,
}

/// Value a patched field or code slot is computed from
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LayoutValue {
    ScreenWidth,
    ScreenHeight,
    WidthMultiplier,
    HeightMultiplier,
    ViewportWidth,
    ViewportHeight,
    SidebarLeft,
    FillerWidth,
    FillerHeight,
    MenubarHeight,
    MenuLeft,
    MenuTop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct LayoutParameters {
    pub screen_width: u16,
    pub screen_height: u16,
    /// Always `0..=127`
    pub width_multiplier: u8,
    /// Always `0..=127`
    pub height_multiplier: u8,
    /// Pixel width the clamped width multiplier draws
    pub viewport_width: u16,
    /// Pixel height the clamped height multiplier draws, menubar included
    pub viewport_height: u16,
    pub sidebar_left: u16,
    pub filler_width: u16,
    pub filler_height: u16,
    pub menubar_height: u16,
    pub menu_left: u16,
    pub menu_top: u16,
}

impl LayoutParameters {
    pub fn value(&self, value: LayoutValue) -> u32 {
        use LayoutValue::*;
        match value {
            ScreenWidth => self.screen_width as u32,
            ScreenHeight => self.screen_height as u32,
            WidthMultiplier => self.width_multiplier as u32,
            HeightMultiplier => self.height_multiplier as u32,
            ViewportWidth => self.viewport_width as u32,
            ViewportHeight => self.viewport_height as u32,
            SidebarLeft => self.sidebar_left as u32,
            FillerWidth => self.filler_width as u32,
            FillerHeight => self.filler_height as u32,
            MenubarHeight => self.menubar_height as u32,
            MenuLeft => self.menu_left as u32,
            MenuTop => self.menu_top as u32,
        }
    }
}

fn px(value: u32) -> u16 {
    value.min(u16::MAX as u32) as u16
}

/// Derive the layout for `resolution`. Expects an already validated request.
pub fn compute(resolution: Resolution, metrics: &ViewportMetrics) -> LayoutParameters {
    let w = resolution.width as u32;
    let h = resolution.height as u32;
    let m = metrics;

    let height_multiplier = (h.saturating_sub(m.menubar_height as u32) / m.tile_height as u32
        + m.height_bias as u32)
        .min(MAX_MULTIPLIER as u32);
    let width_multiplier = ((w + m.width_slack as u32).saturating_sub(m.sidebar_width as u32)
        / m.tile_width as u32)
        .min(MAX_MULTIPLIER as u32);

    let viewport_width = (width_multiplier * m.tile_width as u32).saturating_sub(m.width_slack as u32);
    let viewport_height = height_multiplier.saturating_sub(m.height_bias as u32)
        * m.tile_height as u32
        + m.menubar_height as u32;

    let sidebar_left = w.saturating_sub(m.sidebar_width as u32);

    let layout = LayoutParameters {
        screen_width: resolution.width,
        screen_height: resolution.height,
        width_multiplier: width_multiplier as u8,
        height_multiplier: height_multiplier as u8,
        viewport_width: px(viewport_width),
        viewport_height: px(viewport_height),
        sidebar_left: px(sidebar_left),
        filler_width: px(sidebar_left.saturating_sub(viewport_width)),
        filler_height: px(h.saturating_sub(viewport_height)),
        menubar_height: m.menubar_height,
        menu_left: px(w.saturating_sub(m.menu_width as u32) / 2),
        menu_top: px(h.saturating_sub(m.menu_height as u32) / 2),
    };
    tracing::debug!(?layout, %resolution, "computed layout");
    layout
}
