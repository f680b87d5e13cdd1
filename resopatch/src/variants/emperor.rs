use super::{fragments, FieldPatch, Game, TextTarget, Variant, VariantProfile};
use crate::{
    inject::{CaveInjection, CodeFragment, Slot},
    layout::{LayoutValue::*, ViewportMetrics},
    patcher::{Fix, FixKind, RawPatch},
};
use resopatch_image::Scalar;

pub const METRICS: ViewportMetrics = ViewportMetrics {
    menubar_height: 24,
    sidebar_width: 226,
    tile_width: 80,
    tile_height: 40,
    width_slack: 2,
    height_bias: 1,
    menu_width: 1024,
    menu_height: 768,
};

const TEXT: TextTarget = TextTarget {
    file_name: "EmperorText.eng",
    group: 58,
    index: 6,
};

const RETAIL_FIELDS: &[FieldPatch] = &[
    FieldPatch::u32("display_mode_width", 0x00021B44, ScreenWidth),
    FieldPatch::u32("display_mode_height", 0x00021B4B, ScreenHeight),
    FieldPatch::u32("window_rect_width", 0x00022A0E, ScreenWidth),
    FieldPatch::u32("window_rect_height", 0x00022A15, ScreenHeight),
    FieldPatch::u8("viewport_width_multiplier", 0x0006A3C2, WidthMultiplier),
    FieldPatch::u8("viewport_height_multiplier", 0x0006A3C4, HeightMultiplier),
    FieldPatch::u32("viewport_pixel_width", 0x0006A61D, ViewportWidth),
    FieldPatch::u32("viewport_pixel_height", 0x0006A627, ViewportHeight),
    FieldPatch::u32("sidebar_left", 0x00070E93, SidebarLeft),
    FieldPatch::u32("sidebar_minimap_left", 0x00070F2A, SidebarLeft).adjust(10),
    FieldPatch::u32("menubar_width", 0x0007B6C1, ScreenWidth),
    FieldPatch::u32("main_menu_left", 0x0009E512, MenuLeft),
    FieldPatch::u32("main_menu_top", 0x0009E519, MenuTop),
    FieldPatch::u32("scroll_edge_right", 0x000B0C74, ScreenWidth).adjust(-1),
    FieldPatch::u32("scroll_edge_bottom", 0x000B0C81, ScreenHeight).adjust(-1),
    FieldPatch::u32("unknown_height_limit", 0x000F1E02, ScreenHeight).adjust(-24),
    FieldPatch::u16("unknown_width_limit", 0x000F1E3A, ScreenWidth),
];

/// The CD build has no located cave and draws sprites through a different path, so only
/// the timing and windowed fixes exist for it.
const RETAIL_FIXES: &[Fix] = &[
    Fix {
        kind: FixKind::AnimationTiming,
        patches: &[
            RawPatch::new(0x0003C1D2, Scalar::U8(0)),
            RawPatch::new(0x0003C20F, Scalar::U8(0)),
            RawPatch::new(0x00041E85, Scalar::U8(0)),
        ],
    },
    Fix {
        kind: FixKind::WindowedMode,
        patches: &[RawPatch::new(0x00021B38, Scalar::U8(0xEB))],
    },
];

pub const RETAIL: VariantProfile = VariantProfile {
    variant: Variant::EmperorRetail,
    game: Game::Emperor,
    name: "Emperor: Rise of the Middle Kingdom (CD)",
    checksum: 0x1F6EA4C2,
    image_len: 0x00335000,
    image_base: 0x00400000,
    metrics: &METRICS,
    fields: RETAIL_FIELDS,
    caves: &[],
    fixes: RETAIL_FIXES,
    text: Some(TEXT),
};

const DIGITAL_FIELDS: &[FieldPatch] = &[
    FieldPatch::u32("display_mode_width", 0x000245B4, ScreenWidth),
    FieldPatch::u32("display_mode_height", 0x000245BB, ScreenHeight),
    FieldPatch::u32("window_rect_width", 0x0002547E, ScreenWidth),
    FieldPatch::u32("window_rect_height", 0x00025485, ScreenHeight),
    FieldPatch::u8("viewport_width_multiplier", 0x0006CE32, WidthMultiplier),
    FieldPatch::u8("viewport_height_multiplier", 0x0006CE34, HeightMultiplier),
    FieldPatch::u32("viewport_pixel_width", 0x0006D08D, ViewportWidth),
    FieldPatch::u32("viewport_pixel_height", 0x0006D097, ViewportHeight),
    FieldPatch::u32("sidebar_left", 0x00073903, SidebarLeft),
    FieldPatch::u32("sidebar_minimap_left", 0x0007399A, SidebarLeft).adjust(10),
    FieldPatch::u32("menubar_width", 0x0007E131, ScreenWidth),
    FieldPatch::u32("main_menu_left", 0x000A0F82, MenuLeft),
    FieldPatch::u32("main_menu_top", 0x000A0F89, MenuTop),
    FieldPatch::u32("scroll_edge_right", 0x000B36E4, ScreenWidth).adjust(-1),
    FieldPatch::u32("scroll_edge_bottom", 0x000B36F1, ScreenHeight).adjust(-1),
    FieldPatch::u32("unknown_height_limit", 0x000F4872, ScreenHeight).adjust(-24),
    FieldPatch::u16("unknown_width_limit", 0x000F48AA, ScreenWidth),
];

const DIGITAL_MENUBAR_SLOTS: [Slot; 4] =
    fragments::menubar_extender_slots(0x0047C4E0, 0x00A1B6C0);
const DIGITAL_GAP_SLOTS: [Slot; 10] = fragments::gap_filler_slots(0x0052A7F0, 0x00473150);

const DIGITAL_CAVES: &[CaveInjection] = &[
    CaveInjection {
        name: "menubar_extender",
        cave_offset: 0x002A1F40,
        entry_offset: 0x0007E140,
        entry_len: 6,
        fragment: CodeFragment {
            bytes: fragments::MENUBAR_EXTENDER,
            slots: &DIGITAL_MENUBAR_SLOTS,
        },
    },
    CaveInjection {
        name: "gap_filler",
        cave_offset: 0x002A1F70,
        entry_offset: 0x0006D2A0,
        entry_len: 5,
        fragment: CodeFragment {
            bytes: fragments::GAP_FILLER,
            slots: &DIGITAL_GAP_SLOTS,
        },
    },
];

const DIGITAL_FIXES: &[Fix] = &[
    Fix {
        kind: FixKind::AnimationTiming,
        patches: &[
            RawPatch::new(0x0003EC42, Scalar::U8(0)),
            RawPatch::new(0x0003EC7F, Scalar::U8(0)),
            RawPatch::new(0x000448F5, Scalar::U8(0)),
        ],
    },
    Fix {
        kind: FixKind::WindowedMode,
        patches: &[RawPatch::new(0x000245A8, Scalar::U8(0xEB))],
    },
    Fix {
        kind: FixKind::SpriteLimit,
        patches: &[
            RawPatch::new(0x000D61B4, Scalar::U16(0x3000)),
            RawPatch::new(0x000D6249, Scalar::U16(0x3000)),
        ],
    },
];

pub const DIGITAL: VariantProfile = VariantProfile {
    variant: Variant::EmperorDigital,
    game: Game::Emperor,
    name: "Emperor: Rise of the Middle Kingdom (digital)",
    checksum: 0xC2B55D08,
    image_len: 0x00341000,
    image_base: 0x00400000,
    metrics: &METRICS,
    fields: DIGITAL_FIELDS,
    caves: DIGITAL_CAVES,
    fixes: DIGITAL_FIXES,
    text: Some(TEXT),
};
