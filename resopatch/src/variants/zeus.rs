use super::{fragments, FieldPatch, Game, TextTarget, Variant, VariantProfile};
use crate::{
    inject::{CaveInjection, CodeFragment, Slot},
    layout::{LayoutValue::*, ViewportMetrics},
    patcher::{Fix, FixKind, RawPatch},
};
use resopatch_image::Scalar;

pub const METRICS: ViewportMetrics = ViewportMetrics {
    menubar_height: 30,
    sidebar_width: 186,
    tile_width: 60,
    tile_height: 20,
    width_slack: 2,
    height_bias: 1,
    menu_width: 1024,
    menu_height: 768,
};

const TEXT: TextTarget = TextTarget {
    file_name: "Zeus_Text.eng",
    group: 42,
    index: 3,
};

const RETAIL_FIELDS: &[FieldPatch] = &[
    FieldPatch::u32("display_mode_width", 0x0001A6F3, ScreenWidth),
    FieldPatch::u32("display_mode_height", 0x0001A6FA, ScreenHeight),
    FieldPatch::u32("window_rect_width", 0x0001B2C6, ScreenWidth),
    FieldPatch::u32("window_rect_height", 0x0001B2CD, ScreenHeight),
    FieldPatch::u8("viewport_width_multiplier", 0x0004E1A9, WidthMultiplier),
    FieldPatch::u8("viewport_height_multiplier", 0x0004E1AB, HeightMultiplier),
    FieldPatch::u32("viewport_pixel_width", 0x0004E3F1, ViewportWidth),
    FieldPatch::u32("viewport_pixel_height", 0x0004E3FB, ViewportHeight),
    FieldPatch::u32("sidebar_left", 0x00051C82, SidebarLeft),
    FieldPatch::u32("sidebar_minimap_left", 0x00051D17, SidebarLeft).adjust(8),
    FieldPatch::u32("sidebar_buttons_left", 0x00052040, SidebarLeft).adjust(4),
    FieldPatch::u32("menubar_width", 0x00059A0E, ScreenWidth),
    FieldPatch::u32("main_menu_left", 0x00073D25, MenuLeft),
    FieldPatch::u32("main_menu_top", 0x00073D2C, MenuTop),
    FieldPatch::u32("scroll_edge_right", 0x000840B8, ScreenWidth).adjust(-1),
    FieldPatch::u32("scroll_edge_bottom", 0x000840C5, ScreenHeight).adjust(-1),
    FieldPatch::u16("city_clip_height", 0x000912E4, ViewportHeight),
    FieldPatch::u32("unknown_width_check", 0x000C4A11, ScreenWidth),
    FieldPatch::u32("unknown_height_check", 0x000C4A18, ScreenHeight).adjust(-30),
];

const RETAIL_MENUBAR_SLOTS: [Slot; 4] = fragments::menubar_extender_slots(0x00459C40, 0x009D44F8);
const RETAIL_GAP_SLOTS: [Slot; 10] = fragments::gap_filler_slots(0x004E3C10, 0x00451B70);

const RETAIL_CAVES: &[CaveInjection] = &[
    CaveInjection {
        name: "menubar_extender",
        cave_offset: 0x001E7F20,
        entry_offset: 0x00059A20,
        entry_len: 6,
        fragment: CodeFragment {
            bytes: fragments::MENUBAR_EXTENDER,
            slots: &RETAIL_MENUBAR_SLOTS,
        },
    },
    CaveInjection {
        name: "gap_filler",
        cave_offset: 0x001E7F50,
        entry_offset: 0x0004E512,
        entry_len: 5,
        fragment: CodeFragment {
            bytes: fragments::GAP_FILLER,
            slots: &RETAIL_GAP_SLOTS,
        },
    },
];

const RETAIL_FIXES: &[Fix] = &[
    Fix {
        kind: FixKind::AnimationTiming,
        patches: &[
            RawPatch::new(0x0002D8E1, Scalar::U8(0)),
            RawPatch::new(0x0002D91C, Scalar::U8(0)),
            RawPatch::new(0x00030A47, Scalar::U8(0)),
            RawPatch::new(0x00030A9E, Scalar::U8(0)),
        ],
    },
    Fix {
        kind: FixKind::WindowedMode,
        // jz -> jmp over the exclusive mode switch
        patches: &[RawPatch::new(0x0001A6E8, Scalar::U8(0xEB))],
    },
    Fix {
        kind: FixKind::SpriteLimit,
        patches: &[
            RawPatch::new(0x000A7713, Scalar::U16(0x2000)),
            RawPatch::new(0x000A77A2, Scalar::U16(0x2000)),
        ],
    },
];

pub const RETAIL: VariantProfile = VariantProfile {
    variant: Variant::ZeusRetail,
    game: Game::Zeus,
    name: "Zeus: Master of Olympus (CD)",
    checksum: 0x5A4C9E31,
    image_len: 0x0029C000,
    image_base: 0x00400000,
    metrics: &METRICS,
    fields: RETAIL_FIELDS,
    caves: RETAIL_CAVES,
    fixes: RETAIL_FIXES,
    text: Some(TEXT),
};

const DIGITAL_FIELDS: &[FieldPatch] = &[
    FieldPatch::u32("display_mode_width", 0x0001BB23, ScreenWidth),
    FieldPatch::u32("display_mode_height", 0x0001BB2A, ScreenHeight),
    FieldPatch::u32("window_rect_width", 0x0001C6F6, ScreenWidth),
    FieldPatch::u32("window_rect_height", 0x0001C6FD, ScreenHeight),
    FieldPatch::u8("viewport_width_multiplier", 0x0004F5D9, WidthMultiplier),
    FieldPatch::u8("viewport_height_multiplier", 0x0004F5DB, HeightMultiplier),
    FieldPatch::u32("viewport_pixel_width", 0x0004F821, ViewportWidth),
    FieldPatch::u32("viewport_pixel_height", 0x0004F82B, ViewportHeight),
    FieldPatch::u32("sidebar_left", 0x000530B2, SidebarLeft),
    FieldPatch::u32("sidebar_minimap_left", 0x00053147, SidebarLeft).adjust(8),
    FieldPatch::u32("sidebar_buttons_left", 0x00053470, SidebarLeft).adjust(4),
    FieldPatch::u32("menubar_width", 0x0005AE3E, ScreenWidth),
    FieldPatch::u32("main_menu_left", 0x00075155, MenuLeft),
    FieldPatch::u32("main_menu_top", 0x0007515C, MenuTop),
    FieldPatch::u32("scroll_edge_right", 0x000854E8, ScreenWidth).adjust(-1),
    FieldPatch::u32("scroll_edge_bottom", 0x000854F5, ScreenHeight).adjust(-1),
    FieldPatch::u16("city_clip_height", 0x00092714, ViewportHeight),
    FieldPatch::u32("unknown_width_check", 0x000C5E41, ScreenWidth),
    FieldPatch::u32("unknown_height_check", 0x000C5E48, ScreenHeight).adjust(-30),
];

const DIGITAL_MENUBAR_SLOTS: [Slot; 4] =
    fragments::menubar_extender_slots(0x0045B070, 0x009D5928);
const DIGITAL_GAP_SLOTS: [Slot; 10] = fragments::gap_filler_slots(0x004E5040, 0x00452FA0);

const DIGITAL_CAVES: &[CaveInjection] = &[
    CaveInjection {
        name: "menubar_extender",
        cave_offset: 0x001E9350,
        entry_offset: 0x0005AE50,
        entry_len: 6,
        fragment: CodeFragment {
            bytes: fragments::MENUBAR_EXTENDER,
            slots: &DIGITAL_MENUBAR_SLOTS,
        },
    },
    CaveInjection {
        name: "gap_filler",
        cave_offset: 0x001E9380,
        entry_offset: 0x0004F942,
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
            RawPatch::new(0x0002ED11, Scalar::U8(0)),
            RawPatch::new(0x0002ED4C, Scalar::U8(0)),
            RawPatch::new(0x00031E77, Scalar::U8(0)),
            RawPatch::new(0x00031ECE, Scalar::U8(0)),
        ],
    },
    Fix {
        kind: FixKind::WindowedMode,
        patches: &[RawPatch::new(0x0001BB18, Scalar::U8(0xEB))],
    },
    Fix {
        kind: FixKind::SpriteLimit,
        patches: &[
            RawPatch::new(0x000A8B43, Scalar::U16(0x2000)),
            RawPatch::new(0x000A8BD2, Scalar::U16(0x2000)),
        ],
    },
];

pub const DIGITAL: VariantProfile = VariantProfile {
    variant: Variant::ZeusDigital,
    game: Game::Zeus,
    name: "Zeus: Master of Olympus (digital)",
    checksum: 0x93D017B6,
    image_len: 0x002A0000,
    image_base: 0x00400000,
    metrics: &METRICS,
    fields: DIGITAL_FIELDS,
    caves: DIGITAL_CAVES,
    fixes: DIGITAL_FIXES,
    text: Some(TEXT),
};
