//! Hand-assembled x86 fragments shared by every variant. Only the slot tables differ
//! between builds, since subroutine and data addresses move.

use crate::{
    inject::Slot,
    layout::LayoutValue::{self, *},
    variants::FieldWidth,
};

const fn push_imm(offset: usize, value: LayoutValue) -> Slot {
    Slot::layout(offset, value, FieldWidth::U32)
}

/// Repeats the menubar tile across the full screen width before running the displaced
/// `mov ecx, [menubar_state]`.
#[rustfmt::skip]
pub const MENUBAR_EXTENDER: &[u8] = &[
    0x60,                               // pushad
    0xBE, 0x00, 0x04, 0x00, 0x00,       // mov esi, 400h
    0x56,                               // push esi
    0xE8, 0x00, 0x00, 0x00, 0x00,       // call draw_menubar_tile
    0x83, 0xC4, 0x04,                   // add esp, 4
    0x81, 0xC6, 0x00, 0x01, 0x00, 0x00, // add esi, 100h
    0x81, 0xFE, 0x00, 0x00, 0x00, 0x00, // cmp esi, screen_width
    0x7C, 0xE9,                         // jl -> push esi
    0x61,                               // popad
    0x8B, 0x0D, 0x00, 0x00, 0x00, 0x00, // mov ecx, [menubar_state]
    0xE9, 0x00, 0x00, 0x00, 0x00,       // jmp continue
];

pub const fn menubar_extender_slots(draw_menubar_tile: u32, menubar_state: u32) -> [Slot; 4] {
    [
        Slot::call(8, draw_menubar_tile),
        push_imm(23, ScreenWidth),
        Slot::address(32, menubar_state),
        Slot::resume(37),
    ]
}

/// Blacks out the strip right of the city view and the strip below it, then makes the
/// displaced `call draw_sidebar`.
#[rustfmt::skip]
pub const GAP_FILLER: &[u8] = &[
    0x60,                               // pushad
    0x6A, 0x00,                         // push 0 (colour)
    0x68, 0x00, 0x00, 0x00, 0x00,       // push screen_height
    0x68, 0x00, 0x00, 0x00, 0x00,       // push filler_width
    0x6A, 0x00,                         // push 0 (y)
    0x68, 0x00, 0x00, 0x00, 0x00,       // push viewport_width (x)
    0xE8, 0x00, 0x00, 0x00, 0x00,       // call fill_rect
    0x83, 0xC4, 0x14,                   // add esp, 14h
    0x6A, 0x00,                         // push 0 (colour)
    0x68, 0x00, 0x00, 0x00, 0x00,       // push filler_height
    0x68, 0x00, 0x00, 0x00, 0x00,       // push sidebar_left
    0x68, 0x00, 0x00, 0x00, 0x00,       // push viewport_height (y)
    0x6A, 0x00,                         // push 0 (x)
    0xE8, 0x00, 0x00, 0x00, 0x00,       // call fill_rect
    0x83, 0xC4, 0x14,                   // add esp, 14h
    0x61,                               // popad
    0xE8, 0x00, 0x00, 0x00, 0x00,       // call draw_sidebar
    0xE9, 0x00, 0x00, 0x00, 0x00,       // jmp continue
];

pub const fn gap_filler_slots(fill_rect: u32, draw_sidebar: u32) -> [Slot; 10] {
    [
        push_imm(4, ScreenHeight),
        push_imm(9, FillerWidth),
        push_imm(16, ViewportWidth),
        Slot::call(21, fill_rect),
        push_imm(31, FillerHeight),
        push_imm(36, SidebarLeft),
        push_imm(41, ViewportHeight),
        Slot::call(48, fill_rect),
        Slot::call(57, draw_sidebar),
        Slot::resume(62),
    ]
}
