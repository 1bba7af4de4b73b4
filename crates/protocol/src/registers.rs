//! Register programs for the usbtv007 video chip
//!
//! Each program is an ordered list of `(index, value)` pairs that are written
//! with one vendor control transfer apiece. The values come from the Linux
//! usbtv driver; their individual meaning is mostly undocumented.

use crate::types::{TvInput, TvNorm};

/// Base address of the chip's register window
pub const USBTV_BASE: u16 = 0xc000;

/// bRequest used for register writes
pub const USBTV_REQUEST_REG: u8 = 12;

/// bmRequestType for register writes: OUT | VENDOR | DEVICE
pub const REGISTER_REQUEST_TYPE: u8 = 0x40;

/// Default isochronous video endpoint
pub const USBTV_VIDEO_EP: u8 = 0x81;

/// USB vendor id of the usbtv007 stick
pub const USBTV_VENDOR_ID: u16 = 0x1b71;

/// USB product id of the usbtv007 stick
pub const USBTV_PRODUCT_ID: u16 = 0x3002;

/// Number of isochronous URBs kept in flight
pub const USBTV_ISOC_TRANSFERS: usize = 16;

/// Isochronous packets per URB
pub const USBTV_ISOC_PACKETS_PER_REQUEST: usize = 8;

/// One register write
pub type RegisterWrite = (u16, u16);

const fn reg(offset: u16, value: u16) -> RegisterWrite {
    (USBTV_BASE + offset, value)
}

/// Enables the device and loads default picture settings
pub const VIDEO_INIT: &[RegisterWrite] = &[
    // device enable
    reg(0x0008, 0x0001),
    reg(0x01d0, 0x00ff),
    reg(0x01d9, 0x0002),
    // colour defaults (brightness, contrast, ...)
    reg(0x0239, 0x0040),
    reg(0x0240, 0x0000),
    reg(0x0241, 0x0000),
    reg(0x0242, 0x0002),
    reg(0x0243, 0x0080),
    reg(0x0244, 0x0012),
    reg(0x0245, 0x0090),
    reg(0x0246, 0x0000),
    reg(0x0278, 0x002d),
    reg(0x0279, 0x000a),
    reg(0x027a, 0x0032),
    (0xf890, 0x000c),
    (0xf894, 0x0086),
    reg(0x00ac, 0x00c0),
    reg(0x00ad, 0x0000),
    reg(0x00a2, 0x0012),
    reg(0x00a3, 0x00e0),
    reg(0x00a4, 0x0028),
    reg(0x00a5, 0x0082),
    reg(0x00a7, 0x0080),
    reg(0x0000, 0x0014),
    reg(0x0006, 0x0003),
    reg(0x0090, 0x0099),
    reg(0x0091, 0x0090),
    reg(0x0094, 0x0068),
    reg(0x0095, 0x0070),
    reg(0x009c, 0x0030),
    reg(0x009d, 0x00c0),
    reg(0x009e, 0x00e0),
    reg(0x0019, 0x0006),
    reg(0x008c, 0x00ba),
    reg(0x0101, 0x00ff),
    reg(0x010c, 0x00b3),
    reg(0x01b2, 0x0080),
    reg(0x01b4, 0x00a0),
    reg(0x014c, 0x00ff),
    reg(0x014d, 0x00ca),
    reg(0x0113, 0x0053),
    reg(0x0119, 0x008a),
    reg(0x013c, 0x0003),
    reg(0x0150, 0x009c),
    reg(0x0151, 0x0071),
    reg(0x0152, 0x00c6),
    reg(0x0153, 0x0084),
    reg(0x0154, 0x00bc),
    reg(0x0155, 0x00a0),
    reg(0x0156, 0x00a0),
    reg(0x0157, 0x009c),
    reg(0x0158, 0x001f),
    reg(0x0159, 0x0006),
    reg(0x015d, 0x0000),
    reg(0x0003, 0x0004),
    reg(0x0100, 0x00d3),
    reg(0x0115, 0x0015),
    reg(0x0220, 0x002e),
    reg(0x0225, 0x0008),
    reg(0x024e, 0x0002),
    reg(0x024e, 0x0002),
    reg(0x024f, 0x0002),
];

/// NTSC timing
pub const NTSC_TV_NORM: &[RegisterWrite] = &[
    reg(0x001a, 0x0079),
    reg(0x010e, 0x0068),
    reg(0x010f, 0x009c),
    reg(0x0112, 0x00f0),
    reg(0x0117, 0x0000),
    reg(0x0118, 0x00fc),
    reg(0x012d, 0x0004),
    reg(0x012f, 0x0008),
    reg(0x024f, 0x0001),
    reg(0x0254, 0x005f),
    reg(0x025a, 0x0012),
    reg(0x025b, 0x0001),
    reg(0x0263, 0x001c),
    reg(0x0266, 0x0011),
    reg(0x0267, 0x0005),
];

/// PAL timing
pub const PAL_TV_NORM: &[RegisterWrite] = &[
    reg(0x001a, 0x0068),
    reg(0x010e, 0x0072),
    reg(0x010f, 0x00a2),
    reg(0x0112, 0x00b0),
    reg(0x0117, 0x0001),
    reg(0x0118, 0x002c),
    reg(0x012d, 0x0010),
    reg(0x012f, 0x0020),
    reg(0x024f, 0x0002),
    reg(0x0254, 0x0059),
    reg(0x025a, 0x0016),
    reg(0x025b, 0x0035),
    reg(0x0263, 0x0017),
    reg(0x0266, 0x0016),
    reg(0x0267, 0x0036),
];

/// Composite (RCA) input select
pub const COMPOSITE_INPUT: &[RegisterWrite] = &[
    reg(0x0105, 0x0060),
    reg(0x011f, 0x00f2),
    reg(0x0127, 0x0060),
    reg(0x00ae, 0x0010),
    reg(0x0239, 0x0060),
];

/// S-Video input select
pub const SVIDEO_INPUT: &[RegisterWrite] = &[
    reg(0x0105, 0x0010),
    reg(0x011f, 0x00ff),
    reg(0x0127, 0x0060),
    reg(0x00ae, 0x0030),
    reg(0x0239, 0x0060),
];

/// Register program for a TV norm
pub fn norm_registers(norm: TvNorm) -> &'static [RegisterWrite] {
    match norm {
        TvNorm::Ntsc => NTSC_TV_NORM,
        TvNorm::Pal => PAL_TV_NORM,
    }
}

/// Register program for an input
pub fn input_registers(input: TvInput) -> &'static [RegisterWrite] {
    match input {
        TvInput::Composite => COMPOSITE_INPUT,
        TvInput::Svideo => SVIDEO_INPUT,
    }
}
