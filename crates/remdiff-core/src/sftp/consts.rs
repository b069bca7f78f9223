//! SFTP version 3 wire constants.

/// Protocol version spoken by this client. Servers replying with a higher
/// version are driven with version-3 semantics; lower versions are refused.
pub const SFTP_VERSION: u32 = 3;

/// Upper bound on an inbound packet length. Generous for 4 KiB reads and
/// directory listings; anything larger is treated as a framing error.
pub const MAX_PACKET: usize = 256 * 1024;

// =============================================================================
// Packet types
// =============================================================================

pub const FXP_INIT: u8 = 1;
pub const FXP_VERSION: u8 = 2;
pub const FXP_OPEN: u8 = 3;
pub const FXP_CLOSE: u8 = 4;
pub const FXP_READ: u8 = 5;
pub const FXP_LSTAT: u8 = 7;
pub const FXP_FSTAT: u8 = 8;
pub const FXP_READDIR: u8 = 12;
pub const FXP_REALPATH: u8 = 16;
pub const FXP_STAT: u8 = 17;

pub const FXP_STATUS: u8 = 101;
pub const FXP_HANDLE: u8 = 102;
pub const FXP_DATA: u8 = 103;
pub const FXP_NAME: u8 = 104;
pub const FXP_ATTRS: u8 = 105;

// =============================================================================
// Status codes
// =============================================================================

pub const FX_OK: u32 = 0;
pub const FX_EOF: u32 = 1;
pub const FX_NO_SUCH_FILE: u32 = 2;
pub const FX_PERMISSION_DENIED: u32 = 3;
pub const FX_FAILURE: u32 = 4;
pub const FX_BAD_MESSAGE: u32 = 5;
pub const FX_NO_CONNECTION: u32 = 6;
pub const FX_CONNECTION_LOST: u32 = 7;
pub const FX_OP_UNSUPPORTED: u32 = 8;

// =============================================================================
// Open access-mode bits
// =============================================================================

pub const FXF_READ: u32 = 0x0000_0001;
pub const FXF_WRITE: u32 = 0x0000_0002;
pub const FXF_APPEND: u32 = 0x0000_0004;
pub const FXF_CREAT: u32 = 0x0000_0008;
pub const FXF_TRUNC: u32 = 0x0000_0010;
pub const FXF_EXCL: u32 = 0x0000_0020;
pub const FXF_TEXT: u32 = 0x0000_0040;

// =============================================================================
// Attribute-flags bits
// =============================================================================

pub const ATTR_SIZE: u32 = 0x0000_0001;
pub const ATTR_UIDGID: u32 = 0x0000_0002;
pub const ATTR_PERMISSIONS: u32 = 0x0000_0004;
pub const ATTR_ACMODTIME: u32 = 0x0000_0008;
pub const ATTR_EXTENDED: u32 = 0x8000_0000;
