/// RLP encoding of the empty string, also used to encode the integer zero.
pub const RLP_NULL: u8 = 0x80;
/// RLP encoding of the empty list.
pub const RLP_EMPTY_LIST: u8 = 0xc0;
