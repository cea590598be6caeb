//! Canned frames sent to the client once the backend login has finished.
//!
//! The client only needs to learn whether authentication succeeded, so the
//! frames are fixed rather than derived from the backend's own response.

/// TABULAR_RESULT carrying LOGINACK (TDS 7.4, "Microsoft SQL Server") and DONE.
#[rustfmt::skip]
pub const LOGIN_OK: [u8; 78] = [
    // header: reply, EOM, length 78
    0x04, 0x01, 0x00, 0x4E, 0x00, 0x00, 0x01, 0x00,
    // LOGINACK, length 54, SQL interface, TDS version
    0xAD, 0x36, 0x00, 0x01, 0x74, 0x00, 0x00, 0x04,
    // program name, 22 UTF-16 units
    0x16,
    0x4D, 0x00, 0x69, 0x00, 0x63, 0x00, 0x72, 0x00, 0x6F, 0x00, 0x73, 0x00,
    0x6F, 0x00, 0x66, 0x00, 0x74, 0x00, 0x20, 0x00, 0x53, 0x00, 0x51, 0x00,
    0x4C, 0x00, 0x20, 0x00, 0x53, 0x00, 0x65, 0x00, 0x72, 0x00, 0x76, 0x00,
    0x65, 0x00, 0x72, 0x00, 0x00, 0x00, 0x00, 0x00,
    // program version
    0x0E, 0x00, 0x0C, 0xA6,
    // DONE
    0xFD, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// TABULAR_RESULT carrying ERROR 18456 "Generic SQL Error" and DONE(error).
#[rustfmt::skip]
pub const GENERIC_ERROR: [u8; 122] = [
    // header: reply, EOM, length 122
    0x04, 0x01, 0x00, 0x7A, 0x00, 0x33, 0x01, 0x00,
    // ERROR, length 98, number 18456, state 1, class 14
    0xAA, 0x62, 0x00, 0x18, 0x48, 0x00, 0x00, 0x01, 0x0E,
    // message, 30 UTF-16 units
    0x1E, 0x00,
    0x47, 0x00, 0x65, 0x00, 0x6E, 0x00, 0x65, 0x00, 0x72, 0x00,
    0x69, 0x00, 0x63, 0x00, 0x20, 0x00, 0x53, 0x00, 0x51, 0x00,
    0x4C, 0x00, 0x20, 0x00, 0x45, 0x00, 0x72, 0x00, 0x72, 0x00,
    0x6F, 0x00, 0x72, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    // server name, 12 UTF-16 units
    0x0C,
    0x61, 0x00, 0x64, 0x00, 0x30, 0x00, 0x39, 0x00,
    0x37, 0x00, 0x33, 0x00, 0x31, 0x00, 0x37, 0x00,
    0x35, 0x00, 0x38, 0x00, 0x33, 0x00, 0x35, 0x00,
    // procedure name (empty), line number
    0x00, 0x00, 0x00, 0x00, 0x00,
    // DONE with the error bit
    0xFD, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
