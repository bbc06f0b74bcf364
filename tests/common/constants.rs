//! Shared constants for end-to-end tests

/// Name of the primary scripted source
pub const MUSEUM: &str = "museum";

/// Name of the secondary scripted source
pub const ARCHIVE: &str = "archive";

/// Fixture dimensions at the minimum accepted size
pub const BASE_WIDTH: u32 = 90;
pub const BASE_HEIGHT: u32 = 80;

/// Bar patterns whose perceptual hashes are pairwise at least 8 bits apart.
pub const PATTERNS: [u8; 8] = [
    0b1010_1010,
    0b0101_0101,
    0b1100_1100,
    0b0011_0011,
    0b1111_0000,
    0b0000_1111,
    0b1001_0110,
    0b0110_1001,
];
