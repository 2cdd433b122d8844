use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum DriveModel {
    Hp7906,
    #[default]
    Hp7920,
    Hp7925,
}

impl DriveModel {
    pub fn cylinders(&self) -> u16 {
        match self {
            DriveModel::Hp7906 => 411,
            DriveModel::Hp7920 | DriveModel::Hp7925 => 823,
        }
    }

    pub fn heads(&self) -> u8 {
        match self {
            DriveModel::Hp7906 => 4,
            DriveModel::Hp7920 => 5,
            DriveModel::Hp7925 => 9,
        }
    }

    pub fn sectors(&self) -> u8 {
        match self {
            DriveModel::Hp7906 | DriveModel::Hp7920 => 48,
            DriveModel::Hp7925 => 64,
        }
    }

    /// The second byte a drive returns to Amigo Identify.
    pub fn identify_byte(&self) -> u8 {
        match self {
            DriveModel::Hp7906 => 0x02,
            DriveModel::Hp7920 => 0x03,
            DriveModel::Hp7925 => 0x04,
        }
    }

    /// The drive type reported in bits 12-9 of status-2.
    pub fn type_code(&self) -> u16 {
        match self {
            DriveModel::Hp7906 => 0,
            DriveModel::Hp7920 => 1,
            DriveModel::Hp7925 => 3,
        }
    }

    pub fn contains(&self, cylinder: u16, head: u8, sector: u8) -> bool {
        cylinder < self.cylinders() && head < self.heads() && sector < self.sectors()
    }

    /// The offset in words of the start of a sector in an image.
    pub fn word_offset(&self, cylinder: u16, head: u8, sector: u8) -> u64 {
        let track = u64::from(cylinder) * u64::from(self.heads()) + u64::from(head);
        (track * u64::from(self.sectors()) + u64::from(sector)) * super::SECTOR_WORDS as u64
    }

    /// Words in a full image.
    pub fn capacity_words(&self) -> u64 {
        self.word_offset(self.cylinders(), 0, 0)
    }
}

impl Display for DriveModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriveModel::Hp7906 => "7906",
            DriveModel::Hp7920 => "7920",
            DriveModel::Hp7925 => "7925",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownModel(pub String);

impl Display for UnknownModel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown drive model '{}' (expected 7906, 7920 or 7925)",
            self.0
        )
    }
}

impl Error for UnknownModel {}

impl FromStr for DriveModel {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<DriveModel, UnknownModel> {
        match s.trim_start_matches("HP").trim_start_matches("hp") {
            "7906" => Ok(DriveModel::Hp7906),
            "7920" => Ok(DriveModel::Hp7920),
            "7925" => Ok(DriveModel::Hp7925),
            _ => Err(UnknownModel(s.to_string())),
        }
    }
}
