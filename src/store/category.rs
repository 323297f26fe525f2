//! Cache categories and their on-disk directory names

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An isolated storage partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// API responses
    Api,
    /// Generic data
    Data,
    /// Whole files
    File,
    /// Images (fronted by the memory tier)
    Image,
    /// Every real category; only meaningful as a clear target
    All,
}

impl Category {
    /// Every category that owns a directory, in a stable order
    pub const STORAGE: [Category; 4] = [
        Category::Api,
        Category::Data,
        Category::File,
        Category::Image,
    ];

    /// Directory name under the cache root. Part of the on-disk layout:
    /// renaming one orphans whatever was cached under the old name.
    pub fn dir_name(self) -> Option<&'static str> {
        match self {
            Category::Api => Some("API"),
            Category::Data => Some("Data"),
            Category::File => Some("Files"),
            Category::Image => Some("ImageCache"),
            Category::All => None,
        }
    }

    pub fn is_synthetic(self) -> bool {
        self == Category::All
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Api => "api",
            Category::Data => "data",
            Category::File => "file",
            Category::Image => "image",
            Category::All => "all",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown cache category: {0:?} (expected api, data, file, image or all)")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(Category::Api),
            "data" => Ok(Category::Data),
            "file" | "files" => Ok(Category::File),
            "image" | "images" => Ok(Category::Image),
            "all" => Ok(Category::All),
            _ => Err(UnknownCategory(s.to_string())),
        }
    }
}
