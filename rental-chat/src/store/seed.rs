use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Listing, User};

/// Catalog records loaded into a fresh store at startup.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub users: Vec<User>,
}

impl SeedData {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}
