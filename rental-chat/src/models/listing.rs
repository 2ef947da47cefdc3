use serde::{Deserialize, Serialize};

/// A rentable product. Owned by the catalog; read-only here.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Listing {
    pub product_id: String,
    pub title: String,
    #[serde(default)]
    pub image_url: Vec<String>,
    #[serde(default)]
    pub flagged: bool,
    #[serde(default)]
    pub verified: bool,
    #[serde(default = "default_availability")]
    pub availability: bool,
}

fn default_availability() -> bool {
    true
}

impl Listing {
    pub fn thumbnail(&self) -> &str {
        self.image_url.first().map(String::as_str).unwrap_or("")
    }
}
