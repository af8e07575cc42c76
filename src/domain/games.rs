use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_SAVE_LOCATION_LEN: usize = 500;
pub const MAX_EXE_NAME_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub name: String,
    pub save_location: String,
    /// Executable watched to block restores while the game runs.
    pub exe_name: Option<String>,
    pub cover_image: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewGame {
    pub name: String,
    pub save_location: String,
    pub exe_name: Option<String>,
    pub cover_image: Option<String>,
}

/// Partial update; `None` leaves a field untouched, an empty string clears
/// the optional ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateGame {
    pub id: String,
    pub name: Option<String>,
    pub save_location: Option<String>,
    pub exe_name: Option<String>,
    pub cover_image: Option<String>,
}
