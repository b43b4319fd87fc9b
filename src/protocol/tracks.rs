//! Track objects of the web API (`GET /v1/tracks/{id}`).

use serde::Deserialize;

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct Track {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub artists: Vec<Artist>,
    pub album: Album,
    pub duration_ms: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct Artist {
    pub name: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct Album {
    pub name: String,
    #[serde(default)]
    pub images: Vec<Image>,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct Image {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}
