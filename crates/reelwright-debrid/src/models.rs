// SPDX-License-Identifier: GPL-3.0-or-later

use serde::{Deserialize, Serialize};

/// Response of `POST /unrestrict/link`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnrestrictedLink {
    pub id: String,
    pub filename: String,
    #[serde(rename = "mimeType", default)]
    pub mime_type: Option<String>,
    /// Size in bytes, 0 when the hoster did not report it.
    #[serde(default)]
    pub filesize: u64,
    /// The hoster link that was unrestricted.
    pub link: String,
    pub host: String,
    #[serde(default)]
    pub chunks: Option<u32>,
    /// Direct, time-limited download URL.
    pub download: String,
    #[serde(default)]
    pub streamable: Option<u8>,
}

impl UnrestrictedLink {
    pub fn size(&self) -> Option<u64> {
        (self.filesize > 0).then_some(self.filesize)
    }
}

/// Error body returned alongside non-2xx statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_code: Option<i64>,
}
