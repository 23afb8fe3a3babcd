//! # castdidl - DIDL-Lite for video casting
//!
//! Builds and parses the DIDL-Lite metadata carried in the
//! `CurrentURIMetaData` argument of `SetAVTransportURI`, plus the MIME
//! and DLNA-profile tables shared with the streaming server.

use serde::{Deserialize, Serialize};

use castutils::format_secs_to_hms;

/// Standard DLNA flags advertised for streamed video content.
pub const DLNA_FLAGS: &str = "01500000000000000000000000000000";

/// MIME type for a media file, by extension.
pub fn mime_type_for(path: &str) -> &'static str {
    match extension_of(path).as_deref() {
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("mpg") | Some("mpeg") => "video/mpeg",
        Some("wmv") => "video/x-ms-wmv",
        Some("ts") => "video/MP2T",
        Some("srt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// DLNA profile identifier for a media file, by extension.
///
/// `*` is a valid profile wildcard for renderers that do not match the
/// extension against a known profile.
pub fn dlna_profile_for(path: &str) -> &'static str {
    match extension_of(path).as_deref() {
        Some("mp4") => "AVC_MP4_BL_CIF15_AAC_520",
        Some("ts") => "MPEG_TS_SD_EU_ISO",
        Some("avi") | Some("mkv") | Some("mov") | Some("mpg") | Some("mpeg") | Some("wmv") => {
            "MPEG_PS_PAL"
        }
        _ => "*",
    }
}

/// `contentFeatures.dlna.org` value for a media file.
pub fn content_features_for(path: &str) -> String {
    format!(
        "DLNA.ORG_PN={};DLNA.ORG_OP=01;DLNA.ORG_CI=0;DLNA.ORG_FLAGS={}",
        dlna_profile_for(path),
        DLNA_FLAGS
    )
}

fn extension_of(path: &str) -> Option<String> {
    std::path::Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

// ============= DIDL-Lite document model =============

/// Root of a DIDL-Lite document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "DIDL-Lite")]
pub struct DIDLLite {
    #[serde(rename = "@xmlns")]
    pub xmlns: String,

    #[serde(rename = "@xmlns:upnp", skip_serializing_if = "Option::is_none")]
    pub xmlns_upnp: Option<String>,

    #[serde(rename = "@xmlns:dc", skip_serializing_if = "Option::is_none")]
    pub xmlns_dc: Option<String>,

    #[serde(rename = "@xmlns:dlna", skip_serializing_if = "Option::is_none")]
    pub xmlns_dlna: Option<String>,

    #[serde(rename = "item", default)]
    pub items: Vec<Item>,
}

impl Default for DIDLLite {
    fn default() -> Self {
        Self {
            xmlns: "urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/".to_string(),
            xmlns_upnp: Some("urn:schemas-upnp-org:metadata-1-0/upnp/".to_string()),
            xmlns_dc: Some("http://purl.org/dc/elements/1.1/".to_string()),
            xmlns_dlna: Some("urn:schemas-dlna-org:metadata-1-0/".to_string()),
            items: Vec::new(),
        }
    }
}

/// A video item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "@id")]
    pub id: String,

    #[serde(rename = "@parentID")]
    pub parent_id: String,

    #[serde(rename = "@restricted", skip_serializing_if = "Option::is_none")]
    pub restricted: Option<String>,

    #[serde(rename = "dc:title", alias = "title")]
    pub title: String,

    #[serde(rename = "upnp:class", alias = "class")]
    pub class: String,

    #[serde(rename = "res", default)]
    pub resources: Vec<Resource>,
}

/// A media resource (the streamed file).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "@protocolInfo")]
    pub protocol_info: String,

    #[serde(rename = "@duration", skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(rename = "$text")]
    pub url: String,
}

/// Parse a DIDL-Lite document.
pub fn parse_didl(input: &str) -> Result<DIDLLite, quick_xml::de::DeError> {
    quick_xml::de::from_str(input)
}

// ============= Video item builder =============

/// Everything needed to describe one streamed video to a renderer.
#[derive(Debug, Clone)]
pub struct VideoItem {
    pub title: String,
    /// URL the renderer will fetch, already HTTP-reachable from the LAN.
    pub url: String,
    /// Path of the backing file, used only to derive MIME/profile.
    pub file_path: String,
    /// Duration in seconds when known; advertised in the `res` element.
    pub duration_secs: Option<u64>,
}

impl VideoItem {
    /// Serialize this item as the DIDL-Lite `CurrentURIMetaData` payload.
    pub fn to_didl(&self) -> Result<String, quick_xml::SeError> {
        let protocol_info = format!(
            "http-get:*:{}:{}",
            mime_type_for(&self.file_path),
            content_features_for(&self.file_path)
        );

        let didl = DIDLLite {
            items: vec![Item {
                id: "0".to_string(),
                parent_id: "-1".to_string(),
                restricted: Some("1".to_string()),
                title: self.title.clone(),
                class: "object.item.videoItem".to_string(),
                resources: vec![Resource {
                    protocol_info,
                    duration: self.duration_secs.map(format_secs_to_hms),
                    url: self.url.clone(),
                }],
            }],
            ..DIDLLite::default()
        };

        quick_xml::se::to_string(&didl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_type_for("/v/a.mp4"), "video/mp4");
        assert_eq!(mime_type_for("/v/a.MKV"), "video/x-matroska");
        assert_eq!(mime_type_for("/v/a.avi"), "video/x-msvideo");
        assert_eq!(mime_type_for("/v/a.mov"), "video/quicktime");
        assert_eq!(mime_type_for("/v/a.ts"), "video/MP2T");
        assert_eq!(mime_type_for("/v/subs.srt"), "text/plain");
        assert_eq!(mime_type_for("/v/unknown.bin"), "application/octet-stream");
    }

    #[test]
    fn test_dlna_profiles() {
        assert_eq!(dlna_profile_for("/v/a.mp4"), "AVC_MP4_BL_CIF15_AAC_520");
        assert_eq!(dlna_profile_for("/v/a.ts"), "MPEG_TS_SD_EU_ISO");
        assert_eq!(dlna_profile_for("/v/a.mkv"), "MPEG_PS_PAL");
        assert_eq!(dlna_profile_for("/v/a.xyz"), "*");
    }

    #[test]
    fn test_content_features_shape() {
        let features = content_features_for("/v/a.mp4");
        assert!(features.starts_with("DLNA.ORG_PN=AVC_MP4_BL_CIF15_AAC_520;"));
        assert!(features.contains("DLNA.ORG_OP=01"));
        assert!(features.contains("DLNA.ORG_CI=0"));
        assert!(features.ends_with(DLNA_FLAGS));
    }

    #[test]
    fn test_video_item_to_didl() {
        let item = VideoItem {
            title: "a".to_string(),
            url: "http://10.0.0.2:9000/file_video/a.mp4".to_string(),
            file_path: "/v/a.mp4".to_string(),
            duration_secs: Some(90),
        };

        let didl = item.to_didl().unwrap();
        assert!(didl.contains("DIDL-Lite"));
        assert!(didl.contains("object.item.videoItem"));
        assert!(didl.contains("http-get:*:video/mp4:DLNA.ORG_PN=AVC_MP4_BL_CIF15_AAC_520"));
        assert!(didl.contains("duration=\"00:01:30\""));
        assert!(didl.contains("http://10.0.0.2:9000/file_video/a.mp4"));
    }

    #[test]
    fn test_didl_escapes_entities() {
        let item = VideoItem {
            title: "Tom & Jerry <best>".to_string(),
            url: "http://10.0.0.2:9000/file_video/a.mp4?x=1&y=2".to_string(),
            file_path: "/v/a.mp4".to_string(),
            duration_secs: None,
        };

        let didl = item.to_didl().unwrap();
        assert!(didl.contains("Tom &amp; Jerry &lt;best&gt;"));
        assert!(didl.contains("x=1&amp;y=2"));
        assert!(!didl.contains("x=1&y=2"));

        let parsed = parse_didl(&didl).unwrap();
        assert_eq!(parsed.items[0].title, "Tom & Jerry <best>");
        assert_eq!(
            parsed.items[0].resources[0].url,
            "http://10.0.0.2:9000/file_video/a.mp4?x=1&y=2"
        );
    }

    #[test]
    fn test_didl_round_trip() {
        let item = VideoItem {
            title: "Loop A".to_string(),
            url: "http://10.0.0.2:9001/file_video/loop-a.mp4".to_string(),
            file_path: "/v/loop-a.mp4".to_string(),
            duration_secs: None,
        };

        let didl = parse_didl(&item.to_didl().unwrap()).unwrap();
        assert_eq!(didl.items.len(), 1);
        assert_eq!(didl.items[0].title, "Loop A");
        assert_eq!(
            didl.items[0].resources[0].url,
            "http://10.0.0.2:9001/file_video/loop-a.mp4"
        );
        assert!(didl.items[0].resources[0].duration.is_none());
    }
}
