//! M3U8 playlist parsing
//!
//! Handles master playlists (variant streams) and media playlists (segment
//! lists). URIs are resolved against the playlist URL.

use url::Url;

use crate::error::{StreamError, StreamResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    pub uri: Url,
    pub bandwidth: u64,
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MasterPlaylist {
    pub variants: Vec<Variant>,
}

impl MasterPlaylist {
    /// Variant with the highest advertised bandwidth
    #[must_use]
    pub fn best_variant(&self) -> Option<&Variant> {
        self.variants.iter().max_by_key(|v| v.bandwidth)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub uri: Url,
    /// Seconds
    pub duration: f64,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    /// Seconds
    pub target_duration: f64,
    pub media_sequence: u64,
    pub segments: Vec<Segment>,
    /// `#EXT-X-ENDLIST` present: the playlist will not grow
    pub endlist: bool,
}

impl MediaPlaylist {
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !self.endlist
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Playlist {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
}

/// Resolve a possibly-relative URI against the playlist URL
fn make_absolute(raw: &str, base: &Url) -> StreamResult<Url> {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Ok(Url::parse(raw)?);
    }
    Ok(base.join(raw)?)
}

/// Read `NAME=value` from an attribute list, honoring quoted values
fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = attrs;
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], quoted[end + 1..].trim_start_matches(','))
        } else {
            match after.find(',') {
                Some(comma) => (&after[..comma], &after[comma + 1..]),
                None => (after, ""),
            }
        };
        if key.eq_ignore_ascii_case(name) {
            return Some(value);
        }
        rest = remaining;
    }
    None
}

/// Parse a playlist body fetched from `base`
pub fn parse(body: &str, base: &Url) -> StreamResult<Playlist> {
    let mut lines = body.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some("#EXTM3U") {
        return Err(StreamError::Playlist(format!("{base}: missing #EXTM3U header")));
    }

    let mut variants = Vec::new();
    let mut pending_variant: Option<(u64, Option<String>)> = None;

    let mut target_duration = None;
    let mut media_sequence: u64 = 0;
    let mut segments = Vec::new();
    let mut pending_duration: Option<f64> = None;
    let mut endlist = false;

    for line in lines {
        if let Some(attrs) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let bandwidth = attribute(attrs, "BANDWIDTH")
                .and_then(|b| b.parse().ok())
                .ok_or_else(|| StreamError::Playlist(format!("{base}: variant without BANDWIDTH")))?;
            pending_variant = Some((bandwidth, attribute(attrs, "RESOLUTION").map(str::to_string)));
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = Some(
                value
                    .parse::<f64>()
                    .map_err(|e| StreamError::Playlist(format!("{base}: bad target duration: {e}")))?,
            );
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = value
                .parse()
                .map_err(|e| StreamError::Playlist(format!("{base}: bad media sequence: {e}")))?;
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let duration = value.split(',').next().unwrap_or_default();
            pending_duration = Some(
                duration
                    .parse()
                    .map_err(|e| StreamError::Playlist(format!("{base}: bad segment duration: {e}")))?,
            );
        } else if line == "#EXT-X-ENDLIST" {
            endlist = true;
        } else if line.starts_with('#') {
            // Unhandled tag
        } else if let Some((bandwidth, resolution)) = pending_variant.take() {
            variants.push(Variant {
                uri: make_absolute(line, base)?,
                bandwidth,
                resolution,
            });
        } else if let Some(duration) = pending_duration.take() {
            let sequence = media_sequence.saturating_add(segments.len() as u64);
            segments.push(Segment {
                uri: make_absolute(line, base)?,
                duration,
                sequence,
            });
        }
    }

    if !variants.is_empty() {
        return Ok(Playlist::Master(MasterPlaylist { variants }));
    }

    let target_duration = target_duration
        .ok_or_else(|| StreamError::Playlist(format!("{base}: missing #EXT-X-TARGETDURATION")))?;

    Ok(Playlist::Media(MediaPlaylist {
        target_duration,
        media_sequence,
        segments,
        endlist,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://cams.example.com/lobby/index.m3u8").unwrap()
    }

    #[test]
    fn test_parse_master_playlist() {
        let body = "#EXTM3U\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,CODECS=\"avc1.4d401e,mp4a.40.2\"\n\
                    low/index.m3u8\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720\n\
                    https://cdn.example.com/high/index.m3u8\n";

        let Playlist::Master(master) = parse(body, &base()).unwrap() else {
            panic!("expected master playlist");
        };
        assert_eq!(master.variants.len(), 2);
        assert_eq!(
            master.variants[0].uri.as_str(),
            "https://cams.example.com/lobby/low/index.m3u8"
        );
        assert_eq!(master.variants[0].resolution.as_deref(), Some("640x360"));

        let best = master.best_variant().unwrap();
        assert_eq!(best.bandwidth, 2_500_000);
        assert_eq!(best.uri.as_str(), "https://cdn.example.com/high/index.m3u8");
    }

    #[test]
    fn test_parse_live_media_playlist() {
        let body = "#EXTM3U\n\
                    #EXT-X-VERSION:3\n\
                    #EXT-X-TARGETDURATION:2\n\
                    #EXT-X-MEDIA-SEQUENCE:41\n\
                    #EXTINF:2.000,\n\
                    seg41.ts\n\
                    #EXTINF:1.960,\n\
                    /abs/seg42.ts\n";

        let Playlist::Media(media) = parse(body, &base()).unwrap() else {
            panic!("expected media playlist");
        };
        assert!(media.is_live());
        assert!((media.target_duration - 2.0).abs() < f64::EPSILON);
        assert_eq!(media.segments.len(), 2);
        assert_eq!(media.segments[0].sequence, 41);
        assert_eq!(media.segments[1].sequence, 42);
        assert_eq!(media.segments[0].uri.as_str(), "https://cams.example.com/lobby/seg41.ts");
        assert_eq!(media.segments[1].uri.as_str(), "https://cams.example.com/abs/seg42.ts");
    }

    #[test]
    fn test_parse_endlist() {
        let body = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4,\na.ts\n#EXT-X-ENDLIST\n";
        let Playlist::Media(media) = parse(body, &base()).unwrap() else {
            panic!("expected media playlist");
        };
        assert!(!media.is_live());
    }

    #[test]
    fn test_parse_saturates_media_sequence() {
        let body = format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:{}\n#EXTINF:2,\na.ts\n#EXTINF:2,\nb.ts\n",
            u64::MAX
        );
        let Playlist::Media(media) = parse(&body, &base()).unwrap() else {
            panic!("expected media playlist");
        };
        assert_eq!(media.segments[0].sequence, u64::MAX);
        assert_eq!(media.segments[1].sequence, u64::MAX);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse("<html></html>", &base()), Err(StreamError::Playlist(_))));
        assert!(matches!(
            parse("#EXTM3U\n#EXTINF:2,\na.ts\n", &base()),
            Err(StreamError::Playlist(_))
        ));
    }

    #[test]
    fn test_attribute_quoted_commas() {
        let attrs = "CODECS=\"avc1,mp4a\",BANDWIDTH=5";
        assert_eq!(attribute(attrs, "codecs"), Some("avc1,mp4a"));
        assert_eq!(attribute(attrs, "BANDWIDTH"), Some("5"));
        assert_eq!(attribute(attrs, "RESOLUTION"), None);
    }
}
