use regex::Regex;

/// Rewrites ffmpeg's session-local playlists so segment references become
/// client-visible URLs on the streaming endpoint.
pub struct PlaylistRewriter {
    uri_regex: Regex,
    segment_regex: Regex,
}

impl PlaylistRewriter {
    pub fn new() -> Self {
        Self {
            // EXT-X-MAP:URI="init.mp4" and friends.
            uri_regex: Regex::new(r#"URI="([^"]+)""#).expect("static regex"),
            // Standalone segment filenames.
            segment_regex: Regex::new(r"^([^#\s].*\.(m4s|ts|mp4))$").expect("static regex"),
        }
    }

    /// Rewrite playlist content. `segment_url` receives a bare segment name
    /// and returns the URL the client should fetch it from.
    pub fn rewrite<F>(&self, content: &str, segment_url: F) -> String
    where
        F: Fn(&str) -> String,
    {
        let mut output = String::with_capacity(content.len() * 2);

        for line in content.lines() {
            let new_line = if line.starts_with('#') {
                if let Some(caps) = self.uri_regex.captures(line) {
                    let original = &caps[1];
                    line.replace(original, &segment_url(original))
                } else {
                    line.to_string()
                }
            } else if let Some(caps) = self.segment_regex.captures(line) {
                segment_url(&caps[1])
            } else {
                line.to_string()
            };

            output.push_str(&new_line);
            output.push('\n');
        }

        output
    }
}

impl Default for PlaylistRewriter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_fmp4_playlist() {
        let rewriter = PlaylistRewriter::new();
        let content = "#EXTM3U\n\
            #EXT-X-VERSION:7\n\
            #EXT-X-TARGETDURATION:4\n\
            #EXT-X-PLAYLIST-TYPE:EVENT\n\
            #EXT-X-MAP:URI=\"init.mp4\"\n\
            #EXTINF:4.000,\n\
            seg_00000.m4s\n\
            #EXTINF:4.000,\n\
            seg_00001.m4s\n";

        let result = rewriter.rewrite(content, |name| {
            format!("/api/stream/hls/show.mkv?session_id=s1&file={}", name)
        });

        assert!(result.contains("URI=\"/api/stream/hls/show.mkv?session_id=s1&file=init.mp4\""));
        assert!(result.contains("/api/stream/hls/show.mkv?session_id=s1&file=seg_00000.m4s"));
        assert!(result.contains("/api/stream/hls/show.mkv?session_id=s1&file=seg_00001.m4s"));
        assert!(result.contains("#EXT-X-PLAYLIST-TYPE:EVENT"));
    }

    #[test]
    fn test_rewrite_mpegts_playlist() {
        let rewriter = PlaylistRewriter::new();
        let content = "#EXTM3U\n#EXTINF:4.000,\nseg_00000.ts\n";
        let result = rewriter.rewrite(content, |name| format!("base&file={}", name));
        assert!(result.contains("base&file=seg_00000.ts"));
        assert!(!result.contains("\nseg_00000.ts\n"));
    }

    #[test]
    fn test_comments_and_blank_lines_untouched() {
        let rewriter = PlaylistRewriter::new();
        let content = "#EXTM3U\n\n#EXT-X-TARGETDURATION:4\n";
        let result = rewriter.rewrite(content, |name| format!("X{}", name));
        assert_eq!(result, "#EXTM3U\n\n#EXT-X-TARGETDURATION:4\n");
    }
}
