use regex::Regex;
use std::sync::OnceLock;

/// One subtitle cue: ordinal index, start/end in seconds, text with
/// formatting tags stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub index: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"<[^>]*>|\{\\[^}]*\}").expect("static regex"))
}

/// Strip inline formatting: VTT/HTML tags and ASS override blocks.
pub fn strip_tags(text: &str) -> String {
    tag_regex().replace_all(text, "").to_string()
}

/// Parse "hh:mm:ss.mmm" or "mm:ss.mmm" into seconds.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (h.parse::<f64>().ok()?, m.parse::<f64>().ok()?, parse_seconds(s)?),
        [m, s] => (0.0, m.parse::<f64>().ok()?, parse_seconds(s)?),
        _ => return None,
    };
    Some(h * 3600.0 + m * 60.0 + s)
}

fn parse_seconds(raw: &str) -> Option<f64> {
    raw.replace(',', ".").parse().ok()
}

pub fn format_timestamp(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    let h = (seconds / 3600.0) as u64;
    let m = ((seconds % 3600.0) / 60.0) as u64;
    let s = seconds % 60.0;
    format!("{:02}:{:02}:{:06.3}", h, m, s)
}

/// Parse WebVTT content into cues. Ignores NOTE/STYLE blocks and numeric
/// cue identifiers; indices are assigned by output order.
pub fn parse_vtt(content: &str) -> Vec<Cue> {
    let mut cues = Vec::new();
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        let line = line.trim_start_matches('\u{feff}').trim();

        let Some((start_raw, end_raw)) = line.split_once("-->") else {
            continue;
        };
        // The end half may carry cue settings ("align:center").
        let end_raw = end_raw.trim().split_whitespace().next().unwrap_or("");

        let (Some(start), Some(end)) = (parse_timestamp(start_raw), parse_timestamp(end_raw))
        else {
            continue;
        };

        let mut text_lines = Vec::new();
        while let Some(next) = lines.peek() {
            if next.trim().is_empty() {
                break;
            }
            text_lines.push(strip_tags(next.trim()));
            lines.next();
        }

        if text_lines.is_empty() {
            continue;
        }

        cues.push(Cue {
            index: cues.len(),
            start,
            end,
            text: text_lines.join("\n"),
        });
    }

    cues
}

/// Serialize cues back to WebVTT. The WEBVTT header is always present.
pub fn render_vtt(cues: &[Cue]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for cue in cues {
        out.push_str(&format!(
            "{} --> {}\n{}\n\n",
            format_timestamp(cue.start),
            format_timestamp(cue.end),
            cue.text
        ));
    }
    out
}

/// Guarantee the WEBVTT header on engine output that may lack it.
pub fn ensure_vtt_header(text: &str) -> String {
    let trimmed = text.trim_start_matches('\u{feff}');
    if trimmed.trim_start().starts_with("WEBVTT") {
        trimmed.to_string()
    } else {
        format!("WEBVTT\n\n{}", trimmed)
    }
}

/// Shift every timestamp by a fixed offset; used to stitch chunked
/// transcriptions back together.
pub fn offset_cues(cues: &mut [Cue], offset_secs: f64) {
    for cue in cues {
        cue.start += offset_secs;
        cue.end += offset_secs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "WEBVTT\n\nNOTE generated\n\n1\n00:00:01.000 --> 00:00:03.500\nHello <i>there</i>\n\n00:01:00.000 --> 00:01:02.000 align:center\nSecond line\nwraps here\n";

    #[test]
    fn test_parse_vtt() {
        let cues = parse_vtt(SAMPLE);
        assert_eq!(cues.len(), 2);

        assert_eq!(cues[0].index, 0);
        assert_eq!(cues[0].start, 1.0);
        assert_eq!(cues[0].end, 3.5);
        assert_eq!(cues[0].text, "Hello there");

        assert_eq!(cues[1].start, 60.0);
        assert_eq!(cues[1].text, "Second line\nwraps here");
    }

    #[test]
    fn test_parse_short_timestamps() {
        let cues = parse_vtt("WEBVTT\n\n01:02.500 --> 01:04.000\nshort form\n");
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].start, 62.5);
    }

    #[test]
    fn test_render_roundtrip() {
        let cues = parse_vtt(SAMPLE);
        let rendered = render_vtt(&cues);
        assert!(rendered.starts_with("WEBVTT\n"));

        let reparsed = parse_vtt(&rendered);
        assert_eq!(reparsed.len(), cues.len());
        assert_eq!(reparsed[0].text, cues[0].text);
        assert!((reparsed[1].end - cues[1].end).abs() < 0.001);
    }

    #[test]
    fn test_strip_ass_overrides() {
        assert_eq!(strip_tags(r"{\an8}Sign text"), "Sign text");
        assert_eq!(strip_tags("<b>bold</b> <v Roger>hi"), "bold hi");
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(3661.25), "01:01:01.250");
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_timestamp(-5.0), "00:00:00.000");
    }

    #[test]
    fn test_ensure_header() {
        assert!(ensure_vtt_header("00:00:01.000 --> 00:00:02.000\nhi\n").starts_with("WEBVTT"));
        let already = "WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nhi\n";
        assert_eq!(ensure_vtt_header(already), already);
    }

    #[test]
    fn test_offset_cues() {
        let mut cues = parse_vtt("WEBVTT\n\n00:00:01.000 --> 00:00:02.000\nhi\n");
        offset_cues(&mut cues, 600.0);
        assert_eq!(cues[0].start, 601.0);
        assert_eq!(cues[0].end, 602.0);
    }
}
